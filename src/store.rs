use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    error::StoreError,
    images::BatchId,
    models::{LessonDraft, LessonSummary, StepRecord, UploadedImage, UserRecord},
};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg"];

/// Persistence for lessons, their steps and the images they reference.
#[async_trait]
pub trait LessonStore: Send + Sync {
    async fn verify_user(&self, email: &str, password: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Registers a user; an email that is already taken is [`StoreError::EmailTaken`].
    async fn create_account(&self, email: &str, password: &str, name: &str, role: i32) -> Result<UserRecord, StoreError>;

    async fn create_lesson_record(&self, name: &str, description: &str, level: &str) -> Result<i64, StoreError>;

    /// Newest first.
    async fn list_lessons(&self) -> Result<Vec<LessonSummary>, StoreError>;

    async fn get_lesson(&self, lesson_id: i64) -> Result<LessonSummary, StoreError>;

    /// Ordered by step number.
    async fn get_steps(&self, lesson_id: i64) -> Result<Vec<StepRecord>, StoreError>;

    async fn add_step(&self, lesson_id: i64, step: &StepRecord) -> Result<(), StoreError>;

    async fn delete_lesson(&self, lesson_id: i64) -> Result<(), StoreError>;

    /// Uploads the files of one batch from `dir` and returns their public URLs.
    async fn upload_images(&self, dir: &Path, batch: &BatchId) -> Result<Vec<UploadedImage>, StoreError>;

    /// Removes the batch's files from the scratch directory, returning how many were deleted.
    async fn clear_local_images(&self, dir: &Path, batch: &BatchId) -> Result<usize, StoreError> {
        let files = batch_files(dir, batch).await?;
        let mut removed = 0;
        for path in files {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => error!("❌ Failed to delete {}: {}", path.display(), e),
            }
        }
        info!("✅ Cleared {} generated image(s) for batch {}", removed, batch);
        Ok(removed)
    }

    /// Writes the header, then every step row. A failed step insert removes the
    /// header again so no partial lesson is left behind.
    async fn save_lesson(&self, draft: &LessonDraft) -> Result<i64, StoreError> {
        let lesson_id = self.create_lesson_record(&draft.name, &draft.description, &draft.level).await?;
        for step in &draft.steps {
            if let Err(e) = self.add_step(lesson_id, step).await {
                error!("❌ Failed to insert step {} of lesson {}: {}", step.step_number, lesson_id, e);
                if let Err(cleanup) = self.delete_lesson(lesson_id).await {
                    error!("❌ Failed to roll back lesson {}: {}", lesson_id, cleanup);
                }
                return Err(e);
            }
        }
        Ok(lesson_id)
    }
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Image files in `dir` written by `batch`, sorted by name (and therefore by step).
pub async fn batch_files(dir: &Path, batch: &BatchId) -> Result<Vec<PathBuf>, StoreError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("⚠️ Directory not found: {}", dir.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let in_batch = path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.contains(batch.as_str()));
        if in_batch && is_image_file(&path) && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        _ => "image/png",
    }
}

pub fn role_name(role: i32) -> &'static str {
    match role {
        1 => "teacher",
        _ => "student",
    }
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    lessons: BTreeMap<i64, (LessonSummary, Vec<StepRecord>)>,
    users: Vec<(UserRecord, String)>,
    objects: HashMap<String, Bytes>,
}

/// Process-local store used when no Supabase project is configured.
pub struct MemoryStore {
    bucket: String,
    inner: RwLock<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new("aiImages") }
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self { bucket: bucket.into(), inner: RwLock::new(MemoryInner { next_id: 1, ..Default::default() }) }
    }

    pub fn with_user(self, email: &str, password: &str, role: i32) -> Self {
        {
            let mut inner = self.inner.write();
            let id = Uuid::new_v4().to_string();
            inner.users.push((UserRecord { id, email: email.into(), name: None, role }, password.into()));
        }
        self
    }

    pub fn object(&self, name: &str) -> Option<Bytes> {
        self.inner.read().objects.get(name).cloned()
    }

    fn summary(&self, id: i64, name: &str, description: &str, level: &str) -> LessonSummary {
        LessonSummary {
            lesson_id: id,
            created_at: Utc::now(),
            lesson_name: name.into(),
            lesson_description: description.into(),
            lesson_level: level.into(),
        }
    }
}

#[async_trait]
impl LessonStore for MemoryStore {
    async fn verify_user(&self, email: &str, password: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .users
            .iter()
            .find(|(user, pw)| user.email == email && pw == password)
            .map(|(user, _)| user.clone()))
    }

    async fn create_account(&self, email: &str, password: &str, name: &str, role: i32) -> Result<UserRecord, StoreError> {
        let mut inner = self.inner.write();
        if inner.users.iter().any(|(user, _)| user.email == email) {
            return Err(StoreError::EmailTaken(email.to_string()));
        }
        let user = UserRecord { id: Uuid::new_v4().to_string(), email: email.into(), name: Some(name.into()), role };
        inner.users.push((user.clone(), password.into()));
        Ok(user)
    }

    async fn create_lesson_record(&self, name: &str, description: &str, level: &str) -> Result<i64, StoreError> {
        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;
        let summary = self.summary(id, name, description, level);
        inner.lessons.insert(id, (summary, Vec::new()));
        Ok(id)
    }

    async fn list_lessons(&self) -> Result<Vec<LessonSummary>, StoreError> {
        let mut lessons: Vec<LessonSummary> = self.inner.read().lessons.values().map(|(l, _)| l.clone()).collect();
        lessons.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.lesson_id.cmp(&a.lesson_id)));
        Ok(lessons)
    }

    async fn get_lesson(&self, lesson_id: i64) -> Result<LessonSummary, StoreError> {
        self.inner.read().lessons.get(&lesson_id).map(|(l, _)| l.clone()).ok_or(StoreError::LessonNotFound(lesson_id))
    }

    async fn get_steps(&self, lesson_id: i64) -> Result<Vec<StepRecord>, StoreError> {
        let inner = self.inner.read();
        let (_, steps) = inner.lessons.get(&lesson_id).ok_or(StoreError::LessonNotFound(lesson_id))?;
        let mut steps = steps.clone();
        steps.sort_by_key(|s| s.step_number);
        Ok(steps)
    }

    async fn add_step(&self, lesson_id: i64, step: &StepRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let (_, steps) = inner.lessons.get_mut(&lesson_id).ok_or(StoreError::LessonNotFound(lesson_id))?;
        if steps.iter().any(|s| s.step_number == step.step_number) {
            return Err(StoreError::Rejected(format!("step {} already exists for lesson {}", step.step_number, lesson_id)));
        }
        steps.push(step.clone());
        Ok(())
    }

    async fn delete_lesson(&self, lesson_id: i64) -> Result<(), StoreError> {
        self.inner.write().lessons.remove(&lesson_id).map(|_| ()).ok_or(StoreError::LessonNotFound(lesson_id))
    }

    async fn upload_images(&self, dir: &Path, batch: &BatchId) -> Result<Vec<UploadedImage>, StoreError> {
        let mut uploaded = Vec::new();
        for path in batch_files(dir, batch).await? {
            let bytes = Bytes::from(tokio::fs::read(&path).await?);
            let file = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            let ext = path.extension().map(|e| e.to_string_lossy().into_owned()).unwrap_or_else(|| "png".into());
            let object = format!("{}.{}", Uuid::new_v4(), ext);
            self.inner.write().objects.insert(object.clone(), bytes);
            uploaded.push(UploadedImage { file, url: format!("memory://{}/{}", self.bucket, object) });
        }
        Ok(uploaded)
    }

    /// Header and steps become visible under a single write lock.
    async fn save_lesson(&self, draft: &LessonDraft) -> Result<i64, StoreError> {
        let mut steps = draft.steps.clone();
        steps.sort_by_key(|s| s.step_number);
        if steps.windows(2).any(|w| w[0].step_number == w[1].step_number) {
            return Err(StoreError::Rejected("duplicate step numbers".into()));
        }
        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;
        let summary = self.summary(id, &draft.name, &draft.description, &draft.level);
        inner.lessons.insert(id, (summary, steps));
        Ok(id)
    }
}
