use std::{path::Path, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    config::SupabaseConfig,
    error::StoreError,
    images::BatchId,
    models::{LessonDraft, LessonSummary, StepRecord, UploadedImage, UserRecord},
    store::{batch_files, mime_for, LessonStore},
};

const LESSON_COLUMNS: &str = "lesson_id,created_at,lesson_name,lesson_descriptions,lesson_level";
const STEP_COLUMNS: &str = "lessons_id,step_number,step_description,image_path";

/// Lesson store backed by a Supabase project (PostgREST tables plus a storage bucket).
pub struct SupabaseStore {
    client: Client,
    url: String,
    service_role: String,
    bucket: String,
}

impl SupabaseStore {
    pub fn new(config: &SupabaseConfig, timeout: Duration) -> Result<Self, StoreError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: config.url.clone(),
            service_role: config.service_role.clone(),
            bucket: config.bucket.clone(),
        })
    }

    fn table(&self, method: reqwest::Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{}", self.url, table))
            .header("apikey", &self.service_role)
            .bearer_auth(&self.service_role)
    }

    pub fn public_url(&self, object: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.url, self.bucket, object)
    }

    fn step_row(&self, lesson_id: i64, step: &StepRecord) -> Value {
        json!({
            "lessons_id": lesson_id,
            "step_number": step.step_number,
            "step_description": step.step_description,
            "image_bucket": self.bucket,
            "image_path": step.image_ref,
        })
    }
}

async fn check(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    error!("❌ Supabase request failed with status {}: {}", status, body);
    Err(StoreError::Rejected(format!("status={} body={}", status, body)))
}

async fn rows<T: DeserializeOwned>(request: RequestBuilder) -> Result<Vec<T>, StoreError> {
    let response = check(request.send().await?).await?;
    response.json::<Vec<T>>().await.map_err(|e| StoreError::Request(format!("unexpected response shape: {e}")))
}

#[async_trait]
impl LessonStore for SupabaseStore {
    async fn verify_user(&self, email: &str, password: &str) -> Result<Option<UserRecord>, StoreError> {
        let users: Vec<UserRecord> = rows(self.table(reqwest::Method::GET, "users").query(&[
            ("select", "id,email,name,role".to_string()),
            ("email", format!("eq.{email}")),
            ("password", format!("eq.{password}")),
            ("limit", "1".to_string()),
        ]))
        .await?;
        Ok(users.into_iter().next())
    }

    async fn create_account(&self, email: &str, password: &str, name: &str, role: i32) -> Result<UserRecord, StoreError> {
        let existing: Vec<Value> = rows(self.table(reqwest::Method::GET, "users").query(&[
            ("select", "id".to_string()),
            ("email", format!("eq.{email}")),
            ("limit", "1".to_string()),
        ]))
        .await?;
        if !existing.is_empty() {
            return Err(StoreError::EmailTaken(email.to_string()));
        }

        let created: Vec<UserRecord> = rows(
            self.table(reqwest::Method::POST, "users")
                .header("Prefer", "return=representation")
                .query(&[("select", "id,email,name,role")])
                .json(&json!({"email": email, "password": password, "name": name, "role": role})),
        )
        .await?;
        let user = created.into_iter().next().ok_or_else(|| StoreError::Rejected("Failed to create user".into()))?;
        info!("👤 Created account {}", user.email);
        Ok(user)
    }

    async fn create_lesson_record(&self, name: &str, description: &str, level: &str) -> Result<i64, StoreError> {
        let created: Vec<LessonSummary> = rows(
            self.table(reqwest::Method::POST, "lessons")
                .header("Prefer", "return=representation")
                .query(&[("select", LESSON_COLUMNS)])
                .json(&json!({
                    "lesson_name": name,
                    "lesson_descriptions": description,
                    "lesson_level": level,
                })),
        )
        .await?;
        let lesson = created.into_iter().next().ok_or_else(|| StoreError::Rejected("Failed to create lesson".into()))?;
        info!("📚 Created lesson {} ({})", lesson.lesson_id, lesson.lesson_name);
        Ok(lesson.lesson_id)
    }

    async fn list_lessons(&self) -> Result<Vec<LessonSummary>, StoreError> {
        rows(self.table(reqwest::Method::GET, "lessons").query(&[("select", LESSON_COLUMNS), ("order", "created_at.desc")])).await
    }

    async fn get_lesson(&self, lesson_id: i64) -> Result<LessonSummary, StoreError> {
        let lessons: Vec<LessonSummary> = rows(self.table(reqwest::Method::GET, "lessons").query(&[
            ("select", LESSON_COLUMNS.to_string()),
            ("lesson_id", format!("eq.{lesson_id}")),
            ("limit", "1".to_string()),
        ]))
        .await?;
        lessons.into_iter().next().ok_or(StoreError::LessonNotFound(lesson_id))
    }

    async fn get_steps(&self, lesson_id: i64) -> Result<Vec<StepRecord>, StoreError> {
        rows(self.table(reqwest::Method::GET, "steps").query(&[
            ("select", STEP_COLUMNS.to_string()),
            ("lessons_id", format!("eq.{lesson_id}")),
            ("order", "step_number.asc".to_string()),
        ]))
        .await
    }

    async fn add_step(&self, lesson_id: i64, step: &StepRecord) -> Result<(), StoreError> {
        let request = self.table(reqwest::Method::POST, "steps").json(&self.step_row(lesson_id, step));
        check(request.send().await?).await?;
        Ok(())
    }

    async fn delete_lesson(&self, lesson_id: i64) -> Result<(), StoreError> {
        let steps = self.table(reqwest::Method::DELETE, "steps").query(&[("lessons_id", format!("eq.{lesson_id}"))]);
        check(steps.send().await?).await?;
        let deleted: Vec<Value> = rows(
            self.table(reqwest::Method::DELETE, "lessons")
                .header("Prefer", "return=representation")
                .query(&[("lesson_id", format!("eq.{lesson_id}")), ("select", "lesson_id".to_string())]),
        )
        .await?;
        if deleted.is_empty() {
            return Err(StoreError::LessonNotFound(lesson_id));
        }
        info!("🗑️ Deleted lesson {}", lesson_id);
        Ok(())
    }

    /// All step rows go out in one bulk insert, so a lesson never has only some of its steps.
    async fn save_lesson(&self, draft: &LessonDraft) -> Result<i64, StoreError> {
        let lesson_id = self.create_lesson_record(&draft.name, &draft.description, &draft.level).await?;
        let mut steps: Vec<&StepRecord> = draft.steps.iter().collect();
        steps.sort_by_key(|s| s.step_number);
        let payload: Vec<Value> = steps.into_iter().map(|step| self.step_row(lesson_id, step)).collect();

        let inserted: Result<(), StoreError> = match self.table(reqwest::Method::POST, "steps").json(&payload).send().await {
            Ok(response) => check(response).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = inserted {
            error!("❌ Failed to insert steps of lesson {}: {}", lesson_id, e);
            if let Err(cleanup) = self.delete_lesson(lesson_id).await {
                error!("❌ Failed to roll back lesson {}: {}", lesson_id, cleanup);
            }
            return Err(e);
        }
        info!("📚 Stored {} steps for lesson {}", payload.len(), lesson_id);
        Ok(lesson_id)
    }

    async fn upload_images(&self, dir: &Path, batch: &BatchId) -> Result<Vec<UploadedImage>, StoreError> {
        let mut uploaded = Vec::new();
        for path in batch_files(dir, batch).await? {
            let file = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            let ext = path.extension().map(|e| e.to_string_lossy().into_owned()).unwrap_or_else(|| "png".into());
            // Unique object name so re-uploads never clash in the bucket
            let object = format!("{}.{}", Uuid::new_v4(), ext);

            let bytes = tokio::fs::read(&path).await?;
            let request = self.client
                .post(format!("{}/storage/v1/object/{}/{}", self.url, self.bucket, object))
                .header("apikey", &self.service_role)
                .bearer_auth(&self.service_role)
                .header(reqwest::header::CONTENT_TYPE, mime_for(&path))
                .body(bytes);

            match request.send().await.map_err(StoreError::from) {
                Ok(response) => match check(response).await {
                    Ok(_) => {
                        let url = self.public_url(&object);
                        info!("✅ Uploaded {} → {}", file, url);
                        uploaded.push(UploadedImage { file, url });
                    }
                    Err(e) => error!("❌ Failed to upload {}: {}", file, e),
                },
                Err(e) => error!("❌ Failed to upload {}: {}", file, e),
            }
        }
        Ok(uploaded)
    }
}
