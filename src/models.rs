use serde::{Deserialize, Deserializer, Serialize};
use chrono::{DateTime, Utc};
use bytes::Bytes;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub topic: String,
    pub values: String,
    pub student_level: String,
}

/// One tutorial step. `index` is 1-based and is the only ordering key.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Step {
    pub index: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageJob {
    pub step_index: u32,
    pub prompt: String,
    pub requested_count: u32,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct ImageResult {
    pub step_index: u32,
    pub paths: Vec<String>,
}

/// A single rendering as returned by an image provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedImage {
    Inline { bytes: Bytes, mime_type: String },
    Remote { url: String },
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageOutcome {
    Rendered(ImageResult),
    Placeholder { reason: String },
}

impl ImageOutcome {
    /// Reference stored for the step; `None` is the placeholder.
    pub fn primary_ref(&self) -> Option<&str> {
        match self {
            ImageOutcome::Rendered(result) => result.paths.first().map(String::as_str),
            ImageOutcome::Placeholder { .. } => None,
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct StepImage {
    pub step: Step,
    pub image: ImageOutcome,
}

/// Lesson ready to be written: header plus step rows sorted by step number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonDraft {
    pub name: String,
    pub description: String,
    pub level: String,
    pub steps: Vec<StepRecord>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LessonSummary {
    pub lesson_id: i64,
    pub created_at: DateTime<Utc>,
    pub lesson_name: String,
    #[serde(rename = "lesson_descriptions")]
    pub lesson_description: String,
    pub lesson_level: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step_number: u32,
    pub step_description: String,
    #[serde(rename = "image_path")]
    pub image_ref: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserRecord {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub role: i32,
}

// users.id may be a bigint or a uuid depending on how the table was created
fn id_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id { Text(String), Number(i64) }
    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

/// Local file pushed to the storage bucket.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    pub file: String,
    pub url: String,
}

// --- HTTP envelopes ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoginResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CreateAccountRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub name: String,
    /// 1 for teachers, anything else is a student.
    #[serde(default)]
    pub role: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CreateAccountResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CreateLessonRequest {
    pub title: String,
    pub topic: String,
    pub level: String,
    #[serde(default)]
    pub description: String,
}

impl CreateLessonRequest {
    pub fn generation_request(&self) -> GenerationRequest {
        GenerationRequest {
            topic: self.topic.clone(),
            values: self.description.clone(),
            student_level: self.level.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CreateLessonResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesson_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LessonsResponse {
    pub lessons: Vec<LessonSummary>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StepsResponse {
    pub lesson_id: i64,
    pub steps: Vec<StepRecord>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeleteResponse {
    pub success: bool,
}
