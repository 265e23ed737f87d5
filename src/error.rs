use thiserror::Error;

/// Failure talking to a text or image generation provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")] Http(String),
    #[error("provider returned status {status}: {body}")] Status { status: u16, body: String },
    #[error("parse error: {0}")] Parse(String),
    #[error("response does not match schema: {0}")] Schema(String),
    #[error("no image data in response")] MissingImage,
    #[error("Other: {0}")] Other(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self { ProviderError::Http(e.to_string()) }
}

/// Failure of one image job; never escapes its own step slot.
#[derive(Debug, Error)]
pub enum ImageJobError {
    #[error(transparent)] Provider(#[from] ProviderError),
    #[error("failed to write image: {0}")] Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")] Request(String),
    #[error("store rejected write: {0}")] Rejected(String),
    #[error("lesson {0} not found")] LessonNotFound(i64),
    #[error("email already registered: {0}")] EmailTaken(String),
    #[error("io error: {0}")] Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self { StoreError::Request(e.to_string()) }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("{0} is required when {1}")]
    Missing(&'static str, &'static str),
}

/// Pipeline failure tagged with the phase that failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("step generation failed: {0}")]
    Steps(#[source] ProviderError),
    #[error("image upload failed: {0}")]
    Images(#[source] StoreError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

impl PipelineError {
    pub fn phase(&self) -> &'static str {
        match self {
            PipelineError::Steps(_) => "steps",
            PipelineError::Images(_) => "images",
            PipelineError::Persistence(_) => "persistence",
        }
    }
}
