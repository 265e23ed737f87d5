//! Provider seams. The pipeline only sees these traits, so the concrete
//! clients (Gemini, OpenAI, demo) are picked once at startup from config.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    config::{AppConfig, ImageProviderKind},
    error::ProviderError,
    gemini::GeminiClient,
    models::RenderedImage,
    openai::OpenAiImageClient,
};

/// Text generation constrained to a declared JSON schema.
#[async_trait]
pub trait TextProvider: Send + Sync {
    /// Returns the raw JSON text produced for `prompt`.
    async fn generate_json(&self, prompt: &str, schema: &Value) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Renders `count` images for `prompt` at `size` (`WIDTHxHEIGHT`).
    async fn render(&self, prompt: &str, count: u32, size: &str) -> Result<Vec<RenderedImage>, ProviderError>;
}

/// Reviews an image against the subject it should depict.
#[async_trait]
pub trait ImageCritic: Send + Sync {
    async fn critique(&self, image: &RenderedImage, instructions: &str) -> Result<String, ProviderError>;
}

/// The concrete providers wired up for one process.
#[derive(Clone)]
pub struct Providers {
    pub text: Arc<dyn TextProvider>,
    pub images: Arc<dyn ImageProvider>,
    pub critic: Arc<dyn ImageCritic>,
}

impl Providers {
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let gemini = Arc::new(GeminiClient::new(&config.gemini, config.provider_timeout)?);
        let images: Arc<dyn ImageProvider> = match (config.image_provider, &config.openai) {
            (ImageProviderKind::OpenAi, Some(openai)) => Arc::new(OpenAiImageClient::new(openai, config.provider_timeout)?),
            (ImageProviderKind::OpenAi, None) => return Err(ProviderError::Other("OpenAI image provider selected without an API key".into())),
            (ImageProviderKind::Gemini, _) => gemini.clone(),
        };
        Ok(Self { text: gemini.clone(), images, critic: gemini })
    }
}
