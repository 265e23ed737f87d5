use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::{config::OpenAiConfig, error::ProviderError, gemini::preview, models::RenderedImage, provider::ImageProvider};

/// Client for the OpenAI Images API (`gpt-image-1` by default).
pub struct OpenAiImageClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiImageClient {
    pub fn new(config: &OpenAiConfig, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.image_model.clone(),
        })
    }
}

#[async_trait]
impl ImageProvider for OpenAiImageClient {
    async fn render(&self, prompt: &str, count: u32, size: &str) -> Result<Vec<RenderedImage>, ProviderError> {
        let url = format!("{}/images/generations", self.base_url);
        info!("🔗 Requesting {} image(s) from {} ({})", count, url, self.model);

        let response = self.client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "n": count,
                "size": size,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("❌ OpenAI image request failed with status {}: {}", status, body);
            return Err(ProviderError::Status { status: status.as_u16(), body });
        }

        let text = response.text().await?;
        let parsed: ImagesResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Parse(format!("{}: {}", e, preview(&text))))?;
        decode_images(parsed)
    }
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

fn decode_images(response: ImagesResponse) -> Result<Vec<RenderedImage>, ProviderError> {
    if response.data.is_empty() {
        return Err(ProviderError::MissingImage);
    }
    response
        .data
        .into_iter()
        .map(|datum| match (datum.b64_json, datum.url) {
            (Some(b64), _) => base64::engine::general_purpose::STANDARD
                .decode(b64.as_bytes())
                .map(|bytes| RenderedImage::Inline { bytes: Bytes::from(bytes), mime_type: "image/png".into() })
                .map_err(|e| ProviderError::Parse(format!("invalid base64 image data: {e}"))),
            (None, Some(url)) => Ok(RenderedImage::Remote { url }),
            (None, None) => Err(ProviderError::MissingImage),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_inline_and_url_results() {
        let parsed: ImagesResponse = serde_json::from_value(json!({
            "data": [
                {"b64_json": "aGVsbG8="},
                {"url": "https://cdn.example.com/a.png"}
            ]
        }))
        .unwrap();
        let images = decode_images(parsed).unwrap();
        assert_eq!(images[0], RenderedImage::Inline { bytes: Bytes::from_static(b"hello"), mime_type: "image/png".into() });
        assert_eq!(images[1], RenderedImage::Remote { url: "https://cdn.example.com/a.png".into() });
    }

    #[test]
    fn empty_or_malformed_results_are_errors() {
        let empty: ImagesResponse = serde_json::from_value(json!({"data": []})).unwrap();
        assert!(matches!(decode_images(empty), Err(ProviderError::MissingImage)));

        let bad: ImagesResponse = serde_json::from_value(json!({"data": [{"b64_json": "%%%"}]})).unwrap();
        assert!(matches!(decode_images(bad), Err(ProviderError::Parse(_))));
    }
}
