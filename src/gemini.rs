use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, error};

use crate::{
    config::{GeminiConfig, DEMO_KEY},
    error::ProviderError,
    models::RenderedImage,
    provider::{ImageCritic, ImageProvider, TextProvider},
    refine::COMPLETION_PHRASE,
};

// Helper function to truncate base64 data in JSON for cleaner logging
pub(crate) fn truncate_base64_in_json(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if key == "data" || key == "b64_json" {
                    if let Value::String(s) = val {
                        if s.len() > 100 && s.chars().all(|c| c.is_alphanumeric() || c == '+' || c == '/' || c == '=') {
                            let head: String = s.chars().take(50).collect();
                            let rest = s.chars().count().saturating_sub(50);
                            *val = Value::String(format!("{}...[truncated {} chars]", head, rest));
                        }
                    }
                } else {
                    truncate_base64_in_json(val);
                }
            }
        }
        Value::Array(arr) => {
            for val in arr.iter_mut() {
                truncate_base64_in_json(val);
            }
        }
        _ => {}
    }
}

pub(crate) fn preview(data: &str) -> String {
    match data.char_indices().nth(50) {
        Some((cut, _)) => format!("{}...[{} chars total]", &data[..cut], data.chars().count()),
        None => data.to_string(),
    }
}

pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    text_model: String,
    image_model: String,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            text_model: config.text_model.clone(),
            image_model: config.image_model.clone(),
        })
    }

    fn is_demo(&self) -> bool { self.api_key == DEMO_KEY }

    async fn perform_api_call(&self, model: &str, request_body: &Value) -> Result<GeminiResponse, ProviderError> {
        let url = format!("{}/models/{}:generateContent?key={}", self.base_url, model, self.api_key);

        info!("🔗 Making request to: {}", url.replace(&self.api_key, "***"));

        let mut logged_body = request_body.clone();
        truncate_base64_in_json(&mut logged_body);
        info!("📤 Request body: {}", serde_json::to_string_pretty(&logged_body).unwrap_or_default());

        let response = self.client
            .post(&url)
            .json(request_body)
            .send()
            .await?;

        let status = response.status();
        info!("📥 Response status: {}", status);

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!("❌ API Error response: {}", error_body);
            return Err(ProviderError::Status { status: status.as_u16(), body: error_body });
        }

        let response_text = response.text().await?;

        // Truncate base64 image data for cleaner logging
        let truncated_response = if response_text.len() > 1000 {
            if let Ok(mut json_value) = serde_json::from_str::<Value>(&response_text) {
                truncate_base64_in_json(&mut json_value);
                serde_json::to_string_pretty(&json_value).unwrap_or_else(|_| preview(&response_text))
            } else {
                preview(&response_text)
            }
        } else {
            response_text.clone()
        };
        info!("📥 Raw Gemini API response: {}", truncated_response);

        serde_json::from_str(&response_text)
            .map_err(|e| ProviderError::Parse(format!("{}: {}", e, preview(&response_text))))
    }

    async fn generate_one_image(&self, prompt: &str, size: &str) -> Result<RenderedImage, ProviderError> {
        let request_body = json!({
            "contents": [{
                "parts": [{"text": format!("{prompt}\nRender at {size}.")}]
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
                "temperature": 0.4,
                "topP": 0.95,
                "topK": 64,
                "candidateCount": 1
            }
        });

        let parsed = self.perform_api_call(&self.image_model, &request_body).await?;
        let inline = extract_first_image(&parsed).ok_or(ProviderError::MissingImage)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(inline.data.as_bytes())
            .map_err(|e| ProviderError::Parse(format!("invalid base64 image data: {e}")))?;
        info!("🖼️ Extracted {} image from API response: {}", inline.mime_type, preview(&inline.data));
        Ok(RenderedImage::Inline { bytes: Bytes::from(bytes), mime_type: inline.mime_type.clone() })
    }

    fn generate_placeholder_image(&self, prompt: &str) -> RenderedImage {
        // Simple SVG card so demo mode still produces viewable lessons
        let colors = ["#3B82F6", "#EF4444", "#10B981", "#F59E0B", "#8B5CF6"];
        let color = colors[prompt.len() % colors.len()];
        let title = escape_xml(&truncate_chars(prompt.lines().next().unwrap_or_default(), 48));

        let svg = format!(r#"<svg width="400" height="300" xmlns="http://www.w3.org/2000/svg">
            <defs>
                <linearGradient id="grad" x1="0%" y1="0%" x2="100%" y2="100%">
                    <stop offset="0%" style="stop-color:{color};stop-opacity:1" />
                    <stop offset="100%" style="stop-color:{color};stop-opacity:0.6" />
                </linearGradient>
            </defs>
            <rect width="400" height="300" fill="url(#grad)" />
            <text x="200" y="150" font-family="Arial, sans-serif" font-size="14" font-weight="bold"
                  text-anchor="middle" fill="white">
                {title}
            </text>
            <text x="200" y="200" font-family="Arial, sans-serif" font-size="12"
                  text-anchor="middle" fill="white" opacity="0.8">
                Lesson step illustration
            </text>
        </svg>"#);

        RenderedImage::Inline { bytes: Bytes::from(svg.into_bytes()), mime_type: "image/svg+xml".into() }
    }
}

#[async_trait]
impl TextProvider for GeminiClient {
    async fn generate_json(&self, prompt: &str, schema: &Value) -> Result<String, ProviderError> {
        if self.is_demo() {
            info!("Using demo mode - returning canned steps");
            return Ok(demo_steps_json(prompt));
        }

        info!("Generating structured text with Gemini API...");
        let request_body = json!({
            "contents": [{
                "parts": [{"text": prompt}]
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": schema,
                "temperature": 0.7,
                "topK": 40,
                "topP": 0.95
            }
        });

        let parsed = self.perform_api_call(&self.text_model, &request_body).await?;
        first_text(&parsed).ok_or_else(|| ProviderError::Other("No text content found in response".to_string()))
    }
}

#[async_trait]
impl ImageProvider for GeminiClient {
    async fn render(&self, prompt: &str, count: u32, size: &str) -> Result<Vec<RenderedImage>, ProviderError> {
        if self.is_demo() {
            info!("Using demo mode - no real images generated");
            return Ok((0..count).map(|_| self.generate_placeholder_image(prompt)).collect());
        }

        // The image model returns one image per call
        info!("Generating {} image(s) with Gemini API...", count);
        let mut images = Vec::with_capacity(count as usize);
        for _ in 0..count {
            images.push(self.generate_one_image(prompt, size).await?);
        }
        Ok(images)
    }
}

#[async_trait]
impl ImageCritic for GeminiClient {
    async fn critique(&self, image: &RenderedImage, instructions: &str) -> Result<String, ProviderError> {
        if self.is_demo() {
            return Ok(COMPLETION_PHRASE.to_string());
        }

        let image_part = match image {
            RenderedImage::Inline { bytes, mime_type } => json!({
                "inlineData": {
                    "mimeType": mime_type,
                    "data": base64::engine::general_purpose::STANDARD.encode(bytes)
                }
            }),
            RenderedImage::Remote { url } => json!({"text": format!("Image to review: {url}")}),
        };
        let request_body = json!({
            "contents": [{
                "parts": [image_part, {"text": instructions}]
            }],
            "generationConfig": {
                "temperature": 0.2,
                "maxOutputTokens": 300
            }
        });

        let parsed = self.perform_api_call(&self.text_model, &request_body).await?;
        first_text(&parsed).ok_or_else(|| ProviderError::Other("No critique text found in response".to_string()))
    }
}

fn demo_steps_json(prompt: &str) -> String {
    let subject = prompt
        .split_once("relating to ")
        .and_then(|(_, rest)| rest.split_once(" using "))
        .map(|(topic, _)| topic.to_string())
        .unwrap_or_else(|| "the topic".to_string());
    json!({
        "steps": [
            format!("Step 1. Read the {subject} problem carefully and list what is given."),
            format!("Step 2. Decide which {subject} rule applies to the given values."),
            "Step 3. Apply the rule one operation at a time, writing each result down.".to_string(),
            "Step 4. Check the answer by substituting it back into the original problem.".to_string(),
        ]
    })
    .to_string()
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max { s.to_string() } else { format!("{}…", s.chars().take(max).collect::<String>()) }
}

// --- Response Parsing Helpers ---

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate { #[serde(default)] content: Content }

#[derive(Debug, Deserialize, Default)]
struct Content { #[serde(default)] parts: Vec<Part> }

#[derive(Debug, Deserialize)]
#[serde(untagged)]
#[allow(dead_code)]
enum Part {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData
    },
    Text { text: String },
    Other(Value)
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
}

fn extract_first_image(resp: &GeminiResponse) -> Option<&InlineData> {
    for c in &resp.candidates {
        for p in &c.content.parts {
            if let Part::Inline { inline_data } = p {
                info!("🎯 Found image data with mime type: {}", inline_data.mime_type);
                return Some(inline_data);
            }
        }
    }
    info!("⚠️ No inline image data found in response structure");
    None
}

fn first_text(resp: &GeminiResponse) -> Option<String> {
    resp.candidates
        .iter()
        .flat_map(|c| c.content.parts.iter())
        .find_map(|p| match p {
            Part::Text { text } => Some(text.trim().to_string()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn demo_client() -> GeminiClient {
        let config = GeminiConfig {
            api_key: DEMO_KEY.into(),
            base_url: "http://localhost".into(),
            text_model: "text".into(),
            image_model: "image".into(),
        };
        GeminiClient::new(&config, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn parses_inline_image_and_text_parts() {
        let raw = json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "  here you go  "},
                    {"inlineData": {"mimeType": "image/png", "data": "aGVsbG8="}}
                ]}
            }]
        });
        let parsed: GeminiResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(first_text(&parsed).as_deref(), Some("here you go"));
        let image = extract_first_image(&parsed).unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.data, "aGVsbG8=");
    }

    #[test]
    fn truncates_long_base64_for_logging() {
        let long = "A".repeat(200);
        let mut value = json!({"parts": [{"inlineData": {"data": long}}]});
        truncate_base64_in_json(&mut value);
        let data = value["parts"][0]["inlineData"]["data"].as_str().unwrap();
        assert!(data.ends_with("[truncated 150 chars]"));
    }

    #[test]
    fn truncation_respects_multibyte_characters() {
        let mut value = json!({"data": "é".repeat(120)});
        truncate_base64_in_json(&mut value);
        let data = value["data"].as_str().unwrap();
        assert!(data.starts_with(&"é".repeat(50)));
        assert!(data.ends_with("[truncated 70 chars]"));
        assert_eq!(preview(&"ü".repeat(60)), format!("{}...[60 chars total]", "ü".repeat(50)));
    }

    #[tokio::test]
    async fn demo_mode_returns_schema_shaped_steps() {
        let client = demo_client();
        let raw = client
            .generate_json("Create a step-by-step plan to solve a problem relating to algebra using basic operations.", &json!({}))
            .await
            .unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        let steps = value["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 4);
        assert!(steps[0].as_str().unwrap().starts_with("Step 1. Read the algebra problem"));
    }

    #[tokio::test]
    async fn demo_mode_renders_escaped_svg_placeholders() {
        let client = demo_client();
        let images = client.render("Step 1. Compare 3 < 5 & 5 > 3", 2, "1024x1024").await.unwrap();
        assert_eq!(images.len(), 2);
        match &images[0] {
            RenderedImage::Inline { bytes, mime_type } => {
                assert_eq!(mime_type, "image/svg+xml");
                let svg = std::str::from_utf8(bytes).unwrap();
                assert!(svg.contains("3 &lt; 5 &amp; 5 &gt; 3"));
            }
            other => panic!("unexpected rendering {other:?}"),
        }
    }
}
