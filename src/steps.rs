use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::{error::ProviderError, models::{GenerationRequest, Step}, provider::TextProvider};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepsPayload {
    steps: Vec<String>,
}

pub fn steps_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"steps": {"type": "array", "items": {"type": "string"}}},
        "required": ["steps"]
    })
}

pub fn build_steps_prompt(request: &GenerationRequest) -> String {
    format!(
        "Create a step-by-step plan to solve a problem relating to {} using {}. \
        Write it so a {} can understand it. \
        Return ONLY JSON with a top-level object: {{\"steps\": string[]}}, no extra text. \
        Each string in the 'steps' array must start with its number label like \"Step 1.\", \"Step 2.\", etc.",
        request.topic, request.values, request.student_level
    )
}

/// Turns a generation request into an ordered list of steps via one provider call.
pub struct StepGenerator {
    text: Arc<dyn TextProvider>,
}

impl StepGenerator {
    pub fn new(text: Arc<dyn TextProvider>) -> Self { Self { text } }

    pub async fn generate_steps(&self, request: &GenerationRequest) -> Result<Vec<Step>, ProviderError> {
        let prompt = build_steps_prompt(request);
        info!("🧭 Generating steps for topic '{}' ({})", request.topic, request.student_level);

        let raw = self.text.generate_json(&prompt, &steps_schema()).await.map_err(|e| {
            error!("❌ Step generation call failed: {}", e);
            e
        })?;
        let steps = parse_steps(&raw)?;

        info!("✅ Generated {} steps", steps.len());
        Ok(steps)
    }
}

/// Strict parse: anything but `{"steps": [string, ...]}` with at least one entry is rejected.
pub fn parse_steps(raw: &str) -> Result<Vec<Step>, ProviderError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ProviderError::Parse(e.to_string()))?;
    let payload: StepsPayload = serde_json::from_value(value).map_err(|e| ProviderError::Schema(e.to_string()))?;
    if payload.steps.is_empty() {
        return Err(ProviderError::Schema("steps array is empty".into()));
    }
    Ok(payload
        .steps
        .into_iter()
        .zip(1u32..)
        .map(|(text, index)| Step { index, text })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    struct Scripted {
        reply: Result<String, String>,
        prompts: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl TextProvider for Scripted {
        async fn generate_json(&self, prompt: &str, schema: &Value) -> Result<String, ProviderError> {
            self.prompts.lock().push((prompt.to_string(), schema.clone()));
            self.reply.clone().map_err(ProviderError::Http)
        }
    }

    fn algebra() -> GenerationRequest {
        GenerationRequest {
            topic: "algebra".into(),
            values: "basic algebraic operations".into(),
            student_level: "high school student".into(),
        }
    }

    #[tokio::test]
    async fn indices_follow_array_position_not_labels() {
        let provider = Arc::new(Scripted {
            reply: Ok(r#"{"steps": ["Step 2. mislabeled", "Step 1. also mislabeled", "no label"]}"#.into()),
            prompts: Mutex::new(Vec::new()),
        });
        let steps = StepGenerator::new(provider.clone()).generate_steps(&algebra()).await.unwrap();
        assert_eq!(
            steps,
            vec![
                Step { index: 1, text: "Step 2. mislabeled".into() },
                Step { index: 2, text: "Step 1. also mislabeled".into() },
                Step { index: 3, text: "no label".into() },
            ]
        );

        let calls = provider.prompts.lock();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.contains("relating to algebra using basic algebraic operations"));
        assert!(calls[0].0.contains("a high school student can understand"));
        assert_eq!(calls[0].1, steps_schema());
    }

    #[test]
    fn malformed_output_is_a_hard_failure() {
        assert!(matches!(parse_steps("Step 1. do it"), Err(ProviderError::Parse(_))));
        assert!(matches!(parse_steps(r#"["Step 1."]"#), Err(ProviderError::Schema(_))));
        assert!(matches!(parse_steps(r#"{"steps": "Step 1."}"#), Err(ProviderError::Schema(_))));
        assert!(matches!(parse_steps(r#"{"steps": [1, 2]}"#), Err(ProviderError::Schema(_))));
        assert!(matches!(parse_steps(r#"{"items": ["Step 1."]}"#), Err(ProviderError::Schema(_))));
        assert!(matches!(parse_steps(r#"{"steps": []}"#), Err(ProviderError::Schema(_))));
    }

    #[test]
    fn indices_are_contiguous_from_one() {
        let raw = json!({"steps": (0..12).map(|i| format!("Step {}. x", i + 1)).collect::<Vec<_>>()}).to_string();
        let steps = parse_steps(&raw).unwrap();
        let indices: Vec<u32> = steps.iter().map(|s| s.index).collect();
        assert_eq!(indices, (1..=12).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn provider_errors_propagate() {
        let provider = Arc::new(Scripted { reply: Err("timeout".into()), prompts: Mutex::new(Vec::new()) });
        let err = StepGenerator::new(provider).generate_steps(&algebra()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Http(msg) if msg == "timeout"));
    }
}
