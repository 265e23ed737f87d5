use std::{path::PathBuf, time::Duration};

use crate::error::ConfigError;

pub const DEMO_KEY: &str = "DEMO_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageProviderKind {
    Gemini,
    OpenAi,
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub text_model: String,
    pub image_model: String,
}

impl GeminiConfig {
    pub fn is_demo(&self) -> bool { self.api_key == DEMO_KEY }
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub image_model: String,
}

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub service_role: String,
    pub bucket: String,
}

/// Knobs for the generation pipeline itself.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub images_per_step: u32,
    pub image_size: String,
    pub generated_dir: PathBuf,
    /// `None` means one task per step with no cap.
    pub max_concurrent_images: Option<usize>,
    pub emphasize_step_number: bool,
    pub refine_images: bool,
    pub refine_max_iterations: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            images_per_step: 1,
            image_size: "1024x1024".into(),
            generated_dir: PathBuf::from("generated_images"),
            max_concurrent_images: None,
            emphasize_step_number: true,
            refine_images: false,
            refine_max_iterations: crate::refine::MAX_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub gemini: GeminiConfig,
    pub image_provider: ImageProviderKind,
    pub openai: Option<OpenAiConfig>,
    pub supabase: Option<SupabaseConfig>,
    pub pipeline: PipelineConfig,
    pub provider_timeout: Duration,
    pub port: u16,
}

impl AppConfig {
    /// Reads the process environment. Call `dotenv::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let gemini = GeminiConfig {
            api_key: var("GEMINI_API_KEY").unwrap_or_else(|| DEMO_KEY.into()),
            base_url: var("GEMINI_API_BASE").unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".into()),
            text_model: var("GEMINI_TEXT_MODEL").unwrap_or_else(|| "gemini-2.5-flash".into()),
            image_model: var("GEMINI_IMAGE_MODEL").unwrap_or_else(|| "gemini-2.5-flash-image-preview".into()),
        };

        let image_provider = match var("IMAGE_PROVIDER").as_deref() {
            None | Some("gemini") => ImageProviderKind::Gemini,
            Some("openai") => ImageProviderKind::OpenAi,
            Some(other) => return Err(ConfigError::Invalid { key: "IMAGE_PROVIDER", message: format!("expected gemini or openai, got {other}") }),
        };

        let openai = var("OPENAI_API_KEY").map(|api_key| OpenAiConfig {
            api_key,
            base_url: var("OPENAI_API_BASE").unwrap_or_else(|| "https://api.openai.com/v1".into()),
            image_model: var("OPENAI_IMAGE_MODEL").unwrap_or_else(|| "gpt-image-1".into()),
        });
        if image_provider == ImageProviderKind::OpenAi && openai.is_none() {
            return Err(ConfigError::Missing("OPENAI_API_KEY", "IMAGE_PROVIDER=openai"));
        }

        let supabase = match (var("SUPABASE_URL"), var("SUPABASE_SERVICE_ROLE")) {
            (Some(url), Some(service_role)) => Some(SupabaseConfig {
                url: url.trim_end_matches('/').to_string(),
                service_role,
                bucket: var("SUPABASE_BUCKET").unwrap_or_else(|| "aiImages".into()),
            }),
            (Some(_), None) => return Err(ConfigError::Missing("SUPABASE_SERVICE_ROLE", "SUPABASE_URL is set")),
            _ => None,
        };

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            images_per_step: parse(&var, "IMAGES_PER_STEP")?.unwrap_or(defaults.images_per_step),
            image_size: var("IMAGE_SIZE").unwrap_or(defaults.image_size),
            generated_dir: var("GENERATED_DIR").map(PathBuf::from).unwrap_or(defaults.generated_dir),
            max_concurrent_images: parse(&var, "MAX_CONCURRENT_IMAGES")?,
            emphasize_step_number: parse_bool(&var, "EMPHASIZE_STEP_NUMBER")?.unwrap_or(defaults.emphasize_step_number),
            refine_images: parse_bool(&var, "REFINE_IMAGES")?.unwrap_or(defaults.refine_images),
            refine_max_iterations: parse(&var, "REFINE_MAX_ITERATIONS")?.unwrap_or(defaults.refine_max_iterations),
        };

        if pipeline.images_per_step == 0 {
            return Err(ConfigError::Invalid { key: "IMAGES_PER_STEP", message: "must be at least 1".into() });
        }
        if pipeline.max_concurrent_images == Some(0) {
            return Err(ConfigError::Invalid { key: "MAX_CONCURRENT_IMAGES", message: "must be at least 1".into() });
        }
        if pipeline.refine_max_iterations == 0 || pipeline.refine_max_iterations > crate::refine::MAX_ITERATIONS {
            return Err(ConfigError::Invalid {
                key: "REFINE_MAX_ITERATIONS",
                message: format!("must be between 1 and {}", crate::refine::MAX_ITERATIONS),
            });
        }
        if !is_resolution(&pipeline.image_size) {
            return Err(ConfigError::Invalid { key: "IMAGE_SIZE", message: format!("expected WIDTHxHEIGHT, got {}", pipeline.image_size) });
        }

        Ok(Self {
            gemini,
            image_provider,
            openai,
            supabase,
            pipeline,
            provider_timeout: Duration::from_secs(parse(&var, "PROVIDER_TIMEOUT_SECS")?.unwrap_or(120)),
            port: parse(&var, "PORT")?.unwrap_or(8080),
        })
    }
}

fn parse<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    var(key)
        .map(|raw| raw.parse::<T>().map_err(|e| ConfigError::Invalid { key, message: format!("{raw:?}: {e}") }))
        .transpose()
}

fn parse_bool(var: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<bool>, ConfigError> {
    match var(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        None => Ok(None),
        Some("1" | "true" | "yes" | "on") => Ok(Some(true)),
        Some("0" | "false" | "no" | "off") => Ok(Some(false)),
        Some(other) => Err(ConfigError::Invalid { key, message: format!("expected a boolean, got {other:?}") }),
    }
}

fn is_resolution(size: &str) -> bool {
    match size.split_once('x') {
        Some((w, h)) => w.parse::<u32>().is_ok_and(|w| w > 0) && h.parse::<u32>().is_ok_and(|h| h > 0),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn empty_environment_runs_in_demo_mode() {
        let config = config_from(&[]).unwrap();
        assert!(config.gemini.is_demo());
        assert_eq!(config.image_provider, ImageProviderKind::Gemini);
        assert!(config.supabase.is_none());
        assert_eq!(config.pipeline.images_per_step, 1);
        assert_eq!(config.pipeline.image_size, "1024x1024");
        assert_eq!(config.pipeline.max_concurrent_images, None);
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn reads_pipeline_overrides() {
        let config = config_from(&[
            ("GEMINI_API_KEY", "abc"),
            ("IMAGES_PER_STEP", "2"),
            ("MAX_CONCURRENT_IMAGES", "3"),
            ("REFINE_IMAGES", "true"),
            ("REFINE_MAX_ITERATIONS", "2"),
            ("EMPHASIZE_STEP_NUMBER", "off"),
            ("GENERATED_DIR", "/tmp/lessons"),
        ])
        .unwrap();
        assert!(!config.gemini.is_demo());
        assert_eq!(config.pipeline.images_per_step, 2);
        assert_eq!(config.pipeline.max_concurrent_images, Some(3));
        assert!(config.pipeline.refine_images);
        assert_eq!(config.pipeline.refine_max_iterations, 2);
        assert!(!config.pipeline.emphasize_step_number);
        assert_eq!(config.pipeline.generated_dir, PathBuf::from("/tmp/lessons"));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(config_from(&[("IMAGES_PER_STEP", "0")]), Err(ConfigError::Invalid { key: "IMAGES_PER_STEP", .. })));
        assert!(matches!(config_from(&[("PORT", "http")]), Err(ConfigError::Invalid { key: "PORT", .. })));
        assert!(matches!(config_from(&[("IMAGE_SIZE", "large")]), Err(ConfigError::Invalid { key: "IMAGE_SIZE", .. })));
        assert!(matches!(config_from(&[("REFINE_MAX_ITERATIONS", "9")]), Err(ConfigError::Invalid { .. })));
        assert!(matches!(config_from(&[("IMAGE_PROVIDER", "openai")]), Err(ConfigError::Missing("OPENAI_API_KEY", _))));
        assert!(matches!(config_from(&[("SUPABASE_URL", "https://x.supabase.co")]), Err(ConfigError::Missing(..))));
    }

    #[test]
    fn supabase_requires_url_and_service_role() {
        let config = config_from(&[("SUPABASE_URL", "https://x.supabase.co/"), ("SUPABASE_SERVICE_ROLE", "secret")]).unwrap();
        let supabase = config.supabase.unwrap();
        assert_eq!(supabase.url, "https://x.supabase.co");
        assert_eq!(supabase.bucket, "aiImages");
    }
}
