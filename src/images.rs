use std::{fmt, path::{Path, PathBuf}, sync::Arc};

use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    error::{ImageJobError, ProviderError},
    models::{ImageJob, ImageResult, RenderedImage},
    provider::ImageProvider,
    refine::RefinementLoop,
};

/// Identifies one pipeline run; embedded in every file the run writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchId(String);

impl BatchId {
    pub fn new() -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S%3f"), &nonce[..8]))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl Default for BatchId {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// `step_007_01_<batch>.png`: zero-padded so a directory listing sorts by step.
pub fn image_filename(step_index: u32, ordinal: usize, batch: &BatchId, extension: &str) -> String {
    format!("step_{:03}_{:02}_{}.{}", step_index, ordinal, batch, extension)
}

pub fn extension_for(bytes: &[u8], mime_type: &str) -> &'static str {
    if let Ok(format) = image::guess_format(bytes) {
        if let Some(ext) = format.extensions_str().first().copied() {
            return ext;
        }
    }
    match mime_type {
        "image/svg+xml" => "svg",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

/// Renders images for one prompt at a time and writes them into the scratch directory.
pub struct ImageGenerator {
    provider: Arc<dyn ImageProvider>,
    refiner: Option<RefinementLoop>,
    output_dir: PathBuf,
    size: String,
}

impl ImageGenerator {
    pub fn new(provider: Arc<dyn ImageProvider>, output_dir: impl Into<PathBuf>, size: impl Into<String>) -> Self {
        Self { provider, refiner: None, output_dir: output_dir.into(), size: size.into() }
    }

    pub fn with_refinement(mut self, refiner: RefinementLoop) -> Self {
        self.refiner = Some(refiner);
        self
    }

    pub fn output_dir(&self) -> &Path { &self.output_dir }

    /// One job: one provider call for `requested_count` renderings, each optionally refined, then written.
    pub async fn run_job(&self, batch: &BatchId, job: &ImageJob) -> Result<ImageResult, ImageJobError> {
        info!("🎨 Rendering {} image(s) for step {}", job.requested_count, job.step_index);
        let renders = self.provider.render(&job.prompt, job.requested_count, &self.size).await?;
        if renders.is_empty() {
            return Err(ProviderError::MissingImage.into());
        }

        let mut paths = Vec::with_capacity(renders.len());
        for (n, rendered) in renders.into_iter().enumerate() {
            let rendered = match &self.refiner {
                Some(refiner) => refiner.run(&job.prompt, Some(rendered)).await?.image,
                None => rendered,
            };
            paths.push(self.persist(batch, job.step_index, n + 1, rendered).await?);
        }

        info!("✅ Step {} produced {} image(s)", job.step_index, paths.len());
        Ok(ImageResult { step_index: job.step_index, paths })
    }

    /// Batch form: prompt `i` is treated as step `i + 1`. A failing prompt does not affect the others.
    pub async fn generate_images(&self, batch: &BatchId, prompts: &[String], count: u32) -> Vec<Result<Vec<String>, ImageJobError>> {
        let mut results = Vec::with_capacity(prompts.len());
        for (prompt, step_index) in prompts.iter().zip(1u32..) {
            let job = ImageJob { step_index, prompt: prompt.clone(), requested_count: count };
            let result = self.run_job(batch, &job).await.map(|r| r.paths);
            if let Err(e) = &result {
                error!("❌ Image generation for step {} failed: {}", step_index, e);
            }
            results.push(result);
        }
        results
    }

    async fn persist(&self, batch: &BatchId, step_index: u32, ordinal: usize, rendered: RenderedImage) -> Result<String, ImageJobError> {
        match rendered {
            RenderedImage::Remote { url } => Ok(url),
            RenderedImage::Inline { bytes, mime_type } => {
                tokio::fs::create_dir_all(&self.output_dir).await?;
                let filename = image_filename(step_index, ordinal, batch, extension_for(&bytes, &mime_type));
                let path = self.output_dir.join(filename);
                tokio::fs::write(&path, &bytes).await?;
                Ok(path.to_string_lossy().into_owned())
            }
        }
    }
}
