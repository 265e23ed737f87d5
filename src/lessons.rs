use std::{collections::HashMap, path::Path, sync::Arc};

use tracing::{info, warn};

use crate::{
    error::PipelineError,
    models::{CreateLessonRequest, LessonDraft, StepImage, StepRecord, UploadedImage},
    pipeline::{LessonPipeline, PipelineOutput},
    store::LessonStore,
};

#[derive(Debug, Clone)]
pub struct CreatedLesson {
    pub lesson_id: i64,
    pub steps: usize,
    pub placeholders: Vec<u32>,
}

/// Runs the pipeline for a lesson request and persists the result.
pub struct LessonService {
    pipeline: LessonPipeline,
    store: Arc<dyn LessonStore>,
}

impl LessonService {
    pub fn new(pipeline: LessonPipeline, store: Arc<dyn LessonStore>) -> Self {
        Self { pipeline, store }
    }

    pub async fn create_lesson(&self, request: &CreateLessonRequest) -> Result<CreatedLesson, PipelineError> {
        info!("🚀 Creating lesson '{}' on {}", request.title, request.topic);
        let output = self.pipeline.run(&request.generation_request()).await?;
        let scratch = self.pipeline.images().output_dir();

        let stored = self.store_output(request, &output, scratch).await;

        // The batch's scratch files go whether or not the lesson was stored
        if let Err(e) = self.store.clear_local_images(scratch, &output.batch).await {
            warn!("⚠️ Could not clear generated images for batch {}: {}", output.batch, e);
        }

        let (lesson_id, steps) = stored?;
        info!("✅ Lesson {} stored with {} steps", lesson_id, steps);
        Ok(CreatedLesson { lesson_id, steps, placeholders: output.placeholders })
    }

    async fn store_output(&self, request: &CreateLessonRequest, output: &PipelineOutput, scratch: &Path) -> Result<(i64, usize), PipelineError> {
        let uploaded = self.store.upload_images(scratch, &output.batch).await.map_err(PipelineError::Images)?;
        let draft = build_draft(request, output, &uploaded);
        let lesson_id = self.store.save_lesson(&draft).await?;
        Ok((lesson_id, draft.steps.len()))
    }
}

pub fn build_draft(request: &CreateLessonRequest, output: &PipelineOutput, uploaded: &[UploadedImage]) -> LessonDraft {
    let urls: HashMap<&str, &str> = uploaded.iter().map(|u| (u.file.as_str(), u.url.as_str())).collect();
    let mut steps: Vec<StepRecord> = output.steps.iter().map(|pair| step_record(pair, &urls)).collect();
    steps.sort_by_key(|s| s.step_number);
    LessonDraft {
        name: request.title.clone(),
        description: request.description.clone(),
        level: request.level.clone(),
        steps,
    }
}

fn step_record(pair: &StepImage, urls: &HashMap<&str, &str>) -> StepRecord {
    StepRecord {
        step_number: pair.step.index,
        step_description: pair.step.text.clone(),
        image_ref: pair.image.primary_ref().and_then(|reference| resolve_reference(reference, urls, pair.step.index)),
    }
}

/// Local scratch paths become their uploaded URL; provider URLs are kept as-is.
fn resolve_reference(reference: &str, urls: &HashMap<&str, &str>, step_index: u32) -> Option<String> {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return Some(reference.to_string());
    }
    let file = Path::new(reference).file_name().and_then(|n| n.to_str())?;
    match urls.get(file) {
        Some(url) => Some(url.to_string()),
        None => {
            warn!("⚠️ Image for step {} was not uploaded, storing placeholder", step_index);
            None
        }
    }
}
