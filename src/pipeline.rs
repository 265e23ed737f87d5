//! Lesson generation pipeline.
//!
//! `GeneratingSteps -> GeneratingImages -> Reassembling -> Done`, or `Failed`
//! when step generation fails. Image jobs are spawned one per step and joined
//! at a single point; results are placed by step index, never by completion
//! order, and a failed job leaves a placeholder in its own slot.

use std::{collections::BTreeMap, sync::Arc};

use serde::Serialize;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    config::PipelineConfig,
    error::{ImageJobError, PipelineError},
    images::{BatchId, ImageGenerator},
    models::{GenerationRequest, ImageJob, ImageOutcome, ImageResult, Step, StepImage},
    steps::StepGenerator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    GeneratingSteps,
    GeneratingImages,
    Reassembling,
    Done,
    Failed,
}

impl PipelineState {
    pub const fn is_terminal(&self) -> bool { matches!(self, Self::Done | Self::Failed) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountMismatch {
    pub steps: usize,
    pub results: usize,
    pub missing: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub batch: BatchId,
    /// Ordered by step index.
    pub steps: Vec<StepImage>,
    pub placeholders: Vec<u32>,
    pub mismatch: Option<CountMismatch>,
    pub transitions: Vec<PipelineState>,
}

pub fn image_prompt(step: &Step, emphasize_step_number: bool) -> String {
    if emphasize_step_number {
        format!(
            "{}\n\nThe illustration must prominently display the number {} so it is clear which step of the tutorial it belongs to.",
            step.text, step.index
        )
    } else {
        step.text.clone()
    }
}

pub struct LessonPipeline {
    steps: StepGenerator,
    images: Arc<ImageGenerator>,
    config: PipelineConfig,
}

struct Tracker(Vec<PipelineState>);

impl Tracker {
    fn enter(&mut self, state: PipelineState) {
        info!("🔁 Pipeline state: {:?}", state);
        self.0.push(state);
    }
}

impl LessonPipeline {
    pub fn new(steps: StepGenerator, images: Arc<ImageGenerator>, config: PipelineConfig) -> Self {
        Self { steps, images, config }
    }

    pub fn images(&self) -> &ImageGenerator { &self.images }

    pub async fn run(&self, request: &GenerationRequest) -> Result<PipelineOutput, PipelineError> {
        let mut tracker = Tracker(Vec::new());

        tracker.enter(PipelineState::GeneratingSteps);
        let steps = match self.steps.generate_steps(request).await {
            Ok(steps) => steps,
            Err(e) => {
                tracker.enter(PipelineState::Failed);
                error!("❌ Step generation failed, no image jobs submitted: {}", e);
                return Err(PipelineError::Steps(e));
            }
        };

        tracker.enter(PipelineState::GeneratingImages);
        let batch = BatchId::new();
        let jobs: Vec<ImageJob> = steps
            .iter()
            .map(|step| ImageJob {
                step_index: step.index,
                prompt: image_prompt(step, self.config.emphasize_step_number),
                requested_count: self.config.images_per_step,
            })
            .collect();
        info!("🚀 Fanning out {} image jobs for batch {}", jobs.len(), batch);
        let handles = self.spawn_jobs(&batch, jobs);

        tracker.enter(PipelineState::Reassembling);
        let (steps, placeholders, mismatch) = reassemble(steps, handles).await;

        tracker.enter(PipelineState::Done);
        info!("✅ Pipeline finished for batch {}: {} steps, {} placeholder(s)", batch, steps.len(), placeholders.len());
        Ok(PipelineOutput { batch, steps, placeholders, mismatch, transitions: tracker.0 })
    }

    fn spawn_jobs(&self, batch: &BatchId, jobs: Vec<ImageJob>) -> Vec<(u32, JoinHandle<Result<ImageResult, ImageJobError>>)> {
        let limit = self.config.max_concurrent_images.map(|n| Arc::new(Semaphore::new(n)));
        jobs.into_iter()
            .map(|job| {
                let generator = self.images.clone();
                let batch = batch.clone();
                let limit = limit.clone();
                let step_index = job.step_index;
                let handle = tokio::spawn(async move {
                    let _permit = match limit {
                        Some(semaphore) => semaphore.acquire_owned().await.ok(),
                        None => None,
                    };
                    generator.run_job(&batch, &job).await
                });
                (step_index, handle)
            })
            .collect()
    }
}

/// Waits for every job, then lines results up with their steps by index.
async fn reassemble(
    steps: Vec<Step>,
    handles: Vec<(u32, JoinHandle<Result<ImageResult, ImageJobError>>)>,
) -> (Vec<StepImage>, Vec<u32>, Option<CountMismatch>) {
    let submitted = handles.len();
    let mut by_index: BTreeMap<u32, ImageOutcome> = BTreeMap::new();

    for (step_index, handle) in handles {
        let (index, outcome) = match handle.await {
            Ok(Ok(result)) => (result.step_index, ImageOutcome::Rendered(result)),
            Ok(Err(e)) => {
                warn!("⚠️ Image job for step {} failed, using placeholder: {}", step_index, e);
                (step_index, ImageOutcome::Placeholder { reason: e.to_string() })
            }
            Err(join_error) => {
                error!("❌ Image job for step {} did not complete: {}", step_index, join_error);
                (step_index, ImageOutcome::Placeholder { reason: format!("image job aborted: {join_error}") })
            }
        };
        if by_index.insert(index, outcome).is_some() {
            warn!("⚠️ Duplicate image result for step {}", index);
        }
    }

    let collected = by_index.len();
    let mut missing = Vec::new();
    let mut placeholders = Vec::new();
    let paired: Vec<StepImage> = steps
        .into_iter()
        .map(|step| {
            let image = by_index.remove(&step.index).unwrap_or_else(|| {
                missing.push(step.index);
                ImageOutcome::Placeholder { reason: "no image result collected".into() }
            });
            if matches!(image, ImageOutcome::Placeholder { .. }) {
                placeholders.push(step.index);
            }
            StepImage { step, image }
        })
        .collect();

    let mismatch = if collected != paired.len() || submitted != paired.len() || !missing.is_empty() || !by_index.is_empty() {
        let mismatch = CountMismatch { steps: paired.len(), results: collected, missing };
        warn!("⚠️ Step/image count mismatch: {:?}", mismatch);
        Some(mismatch)
    } else {
        None
    };

    (paired, placeholders, mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ProviderError,
        models::RenderedImage,
        provider::{ImageProvider, TextProvider},
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use rand::Rng;
    use serde_json::{json, Value};
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    struct FixedSteps(Result<Vec<String>, String>);

    #[async_trait]
    impl TextProvider for FixedSteps {
        async fn generate_json(&self, _prompt: &str, _schema: &Value) -> Result<String, ProviderError> {
            self.0.clone().map(|steps| json!({ "steps": steps }).to_string()).map_err(ProviderError::Http)
        }
    }

    /// Echoes the prompt back as the image bytes after a random delay.
    #[derive(Default)]
    struct JitteryRenderer {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ImageProvider for JitteryRenderer {
        async fn render(&self, prompt: &str, count: u32, _size: &str) -> Result<Vec<RenderedImage>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = rand::thread_rng().gen_range(0..40);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if prompt.contains("FAIL") {
                return Err(ProviderError::Http("provider timeout".into()));
            }
            Ok((0..count)
                .map(|_| RenderedImage::Inline { bytes: Bytes::from(prompt.as_bytes().to_vec()), mime_type: "image/png".into() })
                .collect())
        }
    }

    fn step_texts(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("Step {i}. operation number {i}")).collect()
    }

    fn pipeline(texts: Result<Vec<String>, String>, renderer: Arc<JitteryRenderer>, dir: &std::path::Path, config: PipelineConfig) -> LessonPipeline {
        let images = Arc::new(ImageGenerator::new(renderer, dir, config.image_size.clone()));
        LessonPipeline::new(StepGenerator::new(Arc::new(FixedSteps(texts))), images, config)
    }

    fn algebra() -> GenerationRequest {
        GenerationRequest {
            topic: "algebra".into(),
            values: "basic algebraic operations".into(),
            student_level: "high school student".into(),
        }
    }

    fn assert_correlated(output: &PipelineOutput) {
        for (position, pair) in output.steps.iter().enumerate() {
            assert_eq!(pair.step.index as usize, position + 1);
            let ImageOutcome::Rendered(result) = &pair.image else {
                panic!("step {} has no image", pair.step.index);
            };
            assert_eq!(result.step_index, pair.step.index);
            let written = std::fs::read_to_string(&result.paths[0]).unwrap();
            assert!(written.starts_with(&pair.step.text), "step {} got image for {:?}", pair.step.index, written);
        }
    }

    #[tokio::test]
    async fn results_follow_step_index_under_random_delays() {
        for n in [2, 5, 16] {
            let dir = tempfile::tempdir().unwrap();
            let renderer = Arc::new(JitteryRenderer::default());
            let output = pipeline(Ok(step_texts(n)), renderer.clone(), dir.path(), PipelineConfig::default())
                .run(&algebra())
                .await
                .unwrap();

            assert_eq!(output.steps.len(), n);
            assert!(output.placeholders.is_empty());
            assert_eq!(output.mismatch, None);
            assert_correlated(&output);
            assert_eq!(renderer.calls.load(Ordering::SeqCst), n);
        }
    }

    #[tokio::test]
    async fn transitions_through_every_phase() {
        let dir = tempfile::tempdir().unwrap();
        let output = pipeline(Ok(step_texts(3)), Arc::default(), dir.path(), PipelineConfig::default())
            .run(&algebra())
            .await
            .unwrap();
        assert_eq!(
            output.transitions,
            vec![PipelineState::GeneratingSteps, PipelineState::GeneratingImages, PipelineState::Reassembling, PipelineState::Done]
        );
        assert!(output.transitions.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn single_step_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let output = pipeline(Ok(step_texts(1)), Arc::default(), dir.path(), PipelineConfig::default())
            .run(&algebra())
            .await
            .unwrap();
        assert_eq!(output.steps.len(), 1);
        assert_correlated(&output);
    }

    #[tokio::test]
    async fn step_failure_submits_no_image_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(JitteryRenderer::default());
        let err = pipeline(Err("quota exceeded".into()), renderer.clone(), dir.path(), PipelineConfig::default())
            .run(&algebra())
            .await
            .unwrap_err();
        assert_eq!(err.phase(), "steps");
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn malformed_steps_fail_the_pipeline() {
        struct Garbage;
        #[async_trait]
        impl TextProvider for Garbage {
            async fn generate_json(&self, _prompt: &str, _schema: &Value) -> Result<String, ProviderError> {
                Ok("Step 1. not json".into())
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(JitteryRenderer::default());
        let images = Arc::new(ImageGenerator::new(renderer.clone(), dir.path(), "1024x1024"));
        let err = LessonPipeline::new(StepGenerator::new(Arc::new(Garbage)), images, PipelineConfig::default())
            .run(&algebra())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Steps(ProviderError::Parse(_))));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_job_leaves_placeholder_in_its_own_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut texts = step_texts(4);
        texts[2] = "Step 3. FAIL here".into();
        let output = pipeline(Ok(texts), Arc::default(), dir.path(), PipelineConfig::default())
            .run(&algebra())
            .await
            .unwrap();

        assert_eq!(output.steps.len(), 4);
        assert_eq!(output.placeholders, vec![3]);
        assert_eq!(output.mismatch, None);
        assert!(matches!(&output.steps[2].image, ImageOutcome::Placeholder { reason } if reason.contains("provider timeout")));
        for i in [0, 1, 3] {
            let ImageOutcome::Rendered(result) = &output.steps[i].image else { panic!("step {} missing", i + 1) };
            assert_eq!(result.step_index as usize, i + 1);
        }
    }

    #[tokio::test]
    async fn every_job_failing_still_completes_with_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let texts = vec!["Step 1. FAIL".to_string(), "Step 2. FAIL".to_string()];
        let output = pipeline(Ok(texts), Arc::default(), dir.path(), PipelineConfig::default())
            .run(&algebra())
            .await
            .unwrap();
        assert_eq!(output.transitions.last(), Some(&PipelineState::Done));
        assert_eq!(output.placeholders, vec![1, 2]);
        assert_eq!(output.mismatch, None);
        assert!(output.steps.iter().all(|pair| pair.image.primary_ref().is_none()));
    }

    #[tokio::test]
    async fn single_step_with_failed_image_completes() {
        let dir = tempfile::tempdir().unwrap();
        let output = pipeline(Ok(vec!["Step 1. FAIL".to_string()]), Arc::default(), dir.path(), PipelineConfig::default())
            .run(&algebra())
            .await
            .unwrap();
        assert_eq!(output.steps.len(), 1);
        assert_eq!(output.placeholders, vec![1]);
    }

    #[tokio::test]
    async fn repeated_runs_stay_independent() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(JitteryRenderer::default());
        let pipeline = Arc::new(pipeline(Ok(step_texts(6)), renderer, dir.path(), PipelineConfig::default()));

        let request = algebra();
        let (a, b) = tokio::join!(pipeline.run(&request), pipeline.run(&request));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.batch, b.batch);
        assert_correlated(&a);
        assert_correlated(&b);

        let mut names = HashSet::new();
        for output in [&a, &b] {
            for pair in &output.steps {
                let ImageOutcome::Rendered(result) = &pair.image else { panic!("missing image") };
                for path in &result.paths {
                    assert!(path.contains(output.batch.as_str()));
                    assert!(names.insert(path.clone()), "filename collision on {path}");
                }
            }
        }
        assert_eq!(names.len(), 12);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 12);
    }

    #[tokio::test]
    async fn concurrency_cap_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(JitteryRenderer::default());
        let config = PipelineConfig { max_concurrent_images: Some(2), ..PipelineConfig::default() };
        let output = pipeline(Ok(step_texts(8)), renderer.clone(), dir.path(), config).run(&algebra()).await.unwrap();
        assert_correlated(&output);
        assert!(renderer.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn algebra_scenario_pairs_every_step_with_one_image() {
        let dir = tempfile::tempdir().unwrap();
        let texts = vec![
            "Step 1. Identify the variable x in 2x + 3 = 11.".to_string(),
            "Step 2. Subtract 3 from both sides to get 2x = 8.".to_string(),
            "Step 3. Divide both sides by 2 to get x = 4.".to_string(),
        ];
        let output = pipeline(Ok(texts), Arc::default(), dir.path(), PipelineConfig::default())
            .run(&algebra())
            .await
            .unwrap();

        assert_eq!(output.steps.len(), 3);
        for pair in &output.steps {
            let ImageOutcome::Rendered(result) = &pair.image else { panic!("missing image") };
            assert_eq!(result.paths.len(), 1);
            let written = std::fs::read_to_string(&result.paths[0]).unwrap();
            assert_eq!(written, image_prompt(&pair.step, true));
        }
    }

    #[test]
    fn image_prompt_can_skip_step_number_emphasis() {
        let step = Step { index: 2, text: "Step 2. Add 4.".into() };
        assert_eq!(image_prompt(&step, false), "Step 2. Add 4.");
        assert!(image_prompt(&step, true).contains("prominently display the number 2"));
    }

    #[tokio::test]
    async fn reassembly_reports_missing_results() {
        let steps = vec![Step { index: 1, text: "a".into() }, Step { index: 2, text: "b".into() }];
        let handle = tokio::spawn(async { Ok(ImageResult { step_index: 1, paths: vec!["a.png".into()] }) });
        let (paired, placeholders, mismatch) = reassemble(steps, vec![(1, handle)]).await;
        assert_eq!(paired.len(), 2);
        assert_eq!(placeholders, vec![2]);
        assert_eq!(mismatch, Some(CountMismatch { steps: 2, results: 1, missing: vec![2] }));
    }
}
