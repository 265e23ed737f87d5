//! Critique/refine loop for a single image slot.
//!
//! Each iteration runs a critique phase and then a refine phase. The critic
//! either answers with [`COMPLETION_PHRASE`] or with actionable feedback; the
//! refine phase exits on the phrase and otherwise renders a replacement image.
//! The loop never runs more than [`MAX_ITERATIONS`] times; running out of
//! budget accepts the current image.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    error::ProviderError,
    models::RenderedImage,
    provider::{ImageCritic, ImageProvider},
};

/// Exact critic answer that ends the loop.
pub const COMPLETION_PHRASE: &str = "No major issues found.";
pub const MAX_ITERATIONS: u32 = 4;

#[derive(Debug, Clone)]
pub struct RefinementState {
    pub current_image: Option<RenderedImage>,
    pub criticism: Option<String>,
    pub subject: String,
    pub iteration: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineAction {
    Exit,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Completed,
    BudgetExhausted,
    /// A provider call failed after an image existed; the last good image is kept.
    Aborted(String),
}

#[derive(Debug, Clone)]
pub struct RefinementOutcome {
    pub image: RenderedImage,
    pub exit: LoopExit,
    pub iterations: u32,
    pub critiques: Vec<String>,
}

pub fn from_scratch_instruction(subject: &str) -> String {
    format!("No image exists yet. Create one from scratch that clearly depicts: {subject}")
}

fn critic_instructions(subject: &str) -> String {
    format!(
        "You are a constructive critic reviewing an image for a tutorial step.\n\
        Subject the image corresponds to: {subject}\n\
        Review the image for clarity, engagement and coherence with the subject. \
        If the subject is a mathematical operation or equation, the image should be a simple, clear visual representation of it.\n\
        If there is at least one clear and actionable improvement, output only those suggestions, concisely.\n\
        Otherwise respond exactly with \"{COMPLETION_PHRASE}\" and nothing else. \
        It does not need to be perfect, only functionally complete; avoid purely stylistic preferences."
    )
}

fn refine_prompt(subject: &str, criticism: &str, has_image: bool) -> String {
    let basis = if has_image { "Improve the previous illustration" } else { "Create an illustration" };
    format!(
        "{basis} for this tutorial step: {subject}\n\
        Apply this feedback: {criticism}\n\
        If the step is a mathematical operation or equation, show it as a simple, clear visual representation."
    )
}

pub struct RefinementLoop {
    critic: Arc<dyn ImageCritic>,
    images: Arc<dyn ImageProvider>,
    size: String,
    max_iterations: u32,
}

impl RefinementLoop {
    pub fn new(critic: Arc<dyn ImageCritic>, images: Arc<dyn ImageProvider>, size: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            critic,
            images,
            size: size.into(),
            max_iterations: max_iterations.clamp(1, MAX_ITERATIONS),
        }
    }

    /// Critique phase. Without an image the critique asks for one from scratch.
    pub async fn critique(&self, state: &RefinementState) -> Result<String, ProviderError> {
        match &state.current_image {
            None => Ok(from_scratch_instruction(&state.subject)),
            Some(image) => {
                let text = self.critic.critique(image, &critic_instructions(&state.subject)).await?;
                Ok(text.trim().to_string())
            }
        }
    }

    /// Refine phase. Leaves the state untouched when the criticism is the completion phrase.
    pub async fn refine(&self, state: &mut RefinementState) -> Result<RefineAction, ProviderError> {
        let criticism = state.criticism.as_deref().unwrap_or_default();
        if criticism == COMPLETION_PHRASE {
            return Ok(RefineAction::Exit);
        }

        let prompt = refine_prompt(&state.subject, criticism, state.current_image.is_some());
        let image = self
            .images
            .render(&prompt, 1, &self.size)
            .await?
            .into_iter()
            .next()
            .ok_or(ProviderError::MissingImage)?;
        state.current_image = Some(image);
        Ok(RefineAction::Continue)
    }

    pub async fn run(&self, subject: &str, initial: Option<RenderedImage>) -> Result<RefinementOutcome, ProviderError> {
        let mut state = RefinementState {
            current_image: initial,
            criticism: None,
            subject: subject.to_string(),
            iteration: 0,
        };
        let mut critiques = Vec::new();
        let mut exit = LoopExit::BudgetExhausted;

        while state.iteration < self.max_iterations {
            state.iteration += 1;

            let criticism = match self.critique(&state).await {
                Ok(c) => c,
                Err(e) if state.current_image.is_some() => {
                    warn!("⚠️ Critique failed on iteration {}, keeping current image: {}", state.iteration, e);
                    exit = LoopExit::Aborted(e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            };
            info!("🔍 Refinement iteration {}: {}", state.iteration, criticism);
            critiques.push(criticism.clone());
            state.criticism = Some(criticism);

            match self.refine(&mut state).await {
                Ok(RefineAction::Exit) => {
                    exit = LoopExit::Completed;
                    break;
                }
                Ok(RefineAction::Continue) => {}
                Err(e) if state.current_image.is_some() => {
                    warn!("⚠️ Refinement failed on iteration {}, keeping current image: {}", state.iteration, e);
                    exit = LoopExit::Aborted(e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let image = state.current_image.ok_or(ProviderError::MissingImage)?;
        info!("✅ Refinement finished after {} iteration(s): {:?}", state.iteration, exit);
        Ok(RefinementOutcome { image, exit, iterations: state.iteration, critiques })
    }
}
