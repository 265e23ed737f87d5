//! Illustrated step-by-step lesson generation.
//!
//! A lesson request is turned into ordered steps by a text model, every step
//! is illustrated by its own concurrently running image job, and the paired
//! result is uploaded and stored as a lesson.

pub mod config;
pub mod error;
pub mod gemini;
pub mod images;
pub mod lessons;
pub mod models;
pub mod openai;
pub mod pdf;
pub mod pipeline;
pub mod provider;
pub mod refine;
pub mod routes;
pub mod steps;
pub mod store;
pub mod supabase;

pub use config::AppConfig;
pub use lessons::LessonService;
pub use pipeline::{LessonPipeline, PipelineOutput, PipelineState};
pub use routes::{create_router, AppState};
