//! docflow: resilient orchestration for batch document extraction.
//!
//! An [`orchestrator::Orchestrator`] runs every file of a batch through
//! ingestion, extraction and validation. Around that pipeline sit optional
//! components for retry with backoff, resource monitoring, detailed progress,
//! cancellation with resumable saved state, and a prioritized job queue.

pub mod cancellation;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod resource;
pub mod retry;
pub mod utils;

pub use error::{Error, Result};
