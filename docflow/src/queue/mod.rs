//! Prioritized job queue feeding a resizable worker pool.

mod complexity;
mod job;
mod processing_queue;

pub use complexity::{
    BASELINE_DURATION_SECS, ComplexityEstimator, FALLBACK_COMPLEXITY, base_factor,
    estimate_duration, size_multiplier,
};
pub use job::{JobPriority, JobStatus, ProcessingJob};
pub use processing_queue::{
    BatchProgress, JobExecutor, MAX_WORKERS_LIMIT, ProcessingQueue, QueueConfig, QueueEvent,
    QueueStatistics, evaluate_scaling,
};
