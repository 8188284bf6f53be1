//! Multi-phase batch progress, ETA and throughput reporting.

mod phase;
mod tracker;

pub use phase::{DetailedProgress, ProcessingPhase, ProcessingRecord};
pub use tracker::{
    PerformanceMetrics, PhaseStatistics, ProcessingSummary, ProgressConfig, ProgressEvent,
    ProgressTracker,
};
