//! Queued units of work and their ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;

/// Scheduling priority. Higher runs first.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobPriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Urgent = 4,
    Critical = 5,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One file's unit of queued work.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingJob {
    pub job_id: String,
    pub file_path: PathBuf,
    pub priority: JobPriority,
    pub estimated_complexity: f64,
    /// Seconds.
    pub estimated_duration: f64,
    pub created_at: DateTime<Utc>,
    /// Enqueue order; breaks priority ties.
    pub sequence: u64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub worker_id: Option<usize>,
}

impl ProcessingJob {
    pub fn batch_id(&self) -> Option<&str> {
        self.metadata.get("batch_id").and_then(|v| v.as_str())
    }

    /// Seconds between start and completion.
    pub fn processing_time(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(seconds_between(start, end)),
            _ => None,
        }
    }

    /// Seconds spent waiting in the queue.
    pub fn wait_time(&self) -> Option<f64> {
        self.started_at
            .map(|start| seconds_between(self.created_at, start))
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

pub(crate) fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64 / 1000.0
}

/// Heap entry: priority descending, then enqueue order ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueEntry {
    pub priority: JobPriority,
    pub sequence: u64,
    pub job_id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
