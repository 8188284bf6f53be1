//! Processing phases, completion records and progress snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stage a single file passes through, in order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessingPhase {
    Ingestion,
    Ocr,
    Extraction,
    Validation,
}

impl ProcessingPhase {
    pub const ALL: [ProcessingPhase; 4] = [
        ProcessingPhase::Ingestion,
        ProcessingPhase::Ocr,
        ProcessingPhase::Extraction,
        ProcessingPhase::Validation,
    ];

    /// Share of one file's total work. Weights sum to 1.0.
    pub fn weight(self) -> f64 {
        match self {
            Self::Ingestion => 0.2,
            Self::Ocr => 0.3,
            Self::Extraction => 0.4,
            Self::Validation => 0.1,
        }
    }

    /// Combined weight of every phase strictly before this one.
    pub fn weight_before(self) -> f64 {
        Self::ALL
            .iter()
            .take_while(|phase| **phase != self)
            .map(|phase| phase.weight())
            .sum()
    }

    /// Phase-weighted share of a file done when this phase is `fraction` complete.
    pub fn file_fraction(self, fraction: f64) -> f64 {
        (self.weight_before() + self.weight() * fraction.clamp(0.0, 1.0)).min(1.0)
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Ingestion => "Reading document content",
            Self::Ocr => "Optical character recognition",
            Self::Extraction => "AI data extraction",
            Self::Validation => "Data validation and cleanup",
        }
    }
}

/// Completion of one phase for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub file_path: String,
    pub phase: ProcessingPhase,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds.
    pub duration: f64,
    pub success: bool,
    pub field_count: usize,
    pub confidence_scores: Vec<f64>,
    pub error: Option<String>,
}

impl ProcessingRecord {
    /// Record ending now that took `duration` seconds.
    pub fn new(
        file_path: impl Into<String>,
        phase: ProcessingPhase,
        duration: f64,
        success: bool,
    ) -> Self {
        let duration = duration.max(0.0);
        let end_time = Utc::now();
        let start_time = end_time - chrono::Duration::milliseconds((duration * 1000.0) as i64);
        Self {
            file_path: file_path.into(),
            phase,
            start_time,
            end_time,
            duration,
            success,
            field_count: 0,
            confidence_scores: Vec::new(),
            error: None,
        }
    }

    pub fn with_fields(mut self, field_count: usize, confidence_scores: Vec<f64>) -> Self {
        self.field_count = field_count;
        self.confidence_scores = confidence_scores;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn average_confidence(&self) -> f64 {
        if self.confidence_scores.is_empty() {
            0.0
        } else {
            self.confidence_scores.iter().sum::<f64>() / self.confidence_scores.len() as f64
        }
    }
}

/// Point-in-time view of batch progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetailedProgress {
    /// 0.0 - 1.0
    pub batch_progress: f64,
    pub current_file_index: usize,
    pub total_files: usize,
    pub completed_files: usize,
    /// Phase-weighted share of the current file, 0.0 - 1.0.
    pub current_file_progress: f64,
    /// Fraction of the current phase, 0.0 - 1.0.
    pub phase_progress: f64,
    pub current_phase: Option<ProcessingPhase>,
    pub current_file_name: String,
    pub throughput_docs_per_min: f64,
    pub throughput_fields_per_sec: f64,
    /// Seconds per record.
    pub avg_processing_time: f64,
    pub eta_current_file_secs: f64,
    pub eta_batch_secs: f64,
    pub memory_usage_mb: f64,
    pub cpu_usage_percent: f64,
    pub success_rate: f64,
    pub avg_confidence: f64,
    pub elapsed_secs: f64,
}

impl DetailedProgress {
    pub fn progress_percentage(&self) -> f64 {
        self.batch_progress * 100.0
    }

    pub fn eta_formatted(&self) -> String {
        if self.eta_batch_secs <= 0.0 {
            return "Calculating...".to_string();
        }
        let total = self.eta_batch_secs as u64;
        let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
        if hours > 0 {
            format!("{hours}h {minutes}m")
        } else if minutes > 0 {
            format!("{minutes}m {seconds}s")
        } else {
            format!("{seconds}s")
        }
    }

    pub fn throughput_summary(&self) -> String {
        format!(
            "{:.1} docs/min, {:.1} fields/sec",
            self.throughput_docs_per_min, self.throughput_fields_per_sec
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_sum_to_one() {
        let total: f64 = ProcessingPhase::ALL.iter().map(|p| p.weight()).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(ProcessingPhase::Ingestion.weight_before(), 0.0);
        assert!((ProcessingPhase::Validation.weight_before() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_file_fraction() {
        assert!((ProcessingPhase::Ocr.file_fraction(0.5) - 0.35).abs() < 1e-9);
        assert!((ProcessingPhase::Validation.file_fraction(1.0) - 1.0).abs() < 1e-9);
        assert!((ProcessingPhase::Extraction.file_fraction(7.0) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_record_timing() {
        let record = ProcessingRecord::new("a.pdf", ProcessingPhase::Extraction, 2.5, true)
            .with_fields(2, vec![0.5, 1.0]);
        assert_eq!((record.end_time - record.start_time).num_milliseconds(), 2500);
        assert!((record.average_confidence() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_eta_formatting() {
        let mut progress = DetailedProgress::default();
        assert_eq!(progress.eta_formatted(), "Calculating...");
        progress.eta_batch_secs = 45.0;
        assert_eq!(progress.eta_formatted(), "45s");
        progress.eta_batch_secs = 125.0;
        assert_eq!(progress.eta_formatted(), "2m 5s");
        progress.eta_batch_secs = 3725.0;
        assert_eq!(progress.eta_formatted(), "1h 2m");

        progress.throughput_docs_per_min = 3.04;
        progress.throughput_fields_per_sec = 1.24;
        assert_eq!(progress.throughput_summary(), "3.0 docs/min, 1.2 fields/sec");
    }
}
