//! Resumable snapshot of a batch in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::progress::ProcessingPhase;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub session_id: String,
    pub batch_id: String,
    /// Index of the next file to process; never past the end of `file_list`.
    pub current_file_index: usize,
    pub current_phase: ProcessingPhase,
    pub current_file_name: String,
    pub file_list: Vec<PathBuf>,
    #[serde(default)]
    pub template_data: serde_json::Value,
    #[serde(default)]
    pub partial_results: Vec<serde_json::Value>,
    #[serde(default)]
    pub processing_metadata: serde_json::Map<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    /// 0 - 100.
    pub completion_percentage: f64,
}

impl ProcessingState {
    pub fn new(
        session_id: impl Into<String>,
        batch_id: impl Into<String>,
        file_list: Vec<PathBuf>,
    ) -> Self {
        let current_file_name = file_list
            .first()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Self {
            session_id: session_id.into(),
            batch_id: batch_id.into(),
            current_file_index: 0,
            current_phase: ProcessingPhase::Ingestion,
            current_file_name,
            file_list,
            template_data: serde_json::Value::Null,
            partial_results: Vec::new(),
            processing_metadata: serde_json::Map::new(),
            timestamp: Utc::now(),
            completion_percentage: 0.0,
        }
    }

    pub fn with_template(mut self, template_data: serde_json::Value) -> Self {
        self.template_data = template_data;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.current_file_index > self.file_list.len() {
            return Err(Error::invalid_state(format!(
                "current_file_index {} exceeds file list of {}",
                self.current_file_index,
                self.file_list.len()
            )));
        }
        Ok(())
    }

    /// Files not yet processed, in order.
    pub fn remaining_files(&self) -> &[PathBuf] {
        let start = self.current_file_index.min(self.file_list.len());
        &self.file_list[start..]
    }

    /// Move to `file_index`, refreshing the timestamp and completion.
    pub fn advance_to(&mut self, file_index: usize, phase: ProcessingPhase) {
        self.current_file_index = file_index.min(self.file_list.len());
        self.current_phase = phase;
        self.current_file_name = self
            .file_list
            .get(self.current_file_index)
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        self.completion_percentage = if self.file_list.is_empty() {
            0.0
        } else {
            self.current_file_index as f64 / self.file_list.len() as f64 * 100.0
        };
        self.timestamp = Utc::now();
    }

    pub fn progress_summary(&self) -> String {
        format!(
            "{}/{} files ({:.1}%), {} remaining",
            self.current_file_index,
            self.file_list.len(),
            self.completion_percentage,
            self.remaining_files().len()
        )
    }
}
