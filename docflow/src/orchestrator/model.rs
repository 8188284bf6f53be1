//! Templates, per-file results and batch sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FieldType {
    Text,
    Number,
    Date,
    Currency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub optional: bool,
}

impl ExtractionField {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            description: String::new(),
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// What to extract from each document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionTemplate {
    pub name: String,
    #[serde(default)]
    pub prompt_description: String,
    pub fields: Vec<ExtractionField>,
    #[serde(default)]
    pub examples: Vec<serde_json::Value>,
    /// Extraction provider settings, passed through to the extractor.
    #[serde(default)]
    pub provider: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub run_options: serde_json::Map<String, serde_json::Value>,
}

impl ExtractionTemplate {
    pub fn new(name: impl Into<String>, fields: Vec<ExtractionField>) -> Self {
        Self {
            name: name.into(),
            prompt_description: String::new(),
            fields,
            examples: Vec::new(),
            provider: serde_json::Map::new(),
            run_options: serde_json::Map::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("template name must not be empty"));
        }
        if self.fields.is_empty() {
            return Err(Error::validation(format!(
                "template {} defines no fields",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(Error::validation("field name must not be empty"));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate field {} in template {}",
                    field.name, self.name
                )));
            }
        }
        Ok(())
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &ExtractionField> {
        self.fields.iter().filter(|f| !f.optional)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// Output of an extractor for one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub confidences: BTreeMap<String, f64>,
}

/// Outcome of processing one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub source_file: String,
    #[serde(default)]
    pub extracted_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub confidence_scores: BTreeMap<String, f64>,
    /// Seconds.
    #[serde(default)]
    pub processing_time: f64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub status: ProcessingStatus,
}

impl ExtractionResult {
    pub fn failed(source_file: impl Into<String>, error: impl Into<String>, processing_time: f64) -> Self {
        Self {
            source_file: source_file.into(),
            extracted_data: serde_json::Map::new(),
            confidence_scores: BTreeMap::new(),
            processing_time,
            errors: vec![error.into()],
            warnings: Vec::new(),
            status: ProcessingStatus::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ProcessingStatus::Completed
    }
}

/// One batch run and everything it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSession {
    pub session_id: String,
    pub batch_id: String,
    pub template: ExtractionTemplate,
    /// Every input of the batch, including files finished before a resume.
    pub files: Vec<PathBuf>,
    pub results: Vec<ExtractionResult>,
    #[serde(default)]
    pub summary_stats: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled: bool,
}

impl ProcessingSession {
    pub fn successful_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == ProcessingStatus::Failed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> ExtractionTemplate {
        ExtractionTemplate::new(
            "invoice",
            vec![
                ExtractionField::new("number", FieldType::Text),
                ExtractionField::new("total", FieldType::Currency),
                ExtractionField::new("note", FieldType::Text).optional(),
            ],
        )
    }

    #[test]
    fn test_template_validation() {
        assert!(template().validate().is_ok());
        assert_eq!(template().required_fields().count(), 2);

        let mut empty = template();
        empty.fields.clear();
        assert!(empty.validate().is_err());

        let mut duplicate = template();
        duplicate
            .fields
            .push(ExtractionField::new("total", FieldType::Number));
        assert!(duplicate.validate().is_err());
    }

    #[test]
    fn test_template_json_shape() {
        let json = serde_json::json!({
            "name": "receipt",
            "fields": [
                { "name": "date", "type": "date" },
                { "name": "amount", "type": "currency", "optional": true }
            ]
        });
        let template: ExtractionTemplate = serde_json::from_value(json).unwrap();
        assert_eq!(template.fields[0].field_type, FieldType::Date);
        assert!(template.fields[1].optional);
        assert!(template.provider.is_empty());
    }

    #[test]
    fn test_failed_result() {
        let result = ExtractionResult::failed("a.pdf", "provider error: quota", 1.5);
        assert!(!result.is_success());
        assert_eq!(result.errors, vec!["provider error: quota"]);
        assert_eq!(
            serde_json::to_value(&result).unwrap()["status"],
            "FAILED"
        );
    }
}
