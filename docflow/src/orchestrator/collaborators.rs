//! External operations the pipeline is built around.

use async_trait::async_trait;
use serde_json::json;
use std::path::Path;

use super::model::{Extraction, ExtractionResult, ExtractionTemplate, ProcessingStatus};
use crate::error::ProcessingError;

/// Turns a document into text (reading, OCR, ...).
#[async_trait]
pub trait Ingestor: Send + Sync {
    async fn ingest(&self, path: &Path) -> Result<String, ProcessingError>;
}

/// Pulls template fields out of document text.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        text: &str,
        template: &ExtractionTemplate,
    ) -> Result<Extraction, ProcessingError>;
}

/// Summarizes the results of a batch.
pub trait Aggregator: Send + Sync {
    fn aggregate(
        &self,
        template: &ExtractionTemplate,
        results: &[ExtractionResult],
    ) -> Result<serde_json::Value, ProcessingError>;
}

/// Status counts, timing and per-field fill rates.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryAggregator;

impl Aggregator for SummaryAggregator {
    fn aggregate(
        &self,
        template: &ExtractionTemplate,
        results: &[ExtractionResult],
    ) -> Result<serde_json::Value, ProcessingError> {
        let total = results.len();
        let count = |status: ProcessingStatus| results.iter().filter(|r| r.status == status).count();
        let successful = count(ProcessingStatus::Completed);
        let total_time: f64 = results.iter().map(|r| r.processing_time).sum();

        let mut fields = serde_json::Map::new();
        for field in &template.fields {
            let filled = results
                .iter()
                .filter(|r| {
                    r.extracted_data
                        .get(&field.name)
                        .is_some_and(|v| !is_blank(v))
                })
                .count();
            let confidences: Vec<f64> = results
                .iter()
                .filter_map(|r| r.confidence_scores.get(&field.name).copied())
                .collect();
            let mean_confidence = if confidences.is_empty() {
                0.0
            } else {
                confidences.iter().sum::<f64>() / confidences.len() as f64
            };

            fields.insert(
                field.name.clone(),
                json!({
                    "type": field.field_type.to_string(),
                    "filled": filled,
                    "fill_rate": ratio(filled, successful),
                    "mean_confidence": mean_confidence,
                }),
            );
        }

        Ok(json!({
            "template": template.name,
            "total_files": total,
            "successful": successful,
            "failed": count(ProcessingStatus::Failed),
            "cancelled": count(ProcessingStatus::Cancelled),
            "success_rate": ratio(successful, total),
            "total_processing_time": total_time,
            "average_processing_time": if total == 0 { 0.0 } else { total_time / total as f64 },
            "fields": fields,
        }))
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

pub(crate) fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::model::{ExtractionField, FieldType};

    fn completed(file: &str, total: Option<&str>, confidence: f64) -> ExtractionResult {
        let mut data = serde_json::Map::new();
        if let Some(total) = total {
            data.insert("total".into(), json!(total));
        }
        ExtractionResult {
            source_file: file.into(),
            extracted_data: data,
            confidence_scores: [("total".to_string(), confidence)].into_iter().collect(),
            processing_time: 2.0,
            errors: Vec::new(),
            warnings: Vec::new(),
            status: ProcessingStatus::Completed,
        }
    }

    #[test]
    fn test_summary() {
        let template = ExtractionTemplate::new(
            "invoice",
            vec![ExtractionField::new("total", FieldType::Currency)],
        );
        let results = vec![
            completed("a.pdf", Some("10.00"), 0.9),
            completed("b.pdf", Some(" "), 0.5),
            ExtractionResult::failed("c.pdf", "boom", 1.0),
        ];

        let summary = SummaryAggregator.aggregate(&template, &results).unwrap();
        assert_eq!(summary["total_files"], 3);
        assert_eq!(summary["successful"], 2);
        assert_eq!(summary["failed"], 1);
        assert_eq!(summary["total_processing_time"], 5.0);
        assert_eq!(summary["fields"]["total"]["filled"], 1);
        assert_eq!(summary["fields"]["total"]["fill_rate"], 0.5);
        assert_eq!(summary["fields"]["total"]["mean_confidence"], 0.7);
    }

    #[test]
    fn test_empty_batch() {
        let template = ExtractionTemplate::new("t", vec![ExtractionField::new("x", FieldType::Text)]);
        let summary = SummaryAggregator.aggregate(&template, &[]).unwrap();
        assert_eq!(summary["success_rate"], 0.0);
        assert_eq!(summary["average_processing_time"], 0.0);
    }
}
