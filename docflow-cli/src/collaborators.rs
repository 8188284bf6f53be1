//! Local collaborators for plain-text documents.

use async_trait::async_trait;
use docflow::error::ProcessingError;
use docflow::orchestrator::{Extraction, ExtractionTemplate, Extractor, FieldType, Ingestor};
use serde_json::json;
use std::path::Path;

/// Reads documents as UTF-8 text.
pub struct PlainTextIngestor;

#[async_trait]
impl Ingestor for PlainTextIngestor {
    async fn ingest(&self, path: &Path) -> Result<String, ProcessingError> {
        let bytes = tokio::fs::read(path).await?;
        String::from_utf8(bytes)
            .map_err(|e| ProcessingError::Format(format!("{} is not UTF-8: {e}", path.display())))
    }
}

/// Extracts `Field name: value` lines whose key matches a template field.
///
/// Keys match case-insensitively with spaces, dashes and underscores treated
/// alike. Values that do not parse as their field type are kept with a lower
/// confidence.
pub struct LineFieldExtractor;

const EXACT_CONFIDENCE: f64 = 1.0;
const NORMALIZED_CONFIDENCE: f64 = 0.8;
const MISTYPED_CONFIDENCE: f64 = 0.4;

#[async_trait]
impl Extractor for LineFieldExtractor {
    async fn extract(
        &self,
        text: &str,
        template: &ExtractionTemplate,
    ) -> Result<Extraction, ProcessingError> {
        let mut extraction = Extraction::default();

        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                continue;
            }

            let Some(field) = template
                .fields
                .iter()
                .find(|f| normalize(&f.name) == normalize(key))
            else {
                continue;
            };
            if extraction.fields.contains_key(&field.name) {
                continue;
            }

            let (value, typed) = typed_value(field.field_type, value);
            let confidence = if !typed {
                MISTYPED_CONFIDENCE
            } else if field.name == key {
                EXACT_CONFIDENCE
            } else {
                NORMALIZED_CONFIDENCE
            };
            extraction.fields.insert(field.name.clone(), value);
            extraction.confidences.insert(field.name.clone(), confidence);
        }

        Ok(extraction)
    }
}

fn normalize(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// The value as JSON, and whether it matched the field type.
fn typed_value(field_type: FieldType, raw: &str) -> (serde_json::Value, bool) {
    match field_type {
        FieldType::Number => match raw.replace(',', "").parse::<f64>() {
            Ok(n) => (json!(n), true),
            Err(_) => (json!(raw), false),
        },
        FieldType::Currency => {
            let digits: String = raw
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            (json!(raw), digits.parse::<f64>().is_ok())
        }
        FieldType::Date => {
            let typed = ["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%d.%m.%Y"]
                .iter()
                .any(|format| is_date(raw, format));
            (json!(raw), typed)
        }
        FieldType::Text => (json!(raw), true),
    }
}

fn is_date(raw: &str, format: &str) -> bool {
    let parts: Vec<&str> = raw.split(['-', '/', '.']).collect();
    if parts.len() != format.matches('%').count()
        || !parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit()))
    {
        return false;
    }
    let expected: Vec<usize> = format
        .split(['-', '/', '.'])
        .map(|p| if p == "%Y" { 4 } else { 2 })
        .collect();
    parts
        .iter()
        .zip(expected)
        .all(|(part, len)| part.len() == len || (len == 2 && part.len() == 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow::orchestrator::ExtractionField;

    fn template() -> ExtractionTemplate {
        ExtractionTemplate::new(
            "invoice",
            vec![
                ExtractionField::new("invoice_number", FieldType::Text),
                ExtractionField::new("total", FieldType::Currency),
                ExtractionField::new("quantity", FieldType::Number),
                ExtractionField::new("issued", FieldType::Date),
            ],
        )
    }

    #[tokio::test]
    async fn test_extracts_matching_lines() {
        let text = "Invoice Number: INV-42\n\
                    total: $1,250.00\n\
                    quantity: many\n\
                    issued: 2024-03-01\n\
                    notes: ignored\n\
                    total: 99";
        let extraction = LineFieldExtractor.extract(text, &template()).await.unwrap();

        assert_eq!(extraction.fields["invoice_number"], "INV-42");
        assert_eq!(extraction.confidences["invoice_number"], NORMALIZED_CONFIDENCE);
        assert_eq!(extraction.fields["total"], "$1,250.00");
        assert_eq!(extraction.confidences["total"], EXACT_CONFIDENCE);
        assert_eq!(extraction.confidences["quantity"], MISTYPED_CONFIDENCE);
        assert_eq!(extraction.confidences["issued"], EXACT_CONFIDENCE);
        assert!(!extraction.fields.contains_key("notes"));
    }

    #[tokio::test]
    async fn test_numbers_are_parsed() {
        let extraction = LineFieldExtractor
            .extract("quantity: 1,200", &template())
            .await
            .unwrap();
        assert_eq!(extraction.fields["quantity"], 1200.0);
    }

    #[test]
    fn test_date_shapes() {
        assert!(typed_value(FieldType::Date, "2024-03-01").1);
        assert!(typed_value(FieldType::Date, "1/3/2024").1);
        assert!(!typed_value(FieldType::Date, "March 1st").1);
        assert!(!typed_value(FieldType::Date, "2024-03").1);
    }

    #[tokio::test]
    async fn test_ingest_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = PlainTextIngestor
            .ingest(&dir.path().join("missing.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::Io(_)));
    }

    #[tokio::test]
    async fn test_ingest_rejects_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.bin");
        std::fs::write(&path, [0xff, 0xfe, 0x00]).unwrap();
        assert!(matches!(
            PlainTextIngestor.ingest(&path).await,
            Err(ProcessingError::Format(_))
        ));
    }
}
