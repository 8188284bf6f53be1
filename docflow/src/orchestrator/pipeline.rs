//! Ingest, extract and validate one file.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::collaborators::{Extractor, Ingestor, is_blank};
use super::model::{Extraction, ExtractionResult, ExtractionTemplate, ProcessingStatus};
use crate::config::TimeoutConfig;
use crate::error::ProcessingError;
use crate::progress::{ProcessingPhase, ProcessingRecord, ProgressTracker};
use crate::queue::{JobExecutor, ProcessingJob};
use crate::retry::RetryManager;

pub const INGESTION_OPERATION: &str = "file_ingestion";
pub const EXTRACTION_OPERATION: &str = "data_extraction";

/// The per-file processing steps, shared by the sequential loop and the queue.
pub struct FilePipeline {
    ingestor: Arc<dyn Ingestor>,
    extractor: Arc<dyn Extractor>,
    retry: Option<Arc<RetryManager>>,
    progress: Option<Arc<ProgressTracker>>,
    timeouts: TimeoutConfig,
}

impl FilePipeline {
    pub fn new(
        ingestor: Arc<dyn Ingestor>,
        extractor: Arc<dyn Extractor>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            ingestor,
            extractor,
            retry: None,
            progress: None,
            timeouts,
        }
    }

    pub fn with_retry(mut self, retry: Option<Arc<RetryManager>>) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_progress(mut self, progress: Option<Arc<ProgressTracker>>) -> Self {
        self.progress = progress;
        self
    }

    /// Process `path`, turning any step failure into a FAILED result.
    pub async fn process(
        &self,
        index: usize,
        path: &Path,
        template: &ExtractionTemplate,
    ) -> ExtractionResult {
        let started = Instant::now();
        match self.run(index, path, template).await {
            Ok(result) => result,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "File processing failed");
                ExtractionResult::failed(
                    path.display().to_string(),
                    e.to_string(),
                    started.elapsed().as_secs_f64(),
                )
            }
        }
    }

    /// Process `path`, returning the error of the first step that fails.
    pub async fn run(
        &self,
        index: usize,
        path: &Path,
        template: &ExtractionTemplate,
    ) -> Result<ExtractionResult, ProcessingError> {
        let started = Instant::now();
        let file = path.display().to_string();
        debug!(%file, index, "Processing file");

        self.report(index, &file, ProcessingPhase::Ingestion, 0.0);
        let step = Instant::now();
        let text = self
            .run_step(INGESTION_OPERATION, self.timeouts.ingestion(), || {
                self.ingestor.ingest(path)
            })
            .await
            .inspect_err(|e| self.record_failure(&file, ProcessingPhase::Ingestion, step, e))?;
        if text.trim().is_empty() {
            let e = ProcessingError::EmptyContent(file.clone());
            self.record_failure(&file, ProcessingPhase::Ingestion, step, &e);
            return Err(e);
        }
        self.record(ProcessingRecord::new(
            file.as_str(),
            ProcessingPhase::Ingestion,
            step.elapsed().as_secs_f64(),
            true,
        ));
        self.report(index, &file, ProcessingPhase::Ocr, 1.0);

        self.report(index, &file, ProcessingPhase::Extraction, 0.0);
        let step = Instant::now();
        let extraction = self
            .run_step(EXTRACTION_OPERATION, self.timeouts.extraction(), || {
                self.extractor.extract(&text, template)
            })
            .await
            .inspect_err(|e| self.record_failure(&file, ProcessingPhase::Extraction, step, e))?;
        let raw_scores: Vec<f64> = extraction.confidences.values().copied().collect();
        self.record(
            ProcessingRecord::new(
                file.as_str(),
                ProcessingPhase::Extraction,
                step.elapsed().as_secs_f64(),
                true,
            )
            .with_fields(extraction.fields.len(), raw_scores),
        );

        self.report(index, &file, ProcessingPhase::Validation, 0.5);
        let step = Instant::now();
        let (extracted_data, confidence_scores, warnings) = validate(template, extraction);
        for warning in &warnings {
            debug!(%file, %warning, "Validation warning");
        }
        self.record(
            ProcessingRecord::new(
                file.as_str(),
                ProcessingPhase::Validation,
                step.elapsed().as_secs_f64(),
                true,
            )
            .with_fields(
                extracted_data.len(),
                confidence_scores.values().copied().collect(),
            ),
        );
        self.report(index, &file, ProcessingPhase::Validation, 1.0);

        Ok(ExtractionResult {
            source_file: file,
            extracted_data,
            confidence_scores,
            processing_time: started.elapsed().as_secs_f64(),
            errors: Vec::new(),
            warnings,
            status: ProcessingStatus::Completed,
        })
    }

    /// One step: every attempt is bounded by `limit`, retried when enabled.
    async fn run_step<T, F, Fut>(
        &self,
        operation: &str,
        limit: Duration,
        mut step: F,
    ) -> Result<T, ProcessingError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProcessingError>>,
    {
        let mut attempt = move || {
            let fut = step();
            async move {
                match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(ProcessingError::Timeout(format!(
                        "{operation} exceeded {}s",
                        limit.as_secs()
                    ))),
                }
            }
        };

        match &self.retry {
            Some(retry) => retry.execute_with_retry(operation, attempt).await,
            None => attempt().await,
        }
    }

    fn report(&self, index: usize, file: &str, phase: ProcessingPhase, fraction: f64) {
        if let Some(progress) = &self.progress {
            progress.update_file_progress(index, file, phase, fraction);
        }
    }

    fn record(&self, record: ProcessingRecord) {
        if let Some(progress) = &self.progress {
            progress.record_completion(record);
        }
    }

    fn record_failure(
        &self,
        file: &str,
        phase: ProcessingPhase,
        started: Instant,
        error: &ProcessingError,
    ) {
        self.record(
            ProcessingRecord::new(file, phase, started.elapsed().as_secs_f64(), false)
                .with_error(error.to_string()),
        );
    }
}

type Validated = (
    serde_json::Map<String, serde_json::Value>,
    BTreeMap<String, f64>,
    Vec<String>,
);

/// Clamp confidences to [0, 1] and warn about missing required fields.
fn validate(template: &ExtractionTemplate, extraction: Extraction) -> Validated {
    let Extraction {
        fields,
        mut confidences,
    } = extraction;

    for score in confidences.values_mut() {
        *score = if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        };
    }

    let warnings = template
        .required_fields()
        .filter(|field| fields.get(&field.name).is_none_or(is_blank))
        .map(|field| format!("missing required field: {}", field.name))
        .collect();

    (fields, confidences, warnings)
}

/// Runs queued jobs through a [`FilePipeline`].
pub struct PipelineJobExecutor {
    pipeline: Arc<FilePipeline>,
    template: Arc<ExtractionTemplate>,
    /// Added to `batch_index` so resumed batches report absolute positions.
    index_offset: usize,
}

impl PipelineJobExecutor {
    pub fn new(
        pipeline: Arc<FilePipeline>,
        template: Arc<ExtractionTemplate>,
        index_offset: usize,
    ) -> Self {
        Self {
            pipeline,
            template,
            index_offset,
        }
    }
}

#[async_trait]
impl JobExecutor for PipelineJobExecutor {
    async fn execute(
        &self,
        job: &ProcessingJob,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ProcessingError> {
        if cancel.is_cancelled() {
            return Err(ProcessingError::Cancelled);
        }
        let index = job
            .metadata
            .get("batch_index")
            .and_then(|v| v.as_u64())
            .map(|i| i as usize + self.index_offset)
            .unwrap_or(self.index_offset);

        let result = self.pipeline.run(index, &job.file_path, &self.template).await?;
        serde_json::to_value(result).map_err(|e| ProcessingError::Other(e.to_string()))
    }
}
