//! Batch orchestration.
//!
//! The [`Orchestrator`] drives one batch at a time on a spawned worker task.
//! Files run through the [`FilePipeline`] either one after another or, when
//! the intelligent queue is enabled, as jobs on the [`ProcessingQueue`].
//! Enhanced components (retry, resource monitoring, detailed progress and
//! state preservation) are created from the [`EngineConfig`] toggles and are
//! optional everywhere.

mod collaborators;
mod model;
mod pipeline;

pub use collaborators::{Aggregator, Extractor, Ingestor, SummaryAggregator};
pub use model::{
    Extraction, ExtractionField, ExtractionResult, ExtractionTemplate, FieldType,
    ProcessingSession, ProcessingStatus,
};
pub use pipeline::{EXTRACTION_OPERATION, FilePipeline, INGESTION_OPERATION, PipelineJobExecutor};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cancellation::{
    CancellationManager, CancellationStatus, ProcessingState, SavedStateInfo,
};
use crate::config::EngineConfig;
use crate::progress::{ProcessingPhase, ProcessingSummary, ProgressTracker};
use crate::queue::{JobPriority, JobStatus, ProcessingQueue, QueueStatistics};
use crate::resource::{ResourceEvent, ResourceMonitor, ResourceSummary};
use crate::retry::{RetryManager, RetryStatistics};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    FileCompleted {
        index: usize,
        result: ExtractionResult,
    },
    SessionUpdated {
        session_id: String,
        completed: usize,
        total: usize,
    },
    /// Sent exactly once per batch, cancelled or not.
    ProcessingCompleted(Box<ProcessingSession>),
    /// A failure not tied to a single file; the batch stops early.
    ProcessingError(String),
}

/// Merged statistics of every active component.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatistics {
    pub processing: bool,
    pub active_features: Vec<&'static str>,
    pub session_id: Option<String>,
    pub processed_files: usize,
    pub retry: Option<RetryStatistics>,
    pub resources: Option<ResourceSummary>,
    pub progress: Option<ProcessingSummary>,
    pub cancellation: Option<CancellationStatus>,
    pub queue: Option<QueueStatistics>,
}

/// Everything the worker task needs for one batch.
struct Batch {
    session_id: String,
    /// Every input file; processing starts at `offset`.
    files: Vec<PathBuf>,
    offset: usize,
    template: Arc<ExtractionTemplate>,
    token: CancellationToken,
}

pub struct Orchestrator {
    config: EngineConfig,
    ingestor: Arc<dyn Ingestor>,
    extractor: Arc<dyn Extractor>,
    aggregator: Arc<dyn Aggregator>,
    retry: Option<Arc<RetryManager>>,
    resources: Option<Arc<ResourceMonitor>>,
    progress: Option<Arc<ProgressTracker>>,
    cancellation: Option<Arc<CancellationManager>>,
    queue: Option<Arc<ProcessingQueue>>,
    /// Used when enhanced cancellation is off.
    basic_cancel: Mutex<CancellationToken>,
    processing: AtomicBool,
    session: Mutex<Option<ProcessingSession>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        ingestor: Arc<dyn Ingestor>,
        extractor: Arc<dyn Extractor>,
    ) -> Result<Self> {
        config.validate()?;
        for warning in config.warnings() {
            warn!("{warning}");
        }

        let retry = config
            .retry_active()
            .then(|| RetryManager::new(config.retry.clone()))
            .transpose()?
            .map(Arc::new);
        let resources = config
            .resource_monitoring_active()
            .then(|| ResourceMonitor::new(config.resources.clone()))
            .transpose()?
            .map(Arc::new);
        let progress = config
            .detailed_progress_active()
            .then(|| ProgressTracker::new(config.progress.clone()))
            .transpose()?
            .map(Arc::new);
        let cancellation = config
            .enhanced_cancellation_active()
            .then(|| CancellationManager::new(config.cancellation.clone()))
            .transpose()?
            .map(Arc::new);
        let queue = config
            .intelligent_queue_active()
            .then(|| ProcessingQueue::new(config.queue.clone()))
            .transpose()?
            .map(Arc::new);

        info!(features = ?config.active_features(), "Orchestrator initialized");

        let (event_tx, _) = broadcast::channel(256);
        Ok(Self {
            config,
            ingestor,
            extractor,
            aggregator: Arc::new(SummaryAggregator),
            retry,
            resources,
            progress,
            cancellation,
            queue,
            basic_cancel: Mutex::new(CancellationToken::new()),
            processing: AtomicBool::new(false),
            session: Mutex::new(None),
            worker: Mutex::new(None),
            event_tx,
        })
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn Aggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Replace the resource monitor, e.g. one built on a custom metrics source.
    pub fn with_resource_monitor(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.resources = Some(monitor);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    pub fn retry_manager(&self) -> Option<&Arc<RetryManager>> {
        self.retry.as_ref()
    }

    pub fn resource_monitor(&self) -> Option<&Arc<ResourceMonitor>> {
        self.resources.as_ref()
    }

    pub fn progress_tracker(&self) -> Option<&Arc<ProgressTracker>> {
        self.progress.as_ref()
    }

    pub fn cancellation_manager(&self) -> Option<&Arc<CancellationManager>> {
        self.cancellation.as_ref()
    }

    pub fn processing_queue(&self) -> Option<&Arc<ProcessingQueue>> {
        self.queue.as_ref()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn current_session(&self) -> Option<ProcessingSession> {
        self.session.lock().clone()
    }

    /// Start processing `files` in the background and return the session id.
    pub fn start(
        self: &Arc<Self>,
        files: Vec<PathBuf>,
        template: ExtractionTemplate,
    ) -> Result<String> {
        self.begin(files, template, None)
    }

    /// Continue a saved batch from its next unprocessed file.
    pub fn resume(self: &Arc<Self>, state: ProcessingState) -> Result<String> {
        state.validate()?;
        let template: ExtractionTemplate = serde_json::from_value(state.template_data.clone())?;
        self.begin(state.file_list.clone(), template, Some(state))
    }

    pub async fn load_and_resume(self: &Arc<Self>, path: &Path) -> Result<String> {
        let cancellation = self.cancellation.as_ref().ok_or_else(|| {
            Error::config("state preservation is disabled; enable enhanced cancellation")
        })?;
        let state = cancellation.load_state(path).await?;
        info!(
            path = %path.display(),
            progress = %state.progress_summary(),
            "Resuming saved state"
        );
        self.resume(state)
    }

    pub async fn available_saved_states(&self) -> Result<Vec<SavedStateInfo>> {
        match &self.cancellation {
            Some(cancellation) => cancellation.available_states().await,
            None => Ok(Vec::new()),
        }
    }

    /// Wait for the running batch to finish and return its session.
    pub async fn wait(&self) -> Option<ProcessingSession> {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(error = %e, "Batch worker terminated abnormally");
            self.processing.store(false, Ordering::SeqCst);
        }
        self.current_session()
    }

    /// Stop after the file in flight. Returns `false` when nothing is running
    /// or a cancellation was already requested.
    pub async fn cancel(&self, save_state: bool) -> bool {
        if !self.is_processing() {
            debug!("Cancel requested with no batch running");
            return false;
        }
        match &self.cancellation {
            Some(cancellation) => cancellation.request_cancellation(save_state, false).await,
            None => self.cancel_basic(),
        }
    }

    /// Cancel without running cleanup tasks.
    pub async fn cancel_immediate(&self) -> bool {
        if !self.is_processing() {
            return false;
        }
        match &self.cancellation {
            Some(cancellation) => {
                cancellation
                    .request_cancellation(self.config.cancellation.save_by_default, true)
                    .await
            }
            None => self.cancel_basic(),
        }
    }

    fn cancel_basic(&self) -> bool {
        let token = self.basic_cancel.lock().clone();
        if token.is_cancelled() {
            return false;
        }
        token.cancel();
        info!("Cancellation requested");
        true
    }

    pub fn statistics(&self) -> EngineStatistics {
        let (session_id, processed_files) = match &*self.session.lock() {
            Some(session) => (Some(session.session_id.clone()), session.results.len()),
            None => (None, 0),
        };
        EngineStatistics {
            processing: self.is_processing(),
            active_features: self.config.active_features(),
            session_id,
            processed_files,
            retry: self.retry.as_ref().map(|r| r.statistics()),
            resources: self.resources.as_ref().and_then(|r| r.resource_summary()),
            progress: self.progress.as_ref().and_then(|p| p.processing_summary()),
            cancellation: self.cancellation.as_ref().map(|c| c.status()),
            queue: self.queue.as_ref().map(|q| q.statistics()),
        }
    }

    fn begin(
        self: &Arc<Self>,
        files: Vec<PathBuf>,
        template: ExtractionTemplate,
        resume: Option<ProcessingState>,
    ) -> Result<String> {
        template.validate()?;
        let template_data = serde_json::to_value(&template)?;

        let (session_id, batch_id, offset, previous, mut metadata) = match resume {
            Some(state) => {
                let previous: Vec<ExtractionResult> = state
                    .partial_results
                    .iter()
                    .filter_map(|value| {
                        serde_json::from_value(value.clone())
                            .inspect_err(|e| warn!(error = %e, "Skipping unreadable partial result"))
                            .ok()
                    })
                    .collect();
                let mut metadata = state.processing_metadata;
                metadata.insert("resumed_from_index".into(), json!(state.current_file_index));
                (
                    state.session_id,
                    state.batch_id,
                    state.current_file_index,
                    previous,
                    metadata,
                )
            }
            None => {
                let session_id = format!(
                    "session_{}_{}",
                    Utc::now().format("%Y%m%d_%H%M%S"),
                    &uuid::Uuid::new_v4().simple().to_string()[..8]
                );
                let batch_id = format!("{session_id}_batch");
                (session_id, batch_id, 0, Vec::new(), serde_json::Map::new())
            }
        };
        metadata.insert("start_time".into(), json!(Utc::now().to_rfc3339()));
        metadata.insert(
            "enhanced_mode".into(),
            json!(self.config.enhanced_mode_enabled),
        );
        metadata.insert(
            "active_features".into(),
            json!(self.config.active_features()),
        );

        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }

        let token = match &self.cancellation {
            Some(cancellation) => {
                cancellation.reset();
                let mut state =
                    ProcessingState::new(session_id.clone(), batch_id.clone(), files.clone())
                        .with_template(template_data);
                state.partial_results = previous
                    .iter()
                    .filter_map(|result| serde_json::to_value(result).ok())
                    .collect();
                state.processing_metadata = metadata;
                state.advance_to(offset, ProcessingPhase::Ingestion);
                cancellation.update_state(state);
                cancellation.start_auto_save();
                cancellation.session_token()
            }
            None => {
                let token = CancellationToken::new();
                *self.basic_cancel.lock() = token.clone();
                token
            }
        };

        let remaining = files.len().saturating_sub(offset);
        info!(
            %session_id,
            total_files = files.len(),
            remaining,
            queued = self.queue.is_some(),
            "Starting batch"
        );

        *self.session.lock() = Some(ProcessingSession {
            session_id: session_id.clone(),
            batch_id,
            template: template.clone(),
            files: files.clone(),
            results: previous,
            summary_stats: serde_json::Value::Null,
            started_at: Utc::now(),
            completed_at: None,
            cancelled: false,
        });

        if let Some(progress) = &self.progress {
            let names: Vec<String> = files
                .iter()
                .skip(offset)
                .map(|p| p.display().to_string())
                .collect();
            progress.start_batch(remaining, &names);
        }
        if let Some(resources) = &self.resources {
            let workers = self
                .queue
                .as_ref()
                .map(|q| q.worker_count())
                .unwrap_or(1);
            resources.set_worker_count(workers);
            resources.start();
        }

        let batch = Batch {
            session_id: session_id.clone(),
            files,
            offset,
            template: Arc::new(template),
            token,
        };
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move { orchestrator.run_batch(batch).await });
        *self.worker.lock() = Some(handle);

        Ok(session_id)
    }

    async fn run_batch(self: Arc<Self>, batch: Batch) {
        let forwarder = CancellationToken::new();
        self.spawn_resource_forwarder(forwarder.clone());

        let pipeline = Arc::new(
            FilePipeline::new(
                Arc::clone(&self.ingestor),
                Arc::clone(&self.extractor),
                self.config.timeouts.clone(),
            )
            .with_retry(self.retry.clone())
            .with_progress(self.progress.clone()),
        );

        let outcome = match &self.queue {
            Some(queue) => self.run_queued(queue, &pipeline, &batch).await,
            None => {
                self.run_sequential(&pipeline, &batch).await;
                Ok(())
            }
        };
        if let Err(e) = outcome {
            error!(session_id = %batch.session_id, error = %e, "Batch processing failed");
            let _ = self
                .event_tx
                .send(OrchestratorEvent::ProcessingError(e.to_string()));
        }

        forwarder.cancel();
        self.finalize(batch.token.is_cancelled());
    }

    async fn run_sequential(&self, pipeline: &FilePipeline, batch: &Batch) {
        for (index, path) in batch.files.iter().enumerate().skip(batch.offset) {
            if batch.token.is_cancelled() {
                info!(
                    session_id = %batch.session_id,
                    index,
                    "Cancelled, not starting remaining files"
                );
                break;
            }
            let result = pipeline.process(index, path, &batch.template).await;
            self.record_result(index, result);
        }
    }

    async fn run_queued(
        &self,
        queue: &Arc<ProcessingQueue>,
        pipeline: &Arc<FilePipeline>,
        batch: &Batch,
    ) -> Result<()> {
        let remaining = &batch.files[batch.offset.min(batch.files.len())..];
        if remaining.is_empty() {
            return Ok(());
        }

        let mut metadata = serde_json::Map::new();
        metadata.insert("session_id".into(), json!(batch.session_id));
        let batch_id = queue.add_batch(remaining, None, JobPriority::Normal, metadata)?;
        let executor = Arc::new(PipelineJobExecutor::new(
            Arc::clone(pipeline),
            Arc::clone(&batch.template),
            batch.offset,
        ));
        queue.start(executor);

        // Cancelling the session cancels whatever is still queued.
        let done = CancellationToken::new();
        {
            let queue = Arc::clone(queue);
            let token = batch.token.clone();
            let done = done.clone();
            let batch_id = batch_id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {
                        let cancelled = queue.cancel_batch(&batch_id);
                        info!(%batch_id, cancelled, "Cancelled queued jobs");
                    }
                    _ = done.cancelled() => {}
                }
            });
        }

        for (i, path) in remaining.iter().enumerate() {
            let index = batch.offset + i;
            let job_id = format!("{batch_id}_job_{i}");
            let Some(job) = queue.wait_for_job(&job_id).await else {
                warn!(%job_id, "Queued job disappeared");
                break;
            };

            let elapsed = job.processing_time().unwrap_or(0.0);
            let source = path.display().to_string();
            let result = match job.status {
                JobStatus::Completed => match job.result.map(serde_json::from_value::<ExtractionResult>) {
                    Some(Ok(result)) => result,
                    Some(Err(e)) => {
                        ExtractionResult::failed(source, format!("unreadable job result: {e}"), elapsed)
                    }
                    None => ExtractionResult::failed(source, "job produced no result", elapsed),
                },
                JobStatus::Failed => ExtractionResult::failed(
                    source,
                    job.error.unwrap_or_else(|| "job failed".to_string()),
                    elapsed,
                ),
                _ => {
                    // Later files stay unprocessed so a resume picks them up.
                    debug!(%job_id, "Job cancelled, stopping collection");
                    break;
                }
            };
            self.record_result(index, result);
        }

        done.cancel();
        queue.stop(true).await;
        Ok(())
    }

    fn record_result(&self, index: usize, result: ExtractionResult) {
        let update = {
            let mut session = self.session.lock();
            session.as_mut().map(|session| {
                session.results.push(result.clone());
                (
                    session.session_id.clone(),
                    session.results.len(),
                    session.files.len(),
                )
            })
        };
        let Some((session_id, completed, total)) = update else {
            return;
        };

        if let Some(cancellation) = &self.cancellation
            && let Some(mut state) = cancellation.current_state()
        {
            match serde_json::to_value(&result) {
                Ok(value) => state.partial_results.push(value),
                Err(e) => warn!(error = %e, "Failed to serialize result for state"),
            }
            state.advance_to(index + 1, ProcessingPhase::Ingestion);
            cancellation.update_state(state);
        }

        debug!(
            %session_id,
            index,
            file = %result.source_file,
            status = %result.status,
            "File finished"
        );
        let _ = self
            .event_tx
            .send(OrchestratorEvent::FileCompleted { index, result });
        let _ = self.event_tx.send(OrchestratorEvent::SessionUpdated {
            session_id,
            completed,
            total,
        });
    }

    fn finalize(&self, cancelled: bool) {
        if let Some(progress) = &self.progress {
            progress.stop();
        }
        if let Some(resources) = &self.resources {
            resources.stop();
        }
        if let Some(cancellation) = &self.cancellation {
            cancellation.stop_auto_save();
        }

        let session = {
            let mut guard = self.session.lock();
            guard.as_mut().map(|session| {
                session.completed_at = Some(Utc::now());
                session.cancelled = cancelled;
                match self.aggregator.aggregate(&session.template, &session.results) {
                    Ok(summary) => session.summary_stats = summary,
                    Err(e) => warn!(error = %e, "Result aggregation failed"),
                }
                session.clone()
            })
        };
        self.processing.store(false, Ordering::SeqCst);

        if let Some(session) = session {
            info!(
                session_id = %session.session_id,
                results = session.results.len(),
                successful = session.successful_count(),
                failed = session.failed_count(),
                cancelled,
                "Batch finished"
            );
            let _ = self
                .event_tx
                .send(OrchestratorEvent::ProcessingCompleted(Box::new(session)));
        }
    }

    /// Feed resource samples into progress snapshots and apply scaling
    /// advice to the queue until `stop` fires.
    fn spawn_resource_forwarder(&self, stop: CancellationToken) {
        let Some(resources) = self.resources.clone() else {
            return;
        };
        let mut events = resources.subscribe();
        let progress = self.progress.clone();
        let queue = self.queue.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(ResourceEvent::MetricsUpdated(metrics)) => {
                            if let Some(progress) = &progress {
                                progress.update_resource_usage(
                                    metrics.memory_usage_mb,
                                    metrics.cpu_usage_percent,
                                );
                            }
                        }
                        Ok(ResourceEvent::ScalingRecommended { action, recommended, .. }) => {
                            if let Some(queue) = &queue {
                                let workers = queue.set_worker_count(recommended);
                                resources.set_worker_count(workers);
                                info!(%action, workers, "Applied resource scaling advice");
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Resource events lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationConfig;
    use crate::error::ProcessingError;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoIngestor;

    #[async_trait]
    impl Ingestor for EchoIngestor {
        async fn ingest(&self, path: &Path) -> std::result::Result<String, ProcessingError> {
            Ok(format!("Number: {}", path.display()))
        }
    }

    /// Fails permanently for files whose name contains `bad`.
    struct PickyExtractor {
        delay: Duration,
    }

    #[async_trait]
    impl Extractor for PickyExtractor {
        async fn extract(
            &self,
            text: &str,
            _template: &ExtractionTemplate,
        ) -> std::result::Result<Extraction, ProcessingError> {
            tokio::time::sleep(self.delay).await;
            if text.contains("bad") {
                return Err(ProcessingError::Format("unsupported layout".into()));
            }
            let mut extraction = Extraction::default();
            extraction.fields.insert("number".into(), json!(text));
            extraction.confidences.insert("number".into(), 0.9);
            Ok(extraction)
        }
    }

    fn template() -> ExtractionTemplate {
        ExtractionTemplate::new(
            "invoice",
            vec![ExtractionField::new("number", FieldType::Text)],
        )
    }

    fn config(state_dir: &Path) -> EngineConfig {
        let mut config = EngineConfig {
            resource_monitoring_enabled: false,
            ..Default::default()
        };
        config.retry = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false);
        config.cancellation = CancellationConfig::default().with_state_directory(state_dir);
        config
    }

    fn orchestrator(config: EngineConfig, delay: Duration) -> Arc<Orchestrator> {
        Arc::new(
            Orchestrator::new(
                config,
                Arc::new(EchoIngestor),
                Arc::new(PickyExtractor { delay }),
            )
            .unwrap(),
        )
    }

    fn files(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[tokio::test]
    async fn test_failed_file_does_not_stop_batch() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(config(dir.path()), Duration::ZERO);

        orchestrator
            .start(files(&["a.txt", "bad.txt", "c.txt"]), template())
            .unwrap();
        let session = orchestrator.wait().await.unwrap();

        assert_eq!(session.results.len(), 3);
        assert_eq!(session.successful_count(), 2);
        assert_eq!(session.results[1].status, ProcessingStatus::Failed);
        assert!(session.results[1].errors[0].contains("unsupported layout"));
        assert_eq!(session.summary_stats["successful"], 2);
        assert!(!orchestrator.is_processing());
    }

    #[tokio::test]
    async fn test_rejects_second_start() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(config(dir.path()), Duration::from_millis(50));

        orchestrator.start(files(&["a.txt"]), template()).unwrap();
        assert!(matches!(
            orchestrator.start(files(&["b.txt"]), template()),
            Err(Error::AlreadyRunning)
        ));
        orchestrator.wait().await;

        orchestrator.start(files(&["b.txt"]), template()).unwrap();
        let session = orchestrator.wait().await.unwrap();
        assert_eq!(session.results[0].source_file, "b.txt");
    }

    #[tokio::test]
    async fn test_invalid_template_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(config(dir.path()), Duration::ZERO);
        let empty = ExtractionTemplate::new("empty", Vec::new());

        assert!(matches!(
            orchestrator.start(files(&["a.txt"]), empty),
            Err(Error::Validation(_))
        ));
        assert!(!orchestrator.is_processing());
    }

    #[tokio::test]
    async fn test_basic_cancel_without_enhanced_mode() {
        let mut config = config(Path::new("unused"));
        config.disable_enhanced_mode();
        let orchestrator = orchestrator(config, Duration::from_millis(100));
        assert!(orchestrator.cancellation_manager().is_none());

        orchestrator
            .start(files(&["a.txt", "b.txt", "c.txt", "d.txt"]), template())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(orchestrator.cancel(true).await);
        assert!(!orchestrator.cancel(true).await);

        let session = orchestrator.wait().await.unwrap();
        assert!(session.cancelled);
        assert_eq!(session.results.len(), 1);
        assert!(orchestrator.available_saved_states().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_statistics_reflect_features() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(config(dir.path()), Duration::ZERO);
        orchestrator.start(files(&["a.txt"]), template()).unwrap();
        orchestrator.wait().await;

        let stats = orchestrator.statistics();
        assert!(!stats.processing);
        assert_eq!(stats.processed_files, 1);
        assert!(stats.retry.is_some());
        assert!(stats.resources.is_none());
        assert!(stats.queue.is_none());
        assert_eq!(
            stats.progress.map(|p| p.batch_progress),
            Some(1.0)
        );
    }
}
