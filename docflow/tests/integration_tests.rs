//! End-to-end batch runs with in-memory collaborators.

use async_trait::async_trait;
use docflow::cancellation::CancellationConfig;
use docflow::config::EngineConfig;
use docflow::error::ProcessingError;
use docflow::orchestrator::{
    Extraction, ExtractionField, ExtractionTemplate, Extractor, FieldType, Ingestor,
    Orchestrator, OrchestratorEvent, ProcessingStatus,
};
use docflow::queue::QueueConfig;
use docflow::retry::RetryPolicy;
use docflow::{Error, Result};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Returns the file name as the document text.
struct NameIngestor;

#[async_trait]
impl Ingestor for NameIngestor {
    async fn ingest(&self, path: &Path) -> std::result::Result<String, ProcessingError> {
        Ok(format!("Invoice {}", path.display()))
    }
}

/// Rejects documents mentioning `rejected` with an HTTP 422 and counts calls
/// per document.
struct ScriptedExtractor {
    delay: Duration,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedExtractor {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: Mutex::new(HashMap::new()),
        })
    }

    fn calls_for(&self, text: &str) -> u32 {
        self.calls.lock().get(text).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(
        &self,
        text: &str,
        _template: &ExtractionTemplate,
    ) -> std::result::Result<Extraction, ProcessingError> {
        *self.calls.lock().entry(text.to_string()).or_default() += 1;
        tokio::time::sleep(self.delay).await;
        if text.contains("rejected") {
            return Err(ProcessingError::http(422, "document rejected by provider"));
        }

        let mut extraction = Extraction::default();
        extraction.fields.insert("number".into(), json!(text));
        extraction.confidences.insert("number".into(), 0.95);
        Ok(extraction)
    }
}

fn template() -> ExtractionTemplate {
    ExtractionTemplate::new(
        "invoice",
        vec![
            ExtractionField::new("number", FieldType::Text),
            ExtractionField::new("total", FieldType::Currency).optional(),
        ],
    )
}

fn test_config(state_dir: &Path) -> EngineConfig {
    let mut config = EngineConfig {
        resource_monitoring_enabled: false,
        ..Default::default()
    };
    config.retry = RetryPolicy::default()
        .with_base_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(10))
        .with_jitter(false);
    config.cancellation = CancellationConfig::default().with_state_directory(state_dir);
    config
}

fn setup(config: EngineConfig, extractor: Arc<ScriptedExtractor>) -> Arc<Orchestrator> {
    Arc::new(
        Orchestrator::new(config, Arc::new(NameIngestor), extractor)
            .expect("Failed to create orchestrator"),
    )
}

fn files(names: &[&str]) -> Vec<PathBuf> {
    names.iter().map(PathBuf::from).collect()
}

fn source_files(results: &[docflow::orchestrator::ExtractionResult]) -> Vec<&str> {
    results.iter().map(|r| r.source_file.as_str()).collect()
}

mod batch_tests {
    use super::*;

    #[tokio::test]
    async fn test_permanent_extraction_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = ScriptedExtractor::new(Duration::ZERO);
        let orchestrator = setup(test_config(dir.path()), extractor.clone());
        let mut events = orchestrator.subscribe();

        orchestrator
            .start(files(&["a.pdf", "rejected.pdf", "c.pdf"]), template())
            .expect("Failed to start batch");
        let session = orchestrator.wait().await.expect("No session");

        assert_eq!(session.results.len(), 3);
        assert_eq!(session.successful_count(), 2);
        assert_eq!(session.results[1].status, ProcessingStatus::Failed);
        assert!(session.results[1].errors[0].contains("document rejected by provider"));
        assert!(!session.cancelled);

        // Permanent errors are never retried.
        assert_eq!(extractor.calls_for("Invoice rejected.pdf"), 1);

        let mut completed = 0;
        let mut files_completed = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                OrchestratorEvent::ProcessingCompleted(session) => {
                    completed += 1;
                    assert_eq!(session.results.len(), 3);
                }
                OrchestratorEvent::FileCompleted { .. } => files_completed += 1,
                _ => {}
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(files_completed, 3);

        let stats = orchestrator.statistics();
        let retry = stats.retry.expect("retry enabled");
        assert_eq!(retry.total_operations, 1);
        assert_eq!(retry.total_attempts, 1);
    }

    #[tokio::test]
    async fn test_queue_mode_collects_results_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.intelligent_queue_enabled = true;
        config.queue = QueueConfig::default()
            .with_workers(3, 1, 4)
            .with_auto_scaling(false);
        let extractor = ScriptedExtractor::new(Duration::from_millis(20));
        let orchestrator = setup(config, extractor);
        assert!(orchestrator.processing_queue().is_some());

        orchestrator
            .start(
                files(&["a.pdf", "b.pdf", "rejected.pdf", "d.pdf", "e.pdf"]),
                template(),
            )
            .expect("Failed to start batch");
        let session = orchestrator.wait().await.expect("No session");

        assert_eq!(
            source_files(&session.results),
            vec!["a.pdf", "b.pdf", "rejected.pdf", "d.pdf", "e.pdf"]
        );
        assert_eq!(session.failed_count(), 1);
        assert!(session.results[2].errors[0].contains("HTTP 422"));

        let queue = orchestrator.statistics().queue.expect("queue enabled");
        assert_eq!(queue.total_jobs_processed, 5);
        assert_eq!(queue.failed_jobs, 1);
    }

    #[tokio::test]
    async fn test_empty_batch_completes() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = setup(test_config(dir.path()), ScriptedExtractor::new(Duration::ZERO));

        orchestrator.start(Vec::new(), template()).unwrap();
        let session = orchestrator.wait().await.unwrap();
        assert!(session.results.is_empty());
        assert_eq!(session.summary_stats["total_files"], 0);
    }
}

mod cancellation_tests {
    use super::*;

    async fn wait_for_first_file(events: &mut tokio::sync::broadcast::Receiver<OrchestratorEvent>) {
        while let Ok(event) = events.recv().await {
            if let OrchestratorEvent::FileCompleted { index: 0, .. } = event {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_saves_state_and_resume_finishes_batch() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = setup(
            test_config(dir.path()),
            ScriptedExtractor::new(Duration::from_millis(50)),
        );
        let mut events = orchestrator.subscribe();

        let session_id = orchestrator
            .start(files(&["a.pdf", "b.pdf", "c.pdf", "d.pdf"]), template())
            .unwrap();
        wait_for_first_file(&mut events).await;

        assert!(orchestrator.cancel(true).await);
        assert!(!orchestrator.cancel(true).await);

        let cancelled = orchestrator.wait().await.unwrap();
        assert!(cancelled.cancelled);
        assert!((1..=2).contains(&cancelled.results.len()));

        let saved = orchestrator.available_saved_states().await.unwrap();
        assert_eq!(saved.len(), 1);
        let metadata = saved[0].metadata.as_ref().expect("metadata");
        assert_eq!(metadata.session_id, session_id);
        assert_eq!(metadata.remaining_files, 3);

        let resumed_id = orchestrator.load_and_resume(&saved[0].path).await.unwrap();
        assert_eq!(resumed_id, session_id);
        let session = orchestrator.wait().await.unwrap();

        assert!(!session.cancelled);
        assert_eq!(
            source_files(&session.results),
            vec!["a.pdf", "b.pdf", "c.pdf", "d.pdf"]
        );
        assert_eq!(session.successful_count(), 4);
    }

    #[tokio::test]
    async fn test_cancel_immediate_skips_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = setup(
            test_config(dir.path()),
            ScriptedExtractor::new(Duration::from_millis(50)),
        );
        let manager = orchestrator.cancellation_manager().unwrap().clone();
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        manager.add_cleanup_task(docflow::cancellation::CleanupTask::new("flag", 1, move || {
            let flag = flag.clone();
            async move {
                *flag.lock() = true;
                anyhow::Ok(())
            }
        }));

        orchestrator
            .start(files(&["a.pdf", "b.pdf", "c.pdf"]), template())
            .unwrap();
        assert!(orchestrator.cancel_immediate().await);
        let session = orchestrator.wait().await.unwrap();

        assert!(session.cancelled);
        assert!(session.results.len() < 3);
        assert!(!*ran.lock());
    }

    #[tokio::test]
    async fn test_cancel_without_running_batch() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = setup(test_config(dir.path()), ScriptedExtractor::new(Duration::ZERO));
        assert!(!orchestrator.cancel(true).await);
    }

    #[tokio::test]
    async fn test_resume_requires_state_preservation() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.enhanced_cancellation_enabled = false;
        let orchestrator = setup(config, ScriptedExtractor::new(Duration::ZERO));

        let result = orchestrator
            .load_and_resume(&dir.path().join("processing_state_x_1.json"))
            .await;
        assert!(matches!(result, Err(Error::Configuration(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = setup(test_config(dir.path()), ScriptedExtractor::new(Duration::ZERO));

        let result = orchestrator
            .load_and_resume(&dir.path().join("processing_state_missing_1.json"))
            .await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert!(!orchestrator.is_processing());
    }
}
