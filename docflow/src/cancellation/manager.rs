use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::ProcessingState;
use super::store::{SavedStateInfo, StateStore};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationConfig {
    /// Upper bound for running all cleanup tasks, in seconds.
    #[serde(default = "default_graceful_timeout_secs")]
    pub graceful_timeout_secs: u64,
    #[serde(default = "default_state_directory")]
    pub state_directory: PathBuf,
    #[serde(default = "default_max_state_files")]
    pub max_state_files: usize,
    /// Whether a cancellation saves state unless told otherwise.
    #[serde(default = "default_true")]
    pub save_by_default: bool,
    #[serde(default = "default_auto_save_interval_secs")]
    pub auto_save_interval_secs: u64,
    /// Timeout applied to cleanup tasks that don't set their own, in seconds.
    #[serde(default = "default_cleanup_task_timeout_secs")]
    pub cleanup_task_timeout_secs: u64,
}

fn default_graceful_timeout_secs() -> u64 {
    30
}

fn default_state_directory() -> PathBuf {
    PathBuf::from("processing_states")
}

fn default_max_state_files() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_auto_save_interval_secs() -> u64 {
    30
}

fn default_cleanup_task_timeout_secs() -> u64 {
    5
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_secs: default_graceful_timeout_secs(),
            state_directory: default_state_directory(),
            max_state_files: default_max_state_files(),
            save_by_default: default_true(),
            auto_save_interval_secs: default_auto_save_interval_secs(),
            cleanup_task_timeout_secs: default_cleanup_task_timeout_secs(),
        }
    }
}

impl CancellationConfig {
    pub fn with_state_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.state_directory = directory.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.graceful_timeout_secs < 1 {
            return Err(Error::config(
                "cancellation.graceful_timeout_secs must be at least 1",
            ));
        }
        if self.max_state_files < 1 {
            return Err(Error::config(
                "cancellation.max_state_files must be at least 1",
            ));
        }
        if self.auto_save_interval_secs < 1 || self.cleanup_task_timeout_secs < 1 {
            return Err(Error::config("cancellation intervals must be at least 1s"));
        }
        Ok(())
    }
}

pub type CleanupHandler = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Work run during a graceful cancellation. Higher priority runs first.
#[derive(Clone)]
pub struct CleanupTask {
    pub name: String,
    pub priority: i32,
    pub timeout: Option<Duration>,
    pub description: String,
    handler: CleanupHandler,
}

impl std::fmt::Debug for CleanupTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupTask")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl CleanupTask {
    pub fn new<F, Fut>(name: impl Into<String>, priority: i32, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            priority,
            timeout: None,
            description: String::new(),
            handler: Arc::new(move || handler().boxed()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone)]
pub enum CancellationEvent {
    Requested {
        save_state: bool,
        immediate: bool,
    },
    StateSaved {
        path: Option<PathBuf>,
        success: bool,
    },
    CleanupProgress {
        task: String,
        completed: usize,
        total: usize,
        success: bool,
    },
    CleanupCompleted {
        succeeded: usize,
        failed: usize,
    },
    /// Final outcome of a cancellation.
    Confirmed {
        success: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancellationStatus {
    pub requested: bool,
    pub in_progress: bool,
    pub cleanup_tasks: usize,
    pub executed_cleanup_tasks: Vec<String>,
    pub current_state_available: bool,
    pub state_directory: PathBuf,
    pub auto_save_running: bool,
}

struct Inner {
    in_progress: bool,
    current_state: Option<ProcessingState>,
    tasks: Vec<CleanupTask>,
    executed: Vec<String>,
    session_token: CancellationToken,
}

/// Decides when processing stops and coordinates the shutdown.
pub struct CancellationManager {
    config: CancellationConfig,
    store: StateStore,
    requested: AtomicBool,
    inner: Mutex<Inner>,
    auto_save: Mutex<Option<CancellationToken>>,
    event_tx: broadcast::Sender<CancellationEvent>,
}

impl CancellationManager {
    pub fn new(config: CancellationConfig) -> Result<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(64);
        let store = StateStore::new(&config.state_directory, config.max_state_files);

        Ok(Self {
            config,
            store,
            requested: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                in_progress: false,
                current_state: None,
                tasks: Vec::new(),
                executed: Vec::new(),
                session_token: CancellationToken::new(),
            }),
            auto_save: Mutex::new(None),
            event_tx,
        })
    }

    pub fn config(&self) -> &CancellationConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CancellationEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: CancellationEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Non-blocking check used at every safe point.
    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Token cancelled as soon as cancellation is requested in this session.
    pub fn session_token(&self) -> CancellationToken {
        self.inner.lock().session_token.clone()
    }

    /// Register a cleanup task, replacing any task of the same name.
    pub fn add_cleanup_task(&self, task: CleanupTask) {
        let mut inner = self.inner.lock();
        inner.tasks.retain(|t| t.name != task.name);
        debug!(task = %task.name, priority = task.priority, "Cleanup task registered");
        inner.tasks.push(task);
        // stable: equal priorities keep registration order
        inner.tasks.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn remove_cleanup_task(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.tasks.len();
        inner.tasks.retain(|t| t.name != name);
        inner.tasks.len() != before
    }

    pub fn update_state(&self, state: ProcessingState) {
        self.inner.lock().current_state = Some(state);
    }

    pub fn current_state(&self) -> Option<ProcessingState> {
        self.inner.lock().current_state.clone()
    }

    /// Request that processing stop.
    ///
    /// Returns `false` without doing anything when a cancellation was already
    /// requested in this session.
    pub async fn request_cancellation(&self, save_state: bool, immediate: bool) -> bool {
        if self.requested.swap(true, Ordering::SeqCst) {
            debug!("Cancellation already requested");
            return false;
        }

        let token = {
            let mut inner = self.inner.lock();
            inner.in_progress = true;
            inner.session_token.clone()
        };
        token.cancel();
        info!(save_state, immediate, "Cancellation requested");
        self.emit(CancellationEvent::Requested {
            save_state,
            immediate,
        });

        let state_saved = if save_state {
            match self.save_current_state().await {
                Ok(path) => {
                    let success = path.is_some();
                    self.emit(CancellationEvent::StateSaved { path, success });
                    success
                }
                Err(e) => {
                    error!(error = %e, "Failed to save processing state");
                    self.emit(CancellationEvent::StateSaved {
                        path: None,
                        success: false,
                    });
                    false
                }
            }
        } else {
            true
        };

        let success = if immediate {
            state_saved
        } else {
            self.run_cleanup().await && state_saved
        };

        self.inner.lock().in_progress = false;
        info!(success, "Cancellation completed");
        self.emit(CancellationEvent::Confirmed { success });
        true
    }

    /// Run every cleanup task in priority order within the graceful timeout.
    /// True when all of them succeeded.
    async fn run_cleanup(&self) -> bool {
        let tasks = self.inner.lock().tasks.clone();
        let total = tasks.len();
        let deadline = Instant::now() + Duration::from_secs(self.config.graceful_timeout_secs);
        let default_timeout = Duration::from_secs(self.config.cleanup_task_timeout_secs);

        let mut succeeded = 0;
        for (index, task) in tasks.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let timeout = task.timeout.unwrap_or(default_timeout).min(remaining);

            let success = if remaining.is_zero() {
                warn!(task = %task.name, "Skipping cleanup task, graceful timeout elapsed");
                false
            } else {
                match tokio::time::timeout(timeout, (task.handler)()).await {
                    Ok(Ok(())) => {
                        debug!(task = %task.name, "Cleanup task completed");
                        true
                    }
                    Ok(Err(e)) => {
                        warn!(task = %task.name, error = %e, "Cleanup task failed");
                        false
                    }
                    Err(_) => {
                        warn!(
                            task = %task.name,
                            timeout_ms = timeout.as_millis() as u64,
                            "Cleanup task timed out"
                        );
                        false
                    }
                }
            };

            if success {
                succeeded += 1;
                self.inner.lock().executed.push(task.name.clone());
            }
            self.emit(CancellationEvent::CleanupProgress {
                task: task.name.clone(),
                completed: index + 1,
                total,
                success,
            });
        }

        let failed = total - succeeded;
        info!(succeeded, failed, "Cleanup finished");
        self.emit(CancellationEvent::CleanupCompleted { succeeded, failed });
        failed == 0
    }

    /// Persist the registered state. `None` when no state is registered.
    pub async fn save_current_state(&self) -> Result<Option<PathBuf>> {
        let Some(state) = self.current_state() else {
            warn!("No processing state available to save");
            return Ok(None);
        };
        self.store.save(&state).await.map(Some)
    }

    pub async fn load_state(&self, path: &Path) -> Result<ProcessingState> {
        self.store.load(path).await
    }

    pub async fn available_states(&self) -> Result<Vec<SavedStateInfo>> {
        self.store.list().await
    }

    pub async fn delete_state(&self, path: &Path) -> Result<()> {
        self.store.delete(path).await
    }

    /// Periodically re-save the registered state until cancellation or reset.
    pub fn start_auto_save(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.auto_save.lock().replace(token.clone()) {
            previous.cancel();
        }

        let manager = Arc::clone(self);
        let interval = Duration::from_secs(self.config.auto_save_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if manager.is_cancelled() {
                            continue;
                        }
                        match manager.save_current_state().await {
                            Ok(Some(path)) => debug!(path = %path.display(), "Auto-saved processing state"),
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "Auto-save failed"),
                        }
                    }
                }
            }
        });
    }

    pub fn stop_auto_save(&self) {
        if let Some(token) = self.auto_save.lock().take() {
            token.cancel();
        }
    }

    /// Clear the cancellation for a new session.
    pub fn reset(&self) {
        self.stop_auto_save();
        let mut inner = self.inner.lock();
        self.requested.store(false, Ordering::SeqCst);
        inner.in_progress = false;
        inner.executed.clear();
        inner.session_token = CancellationToken::new();
        debug!("Cancellation state reset");
    }

    pub fn status(&self) -> CancellationStatus {
        let auto_save_running = self.auto_save.lock().is_some();
        let inner = self.inner.lock();
        CancellationStatus {
            requested: self.is_cancelled(),
            in_progress: inner.in_progress,
            cleanup_tasks: inner.tasks.len(),
            executed_cleanup_tasks: inner.executed.clone(),
            current_state_available: inner.current_state.is_some(),
            state_directory: self.config.state_directory.clone(),
            auto_save_running,
        }
    }
}
