//! Priority job queue with a bounded, resizable worker pool.
//!
//! Jobs are ordered by priority (highest first) and then by enqueue order.
//! A single mutex guards the heap together with the job maps so that every
//! lifecycle transition is observed atomically. Work itself is delegated to a
//! [`JobExecutor`] supplied at [`ProcessingQueue::start`].

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::complexity::ComplexityEstimator;
use super::job::{JobPriority, JobStatus, ProcessingJob, QueueEntry, seconds_between};
use crate::error::ProcessingError;
use crate::resource::ScalingAction;
use crate::retry::{ErrorClassifier, ErrorType};
use crate::{Error, Result};

const PERFORMANCE_HISTORY: usize = 100;
const STATISTICS_WINDOW: usize = 50;
/// Hard ceiling on configured workers.
pub const MAX_WORKERS_LIMIT: usize = 16;

/// Configuration for the processing queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Workers available when the queue starts.
    #[serde(default = "default_initial_workers")]
    pub initial_workers: usize,
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_true")]
    pub auto_scaling_enabled: bool,
    /// Interval between scaling evaluations in milliseconds.
    #[serde(default = "default_scaling_interval_ms")]
    pub scaling_interval_ms: u64,
    /// Interval between statistics updates in milliseconds.
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
    /// Dispatcher wake-up interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Extra runs granted to a job whose failure is temporary.
    #[serde(default = "default_job_max_retries")]
    pub job_max_retries: u32,
    /// Upper bound for draining in-flight jobs on stop, in seconds.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_initial_workers() -> usize {
    4
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_scaling_interval_ms() -> u64 {
    10_000
}

fn default_stats_interval_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_job_max_retries() -> u32 {
    2
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            initial_workers: default_initial_workers(),
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            auto_scaling_enabled: default_true(),
            scaling_interval_ms: default_scaling_interval_ms(),
            stats_interval_ms: default_stats_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            job_max_retries: default_job_max_retries(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl QueueConfig {
    pub fn with_workers(mut self, initial: usize, min: usize, max: usize) -> Self {
        self.initial_workers = initial;
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    pub fn with_auto_scaling(mut self, enabled: bool) -> Self {
        self.auto_scaling_enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_workers < 1 {
            return Err(Error::config("queue.min_workers must be at least 1"));
        }
        if self.max_workers > MAX_WORKERS_LIMIT {
            return Err(Error::config(format!(
                "queue.max_workers must not exceed {MAX_WORKERS_LIMIT}"
            )));
        }
        if self.min_workers > self.max_workers {
            return Err(Error::config("queue.min_workers must be <= queue.max_workers"));
        }
        if !(self.min_workers..=self.max_workers).contains(&self.initial_workers) {
            return Err(Error::config(
                "queue.initial_workers must lie between min_workers and max_workers",
            ));
        }
        if self.scaling_interval_ms == 0 || self.stats_interval_ms == 0 || self.poll_interval_ms == 0
        {
            return Err(Error::config("queue intervals must be positive"));
        }
        Ok(())
    }
}

/// Runs the work behind a queued job.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Execute `job`. `cancel` fires when cancellation of the running job was
    /// requested; honoring it is up to the implementation.
    async fn execute(
        &self,
        job: &ProcessingJob,
        cancel: CancellationToken,
    ) -> std::result::Result<serde_json::Value, ProcessingError>;
}

/// Rolling queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStatistics {
    pub total_jobs_processed: usize,
    pub successful_jobs: usize,
    pub failed_jobs: usize,
    pub cancelled_jobs: usize,
    /// Seconds.
    pub average_processing_time: f64,
    /// Seconds.
    pub average_wait_time: f64,
    pub throughput_per_hour: f64,
    pub current_queue_size: usize,
    pub active_workers: usize,
    pub total_workers: usize,
}

/// Aggregate state of one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchProgress {
    pub batch_id: String,
    pub total_jobs: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub progress_percentage: f64,
    pub is_complete: bool,
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    JobQueued {
        job_id: String,
        priority: JobPriority,
    },
    JobStarted {
        job_id: String,
        worker_id: usize,
    },
    JobFinished {
        job_id: String,
        status: JobStatus,
        error: Option<String>,
    },
    StatsUpdated(QueueStatistics),
    ScalingRecommended {
        action: ScalingAction,
        workers: usize,
    },
    BatchCompleted {
        batch_id: String,
        successful: usize,
        failed: usize,
        cancelled: usize,
        total: usize,
    },
}

/// Decide whether the pool should grow or shrink by one worker.
pub fn evaluate_scaling(
    queue_depth: usize,
    active_jobs: usize,
    current_workers: usize,
    min_workers: usize,
    max_workers: usize,
) -> Option<(ScalingAction, usize)> {
    if queue_depth > current_workers * 2 && current_workers < max_workers {
        Some((ScalingAction::ScaleUp, current_workers + 1))
    } else if queue_depth == 0 && active_jobs < current_workers / 2 && current_workers > min_workers
    {
        Some((ScalingAction::ScaleDown, current_workers - 1))
    } else {
        None
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    /// Queued and running jobs.
    active: HashMap<String, ProcessingJob>,
    /// Jobs in a terminal state.
    finished: HashMap<String, ProcessingJob>,
    batches: HashMap<String, Vec<String>>,
    completed_batches: HashSet<String>,
    /// Completed and failed jobs in completion order.
    history: VecDeque<ProcessingJob>,
    tokens: HashMap<String, CancellationToken>,
    /// Running jobs whose executor has been invoked.
    started_work: HashSet<String>,
    running: usize,
    current_workers: usize,
    pending_workers: Option<usize>,
    dispatched: usize,
}

impl QueueState {
    fn queue_depth(&self) -> usize {
        self.active
            .values()
            .filter(|job| job.status == JobStatus::Queued)
            .count()
    }

    fn pop_next(&mut self) -> Option<String> {
        while let Some(entry) = self.heap.pop() {
            let queued = self
                .active
                .get(&entry.job_id)
                .is_some_and(|job| job.status == JobStatus::Queued);
            if queued {
                return Some(entry.job_id);
            }
        }
        None
    }
}

pub struct ProcessingQueue {
    config: QueueConfig,
    estimator: ComplexityEstimator,
    classifier: ErrorClassifier,
    state: Mutex<QueueState>,
    sequence: AtomicU64,
    wake: Notify,
    completion: Notify,
    tracker: TaskTracker,
    cancel: Mutex<Option<CancellationToken>>,
    event_tx: broadcast::Sender<QueueEvent>,
}

impl ProcessingQueue {
    pub fn new(config: QueueConfig) -> Result<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(256);
        let state = QueueState {
            current_workers: config.initial_workers,
            ..Default::default()
        };

        Ok(Self {
            config,
            estimator: ComplexityEstimator::new(),
            classifier: ErrorClassifier::new(),
            state: Mutex::new(state),
            sequence: AtomicU64::new(0),
            wake: Notify::new(),
            completion: Notify::new(),
            tracker: TaskTracker::new(),
            cancel: Mutex::new(None),
            event_tx,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, events: Vec<QueueEvent>) {
        for event in events {
            let _ = self.event_tx.send(event);
        }
    }

    /// Enqueue one file and return its job id.
    pub fn add_job(
        &self,
        file_path: impl Into<PathBuf>,
        priority: JobPriority,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let job_id = format!("job_{}_{}", Utc::now().timestamp_millis(), sequence);
        let job = self.build_job(job_id.clone(), file_path.into(), priority, metadata, sequence);

        self.state.lock().enqueue(job);
        self.after_enqueue(&job_id, priority);
        job_id
    }

    /// Enqueue a group of files under one batch id.
    pub fn add_batch(
        &self,
        files: &[PathBuf],
        batch_id: Option<String>,
        priority: JobPriority,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        let batch_id = batch_id.unwrap_or_else(|| format!("batch_{}", uuid::Uuid::new_v4().simple()));

        let jobs: Vec<ProcessingJob> = files
            .iter()
            .enumerate()
            .map(|(index, file)| {
                let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
                let mut job_metadata = metadata.clone();
                job_metadata.insert("batch_id".into(), batch_id.clone().into());
                job_metadata.insert("batch_index".into(), index.into());
                self.build_job(
                    format!("{batch_id}_job_{index}"),
                    file.clone(),
                    priority,
                    job_metadata,
                    sequence,
                )
            })
            .collect();
        let job_ids: Vec<String> = jobs.iter().map(|j| j.job_id.clone()).collect();

        {
            let mut state = self.state.lock();
            if state.batches.contains_key(&batch_id) {
                return Err(Error::validation(format!("batch {batch_id} already exists")));
            }
            state.batches.insert(batch_id.clone(), job_ids.clone());
            for job in jobs {
                state.enqueue(job);
            }
        }

        info!(batch_id = %batch_id, jobs = job_ids.len(), "Batch queued");
        for job_id in &job_ids {
            self.after_enqueue(job_id, priority);
        }
        Ok(batch_id)
    }

    fn build_job(
        &self,
        job_id: String,
        file_path: PathBuf,
        priority: JobPriority,
        metadata: serde_json::Map<String, serde_json::Value>,
        sequence: u64,
    ) -> ProcessingJob {
        let complexity = self.estimator.estimate(&file_path);
        ProcessingJob {
            job_id,
            file_path,
            priority,
            estimated_complexity: complexity,
            estimated_duration: self.estimator.estimate_duration(complexity),
            created_at: Utc::now(),
            sequence,
            metadata,
            retry_count: 0,
            max_retries: self.config.job_max_retries,
            status: JobStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            worker_id: None,
        }
    }

    fn after_enqueue(&self, job_id: &str, priority: JobPriority) {
        debug!(job_id, %priority, "Job queued");
        self.emit(vec![QueueEvent::JobQueued {
            job_id: job_id.to_string(),
            priority,
        }]);
        self.wake.notify_one();
    }

    /// Cancel a job.
    ///
    /// Queued jobs, and running jobs whose executor has not been invoked yet,
    /// are cancelled immediately. For a job already executing, the job's
    /// cancellation token is triggered and `false` is returned; the job keeps
    /// running unless the executor honors the token.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let mut events = Vec::new();
        let cancelled = {
            let mut state = self.state.lock();
            let status = state.active.get(job_id).map(|job| job.status);
            match status {
                Some(JobStatus::Queued) | Some(JobStatus::Pending) => {
                    events = self.finalize(&mut state, job_id, JobStatus::Cancelled, None, None);
                    true
                }
                Some(JobStatus::Running) if !state.started_work.contains(job_id) => {
                    events = self.finalize(&mut state, job_id, JobStatus::Cancelled, None, None);
                    true
                }
                Some(JobStatus::Running) => {
                    if let Some(token) = state.tokens.get(job_id) {
                        token.cancel();
                    }
                    false
                }
                _ => false,
            }
        };

        if cancelled {
            info!(job_id, "Job cancelled");
            self.completion.notify_waiters();
        }
        self.emit(events);
        cancelled
    }

    /// Cancel every job of a batch; returns how many were cancelled.
    pub fn cancel_batch(&self, batch_id: &str) -> usize {
        let job_ids = self
            .state
            .lock()
            .batches
            .get(batch_id)
            .cloned()
            .unwrap_or_default();
        job_ids.iter().filter(|id| self.cancel_job(id)).count()
    }

    pub fn queue_size(&self) -> usize {
        self.state.lock().queue_depth()
    }

    pub fn active_job_count(&self) -> usize {
        self.state.lock().running
    }

    pub fn worker_count(&self) -> usize {
        self.state.lock().current_workers
    }

    pub fn job(&self, job_id: &str) -> Option<ProcessingJob> {
        let state = self.state.lock();
        state
            .active
            .get(job_id)
            .or_else(|| state.finished.get(job_id))
            .cloned()
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.job(job_id).map(|job| job.status)
    }

    /// Wait until the job reaches a terminal state. `None` for unknown jobs.
    pub async fn wait_for_job(&self, job_id: &str) -> Option<ProcessingJob> {
        loop {
            let notified = self.completion.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if let Some(job) = state.finished.get(job_id) {
                    return Some(job.clone());
                }
                if !state.active.contains_key(job_id) {
                    return None;
                }
            }

            notified.await;
        }
    }

    pub fn batch_progress(&self, batch_id: &str) -> Option<BatchProgress> {
        let state = self.state.lock();
        let job_ids = state.batches.get(batch_id)?;

        let mut progress = BatchProgress {
            batch_id: batch_id.to_string(),
            total_jobs: job_ids.len(),
            queued: 0,
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            progress_percentage: 0.0,
            is_complete: false,
        };

        for id in job_ids {
            let status = state
                .active
                .get(id)
                .or_else(|| state.finished.get(id))
                .map(|job| job.status);
            match status {
                Some(JobStatus::Pending) | Some(JobStatus::Queued) => progress.queued += 1,
                Some(JobStatus::Running) => progress.running += 1,
                Some(JobStatus::Completed) => progress.completed += 1,
                Some(JobStatus::Failed) => progress.failed += 1,
                Some(JobStatus::Cancelled) => progress.cancelled += 1,
                None => {}
            }
        }

        let done = progress.completed + progress.failed + progress.cancelled;
        if progress.total_jobs > 0 {
            progress.progress_percentage = done as f64 / progress.total_jobs as f64 * 100.0;
        }
        progress.is_complete = done == progress.total_jobs;
        Some(progress)
    }

    pub fn statistics(&self) -> QueueStatistics {
        let state = self.state.lock();

        let mut stats = QueueStatistics {
            total_jobs_processed: state.finished.len(),
            current_queue_size: state.queue_depth(),
            active_workers: state.running,
            total_workers: state.current_workers,
            ..Default::default()
        };
        for job in state.finished.values() {
            match job.status {
                JobStatus::Completed => stats.successful_jobs += 1,
                JobStatus::Failed => stats.failed_jobs += 1,
                JobStatus::Cancelled => stats.cancelled_jobs += 1,
                _ => {}
            }
        }

        let skip = state.history.len().saturating_sub(STATISTICS_WINDOW);
        let recent: Vec<&ProcessingJob> = state.history.iter().skip(skip).collect();

        let processing: Vec<f64> = recent.iter().filter_map(|j| j.processing_time()).collect();
        if !processing.is_empty() {
            stats.average_processing_time = processing.iter().sum::<f64>() / processing.len() as f64;
        }
        let waits: Vec<f64> = recent.iter().filter_map(|j| j.wait_time()).collect();
        if !waits.is_empty() {
            stats.average_wait_time = waits.iter().sum::<f64>() / waits.len() as f64;
        }

        if let (Some(first), Some(last)) = (recent.first(), recent.last())
            && recent.len() > 1
            && let Some(end) = last.completed_at
        {
            let span_hours = seconds_between(first.created_at, end) / 3600.0;
            if span_hours > 0.0 {
                stats.throughput_per_hour = recent.len() as f64 / span_hours;
            }
        }

        stats
    }

    /// Resize the pool, clamped to the configured bounds.
    ///
    /// Shrinking below the number of in-flight jobs is deferred until enough
    /// of them have finished; running jobs are never interrupted.
    pub fn set_worker_count(&self, workers: usize) -> usize {
        let workers = workers.clamp(self.config.min_workers, self.config.max_workers);
        {
            let mut state = self.state.lock();
            if workers >= state.running {
                state.current_workers = workers;
                state.pending_workers = None;
            } else {
                debug!(
                    workers,
                    running = state.running,
                    "Deferring worker change until in-flight jobs finish"
                );
                state.pending_workers = Some(workers);
            }
        }
        self.wake.notify_one();
        workers
    }

    /// Evaluate queue depth against the pool size and resize by one worker
    /// when warranted.
    pub fn check_scaling_needs(&self) -> Option<(ScalingAction, usize)> {
        let decision = {
            let state = self.state.lock();
            evaluate_scaling(
                state.queue_depth(),
                state.running,
                state.pending_workers.unwrap_or(state.current_workers),
                self.config.min_workers,
                self.config.max_workers,
            )
        };

        if let Some((action, workers)) = decision {
            info!(%action, workers, "Queue scaling");
            self.set_worker_count(workers);
            self.emit(vec![QueueEvent::ScalingRecommended { action, workers }]);
        }
        decision
    }

    pub fn is_running(&self) -> bool {
        self.cancel.lock().is_some()
    }

    /// Start dispatching jobs to `executor`, plus the statistics and
    /// auto-scaling timers.
    pub fn start(self: &Arc<Self>, executor: Arc<dyn JobExecutor>) {
        let token = {
            let mut cancel = self.cancel.lock();
            if cancel.is_some() {
                debug!("Processing queue already running");
                return;
            }
            let token = CancellationToken::new();
            *cancel = Some(token.clone());
            token
        };
        self.tracker.reopen();

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let queue = Arc::clone(self);
        let dispatch_token = token.clone();
        tokio::spawn(async move {
            info!(workers = queue.worker_count(), "Processing queue started");
            loop {
                queue.dispatch_ready(&executor);
                tokio::select! {
                    _ = dispatch_token.cancelled() => break,
                    _ = queue.wake.notified() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            debug!("Queue dispatcher stopped");
        });

        let stats_interval = Duration::from_millis(self.config.stats_interval_ms);
        let queue = Arc::clone(self);
        let stats_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stats_token.cancelled() => break,
                    _ = tokio::time::sleep(stats_interval) => {
                        let stats = queue.statistics();
                        queue.emit(vec![QueueEvent::StatsUpdated(stats)]);
                    }
                }
            }
        });

        if self.config.auto_scaling_enabled {
            let scaling_interval = Duration::from_millis(self.config.scaling_interval_ms);
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(scaling_interval) => {
                            queue.check_scaling_needs();
                        }
                    }
                }
            });
        }
    }

    /// Stop dispatching. With `wait_for_completion`, in-flight jobs get up to
    /// the configured shutdown timeout to finish; otherwise they are only
    /// signalled to cancel.
    pub async fn stop(&self, wait_for_completion: bool) {
        let Some(token) = self.cancel.lock().take() else {
            return;
        };
        token.cancel();
        self.tracker.close();

        if wait_for_completion {
            let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
            if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "Timed out waiting for running jobs"
                );
            }
        } else {
            for token in self.state.lock().tokens.values() {
                token.cancel();
            }
        }
        info!("Processing queue stopped");
    }

    fn dispatch_ready(self: &Arc<Self>, executor: &Arc<dyn JobExecutor>) {
        loop {
            let (job, token, worker_id) = {
                let mut state = self.state.lock();
                if state.running >= state.current_workers {
                    return;
                }
                let Some(job_id) = state.pop_next() else {
                    return;
                };
                let worker_id = state.dispatched % state.current_workers.max(1);
                state.dispatched += 1;
                state.running += 1;

                let token = CancellationToken::new();
                state.tokens.insert(job_id.clone(), token.clone());
                let Some(job) = state.active.get_mut(&job_id) else {
                    state.running -= 1;
                    state.tokens.remove(&job_id);
                    continue;
                };
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
                job.worker_id = Some(worker_id);
                (job.clone(), token, worker_id)
            };

            debug!(job_id = %job.job_id, worker_id, "Job started");
            self.emit(vec![QueueEvent::JobStarted {
                job_id: job.job_id.clone(),
                worker_id,
            }]);

            let queue = Arc::clone(self);
            let executor = Arc::clone(executor);
            self.tracker
                .spawn(async move { queue.run_job(executor, job, token).await });
        }
    }

    async fn run_job(
        self: Arc<Self>,
        executor: Arc<dyn JobExecutor>,
        mut job: ProcessingJob,
        token: CancellationToken,
    ) {
        loop {
            if !self.begin_work(&job.job_id) {
                return;
            }

            match executor.execute(&job, token.clone()).await {
                Ok(value) => {
                    self.complete(&job.job_id, JobStatus::Completed, Some(value), None);
                    return;
                }
                Err(ProcessingError::Cancelled) => {
                    self.complete(&job.job_id, JobStatus::Cancelled, None, None);
                    return;
                }
                Err(e) => {
                    let temporary = self.classifier.classify(&e) == ErrorType::Temporary;
                    if temporary && job.can_retry() && !token.is_cancelled() {
                        job.retry_count += 1;
                        warn!(
                            job_id = %job.job_id,
                            retry = job.retry_count,
                            max_retries = job.max_retries,
                            error = %e,
                            "Job failed, running again"
                        );
                        if let Some(active) = self.state.lock().active.get_mut(&job.job_id) {
                            active.retry_count = job.retry_count;
                        }
                        continue;
                    }
                    self.complete(&job.job_id, JobStatus::Failed, None, Some(e.to_string()));
                    return;
                }
            }
        }
    }

    /// Mark the executor as invoked. False when the job was cancelled first.
    fn begin_work(&self, job_id: &str) -> bool {
        let mut state = self.state.lock();
        let running = state
            .active
            .get(job_id)
            .is_some_and(|job| job.status == JobStatus::Running);
        if running {
            state.started_work.insert(job_id.to_string());
        }
        running
    }

    fn complete(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let events = {
            let mut state = self.state.lock();
            self.finalize(&mut state, job_id, status, result, error)
        };
        self.completion.notify_waiters();
        self.wake.notify_one();
        self.emit(events);
    }

    /// Move a job to the finished map. Must be called with the state lock
    /// held; returns the events to emit once it is released.
    fn finalize(
        &self,
        state: &mut QueueState,
        job_id: &str,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Vec<QueueEvent> {
        let Some(mut job) = state.active.remove(job_id) else {
            return Vec::new();
        };

        if job.status == JobStatus::Running {
            state.running = state.running.saturating_sub(1);
        }
        state.tokens.remove(job_id);
        state.started_work.remove(job_id);
        if let Some(pending) = state.pending_workers
            && state.running <= pending
        {
            state.current_workers = pending;
            state.pending_workers = None;
        }

        job.status = status;
        job.completed_at = Some(Utc::now());
        job.result = result;
        job.error = error.clone();

        match status {
            JobStatus::Completed => info!(job_id, "Job completed"),
            JobStatus::Failed => {
                warn!(job_id, error = error.as_deref().unwrap_or(""), "Job failed")
            }
            _ => {}
        }

        if matches!(status, JobStatus::Completed | JobStatus::Failed) {
            if state.history.len() == PERFORMANCE_HISTORY {
                state.history.pop_front();
            }
            state.history.push_back(job.clone());
        }

        let batch_id = job.batch_id().map(str::to_string);
        state.finished.insert(job_id.to_string(), job);

        let mut events = vec![QueueEvent::JobFinished {
            job_id: job_id.to_string(),
            status,
            error,
        }];
        if let Some(batch_id) = batch_id
            && let Some(event) = batch_completion(state, &batch_id)
        {
            events.push(event);
        }
        events
    }
}

/// Batch-completed event if every job of the batch is now terminal.
fn batch_completion(state: &mut QueueState, batch_id: &str) -> Option<QueueEvent> {
    if state.completed_batches.contains(batch_id) {
        return None;
    }
    let job_ids = state.batches.get(batch_id)?;

    let mut successful = 0;
    let mut failed = 0;
    let mut cancelled = 0;
    for id in job_ids {
        match state.finished.get(id).map(|job| job.status) {
            Some(JobStatus::Completed) => successful += 1,
            Some(JobStatus::Failed) => failed += 1,
            Some(JobStatus::Cancelled) => cancelled += 1,
            _ => return None,
        }
    }
    let total = job_ids.len();

    state.completed_batches.insert(batch_id.to_string());
    info!(batch_id, successful, failed, cancelled, total, "Batch completed");
    Some(QueueEvent::BatchCompleted {
        batch_id: batch_id.to_string(),
        successful,
        failed,
        cancelled,
        total,
    })
}

impl QueueState {
    fn enqueue(&mut self, mut job: ProcessingJob) {
        job.status = JobStatus::Queued;
        self.heap.push(QueueEntry {
            priority: job.priority,
            sequence: job.sequence,
            job_id: job.job_id.clone(),
        });
        self.active.insert(job.job_id.clone(), job);
    }
}
