use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::phase::{DetailedProgress, ProcessingPhase, ProcessingRecord};
use crate::{Error, Result};

const MIN_UPDATE_INTERVAL_MS: u64 = 100;
const MAX_UPDATE_INTERVAL_MS: u64 = 10_000;
/// Seconds assumed per file before any history exists.
const DEFAULT_FILE_SECS: f64 = 60.0;
const ETA_WINDOW: usize = 20;
const BASELINE_MIN_RECORDS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Snapshot emission interval in milliseconds.
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    /// Batch-progress thresholds in (0, 1] that fire once per batch.
    #[serde(default = "default_milestones")]
    pub milestones: Vec<f64>,
    /// Throughput ratio to baseline below which an alert fires.
    #[serde(default = "default_degradation_threshold")]
    pub degradation_threshold: f64,
}

fn default_update_interval_ms() -> u64 {
    500
}

fn default_milestones() -> Vec<f64> {
    vec![0.25, 0.5, 0.75, 0.9]
}

fn default_degradation_threshold() -> f64 {
    0.5
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: default_update_interval_ms(),
            milestones: default_milestones(),
            degradation_threshold: default_degradation_threshold(),
        }
    }
}

impl ProgressConfig {
    pub fn validate(&self) -> Result<()> {
        validate_interval(self.update_interval_ms)?;
        if self.milestones.iter().any(|m| !(*m > 0.0 && *m <= 1.0)) {
            return Err(Error::config("progress.milestones must lie in (0, 1]"));
        }
        if !(self.degradation_threshold > 0.0 && self.degradation_threshold < 1.0) {
            return Err(Error::config(
                "progress.degradation_threshold must lie in (0, 1)",
            ));
        }
        Ok(())
    }
}

fn validate_interval(interval_ms: u64) -> Result<()> {
    if !(MIN_UPDATE_INTERVAL_MS..=MAX_UPDATE_INTERVAL_MS).contains(&interval_ms) {
        return Err(Error::config(format!(
            "progress.update_interval_ms must be between {MIN_UPDATE_INTERVAL_MS} and {MAX_UPDATE_INTERVAL_MS}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Updated(DetailedProgress),
    PhaseChanged {
        phase: ProcessingPhase,
        file_name: String,
    },
    MilestoneReached {
        name: String,
        milestone: f64,
        progress: f64,
    },
    PerformanceAlert {
        message: String,
        degradation_percent: f64,
    },
}

/// Throughput and quality figures derived from the record history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub throughput_docs_per_min: f64,
    pub throughput_fields_per_sec: f64,
    pub avg_processing_time: f64,
    pub success_rate: f64,
    pub avg_confidence: f64,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            throughput_docs_per_min: 0.0,
            throughput_fields_per_sec: 0.0,
            avg_processing_time: 0.0,
            success_rate: 1.0,
            avg_confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PhaseStatistics {
    pub count: usize,
    pub avg_time: f64,
    pub min_time: f64,
    pub max_time: f64,
    pub total_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingSummary {
    pub total_files: usize,
    pub current_file_index: usize,
    pub batch_progress: f64,
    pub elapsed_secs: f64,
    pub performance: PerformanceMetrics,
    pub phase_statistics: BTreeMap<ProcessingPhase, PhaseStatistics>,
    pub milestones_reached: Vec<f64>,
}

#[derive(Default)]
struct TrackerState {
    started_at: Option<Instant>,
    total_files: usize,
    current_file_index: usize,
    current_file_name: String,
    current_phase: Option<ProcessingPhase>,
    phase_progress: f64,
    history: Vec<ProcessingRecord>,
    phase_timings: HashMap<ProcessingPhase, Vec<f64>>,
    /// Files with a successful validation record.
    completed_files: HashSet<String>,
    /// Phase-weighted share of every file still in progress. Queue workers
    /// report several files at once; each keeps its own entry.
    in_flight: HashMap<String, f64>,
    baseline_docs_per_min: Option<f64>,
    /// Indices into the configured milestones.
    reached_milestones: BTreeSet<usize>,
    memory_usage_mb: f64,
    cpu_usage_percent: f64,
}

impl TrackerState {
    fn elapsed_secs(&self) -> f64 {
        self.started_at
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Phase-weighted share of the current file; nothing once it is completed.
    fn current_file_fraction(&self) -> f64 {
        match self.current_phase {
            Some(phase) if !self.completed_files.contains(&self.current_file_name) => {
                phase.file_fraction(self.phase_progress)
            }
            _ => 0.0,
        }
    }

    fn batch_progress(&self) -> f64 {
        if self.total_files == 0 {
            return 0.0;
        }
        let completed = self.completed_files.len() as f64 / self.total_files as f64;
        let partial = self.in_flight.values().sum::<f64>() / self.total_files as f64;
        (completed + partial).clamp(0.0, 1.0)
    }

    /// (current file, whole batch) in seconds.
    fn eta(&self) -> (f64, f64) {
        if self.total_files == 0 {
            return (0.0, 0.0);
        }
        let remaining = self.total_files.saturating_sub(self.completed_files.len());
        if remaining == 0 {
            return (0.0, 0.0);
        }

        let skip = self.history.len().saturating_sub(ETA_WINDOW);
        let mut per_file: HashMap<&str, f64> = HashMap::new();
        for record in &self.history[skip..] {
            *per_file.entry(record.file_path.as_str()).or_default() += record.duration;
        }
        if per_file.is_empty() {
            return (DEFAULT_FILE_SECS, DEFAULT_FILE_SECS * remaining as f64);
        }

        let avg_per_file = per_file.values().sum::<f64>() / per_file.len() as f64;
        let current = avg_per_file * (1.0 - self.current_file_fraction());
        let batch = current + avg_per_file * (remaining - 1) as f64;
        (current, batch)
    }

    fn performance(&self) -> PerformanceMetrics {
        if self.history.is_empty() {
            return PerformanceMetrics::default();
        }
        let elapsed = self.elapsed_secs();

        let total_fields: usize = self.history.iter().map(|r| r.field_count).sum();
        let total_time: f64 = self.history.iter().map(|r| r.duration).sum();
        let successful = self.history.iter().filter(|r| r.success).count();
        let confidences: Vec<f64> = self
            .history
            .iter()
            .flat_map(|r| r.confidence_scores.iter().copied())
            .collect();

        PerformanceMetrics {
            throughput_docs_per_min: self.completed_files.len() as f64 / (elapsed / 60.0).max(0.1),
            throughput_fields_per_sec: total_fields as f64 / elapsed.max(0.1),
            avg_processing_time: total_time / self.history.len() as f64,
            success_rate: successful as f64 / self.history.len() as f64,
            avg_confidence: if confidences.is_empty() {
                0.0
            } else {
                confidences.iter().sum::<f64>() / confidences.len() as f64
            },
        }
    }

    fn snapshot(&self) -> DetailedProgress {
        let (eta_current, eta_batch) = self.eta();
        let performance = self.performance();
        DetailedProgress {
            batch_progress: self.batch_progress(),
            current_file_index: self.current_file_index,
            total_files: self.total_files,
            completed_files: self.completed_files.len(),
            current_file_progress: self.current_file_fraction(),
            phase_progress: self.phase_progress,
            current_phase: self.current_phase,
            current_file_name: self.current_file_name.clone(),
            throughput_docs_per_min: performance.throughput_docs_per_min,
            throughput_fields_per_sec: performance.throughput_fields_per_sec,
            avg_processing_time: performance.avg_processing_time,
            eta_current_file_secs: eta_current,
            eta_batch_secs: eta_batch,
            memory_usage_mb: self.memory_usage_mb,
            cpu_usage_percent: self.cpu_usage_percent,
            success_rate: performance.success_rate,
            avg_confidence: performance.avg_confidence,
            elapsed_secs: self.elapsed_secs(),
        }
    }
}

/// Weighted multi-phase progress with ETA, milestones and degradation alerts.
pub struct ProgressTracker {
    milestones: Vec<f64>,
    degradation_threshold: f64,
    update_interval_ms: AtomicU64,
    state: Mutex<TrackerState>,
    emitter: Mutex<Option<CancellationToken>>,
    event_tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressTracker {
    pub fn new(config: ProgressConfig) -> Result<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(256);
        Ok(Self {
            milestones: config.milestones,
            degradation_threshold: config.degradation_threshold,
            update_interval_ms: AtomicU64::new(config.update_interval_ms),
            state: Mutex::new(TrackerState::default()),
            emitter: Mutex::new(None),
            event_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: ProgressEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Reset all per-batch state and start periodic snapshots.
    pub fn start_batch(self: &Arc<Self>, total_files: usize, file_names: &[String]) {
        {
            let mut state = self.state.lock();
            *state = TrackerState {
                started_at: Some(Instant::now()),
                total_files,
                current_file_name: file_names.first().cloned().unwrap_or_default(),
                memory_usage_mb: state.memory_usage_mb,
                cpu_usage_percent: state.cpu_usage_percent,
                ..Default::default()
            };
        }
        info!(total_files, "Started batch tracking");
        self.restart_emitter();
    }

    /// Stop periodic snapshots.
    pub fn stop(&self) {
        if let Some(token) = self.emitter.lock().take() {
            token.cancel();
        }
        let state = self.state.lock();
        info!(
            completed = state.completed_files.len(),
            total = state.total_files,
            elapsed_secs = state.elapsed_secs(),
            "Completed batch tracking"
        );
    }

    pub fn is_emitting(&self) -> bool {
        self.emitter.lock().is_some()
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms.load(Ordering::Relaxed))
    }

    /// Change the emission interval; a running emitter restarts right away.
    pub fn set_update_interval(self: &Arc<Self>, interval_ms: u64) -> Result<()> {
        validate_interval(interval_ms)?;
        self.update_interval_ms.store(interval_ms, Ordering::Relaxed);
        if self.is_emitting() {
            self.restart_emitter();
        }
        Ok(())
    }

    fn restart_emitter(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.emitter.lock().replace(token.clone()) {
            previous.cancel();
        }

        let tracker = Arc::clone(self);
        let interval = self.update_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        tracker.emit(ProgressEvent::Updated(tracker.snapshot()));
                    }
                }
            }
        });
    }

    /// Report progress within a file being processed.
    ///
    /// Snapshot fields (`current_file_name`, phase) follow the latest report, so
    /// with concurrent workers they alternate between files. Batch progress
    /// sums every file in flight and never goes back for a single file.
    pub fn update_file_progress(
        &self,
        file_index: usize,
        file_name: &str,
        phase: ProcessingPhase,
        fraction: f64,
    ) {
        let (phase_changed, reached) = {
            let mut state = self.state.lock();
            state.current_file_index = file_index;
            if state.current_file_name != file_name {
                state.current_file_name = file_name.to_string();
            }
            let phase_changed = state.current_phase != Some(phase);
            state.current_phase = Some(phase);
            state.phase_progress = fraction.clamp(0.0, 1.0);
            if !state.completed_files.contains(file_name) {
                let share = phase.file_fraction(state.phase_progress);
                let entry = state.in_flight.entry(file_name.to_string()).or_default();
                *entry = entry.max(share);
            }
            (phase_changed, self.check_milestones(&mut state))
        };

        if phase_changed {
            debug!(%phase, file = file_name, "Phase changed");
            self.emit(ProgressEvent::PhaseChanged {
                phase,
                file_name: file_name.to_string(),
            });
        }
        for event in reached {
            self.emit(event);
        }
    }

    /// Append a phase completion to the history.
    pub fn record_completion(&self, record: ProcessingRecord) {
        debug!(
            file = %record.file_path,
            phase = %record.phase,
            success = record.success,
            duration_secs = record.duration,
            "Recorded phase completion"
        );

        let events = {
            let mut state = self.state.lock();
            state
                .phase_timings
                .entry(record.phase)
                .or_default()
                .push(record.duration);
            if record.success && record.phase == ProcessingPhase::Validation {
                state.completed_files.insert(record.file_path.clone());
                state.in_flight.remove(&record.file_path);
            } else if !record.success {
                state.in_flight.remove(&record.file_path);
            }
            state.history.push(record);

            let mut events: Vec<ProgressEvent> =
                self.check_degradation(&mut state).into_iter().collect();
            events.extend(self.check_milestones(&mut state));
            events
        };

        for event in events {
            self.emit(event);
        }
    }

    /// Latest resource readings shown in snapshots.
    pub fn update_resource_usage(&self, memory_usage_mb: f64, cpu_usage_percent: f64) {
        let mut state = self.state.lock();
        state.memory_usage_mb = memory_usage_mb;
        state.cpu_usage_percent = cpu_usage_percent;
    }

    fn check_milestones(&self, state: &mut TrackerState) -> Vec<ProgressEvent> {
        let progress = state.batch_progress();
        let mut events = Vec::new();
        for (index, milestone) in self.milestones.iter().enumerate() {
            if progress >= *milestone && state.reached_milestones.insert(index) {
                let name = format!("{}% Complete", (milestone * 100.0).round() as u32);
                info!(milestone = %name, progress, "Milestone reached");
                events.push(ProgressEvent::MilestoneReached {
                    name,
                    milestone: *milestone,
                    progress,
                });
            }
        }
        events
    }

    fn check_degradation(&self, state: &mut TrackerState) -> Option<ProgressEvent> {
        if state.history.len() < BASELINE_MIN_RECORDS {
            return None;
        }
        let current = state.performance().throughput_docs_per_min;

        let Some(baseline) = state.baseline_docs_per_min else {
            if current > 0.0 {
                debug!(baseline = current, "Throughput baseline set");
                state.baseline_docs_per_min = Some(current);
            }
            return None;
        };

        if current < baseline * self.degradation_threshold {
            let degradation_percent = (1.0 - current / baseline) * 100.0;
            let message = format!(
                "Performance degradation detected: {degradation_percent:.1}% slower than baseline ({current:.1} vs {baseline:.1} docs/min)"
            );
            warn!(degradation_percent, "{message}");
            return Some(ProgressEvent::PerformanceAlert {
                message,
                degradation_percent,
            });
        }
        None
    }

    pub fn batch_progress(&self) -> f64 {
        self.state.lock().batch_progress()
    }

    /// (current file, whole batch) ETA in seconds.
    pub fn eta(&self) -> (f64, f64) {
        self.state.lock().eta()
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        self.state.lock().performance()
    }

    pub fn snapshot(&self) -> DetailedProgress {
        self.state.lock().snapshot()
    }

    pub fn history(&self) -> Vec<ProcessingRecord> {
        self.state.lock().history.clone()
    }

    pub fn phase_statistics(&self) -> BTreeMap<ProcessingPhase, PhaseStatistics> {
        let state = self.state.lock();
        phase_statistics(&state)
    }

    /// Summary of the batch so far; `None` before the first record.
    pub fn processing_summary(&self) -> Option<ProcessingSummary> {
        let state = self.state.lock();
        if state.history.is_empty() {
            return None;
        }
        Some(ProcessingSummary {
            total_files: state.total_files,
            current_file_index: state.current_file_index,
            batch_progress: state.batch_progress(),
            elapsed_secs: state.elapsed_secs(),
            performance: state.performance(),
            phase_statistics: phase_statistics(&state),
            milestones_reached: state
                .reached_milestones
                .iter()
                .filter_map(|i| self.milestones.get(*i).copied())
                .collect(),
        })
    }
}

fn phase_statistics(state: &TrackerState) -> BTreeMap<ProcessingPhase, PhaseStatistics> {
    ProcessingPhase::ALL
        .iter()
        .map(|phase| {
            let stats = match state.phase_timings.get(phase) {
                Some(timings) if !timings.is_empty() => {
                    let total: f64 = timings.iter().sum();
                    PhaseStatistics {
                        count: timings.len(),
                        avg_time: total / timings.len() as f64,
                        min_time: timings.iter().copied().fold(f64::INFINITY, f64::min),
                        max_time: timings.iter().copied().fold(0.0, f64::max),
                        total_time: total,
                    }
                }
                _ => PhaseStatistics::default(),
            };
            (*phase, stats)
        })
        .collect()
}
