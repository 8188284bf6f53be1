//! Periodic resource sampling with threshold events and scaling advice.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::metrics::{ResourceLimits, ResourceMetrics, ResourceSummary};
use super::source::{MetricsSource, SystemMetricsSource, SystemSnapshot};
use crate::Result;

const HISTORY_CAPACITY: usize = 100;
const SUMMARY_WINDOW: usize = 10;
const SCALE_UP_WINDOW: usize = 5;
const MIN_SAMPLES_FOR_SCALING: usize = 3;
const SCALE_DOWN_FACTOR: f64 = 0.7;
/// Share of the warning threshold that counts as idle for scale-up.
const IDLE_RATIO: f64 = 0.8;
/// Hard ceiling for recommended worker counts.
pub const MAX_RECOMMENDED_THREADS: usize = 8;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Direction of a scaling recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
}

/// Which resource an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ResourceKind {
    Memory,
    Cpu,
    Disk,
}

#[derive(Debug, Clone)]
pub enum ResourceEvent {
    MetricsUpdated(ResourceMetrics),
    Warning {
        resource: ResourceKind,
        message: String,
    },
    Critical {
        resource: ResourceKind,
        message: String,
    },
    ScalingRecommended {
        action: ScalingAction,
        current: usize,
        recommended: usize,
    },
}

pub struct ResourceMonitor {
    limits: ResourceLimits,
    source: Mutex<Box<dyn MetricsSource>>,
    history: Mutex<VecDeque<ResourceMetrics>>,
    worker_count: AtomicUsize,
    baseline: Mutex<Option<ResourceMetrics>>,
    event_tx: broadcast::Sender<ResourceEvent>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl ResourceMonitor {
    /// Monitor backed by the host system.
    pub fn new(limits: ResourceLimits) -> Result<Self> {
        let source = SystemMetricsSource::new(limits.disk_path.clone());
        Self::with_source(limits, Box::new(source))
    }

    pub fn with_source(limits: ResourceLimits, source: Box<dyn MetricsSource>) -> Result<Self> {
        limits.validate()?;
        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            limits,
            source: Mutex::new(source),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            worker_count: AtomicUsize::new(1),
            baseline: Mutex::new(None),
            event_tx,
            cancel: Mutex::new(None),
        })
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.event_tx.subscribe()
    }

    /// Number of workers currently in use; reported as the sample thread count.
    pub fn set_worker_count(&self, count: usize) {
        self.worker_count.store(count.max(1), Ordering::SeqCst);
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.cancel.lock().is_some()
    }

    /// Start periodic sampling. No-op when already running.
    pub fn start(self: &Arc<Self>) {
        let token = {
            let mut cancel = self.cancel.lock();
            if cancel.is_some() {
                debug!("Resource monitor already running");
                return;
            }
            let token = CancellationToken::new();
            *cancel = Some(token.clone());
            token
        };

        let monitor = Arc::clone(self);
        let interval = self.limits.check_interval();

        tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Resource monitoring started");

            let sampler = Arc::clone(&monitor);
            match tokio::task::spawn_blocking(move || sampler.sample()).await {
                Ok(baseline) if baseline.memory_usage_mb > 0.0 => {
                    *monitor.baseline.lock() = Some(baseline);
                }
                Ok(_) => debug!("Empty baseline reading, leaving baseline unset"),
                Err(e) => warn!(error = %e, "Baseline sampling task failed"),
            }

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        // sysinfo refreshes block; keep them off the async workers.
                        let sampler = Arc::clone(&monitor);
                        if let Err(e) = tokio::task::spawn_blocking(move || sampler.tick()).await {
                            warn!(error = %e, "Resource sampling task failed");
                        }
                    }
                }
            }
            info!("Resource monitoring stopped");
        });
    }

    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
    }

    /// Take one reading. Falls back to a safe synthetic reading on failure.
    pub fn sample(&self) -> ResourceMetrics {
        let thread_count = self.worker_count();
        match self.source.lock().snapshot() {
            Ok(snapshot) => to_metrics(&snapshot, thread_count),
            Err(e) => {
                warn!(error = %e, "Resource sampling failed, using safe defaults");
                ResourceMetrics::safe_default(thread_count)
            }
        }
    }

    /// One monitoring cycle: sample, record, alert, advise.
    pub fn tick(&self) -> ResourceMetrics {
        let metrics = self.sample();

        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(metrics.clone());
        }

        let _ = self
            .event_tx
            .send(ResourceEvent::MetricsUpdated(metrics.clone()));
        self.check_thresholds(&metrics);
        self.check_scaling();

        metrics
    }

    fn check_thresholds(&self, metrics: &ResourceMetrics) {
        let limits = &self.limits;
        let mut critical = Vec::new();

        if metrics.is_memory_critical(limits) {
            critical.push((
                ResourceKind::Memory,
                format!("Memory usage critical: {:.1}%", metrics.memory_percent),
            ));
        }
        if metrics.is_cpu_critical(limits) {
            critical.push((
                ResourceKind::Cpu,
                format!("CPU usage critical: {:.1}%", metrics.cpu_usage_percent),
            ));
        }
        if metrics.is_disk_critical(limits) {
            critical.push((
                ResourceKind::Disk,
                format!("Disk space critical: {:.0} MB free", metrics.disk_free_mb),
            ));
        }

        if !critical.is_empty() {
            for (resource, message) in critical {
                warn!(%resource, "{}", message);
                let _ = self
                    .event_tx
                    .send(ResourceEvent::Critical { resource, message });
            }
            return;
        }

        let mut warnings = Vec::new();
        if metrics.is_memory_warning(limits) {
            warnings.push((
                ResourceKind::Memory,
                format!("Memory usage high: {:.1}%", metrics.memory_percent),
            ));
        }
        if metrics.is_cpu_warning(limits) {
            warnings.push((
                ResourceKind::Cpu,
                format!("CPU usage high: {:.1}%", metrics.cpu_usage_percent),
            ));
        }
        for (resource, message) in warnings {
            debug!(%resource, "{}", message);
            let _ = self
                .event_tx
                .send(ResourceEvent::Warning { resource, message });
        }
    }

    /// Evaluate scaling against the recorded history and emit a
    /// recommendation when one applies.
    pub fn check_scaling(&self) -> Option<(ScalingAction, usize)> {
        let history = self.history.lock();
        if history.len() < MIN_SAMPLES_FOR_SCALING {
            return None;
        }
        let latest = history.back()?;
        let current = latest.thread_count.max(1);

        let recommendation = if latest.is_critical(&self.limits) {
            let target = ((current as f64 * SCALE_DOWN_FACTOR) as usize).max(1);
            (target < current).then_some((ScalingAction::ScaleDown, target))
        } else if current < MAX_RECOMMENDED_THREADS && self.is_idle(&history) {
            let scaled = (current as f64 * self.limits.thread_scale_factor) as usize;
            let target = scaled.max(current + 1).min(MAX_RECOMMENDED_THREADS);
            Some((ScalingAction::ScaleUp, target))
        } else {
            None
        };
        drop(history);

        if let Some((action, recommended)) = recommendation {
            info!(%action, current, recommended, "Worker scaling recommended");
            let _ = self.event_tx.send(ResourceEvent::ScalingRecommended {
                action,
                current,
                recommended,
            });
        }
        recommendation
    }

    /// The last `SCALE_UP_WINDOW` samples all averaged below the idle line.
    fn is_idle(&self, history: &VecDeque<ResourceMetrics>) -> bool {
        if history.len() < SCALE_UP_WINDOW {
            return false;
        }
        let recent: Vec<_> = history.iter().rev().take(SCALE_UP_WINDOW).collect();
        let n = recent.len() as f64;
        let avg_memory = recent.iter().map(|m| m.memory_percent).sum::<f64>() / n;
        let avg_cpu = recent.iter().map(|m| m.cpu_usage_percent).sum::<f64>() / n;
        let idle_threshold = self.limits.warning_threshold_percent * IDLE_RATIO;
        avg_memory < idle_threshold && avg_cpu < idle_threshold
    }

    pub fn current_metrics(&self) -> Option<ResourceMetrics> {
        self.history.lock().back().cloned()
    }

    pub fn history(&self) -> Vec<ResourceMetrics> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn should_scale_down(&self) -> bool {
        self.current_metrics()
            .is_some_and(|m| m.is_critical(&self.limits))
    }

    /// Worker count suited to the latest sample.
    pub fn get_optimal_thread_count(&self) -> usize {
        let Some(latest) = self.current_metrics() else {
            return 2;
        };
        optimal_thread_count(&latest, &self.limits, logical_cpus())
    }

    pub fn resource_summary(&self) -> Option<ResourceSummary> {
        let (current, samples, avg_memory_percent, avg_cpu_percent) = {
            let history = self.history.lock();
            let current = history.back()?.clone();
            let recent: Vec<_> = history.iter().rev().take(SUMMARY_WINDOW).collect();
            let n = recent.len() as f64;
            (
                current,
                history.len(),
                recent.iter().map(|m| m.memory_percent).sum::<f64>() / n,
                recent.iter().map(|m| m.cpu_usage_percent).sum::<f64>() / n,
            )
        };
        let baseline = self.baseline.lock().clone();

        Some(ResourceSummary {
            status: current.status(&self.limits),
            optimal_thread_count: optimal_thread_count(&current, &self.limits, logical_cpus()),
            current,
            samples,
            avg_memory_percent,
            avg_cpu_percent,
            baseline_memory_mb: baseline.as_ref().map(|b| b.memory_usage_mb),
            baseline_cpu_percent: baseline.as_ref().map(|b| b.cpu_usage_percent),
        })
    }
}

fn logical_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn optimal_thread_count(latest: &ResourceMetrics, limits: &ResourceLimits, cpus: usize) -> usize {
    let mut threads = cpus.max(1) as f64;
    if latest.is_memory_warning(limits) {
        threads = (threads / 2.0).floor();
    }
    if latest.is_cpu_warning(limits) {
        threads = (threads * SCALE_DOWN_FACTOR).floor();
    }
    (threads as usize).clamp(1, MAX_RECOMMENDED_THREADS)
}

fn to_metrics(snapshot: &SystemSnapshot, thread_count: usize) -> ResourceMetrics {
    let memory_percent = if snapshot.memory_total_bytes > 0 {
        snapshot.memory_used_bytes as f64 / snapshot.memory_total_bytes as f64 * 100.0
    } else {
        0.0
    };
    let disk_usage_percent = if snapshot.disk_total_bytes > 0 {
        let used = snapshot
            .disk_total_bytes
            .saturating_sub(snapshot.disk_available_bytes);
        used as f64 / snapshot.disk_total_bytes as f64 * 100.0
    } else {
        0.0
    };

    ResourceMetrics {
        memory_usage_mb: snapshot.memory_used_bytes as f64 / BYTES_PER_MB,
        memory_percent,
        memory_available_mb: snapshot.memory_available_bytes as f64 / BYTES_PER_MB,
        cpu_usage_percent: snapshot.cpu_percent,
        disk_free_mb: snapshot.disk_available_bytes as f64 / BYTES_PER_MB,
        disk_usage_percent,
        thread_count: thread_count.max(1),
        timestamp: chrono::Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::Arc;

    const GB: u64 = 1024 * 1024 * 1024;

    /// Replays a shared, mutable reading.
    struct MockSource {
        reading: Arc<Mutex<Option<SystemSnapshot>>>,
    }

    impl MetricsSource for MockSource {
        fn snapshot(&mut self) -> Result<SystemSnapshot> {
            (*self.reading.lock())
                .ok_or_else(|| Error::Other("sensor offline".to_string()))
        }
    }

    fn reading(memory_percent: f64, cpu_percent: f64) -> SystemSnapshot {
        let total = 16 * GB;
        let used = (total as f64 * memory_percent / 100.0) as u64;
        SystemSnapshot {
            memory_total_bytes: total,
            memory_used_bytes: used,
            memory_available_bytes: total - used,
            cpu_percent,
            disk_total_bytes: 500 * GB,
            disk_available_bytes: 200 * GB,
        }
    }

    fn monitor_with(
        snapshot: Option<SystemSnapshot>,
    ) -> (ResourceMonitor, Arc<Mutex<Option<SystemSnapshot>>>) {
        let reading = Arc::new(Mutex::new(snapshot));
        let source = MockSource {
            reading: reading.clone(),
        };
        let monitor =
            ResourceMonitor::with_source(ResourceLimits::default(), Box::new(source)).unwrap();
        (monitor, reading)
    }

    fn drain(rx: &mut broadcast::Receiver<ResourceEvent>) -> Vec<ResourceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_sample_converts_units() {
        let (monitor, _) = monitor_with(Some(reading(50.0, 12.5)));
        monitor.set_worker_count(3);
        let metrics = monitor.sample();
        assert!((metrics.memory_percent - 50.0).abs() < 0.01);
        assert!((metrics.memory_usage_mb - 8192.0).abs() < 1.0);
        assert_eq!(metrics.cpu_usage_percent, 12.5);
        assert!((metrics.disk_usage_percent - 60.0).abs() < 0.01);
        assert_eq!(metrics.thread_count, 3);
    }

    #[test]
    fn test_sampling_failure_yields_safe_reading() {
        let (monitor, _) = monitor_with(None);
        let metrics = monitor.sample();
        assert_eq!(metrics.memory_percent, 0.0);
        assert_eq!(metrics.cpu_usage_percent, 0.0);
        assert!(!metrics.is_critical(monitor.limits()));
    }

    #[test]
    fn test_history_is_bounded() {
        let (monitor, _) = monitor_with(Some(reading(20.0, 20.0)));
        for _ in 0..(HISTORY_CAPACITY + 25) {
            monitor.tick();
        }
        assert_eq!(monitor.history().len(), HISTORY_CAPACITY);
    }

    #[test]
    fn test_critical_suppresses_warnings() {
        let (monitor, _) = monitor_with(Some(reading(85.0, 75.0)));
        let mut rx = monitor.subscribe();
        monitor.tick();

        let events = drain(&mut rx);
        assert!(matches!(events[0], ResourceEvent::MetricsUpdated(_)));
        let critical: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ResourceEvent::Critical { resource, .. } => Some(*resource),
                _ => None,
            })
            .collect();
        assert_eq!(critical, vec![ResourceKind::Memory]);
        assert!(!events.iter().any(|e| matches!(e, ResourceEvent::Warning { .. })));
    }

    #[test]
    fn test_warning_events() {
        let (monitor, _) = monitor_with(Some(reading(75.0, 72.0)));
        let mut rx = monitor.subscribe();
        monitor.tick();

        let warnings = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ResourceEvent::Warning { .. }))
            .count();
        assert_eq!(warnings, 2);
    }

    #[test]
    fn test_scale_down_on_critical() {
        let (monitor, reading_slot) = monitor_with(Some(reading(30.0, 30.0)));
        monitor.set_worker_count(4);
        monitor.tick();
        monitor.tick();

        *reading_slot.lock() = Some(reading(30.0, 95.0));
        let mut rx = monitor.subscribe();
        monitor.tick();

        let recommendation = drain(&mut rx).into_iter().find_map(|e| match e {
            ResourceEvent::ScalingRecommended {
                action,
                current,
                recommended,
            } => Some((action, current, recommended)),
            _ => None,
        });
        assert_eq!(recommendation, Some((ScalingAction::ScaleDown, 4, 2)));
        assert!(monitor.should_scale_down());
    }

    #[test]
    fn test_scale_up_when_idle() {
        let (monitor, _) = monitor_with(Some(reading(10.0, 5.0)));
        monitor.set_worker_count(2);
        for samples in 1..SCALE_UP_WINDOW {
            monitor.tick();
            assert_eq!(monitor.history().len(), samples);
            assert_eq!(monitor.check_scaling(), None);
        }

        monitor.tick();
        assert_eq!(monitor.history().len(), SCALE_UP_WINDOW);
        assert_eq!(monitor.check_scaling(), Some((ScalingAction::ScaleUp, 3)));

        monitor.set_worker_count(MAX_RECOMMENDED_THREADS);
        monitor.tick();
        assert_eq!(monitor.check_scaling(), None);
    }

    #[test]
    fn test_no_scaling_before_enough_samples() {
        let (monitor, _) = monitor_with(Some(reading(10.0, 5.0)));
        monitor.tick();
        monitor.tick();
        assert_eq!(monitor.history().len(), 2);
        assert_eq!(monitor.check_scaling(), None);
    }

    #[test]
    fn test_optimal_thread_count() {
        let limits = ResourceLimits::default();
        let mut metrics = ResourceMetrics::safe_default(1);
        assert_eq!(optimal_thread_count(&metrics, &limits, 16), 8);
        assert_eq!(optimal_thread_count(&metrics, &limits, 4), 4);

        metrics.memory_percent = 75.0;
        assert_eq!(optimal_thread_count(&metrics, &limits, 6), 3);

        metrics.cpu_usage_percent = 75.0;
        assert_eq!(optimal_thread_count(&metrics, &limits, 6), 2);
        assert_eq!(optimal_thread_count(&metrics, &limits, 1), 1);
    }

    #[test]
    fn test_optimal_without_history() {
        let (monitor, _) = monitor_with(Some(reading(10.0, 5.0)));
        assert_eq!(monitor.get_optimal_thread_count(), 2);
    }

    #[test]
    fn test_resource_summary() {
        let (monitor, reading_slot) = monitor_with(Some(reading(20.0, 10.0)));
        assert!(monitor.resource_summary().is_none());

        monitor.tick();
        *reading_slot.lock() = Some(reading(40.0, 30.0));
        monitor.tick();

        let summary = monitor.resource_summary().unwrap();
        assert_eq!(summary.samples, 2);
        assert!((summary.avg_memory_percent - 30.0).abs() < 0.01);
        assert!((summary.avg_cpu_percent - 20.0).abs() < 0.01);
        assert_eq!(summary.status, "NORMAL");
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let reading = Arc::new(Mutex::new(Some(reading(20.0, 10.0))));
        let limits = ResourceLimits {
            check_interval_ms: 10,
            ..Default::default()
        };
        let monitor = Arc::new(
            ResourceMonitor::with_source(limits, Box::new(MockSource { reading })).unwrap(),
        );

        monitor.start();
        assert!(monitor.is_running());
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        monitor.stop();
        assert!(!monitor.is_running());

        let samples = monitor.history().len();
        assert!(samples >= 1);
        assert!(monitor.resource_summary().unwrap().baseline_memory_mb.is_some());
    }
}
