//! Resource limits and point-in-time samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Static thresholds for the resource monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory usage (percent) above which the system is critical.
    #[serde(default = "default_max_memory_percent")]
    pub max_memory_percent: f64,
    /// CPU usage (percent) above which the system is critical.
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f64,
    /// Usage (percent) above which memory or CPU is reported as a warning.
    #[serde(default = "default_warning_threshold_percent")]
    pub warning_threshold_percent: f64,
    /// Multiplier used when recommending more workers.
    #[serde(default = "default_thread_scale_factor")]
    pub thread_scale_factor: f64,
    /// Sampling interval in milliseconds.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Free disk space (MB) below which the disk is critical.
    #[serde(default = "default_disk_space_threshold_mb")]
    pub disk_space_threshold_mb: u64,
    /// Path whose filesystem is watched for free space.
    #[serde(default = "default_disk_path")]
    pub disk_path: PathBuf,
}

fn default_max_memory_percent() -> f64 {
    80.0
}

fn default_max_cpu_percent() -> f64 {
    90.0
}

fn default_warning_threshold_percent() -> f64 {
    70.0
}

fn default_thread_scale_factor() -> f64 {
    1.5
}

fn default_check_interval_ms() -> u64 {
    5000
}

fn default_disk_space_threshold_mb() -> u64 {
    1000
}

fn default_disk_path() -> PathBuf {
    PathBuf::from(".")
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_percent: default_max_memory_percent(),
            max_cpu_percent: default_max_cpu_percent(),
            warning_threshold_percent: default_warning_threshold_percent(),
            thread_scale_factor: default_thread_scale_factor(),
            check_interval_ms: default_check_interval_ms(),
            disk_space_threshold_mb: default_disk_space_threshold_mb(),
            disk_path: default_disk_path(),
        }
    }
}

fn check_percent(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(Error::config(format!(
            "resource.{name} must be in (0, 100], got {value}"
        )))
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<()> {
        check_percent("max_memory_percent", self.max_memory_percent)?;
        check_percent("max_cpu_percent", self.max_cpu_percent)?;
        check_percent("warning_threshold_percent", self.warning_threshold_percent)?;
        if !self.thread_scale_factor.is_finite() || self.thread_scale_factor < 1.0 {
            return Err(Error::config("resource.thread_scale_factor must be >= 1.0"));
        }
        if self.check_interval_ms == 0 {
            return Err(Error::config("resource.check_interval_ms must be positive"));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// One resource sample. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceMetrics {
    pub memory_usage_mb: f64,
    pub memory_percent: f64,
    pub memory_available_mb: f64,
    pub cpu_usage_percent: f64,
    pub disk_free_mb: f64,
    pub disk_usage_percent: f64,
    pub thread_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl ResourceMetrics {
    /// Reading used when sampling fails: no load, plenty of headroom.
    pub fn safe_default(thread_count: usize) -> Self {
        Self {
            memory_usage_mb: 0.0,
            memory_percent: 0.0,
            memory_available_mb: 1000.0,
            cpu_usage_percent: 0.0,
            disk_free_mb: 1000.0,
            disk_usage_percent: 0.0,
            thread_count: thread_count.max(1),
            timestamp: Utc::now(),
        }
    }

    pub fn is_memory_critical(&self, limits: &ResourceLimits) -> bool {
        self.memory_percent > limits.max_memory_percent
    }

    pub fn is_memory_warning(&self, limits: &ResourceLimits) -> bool {
        self.memory_percent > limits.warning_threshold_percent
    }

    pub fn is_cpu_critical(&self, limits: &ResourceLimits) -> bool {
        self.cpu_usage_percent > limits.max_cpu_percent
    }

    pub fn is_cpu_warning(&self, limits: &ResourceLimits) -> bool {
        self.cpu_usage_percent > limits.warning_threshold_percent
    }

    pub fn is_disk_critical(&self, limits: &ResourceLimits) -> bool {
        self.disk_free_mb < limits.disk_space_threshold_mb as f64
    }

    pub fn is_critical(&self, limits: &ResourceLimits) -> bool {
        self.is_memory_critical(limits) || self.is_cpu_critical(limits) || self.is_disk_critical(limits)
    }

    /// Human readable status, e.g. `"MEMORY_CRITICAL, CPU_WARNING"` or `"NORMAL"`.
    pub fn status(&self, limits: &ResourceLimits) -> String {
        let mut parts = Vec::new();

        if self.is_memory_critical(limits) {
            parts.push("MEMORY_CRITICAL");
        } else if self.is_memory_warning(limits) {
            parts.push("MEMORY_WARNING");
        }

        if self.is_cpu_critical(limits) {
            parts.push("CPU_CRITICAL");
        } else if self.is_cpu_warning(limits) {
            parts.push("CPU_WARNING");
        }

        if self.is_disk_critical(limits) {
            parts.push("DISK_CRITICAL");
        }

        if parts.is_empty() {
            "NORMAL".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Averages over recent samples.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSummary {
    pub current: ResourceMetrics,
    pub samples: usize,
    pub avg_memory_percent: f64,
    pub avg_cpu_percent: f64,
    pub baseline_memory_mb: Option<f64>,
    pub baseline_cpu_percent: Option<f64>,
    pub optimal_thread_count: usize,
    pub status: String,
}
