//! Engine configuration.
//!
//! Every section has defaults, so a partial (or missing) TOML file is valid.
//! Bounds are checked by [`EngineConfig::validate`]; out-of-range values are
//! rejected rather than clamped.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::cancellation::CancellationConfig;
use crate::progress::ProgressConfig;
use crate::queue::QueueConfig;
use crate::resource::ResourceLimits;
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Per-attempt limits on collaborator calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_ingestion_timeout_secs")]
    pub ingestion_secs: u64,
    #[serde(default = "default_extraction_timeout_secs")]
    pub extraction_secs: u64,
}

fn default_ingestion_timeout_secs() -> u64 {
    300
}

fn default_extraction_timeout_secs() -> u64 {
    180
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ingestion_secs: default_ingestion_timeout_secs(),
            extraction_secs: default_extraction_timeout_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn ingestion(&self) -> Duration {
        Duration::from_secs(self.ingestion_secs)
    }

    pub fn extraction(&self) -> Duration {
        Duration::from_secs(self.extraction_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Master switch; when off every enhanced feature is disabled.
    #[serde(default = "default_true")]
    pub enhanced_mode_enabled: bool,
    #[serde(default = "default_true")]
    pub retry_enabled: bool,
    #[serde(default = "default_true")]
    pub resource_monitoring_enabled: bool,
    #[serde(default = "default_true")]
    pub detailed_progress_enabled: bool,
    #[serde(default = "default_true")]
    pub enhanced_cancellation_enabled: bool,
    /// Route batches through the processing queue.
    #[serde(default)]
    pub intelligent_queue_enabled: bool,

    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub cancellation: CancellationConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enhanced_mode_enabled: true,
            retry_enabled: true,
            resource_monitoring_enabled: true,
            detailed_progress_enabled: true,
            enhanced_cancellation_enabled: true,
            intelligent_queue_enabled: false,
            retry: RetryPolicy::default(),
            resources: ResourceLimits::default(),
            progress: ProgressConfig::default(),
            cancellation: CancellationConfig::default(),
            queue: QueueConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl EngineConfig {
    /// `<config dir>/docflow/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("docflow").join("config.toml"))
    }

    /// Load and validate `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => {
                debug!(path = %path.display(), "Loading configuration");
                toml::from_str::<Self>(&contents)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No configuration file, using defaults");
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Write as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.resources.validate()?;
        self.progress.validate()?;
        self.cancellation.validate()?;
        self.queue.validate()?;
        if self.timeouts.ingestion_secs == 0 || self.timeouts.extraction_secs == 0 {
            return Err(Error::config("timeouts must be positive"));
        }
        Ok(())
    }

    /// Turn every enhanced feature off.
    pub fn disable_enhanced_mode(&mut self) {
        self.enhanced_mode_enabled = false;
        self.retry_enabled = false;
        self.resource_monitoring_enabled = false;
        self.detailed_progress_enabled = false;
        self.enhanced_cancellation_enabled = false;
        self.intelligent_queue_enabled = false;
    }

    pub fn retry_active(&self) -> bool {
        self.enhanced_mode_enabled && self.retry_enabled
    }

    pub fn resource_monitoring_active(&self) -> bool {
        self.enhanced_mode_enabled && self.resource_monitoring_enabled
    }

    pub fn detailed_progress_active(&self) -> bool {
        self.enhanced_mode_enabled && self.detailed_progress_enabled
    }

    pub fn enhanced_cancellation_active(&self) -> bool {
        self.enhanced_mode_enabled && self.enhanced_cancellation_enabled
    }

    pub fn intelligent_queue_active(&self) -> bool {
        self.enhanced_mode_enabled && self.intelligent_queue_enabled
    }

    pub fn active_features(&self) -> Vec<&'static str> {
        [
            (self.retry_active(), "retry"),
            (self.resource_monitoring_active(), "resource_monitoring"),
            (self.detailed_progress_active(), "detailed_progress"),
            (self.enhanced_cancellation_active(), "enhanced_cancellation"),
            (self.intelligent_queue_active(), "intelligent_queue"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }

    /// Valid but questionable settings.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.resources.warning_threshold_percent >= self.resources.max_memory_percent {
            warnings.push(format!(
                "resources.warning_threshold_percent ({}) is not below max_memory_percent ({})",
                self.resources.warning_threshold_percent, self.resources.max_memory_percent
            ));
        }
        if self.queue.max_workers > 8 {
            warnings.push(format!(
                "queue.max_workers = {} may oversubscribe the host",
                self.queue.max_workers
            ));
        }
        if self.retry.max_attempts > 10 {
            warnings.push(format!(
                "retry.max_attempts = {} can make failing batches very slow",
                self.retry.max_attempts
            ));
        }
        if self.progress.update_interval_ms < 250 {
            warnings.push("progress.update_interval_ms below 250 adds overhead".to_string());
        }
        if !self.enhanced_mode_enabled {
            warnings.push("enhanced mode is disabled; all enhanced features are off".to_string());
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.warnings().is_empty());
        assert_eq!(config.timeouts.ingestion(), Duration::from_secs(300));
        assert_eq!(config.timeouts.extraction(), Duration::from_secs(180));
        assert_eq!(
            config.active_features(),
            vec![
                "retry",
                "resource_monitoring",
                "detailed_progress",
                "enhanced_cancellation"
            ]
        );
    }

    #[test]
    fn test_disabling_enhanced_mode_disables_everything() {
        let mut config = EngineConfig {
            intelligent_queue_enabled: true,
            ..Default::default()
        };
        assert!(config.intelligent_queue_active());

        config.enhanced_mode_enabled = false;
        assert!(config.active_features().is_empty());
        assert!(!config.retry_active());

        config.disable_enhanced_mode();
        assert!(!config.intelligent_queue_enabled);
    }

    #[test]
    fn test_partial_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            intelligent_queue_enabled = true

            [retry]
            max_attempts = 5

            [queue]
            max_workers = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_factor, 2.0);
        assert_eq!(config.queue.max_workers, 4);
        assert_eq!(config.queue.min_workers, 1);
        assert!(config.retry_enabled);
        assert!(config.intelligent_queue_enabled);
    }

    #[test]
    fn test_load_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        assert_eq!(EngineConfig::load(&path).unwrap(), EngineConfig::default());

        let mut config = EngineConfig::default();
        config.retry.max_attempts = 4;
        config.cancellation.max_state_files = 3;
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        std::fs::write(&path, "[retry]\nmax_attempts = 0\n").unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(Error::Configuration(_))
        ));

        std::fs::write(&path, "retry = [").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(Error::TomlDecode(_))));

        std::fs::write(&path, "[queue]\nmin_workers = 6\nmax_workers = 4\n").unwrap();
        assert!(EngineConfig::load(&path).is_err());
    }

    #[test]
    fn test_warnings() {
        let mut config = EngineConfig::default();
        config.resources.warning_threshold_percent = 85.0;
        config.queue = QueueConfig::default().with_workers(4, 1, 12);
        let warnings = config.warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[1].contains("max_workers = 12"));
    }
}
