//! Tracing subscriber setup.
//!
//! Console output always; a daily rolling file in `log_dir` when one is given.
//! Timestamps use the local timezone.

use chrono::{Local, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::{Error, Result};

pub const DEFAULT_LOG_FILTER: &str = "docflow=info,docflow_cli=info";

pub const LOG_FILE_PREFIX: &str = "docflow.log";

const DEFAULT_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Overrides `RUST_LOG` when set.
    pub filter: Option<String>,
    pub log_dir: Option<PathBuf>,
    /// JSON lines on the console instead of human-readable output.
    pub json: bool,
    pub retention_days: i64,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            filter: None,
            log_dir: None,
            json: false,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the lifetime of the program, dropping it
/// flushes the file writer.
pub fn init_logging(options: &LoggingOptions) -> Result<Option<WorkerGuard>> {
    let filter = match &options.filter {
        Some(directive) => EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("invalid log filter {directive:?}: {e}")))?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };

    let console = if options.json {
        fmt::layer().json().with_timer(LocalTimer).boxed()
    } else {
        fmt::layer().with_ansi(true).with_timer(LocalTimer).boxed()
    };

    let (file, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to set global subscriber: {e}")))?;

    Ok(guard)
}

/// Delete rolled log files (`docflow.log.YYYY-MM-DD`) older than
/// `retention_days`. Returns how many were removed.
pub async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).date_naive();
    let prefix = format!("{LOG_FILE_PREFIX}.");

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(&prefix))
            .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        else {
            continue;
        };

        if date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old log file"),
            }
        }
    }

    if deleted > 0 {
        info!(count = deleted, "Cleaned up old log files");
    }
    Ok(deleted)
}
