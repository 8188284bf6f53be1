//! Versioned on-disk storage of processing states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use super::state::ProcessingState;
use crate::utils::sanitize_filename;
use crate::{Error, Result};

pub const STATE_VERSION: &str = "1.0";
const FILE_PREFIX: &str = "processing_state_";
const MAX_COLLISION_SUFFIX: u32 = 999;

/// Summary stored next to the state for listing without full decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFileMetadata {
    pub session_id: String,
    pub progress: f64,
    pub current_file: String,
    pub remaining_files: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateEnvelope {
    version: String,
    /// Seconds since the Unix epoch.
    saved_at: f64,
    state: ProcessingState,
    metadata: StateFileMetadata,
}

/// A saved state as seen in the state directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedStateInfo {
    pub path: PathBuf,
    pub saved_at: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
    pub metadata: Option<StateFileMetadata>,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    directory: PathBuf,
    max_files: usize,
}

impl StateStore {
    pub fn new(directory: impl Into<PathBuf>, max_files: usize) -> Self {
        Self {
            directory: directory.into(),
            max_files: max_files.max(1),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Write `state` and prune files beyond the retention cap.
    pub async fn save(&self, state: &ProcessingState) -> Result<PathBuf> {
        state.validate()?;
        tokio::fs::create_dir_all(&self.directory).await?;

        let now = Utc::now();
        let envelope = StateEnvelope {
            version: STATE_VERSION.to_string(),
            saved_at: now.timestamp_millis() as f64 / 1000.0,
            state: state.clone(),
            metadata: StateFileMetadata {
                session_id: state.session_id.clone(),
                progress: state.completion_percentage,
                current_file: state.current_file_name.clone(),
                remaining_files: state.remaining_files().len(),
            },
        };
        let json = serde_json::to_string_pretty(&envelope)?;

        let path = self.unused_path(&state.session_id, now.timestamp()).await?;
        tokio::fs::write(&path, json).await?;
        info!(
            path = %path.display(),
            session_id = %state.session_id,
            "Processing state saved"
        );

        if let Err(e) = self.enforce_retention().await {
            warn!(error = %e, "Failed to prune old state files");
        }
        Ok(path)
    }

    /// `<prefix><session>_<ts>.json`, or with a `_NNN` suffix above any file
    /// already saved for the same session and second.
    async fn unused_path(&self, session_id: &str, timestamp: i64) -> Result<PathBuf> {
        let base = format!(
            "{FILE_PREFIX}{}_{timestamp}",
            sanitize_filename(session_id)
        );
        let plain = format!("{base}.json");
        let suffixed = format!("{base}_");

        let mut highest: Option<u32> = None;
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let taken = if name == plain {
                Some(0)
            } else {
                name.strip_prefix(&suffixed)
                    .and_then(|rest| rest.strip_suffix(".json"))
                    .and_then(|n| n.parse::<u32>().ok())
            };
            if let Some(n) = taken {
                highest = highest.max(Some(n));
            }
        }

        match highest {
            None => Ok(self.directory.join(plain)),
            Some(n) if n < MAX_COLLISION_SUFFIX => {
                Ok(self.directory.join(format!("{base}_{:03}.json", n + 1)))
            }
            Some(_) => Err(Error::invalid_state(format!(
                "too many state files for session {session_id} at {timestamp}"
            ))),
        }
    }

    /// Read a saved state. A version mismatch is logged and parsing continues.
    pub async fn load(&self, path: &Path) -> Result<ProcessingState> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("state file", path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let value: serde_json::Value = serde_json::from_str(&contents).map_err(|e| {
            Error::invalid_state(format!("malformed state file {}: {e}", path.display()))
        })?;

        match value.get("version").and_then(|v| v.as_str()) {
            Some(STATE_VERSION) => {}
            other => warn!(
                path = %path.display(),
                found = other.unwrap_or("<missing>"),
                expected = STATE_VERSION,
                "State file version mismatch"
            ),
        }

        let state_value = value.get("state").cloned().ok_or_else(|| {
            Error::invalid_state(format!("state file {} has no state", path.display()))
        })?;
        let state: ProcessingState = serde_json::from_value(state_value).map_err(|e| {
            Error::invalid_state(format!("invalid state in {}: {e}", path.display()))
        })?;
        state.validate()?;

        debug!(path = %path.display(), session_id = %state.session_id, "Processing state loaded");
        Ok(state)
    }

    /// Saved states, newest first.
    pub async fn list(&self) -> Result<Vec<SavedStateInfo>> {
        let mut states = Vec::new();
        for (path, modified) in self.state_files().await? {
            let envelope = tokio::fs::read_to_string(&path)
                .await
                .ok()
                .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok());

            let saved_at = envelope
                .as_ref()
                .and_then(|v| v.get("saved_at"))
                .and_then(|v| v.as_f64())
                .and_then(|secs| DateTime::from_timestamp_millis((secs * 1000.0) as i64));
            let metadata = envelope
                .and_then(|mut v| v.get_mut("metadata").map(serde_json::Value::take))
                .and_then(|m| serde_json::from_value(m).ok());

            states.push(SavedStateInfo {
                path,
                saved_at,
                modified: DateTime::<Utc>::from(modified),
                metadata,
            });
        }
        Ok(states)
    }

    pub async fn delete(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!(path = %path.display(), "Deleted state file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("state file", path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the oldest state files beyond the cap; returns how many went.
    pub async fn enforce_retention(&self) -> Result<usize> {
        let files = self.state_files().await?;
        let mut deleted = 0;
        for (path, _) in files.into_iter().skip(self.max_files) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(path = %path.display(), "Deleted old state file");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old state file"),
            }
        }
        if deleted > 0 {
            info!(count = deleted, "Cleaned up old state files");
        }
        Ok(deleted)
    }

    /// State files with their modification times, newest first.
    async fn state_files(&self) -> Result<Vec<(PathBuf, SystemTime)>> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_state_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(FILE_PREFIX) && name.ends_with(".json"));
            if !is_state_file {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            files.push((path, metadata.modified()?));
        }

        files.sort_by(|(a_path, a_time), (b_path, b_time)| {
            b_time.cmp(a_time).then_with(|| b_path.cmp(a_path))
        });
        Ok(files)
    }
}
