//! Failure classification for retry decisions.

use serde::{Deserialize, Serialize};
use std::io;

use crate::error::ProcessingError;

/// Retry-relevant category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    /// Likely to succeed if tried again (network hiccups, timeouts, 5xx).
    Temporary,
    /// Will fail the same way every time (missing file, 4xx).
    Permanent,
    /// The process itself is in trouble; stop immediately.
    Critical,
}

/// Maps a [`ProcessingError`] to an [`ErrorType`].
///
/// Unrecognized failures are treated as temporary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, error: &ProcessingError) -> ErrorType {
        if let Some(status) = error.status_code() {
            return classify_status(status);
        }

        match error {
            ProcessingError::Connection(_) | ProcessingError::Timeout(_) => ErrorType::Temporary,
            ProcessingError::NotFound(_)
            | ProcessingError::PermissionDenied(_)
            | ProcessingError::IsADirectory(_) => ErrorType::Permanent,
            ProcessingError::OutOfMemory(_) | ProcessingError::Aborted(_) => ErrorType::Critical,
            ProcessingError::Io(e) => classify_io(e),
            _ => ErrorType::Temporary,
        }
    }
}

fn classify_status(status: u16) -> ErrorType {
    match status {
        500..=599 => ErrorType::Temporary,
        400..=499 => ErrorType::Permanent,
        _ => ErrorType::Temporary,
    }
}

fn classify_io(error: &io::Error) -> ErrorType {
    match error.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied | io::ErrorKind::IsADirectory => {
            ErrorType::Permanent
        }
        io::ErrorKind::OutOfMemory => ErrorType::Critical,
        _ => ErrorType::Temporary,
    }
}
