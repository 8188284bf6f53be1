//! Engine-wide error types.
//!
//! Two layers live here: [`Error`] is what engine operations return, and
//! [`ProcessingError`] is what pipeline steps and collaborators (ingestion,
//! extraction, aggregation, queued jobs) fail with. Only the latter is fed to
//! the retry classifier.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config decode error: {0}")]
    TomlDecode(#[from] toml::de::Error),

    #[error("Config encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Processing is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Coarse category of a [`ProcessingError`].
///
/// Retry policies name the kinds they consider retryable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Timeout,
    NotFound,
    PermissionDenied,
    IsADirectory,
    OutOfMemory,
    Aborted,
    Http,
    Io,
    EmptyContent,
    Format,
    Provider,
    Cancelled,
    Other,
}

/// Failure raised by a pipeline step or an external collaborator.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no content extracted from {0}")]
    EmptyContent(String),

    #[error("unsupported or malformed document: {0}")]
    Format(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl ProcessingError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Category used by retry policies.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::IsADirectory(_) => ErrorKind::IsADirectory,
            Self::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Self::Aborted(_) => ErrorKind::Aborted,
            Self::Http { .. } => ErrorKind::Http,
            Self::Io(_) => ErrorKind::Io,
            Self::EmptyContent(_) => ErrorKind::EmptyContent,
            Self::Format(_) => ErrorKind::Format,
            Self::Provider(_) => ErrorKind::Provider,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// HTTP-like status code carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}
