//! Error types for fleetbox-node
//!
//! Defines the node error taxonomy using thiserror, plus the classifier that
//! decides which failures the download layer retries locally.

use std::io;
use thiserror::Error;

/// Main error type for fleetbox-node
#[derive(Error, Debug)]
pub enum Error {
    /// Connection reset/refused/timed out, or a retryable HTTP status
    #[error("Network error: {0}")]
    Network(String),

    /// Chunk or whole-file digest mismatch
    #[error("Checksum mismatch: {0}")]
    Checksum(String),

    /// Disk full, invalid cache path, permission denied
    #[error("File system error: {0}")]
    FileSystem(String),

    /// The media library refused the path (404, 403, 400, ...)
    #[error("Invalid remote path: {0}")]
    InvalidRemotePath(String),

    /// Schedule payload cannot be activated
    #[error("Invalid schedule: {0}")]
    ScheduleInvalid(String),

    /// Track could not be loaded or played
    #[error("Playback error: {0}")]
    Playback(String),

    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Local file I/O errors that were not classified
    #[error("File I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Http(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Download cancelled because its owner was removed
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a failure propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Recovered locally with backoff
    Retryable,
    /// Ends the current job; never retried in place
    Fatal,
    /// Reported, then the caller moves on (skip track, fall back)
    NonFatal,
}

impl Error {
    /// Classify an error for the retry and propagation policy
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Network(_) | Error::Checksum(_) => ErrorClass::Retryable,
            Error::FileSystem(_)
            | Error::InvalidRemotePath(_)
            | Error::Io(_)
            | Error::Database(_)
            | Error::Cancelled(_)
            | Error::Config(_) => ErrorClass::Fatal,
            Error::ScheduleInvalid(_)
            | Error::Playback(_)
            | Error::Serialization(_)
            | Error::Http(_)
            | Error::InvalidState(_)
            | Error::NotFound(_)
            | Error::BadRequest(_)
            | Error::Internal(_) => ErrorClass::NonFatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Map an I/O error from a download into the taxonomy
    ///
    /// Connection-level kinds are network failures; everything else that
    /// touches the local disk is fatal for the job.
    pub fn from_io(context: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Error::Network(format!("{}: {}", context, err)),
            _ => Error::FileSystem(format!("{}: {}", context, err)),
        }
    }

    /// Map a reqwest failure into the taxonomy
    pub fn from_reqwest(context: &str, err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(context, status.as_u16());
        }
        if err.is_builder() {
            return Error::InvalidRemotePath(format!("{}: {}", context, err));
        }
        // Timeouts, connect failures and truncated bodies
        Error::Network(format!("{}: {}", context, err))
    }

    /// Map a non-success HTTP status into the taxonomy
    ///
    /// 408, 429 and 5xx are retryable; other client errors mean the remote
    /// path is invalid.
    pub fn from_status(context: &str, status: u16) -> Self {
        match status {
            408 | 429 | 500..=599 => Error::Network(format!("{}: HTTP {}", context, status)),
            _ => Error::InvalidRemotePath(format!("{}: HTTP {}", context, status)),
        }
    }
}

impl From<fleetbox_common::Error> for Error {
    fn from(err: fleetbox_common::Error) -> Self {
        match err {
            fleetbox_common::Error::Io(e) => Error::Io(e),
            fleetbox_common::Error::Config(msg) => Error::Config(msg),
            fleetbox_common::Error::NotFound(msg) => Error::NotFound(msg),
            fleetbox_common::Error::InvalidInput(msg) => Error::BadRequest(msg),
            fleetbox_common::Error::Serialization(e) => Error::Serialization(e),
        }
    }
}

/// Convenience Result type using fleetbox-node Error
pub type Result<T> = std::result::Result<T, Error>;
