//! Common error types for Fleetbox

use thiserror::Error;

/// Common result type for Fleetbox operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types shared by the Fleetbox crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or message payload
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
