//! # Error Types
//!
//! Custom error types for the stumbler pipeline using `thiserror`.

use thiserror::Error;

/// Main error type for the stumbler pipeline
#[derive(Debug, Error)]
pub enum StumblerError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record or envelope (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Position fix has no usable coordinates
    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    /// Completed slot is occupied and the open segment hit its ceiling
    #[error("Segment backpressure: {0}")]
    Backpressure(String),

    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Http(String),

    /// A blocking worker task panicked or was cancelled
    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    /// Pipeline was built outside a Tokio runtime
    #[error("Runtime error: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    /// Logging subscriber could not be installed
    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type alias for the stumbler pipeline
pub type Result<T> = std::result::Result<T, StumblerError>;
