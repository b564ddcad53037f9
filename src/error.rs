//! Error types for the quarry crate.
//!
//! The taxonomy follows the session lifecycle: configuration and decode
//! errors are detected before any scanning starts, storage and evaluator
//! errors abort a running session, and cancellation is a graceful teardown
//! rather than a failure.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, QuarryError>;

/// All errors surfaced by the scan evaluation core.
#[derive(Error, Debug)]
pub enum QuarryError {
    /// Invalid, missing, or contradictory options. Fails validation and
    /// never reaches the evaluation phase.
    #[error("configuration error: {0}")]
    Config(String),

    /// Corrupt compressed sub-document. Aborts the session.
    #[error("decode error: {0}")]
    Decode(String),

    /// Spill store unreachable or a run write/read failed. Fatal to the
    /// affected term, which is fatal to the session.
    #[error("storage error: {0}")]
    Storage(String),

    /// The boolean predicate evaluator reported a failure mid-scan.
    #[error("evaluator error: {0}")]
    Evaluator(String),

    /// Cooperative cancellation. Not a failure: external runs are released
    /// and partial results are reported as cancelled.
    #[error("scan session cancelled")]
    Cancelled,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QuarryError {
    /// Create a configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        QuarryError::Config(message.into())
    }

    /// Create a decode error.
    pub fn decode<S: Into<String>>(message: S) -> Self {
        QuarryError::Decode(message.into())
    }

    /// Create a storage error.
    pub fn storage<S: Into<String>>(message: S) -> Self {
        QuarryError::Storage(message.into())
    }

    /// Create an evaluator error.
    pub fn evaluator<S: Into<String>>(message: S) -> Self {
        QuarryError::Evaluator(message.into())
    }

    /// True when this error represents cooperative cancellation rather
    /// than a genuine failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, QuarryError::Cancelled)
    }
}
