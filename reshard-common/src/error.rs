//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `reshard`.
pub type ReshardResult<T> = Result<T, ReshardError>;

/// High-level error categories.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReshardError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Plan, plan file, or partitioning descriptor is malformed or inconsistent.
    #[error("plan error: {0}")]
    Plan(String),

    /// Extraction, loading, or undo bookkeeping failed inside a partition engine.
    #[error("storage error: {0}")]
    Storage(String),

    /// Caller broke an API contract (for example a router returned an unknown consumer).
    #[error("contract violation: {0}")]
    Contract(String),

    /// Filesystem I/O failed.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ReshardError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<serde_json::Error> for ReshardError {
    fn from(error: serde_json::Error) -> Self {
        Self::Plan(error.to_string())
    }
}
