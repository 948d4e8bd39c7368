//! Error taxonomy for the join engine.
//!
//! Every fallible operation in the workspace returns [`Result`]. Errors are
//! never retried internally; they propagate to the caller of the join driver,
//! which decides how to report them.

use thiserror::Error;

/// Errors raised while configuring or executing a join.
#[derive(Debug, Error)]
pub enum JoinError {
    /// The join settings are inconsistent. Raised before any row is read.
    #[error("invalid join settings: {detail}")]
    InvalidSettings { detail: String },

    /// A row from the storage layer does not match its table spec.
    #[error("row '{row_key}' is incompatible at column {column}: {detail}")]
    RowIncompatible {
        row_key: String,
        column: usize,
        detail: String,
    },

    /// Reading or writing a spill partition failed.
    #[error("spill i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A spill file could not be decoded.
    #[error("spill file corrupt: {detail}")]
    SpillCorrupt { detail: String },

    /// A resource budget (open files, offset width) was exceeded.
    #[error("resource exhausted: {detail}")]
    ResourceExhausted { detail: String },

    /// The surrounding execution context requested cancellation.
    #[error("join cancelled")]
    Cancelled,

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl JoinError {
    /// Create an [`JoinError::Internal`] error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an [`JoinError::InvalidSettings`] error.
    pub fn invalid_settings(detail: impl Into<String>) -> Self {
        Self::InvalidSettings {
            detail: detail.into(),
        }
    }

    /// Create a [`JoinError::SpillCorrupt`] error.
    pub fn spill_corrupt(detail: impl Into<String>) -> Self {
        Self::SpillCorrupt {
            detail: detail.into(),
        }
    }

    /// Create a [`JoinError::ResourceExhausted`] error.
    pub fn resource_exhausted(detail: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            detail: detail.into(),
        }
    }

    /// Whether this error is the cancellation signal rather than a failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error was detected before any row was processed.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::InvalidSettings { .. })
    }
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, JoinError>;
