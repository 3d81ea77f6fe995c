//! Error taxonomy shared by every hashjoin crate.
//!
//! Cancellation is the only failure that is expected during normal operation.
//! Settings errors surface while building a join specification; spill errors
//! surface only when partitions have been written to disk.

use std::io;

/// Errors produced by the hash join engine.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// The surrounding operation was canceled. Terminal for the whole join.
    #[error("join execution canceled")]
    Canceled,

    /// Join or table settings are inconsistent.
    #[error("invalid join settings: {detail}")]
    InvalidSettings { detail: String },

    /// A spill file failed structural or checksum validation.
    #[error("spill file corrupt: {detail}")]
    SpillCorrupt { detail: String },

    /// Configuration could not be parsed.
    #[error("invalid join configuration: {detail}")]
    Config { detail: String },

    /// I/O failure while spilling partitions.
    #[error("spill i/o error: {0}")]
    Io(#[from] io::Error),

    /// Broken internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl JoinError {
    /// Build an [`JoinError::Internal`] from anything string-like.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Build an [`JoinError::InvalidSettings`] from anything string-like.
    #[must_use]
    pub fn invalid_settings(detail: impl Into<String>) -> Self {
        Self::InvalidSettings {
            detail: detail.into(),
        }
    }

    /// Whether this error is the cancellation signal.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Result alias used throughout the workspace.
pub type Result<T, E = JoinError> = std::result::Result<T, E>;
