//! Error taxonomy shared by every component.
//!
//! Callers need to tell three situations apart: the request itself is wrong
//! ([`ErrorKind::FixInput`]), a provider is temporarily unable to serve
//! ([`ErrorKind::RetryLater`]), or the system is in a state an operator has
//! to look at ([`ErrorKind::OperatorAttention`]). [`RagError::kind`] performs
//! that classification.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, RagError>;

/// Errors surfaced by the chunker, embedder, index, and orchestrator.
#[derive(Debug, Error)]
pub enum RagError {
    /// Malformed parameters, dimensionality mismatch, stale versions.
    /// Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A provider kept failing transiently until the retry budget ran out.
    #[error("provider unavailable after {attempts} attempt(s): {message}")]
    ProviderUnavailable { attempts: u32, message: String },

    /// Persisted index state failed an integrity check. The index instance
    /// must not serve results.
    #[error("index corruption: {0}")]
    IndexCorruption(String),

    /// The storage backend failed (I/O, database driver).
    #[error("storage error: {0}")]
    Storage(String),
}

impl RagError {
    pub fn invalid(message: impl Into<String>) -> Self {
        RagError::InvalidInput(message.into())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        RagError::Storage(err.to_string())
    }

    /// Classify the error for callers deciding what to do next.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RagError::InvalidInput(_) => ErrorKind::FixInput,
            RagError::ProviderUnavailable { .. } => ErrorKind::RetryLater,
            RagError::IndexCorruption(_) | RagError::Storage(_) => ErrorKind::OperatorAttention,
        }
    }
}

/// Coarse caller-facing error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FixInput,
    RetryLater,
    OperatorAttention,
}

/// Failure reported by an embedding or generation provider adapter.
///
/// The variants drive the retry policy in
/// [`Embedder`](crate::embedding::Embedder): rate limits and outages are
/// retried, invalid input is not.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("provider rejected input: {0}")]
    InvalidInput(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProviderError::InvalidInput(_))
    }
}
