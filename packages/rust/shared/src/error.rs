//! Error types for MLS.
//!
//! Library crates use [`MlsError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all MLS operations.
#[derive(Debug, thiserror::Error)]
pub enum MlsError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Malformed input document (outline JSON, span encoding, artifact).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Structural inconsistency between a node's span and its children.
    #[error("span mismatch at {node}: {detail}")]
    SpanMismatch { node: String, detail: String },

    /// Two nodes share a join key, so annotations cannot be attached unambiguously.
    #[error("duplicate node key '{key}' at {first} and {second}")]
    DuplicateKey {
        key: String,
        first: String,
        second: String,
    },

    /// Artifact store error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Summarizer call failed.
    #[error("external call failed: {message}")]
    ExternalCall { message: String, retryable: bool },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid value, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, MlsError>;

impl MlsError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a span mismatch for the node identified by `node`.
    pub fn span_mismatch(node: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::SpanMismatch {
            node: node.into(),
            detail: detail.into(),
        }
    }

    /// A summarizer failure worth retrying (rate limit, 5xx, transport).
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::ExternalCall {
            message: msg.into(),
            retryable: true,
        }
    }

    /// A summarizer failure that will not go away on retry.
    pub fn external(msg: impl Into<String>) -> Self {
        Self::ExternalCall {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the failed operation could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExternalCall {
                retryable: true,
                ..
            }
        )
    }
}
