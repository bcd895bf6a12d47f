//! Error types for Linetag.
//!
//! Library crates use [`LinetagError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Linetag operations.
#[derive(Debug, thiserror::Error)]
pub enum LinetagError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to the record source or a webhook.
    #[error("network error: {0}")]
    Network(String),

    /// Input parsing error (record files, taxonomy files, chunk outputs).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Classification backend error that escaped chunk isolation.
    #[error("classification error: {0}")]
    Classification(String),

    /// Merged output does not reconcile with the input record set.
    ///
    /// Always fatal: nothing downstream may treat the merged table as trustworthy.
    #[error("reconciliation error: {message}")]
    Reconciliation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad chunk size, unknown pass, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Downstream publish target rejected or under-acknowledged the table.
    #[error("publish error: {0}")]
    Publish(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LinetagError>;

impl LinetagError {
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

    /// Create a reconciliation error from any displayable message.
    pub fn reconciliation(msg: impl Into<String>) -> Self {
        Self::Reconciliation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means the run's data integrity is compromised.
    pub fn is_fatal_integrity(&self) -> bool {
        matches!(self, Self::Reconciliation { .. })
    }
}
