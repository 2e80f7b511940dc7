//! Error types for amlflow.
//!
//! Library crates use [`AmlFlowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all amlflow operations.
#[derive(Debug, thiserror::Error)]
pub enum AmlFlowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to a provider, the reasoning service, or a callback.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed JSON, CSV, or logical path.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Fact store or graph database error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Enrichment provider error (only surfaced outside the adapter contract).
    #[error("enrichment error: {0}")]
    Enrichment(String),

    /// Reasoning service error (extraction or assessment).
    #[error("reasoning error: {0}")]
    Reasoning(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Caller supplied invalid input (empty submission, mismatched ids, ...).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The requested transaction or fact does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Workflow engine trigger or status query failed.
    #[error("workflow engine error: {0}")]
    Engine(String),

    /// A bounded wait expired before the transaction reached a terminal state.
    #[error("timed out: {0}")]
    Timeout(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, AmlFlowError>;

impl AmlFlowError {
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

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error is the caller's fault (maps to a 4xx-style response).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::NotFound(_))
    }
}

impl From<serde_json::Error> for AmlFlowError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = AmlFlowError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = AmlFlowError::validation("transaction text is empty");
        assert!(err.to_string().contains("transaction text is empty"));
    }

    #[test]
    fn client_errors_are_classified() {
        assert!(AmlFlowError::validation("bad").is_client_error());
        assert!(AmlFlowError::NotFound("txn_x".into()).is_client_error());
        assert!(!AmlFlowError::Engine("down".into()).is_client_error());
        assert!(!AmlFlowError::Timeout("600s".into()).is_client_error());
    }
}
