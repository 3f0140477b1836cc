//! Error taxonomy for the import pipeline
//!
//! Configuration errors are fatal and never retried. Source, parse and write
//! errors are recoverable according to the profile's failure policies and
//! only surface here once a policy says `Fail` or an abort threshold trips.

use thiserror::Error;

use crate::models::{ExecutionSummary, RowErrorKind};

pub type Result<T> = std::result::Result<T, ImportError>;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: u64, message: String },

    #[error("Write error ({kind}): {message}")]
    Write { kind: RowErrorKind, message: String },

    #[error("Import aborted: {reason}")]
    Aborted {
        reason: String,
        summary: Box<ExecutionSummary>,
    },

    #[error("Import cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Common(#[from] reef_common::ReefError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ImportError {
    pub fn config(message: impl Into<String>) -> Self {
        ImportError::Configuration(message.into())
    }

    pub fn source(message: impl Into<String>) -> Self {
        ImportError::Source(message.into())
    }

    /// Whether a source retry policy may try again after this error
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ImportError::Configuration(_) | ImportError::Cancelled | ImportError::Aborted { .. }
        )
    }
}

impl From<config::ConfigError> for ImportError {
    fn from(err: config::ConfigError) -> Self {
        ImportError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_not_retried() {
        assert!(!ImportError::config("missing table").is_retryable());
        assert!(!ImportError::Cancelled.is_retryable());
        assert!(ImportError::source("connection refused").is_retryable());
    }

    #[test]
    fn test_write_error_display_names_kind() {
        let err = ImportError::Write {
            kind: RowErrorKind::Constraint,
            message: "duplicate key".to_string(),
        };
        assert_eq!(err.to_string(), "Write error (Constraint): duplicate key");
    }
}
