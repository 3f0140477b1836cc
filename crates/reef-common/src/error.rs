//! Error types shared by Reef crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, ReefError>;

/// Errors raised by the shared utilities
#[derive(Error, Debug)]
pub enum ReefError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
