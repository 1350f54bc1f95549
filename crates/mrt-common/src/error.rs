//! Error types shared by the Merritt ingest crates

use thiserror::Error;

/// Result type alias for shared ingest operations
pub type Result<T> = std::result::Result<T, MrtError>;

/// Main error type for the shared ingest layer
#[derive(Error, Debug)]
pub enum MrtError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
