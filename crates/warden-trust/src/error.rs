use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrustError>;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("integrity check failed for {model}: expected {expected}, got {actual}")]
    Integrity {
        model: String,
        expected: String,
        actual: String,
    },

    #[error("artifact not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid signing key for {publisher}: {reason}")]
    InvalidKey { publisher: String, reason: String },

    #[error("background task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
