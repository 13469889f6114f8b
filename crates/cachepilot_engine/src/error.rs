//! Error types for the residency engine

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("No tier mapping matches path: {0}")]
    UnmappedPath(PathBuf),

    #[error("Watch feed unavailable: {0}")]
    FeedUnavailable(String),

    #[error(transparent)]
    Lock(#[from] crate::lock::LockError),

    #[error("Timestamp store error: {0}")]
    Store(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EngineError>;
