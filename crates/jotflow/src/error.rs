use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JotflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),
}

/// Errors returned synchronously by queue operations.
///
/// `InvalidTransition` and `UnknownJob` are programming/ordering bugs at the
/// call site. `Storage` means the persistence medium failed; the in-memory
/// mutation has still been applied (see `JobQueue`).
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid transition for job {id}: {operation} not allowed ({reason})")]
    InvalidTransition {
        id: String,
        operation: &'static str,
        reason: String,
    },

    #[error("Unknown job: {id}")]
    UnknownJob { id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] crate::db::DatabaseError),
}

pub type Result<T> = std::result::Result<T, JotflowError>;
