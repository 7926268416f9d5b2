//! Error types for job executors.

use thiserror::Error;

/// Errors raised while executing a job.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid header {0:?}")]
    InvalidHeader(String),

    #[error("worker timed out after {0}ms")]
    Timeout(u64),

    #[error("worker exited with {code}: {stderr}")]
    Exited { code: String, stderr: String },

    #[error("worker command not found: {0}")]
    CommandNotFound(String),

    #[error("invalid worker output: {0}")]
    InvalidOutput(String),
}
