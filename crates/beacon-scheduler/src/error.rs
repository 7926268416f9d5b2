//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Task creation rejected by validation.
    #[error("invalid task: {0}")]
    Invalid(#[from] ValidationError),

    /// Task already exists.
    #[error("task already exists: {0}")]
    TaskExists(String),

    /// Task not found.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// IO error while reading or writing the state file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while encoding or decoding the state file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a new task is rejected at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("blocked host or invalid URL: {0}")]
    BlockedHost(String),

    #[error("URL must start with http(s)://: {0}")]
    UnsupportedScheme(String),

    #[error("repeat out of range (1..=10000): {0}")]
    RepeatOutOfRange(u32),

    #[error("intervalMs must be at least 100: {0}")]
    IntervalTooShort(u64),

    #[error("timeoutMs out of range (1000..=120000): {0}")]
    TimeoutOutOfRange(u64),

    #[error("userAgent length must be between 1 and 512")]
    UserAgentLength,

    #[error("viewport dimensions must be between 100 and 8192: {width}x{height}")]
    ViewportOutOfRange { width: u32, height: u32 },
}
