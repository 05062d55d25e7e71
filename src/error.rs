//! Error types for the update scheduler.

/// Top-level error type for scheduling and task persistence.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Settings store could not be read, parsed, or flushed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error (scheduler actor gone).
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SchedulerError>;
