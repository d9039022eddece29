//! Error types for the worker engine.

use std::time::Duration;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Notify error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors returned by the queue frontend. Task-level failures never show up
/// here; only rejected submissions and store faults do.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Priority {value} is outside the allowed range {min}..={max}")]
    InvalidPriority { value: i32, min: i32, max: i32 },

    #[error("Delay must be non-negative, got {0}s")]
    NegativeDelay(i64),

    #[error("Delay of {value}s exceeds the maximum of {max}s")]
    DelayTooLarge { value: i64, max: i64 },

    #[error("Logical type must not be empty")]
    EmptyLogicalType,

    #[error("Task store rejected the submission: {0}")]
    Store(#[from] DatabaseError),
}

/// Failure reported by a task handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure; the task is retried while retries remain.
    #[error("{0}")]
    Failed(String),

    /// The handler knows a retry cannot help; the task fails immediately.
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl HandlerError {
    /// Whether the failure should consume a retry slot rather than fail the
    /// task outright.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidPayload(e.to_string())
    }
}

/// Result notifier errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Failed to deliver notification: {reason}")]
    SendFailed { reason: String },

    #[error("Notification channel closed")]
    ChannelClosed,

    #[error("Notifier timed out after {0:?}")]
    Timeout(Duration),
}

/// Schedule registrar errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Schedule '{name}' not found")]
    NotFound { name: String },

    #[error("Schedule '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("Invalid trigger '{spec}': {reason}")]
    InvalidTrigger { spec: String, reason: String },

    #[error("Schedule name must not be empty")]
    EmptyName,

    #[error("Enqueue failed: {0}")]
    Queue(#[from] QueueError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_plain_failures_retry() {
        assert!(HandlerError::Failed("boom".into()).is_retryable());
        assert!(!HandlerError::Permanent("bad input".into()).is_retryable());
        assert!(!HandlerError::InvalidPayload("missing field".into()).is_retryable());
    }

    #[test]
    fn json_errors_become_invalid_payload() {
        let err = serde_json::from_str::<u32>("\"nope\"").unwrap_err();
        let handler_err: HandlerError = err.into();
        assert!(matches!(handler_err, HandlerError::InvalidPayload(_)));
    }

    #[test]
    fn queue_error_wraps_store_failure() {
        let err: QueueError = DatabaseError::Query("disk full".into()).into();
        assert_eq!(
            err.to_string(),
            "Task store rejected the submission: Query failed: disk full"
        );
    }
}
