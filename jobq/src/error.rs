use thiserror::Error;

use crate::types::JobId;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for queue operations
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// Invalid or malformed settings; fatal at startup
    #[error("Queue config validation error: {0}")]
    Config(String),

    #[error("Queue service not initialized. Call initialize() first.")]
    Uninitialized,

    /// Rejected producer input; nothing was enqueued
    #[error("Validation error: {0}")]
    Validation(String),

    /// The caller's lease is gone: the job was reclaimed, settled or removed
    #[error("Lease lost for job {0}")]
    LeaseLost(JobId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Progress {value} is out of range 0..=100")]
    ProgressOutOfRange { value: u32 },

    #[error("Progress for job {job_id} cannot go from {current} back to {value}")]
    ProgressRegressed { job_id: JobId, current: u8, value: u8 },

    #[error("A processor is already registered for queue '{0}'")]
    ProcessorAlreadyRegistered(String),

    /// Store connectivity or command failure
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Check if the error came from the store connection
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Job execution outcome - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Retryable error - will schedule retry if attempts remain
    #[error("{0}")]
    Retryable(String),

    /// Permanent error - fail immediately, no retry
    #[error("{0}")]
    Permanent(String),
}

impl JobError {
    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

impl From<String> for JobError {
    fn from(msg: String) -> Self {
        Self::Retryable(msg)
    }
}

impl From<&str> for JobError {
    fn from(msg: &str) -> Self {
        Self::Retryable(msg.to_string())
    }
}

// Owner writes inside a processor surface as retryable job failures
impl From<QueueError> for JobError {
    fn from(err: QueueError) -> Self {
        Self::Retryable(err.to_string())
    }
}

// A payload that does not decode will not decode on the next attempt either
impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Permanent(format!("invalid payload: {}", err))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_error_defaults_to_retryable() {
        let err: JobError = "smtp timeout".into();
        assert!(err.is_retryable());
        assert_eq!(err.message(), "smtp timeout");

        let err = JobError::permanent("bad address");
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "bad address");
    }

    #[test]
    fn decode_failures_are_permanent() {
        let err = serde_json::from_str::<u32>("\"nope\"").unwrap_err();
        let job_err: JobError = err.into();
        assert!(!job_err.is_retryable());
    }

    #[test]
    fn uninitialized_message_tells_caller_what_to_do() {
        assert_eq!(
            QueueError::Uninitialized.to_string(),
            "Queue service not initialized. Call initialize() first."
        );
    }
}
