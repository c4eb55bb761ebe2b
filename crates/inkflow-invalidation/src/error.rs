//! Invalidation error types.

use inkflow_core::InkflowError;
use inkflow_messaging::MessagingError;
use std::time::Duration;
use thiserror::Error;

/// Result type for invalidation operations.
pub type InvalidationResult<T> = Result<T, InvalidationError>;

/// Invalidation-related errors.
#[derive(Debug, Error)]
pub enum InvalidationError {
    /// Message body is not a valid job.
    #[error("Failed to decode invalidation job: {0}")]
    Decode(String),

    /// Job could not be serialized for publishing.
    #[error("Failed to encode invalidation job: {0}")]
    Encode(String),

    /// Job names no key patterns.
    #[error("Invalidation job has no key patterns")]
    EmptyJob,

    /// A key pattern is blank.
    #[error("Invalid key pattern: {0:?}")]
    InvalidPattern(String),

    /// Cache lookup or delete failed.
    #[error("Cache error: {0}")]
    Cache(#[from] InkflowError),

    /// Broker error.
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    /// Cache warm-up failed.
    #[error("Rebuild error: {0}")]
    Rebuild(String),

    /// Publish did not complete in time.
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    /// Worker is already running.
    #[error("Cache sync worker already running")]
    AlreadyRunning,
}

impl InvalidationError {
    /// Returns true if redelivering the message can never succeed.
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            InvalidationError::Decode(_) | InvalidationError::EmptyJob | InvalidationError::InvalidPattern(_)
        )
    }
}

impl From<serde_json::Error> for InvalidationError {
    fn from(err: serde_json::Error) -> Self {
        InvalidationError::Decode(err.to_string())
    }
}

impl From<InvalidationError> for InkflowError {
    fn from(err: InvalidationError) -> Self {
        match err {
            InvalidationError::Cache(inner) => inner,
            InvalidationError::Messaging(inner) => inner.into(),
            InvalidationError::Encode(msg) => InkflowError::Serialization(msg),
            InvalidationError::Timeout(d) => InkflowError::Timeout(format!("publish timed out after {:?}", d)),
            InvalidationError::Decode(_) | InvalidationError::EmptyJob | InvalidationError::InvalidPattern(_) => {
                InkflowError::Validation(err.to_string())
            }
            other => InkflowError::Internal(other.to_string()),
        }
    }
}
