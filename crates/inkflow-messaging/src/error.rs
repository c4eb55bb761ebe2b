//! Messaging error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for messaging operations.
pub type MessagingResult<T> = Result<T, MessagingError>;

/// Messaging-related errors.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// Establishing a connection failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// No live connection is available.
    #[error("Not connected to the message broker")]
    NotConnected,

    /// The connection was closed.
    #[error("Connection closed")]
    Closed,

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Queue was used before being declared.
    #[error("Queue not declared: {0}")]
    QueueNotDeclared(String),

    /// The delivery is no longer outstanding (already settled or requeued).
    #[error("Unknown delivery: {0}")]
    UnknownDelivery(String),

    /// Message body cannot be carried by the backend.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl MessagingError {
    /// Returns true if this error is a transport-level failure that the
    /// connection supervisor recovers from by reconnecting.
    pub fn is_transient(&self) -> bool {
        match self {
            MessagingError::Connection(_)
            | MessagingError::NotConnected
            | MessagingError::Closed
            | MessagingError::Pool(_)
            | MessagingError::Timeout(_) => true,
            MessagingError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::Encoding(err.to_string())
    }
}

impl From<MessagingError> for inkflow_core::InkflowError {
    fn from(err: MessagingError) -> Self {
        inkflow_core::InkflowError::Messaging(err.to_string())
    }
}
