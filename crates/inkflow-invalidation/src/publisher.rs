//! Write-side invalidation publisher.

use crate::error::{InvalidationError, InvalidationResult};
use crate::job::InvalidationJob;
use crate::metrics::PublisherMetrics;
use inkflow_config::AppConfig;
use inkflow_messaging::{ConnectionManager, PublishOptions, QueueDeclaration};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Result of a publish attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The job reached the broker.
    Published,
    /// No live connection; the job was dropped without buffering.
    NotReady,
}

/// Publishes invalidation jobs on behalf of the write side.
///
/// Publishing never blocks the caller on a broker outage: without a live
/// connection the job is skipped, and a connected attempt is bounded by the
/// publish timeout.
pub struct CacheInvalidationPublisher {
    connections: Arc<ConnectionManager>,
    queue: String,
    publish_timeout: Duration,
}

impl CacheInvalidationPublisher {
    /// Create a publisher for `queue`.
    pub fn new(connections: Arc<ConnectionManager>, queue: impl Into<String>, publish_timeout: Duration) -> Self {
        Self {
            connections,
            queue: queue.into(),
            publish_timeout,
        }
    }

    /// Create a publisher from application configuration.
    pub fn from_config(connections: Arc<ConnectionManager>, config: &AppConfig) -> Self {
        Self::new(connections, &config.broker.queue, config.publisher.publish_timeout())
    }

    /// Queue this publisher writes to.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Publish an invalidation job. Failures are logged, never returned.
    pub async fn invalidate<I, S>(&self, key_patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self.try_invalidate(key_patterns).await {
            Ok(_) => {}
            Err(InvalidationError::EmptyJob) | Err(InvalidationError::InvalidPattern(_)) => {
                warn!(queue = %self.queue, "No usable key patterns, invalidation skipped");
            }
            Err(e) => {
                PublisherMetrics::failed(&self.queue);
                error!(queue = %self.queue, error = %e, "Failed to publish cache invalidation");
            }
        }
    }

    /// Publish an invalidation job and report the outcome.
    pub async fn try_invalidate<I, S>(&self, key_patterns: I) -> InvalidationResult<PublishOutcome>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let job = InvalidationJob::new(key_patterns)?;

        let Some(connection) = self.connections.current() else {
            PublisherMetrics::skipped(&self.queue);
            warn!(
                queue = %self.queue,
                keys = ?job.key_patterns,
                state = %self.connections.state(),
                "Invalidation channel not ready, message skipped"
            );
            return Ok(PublishOutcome::NotReady);
        };

        let body = job.encode()?;
        let declaration = QueueDeclaration::durable(&self.queue);

        tokio::time::timeout(self.publish_timeout, async {
            connection.declare_queue(&declaration).await?;
            connection
                .publish(&self.queue, &body, PublishOptions { persistent: true })
                .await
        })
        .await
        .map_err(|_| InvalidationError::Timeout(self.publish_timeout))??;

        PublisherMetrics::published(&self.queue);
        debug!(queue = %self.queue, keys = ?job.key_patterns, "Published cache invalidation job");
        Ok(PublishOutcome::Published)
    }
}
