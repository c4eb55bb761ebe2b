//! # Inkflow Invalidation
//!
//! Cross-service cache invalidation. The write side publishes an
//! [`InvalidationJob`] naming cache key patterns when a mutation commits;
//! the read side runs a [`CacheSyncWorker`] that deletes every matching key
//! and lets a [`CacheRebuilder`] warm the canonical views again.
//!
//! Delivery is at-least-once, so processing a job twice has the same effect
//! as processing it once.

pub mod consumer;
pub mod error;
pub mod job;
pub mod metrics;
pub mod publisher;
pub mod rebuild;

pub use consumer::{CacheSyncWorker, HandlerOutcome, ProcessReport, WorkerConfig, WorkerStats};
pub use error::{InvalidationError, InvalidationResult};
pub use job::{InvalidationJob, JobAction};
pub use metrics::register_metrics;
pub use publisher::{CacheInvalidationPublisher, PublishOutcome};
pub use rebuild::{CacheRebuilder, NoopRebuilder};
