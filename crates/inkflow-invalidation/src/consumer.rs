//! Read-side cache-sync worker.
//!
//! The worker consumes invalidation jobs one at a time. For each key pattern,
//! in order, it resolves the matching keys, deletes them in one batch and
//! asks the [`CacheRebuilder`] to warm the canonical views again. Every
//! delivery is settled explicitly through a [`HandlerOutcome`]:
//!
//! | Situation                            | Outcome       |
//! |--------------------------------------|---------------|
//! | all patterns processed               | `Ack`         |
//! | rebuild failed (cache already clean) | `Ack`         |
//! | cache unavailable during delete      | `NackRequeue` |
//! | body is not a valid job              | `NackDrop`    |

use crate::error::{InvalidationError, InvalidationResult};
use crate::job::InvalidationJob;
use crate::metrics::WorkerMetrics;
use crate::rebuild::CacheRebuilder;
use inkflow_cache::{pattern, CacheInterface};
use inkflow_config::AppConfig;
use inkflow_messaging::{ConnectionManager, Delivery};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Longest body excerpt logged for a poison message.
const POISON_EXCERPT_LEN: usize = 256;

/// How a delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Processed; remove from the queue.
    Ack,
    /// Transient failure; deliver again later.
    NackRequeue,
    /// Can never succeed; remove without requeue.
    NackDrop,
}

impl HandlerOutcome {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::NackRequeue => "requeue",
            Self::NackDrop => "drop",
        }
    }
}

/// Effect of one processed job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Patterns processed.
    pub patterns: usize,
    /// Keys deleted across all patterns.
    pub keys_deleted: u64,
    /// Cache entries written back by the rebuilder.
    pub rebuilt: usize,
    /// Patterns whose rebuild failed.
    pub rebuild_failures: usize,
}

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue to consume.
    pub queue: String,
    /// Maximum unsettled deliveries.
    pub prefetch: u16,
    /// Pause before re-subscribing after the subscription ended.
    pub reconnect_delay: Duration,
    /// Pause before a failed job is returned to the queue.
    pub requeue_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for WorkerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            queue: config.broker.queue.clone(),
            prefetch: config.consumer.prefetch,
            reconnect_delay: config.broker.reconnect_delay(),
            requeue_delay: config.consumer.requeue_delay(),
        }
    }
}

/// Snapshot of worker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Deliveries handled.
    pub processed: u64,
    /// Deliveries acknowledged.
    pub acked: u64,
    /// Deliveries returned to the queue.
    pub requeued: u64,
    /// Deliveries dropped as poison.
    pub dropped: u64,
}

/// Consumes invalidation jobs and applies them to the cache.
pub struct CacheSyncWorker {
    connections: Arc<ConnectionManager>,
    cache: Arc<dyn CacheInterface>,
    rebuilder: Arc<dyn CacheRebuilder>,
    config: WorkerConfig,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    processed: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
}

impl CacheSyncWorker {
    /// Create a worker.
    pub fn new(
        connections: Arc<ConnectionManager>,
        cache: Arc<dyn CacheInterface>,
        rebuilder: Arc<dyn CacheRebuilder>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            connections,
            cache,
            rebuilder,
            config,
            shutdown,
            running: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Worker settings.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Returns `true` while [`run`](Self::run) is executing.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop [`run`](Self::run) once the delivery in progress is settled.
    pub fn shutdown(&self) {
        info!(queue = %self.config.queue, "Stopping cache sync worker...");
        self.shutdown.send_replace(true);
    }

    /// Consume jobs until [`shutdown`](Self::shutdown).
    ///
    /// A lost connection or ended subscription is not an error: the worker
    /// waits the reconnect delay and subscribes again.
    pub async fn run(&self) -> InvalidationResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(InvalidationError::AlreadyRunning);
        }

        info!(
            queue = %self.config.queue,
            prefetch = self.config.prefetch,
            "Starting cache sync worker"
        );

        let mut shutdown = self.shutdown.subscribe();

        'session: loop {
            if *shutdown.borrow() {
                break;
            }

            let connection = tokio::select! {
                connection = self.connections.ensure_connected() => connection,
                _ = shutdown.changed() => break,
            };

            match connection.subscribe(&self.config.queue, self.config.prefetch).await {
                Ok(mut subscription) => {
                    info!(queue = %self.config.queue, "Waiting for cache invalidation jobs");
                    loop {
                        let next = tokio::select! {
                            next = subscription.next() => next,
                            _ = shutdown.changed() => break 'session,
                        };

                        match next {
                            Ok(Some(delivery)) => self.dispatch(delivery).await,
                            Ok(None) => {
                                warn!(queue = %self.config.queue, "Subscription ended, resubscribing");
                                break;
                            }
                            Err(e) => {
                                warn!(queue = %self.config.queue, error = %e, "Subscription failed, resubscribing");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(queue = %self.config.queue, error = %e, "Failed to subscribe, retrying");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        let stats = self.stats();
        info!(
            queue = %self.config.queue,
            processed = stats.processed,
            acked = stats.acked,
            requeued = stats.requeued,
            dropped = stats.dropped,
            "Cache sync worker stopped"
        );
        Ok(())
    }

    /// Handle one delivery and settle it.
    async fn dispatch(&self, delivery: Delivery) {
        let started = Instant::now();
        let redelivered = delivery.redelivered();
        if redelivered {
            debug!(attempt = delivery.delivery_count(), "Processing redelivered job");
        }

        let outcome = self.handle(delivery.body()).await;
        if outcome == HandlerOutcome::NackRequeue && !self.config.requeue_delay.is_zero() {
            tokio::time::sleep(self.config.requeue_delay).await;
        }

        let settled = match outcome {
            HandlerOutcome::Ack => delivery.ack().await,
            HandlerOutcome::NackRequeue => delivery.nack(true).await,
            HandlerOutcome::NackDrop => delivery.nack(false).await,
        };

        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            HandlerOutcome::Ack => &self.acked,
            HandlerOutcome::NackRequeue => &self.requeued,
            HandlerOutcome::NackDrop => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        WorkerMetrics::job_handled(&self.config.queue, outcome.as_str(), redelivered, started.elapsed());

        // The broker redelivers anything left unsettled.
        if let Err(e) = settled {
            warn!(outcome = outcome.as_str(), error = %e, "Failed to settle delivery");
        }
    }

    /// Decide the outcome for one message body.
    pub async fn handle(&self, body: &[u8]) -> HandlerOutcome {
        let job = match InvalidationJob::decode(body) {
            Ok(job) => job,
            Err(e) => {
                let excerpt = &body[..body.len().min(POISON_EXCERPT_LEN)];
                error!(
                    error = %e,
                    body = %String::from_utf8_lossy(excerpt),
                    "Dropping undecodable invalidation job"
                );
                return HandlerOutcome::NackDrop;
            }
        };

        match self.process(&job).await {
            Ok(report) => {
                info!(
                    keys = ?job.key_patterns,
                    keys_deleted = report.keys_deleted,
                    rebuilt = report.rebuilt,
                    rebuild_failures = report.rebuild_failures,
                    "Cache invalidation processed"
                );
                HandlerOutcome::Ack
            }
            Err(e) if e.is_poison() => {
                error!(keys = ?job.key_patterns, error = %e, "Dropping invalid invalidation job");
                HandlerOutcome::NackDrop
            }
            Err(e) => {
                warn!(keys = ?job.key_patterns, error = %e, "Cache invalidation failed, requeueing");
                HandlerOutcome::NackRequeue
            }
        }
    }

    /// Apply a job to the cache.
    pub async fn process(&self, job: &InvalidationJob) -> InvalidationResult<ProcessReport> {
        job.validate()?;
        let mut report = ProcessReport::default();

        for key_pattern in &job.key_patterns {
            let keys = self.resolve(key_pattern).await?;
            let deleted = if keys.is_empty() {
                0
            } else {
                self.cache.delete_many(&keys).await?
            };
            report.keys_deleted += deleted;
            report.patterns += 1;
            debug!(pattern = %key_pattern, matched = keys.len(), deleted, "Invalidated key pattern");

            match self.rebuilder.rebuild(key_pattern).await {
                Ok(rebuilt) => report.rebuilt += rebuilt,
                Err(e) => {
                    report.rebuild_failures += 1;
                    warn!(pattern = %key_pattern, error = %e, "Cache rebuild failed");
                }
            }
        }

        WorkerMetrics::job_processed(report.keys_deleted, report.rebuilt, report.rebuild_failures);
        Ok(report)
    }

    /// Keys currently matching `key_pattern`.
    async fn resolve(&self, key_pattern: &str) -> InvalidationResult<Vec<String>> {
        if pattern::is_glob(key_pattern) {
            return Ok(self.cache.scan_keys(key_pattern).await?);
        }
        if self.cache.exists(key_pattern).await? {
            Ok(vec![key_pattern.to_string()])
        } else {
            Ok(Vec::new())
        }
    }
}
