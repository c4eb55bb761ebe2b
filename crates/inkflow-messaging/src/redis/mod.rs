//! Redis-backed broker.
//!
//! Each queue is a Redis list used as a reliable queue:
//! - publish: `LPUSH <prefix>:queue:<name>`
//! - receive: `BLMOVE` from the queue into `<prefix>:inflight:<name>:<consumer>`
//! - ack: `LREM` from the in-flight list
//! - nack + requeue: `LREM` and `RPUSH` back onto the consuming end
//! - nack + drop: `LREM`, optionally `LPUSH <prefix>:dead:<name>`
//!
//! Every connection holds a lease, `<prefix>:consumer:<id>`, that expires
//! unless the heartbeat refreshes it. Messages left in an in-flight list are
//! returned to the queue when its consumer subscribes again, or when any
//! other consumer subscribes after the owner's lease has expired. A crashed
//! consumer therefore never strands its deliveries, whatever id it restarts
//! with.

mod connection;

pub use connection::RedisConnection;

use crate::broker::{Broker, BrokerConnection};
use crate::error::{MessagingError, MessagingResult};
use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config, Pool, Runtime};
use inkflow_config::BrokerConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// How long a single `BLMOVE` blocks before the subscription re-checks the
/// connection.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Redis broker configuration.
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Redis URL.
    pub url: String,
    /// Pool size per connection. Every open subscription pins one.
    pub pool_size: usize,
    /// Key prefix.
    pub key_prefix: String,
    /// Consumer id owning the in-flight lists.
    pub consumer_id: String,
    /// Heartbeat interval. Each beat refreshes the consumer lease. Zero
    /// beats at a third of the lease TTL.
    pub heartbeat: Duration,
    /// Consumer lease lifetime.
    pub lease_ttl: Duration,
    /// Blocking receive timeout.
    pub block_timeout: Duration,
    /// Keep dropped messages in a dead-letter list.
    pub dead_letter: bool,
}

impl RedisBrokerConfig {
    /// Build from application configuration.
    pub fn from_config(config: &BrokerConfig, fallback_url: &str, consumer_id: impl Into<String>) -> Self {
        Self {
            url: config.url_or(fallback_url).to_string(),
            pool_size: config.pool_size.max(2),
            key_prefix: config.key_prefix.clone(),
            consumer_id: consumer_id.into(),
            heartbeat: config.heartbeat(),
            lease_ttl: config.lease_ttl(),
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            dead_letter: config.dead_letter,
        }
    }

    /// Interval at which the lease is refreshed.
    pub fn heartbeat_interval(&self) -> Duration {
        if self.heartbeat.is_zero() {
            (self.lease_ttl / 3).max(Duration::from_millis(100))
        } else {
            self.heartbeat
        }
    }
}

/// Create a Redis connection pool and verify it with `PING`.
pub async fn create_pool(url: &str, pool_size: usize) -> MessagingResult<Pool> {
    let pool = Config::from_url(url)
        .builder()
        .map_err(|e| MessagingError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| MessagingError::Configuration(format!("Failed to create pool: {}", e)))?;

    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    Ok(pool)
}

/// Redis key builder for broker queues.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Ready messages of a queue (list).
    pub fn queue(&self, queue_name: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue_name)
    }

    /// Deliveries held by one consumer (list).
    pub fn inflight(&self, queue_name: &str, consumer_id: &str) -> String {
        format!("{}:inflight:{}:{}", self.prefix, queue_name, consumer_id)
    }

    /// Match pattern for every consumer's in-flight list of a queue.
    pub fn inflight_pattern(&self, queue_name: &str) -> String {
        format!("{}:inflight:{}:*", self.prefix, queue_name)
    }

    /// Consumer id owning an in-flight list key of `queue_name`.
    pub fn inflight_owner<'a>(&self, queue_name: &str, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.prefix)?
            .strip_prefix(":inflight:")?
            .strip_prefix(queue_name)?
            .strip_prefix(':')
            .filter(|owner| !owner.is_empty())
    }

    /// Liveness lease of a consumer (string with TTL).
    pub fn lease(&self, consumer_id: &str) -> String {
        format!("{}:consumer:{}", self.prefix, consumer_id)
    }

    /// Dropped messages of a queue (list).
    pub fn dead(&self, queue_name: &str) -> String {
        format!("{}:dead:{}", self.prefix, queue_name)
    }

    /// Declared queues (hash: name -> durability).
    pub fn registry(&self) -> String {
        format!("{}:queues", self.prefix)
    }
}

/// Wire format of a queued message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub id: String,
    pub published_at: i64,
    /// Completed deliveries before this one.
    pub deliveries: u32,
    pub body: String,
}

impl Envelope {
    pub fn wrap(body: &[u8]) -> MessagingResult<Self> {
        let body = std::str::from_utf8(body)
            .map_err(|e| MessagingError::Encoding(format!("Message body is not UTF-8: {}", e)))?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            published_at: Utc::now().timestamp_millis(),
            deliveries: 0,
            body: body.to_string(),
        })
    }

    pub fn parse(raw: &[u8]) -> Option<Self> {
        serde_json::from_slice(raw).ok()
    }

    pub fn to_bytes(&self) -> MessagingResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The stored form of `raw` after one more delivery. Foreign payloads
    /// are returned unchanged.
    pub fn requeued(raw: &[u8]) -> Vec<u8> {
        match Self::parse(raw) {
            Some(mut envelope) => {
                envelope.deliveries += 1;
                envelope.to_bytes().unwrap_or_else(|_| raw.to_vec())
            }
            None => raw.to_vec(),
        }
    }
}

/// Redis implementation of [`Broker`].
pub struct RedisBroker {
    config: RedisBrokerConfig,
}

impl RedisBroker {
    /// Create a broker. No connection is made until [`Broker::connect`].
    pub fn new(config: RedisBrokerConfig) -> Self {
        Self { config }
    }

    /// Broker configuration.
    pub fn config(&self) -> &RedisBrokerConfig {
        &self.config
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> MessagingResult<Arc<dyn BrokerConnection>> {
        let pool = create_pool(&self.config.url, self.config.pool_size)
            .await
            .map_err(|e| match e {
                MessagingError::Configuration(_) => e,
                other => MessagingError::Connection(other.to_string()),
            })?;

        info!(
            consumer_id = %self.config.consumer_id,
            prefix = %self.config.key_prefix,
            "Connected to Redis broker"
        );

        Ok(RedisConnection::open(pool, &self.config).await?)
    }
}
