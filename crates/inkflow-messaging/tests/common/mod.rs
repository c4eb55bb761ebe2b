//! Common test infrastructure for Redis broker integration tests.

use deadpool_redis::Pool;
use inkflow_config::BrokerConfig;
use inkflow_messaging::redis::{create_pool, QueueKeys};
use inkflow_messaging::RedisBrokerConfig;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::Redis;

pub const QUEUE: &str = "cache-invalidation";
pub const PREFIX: &str = "inkflow:test";

/// Test Redis container wrapper.
///
/// Keeps the container alive for the lifetime of the test and hands out
/// broker configurations pointing at it.
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    url: String,
}

impl TestRedis {
    /// Starts a fresh Redis container and waits until it answers `PING`.
    pub async fn new() -> Self {
        let container = Redis::default()
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let url = format!("redis://127.0.0.1:{}", port);
        Self::wait_ready(&url, 30).await;

        Self {
            _container: container,
            url,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Broker configuration for one consumer.
    pub fn broker_config(&self, consumer_id: &str) -> RedisBrokerConfig {
        let broker = BrokerConfig {
            key_prefix: PREFIX.to_string(),
            ..BrokerConfig::default()
        };
        RedisBrokerConfig::from_config(&broker, &self.url, consumer_id)
    }

    /// Broker configuration whose lease lapses quickly once heartbeats stop.
    pub fn short_lease_config(&self, consumer_id: &str) -> RedisBrokerConfig {
        RedisBrokerConfig {
            heartbeat: Duration::from_millis(200),
            lease_ttl: Duration::from_millis(600),
            ..self.broker_config(consumer_id)
        }
    }

    /// A separate pool for inspecting raw keys.
    pub async fn pool(&self) -> Pool {
        create_pool(&self.url, 2).await.expect("Failed to create pool")
    }

    pub fn keys(&self) -> QueueKeys {
        QueueKeys::new(PREFIX)
    }

    async fn wait_ready(url: &str, max_attempts: u32) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match create_pool(url, 1).await {
                Ok(pool) => {
                    pool.close();
                    return;
                }
                Err(e) => {
                    if attempts >= max_attempts {
                        panic!("Redis not ready after {} attempts: {}", max_attempts, e);
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
