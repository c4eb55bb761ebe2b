//! Common test infrastructure for Redis cache integration tests.

use inkflow_cache::RedisCacheService;
use inkflow_config::RedisConfig;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::Redis;

/// Test Redis container wrapper.
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    config: RedisConfig,
}

impl TestRedis {
    /// Starts a fresh Redis container.
    pub async fn new() -> Self {
        let container = Redis::default()
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let config = RedisConfig {
            url: format!("redis://127.0.0.1:{}", port),
            pool_size: 4,
            enabled: true,
        };

        Self {
            _container: container,
            config,
        }
    }

    /// Connects a cache service, retrying until Redis accepts connections.
    pub async fn cache(&self, scan_count: usize) -> RedisCacheService {
        let max_attempts = 30;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match RedisCacheService::connect(&self.config, scan_count).await {
                Ok(cache) => return cache,
                Err(e) => {
                    if attempts >= max_attempts {
                        panic!("Failed to connect to Redis after {} attempts: {}", max_attempts, e);
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
