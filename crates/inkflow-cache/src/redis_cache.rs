//! Redis-based cache implementation.

use super::CacheInterface;
use async_trait::async_trait;
use deadpool_redis::{redis::AsyncCommands, Config, Pool, Runtime};
use inkflow_config::RedisConfig;
use inkflow_core::{InkflowError, InkflowResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default `COUNT` hint for each `SCAN` iteration.
pub const DEFAULT_SCAN_COUNT: usize = 100;

/// Redis-based cache service.
pub struct RedisCacheService {
    /// Redis connection pool.
    pool: Option<Arc<Pool>>,
    /// `COUNT` hint used while scanning for pattern matches.
    scan_count: usize,
}

impl RedisCacheService {
    /// Create a new Redis cache service.
    #[must_use]
    pub fn new(pool: Arc<Pool>) -> Self {
        Self {
            pool: Some(pool),
            scan_count: DEFAULT_SCAN_COUNT,
        }
    }

    /// Create a cache service with a custom scan batch size.
    #[must_use]
    pub fn with_scan_count(pool: Arc<Pool>, scan_count: usize) -> Self {
        Self {
            pool: Some(pool),
            scan_count: scan_count.max(1),
        }
    }

    /// Create a no-op cache service (for when Redis is disabled).
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            pool: None,
            scan_count: DEFAULT_SCAN_COUNT,
        }
    }

    /// Build a pool from configuration and verify it with `PING`.
    ///
    /// Returns a disabled service when Redis is turned off.
    pub async fn connect(config: &RedisConfig, scan_count: usize) -> InkflowResult<Self> {
        if !config.enabled {
            info!("Redis cache disabled by configuration");
            return Ok(Self::disabled());
        }

        info!("Creating Redis connection pool for cache...");

        let pool = Config::from_url(&config.url)
            .builder()
            .map_err(|e| InkflowError::Configuration(format!("Invalid Redis config: {}", e)))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| InkflowError::Configuration(format!("Failed to create Redis pool: {}", e)))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| InkflowError::Cache(format!("Failed to get Redis connection: {}", e)))?;
        deadpool_redis::redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| InkflowError::Cache(format!("Redis PING failed: {}", e)))?;

        info!("Redis cache pool created successfully");
        Ok(Self::with_scan_count(Arc::new(pool), scan_count))
    }

    /// Get a connection from the pool.
    async fn get_conn(&self) -> InkflowResult<deadpool_redis::Connection> {
        match &self.pool {
            Some(pool) => pool.get().await.map_err(|e| {
                InkflowError::Cache(format!("Failed to get Redis connection: {}", e))
            }),
            None => Err(InkflowError::Cache("Cache is disabled".to_string())),
        }
    }
}

#[async_trait]
impl CacheInterface for RedisCacheService {
    fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    async fn get_raw(&self, key: &str) -> InkflowResult<Option<String>> {
        if !self.is_enabled() {
            return Ok(None);
        }

        let mut conn = self.get_conn().await?;
        let value: Option<String> = conn.get(key).await.map_err(|e| {
            InkflowError::Cache(format!("Failed to get key '{}': {}", key, e))
        })?;

        match &value {
            Some(_) => debug!("Cache hit for key '{}'", key),
            None => debug!("Cache miss for key '{}'", key),
        }

        Ok(value)
    }

    async fn set_raw(&self, key: &str, value: &str, ttl: Duration) -> InkflowResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let mut conn = self.get_conn().await?;
        let ttl_secs = ttl.as_secs().max(1);

        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await.map_err(|e| {
            InkflowError::Cache(format!("Failed to set key '{}': {}", key, e))
        })?;

        debug!("Cached key '{}' with TTL {}s", key, ttl_secs);
        Ok(())
    }

    async fn delete(&self, key: &str) -> InkflowResult<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }

        let mut conn = self.get_conn().await?;
        let deleted: i64 = conn.del(key).await.map_err(|e| {
            InkflowError::Cache(format!("Failed to delete key '{}': {}", key, e))
        })?;

        debug!("Deleted key '{}': {}", key, deleted > 0);
        Ok(deleted > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> InkflowResult<u64> {
        if !self.is_enabled() || keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.get_conn().await?;
        let deleted: i64 = conn.del(keys).await.map_err(|e| {
            InkflowError::Cache(format!("Failed to delete {} keys: {}", keys.len(), e))
        })?;

        debug!(requested = keys.len(), deleted, "Deleted key batch");
        Ok(deleted.max(0) as u64)
    }

    async fn exists(&self, key: &str) -> InkflowResult<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }

        let mut conn = self.get_conn().await?;
        let exists: bool = conn.exists(key).await.map_err(|e| {
            InkflowError::Cache(format!("Failed to check key '{}': {}", key, e))
        })?;

        Ok(exists)
    }

    async fn scan_keys(&self, pattern: &str) -> InkflowResult<Vec<String>> {
        if !self.is_enabled() {
            return Ok(Vec::new());
        }

        let mut conn = self.get_conn().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        // Cursor-based SCAN; KEYS would block the server on large keyspaces
        loop {
            let (next, batch): (u64, Vec<String>) = deadpool_redis::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.scan_count)
                .query_async(&mut conn)
                .await
                .map_err(|e| InkflowError::Cache(format!("Failed to scan keys: {}", e)))?;

            keys.extend(batch);

            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once across iterations
        keys.sort_unstable();
        keys.dedup();

        debug!("Found {} keys matching pattern '{}'", keys.len(), pattern);
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_cache() {
        let cache = RedisCacheService::disabled();
        assert!(!cache.is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_cache_is_noop() {
        let cache = RedisCacheService::disabled();
        assert_eq!(cache.get_raw("blog:1").await.unwrap(), None);
        cache.set_raw("blog:1", "{}", Duration::from_secs(60)).await.unwrap();
        assert!(!cache.delete("blog:1").await.unwrap());
        assert_eq!(cache.delete_many(&["blog:1".to_string()]).await.unwrap(), 0);
        assert!(cache.scan_keys("blogs:*").await.unwrap().is_empty());
        assert_eq!(cache.delete_pattern("blogs:*").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_when_disabled() {
        let config = RedisConfig {
            enabled: false,
            ..RedisConfig::default()
        };
        let cache = RedisCacheService::connect(&config, 50).await.unwrap();
        assert!(!cache.is_enabled());
    }
}
