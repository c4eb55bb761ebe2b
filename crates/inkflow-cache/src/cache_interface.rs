//! Cache interface trait for abstracted caching operations.

use inkflow_core::{InkflowResult, Interface};
use async_trait::async_trait;
use std::time::Duration;

/// Cache interface for storing, retrieving and invalidating cached data.
///
/// Uses JSON strings for type-erased storage to maintain dyn-compatibility.
/// All mutations are last-writer-wins; there is no transactional
/// coordination between callers.
#[async_trait]
pub trait CacheInterface: Interface + Send + Sync {
    /// Get a raw JSON value from the cache.
    ///
    /// Returns `None` if the key doesn't exist or has expired.
    async fn get_raw(&self, key: &str) -> InkflowResult<Option<String>>;

    /// Set a raw JSON value in the cache with a TTL.
    async fn set_raw(&self, key: &str, value: &str, ttl: Duration) -> InkflowResult<()>;

    /// Delete a value from the cache.
    ///
    /// Returns `true` if the key existed and was deleted.
    async fn delete(&self, key: &str) -> InkflowResult<bool>;

    /// Delete a batch of keys in one round trip.
    ///
    /// Returns the number of keys that existed. Missing keys are ignored.
    async fn delete_many(&self, keys: &[String]) -> InkflowResult<u64>;

    /// Check if a key exists in the cache.
    async fn exists(&self, key: &str) -> InkflowResult<bool>;

    /// List every live key matching a glob pattern.
    async fn scan_keys(&self, pattern: &str) -> InkflowResult<Vec<String>>;

    /// Delete multiple keys matching a pattern.
    ///
    /// Returns the number of keys deleted.
    async fn delete_pattern(&self, pattern: &str) -> InkflowResult<u64> {
        let keys = self.scan_keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.delete_many(&keys).await
    }

    /// Check if caching is enabled.
    fn is_enabled(&self) -> bool;
}

/// Extension trait with typed methods for convenience.
#[async_trait]
pub trait CacheExt: CacheInterface {
    /// Get a typed value from the cache.
    async fn get<T: serde::de::DeserializeOwned + Send>(&self, key: &str) -> InkflowResult<Option<T>> {
        match self.get_raw(key).await? {
            Some(json) => {
                let value: T = serde_json::from_str(&json)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a typed value in the cache.
    async fn set<T: serde::Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> InkflowResult<()> {
        let json = serde_json::to_string(value)?;
        self.set_raw(key, &json, ttl).await
    }

    /// Get a value or compute and cache it if not present.
    async fn get_or_set<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        factory: F,
    ) -> InkflowResult<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = InkflowResult<T>> + Send,
    {
        if let Some(cached) = self.get::<T>(key).await? {
            return Ok(cached);
        }

        let value = factory().await?;

        // The value is still valid if caching it fails
        let _ = self.set(key, &value, ttl).await;

        Ok(value)
    }
}

// Blanket implementation for all CacheInterface implementations
impl<T: CacheInterface + ?Sized> CacheExt for T {}
