//! In-process cache with per-entry expiry.

use super::CacheInterface;
use crate::pattern::glob_match;
use async_trait::async_trait;
use inkflow_core::{InkflowError, InkflowResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-memory implementation of [`CacheInterface`].
///
/// Pattern scans use the same glob semantics as Redis `SCAN MATCH`.
/// [`set_unavailable`](Self::set_unavailable) makes every call fail as if the
/// backend were unreachable.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl InMemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going away (`true`) or coming back (`false`).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remaining time to live of a live key.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.expires_at - now)
    }

    /// All live keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    /// Returns `true` if no live entry remains.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> InkflowResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(InkflowError::Cache("Cache backend unavailable".to_string()));
        }
        Ok(())
    }

    fn purge_expired(entries: &mut HashMap<String, Entry>) {
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
    }
}

#[async_trait]
impl CacheInterface for InMemoryCache {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn get_raw(&self, key: &str) -> InkflowResult<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn set_raw(&self, key: &str, value: &str, ttl: Duration) -> InkflowResult<()> {
        self.check_available()?;
        let ttl = ttl.max(Duration::from_secs(1));
        let mut entries = self.entries.write();
        Self::purge_expired(&mut entries);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> InkflowResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.write();
        Self::purge_expired(&mut entries);
        Ok(entries.remove(key).is_some())
    }

    async fn delete_many(&self, keys: &[String]) -> InkflowResult<u64> {
        self.check_available()?;
        let mut entries = self.entries.write();
        Self::purge_expired(&mut entries);
        Ok(keys.iter().filter(|key| entries.remove(key.as_str()).is_some()).count() as u64)
    }

    async fn exists(&self, key: &str) -> InkflowResult<bool> {
        self.check_available()?;
        Ok(self.ttl(key).is_some())
    }

    async fn scan_keys(&self, pattern: &str) -> InkflowResult<Vec<String>> {
        self.check_available()?;
        Ok(self
            .keys()
            .into_iter()
            .filter(|key| glob_match(pattern, key))
            .collect())
    }
}
