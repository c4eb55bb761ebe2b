//! Caching infrastructure for Inkflow services.
//!
//! This crate provides the [`CacheInterface`] abstraction used by both the
//! read path (cache-aside lookups) and the cache-sync worker (pattern
//! invalidation and warm-up), with a Redis implementation and an in-memory
//! implementation for local runs and tests.

mod cache_interface;
mod memory_cache;
pub mod pattern;
mod redis_cache;

pub use cache_interface::{CacheExt, CacheInterface};
pub use memory_cache::InMemoryCache;
pub use redis_cache::{RedisCacheService, DEFAULT_SCAN_COUNT};
