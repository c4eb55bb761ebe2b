//! Integration tests for RedisCacheService.
//!
//! These tests run against a real Redis server using testcontainers.
//! Requires Docker to be available on the system.

mod common;

use common::TestRedis;
use inkflow_cache::{CacheExt, CacheInterface};
use std::time::Duration;

const TTL: Duration = Duration::from_secs(300);

#[tokio::test]
async fn test_set_get_delete() {
    let redis = TestRedis::new().await;
    let cache = redis.cache(100).await;

    cache.set("blog:1", &vec!["a".to_string()], TTL).await.expect("Failed to set");
    let value: Option<Vec<String>> = cache.get("blog:1").await.expect("Failed to get");
    assert_eq!(value, Some(vec!["a".to_string()]));
    assert!(cache.exists("blog:1").await.unwrap());

    assert!(cache.delete("blog:1").await.unwrap());
    assert!(!cache.delete("blog:1").await.unwrap());
    assert!(cache.get::<Vec<String>>("blog:1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_scan_expands_pattern_across_batches() {
    let redis = TestRedis::new().await;
    // A tiny COUNT forces several SCAN round trips
    let cache = redis.cache(2).await;

    for page in 1..=12 {
        let key = format!("blogs:v2:all:all:page:{}:limit:16", page);
        cache.set_raw(&key, "[]", TTL).await.unwrap();
    }
    cache.set_raw("blog:7", "{}", TTL).await.unwrap();
    cache.set_raw("users:1", "{}", TTL).await.unwrap();

    let mut keys = cache.scan_keys("blogs:*").await.expect("Failed to scan");
    keys.sort();
    assert_eq!(keys.len(), 12);
    assert!(keys.iter().all(|k| k.starts_with("blogs:v2:")));

    assert_eq!(cache.scan_keys("blog:7").await.unwrap(), vec!["blog:7".to_string()]);
    assert!(cache.scan_keys("comments:*").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_pattern_removes_only_matches() {
    let redis = TestRedis::new().await;
    let cache = redis.cache(3).await;

    for page in 1..=5 {
        cache
            .set_raw(&format!("blogs:v2:all:all:page:{}:limit:16", page), "[]", TTL)
            .await
            .unwrap();
    }
    cache.set_raw("blog:7", "{}", TTL).await.unwrap();

    assert_eq!(cache.delete_pattern("blogs:*").await.expect("Failed to delete"), 5);
    assert!(cache.scan_keys("blogs:*").await.unwrap().is_empty());
    assert!(cache.exists("blog:7").await.unwrap());

    assert_eq!(cache.delete_pattern("blogs:*").await.unwrap(), 0);
}

#[tokio::test]
async fn test_entries_expire() {
    let redis = TestRedis::new().await;
    let cache = redis.cache(100).await;

    cache.set_raw("blog:1", "{}", Duration::from_secs(1)).await.unwrap();
    assert!(cache.exists("blog:1").await.unwrap());

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(!cache.exists("blog:1").await.unwrap());
}
