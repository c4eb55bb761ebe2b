//! Rebuilds canonical blog views after an invalidation.

use crate::cache_keys;
use crate::query::BlogQuery;
use crate::read_service::BlogReadService;
use async_trait::async_trait;
use inkflow_cache::pattern::{glob_match, is_glob};
use inkflow_config::WarmupConfig;
use inkflow_core::InkflowResult;
use inkflow_invalidation::CacheRebuilder;
use tracing::debug;

/// Warms the first unfiltered collection pages, and optionally single
/// blogs, once their keys have been invalidated.
///
/// Filtered pages (search or category) are never warmed; they refill on
/// the next read.
pub struct BlogCacheWarmer {
    reader: BlogReadService,
    config: WarmupConfig,
}

impl BlogCacheWarmer {
    pub fn new(reader: BlogReadService, config: WarmupConfig) -> Self {
        Self { reader, config }
    }

    async fn warm_pages(&self, pattern: &str) -> InkflowResult<usize> {
        let mut written = 0;
        for page in 1..=self.config.warm_pages {
            let query = BlogQuery::canonical(page, self.config.page_limit);
            if !glob_match(pattern, &query.cache_key()) {
                continue;
            }
            let rebuilt = self.reader.refresh_page(&query).await?;
            written += usize::from(rebuilt.cached);
            if u64::from(page) >= rebuilt.value.pagination.total_pages {
                break;
            }
        }
        Ok(written)
    }

    async fn warm_entity(&self, pattern: &str) -> InkflowResult<usize> {
        if !self.config.warm_entities || is_glob(pattern) {
            return Ok(0);
        }
        let Some(id) = cache_keys::parse_blog_id(pattern) else {
            return Ok(0);
        };
        // A deleted blog stays uncached
        let refreshed = self.reader.refresh_blog(id).await?;
        Ok(usize::from(refreshed.is_some_and(|r| r.cached)))
    }
}

#[async_trait]
impl CacheRebuilder for BlogCacheWarmer {
    async fn rebuild(&self, pattern: &str) -> InkflowResult<usize> {
        if !self.config.enabled {
            return Ok(0);
        }
        let written = self.warm_pages(pattern).await? + self.warm_entity(pattern).await?;
        debug!(pattern, written, "Warmed blog cache");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryBlogStore;
    use crate::model::Blog;
    use inkflow_cache::{CacheInterface, InMemoryCache};
    use std::sync::Arc;

    fn blog(id: i32) -> Blog {
        Blog {
            id,
            title: format!("Post {}", id),
            description: String::new(),
            content: String::new(),
            image: String::new(),
            category: "tech".to_string(),
            author: "u-1".to_string(),
            create_at: None,
        }
    }

    fn warmer(store: Arc<InMemoryBlogStore>, cache: Arc<InMemoryCache>, config: WarmupConfig) -> BlogCacheWarmer {
        BlogCacheWarmer::new(BlogReadService::new(store, cache), config)
    }

    fn config(warm_pages: u32, page_limit: u32, warm_entities: bool) -> WarmupConfig {
        WarmupConfig {
            enabled: true,
            warm_pages,
            page_limit,
            warm_entities,
        }
    }

    #[tokio::test]
    async fn test_collection_pattern_warms_first_page() {
        let store = Arc::new(InMemoryBlogStore::new());
        store.upsert(blog(1));
        let cache = Arc::new(InMemoryCache::new());
        let warmer = warmer(store, cache.clone(), WarmupConfig::default());

        assert_eq!(warmer.rebuild("blogs:*").await.unwrap(), 1);
        assert_eq!(cache.keys(), vec!["blogs:v2:all:all:page:1:limit:16".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_store_still_warms_first_page() {
        let cache = Arc::new(InMemoryCache::new());
        let warmer = warmer(Arc::new(InMemoryBlogStore::new()), cache.clone(), config(3, 16, false));

        assert_eq!(warmer.rebuild("blogs:*").await.unwrap(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_stops_after_last_page() {
        let store = Arc::new(InMemoryBlogStore::new());
        for id in 1..=3 {
            store.upsert(blog(id));
        }
        let cache = Arc::new(InMemoryCache::new());
        let warmer = warmer(store, cache.clone(), config(5, 2, false));

        assert_eq!(warmer.rebuild("blogs:*").await.unwrap(), 2);
        assert!(cache.exists("blogs:v2:all:all:page:2:limit:2").await.unwrap());
        assert!(!cache.exists("blogs:v2:all:all:page:3:limit:2").await.unwrap());
    }

    #[tokio::test]
    async fn test_unrelated_pattern_writes_nothing() {
        let cache = Arc::new(InMemoryCache::new());
        let warmer = warmer(Arc::new(InMemoryBlogStore::new()), cache.clone(), WarmupConfig::default());

        assert_eq!(warmer.rebuild("users:*").await.unwrap(), 0);
        assert_eq!(warmer.rebuild("blog:5").await.unwrap(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_entity_warmup() {
        let store = Arc::new(InMemoryBlogStore::new());
        store.upsert(blog(5));
        let cache = Arc::new(InMemoryCache::new());
        let warmer = warmer(store, cache.clone(), config(1, 16, true));

        assert_eq!(warmer.rebuild("blog:5").await.unwrap(), 1);
        assert_eq!(warmer.rebuild("blog:6").await.unwrap(), 0);
        assert_eq!(cache.keys(), vec!["blog:5".to_string()]);
    }

    #[tokio::test]
    async fn test_disabled() {
        let store = Arc::new(InMemoryBlogStore::new());
        let cache = Arc::new(InMemoryCache::new());
        let mut disabled = WarmupConfig::default();
        disabled.enabled = false;
        let warmer = warmer(store.clone(), cache.clone(), disabled);

        assert_eq!(warmer.rebuild("blogs:*").await.unwrap(), 0);
        assert_eq!(store.reads(), 0);
    }

    #[tokio::test]
    async fn test_failed_cache_writes_are_not_counted() {
        let store = Arc::new(InMemoryBlogStore::new());
        store.upsert(blog(5));
        let cache = Arc::new(InMemoryCache::new());
        cache.set_unavailable(true);
        let warmer = warmer(store.clone(), cache, config(3, 16, true));

        assert_eq!(warmer.rebuild("blogs:*").await.unwrap(), 0);
        assert_eq!(warmer.rebuild("blog:5").await.unwrap(), 0);
        assert!(store.reads() > 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_reported() {
        let store = Arc::new(InMemoryBlogStore::new());
        store.set_unavailable(true);
        let warmer = warmer(store, Arc::new(InMemoryCache::new()), WarmupConfig::default());

        assert!(warmer.rebuild("blogs:*").await.is_err());
    }
}
