//! Cache-aside reads of blogs.

use crate::cache_keys::{self, COLLECTION_TTL, ENTITY_TTL};
use crate::model::{BlogId, BlogPage, BlogView};
use crate::query::BlogQuery;
use crate::store::BlogStore;
use inkflow_cache::{CacheExt, CacheInterface};
use inkflow_core::{InkflowError, InkflowResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A value loaded from the store, and whether it made it into the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Refreshed<T> {
    pub value: T,
    pub cached: bool,
}

/// Serves blog reads from the cache, falling back to the store on a miss.
///
/// The cache is best effort: when it fails, reads go straight to the store
/// and the failure is logged.
#[derive(Clone)]
pub struct BlogReadService {
    store: Arc<dyn BlogStore>,
    cache: Arc<dyn CacheInterface>,
    entity_ttl: Duration,
    collection_ttl: Duration,
}

impl BlogReadService {
    pub fn new(store: Arc<dyn BlogStore>, cache: Arc<dyn CacheInterface>) -> Self {
        Self {
            store,
            cache,
            entity_ttl: ENTITY_TTL,
            collection_ttl: COLLECTION_TTL,
        }
    }

    /// Override the entry TTLs.
    #[must_use]
    pub fn with_ttls(mut self, entity_ttl: Duration, collection_ttl: Duration) -> Self {
        self.entity_ttl = entity_ttl;
        self.collection_ttl = collection_ttl;
        self
    }

    /// One collection page.
    pub async fn list_blogs(&self, query: &BlogQuery) -> InkflowResult<BlogPage> {
        let key = query.cache_key();
        if let Some(page) = self.cached::<BlogPage>(&key).await {
            return Ok(page);
        }
        Ok(self.refresh_page(query).await?.value)
    }

    /// Load a collection page from the store and cache it.
    pub async fn refresh_page(&self, query: &BlogQuery) -> InkflowResult<Refreshed<BlogPage>> {
        let page = self.store.fetch_page(query).await?;
        let cached = self.fill(&query.cache_key(), &page, self.collection_ttl).await;
        Ok(Refreshed { value: page, cached })
    }

    /// A single blog.
    pub async fn get_blog(&self, id: BlogId) -> InkflowResult<BlogView> {
        let key = cache_keys::blog_by_id(id);
        if let Some(view) = self.cached::<BlogView>(&key).await {
            return Ok(view);
        }
        self.refresh_blog(id)
            .await?
            .map(|refreshed| refreshed.value)
            .ok_or_else(|| InkflowError::not_found("Blog", id))
    }

    /// Load a single blog from the store and cache it. A missing blog is
    /// not cached.
    pub async fn refresh_blog(&self, id: BlogId) -> InkflowResult<Option<Refreshed<BlogView>>> {
        let Some(blog) = self.store.fetch_blog(id).await? else {
            return Ok(None);
        };
        let view = BlogView { blog };
        let cached = self.fill(&cache_keys::blog_by_id(id), &view, self.entity_ttl).await;
        Ok(Some(Refreshed { value: view, cached }))
    }

    async fn cached<T: DeserializeOwned + Send>(&self, key: &str) -> Option<T> {
        match self.cache.get::<T>(key).await {
            Ok(Some(value)) => {
                debug!(key, "Cache hit");
                Some(value)
            }
            Ok(None) => {
                debug!(key, "Cache miss");
                None
            }
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, reading from store");
                None
            }
        }
    }

    async fn fill<T: Serialize + Send + Sync>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        match self.cache.set(key, value, ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Cache write failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Blog, Pagination};
    use crate::store::MockBlogStore;
    use inkflow_cache::InMemoryCache;

    fn blog(id: BlogId) -> Blog {
        Blog {
            id,
            title: format!("Post {}", id),
            description: String::new(),
            content: "body".to_string(),
            image: String::new(),
            category: "tech".to_string(),
            author: "u-1".to_string(),
            create_at: None,
        }
    }

    fn assert_ttl(cache: &InMemoryCache, key: &str, expected: Duration) {
        let ttl = cache.ttl(key).unwrap();
        assert!(ttl <= expected && ttl > expected - Duration::from_secs(5));
    }

    fn page_of(query: &BlogQuery) -> BlogPage {
        BlogPage {
            blogs: vec![blog(1)],
            pagination: Pagination::new(1, query.page(), query.limit()),
        }
    }

    #[tokio::test]
    async fn test_list_miss_then_hit() {
        let mut store = MockBlogStore::new();
        store
            .expect_fetch_page()
            .times(1)
            .returning(|q| Ok(page_of(q)));
        let cache = Arc::new(InMemoryCache::new());
        let service = BlogReadService::new(Arc::new(store), cache.clone());

        let query = BlogQuery::default();
        let first = service.list_blogs(&query).await.unwrap();
        let second = service.list_blogs(&query).await.unwrap();

        assert_eq!(first, second);
        assert_ttl(&cache, &query.cache_key(), COLLECTION_TTL);
    }

    #[tokio::test]
    async fn test_get_blog_caches_view() {
        let mut store = MockBlogStore::new();
        store
            .expect_fetch_blog()
            .times(1)
            .returning(|id| Ok(Some(blog(id))));
        let cache = Arc::new(InMemoryCache::new());
        let service = BlogReadService::new(Arc::new(store), cache.clone());

        assert_eq!(service.get_blog(7).await.unwrap().blog.id, 7);
        assert_eq!(service.get_blog(7).await.unwrap().blog.id, 7);
        assert_ttl(&cache, "blog:7", ENTITY_TTL);
    }

    #[tokio::test]
    async fn test_missing_blog_is_not_found_and_not_cached() {
        let mut store = MockBlogStore::new();
        store.expect_fetch_blog().times(2).returning(|_| Ok(None));
        let cache = Arc::new(InMemoryCache::new());
        let service = BlogReadService::new(Arc::new(store), cache.clone());

        assert!(matches!(
            service.get_blog(404).await,
            Err(InkflowError::NotFound { .. })
        ));
        assert!(service.get_blog(404).await.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cache_outage_falls_back_to_store() {
        let mut store = MockBlogStore::new();
        store
            .expect_fetch_page()
            .times(2)
            .returning(|q| Ok(page_of(q)));
        let cache = Arc::new(InMemoryCache::new());
        cache.set_unavailable(true);
        let service = BlogReadService::new(Arc::new(store), cache);

        assert!(service.list_blogs(&BlogQuery::default()).await.is_ok());
        assert!(service.list_blogs(&BlogQuery::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_reports_failed_cache_write() {
        let mut store = MockBlogStore::new();
        store.expect_fetch_page().returning(|q| Ok(page_of(q)));
        let cache = Arc::new(InMemoryCache::new());
        cache.set_unavailable(true);
        let service = BlogReadService::new(Arc::new(store), cache);

        let refreshed = service.refresh_page(&BlogQuery::default()).await.unwrap();
        assert!(!refreshed.cached);
        assert_eq!(refreshed.value.blogs.len(), 1);
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let mut store = MockBlogStore::new();
        store
            .expect_fetch_page()
            .returning(|_| Err(InkflowError::Database("down".to_string())));
        let service = BlogReadService::new(Arc::new(store), Arc::new(InMemoryCache::new()));

        assert!(service.list_blogs(&BlogQuery::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_custom_ttls() {
        let mut store = MockBlogStore::new();
        store.expect_fetch_blog().returning(|id| Ok(Some(blog(id))));
        let cache = Arc::new(InMemoryCache::new());
        let service = BlogReadService::new(Arc::new(store), cache.clone())
            .with_ttls(Duration::from_secs(60), Duration::from_secs(30));

        assert!(service.refresh_blog(1).await.unwrap().unwrap().cached);
        assert_ttl(&cache, "blog:1", Duration::from_secs(60));
    }
}
