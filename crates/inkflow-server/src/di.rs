//! Manual dependency wiring for the cache-sync process.
//!
//! [`build_cache_sync_module`] connects the production backends from
//! configuration. [`CacheSyncModuleBuilder`] assembles the same graph from
//! ready-made components, which is how tests swap in the in-memory ones.

use inkflow_blog::{BlogCacheWarmer, BlogReadService, BlogStore, PgBlogStore};
use inkflow_cache::{CacheInterface, RedisCacheService};
use inkflow_config::AppConfig;
use inkflow_core::{InkflowError, InkflowResult};
use inkflow_invalidation::{CacheRebuilder, CacheSyncWorker, NoopRebuilder, WorkerConfig};
use inkflow_messaging::{
    Broker, ConnectionManager, QueueDeclaration, RedisBroker, RedisBrokerConfig, SupervisorConfig,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Role name of the consumer-side connection.
pub const CONSUMER_ROLE: &str = "cache-sync";

/// Resolved components of the cache-sync process.
pub struct CacheSyncModule {
    consumer_id: String,
    cache: Arc<dyn CacheInterface>,
    connections: Arc<ConnectionManager>,
    worker: Arc<CacheSyncWorker>,
}

impl CacheSyncModule {
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn cache(&self) -> Arc<dyn CacheInterface> {
        Arc::clone(&self.cache)
    }

    pub fn connections(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.connections)
    }

    pub fn worker(&self) -> Arc<CacheSyncWorker> {
        Arc::clone(&self.worker)
    }
}

/// Builds a [`CacheSyncModule`] from components.
pub struct CacheSyncModuleBuilder {
    config: AppConfig,
    consumer_id: Option<String>,
    cache: Option<Arc<dyn CacheInterface>>,
    store: Option<Arc<dyn BlogStore>>,
    broker: Option<Arc<dyn Broker>>,
}

impl CacheSyncModuleBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            consumer_id: None,
            cache: None,
            store: None,
            broker: None,
        }
    }

    pub fn with_consumer_id(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = Some(consumer_id.into());
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheInterface>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// System of record used for warm-up. Without one, nothing is rebuilt.
    pub fn with_store(mut self, store: Arc<dyn BlogStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn build(self) -> InkflowResult<CacheSyncModule> {
        let config = self.config;
        let cache = self
            .cache
            .ok_or_else(|| InkflowError::Configuration("cache is required".to_string()))?;
        let broker = self
            .broker
            .ok_or_else(|| InkflowError::Configuration("broker is required".to_string()))?;
        let consumer_id = self.consumer_id.unwrap_or_else(|| consumer_id(&config));

        let rebuilder: Arc<dyn CacheRebuilder> = match self.store {
            Some(store) if config.warmup.enabled => {
                let reader = BlogReadService::new(store, Arc::clone(&cache))
                    .with_ttls(config.cache.entity_ttl(), config.cache.collection_ttl());
                Arc::new(BlogCacheWarmer::new(reader, config.warmup.clone()))
            }
            _ => Arc::new(NoopRebuilder),
        };

        let connections = Arc::new(
            ConnectionManager::new(CONSUMER_ROLE, broker, SupervisorConfig::from(&config.broker))
                .with_queue(QueueDeclaration::durable(&config.broker.queue)),
        );

        let worker = Arc::new(CacheSyncWorker::new(
            Arc::clone(&connections),
            Arc::clone(&cache),
            rebuilder,
            WorkerConfig::from(&config),
        ));

        Ok(CacheSyncModule {
            consumer_id,
            cache,
            connections,
            worker,
        })
    }
}

/// Configured consumer id, or a fresh `cache-sync-<uuid>`.
pub fn consumer_id(config: &AppConfig) -> String {
    let configured = config.consumer.consumer_id.trim();
    if configured.is_empty() {
        format!("{}-{}", CONSUMER_ROLE, Uuid::new_v4())
    } else {
        configured.to_string()
    }
}

/// Connects Redis (cache and broker) and, when warm-up is on, Postgres.
pub async fn build_cache_sync_module(config: &AppConfig) -> InkflowResult<CacheSyncModule> {
    let consumer_id = consumer_id(config);

    let cache = RedisCacheService::connect(&config.redis, config.cache.scan_count).await?;

    let broker = RedisBroker::new(RedisBrokerConfig::from_config(
        &config.broker,
        &config.redis.url,
        consumer_id.clone(),
    ));

    let mut builder = CacheSyncModuleBuilder::new(config.clone())
        .with_consumer_id(consumer_id)
        .with_cache(Arc::new(cache))
        .with_broker(Arc::new(broker));

    if config.warmup.enabled {
        let store = PgBlogStore::connect(&config.database).await?;
        builder = builder.with_store(Arc::new(store));
    } else {
        info!("Cache warm-up disabled, invalidated keys refill on read");
    }

    builder.build()
}
