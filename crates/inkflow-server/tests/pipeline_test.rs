//! End-to-end tests of the invalidation pipeline over in-memory backends.

use chrono::NaiveDate;
use inkflow_blog::{
    Blog, BlogChangeNotifier, BlogMutation, BlogPage, BlogQuery, BlogReadService, InMemoryBlogStore,
};
use inkflow_cache::{CacheExt, CacheInterface, InMemoryCache};
use inkflow_config::AppConfig;
use inkflow_core::InkflowResult;
use inkflow_invalidation::{CacheInvalidationPublisher, PublishOutcome};
use inkflow_messaging::{ConnectionManager, InMemoryBroker, QueueDeclaration, SupervisorConfig};
use inkflow_server::di::{CacheSyncModule, CacheSyncModuleBuilder};
use inkflow_server::startup::run_until;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const QUEUE: &str = "cache-invalidation";
const FIRST_PAGE: &str = "blogs:v2:all:all:page:1:limit:16";

fn blog(id: i32, title: &str) -> Blog {
    Blog {
        id,
        title: title.to_string(),
        description: "desc".to_string(),
        content: "content".to_string(),
        image: String::new(),
        category: "tech".to_string(),
        author: "u-1".to_string(),
        create_at: NaiveDate::from_ymd_opt(2024, 3, 1).and_then(|d| d.and_hms_opt(12, 0, 0)),
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct Pipeline {
    broker: InMemoryBroker,
    cache: Arc<InMemoryCache>,
    store: Arc<InMemoryBlogStore>,
    module: Arc<CacheSyncModule>,
    publisher_connections: Arc<ConnectionManager>,
    publisher: Arc<CacheInvalidationPublisher>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<InkflowResult<()>>>,
}

impl Pipeline {
    fn new() -> Self {
        let mut config = AppConfig::default();
        config.consumer.requeue_delay_ms = 10;
        config.broker.reconnect_delay_secs = 1;

        let broker = InMemoryBroker::new();
        let cache = Arc::new(InMemoryCache::new());
        let store = Arc::new(InMemoryBlogStore::new());

        let module = CacheSyncModuleBuilder::new(config.clone())
            .with_consumer_id("cache-sync-test")
            .with_cache(cache.clone())
            .with_store(store.clone())
            .with_broker(Arc::new(broker.clone()))
            .build()
            .unwrap();

        let publisher_connections = Arc::new(
            ConnectionManager::new("publisher", Arc::new(broker.clone()), SupervisorConfig::default())
                .with_queue(QueueDeclaration::durable(QUEUE)),
        );
        let publisher = Arc::new(CacheInvalidationPublisher::from_config(
            Arc::clone(&publisher_connections),
            &config,
        ));

        Self {
            broker,
            cache,
            store,
            module: Arc::new(module),
            publisher_connections,
            publisher,
            stop: None,
            task: None,
        }
    }

    fn reader(&self) -> BlogReadService {
        BlogReadService::new(self.store.clone(), self.cache.clone())
    }

    async fn start(&mut self) {
        let (tx, rx) = oneshot::channel();
        let module = Arc::clone(&self.module);
        self.task = Some(tokio::spawn(async move {
            run_until(&module, async {
                let _ = rx.await;
            })
            .await
        }));
        self.stop = Some(tx);

        let broker = self.broker.clone();
        eventually("queue declaration", || broker.is_declared(QUEUE)).await;
        self.publisher_connections.ensure_connected().await;
    }

    async fn stop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.unwrap().unwrap();
        }
    }

    async fn wait_acked(&self, count: u64) {
        let worker = self.module.worker();
        eventually("acknowledgements", || worker.stats().acked >= count).await;
    }
}

#[tokio::test]
async fn test_update_invalidates_and_rebuilds() {
    let mut pipeline = Pipeline::new();
    pipeline.store.upsert(blog(1, "Old title"));

    let reader = pipeline.reader();
    reader.list_blogs(&BlogQuery::default()).await.unwrap();
    reader.get_blog(1).await.unwrap();
    assert!(pipeline.cache.exists("blog:1").await.unwrap());

    pipeline.start().await;

    pipeline.store.upsert(blog(1, "New title"));
    let notifier = BlogChangeNotifier::new(Arc::clone(&pipeline.publisher));
    notifier.notify(BlogMutation::Updated(1)).await;
    pipeline.wait_acked(1).await;

    // Single blog is gone, the first page was rebuilt from the store
    assert!(!pipeline.cache.exists("blog:1").await.unwrap());
    let page: BlogPage = pipeline.cache.get(FIRST_PAGE).await.unwrap().unwrap();
    assert_eq!(page.blogs[0].title, "New title");

    let reads = pipeline.store.reads();
    let served = reader.list_blogs(&BlogQuery::default()).await.unwrap();
    assert_eq!(served.blogs[0].title, "New title");
    assert_eq!(pipeline.store.reads(), reads);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_filtered_pages_are_invalidated_not_rebuilt() {
    let mut pipeline = Pipeline::new();
    pipeline.store.upsert(blog(1, "Rust"));

    let reader = pipeline.reader();
    let filtered = BlogQuery::new("rust", "tech", 1, 16);
    reader.list_blogs(&filtered).await.unwrap();
    assert!(pipeline.cache.exists(&filtered.cache_key()).await.unwrap());

    pipeline.start().await;
    pipeline.publisher.invalidate(BlogMutation::Created.key_patterns()).await;
    pipeline.wait_acked(1).await;

    assert!(!pipeline.cache.exists(&filtered.cache_key()).await.unwrap());
    assert_eq!(pipeline.cache.keys(), vec![FIRST_PAGE.to_string()]);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_repeated_job_is_idempotent() {
    let mut pipeline = Pipeline::new();
    pipeline.store.upsert(blog(1, "Post"));
    pipeline.cache.set_raw("blog:1", "{}", Duration::from_secs(60)).await.unwrap();
    pipeline.cache.set_raw("users:1", "{}", Duration::from_secs(60)).await.unwrap();

    pipeline.start().await;
    for _ in 0..2 {
        pipeline.publisher.invalidate(["blogs:*", "blog:1"]).await;
    }
    pipeline.wait_acked(2).await;

    assert_eq!(
        pipeline.cache.keys(),
        vec![FIRST_PAGE.to_string(), "users:1".to_string()]
    );
    assert_eq!(pipeline.broker.acked_count(QUEUE), 2);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_cache_outage_redelivers_job() {
    let mut pipeline = Pipeline::new();
    pipeline.cache.set_raw("blog:2", "{}", Duration::from_secs(60)).await.unwrap();
    pipeline.cache.set_unavailable(true);

    pipeline.start().await;
    pipeline.publisher.invalidate(["blog:2"]).await;

    let worker = pipeline.module.worker();
    eventually("a requeue", || worker.stats().requeued >= 1).await;
    assert!(pipeline.broker.requeued_count(QUEUE) >= 1);

    pipeline.cache.set_unavailable(false);
    pipeline.wait_acked(1).await;
    assert!(!pipeline.cache.exists("blog:2").await.unwrap());

    pipeline.stop().await;
}

#[tokio::test]
async fn test_poison_message_is_dropped() {
    let mut pipeline = Pipeline::new();
    pipeline.cache.set_raw("blog:3", "{}", Duration::from_secs(60)).await.unwrap();
    pipeline.start().await;

    assert!(pipeline.broker.inject(QUEUE, b"not json".to_vec()));
    assert!(pipeline.broker.inject(QUEUE, br#"{"action":"invalidateCache","keys":[]}"#.to_vec()));
    pipeline.publisher.invalidate(["blog:3"]).await;
    pipeline.wait_acked(1).await;

    assert_eq!(pipeline.broker.dropped(QUEUE).len(), 2);
    assert_eq!(pipeline.module.worker().stats().dropped, 2);
    assert!(!pipeline.cache.exists("blog:3").await.unwrap());

    pipeline.stop().await;
}

#[tokio::test]
async fn test_publish_while_disconnected_does_not_block() {
    let pipeline = Pipeline::new();

    let outcome = tokio::time::timeout(
        Duration::from_millis(500),
        pipeline.publisher.try_invalidate(["blogs:*"]),
    )
    .await
    .expect("publish must not block")
    .unwrap();
    assert_eq!(outcome, PublishOutcome::NotReady);
    assert_eq!(pipeline.broker.ready_count(QUEUE), 0);

    pipeline.publisher_connections.ensure_connected().await;
    let outcome = pipeline.publisher.try_invalidate(["blogs:*"]).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Published);
    assert_eq!(pipeline.broker.ready_count(QUEUE), 1);
}

#[tokio::test]
async fn test_worker_recovers_after_broker_reset() {
    let mut pipeline = Pipeline::new();
    pipeline.cache.set_raw("blog:4", "{}", Duration::from_secs(60)).await.unwrap();
    pipeline.start().await;

    let connections = pipeline.module.connections();
    let before = connections.connect_count();
    pipeline.broker.close_connections();
    eventually("a reconnect", || connections.connect_count() > before).await;

    pipeline.publisher_connections.ensure_connected().await;
    pipeline.publisher.invalidate(["blog:4"]).await;
    pipeline.wait_acked(1).await;
    assert!(!pipeline.cache.exists("blog:4").await.unwrap());

    pipeline.stop().await;
}
