//! Redis broker connection, subscription and acknowledgement.

use super::{Envelope, QueueKeys, RedisBrokerConfig};
use crate::broker::{
    Acker, BrokerConnection, ConnectionEvent, Delivery, PublishOptions, QueueDeclaration,
    Subscription,
};
use crate::error::{MessagingError, MessagingResult};
use async_trait::async_trait;
use deadpool_redis::Pool;
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

struct Shared {
    open: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn fail(&self, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            warn!(reason, "Redis broker connection lost");
            let _ = self.events.send(ConnectionEvent::Error(reason.to_string()));
            let _ = self.events.send(ConnectionEvent::Closed);
        }
    }

    fn close(&self) -> bool {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        if was_open {
            let _ = self.events.send(ConnectionEvent::Closed);
        }
        was_open
    }

    /// Marks the connection failed on transport errors.
    fn observe<T>(&self, result: MessagingResult<T>) -> MessagingResult<T> {
        if let Err(e) = &result {
            if e.is_transient() {
                self.fail(&e.to_string());
            }
        }
        result
    }

    fn ensure_open(&self) -> MessagingResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(MessagingError::Closed)
        }
    }
}

/// A connection to the Redis broker.
pub struct RedisConnection {
    pool: Pool,
    keys: QueueKeys,
    consumer_id: String,
    lease_key: String,
    dead_letter: bool,
    block_timeout: Duration,
    shared: Arc<Shared>,
    subscribed: Mutex<Vec<String>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl RedisConnection {
    pub(crate) async fn open(pool: Pool, config: &RedisBrokerConfig) -> MessagingResult<Arc<Self>> {
        let keys = QueueKeys::new(&config.key_prefix);
        let lease_key = keys.lease(&config.consumer_id);
        refresh_lease(&pool, &lease_key, config.lease_ttl).await?;

        let (events, _) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            open: AtomicBool::new(true),
            events,
        });

        let heartbeat = spawn_heartbeat(
            pool.clone(),
            Arc::clone(&shared),
            Lease {
                key: lease_key.clone(),
                ttl: config.lease_ttl,
            },
            config.heartbeat_interval(),
        );

        Ok(Arc::new(Self {
            pool,
            keys,
            consumer_id: config.consumer_id.clone(),
            lease_key,
            dead_letter: config.dead_letter,
            block_timeout: config.block_timeout,
            shared,
            subscribed: Mutex::new(Vec::new()),
            heartbeat: Mutex::new(Some(heartbeat)),
        }))
    }

    async fn conn(&self) -> MessagingResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    /// Move every message of `from_key` back onto the queue.
    async fn requeue_list(&self, from_key: &str, queue_key: &str) -> MessagingResult<u64> {
        let mut conn = self.conn().await?;

        // Newest first; pushing each onto the consuming end leaves the oldest
        // to be delivered first.
        let pending: Vec<Vec<u8>> = conn.lrange(from_key, 0, -1).await?;
        let mut returned = 0u64;

        for raw in pending {
            let _: () = redis::pipe()
                .atomic()
                .lrem(from_key, 1, &raw)
                .ignore()
                .rpush(queue_key, Envelope::requeued(&raw))
                .ignore()
                .query_async(&mut *conn)
                .await?;
            returned += 1;
        }
        Ok(returned)
    }

    /// Move this consumer's unsettled deliveries back onto the queue.
    async fn return_inflight(&self, queue: &str) -> MessagingResult<u64> {
        let inflight_key = self.keys.inflight(queue, &self.consumer_id);
        let returned = self.requeue_list(&inflight_key, &self.keys.queue(queue)).await?;

        if returned > 0 {
            warn!(queue, consumer_id = %self.consumer_id, count = returned, "Returned unsettled deliveries to queue");
        }
        Ok(returned)
    }

    /// Requeue the in-flight lists of consumers whose lease has expired.
    ///
    /// A list is first renamed to a key owned by no live consumer, so only
    /// one subscriber drains it. A subscriber that dies while draining
    /// leaves that key to be reaped in turn.
    async fn reap_orphans(&self, queue: &str) -> MessagingResult<u64> {
        let mut conn = self.conn().await?;
        let pattern = self.keys.inflight_pattern(queue);
        let queue_key = self.keys.queue(queue);
        let mut cursor: u64 = 0;
        let mut candidates = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(REAP_SCAN_COUNT)
                .query_async(&mut *conn)
                .await?;
            candidates.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        candidates.sort_unstable();
        candidates.dedup();

        let mut reaped = 0u64;
        for key in candidates {
            let Some(owner) = self.keys.inflight_owner(queue, &key) else {
                continue;
            };
            if owner == self.consumer_id {
                continue;
            }
            let alive: bool = conn.exists(self.keys.lease(owner)).await?;
            if alive {
                continue;
            }

            let claim = self.keys.inflight(
                queue,
                &format!("{}:reaped:{}", self.consumer_id, Uuid::new_v4().simple()),
            );
            let renamed: redis::RedisResult<()> = conn.rename(&key, &claim).await;
            match renamed {
                Ok(()) => {}
                // Drained by another subscriber in the meantime
                Err(e) if e.kind() == redis::ErrorKind::ResponseError => continue,
                Err(e) => return Err(e.into()),
            }

            let count = self.requeue_list(&claim, &queue_key).await?;
            warn!(queue, owner, count, "Requeued deliveries of expired consumer");
            reaped += count;
        }
        Ok(reaped)
    }
}

/// Key and lifetime of a consumer lease.
struct Lease {
    key: String,
    ttl: Duration,
}

const REAP_SCAN_COUNT: usize = 100;

async fn refresh_lease(pool: &Pool, key: &str, ttl: Duration) -> MessagingResult<()> {
    let mut conn = pool.get().await?;
    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
    let _: () = redis::cmd("SET")
        .arg(key)
        .arg(1)
        .arg("PX")
        .arg(millis)
        .query_async(&mut *conn)
        .await?;
    Ok(())
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> MessagingResult<()> {
        self.shared.ensure_open()?;
        let result = async {
            let mut conn = self.conn().await?;
            let durability = if declaration.durable { "durable" } else { "transient" };
            let _: () = conn
                .hset(self.keys.registry(), &declaration.name, durability)
                .await?;
            Ok(())
        }
        .await;

        debug!(queue = %declaration.name, durable = declaration.durable, "Declared queue");
        self.shared.observe(result)
    }

    async fn publish(&self, queue: &str, body: &[u8], options: PublishOptions) -> MessagingResult<()> {
        self.shared.ensure_open()?;
        let envelope = Envelope::wrap(body)?;
        let payload = envelope.to_bytes()?;

        let result = async {
            let mut conn = self.conn().await?;
            let _: () = conn.lpush(self.keys.queue(queue), payload).await?;
            Ok(())
        }
        .await;

        trace!(queue, message_id = %envelope.id, persistent = options.persistent, "Published message");
        self.shared.observe(result)
    }

    async fn subscribe(&self, queue: &str, prefetch: u16) -> MessagingResult<Box<dyn Subscription>> {
        self.shared.ensure_open()?;

        let declared = async {
            let mut conn = self.conn().await?;
            let declared: bool = conn.hexists(self.keys.registry(), queue).await?;
            Ok(declared)
        }
        .await;
        if !self.shared.observe(declared)? {
            return Err(MessagingError::QueueNotDeclared(queue.to_string()));
        }

        let returned = self.return_inflight(queue).await;
        self.shared.observe(returned)?;
        let reaped = self.reap_orphans(queue).await;
        self.shared.observe(reaped)?;
        self.subscribed.lock().push(queue.to_string());

        info!(queue, consumer_id = %self.consumer_id, prefetch, "Subscribed to queue");

        Ok(Box::new(RedisSubscription {
            pool: self.pool.clone(),
            shared: Arc::clone(&self.shared),
            queue_key: self.keys.queue(queue),
            inflight_key: self.keys.inflight(queue, &self.consumer_id),
            dead_key: self.dead_letter.then(|| self.keys.dead(queue)),
            block_timeout: self.block_timeout,
            permits: Arc::new(Semaphore::new(usize::from(prefetch.max(1)))),
        }))
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    async fn close(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
        if !self.shared.close() {
            return;
        }

        let queues: Vec<String> = self.subscribed.lock().drain(..).collect();
        for queue in queues {
            if let Err(e) = self.return_inflight(&queue).await {
                warn!(queue = %queue, error = %e, "Could not return unsettled deliveries on close");
            }
        }
        let released = async {
            let mut conn = self.conn().await?;
            let _: () = conn.del(&self.lease_key).await?;
            MessagingResult::Ok(())
        }
        .await;
        if let Err(e) = released {
            debug!(error = %e, "Could not release consumer lease");
        }
        self.pool.close();
        debug!("Redis broker connection closed");
    }
}

impl Drop for RedisConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.get_mut().take() {
            handle.abort();
        }
    }
}

fn spawn_heartbeat(pool: Pool, shared: Arc<Shared>, lease: Lease, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if !shared.is_open() {
                break;
            }

            match refresh_lease(&pool, &lease.key, lease.ttl).await {
                Ok(()) => trace!("Broker heartbeat ok"),
                Err(e) => {
                    shared.fail(&format!("heartbeat failed: {}", e));
                    break;
                }
            }
        }
    })
}

struct RedisSubscription {
    pool: Pool,
    shared: Arc<Shared>,
    queue_key: String,
    inflight_key: String,
    dead_key: Option<String>,
    block_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl RedisSubscription {
    async fn receive(&self) -> MessagingResult<Option<Vec<u8>>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<Vec<u8>> = redis::cmd("BLMOVE")
            .arg(&self.queue_key)
            .arg(&self.inflight_key)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(self.block_timeout.as_secs_f64())
            .query_async(&mut *conn)
            .await?;
        Ok(raw)
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next(&mut self) -> MessagingResult<Option<Delivery>> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| MessagingError::Closed)?;

        loop {
            if !self.shared.is_open() {
                return Ok(None);
            }

            let raw = match self.shared.observe(self.receive().await) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) if e.is_transient() => return Ok(None),
                Err(e) => return Err(e),
            };

            let (body, delivery_count) = match Envelope::parse(&raw) {
                Some(envelope) => (envelope.body.into_bytes(), envelope.deliveries + 1),
                None => {
                    warn!(queue = %self.queue_key, "Received message without envelope");
                    (raw.clone(), 1)
                }
            };

            let acker = RedisAcker {
                pool: self.pool.clone(),
                shared: Arc::clone(&self.shared),
                queue_key: self.queue_key.clone(),
                inflight_key: self.inflight_key.clone(),
                dead_key: self.dead_key.clone(),
                raw,
            };
            return Ok(Some(
                Delivery::new(body, delivery_count, Box::new(acker)).with_permit(permit),
            ));
        }
    }
}

struct RedisAcker {
    pool: Pool,
    shared: Arc<Shared>,
    queue_key: String,
    inflight_key: String,
    dead_key: Option<String>,
    raw: Vec<u8>,
}

impl RedisAcker {
    async fn remove(&self) -> MessagingResult<()> {
        let mut conn = self.pool.get().await?;
        let removed: i64 = conn.lrem(&self.inflight_key, 1, &self.raw).await?;
        if removed == 0 {
            return Err(MessagingError::UnknownDelivery(self.inflight_key.clone()));
        }
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> MessagingResult<()> {
        let mut conn = self.pool.get().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().lrem(&self.inflight_key, 1, &self.raw).ignore();

        if requeue {
            pipe.rpush(&self.queue_key, Envelope::requeued(&self.raw)).ignore();
        } else if let Some(dead_key) = &self.dead_key {
            pipe.lpush(dead_key, &self.raw).ignore();
        }

        let _: () = pipe.query_async(&mut *conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Acker for RedisAcker {
    async fn ack(&self) -> MessagingResult<()> {
        self.shared.ensure_open()?;
        self.shared.observe(self.remove().await)
    }

    async fn nack(&self, requeue: bool) -> MessagingResult<()> {
        self.shared.ensure_open()?;
        self.shared.observe(self.reject(requeue).await)
    }
}
