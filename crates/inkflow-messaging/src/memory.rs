//! In-process broker.
//!
//! Mirrors the semantics the pipeline relies on: queues outlive
//! connections, unsettled deliveries return to the head of their queue when
//! the owning connection closes, and `nack(requeue)` redelivers with the
//! redelivered flag set. The broker can be taken down and brought back to
//! exercise reconnect handling.

use crate::broker::{
    Acker, Broker, BrokerConnection, ConnectionEvent, Delivery, PublishOptions, QueueDeclaration,
    Subscription,
};
use crate::error::{MessagingError, MessagingResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch, Notify, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    deliveries: u32,
}

#[derive(Debug)]
struct Unacked {
    connection: u64,
    message: Message,
}

#[derive(Debug, Default)]
struct QueueState {
    durable: bool,
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Unacked>,
    acked: u64,
    requeued: u64,
    dropped: Vec<Vec<u8>>,
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, QueueState>>,
    ready: Notify,
    unavailable: AtomicBool,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
    next_connection: AtomicU64,
    next_tag: AtomicU64,
    connect_attempts: AtomicU64,
}

impl BrokerState {
    fn take_next(&self, queue: &str, connection: u64, open: &AtomicBool) -> Option<(u64, Message)> {
        let mut queues = self.queues.lock();
        // Checked under the lock so a closing connection never strands a delivery.
        if !open.load(Ordering::SeqCst) {
            return None;
        }
        let state = queues.get_mut(queue)?;
        let mut message = state.ready.pop_front()?;
        message.deliveries += 1;

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        state.unacked.insert(
            tag,
            Unacked {
                connection,
                message: message.clone(),
            },
        );
        Some((tag, message))
    }

    fn requeue_unacked(&self, connection: u64) {
        let mut returned = 0usize;
        {
            let mut queues = self.queues.lock();
            for state in queues.values_mut() {
                let mut tags: Vec<u64> = state
                    .unacked
                    .iter()
                    .filter(|(_, unacked)| unacked.connection == connection)
                    .map(|(tag, _)| *tag)
                    .collect();
                tags.sort_unstable();

                for tag in tags.into_iter().rev() {
                    if let Some(unacked) = state.unacked.remove(&tag) {
                        state.ready.push_front(unacked.message);
                        returned += 1;
                    }
                }
            }
        }

        if returned > 0 {
            debug!(connection, returned, "Returned unsettled deliveries to their queues");
            self.ready.notify_waiters();
        }
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&QueueState) -> T) -> Option<T> {
        self.queues.lock().get(queue).map(f)
    }
}

/// In-process [`Broker`] implementation.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the broker down (`false`) or bring it back (`true`).
    ///
    /// Taking it down fails every open connection and refuses new ones.
    /// Queue contents survive.
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
        if !available {
            self.fail_connections("broker unavailable");
        }
    }

    /// Drop every open connection while staying available.
    pub fn close_connections(&self) {
        self.fail_connections("connection reset by broker");
    }

    fn fail_connections(&self, reason: &str) {
        let connections: Vec<Arc<MemoryConnection>> = {
            let mut registry = self.state.connections.lock();
            registry.retain(|weak| weak.strong_count() > 0);
            registry.iter().filter_map(Weak::upgrade).collect()
        };
        for connection in connections {
            connection.shutdown(Some(reason));
        }
    }

    /// Number of connect attempts, failed ones included.
    pub fn connect_attempts(&self) -> u64 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of connections currently open.
    pub fn open_connections(&self) -> usize {
        self.state
            .connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|connection| connection.is_open())
            .count()
    }

    /// Returns `true` if the queue has been declared.
    pub fn is_declared(&self, queue: &str) -> bool {
        self.state.queues.lock().contains_key(queue)
    }

    /// Returns `true` if the queue was declared durable.
    pub fn is_durable(&self, queue: &str) -> bool {
        self.state.with_queue(queue, |q| q.durable).unwrap_or(false)
    }

    /// Messages waiting for delivery.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state.with_queue(queue, |q| q.ready.len()).unwrap_or(0)
    }

    /// Deliveries not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state.with_queue(queue, |q| q.unacked.len()).unwrap_or(0)
    }

    /// Messages acknowledged so far.
    pub fn acked_count(&self, queue: &str) -> u64 {
        self.state.with_queue(queue, |q| q.acked).unwrap_or(0)
    }

    /// Messages returned to the queue by `nack(requeue = true)`.
    pub fn requeued_count(&self, queue: &str) -> u64 {
        self.state.with_queue(queue, |q| q.requeued).unwrap_or(0)
    }

    /// Bodies of messages rejected without requeue.
    pub fn dropped(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state.with_queue(queue, |q| q.dropped.clone()).unwrap_or_default()
    }

    /// Place a raw message on a declared queue, bypassing any connection.
    ///
    /// Returns `false` if the queue does not exist.
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) -> bool {
        let injected = match self.state.queues.lock().get_mut(queue) {
            Some(state) => {
                state.ready.push_back(Message {
                    body: body.into(),
                    deliveries: 0,
                });
                true
            }
            None => false,
        };
        if injected {
            self.state.ready.notify_waiters();
        }
        injected
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> MessagingResult<Arc<dyn BrokerConnection>> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(MessagingError::Connection("broker unavailable".to_string()));
        }

        let (events, _) = broadcast::channel(16);
        let (closed, _) = watch::channel(false);
        let connection = Arc::new(MemoryConnection {
            id: self.state.next_connection.fetch_add(1, Ordering::SeqCst) + 1,
            state: Arc::clone(&self.state),
            open: Arc::new(AtomicBool::new(true)),
            closed,
            events,
        });

        self.state
            .connections
            .lock()
            .push(Arc::downgrade(&connection));
        debug!(connection = connection.id, "In-memory broker connection opened");

        Ok(connection)
    }
}

struct MemoryConnection {
    id: u64,
    state: Arc<BrokerState>,
    open: Arc<AtomicBool>,
    closed: watch::Sender<bool>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl MemoryConnection {
    fn shutdown(&self, error: Option<&str>) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.state.requeue_unacked(self.id);

        if let Some(reason) = error {
            warn!(connection = self.id, reason, "In-memory broker connection failed");
            let _ = self.events.send(ConnectionEvent::Error(reason.to_string()));
        }
        let _ = self.events.send(ConnectionEvent::Closed);
        self.closed.send_replace(true);
    }

    fn ensure_open(&self) -> MessagingResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MessagingError::Closed)
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> MessagingResult<()> {
        self.ensure_open()?;
        let mut queues = self.state.queues.lock();
        let state = queues
            .entry(declaration.name.clone())
            .or_insert_with(|| QueueState {
                durable: declaration.durable,
                ..QueueState::default()
            });

        if state.durable != declaration.durable {
            return Err(MessagingError::Configuration(format!(
                "Queue '{}' already declared with durable={}",
                declaration.name, state.durable
            )));
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], _options: PublishOptions) -> MessagingResult<()> {
        self.ensure_open()?;
        {
            let mut queues = self.state.queues.lock();
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| MessagingError::QueueNotDeclared(queue.to_string()))?;
            state.ready.push_back(Message {
                body: body.to_vec(),
                deliveries: 0,
            });
        }
        self.state.ready.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, queue: &str, prefetch: u16) -> MessagingResult<Box<dyn Subscription>> {
        self.ensure_open()?;
        if !self.state.queues.lock().contains_key(queue) {
            return Err(MessagingError::QueueNotDeclared(queue.to_string()));
        }

        Ok(Box::new(MemorySubscription {
            queue: queue.to_string(),
            connection: self.id,
            state: Arc::clone(&self.state),
            open: Arc::clone(&self.open),
            closed: self.closed.subscribe(),
            permits: Arc::new(Semaphore::new(usize::from(prefetch.max(1)))),
        }))
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.shutdown(None);
    }
}

struct MemorySubscription {
    queue: String,
    connection: u64,
    state: Arc<BrokerState>,
    open: Arc<AtomicBool>,
    closed: watch::Receiver<bool>,
    permits: Arc<Semaphore>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> MessagingResult<Option<Delivery>> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| MessagingError::Closed)?
            }
            _ = self.closed.wait_for(|closed| *closed) => return Ok(None),
        };

        loop {
            // Register interest before looking so a concurrent publish is not missed.
            let notified = self.state.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some((tag, message)) = self.state.take_next(&self.queue, self.connection, &self.open) {
                let acker = MemoryAcker {
                    state: Arc::clone(&self.state),
                    queue: self.queue.clone(),
                    tag,
                    open: Arc::clone(&self.open),
                };
                return Ok(Some(
                    Delivery::new(message.body, message.deliveries, Box::new(acker)).with_permit(permit),
                ));
            }

            if !self.open.load(Ordering::SeqCst) {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.closed.wait_for(|closed| *closed) => return Ok(None),
            }
        }
    }
}

struct MemoryAcker {
    state: Arc<BrokerState>,
    queue: String,
    tag: u64,
    open: Arc<AtomicBool>,
}

impl MemoryAcker {
    fn settle<T>(&self, f: impl FnOnce(&mut QueueState, Message) -> T) -> MessagingResult<T> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed);
        }
        let mut queues = self.state.queues.lock();
        let state = queues
            .get_mut(&self.queue)
            .ok_or_else(|| MessagingError::QueueNotDeclared(self.queue.clone()))?;
        let unacked = state
            .unacked
            .remove(&self.tag)
            .ok_or_else(|| MessagingError::UnknownDelivery(self.tag.to_string()))?;
        Ok(f(state, unacked.message))
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> MessagingResult<()> {
        self.settle(|state, _| state.acked += 1)
    }

    async fn nack(&self, requeue: bool) -> MessagingResult<()> {
        self.settle(|state, message| {
            if requeue {
                state.requeued += 1;
                state.ready.push_front(message);
            } else {
                state.dropped.push(message.body);
            }
        })?;
        if requeue {
            self.state.ready.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const QUEUE: &str = "cache-invalidation";

    async fn connected(broker: &InMemoryBroker) -> Arc<dyn BrokerConnection> {
        let connection = broker.connect().await.unwrap();
        connection
            .declare_queue(&QueueDeclaration::durable(QUEUE))
            .await
            .unwrap();
        connection
    }

    #[tokio::test]
    async fn test_publish_and_ack() {
        let broker = InMemoryBroker::new();
        let connection = connected(&broker).await;
        assert!(broker.is_durable(QUEUE));

        connection
            .publish(QUEUE, b"hello", PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(broker.ready_count(QUEUE), 1);

        let mut subscription = connection.subscribe(QUEUE, 1).await.unwrap();
        let delivery = subscription.next().await.unwrap().unwrap();
        assert_eq!(delivery.body(), b"hello");
        assert!(!delivery.redelivered());
        assert_eq!(broker.unacked_count(QUEUE), 1);

        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked_count(QUEUE), 0);
        assert_eq!(broker.acked_count(QUEUE), 1);
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_queue_fails() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().await.unwrap();

        let err = connection
            .publish("missing", b"x", PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::QueueNotDeclared(_)));
        assert!(!broker.inject("missing", "x"));
    }

    #[tokio::test]
    async fn test_redeclare_with_other_durability_fails() {
        let broker = InMemoryBroker::new();
        let connection = connected(&broker).await;

        connection
            .declare_queue(&QueueDeclaration::durable(QUEUE))
            .await
            .unwrap();
        let transient = QueueDeclaration {
            name: QUEUE.to_string(),
            durable: false,
        };
        assert!(connection.declare_queue(&transient).await.is_err());
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers_first() {
        let broker = InMemoryBroker::new();
        let connection = connected(&broker).await;
        broker.inject(QUEUE, "first");
        broker.inject(QUEUE, "second");

        let mut subscription = connection.subscribe(QUEUE, 1).await.unwrap();
        let delivery = subscription.next().await.unwrap().unwrap();
        assert_eq!(delivery.body(), b"first");
        delivery.nack(true).await.unwrap();

        let again = subscription.next().await.unwrap().unwrap();
        assert_eq!(again.body(), b"first");
        assert!(again.redelivered());
        assert_eq!(again.delivery_count(), 2);
        assert_eq!(broker.requeued_count(QUEUE), 1);
        again.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_nack_without_requeue_drops() {
        let broker = InMemoryBroker::new();
        let connection = connected(&broker).await;
        broker.inject(QUEUE, "poison");

        let mut subscription = connection.subscribe(QUEUE, 1).await.unwrap();
        subscription.next().await.unwrap().unwrap().nack(false).await.unwrap();

        assert_eq!(broker.ready_count(QUEUE), 0);
        assert_eq!(broker.dropped(QUEUE), vec![b"poison".to_vec()]);
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unsettled_deliveries() {
        let broker = InMemoryBroker::new();
        let connection = connected(&broker).await;
        for i in 0..3 {
            broker.inject(QUEUE, format!("m{}", i));
        }

        let mut subscription = connection.subscribe(QUEUE, 2).await.unwrap();
        let first = subscription.next().await.unwrap().unwrap();
        let _second = subscription.next().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), subscription.next()).await;
        assert!(blocked.is_err());

        first.ack().await.unwrap();
        let third = subscription.next().await.unwrap().unwrap();
        assert_eq!(third.body(), b"m2");
    }

    #[tokio::test]
    async fn test_next_waits_for_publish() {
        let broker = InMemoryBroker::new();
        let connection = connected(&broker).await;
        let mut subscription = connection.subscribe(QUEUE, 1).await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.inject(QUEUE, "late");
        });

        let delivery = subscription.next().await.unwrap().unwrap();
        assert_eq!(delivery.body(), b"late");
    }

    #[tokio::test]
    async fn test_next_is_woken_by_inject() {
        let broker = InMemoryBroker::new();
        let connection = connected(&broker).await;
        let mut subscription = connection.subscribe(QUEUE, 1).await.unwrap();

        let mut next = tokio_test::task::spawn(subscription.next());
        tokio_test::assert_pending!(next.poll());

        broker.inject(QUEUE, "wake");
        assert!(next.is_woken());
        let delivery = tokio_test::assert_ready_ok!(next.poll()).unwrap();
        assert_eq!(delivery.body(), b"wake");
    }

    #[tokio::test]
    async fn test_close_returns_unsettled_and_ends_subscription() {
        let broker = InMemoryBroker::new();
        let connection = connected(&broker).await;
        broker.inject(QUEUE, "job");

        let mut subscription = connection.subscribe(QUEUE, 1).await.unwrap();
        let delivery = subscription.next().await.unwrap().unwrap();

        broker.close_connections();
        assert!(!connection.is_open());
        assert!(matches!(delivery.ack().await, Err(MessagingError::Closed)));
        assert!(subscription.next().await.unwrap().is_none());
        assert_eq!(broker.ready_count(QUEUE), 1);

        let reconnected = connected(&broker).await;
        let mut subscription = reconnected.subscribe(QUEUE, 1).await.unwrap();
        let redelivered = subscription.next().await.unwrap().unwrap();
        assert!(redelivered.redelivered());
    }

    #[tokio::test]
    async fn test_unavailable_broker_emits_events_and_refuses_connections() {
        let broker = InMemoryBroker::new();
        let connection = connected(&broker).await;
        let mut events = connection.events();

        broker.set_available(false);
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Error(_)));
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Closed);
        assert!(broker.connect().await.is_err());
        assert_eq!(broker.open_connections(), 0);

        broker.set_available(true);
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
        assert!(broker.is_declared(QUEUE));
    }

    #[tokio::test]
    async fn test_clean_close_emits_only_closed() {
        let broker = InMemoryBroker::new();
        let connection = connected(&broker).await;
        let mut events = connection.events();

        connection.close().await;
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Closed);
        assert!(connection.publish(QUEUE, b"x", PublishOptions::default()).await.is_err());
    }
}
