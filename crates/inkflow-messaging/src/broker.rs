//! Broker abstraction shared by every backend.
//!
//! A [`Broker`] hands out [`BrokerConnection`]s. A connection declares
//! queues, publishes persistent messages and opens prefetch-bounded
//! [`Subscription`]s. Every [`Delivery`] must be settled exactly once with
//! [`Delivery::ack`] or [`Delivery::nack`]; until then it counts against the
//! subscription's prefetch window.

use crate::error::MessagingResult;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, OwnedSemaphorePermit};

/// A queue to (re-)declare on every fresh connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    /// Queue name.
    pub name: String,
    /// Survives broker restarts.
    pub durable: bool,
}

impl QueueDeclaration {
    /// A durable queue declaration.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }
}

/// Per-message publish options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Ask the broker to persist the message.
    pub persistent: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self { persistent: true }
    }
}

/// Lifecycle events emitted by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A transport error occurred. A `Closed` event follows.
    Error(String),
    /// The connection is gone and will not recover.
    Closed,
}

/// Connection factory for a broker backend.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Backend name used in logs.
    fn name(&self) -> &'static str;

    /// Open a new connection.
    async fn connect(&self) -> MessagingResult<Arc<dyn BrokerConnection>>;
}

/// A live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Idempotently declare a queue.
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> MessagingResult<()>;

    /// Publish a message to a declared queue.
    async fn publish(&self, queue: &str, body: &[u8], options: PublishOptions) -> MessagingResult<()>;

    /// Start consuming a declared queue with at most `prefetch` unsettled
    /// deliveries.
    async fn subscribe(&self, queue: &str, prefetch: u16) -> MessagingResult<Box<dyn Subscription>>;

    /// Subscribe to lifecycle events.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Returns `true` until the connection is closed.
    fn is_open(&self) -> bool;

    /// Close the connection. Unsettled deliveries become available again.
    async fn close(&self);
}

/// A stream of deliveries from one queue.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery.
    ///
    /// Returns `Ok(None)` once the underlying connection has closed.
    async fn next(&mut self) -> MessagingResult<Option<Delivery>>;
}

/// Backend hook that settles one delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Positively acknowledge the delivery.
    async fn ack(&self) -> MessagingResult<()>;

    /// Reject the delivery, optionally returning it to the queue.
    async fn nack(&self, requeue: bool) -> MessagingResult<()>;
}

/// A message handed to a consumer.
pub struct Delivery {
    body: Vec<u8>,
    delivery_count: u32,
    acker: Box<dyn Acker>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Delivery {
    /// Create a delivery. `delivery_count` is 1 for a first delivery.
    pub fn new(body: Vec<u8>, delivery_count: u32, acker: Box<dyn Acker>) -> Self {
        Self {
            body,
            delivery_count: delivery_count.max(1),
            acker,
            permit: None,
        }
    }

    /// Attach the prefetch permit released when the delivery is settled.
    #[must_use]
    pub fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }

    /// Message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns `true` if this message was delivered before.
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }

    /// How many times this message has been delivered, this one included.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Acknowledge and remove the message.
    pub async fn ack(self) -> MessagingResult<()> {
        self.acker.ack().await
    }

    /// Reject the message. With `requeue` it is delivered again later,
    /// otherwise it is discarded (or dead-lettered by the backend).
    pub async fn nack(self, requeue: bool) -> MessagingResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("delivery_count", &self.delivery_count)
            .finish_non_exhaustive()
    }
}
