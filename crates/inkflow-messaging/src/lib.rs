//! Inkflow Messaging - durable message channel and connection supervision
//!
//! A point-to-point, at-least-once message channel with:
//! - Durable queue declarations that survive broker restarts
//! - Persistent publishes
//! - Manual acknowledgement with `ack` / `nack(requeue)`
//! - Prefetch-bounded subscriptions (competing consumers)
//! - A connection supervisor that heals dropped connections with a fixed
//!   reconnect delay and re-declares the role's queues on every connect
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌─────────────────────┐     ┌──────────────┐
//! │  Publisher   │     │   Broker backend    │     │   Consumer   │
//! │              │     │  (Redis / memory)   │     │              │
//! │ Connection   │────▶│  queue ──▶ inflight │────▶│ Connection   │
//! │ Manager      │     │    ▲          │     │     │ Manager      │
//! └──────────────┘     │    └─ requeue ┘     │     └──────────────┘
//!                      │         dead-letter │
//!                      └─────────────────────┘
//! ```

pub mod broker;
pub mod error;
pub mod memory;
pub mod redis;
pub mod supervisor;

pub use broker::{
    Acker, Broker, BrokerConnection, ConnectionEvent, Delivery, PublishOptions, QueueDeclaration,
    Subscription,
};
pub use error::{MessagingError, MessagingResult};
pub use memory::InMemoryBroker;
pub use crate::redis::{RedisBroker, RedisBrokerConfig};
pub use supervisor::{ConnectionManager, ConnectionState, SupervisorConfig};

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::broker::{Broker, BrokerConnection, Subscription};
    pub use crate::supervisor::{ConnectionManager, ConnectionState};
    pub use crate::{MessagingError, MessagingResult};
}
