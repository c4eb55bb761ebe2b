//! Self-healing broker connection.
//!
//! A [`ConnectionManager`] owns at most one live connection per role
//! (publisher or consumer). Every successful connect re-declares the role's
//! queues. When the connection reports an error or closes, the supervisor
//! drops it and retries after a fixed delay, forever, until shut down.

use crate::broker::{Broker, BrokerConnection, ConnectionEvent, QueueDeclaration};
use crate::error::{MessagingError, MessagingResult};
use inkflow_config::BrokerConfig;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// Connection state of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live connection.
    Disconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// A live connection with all queues declared.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Supervisor timing.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Fixed delay before every reconnect attempt.
    pub reconnect_delay: Duration,
    /// Upper bound of one connect attempt, queue declarations included.
    pub connect_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&BrokerConfig> for SupervisorConfig {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            reconnect_delay: config.reconnect_delay(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// Supervised broker connection for one role.
pub struct ConnectionManager {
    role: String,
    broker: Arc<dyn Broker>,
    config: SupervisorConfig,
    declarations: Vec<QueueDeclaration>,
    current: RwLock<Option<Arc<dyn BrokerConnection>>>,
    connect_lock: Mutex<()>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    connects: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager. Nothing connects until [`ensure_connected`](Self::ensure_connected)
    /// or [`spawn`](Self::spawn) is called.
    pub fn new(role: impl Into<String>, broker: Arc<dyn Broker>, config: SupervisorConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            role: role.into(),
            broker,
            config,
            declarations: Vec::new(),
            current: RwLock::new(None),
            connect_lock: Mutex::new(()),
            state,
            shutdown,
            connects: AtomicU64::new(0),
        }
    }

    /// Declare `declaration` on every fresh connection.
    #[must_use]
    pub fn with_queue(mut self, declaration: QueueDeclaration) -> Self {
        self.declarations.push(declaration);
        self
    }

    /// Role name used in logs.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Queues declared on connect.
    pub fn declarations(&self) -> &[QueueDeclaration] {
        &self.declarations
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// The live connection, if any. Never blocks.
    pub fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.current
            .read()
            .as_ref()
            .filter(|connection| connection.is_open())
            .cloned()
    }

    /// Wait until a live connection exists, connecting as needed and
    /// retrying after the reconnect delay on failure.
    pub async fn ensure_connected(&self) -> Arc<dyn BrokerConnection> {
        loop {
            if let Some(connection) = self.current() {
                return connection;
            }

            match self.connect_once().await {
                Ok(connection) => return connection,
                Err(e) => {
                    warn!(
                        role = %self.role,
                        broker = self.broker.name(),
                        error = %e,
                        retry_in = ?self.config.reconnect_delay,
                        "Broker connection attempt failed"
                    );
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
    }

    /// One connect attempt bounded by the connect timeout.
    ///
    /// Concurrent callers share a single attempt.
    pub async fn connect_once(&self) -> MessagingResult<Arc<dyn BrokerConnection>> {
        let _guard = self.connect_lock.lock().await;
        if let Some(connection) = self.current() {
            return Ok(connection);
        }

        self.set_state(ConnectionState::Connecting);
        let timeout = self.config.connect_timeout;
        let result = tokio::time::timeout(timeout, self.establish())
            .await
            .unwrap_or(Err(MessagingError::Timeout(timeout)));

        match result {
            Ok(connection) => {
                *self.current.write() = Some(Arc::clone(&connection));
                self.connects.fetch_add(1, Ordering::SeqCst);
                self.set_state(ConnectionState::Connected);
                info!(
                    role = %self.role,
                    broker = self.broker.name(),
                    queues = self.declarations.len(),
                    "Connected to message broker"
                );
                Ok(connection)
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> MessagingResult<Arc<dyn BrokerConnection>> {
        let connection = self.broker.connect().await?;
        for declaration in &self.declarations {
            if let Err(e) = connection.declare_queue(declaration).await {
                connection.close().await;
                return Err(e);
            }
            debug!(role = %self.role, queue = %declaration.name, durable = declaration.durable, "Queue declared");
        }
        Ok(connection)
    }

    /// Run the supervisor on a background task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let span = info_span!("connection_supervisor", role = %self.role);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.supervise().await }.instrument(span))
    }

    /// Keep a connection alive until [`shutdown`](Self::shutdown).
    pub async fn supervise(&self) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let connection = tokio::select! {
                connection = self.ensure_connected() => connection,
                _ = shutdown.changed() => break,
            };

            // Subscribe before checking liveness so a close in between is seen.
            let mut events = connection.events();
            if connection.is_open() {
                tokio::select! {
                    _ = wait_for_close(&mut events) => {}
                    _ = shutdown.changed() => break,
                }
            }

            if self.mark_disconnected(&connection) {
                warn!(
                    role = %self.role,
                    retry_in = ?self.config.reconnect_delay,
                    "Broker connection closed, reconnecting"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        let connection = self.current.write().take();
        if let Some(connection) = connection {
            connection.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
        info!(role = %self.role, "Connection supervisor stopped");
    }

    /// Stop supervising and close the connection.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Returns `true` once shutdown was requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Clears `connection` if it is still current. Returns whether it was.
    fn mark_disconnected(&self, connection: &Arc<dyn BrokerConnection>) -> bool {
        let cleared = {
            let mut current = self.current.write();
            let is_current = current
                .as_ref()
                .is_some_and(|c| Arc::as_ptr(c).cast::<()>() == Arc::as_ptr(connection).cast::<()>());
            if is_current {
                *current = None;
            }
            is_current
        };
        if cleared {
            self.set_state(ConnectionState::Disconnected);
        }
        cleared
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(role = %self.role, from = %previous, to = %state, "Connection state changed");
        }
    }
}

async fn wait_for_close(events: &mut broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Error(reason)) => warn!(reason = %reason, "Broker connection error"),
            Ok(ConnectionEvent::Closed) | Err(RecvError::Closed) => return,
            Err(RecvError::Lagged(_)) => continue,
        }
    }
}
