use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use backoff::backoff::Constant;
use backoff::Error as BackoffError;
use lapin::{Channel, ConnectionProperties, ExchangeKind};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::binding::Binding;
use crate::exchange::{Exchange, ExchangeOptions};
use crate::latch::Latch;
use crate::node::EntityKind;
use crate::queue::{Queue, QueueOptions};

/// Errors surfaced by the topology manager.
///
/// The enum is `Clone` so one failure can be broadcast through a readiness
/// latch to every waiter.
#[derive(Debug, Clone, Error)]
pub enum TopologyError {
    /// A broker-side operation failed outside a more specific phase.
    #[error("broker operation failed: {0}")]
    Broker(#[from] lapin::Error),
    /// A single connect attempt failed; the retry loop decides what follows.
    #[error("connection attempt failed: {0}")]
    ConnectionFailed(lapin::Error),
    /// The reconnect budget is spent.
    #[error("connection retries exhausted after {attempts} attempts")]
    ConnectionExhausted { attempts: u32 },
    /// The broker rejected an entity declaration.
    #[error("broker rejected {kind} \"{name}\": {source}")]
    AssertionFailed {
        kind: EntityKind,
        name: String,
        source: lapin::Error,
    },
    #[error("publish failed: {0}")]
    PublishFailed(lapin::Error),
    /// A declarative binding names neither a queue nor an exchange.
    #[error("binding from \"{0}\" must name a queue or an exchange destination")]
    InvalidBinding(String),
    /// A binding was given a non-exchange source.
    #[error("binding source \"{0}\" is not an exchange")]
    InvalidBindingSource(String),
    #[error("no binding from \"{binding_source}\" to \"{destination}\" with pattern \"{pattern}\"")]
    BindingNotFound {
        binding_source: String,
        destination: String,
        pattern: String,
    },
    /// A consumer callback failed; the delivery stays unsettled.
    #[error("consumer callback failed: {0}")]
    ConsumerFailed(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
    /// The entity (or its connection) has been torn down.
    #[error("{kind} \"{name}\" is closed")]
    Closed { kind: EntityKind, name: String },
    /// The pending reply slot was dropped by a rebuild before a response
    /// arrived.
    #[error("rpc interrupted before a response arrived")]
    RpcInterrupted,
}

impl From<serde_json::Error> for TopologyError {
    fn from(err: serde_json::Error) -> Self {
        TopologyError::Serialization(err.to_string())
    }
}

/// Default broker address.
pub const DEFAULT_URL: &str = "amqp://localhost:5672";

/// Retry policy for (re)connecting to the broker.
///
/// `retries == 0` retries forever; `retries == n` allows `n + 1` connect
/// attempts spaced by `interval`.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectStrategy {
    pub retries: u32,
    pub interval: Duration,
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self {
            retries: 0,
            interval: Duration::from_millis(1500),
        }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) exchanges: HashMap<String, Exchange>,
    pub(crate) queues: HashMap<String, Queue>,
    pub(crate) bindings: HashMap<String, Binding>,
}

struct ConnectionEvent {
    generation: u64,
    error: lapin::Error,
}

pub(crate) struct ConnectionInner {
    url: String,
    properties: ConnectionProperties,
    reconnect: ReconnectStrategy,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) amqp: RwLock<Option<lapin::Connection>>,
    initialized: Mutex<Latch>,
    rebuilding: Mutex<bool>,
    is_closing: AtomicBool,
    generation: AtomicU64,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionInner {
    pub(crate) fn current_initialized(&self) -> Latch {
        self.initialized.lock().unwrap().clone()
    }

    /// Starts (or joins) a connect attempt. Returns the latch for the attempt
    /// and whether this call started it; concurrent triggers collapse into
    /// the in-flight attempt.
    pub(crate) fn rebuild_connection(inner: &Arc<ConnectionInner>) -> (Latch, bool) {
        {
            let mut rebuilding = inner.rebuilding.lock().unwrap();
            if *rebuilding {
                return (inner.current_initialized(), false);
            }
            *rebuilding = true;
        }
        let latch = Latch::new();
        *inner.initialized.lock().unwrap() = latch.clone();
        let inner = Arc::clone(inner);
        let attempt = latch.clone();
        tokio::spawn(async move {
            match inner.try_to_connect().await {
                Ok(connection) => {
                    inner.install_error_handler(&connection);
                    *inner.amqp.write().await = Some(connection);
                    *inner.rebuilding.lock().unwrap() = false;
                    info!(
                        "connected to {}",
                        inner.url.split('@').last().unwrap_or_default()
                    );
                    attempt.resolve();
                }
                Err(err) => {
                    *inner.rebuilding.lock().unwrap() = false;
                    error!("giving up on the broker: {}", err);
                    attempt.reject(err);
                }
            }
        });
        (latch, true)
    }

    async fn try_to_connect(&self) -> Result<lapin::Connection, TopologyError> {
        let strategy = self.reconnect;
        let attempts = AtomicU32::new(0);
        backoff::future::retry(Constant::new(strategy.interval), || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let url = self.url.clone();
            let properties = self.properties.clone();
            async move {
                debug!(
                    "connect attempt {} to {}",
                    attempt,
                    url.split('@').last().unwrap_or_default()
                );
                lapin::Connection::connect(&url, properties)
                    .await
                    .map_err(|err| {
                        warn!("connect attempt {} failed: {}", attempt, err);
                        if strategy.retries != 0 && attempt > strategy.retries {
                            BackoffError::permanent(TopologyError::ConnectionExhausted {
                                attempts: attempt,
                            })
                        } else {
                            BackoffError::transient(TopologyError::ConnectionFailed(err))
                        }
                    })
            }
        })
        .await
    }

    /// Stamps the handler with this incarnation's generation so an error from
    /// a superseded connection can never trigger a rebuild.
    fn install_error_handler(&self, connection: &lapin::Connection) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let events = self.events.clone();
        connection.on_error(move |error| {
            let _ = events.send(ConnectionEvent { generation, error });
        });
    }

    pub(crate) async fn create_channel(&self) -> Result<Channel, TopologyError> {
        let guard = self.amqp.read().await;
        let connection = guard.as_ref().ok_or_else(|| TopologyError::Closed {
            kind: EntityKind::Connection,
            name: self.url.clone(),
        })?;
        Ok(connection.create_channel().await?)
    }

    pub(crate) fn unregister_exchange(&self, name: &str) {
        self.registry.lock().unwrap().exchanges.remove(name);
    }

    pub(crate) fn unregister_queue(&self, name: &str) {
        self.registry.lock().unwrap().queues.remove(name);
    }

    pub(crate) fn register_binding(&self, binding: Binding) {
        self.registry
            .lock()
            .unwrap()
            .bindings
            .insert(binding.id(), binding);
    }

    pub(crate) fn unregister_binding(&self, id: &str) {
        self.registry.lock().unwrap().bindings.remove(id);
    }

    pub(crate) fn binding(&self, id: &str) -> Option<Binding> {
        self.registry.lock().unwrap().bindings.get(id).cloned()
    }

    /// Reconnects and re-asserts every registered entity, consumer, and
    /// binding, in that dependency order.
    pub(crate) async fn rebuild_all(
        inner: &Arc<ConnectionInner>,
        cause: &TopologyError,
    ) -> Result<(), TopologyError> {
        warn!("rebuilding topology after: {}", cause);
        let (latch, started) = Self::rebuild_connection(inner);
        if started {
            let (exchanges, queues, bindings) = {
                let registry = inner.registry.lock().unwrap();
                (
                    registry.exchanges.values().cloned().collect::<Vec<_>>(),
                    registry.queues.values().cloned().collect::<Vec<_>>(),
                    registry.bindings.values().cloned().collect::<Vec<_>>(),
                )
            };
            for exchange in &exchanges {
                exchange.reinitialize();
            }
            for queue in &queues {
                queue.reinitialize();
                queue.reinitialize_consumer();
            }
            for binding in &bindings {
                binding.reinitialize();
            }
        }
        latch.wait().await?;
        inner.complete_configuration().await
    }

    /// Resolves when every registered entity and active consumer is asserted.
    pub(crate) async fn complete_configuration(&self) -> Result<(), TopologyError> {
        let mut latches: Vec<Latch> = Vec::new();
        {
            let registry = self.registry.lock().unwrap();
            for exchange in registry.exchanges.values() {
                latches.extend(exchange.initialized_latch());
            }
            for queue in registry.queues.values() {
                latches.extend(queue.initialized_latch());
                latches.extend(queue.consumer_latch());
            }
            for binding in registry.bindings.values() {
                latches.extend(binding.initialized_latch());
            }
        }
        for latch in latches {
            latch.wait().await?;
        }
        Ok(())
    }
}

/// Handle to one logical broker connection and the topology declared on it.
///
/// Cheap to clone; all clones share the same registry and supervisor. Must be
/// created inside a tokio runtime: declaration and recovery run on spawned
/// tasks.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connects to `url` with default socket options and an unbounded
    /// reconnect strategy.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_options(
            url,
            ConnectionProperties::default(),
            ReconnectStrategy::default(),
        )
    }

    pub fn with_options(
        url: impl Into<String>,
        properties: ConnectionProperties,
        reconnect: ReconnectStrategy,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnectionInner {
            url: url.into(),
            properties,
            reconnect,
            registry: Mutex::new(Registry::default()),
            amqp: RwLock::new(None),
            initialized: Mutex::new(Latch::new()),
            rebuilding: Mutex::new(false),
            is_closing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            events: events_tx,
        });
        Self::spawn_supervisor(Arc::downgrade(&inner), events_rx);
        let connection = Self { inner };
        ConnectionInner::rebuild_connection(&connection.inner);
        connection
    }

    /// Drains connection errors reported by the broker client and routes them
    /// into the rebuild flow. Solicited closes never rebuild.
    fn spawn_supervisor(
        inner: Weak<ConnectionInner>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = inner.upgrade() else { break };
                if inner.generation.load(Ordering::SeqCst) != event.generation {
                    debug!(
                        "ignoring error from a superseded connection: {}",
                        event.error
                    );
                    continue;
                }
                if inner.is_closing.load(Ordering::SeqCst) {
                    debug!("connection closing, ignoring broker error: {}", event.error);
                    continue;
                }
                error!("broker connection lost: {}", event.error);
                let cause = TopologyError::ConnectionFailed(event.error);
                if let Err(err) = ConnectionInner::rebuild_all(&inner, &cause).await {
                    error!("topology rebuild failed: {}", err);
                }
            }
        });
    }

    /// Resolves when the current connection attempt settles.
    pub async fn initialized(&self) -> Result<(), TopologyError> {
        self.inner.current_initialized().wait().await
    }

    pub async fn is_connected(&self) -> bool {
        let guard = self.inner.amqp.read().await;
        guard
            .as_ref()
            .map(|connection| connection.status().connected())
            .unwrap_or(false)
    }

    /// Declares an exchange. Redeclaring a name returns the already-registered
    /// exchange; the first declaration's kind and options win.
    pub fn declare_exchange(
        &self,
        name: impl Into<String>,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Exchange {
        let name = name.into();
        let mut registry = self.inner.registry.lock().unwrap();
        if let Some(existing) = registry.exchanges.get(&name) {
            return existing.clone();
        }
        let exchange = Exchange::register(Arc::downgrade(&self.inner), name.clone(), kind, options);
        registry.exchanges.insert(name, exchange.clone());
        drop(registry);
        exchange.reinitialize();
        exchange
    }

    /// Declares a queue. Redeclaring a name returns the already-registered
    /// queue; the first declaration's options win.
    pub fn declare_queue(&self, name: impl Into<String>, options: QueueOptions) -> Queue {
        let name = name.into();
        let mut registry = self.inner.registry.lock().unwrap();
        if let Some(existing) = registry.queues.get(&name) {
            return existing.clone();
        }
        let queue = Queue::register(Arc::downgrade(&self.inner), name.clone(), options);
        registry.queues.insert(name, queue.clone());
        drop(registry);
        queue.reinitialize();
        queue
    }

    pub fn exchange(&self, name: &str) -> Option<Exchange> {
        self.inner.registry.lock().unwrap().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<Queue> {
        self.inner.registry.lock().unwrap().queues.get(name).cloned()
    }

    /// Reconnects and re-asserts the whole declared topology.
    pub async fn rebuild_all(&self, cause: &TopologyError) -> Result<(), TopologyError> {
        ConnectionInner::rebuild_all(&self.inner, cause).await
    }

    /// Resolves when every registered entity and active consumer is asserted.
    pub async fn complete_configuration(&self) -> Result<(), TopologyError> {
        self.inner.complete_configuration().await
    }

    /// Flags the connection as closing, awaits the in-flight readiness, and
    /// closes the broker connection. After this the supervisor treats any
    /// close from the broker as solicited; only an explicit close is
    /// terminal.
    pub async fn close(&self) -> Result<(), TopologyError> {
        self.inner.is_closing.store(true, Ordering::SeqCst);
        let _ = self.inner.current_initialized().wait().await;
        let mut guard = self.inner.amqp.write().await;
        if let Some(connection) = guard.take() {
            connection.close(0, "closed by client").await?;
        }
        Ok(())
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new(DEFAULT_URL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const DEAD_URL: &str = "amqp://127.0.0.1:1";

    fn dead_connection() -> Connection {
        Connection::with_options(
            DEAD_URL,
            ConnectionProperties::default(),
            ReconnectStrategy {
                retries: 1,
                interval: Duration::from_millis(5),
            },
        )
    }

    #[tokio::test]
    async fn exhausts_bounded_retries() {
        let connection = Connection::with_options(
            DEAD_URL,
            ConnectionProperties::default(),
            ReconnectStrategy {
                retries: 2,
                interval: Duration::from_millis(10),
            },
        );
        let started = Instant::now();
        let err = connection.initialized().await.unwrap_err();
        match err {
            TopologyError::ConnectionExhausted { attempts } => assert_eq!(attempts, 3),
            other => panic!("expected ConnectionExhausted, got {other}"),
        }
        // Two retry sleeps between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn declaration_is_idempotent() {
        let connection = dead_connection();
        let first =
            connection.declare_exchange("orders", ExchangeKind::Direct, ExchangeOptions::default());
        let second =
            connection.declare_exchange("orders", ExchangeKind::Fanout, ExchangeOptions::default());
        assert!(Arc::ptr_eq(&first.inner, &second.inner));
        assert_eq!(second.kind(), &ExchangeKind::Direct);

        let q1 = connection.declare_queue("tasks", QueueOptions::default());
        let q2 = connection.declare_queue("tasks", QueueOptions::default());
        assert!(Arc::ptr_eq(&q1.inner, &q2.inner));
    }

    #[tokio::test]
    async fn registers_at_most_one_entity_per_name() {
        let connection = dead_connection();
        for _ in 0..3 {
            connection.declare_exchange("ex", ExchangeKind::Direct, ExchangeOptions::default());
            connection.declare_queue("q", QueueOptions::default());
        }
        let registry = connection.inner.registry.lock().unwrap();
        assert_eq!(registry.exchanges.len(), 1);
        assert_eq!(registry.queues.len(), 1);
    }

    #[tokio::test]
    async fn lookups_return_the_registered_entity() {
        let connection = dead_connection();
        let exchange =
            connection.declare_exchange("ex", ExchangeKind::Topic, ExchangeOptions::default());
        let queue = connection.declare_queue("q", QueueOptions::default());
        assert!(Arc::ptr_eq(&connection.exchange("ex").unwrap().inner, &exchange.inner));
        assert!(Arc::ptr_eq(&connection.queue("q").unwrap().inner, &queue.inner));
        assert!(connection.exchange("missing").is_none());
    }
}
