use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use lapin::Channel;
use tokio::sync::RwLock;

use crate::connection::{ConnectionInner, TopologyError};
use crate::exchange::Exchange;
use crate::latch::Latch;
use crate::queue::Queue;

/// Kinds of broker-facing entities, for errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Connection,
    Exchange,
    Queue,
    Binding,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Connection => "connection",
            EntityKind::Exchange => "exchange",
            EntityKind::Queue => "queue",
            EntityKind::Binding => "binding",
        };
        f.write_str(name)
    }
}

/// State shared by every channel-owning broker object.
///
/// The connection owns its nodes; a node only holds a weak back-reference.
/// The channel belongs exclusively to one node for the lifetime of a single
/// incarnation; rebuilds abandon it and install a fresh one.
pub(crate) struct NodeState {
    pub(crate) name: String,
    pub(crate) kind: EntityKind,
    pub(crate) connection: Weak<ConnectionInner>,
    channel: RwLock<Option<Channel>>,
    initialized: Mutex<Option<Latch>>,
    deleting: Mutex<Option<Latch>>,
    closing: Mutex<Option<Latch>>,
}

impl NodeState {
    pub(crate) fn new(connection: Weak<ConnectionInner>, name: String, kind: EntityKind) -> Self {
        Self {
            name,
            kind,
            connection,
            channel: RwLock::new(None),
            initialized: Mutex::new(None),
            deleting: Mutex::new(None),
            closing: Mutex::new(None),
        }
    }

    pub(crate) fn connection(&self) -> Result<Arc<ConnectionInner>, TopologyError> {
        self.connection.upgrade().ok_or_else(|| self.closed_error())
    }

    pub(crate) fn closed_error(&self) -> TopologyError {
        TopologyError::Closed {
            kind: self.kind,
            name: self.name.clone(),
        }
    }

    /// Wraps a broker error from this node's initialization; an assertion
    /// failure unregisters the entity so it can be declared afresh.
    pub(crate) fn assertion_error(&self, source: lapin::Error) -> TopologyError {
        TopologyError::AssertionFailed {
            kind: self.kind,
            name: self.name.clone(),
            source,
        }
    }

    /// Installs a fresh readiness latch for a new incarnation.
    pub(crate) fn arm(&self) -> Latch {
        let latch = Latch::new();
        *self.initialized.lock().unwrap() = Some(latch.clone());
        latch
    }

    pub(crate) fn initialized(&self) -> Option<Latch> {
        self.initialized.lock().unwrap().clone()
    }

    /// Awaits the current incarnation's readiness.
    pub(crate) async fn ready(&self) -> Result<(), TopologyError> {
        match self.initialized() {
            Some(latch) => latch.wait().await,
            None => Err(self.closed_error()),
        }
    }

    pub(crate) async fn set_channel(&self, channel: Channel) {
        *self.channel.write().await = Some(channel);
    }

    pub(crate) async fn channel(&self) -> Result<Channel, TopologyError> {
        self.channel
            .read()
            .await
            .clone()
            .ok_or_else(|| self.closed_error())
    }

    /// Clears the channel and readiness; later work observes `Closed`.
    /// In-flight waiters hold a clone of the old latch and see it settle.
    pub(crate) async fn teardown(&self) {
        *self.channel.write().await = None;
        *self.initialized.lock().unwrap() = None;
    }

    /// Claims the `deleting` latch. `Ok` carries the latch the first caller
    /// must settle, `Err` the one every later caller awaits.
    pub(crate) fn claim_deleting(&self) -> Result<Latch, Latch> {
        Self::claim(&self.deleting)
    }

    pub(crate) fn claim_closing(&self) -> Result<Latch, Latch> {
        Self::claim(&self.closing)
    }

    fn claim(slot: &Mutex<Option<Latch>>) -> Result<Latch, Latch> {
        let mut guard = slot.lock().unwrap();
        match &*guard {
            Some(latch) => Err(latch.clone()),
            None => {
                let latch = Latch::new();
                *guard = Some(latch.clone());
                Ok(latch)
            }
        }
    }
}

/// A publishable endpoint: an exchange or a queue.
#[derive(Clone)]
pub enum Destination {
    Exchange(Exchange),
    Queue(Queue),
}

impl Destination {
    pub fn name(&self) -> &str {
        match self {
            Destination::Exchange(exchange) => exchange.name(),
            Destination::Queue(queue) => queue.name(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Destination::Exchange(_) => EntityKind::Exchange,
            Destination::Queue(_) => EntityKind::Queue,
        }
    }

    pub(crate) fn node(&self) -> &NodeState {
        match self {
            Destination::Exchange(exchange) => exchange.node(),
            Destination::Queue(queue) => queue.node(),
        }
    }
}

impl From<Exchange> for Destination {
    fn from(exchange: Exchange) -> Self {
        Destination::Exchange(exchange)
    }
}

impl From<Queue> for Destination {
    fn from(queue: Queue) -> Self {
        Destination::Queue(queue)
    }
}

impl From<&Exchange> for Destination {
    fn from(exchange: &Exchange) -> Self {
        Destination::Exchange(exchange.clone())
    }
}

impl From<&Queue> for Destination {
    fn from(queue: &Queue) -> Self {
        Destination::Queue(queue.clone())
    }
}
