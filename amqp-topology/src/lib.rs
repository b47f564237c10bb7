//! Declare a RabbitMQ topology once and keep it alive.
//!
//! A [`Connection`] supervises one logical broker connection. Exchanges,
//! queues, and bindings declared through it are registered locally, asserted
//! against the broker in the background, and re-asserted automatically
//! whenever the connection is lost and later recovered. Publishing and
//! consuming go through [`Exchange`] and [`Queue`] handles; request/response
//! flows ride the broker's direct-reply-to pseudo queue.

pub mod binding;
pub mod connection;
mod emitter;
pub mod exchange;
mod latch;
pub mod message;
pub mod node;
pub mod queue;
pub mod topology;

#[cfg(test)]
mod test;

pub use binding::Binding;
pub use connection::{Connection, ReconnectStrategy, TopologyError, DEFAULT_URL};
pub use exchange::{Exchange, ExchangeOptions};
pub use message::{DeliveryFields, Message};
pub use node::{Destination, EntityKind};
pub use queue::{ConsumerOutcome, Queue, QueueOptions};
pub use topology::{BindingDefinition, ExchangeDefinition, QueueDefinition, TopologyDefinition};

pub use lapin;
