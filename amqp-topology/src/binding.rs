use std::sync::{Arc, Mutex, Weak};

use lapin::options::{ExchangeBindOptions, ExchangeUnbindOptions, QueueBindOptions};
use lapin::types::FieldTable;
use tracing::{debug, error};

use crate::connection::{Connection, ConnectionInner, TopologyError};
use crate::exchange::Exchange;
use crate::latch::Latch;
use crate::node::{Destination, EntityKind};
use crate::topology::field_table_from_json;

/// A routing rule from a source exchange to a destination exchange or queue.
///
/// Bindings register themselves under a derived identity; declaring the same
/// (source, destination, pattern) again overwrites the registry entry.
#[derive(Clone)]
pub struct Binding {
    pub(crate) inner: Arc<BindingInner>,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding").field("id", &self.id()).finish()
    }
}

pub(crate) struct BindingInner {
    source: Exchange,
    destination: Destination,
    pattern: String,
    arguments: FieldTable,
    connection: Weak<ConnectionInner>,
    initialized: Mutex<Option<Latch>>,
}

impl Binding {
    pub(crate) fn derive_id(
        source: &str,
        destination_kind: EntityKind,
        destination: &str,
        pattern: &str,
    ) -> String {
        let via = match destination_kind {
            EntityKind::Queue => "Queue",
            _ => "Exchange",
        };
        format!("[{source}]to{via}[{destination}]{pattern}")
    }

    pub fn id(&self) -> String {
        Self::derive_id(
            self.inner.source.name(),
            self.inner.destination.kind(),
            self.inner.destination.name(),
            &self.inner.pattern,
        )
    }

    pub fn source(&self) -> &Exchange {
        &self.inner.source
    }

    pub fn destination(&self) -> &Destination {
        &self.inner.destination
    }

    pub fn pattern(&self) -> &str {
        &self.inner.pattern
    }

    pub(crate) fn declare(
        source: Exchange,
        destination: Destination,
        pattern: String,
        args: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Binding {
        let connection = source.node().connection.clone();
        let binding = Binding {
            inner: Arc::new(BindingInner {
                source,
                destination,
                pattern,
                arguments: args.as_ref().map(field_table_from_json).unwrap_or_default(),
                connection,
                initialized: Mutex::new(None),
            }),
        };
        if let Some(connection) = binding.inner.connection.upgrade() {
            connection.register_binding(binding.clone());
        }
        binding.reinitialize();
        binding
    }

    /// Resolves when the binding is established on the broker.
    pub async fn initialized(&self) -> Result<(), TopologyError> {
        match self.initialized_latch() {
            Some(latch) => latch.wait().await,
            None => Err(TopologyError::Closed {
                kind: EntityKind::Binding,
                name: self.id(),
            }),
        }
    }

    pub(crate) fn initialized_latch(&self) -> Option<Latch> {
        self.inner.initialized.lock().unwrap().clone()
    }

    /// Starts establishing the binding, chained on the destination readiness.
    pub(crate) fn reinitialize(&self) {
        let latch = Latch::new();
        *self.inner.initialized.lock().unwrap() = Some(latch.clone());
        let binding = self.clone();
        tokio::spawn(async move {
            match binding.establish().await {
                Ok(()) => latch.resolve(),
                Err(err) => {
                    error!("binding {} failed to initialize: {}", binding.id(), err);
                    if matches!(err, TopologyError::AssertionFailed { .. }) {
                        if let Some(connection) = binding.inner.connection.upgrade() {
                            connection.unregister_binding(&binding.id());
                        }
                    }
                    latch.reject(err);
                }
            }
        });
    }

    async fn establish(&self) -> Result<(), TopologyError> {
        let destination = &self.inner.destination;
        destination.node().ready().await?;
        let channel = destination.node().channel().await?;
        match destination {
            Destination::Queue(queue) => {
                channel
                    .queue_bind(
                        queue.name(),
                        self.inner.source.name(),
                        &self.inner.pattern,
                        QueueBindOptions::default(),
                        self.inner.arguments.clone(),
                    )
                    .await
            }
            Destination::Exchange(exchange) => {
                channel
                    .exchange_bind(
                        exchange.name(),
                        self.inner.source.name(),
                        &self.inner.pattern,
                        ExchangeBindOptions::default(),
                        self.inner.arguments.clone(),
                    )
                    .await
            }
        }
        .map_err(|source| TopologyError::AssertionFailed {
            kind: EntityKind::Binding,
            name: self.id(),
            source,
        })?;
        debug!("binding {} established", self.id());
        Ok(())
    }

    /// Unbinds on the broker and forgets the binding.
    pub async fn delete(&self) -> Result<(), TopologyError> {
        self.initialized().await?;
        let destination = &self.inner.destination;
        let channel = destination.node().channel().await?;
        match destination {
            Destination::Queue(queue) => {
                channel
                    .queue_unbind(
                        queue.name(),
                        self.inner.source.name(),
                        &self.inner.pattern,
                        self.inner.arguments.clone(),
                    )
                    .await?;
            }
            Destination::Exchange(exchange) => {
                channel
                    .exchange_unbind(
                        exchange.name(),
                        self.inner.source.name(),
                        &self.inner.pattern,
                        ExchangeUnbindOptions::default(),
                        self.inner.arguments.clone(),
                    )
                    .await?;
            }
        }
        if let Some(connection) = self.inner.connection.upgrade() {
            connection.unregister_binding(&self.id());
        }
        Ok(())
    }

    /// Looks a binding up by its derived identity and deletes it.
    pub(crate) async fn remove(
        source: &Exchange,
        destination: &Destination,
        pattern: &str,
    ) -> Result<(), TopologyError> {
        let id = Self::derive_id(source.name(), destination.kind(), destination.name(), pattern);
        let connection = source.node().connection()?;
        let binding = connection
            .binding(&id)
            .ok_or_else(|| TopologyError::BindingNotFound {
                binding_source: source.name().to_string(),
                destination: destination.name().to_string(),
                pattern: pattern.to_string(),
            })?;
        binding.delete().await
    }

    /// Deletes every registered binding that touches the named entity; keeps
    /// the registry consistent when an exchange or queue goes away.
    pub(crate) async fn remove_bindings_containing(
        connection: &Arc<ConnectionInner>,
        kind: EntityKind,
        name: &str,
    ) -> Result<(), TopologyError> {
        let affected: Vec<Binding> = {
            let registry = connection.registry.lock().unwrap();
            registry
                .bindings
                .values()
                .filter(|binding| binding.touches(kind, name))
                .cloned()
                .collect()
        };
        for binding in affected {
            binding.delete().await?;
        }
        Ok(())
    }

    fn touches(&self, kind: EntityKind, name: &str) -> bool {
        (kind == EntityKind::Exchange && self.inner.source.name() == name)
            || (self.inner.destination.kind() == kind && self.inner.destination.name() == name)
    }
}

impl Connection {
    /// Declares a binding between already-declared entities. The source must
    /// be an exchange; queues cannot route messages onward.
    pub fn declare_binding(
        &self,
        source: &Destination,
        destination: &Destination,
        pattern: impl Into<String>,
        args: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Binding, TopologyError> {
        match source {
            Destination::Exchange(exchange) => Ok(Binding::declare(
                exchange.clone(),
                destination.clone(),
                pattern.into(),
                args,
            )),
            Destination::Queue(queue) => {
                Err(TopologyError::InvalidBindingSource(queue.name().to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ReconnectStrategy;
    use crate::exchange::ExchangeOptions;
    use crate::queue::QueueOptions;
    use lapin::ExchangeKind;
    use std::time::Duration;

    #[test]
    fn identity_distinguishes_source_destination_kind_and_pattern() {
        let to_queue = Binding::derive_id("ex", EntityKind::Queue, "dst", "a.*");
        let to_exchange = Binding::derive_id("ex", EntityKind::Exchange, "dst", "a.*");
        let other_source = Binding::derive_id("ex2", EntityKind::Queue, "dst", "a.*");
        let other_pattern = Binding::derive_id("ex", EntityKind::Queue, "dst", "b.*");
        let other_destination = Binding::derive_id("ex", EntityKind::Queue, "dst2", "a.*");

        let ids = [
            &to_queue,
            &to_exchange,
            &other_source,
            &other_pattern,
            &other_destination,
        ];
        for (i, left) in ids.iter().enumerate() {
            for right in &ids[i + 1..] {
                assert_ne!(left, right);
            }
        }
        assert_eq!(to_queue, "[ex]toQueue[dst]a.*");
        assert_eq!(to_exchange, "[ex]toExchange[dst]a.*");
    }

    #[tokio::test]
    async fn rejects_a_queue_as_binding_source() {
        let connection = Connection::with_options(
            "amqp://127.0.0.1:1",
            Default::default(),
            ReconnectStrategy {
                retries: 1,
                interval: Duration::from_millis(5),
            },
        );
        let exchange =
            connection.declare_exchange("ex", ExchangeKind::Direct, ExchangeOptions::default());
        let queue = connection.declare_queue("q", QueueOptions::default());

        let err = connection
            .declare_binding(
                &Destination::Queue(queue),
                &Destination::Exchange(exchange),
                "key",
                None,
            )
            .unwrap_err();
        assert!(matches!(err, TopologyError::InvalidBindingSource(name) if name == "q"));
    }

    #[tokio::test]
    async fn registers_bindings_under_their_identity() {
        let connection = Connection::with_options(
            "amqp://127.0.0.1:1",
            Default::default(),
            ReconnectStrategy {
                retries: 1,
                interval: Duration::from_millis(5),
            },
        );
        let exchange =
            connection.declare_exchange("ex", ExchangeKind::Direct, ExchangeOptions::default());
        let queue = connection.declare_queue("q", QueueOptions::default());

        let binding = queue.bind(&exchange, "a.*", None);
        // Redeclaring the same edge overwrites the entry instead of doubling it.
        queue.bind(&exchange, "a.*", None);
        {
            let registry = connection.inner.registry.lock().unwrap();
            assert_eq!(registry.bindings.len(), 1);
            assert!(registry.bindings.contains_key(&binding.id()));
        }
        queue.bind(&exchange, "b.*", None);
        let registry = connection.inner.registry.lock().unwrap();
        assert_eq!(registry.bindings.len(), 2);
    }
}
