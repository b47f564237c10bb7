use lapin::types::{AMQPValue, FieldTable};
use lapin::ExchangeKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::connection::{Connection, TopologyError};
use crate::exchange::ExchangeOptions;
use crate::queue::QueueOptions;

/// Declarative description of a full topology.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopologyDefinition {
    pub exchanges: Vec<ExchangeDefinition>,
    pub queues: Vec<QueueDefinition>,
    pub bindings: Vec<BindingDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeDefinition {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub options: ExchangeOptions,
}

impl ExchangeDefinition {
    pub(crate) fn exchange_kind(&self) -> ExchangeKind {
        match self.kind.as_deref() {
            None | Some("direct") => ExchangeKind::Direct,
            Some("fanout") => ExchangeKind::Fanout,
            Some("topic") => ExchangeKind::Topic,
            Some("headers") => ExchangeKind::Headers,
            Some(custom) => ExchangeKind::Custom(custom.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDefinition {
    pub name: String,
    #[serde(default)]
    pub options: QueueOptions,
}

/// A declarative binding; exactly one of `queue` / `exchange` names the
/// destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingDefinition {
    pub source: String,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub args: Option<Map<String, Value>>,
}

impl Connection {
    /// Declares every exchange, queue, and binding in `topology` and resolves
    /// when all of them are asserted. Binding endpoints that are not in the
    /// lists are declared with default options; declaration is idempotent, so
    /// list order does not matter.
    pub async fn declare_topology(&self, topology: &TopologyDefinition) -> Result<(), TopologyError> {
        for exchange in &topology.exchanges {
            self.declare_exchange(&exchange.name, exchange.exchange_kind(), exchange.options.clone());
        }
        for queue in &topology.queues {
            self.declare_queue(&queue.name, queue.options.clone());
        }
        for binding in &topology.bindings {
            let source =
                self.declare_exchange(&binding.source, ExchangeKind::Direct, ExchangeOptions::default());
            let pattern = binding.pattern.clone().unwrap_or_default();
            match (&binding.queue, &binding.exchange) {
                (Some(queue), _) => {
                    let destination = self.declare_queue(queue, QueueOptions::default());
                    destination.bind(&source, pattern, binding.args.clone());
                }
                (None, Some(exchange)) => {
                    let destination =
                        self.declare_exchange(exchange, ExchangeKind::Direct, ExchangeOptions::default());
                    destination.bind(&source, pattern, binding.args.clone());
                }
                (None, None) => {
                    return Err(TopologyError::InvalidBinding(binding.source.clone()));
                }
            }
        }
        self.complete_configuration().await
    }

    /// Deletes every registered binding, then queues (stopping their
    /// consumers), then exchanges, in the order the broker's referential
    /// constraints demand.
    pub async fn delete_configuration(&self) -> Result<(), TopologyError> {
        let bindings: Vec<_> = {
            let registry = self.inner.registry.lock().unwrap();
            registry.bindings.values().cloned().collect()
        };
        for binding in bindings {
            binding.delete().await?;
        }
        let queues: Vec<_> = {
            let registry = self.inner.registry.lock().unwrap();
            registry.queues.values().cloned().collect()
        };
        for queue in queues {
            queue.stop_consumer().await?;
            queue.delete().await?;
        }
        let exchanges: Vec<_> = {
            let registry = self.inner.registry.lock().unwrap();
            registry.exchanges.values().cloned().collect()
        };
        for exchange in exchanges {
            exchange.delete().await?;
        }
        Ok(())
    }
}

/// Converts a JSON object into a broker field table. Scalars map onto their
/// AMQP counterparts; nested shapes are skipped with a warning.
pub(crate) fn field_table_from_json(map: &Map<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in map {
        let value = match value {
            Value::Bool(flag) => AMQPValue::Boolean(*flag),
            Value::Number(number) => match number.as_i64() {
                Some(int) => AMQPValue::LongLongInt(int),
                None => AMQPValue::Double(number.as_f64().unwrap_or_default()),
            },
            Value::String(text) => AMQPValue::LongString(text.as_str().into()),
            Value::Null => AMQPValue::Void,
            other => {
                warn!("skipping unsupported field-table value for \"{}\": {}", key, other);
                continue;
            }
        };
        table.insert(key.as_str().into(), value);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ReconnectStrategy;
    use lapin::types::ShortString;
    use std::time::Duration;

    #[test]
    fn deserializes_a_topology_document() {
        let definition: TopologyDefinition = serde_json::from_value(serde_json::json!({
            "exchanges": [{"name": "ex", "type": "topic", "options": {"durable": true}}],
            "queues": [{"name": "q", "options": {"prefetch": 10, "messageTtl": 5000}}],
            "bindings": [{"source": "ex", "queue": "q", "pattern": "a.*"}],
        }))
        .unwrap();

        assert_eq!(definition.exchanges[0].exchange_kind(), ExchangeKind::Topic);
        assert!(definition.exchanges[0].options.durable);
        assert_eq!(definition.queues[0].options.prefetch, Some(10));
        assert_eq!(definition.queues[0].options.message_ttl, Some(5000));
        assert_eq!(definition.bindings[0].pattern.as_deref(), Some("a.*"));
    }

    #[test]
    fn unknown_exchange_kinds_pass_through() {
        let definition: ExchangeDefinition = serde_json::from_value(serde_json::json!({
            "name": "ex", "type": "x-delayed-message",
        }))
        .unwrap();
        assert_eq!(
            definition.exchange_kind(),
            ExchangeKind::Custom("x-delayed-message".to_string())
        );
    }

    #[test]
    fn converts_json_arguments_to_a_field_table() {
        let map = serde_json::json!({
            "x-match": "all",
            "priority": 7,
            "weight": 0.5,
            "loose": false,
        })
        .as_object()
        .cloned()
        .unwrap();
        let table = field_table_from_json(&map);
        let inner = table.inner();
        assert_eq!(
            inner.get(&ShortString::from("x-match")),
            Some(&AMQPValue::LongString("all".into()))
        );
        assert_eq!(
            inner.get(&ShortString::from("priority")),
            Some(&AMQPValue::LongLongInt(7))
        );
        assert_eq!(
            inner.get(&ShortString::from("weight")),
            Some(&AMQPValue::Double(0.5))
        );
        assert_eq!(
            inner.get(&ShortString::from("loose")),
            Some(&AMQPValue::Boolean(false))
        );
    }

    #[tokio::test]
    async fn rejects_bindings_without_a_destination() {
        let connection = Connection::with_options(
            "amqp://127.0.0.1:1",
            Default::default(),
            ReconnectStrategy {
                retries: 1,
                interval: Duration::from_millis(5),
            },
        );
        let topology: TopologyDefinition = serde_json::from_value(serde_json::json!({
            "bindings": [{"source": "ex", "pattern": ""}],
        }))
        .unwrap();
        let err = connection.declare_topology(&topology).await.unwrap_err();
        assert!(matches!(err, TopologyError::InvalidBinding(source) if source == "ex"));
    }
}

#[cfg(test)]
mod broker_tests {
    use super::*;
    use crate::message::Message;
    use crate::test::setup::TestSetup;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn sample_topology() -> TopologyDefinition {
        serde_json::from_value(serde_json::json!({
            "exchanges": [{"name": "topology.sample.ex", "type": "topic"}],
            "queues": [{"name": "topology.sample.q"}],
            "bindings": [{"source": "topology.sample.ex", "queue": "topology.sample.q", "pattern": "a.*"}],
        }))
        .unwrap()
    }

    #[test]
    #[ignore = "requires a running RabbitMQ broker"]
    fn declares_and_deletes_a_topology() {
        let setup = TestSetup::new();
        setup.rt.block_on(async {
            setup
                .connection
                .declare_topology(&sample_topology())
                .await
                .expect("topology should assert");
            setup
                .connection
                .delete_configuration()
                .await
                .expect("deletion should succeed");
            let registry = setup.connection.inner.registry.lock().unwrap();
            assert!(registry.bindings.is_empty());
            assert!(registry.queues.is_empty());
            assert!(registry.exchanges.is_empty());
        });
    }

    #[test]
    #[ignore = "requires a running RabbitMQ broker"]
    fn rebuilds_after_connection_loss() {
        let setup = TestSetup::new();
        setup.rt.block_on(async {
            setup
                .connection
                .declare_topology(&sample_topology())
                .await
                .expect("topology should assert");

            let queue = setup.connection.queue("topology.sample.q").unwrap();
            let (tx, rx) = tokio::sync::oneshot::channel::<String>();
            let slot = Arc::new(Mutex::new(Some(tx)));
            queue
                .activate_consumer(
                    move |message| {
                        let slot = slot.clone();
                        async move {
                            message.ack(false).await.ok();
                            if let Some(tx) = slot.lock().unwrap().take() {
                                let _ = tx.send(message.text_content().unwrap_or_default());
                            }
                            Ok(None)
                        }
                    },
                    Default::default(),
                )
                .await
                .expect("consumer should start");

            // Kill the broker connection out from under the topology.
            {
                let guard = setup.connection.inner.amqp.read().await;
                guard
                    .as_ref()
                    .unwrap()
                    .close(320, "simulated outage")
                    .await
                    .expect("close should succeed");
            }
            tokio::time::sleep(Duration::from_millis(200)).await;

            // Publishing still lands on the queue once the rebuild is done.
            let exchange = setup.connection.exchange("topology.sample.ex").unwrap();
            exchange
                .send(&Message::text("after outage"), "a.b")
                .await
                .expect("publish should survive the outage");
            let body = tokio::time::timeout(Duration::from_secs(10), rx)
                .await
                .expect("timed out waiting for the delivery")
                .expect("reply slot dropped");
            assert_eq!(body, "after outage");
        });
    }
}
