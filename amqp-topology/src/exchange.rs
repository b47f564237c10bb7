use std::sync::{Arc, Weak};

use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::binding::Binding;
use crate::connection::{ConnectionInner, TopologyError};
use crate::emitter::ReplyEmitter;
use crate::latch::Latch;
use crate::message::Message;
use crate::node::{Destination, EntityKind, NodeState};
use crate::topology::field_table_from_json;

/// The broker's direct-reply-to pseudo queue.
pub(crate) const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

/// Options for exchange declaration. Defaults mirror the broker's.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    /// Check that the exchange exists instead of declaring it.
    pub no_create: bool,
    pub alternate_exchange: Option<String>,
    pub arguments: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ExchangeOptions {
    pub(crate) fn declare_options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: self.no_create,
            durable: self.durable,
            auto_delete: self.auto_delete,
            internal: self.internal,
            ..Default::default()
        }
    }

    pub(crate) fn argument_table(&self) -> FieldTable {
        let mut table = self
            .arguments
            .as_ref()
            .map(field_table_from_json)
            .unwrap_or_default();
        if let Some(alternate) = &self.alternate_exchange {
            table.insert(
                "alternate-exchange".into(),
                AMQPValue::LongString(alternate.as_str().into()),
            );
        }
        table
    }
}

/// A declared exchange. Cheap to clone; all clones share one incarnation.
#[derive(Clone)]
pub struct Exchange {
    pub(crate) inner: Arc<ExchangeInner>,
}

pub(crate) struct ExchangeInner {
    node: NodeState,
    kind: ExchangeKind,
    options: ExchangeOptions,
    replies: ReplyEmitter,
}

impl Exchange {
    pub(crate) fn register(
        connection: Weak<ConnectionInner>,
        name: String,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ExchangeInner {
                node: NodeState::new(connection, name, EntityKind::Exchange),
                kind,
                options,
                replies: ReplyEmitter::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.node.name
    }

    pub fn kind(&self) -> &ExchangeKind {
        &self.inner.kind
    }

    pub fn options(&self) -> &ExchangeOptions {
        &self.inner.options
    }

    pub(crate) fn node(&self) -> &NodeState {
        &self.inner.node
    }

    /// Resolves when the current incarnation is asserted on the broker.
    pub async fn initialized(&self) -> Result<(), TopologyError> {
        self.inner.node.ready().await
    }

    pub(crate) fn initialized_latch(&self) -> Option<Latch> {
        self.inner.node.initialized()
    }

    /// Starts a fresh assertion, chained on the connection's readiness.
    pub(crate) fn reinitialize(&self) {
        let latch = self.inner.node.arm();
        self.inner.replies.clear();
        let exchange = self.clone();
        tokio::spawn(async move {
            match exchange.assert().await {
                Ok(()) => latch.resolve(),
                Err(err) => {
                    error!("exchange \"{}\" failed to initialize: {}", exchange.name(), err);
                    if matches!(err, TopologyError::AssertionFailed { .. }) {
                        if let Ok(connection) = exchange.inner.node.connection() {
                            connection.unregister_exchange(exchange.name());
                        }
                    }
                    latch.reject(err);
                }
            }
        });
    }

    async fn assert(&self) -> Result<(), TopologyError> {
        let connection = self.inner.node.connection()?;
        connection.current_initialized().wait().await?;
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(TopologyError::Broker(source)) => {
                return Err(self.inner.node.assertion_error(source));
            }
            Err(other) => return Err(other),
        };
        self.consume_replies(&channel)
            .await
            .map_err(|source| self.inner.node.assertion_error(source))?;
        channel
            .exchange_declare(
                self.name(),
                self.inner.kind.clone(),
                self.inner.options.declare_options(),
                self.inner.options.argument_table(),
            )
            .await
            .map_err(|source| self.inner.node.assertion_error(source))?;
        self.inner.node.set_channel(channel).await;
        debug!("exchange \"{}\" asserted", self.name());
        Ok(())
    }

    /// Subscribes the channel to the direct-reply-to pseudo queue so replies
    /// to RPCs published on it come back multiplexed by correlation id.
    async fn consume_replies(&self, channel: &Channel) -> Result<(), lapin::Error> {
        let consumer = channel
            .basic_consume(
                DIRECT_REPLY_TO,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        self.inner
            .replies
            .route(consumer, format!("exchange \"{}\"", self.name()));
        Ok(())
    }

    /// Publishes `message` to this exchange.
    pub async fn send(&self, message: &Message, routing_key: &str) -> Result<(), TopologyError> {
        message
            .send_to(&Destination::Exchange(self.clone()), routing_key)
            .await
    }

    /// Publishes a request and resolves with the correlated reply delivered
    /// over direct-reply-to. Overlapping calls are safe: replies are routed
    /// by correlation id, not arrival order.
    pub async fn rpc(&self, request: &Message, routing_key: &str) -> Result<Message, TopologyError> {
        self.inner.node.ready().await?;
        let correlation_id = Uuid::new_v4().to_string();
        let reply = self.inner.replies.register(&correlation_id);
        let properties = request
            .properties()
            .clone()
            .with_correlation_id(correlation_id.as_str().into())
            .with_reply_to(DIRECT_REPLY_TO.into());
        let channel = self.inner.node.channel().await?;
        channel
            .basic_publish(
                self.name(),
                routing_key,
                BasicPublishOptions::default(),
                request.body(),
                properties,
            )
            .await
            .map_err(TopologyError::PublishFailed)?;
        reply.await.map_err(|_| TopologyError::RpcInterrupted)
    }

    /// Declares a binding from `source` into this exchange.
    pub fn bind(
        &self,
        source: &Exchange,
        pattern: impl Into<String>,
        args: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Binding {
        Binding::declare(
            source.clone(),
            Destination::Exchange(self.clone()),
            pattern.into(),
            args,
        )
    }

    /// Removes the binding from `source` with `pattern`.
    pub async fn unbind(&self, source: &Exchange, pattern: &str) -> Result<(), TopologyError> {
        Binding::remove(source, &Destination::Exchange(self.clone()), pattern).await
    }

    /// Deletes the exchange on the broker and forgets it locally. Idempotent.
    pub async fn delete(&self) -> Result<(), TopologyError> {
        let latch = match self.inner.node.claim_deleting() {
            Err(existing) => return existing.wait().await,
            Ok(latch) => latch,
        };
        let result = self.remove(true).await;
        match &result {
            Ok(()) => latch.resolve(),
            Err(err) => latch.reject(err.clone()),
        }
        result
    }

    /// Detaches the exchange without deleting it on the broker. Idempotent.
    pub async fn close(&self) -> Result<(), TopologyError> {
        let latch = match self.inner.node.claim_closing() {
            Err(existing) => return existing.wait().await,
            Ok(latch) => latch,
        };
        let result = self.remove(false).await;
        match &result {
            Ok(()) => latch.resolve(),
            Err(err) => latch.reject(err.clone()),
        }
        result
    }

    async fn remove(&self, delete_on_broker: bool) -> Result<(), TopologyError> {
        self.inner.node.ready().await?;
        let connection = self.inner.node.connection()?;
        Binding::remove_bindings_containing(&connection, EntityKind::Exchange, self.name()).await?;
        let channel = self.inner.node.channel().await?;
        if delete_on_broker {
            channel
                .exchange_delete(self.name(), ExchangeDeleteOptions::default())
                .await?;
        }
        if let Err(err) = channel.close(0, "exchange removed").await {
            warn!("error closing channel of exchange \"{}\": {}", self.name(), err);
        }
        connection.unregister_exchange(self.name());
        self.inner.node.teardown().await;
        Ok(())
    }
}


#[cfg(test)]
mod broker_tests {
    use super::*;
    use crate::connection::Connection;
    use crate::queue::QueueOptions;
    use crate::test::setup::TestSetup;

    async fn echo_service(connection: &Connection) -> (Exchange, crate::queue::Queue) {
        let exchange =
            connection.declare_exchange("rpc.sample.ex", ExchangeKind::Direct, Default::default());
        let queue = connection.declare_queue("rpc.sample.q", QueueOptions::default());
        queue.bind(&exchange, "job", None);
        connection
            .complete_configuration()
            .await
            .expect("topology should assert");
        queue
            .activate_consumer(
                |message| async move {
                    message.ack(false).await.ok();
                    Ok(Some(Message::bytes(message.body().to_vec())))
                },
                Default::default(),
            )
            .await
            .expect("consumer should start");
        (exchange, queue)
    }

    #[test]
    #[ignore = "requires a running RabbitMQ broker"]
    fn correlates_concurrent_rpc_replies() {
        let setup = TestSetup::new();
        setup.rt.block_on(async {
            let (exchange, _queue) = echo_service(&setup.connection).await;

            let first_msg = Message::json(&serde_json::json!({"q": 1})).unwrap();
            let second_msg = Message::json(&serde_json::json!({"q": 2})).unwrap();
            let first = exchange.rpc(&first_msg, "job");
            let second = exchange.rpc(&second_msg, "job");
            let (first, second) = futures_lite::future::zip(first, second).await;

            let first: serde_json::Value = first.expect("first rpc").json_content().unwrap();
            let second: serde_json::Value = second.expect("second rpc").json_content().unwrap();
            assert_eq!(first["q"], 1);
            assert_eq!(second["q"], 2);
        });
    }

    #[test]
    #[ignore = "requires a running RabbitMQ broker"]
    fn queue_rpc_round_trips() {
        let setup = TestSetup::new();
        setup.rt.block_on(async {
            let (_exchange, queue) = echo_service(&setup.connection).await;
            let reply = queue
                .rpc(&Message::text("ping"))
                .await
                .expect("queue rpc should resolve");
            assert_eq!(reply.text_content().unwrap(), "ping");
        });
    }
}
