use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRecoverOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::Channel;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::binding::Binding;
use crate::connection::{ConnectionInner, TopologyError};
use crate::emitter::ReplyEmitter;
use crate::exchange::{Exchange, DIRECT_REPLY_TO};
use crate::latch::Latch;
use crate::message::Message;
use crate::node::{Destination, EntityKind, NodeState};
use crate::topology::field_table_from_json;

/// Options for queue declaration. Defaults mirror the broker's; the `x-`
/// arguments the broker recognizes are first-class fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Check that the queue exists instead of declaring it.
    pub no_create: bool,
    /// Applied to the channel after assertion and reapplied on rebuilds.
    pub prefetch: Option<u16>,
    pub message_ttl: Option<u32>,
    pub expires: Option<u32>,
    pub dead_letter_exchange: Option<String>,
    pub max_length: Option<u32>,
    pub arguments: Option<serde_json::Map<String, serde_json::Value>>,
}

impl QueueOptions {
    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.no_create,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            ..Default::default()
        }
    }

    pub(crate) fn argument_table(&self) -> FieldTable {
        let mut table = self
            .arguments
            .as_ref()
            .map(field_table_from_json)
            .unwrap_or_default();
        if let Some(ttl) = self.message_ttl {
            table.insert("x-message-ttl".into(), AMQPValue::LongLongInt(i64::from(ttl)));
        }
        if let Some(expires) = self.expires {
            table.insert("x-expires".into(), AMQPValue::LongLongInt(i64::from(expires)));
        }
        if let Some(dlx) = &self.dead_letter_exchange {
            table.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dlx.as_str().into()),
            );
        }
        if let Some(max) = self.max_length {
            table.insert("x-max-length".into(), AMQPValue::LongLongInt(i64::from(max)));
        }
        table
    }
}

/// What a consumer callback produces: optionally a reply message, published
/// back when the delivery carried a `reply_to` address.
pub type ConsumerOutcome = Result<Option<Message>, TopologyError>;

type ConsumerFuture = Pin<Box<dyn Future<Output = ConsumerOutcome> + Send>>;
type ConsumerCallback = Arc<dyn Fn(Message) -> ConsumerFuture + Send + Sync>;

struct ConsumerRegistration {
    callback: ConsumerCallback,
    options: BasicConsumeOptions,
    tag: Option<String>,
    initialized: Latch,
    stopping: bool,
}

/// A declared queue. Cheap to clone; all clones share one incarnation.
#[derive(Clone)]
pub struct Queue {
    pub(crate) inner: Arc<QueueInner>,
}

pub(crate) struct QueueInner {
    node: NodeState,
    options: QueueOptions,
    prefetch: Mutex<Option<u16>>,
    consumer: Mutex<Option<ConsumerRegistration>>,
    replies: ReplyEmitter,
    reply_consumer: AsyncMutex<bool>,
}

impl Queue {
    pub(crate) fn register(
        connection: Weak<ConnectionInner>,
        name: String,
        options: QueueOptions,
    ) -> Self {
        let prefetch = options.prefetch;
        Self {
            inner: Arc::new(QueueInner {
                node: NodeState::new(connection, name, EntityKind::Queue),
                options,
                prefetch: Mutex::new(prefetch),
                consumer: Mutex::new(None),
                replies: ReplyEmitter::new(),
                reply_consumer: AsyncMutex::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.node.name
    }

    pub fn options(&self) -> &QueueOptions {
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

    pub(crate) fn consumer_latch(&self) -> Option<Latch> {
        self.inner
            .consumer
            .lock()
            .unwrap()
            .as_ref()
            .map(|registration| registration.initialized.clone())
    }

    /// Starts a fresh assertion, chained on the connection's readiness.
    pub(crate) fn reinitialize(&self) {
        let latch = self.inner.node.arm();
        self.inner.replies.clear();
        let queue = self.clone();
        tokio::spawn(async move {
            // The reply consumer belongs to the previous channel.
            *queue.inner.reply_consumer.lock().await = false;
            match queue.assert().await {
                Ok(()) => latch.resolve(),
                Err(err) => {
                    error!("queue \"{}\" failed to initialize: {}", queue.name(), err);
                    if matches!(err, TopologyError::AssertionFailed { .. }) {
                        if let Ok(connection) = queue.inner.node.connection() {
                            connection.unregister_queue(queue.name());
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
        channel
            .queue_declare(
                self.name(),
                self.inner.options.declare_options(),
                self.inner.options.argument_table(),
            )
            .await
            .map_err(|source| self.inner.node.assertion_error(source))?;
        let prefetch = *self.inner.prefetch.lock().unwrap();
        if let Some(count) = prefetch {
            channel
                .basic_qos(count, BasicQosOptions::default())
                .await
                .map_err(|source| self.inner.node.assertion_error(source))?;
        }
        self.inner.node.set_channel(channel).await;
        debug!("queue \"{}\" asserted", self.name());
        Ok(())
    }

    /// Applies `count` to the channel and remembers it so rebuilds reapply it.
    pub async fn prefetch(&self, count: u16) -> Result<(), TopologyError> {
        self.inner.node.ready().await?;
        let channel = self.inner.node.channel().await?;
        channel.basic_qos(count, BasicQosOptions::default()).await?;
        *self.inner.prefetch.lock().unwrap() = Some(count);
        Ok(())
    }

    /// Asks the broker to requeue this channel's unacknowledged deliveries.
    pub async fn recover(&self) -> Result<(), TopologyError> {
        self.inner.node.ready().await?;
        let channel = self.inner.node.channel().await?;
        channel
            .basic_recover(BasicRecoverOptions { requeue: true })
            .await?;
        Ok(())
    }

    /// Publishes `message` straight to this queue via the default exchange.
    pub async fn send(&self, message: &Message) -> Result<(), TopologyError> {
        message.send_to(&Destination::Queue(self.clone()), "").await
    }

    /// Publishes a request to this queue and resolves with the correlated
    /// reply delivered over direct-reply-to.
    pub async fn rpc(&self, request: &Message) -> Result<Message, TopologyError> {
        self.inner.node.ready().await?;
        let channel = self.inner.node.channel().await?;
        self.ensure_reply_consumer(&channel).await?;
        let correlation_id = Uuid::new_v4().to_string();
        let reply = self.inner.replies.register(&correlation_id);
        let properties = request
            .properties()
            .clone()
            .with_correlation_id(correlation_id.as_str().into())
            .with_reply_to(DIRECT_REPLY_TO.into());
        channel
            .basic_publish(
                "",
                self.name(),
                BasicPublishOptions::default(),
                request.body(),
                properties,
            )
            .await
            .map_err(TopologyError::PublishFailed)?;
        reply.await.map_err(|_| TopologyError::RpcInterrupted)
    }

    /// Installs the direct-reply-to consumer once per incarnation; the reply
    /// consumer must exist before a request with `reply_to` is published.
    async fn ensure_reply_consumer(&self, channel: &Channel) -> Result<(), TopologyError> {
        let mut installed = self.inner.reply_consumer.lock().await;
        if *installed {
            return Ok(());
        }
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
            .route(consumer, format!("queue \"{}\"", self.name()));
        *installed = true;
        Ok(())
    }

    /// Subscribes `callback` as this queue's single consumer. Repeated calls
    /// await the already-registered consumer instead of adding another. The
    /// subscription survives rebuilds: the callback and options are kept and
    /// re-subscribed under a fresh consumer tag.
    pub async fn activate_consumer<F, Fut>(
        &self,
        callback: F,
        options: BasicConsumeOptions,
    ) -> Result<(), TopologyError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ConsumerOutcome> + Send + 'static,
    {
        let (latch, spawn) = {
            let mut slot = self.inner.consumer.lock().unwrap();
            match slot.as_ref() {
                Some(existing) => (existing.initialized.clone(), false),
                None => {
                    let callback: ConsumerCallback = Arc::new(move |message| {
                        let future: ConsumerFuture = Box::pin(callback(message));
                        future
                    });
                    let latch = Latch::new();
                    *slot = Some(ConsumerRegistration {
                        callback,
                        options,
                        tag: None,
                        initialized: latch.clone(),
                        stopping: false,
                    });
                    (latch, true)
                }
            }
        };
        if spawn {
            self.spawn_consumer();
        }
        latch.wait().await
    }

    /// Cancels the active consumer, if any, and clears its registration.
    pub async fn stop_consumer(&self) -> Result<(), TopologyError> {
        let tag = {
            let mut slot = self.inner.consumer.lock().unwrap();
            match slot.as_mut() {
                None => return Ok(()),
                Some(registration) if registration.stopping => return Ok(()),
                Some(registration) => {
                    registration.stopping = true;
                    registration.tag.clone()
                }
            }
        };
        if let Some(tag) = tag {
            let channel = self.inner.node.channel().await?;
            channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await?;
        }
        *self.inner.consumer.lock().unwrap() = None;
        Ok(())
    }

    /// Re-subscribes a surviving consumer with a fresh latch and tag.
    pub(crate) fn reinitialize_consumer(&self) {
        let respawn = {
            let mut slot = self.inner.consumer.lock().unwrap();
            match slot.as_mut() {
                Some(registration) if !registration.stopping => {
                    registration.initialized = Latch::new();
                    registration.tag = None;
                    true
                }
                _ => false,
            }
        };
        if respawn {
            self.spawn_consumer();
        }
    }

    fn spawn_consumer(&self) {
        let queue = self.clone();
        tokio::spawn(async move {
            let (latch, callback, options) = {
                let slot = queue.inner.consumer.lock().unwrap();
                match slot.as_ref() {
                    Some(registration) => (
                        registration.initialized.clone(),
                        registration.callback.clone(),
                        registration.options,
                    ),
                    None => return,
                }
            };
            match queue.subscribe(callback, options).await {
                Ok(tag) => {
                    if let Some(registration) = queue.inner.consumer.lock().unwrap().as_mut() {
                        registration.tag = Some(tag);
                    }
                    latch.resolve();
                }
                Err(err) => {
                    error!("consumer on queue \"{}\" failed to start: {}", queue.name(), err);
                    latch.reject(err);
                }
            }
        });
    }

    async fn subscribe(
        &self,
        callback: ConsumerCallback,
        options: BasicConsumeOptions,
    ) -> Result<String, TopologyError> {
        self.inner.node.ready().await?;
        let channel = self.inner.node.channel().await?;
        let consumer = channel
            .basic_consume(self.name(), "", options, FieldTable::default())
            .await?;
        let tag = consumer.tag().to_string();
        debug!("consumer \"{}\" active on queue \"{}\"", tag, self.name());
        self.run_consumer(consumer, callback, channel);
        Ok(tag)
    }

    /// Wraps every delivery into a [`Message`], invokes the callback, and
    /// publishes its reply to the default exchange when the delivery carried
    /// a `reply_to` address. Callback failures are logged; settling the
    /// delivery stays the callback's responsibility.
    fn run_consumer(&self, mut consumer: lapin::Consumer, callback: ConsumerCallback, channel: Channel) {
        use futures_lite::StreamExt;

        let queue_name = self.name().to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let reply_to = delivery.properties.reply_to().clone();
                        let correlation_id = delivery.properties.correlation_id().clone();
                        let message = Message::from_delivery(delivery, Some(channel.clone()));
                        match callback(message).await {
                            Ok(Some(reply)) => {
                                let Some(reply_to) = reply_to else { continue };
                                let mut properties = reply.properties().clone();
                                if let Some(correlation_id) = correlation_id {
                                    properties = properties.with_correlation_id(correlation_id);
                                }
                                if let Err(err) = channel
                                    .basic_publish(
                                        "",
                                        reply_to.as_str(),
                                        BasicPublishOptions::default(),
                                        reply.body(),
                                        properties,
                                    )
                                    .await
                                {
                                    error!(
                                        "failed to publish rpc reply from queue \"{}\": {}",
                                        queue_name, err
                                    );
                                }
                            }
                            Ok(None) => {}
                            Err(err) => {
                                error!(
                                    "consumer callback on queue \"{}\" failed: {}",
                                    queue_name, err
                                );
                            }
                        }
                    }
                    Err(err) => error!("consumer stream on queue \"{}\" failed: {}", queue_name, err),
                }
            }
            debug!("consumer stream on queue \"{}\" ended", queue_name);
        });
    }

    /// Declares a binding from `source` into this queue.
    pub fn bind(
        &self,
        source: &Exchange,
        pattern: impl Into<String>,
        args: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Binding {
        Binding::declare(
            source.clone(),
            Destination::Queue(self.clone()),
            pattern.into(),
            args,
        )
    }

    /// Removes the binding from `source` with `pattern`.
    pub async fn unbind(&self, source: &Exchange, pattern: &str) -> Result<(), TopologyError> {
        Binding::remove(source, &Destination::Queue(self.clone()), pattern).await
    }

    /// Deletes the queue on the broker and forgets it locally. Idempotent.
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

    /// Detaches the queue without deleting it on the broker. Idempotent.
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
        Binding::remove_bindings_containing(&connection, EntityKind::Queue, self.name()).await?;
        self.stop_consumer().await?;
        let channel = self.inner.node.channel().await?;
        if delete_on_broker {
            channel
                .queue_delete(self.name(), QueueDeleteOptions::default())
                .await?;
        }
        if let Err(err) = channel.close(0, "queue removed").await {
            warn!("error closing channel of queue \"{}\": {}", self.name(), err);
        }
        connection.unregister_queue(self.name());
        self.inner.node.teardown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;

    #[test]
    fn maps_queue_options_to_broker_arguments() {
        let options = QueueOptions {
            message_ttl: Some(30_000),
            expires: Some(60_000),
            dead_letter_exchange: Some("dlx".into()),
            max_length: Some(10),
            ..Default::default()
        };
        let table = options.argument_table();
        let inner = table.inner();
        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongLongInt(30_000))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-expires")),
            Some(&AMQPValue::LongLongInt(60_000))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-dead-letter-exchange")),
            Some(&AMQPValue::LongString("dlx".into()))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-max-length")),
            Some(&AMQPValue::LongLongInt(10))
        );
    }

    #[test]
    fn user_arguments_merge_with_recognized_options() {
        let mut arguments = serde_json::Map::new();
        arguments.insert("x-queue-mode".to_string(), serde_json::json!("lazy"));
        let options = QueueOptions {
            message_ttl: Some(1_000),
            arguments: Some(arguments),
            ..Default::default()
        };
        let table = options.argument_table();
        let inner = table.inner();
        assert_eq!(
            inner.get(&ShortString::from("x-queue-mode")),
            Some(&AMQPValue::LongString("lazy".into()))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongLongInt(1_000))
        );
    }

    #[test]
    fn no_create_switches_to_a_passive_check() {
        let options = QueueOptions {
            no_create: true,
            ..Default::default()
        };
        assert!(options.declare_options().passive);
    }
}
