use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions};
use lapin::types::{DeliveryTag, ShortString};
use lapin::{BasicProperties, Channel};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::connection::{ConnectionInner, TopologyError};
use crate::node::Destination;

pub(crate) const JSON_CONTENT_TYPE: &str = "application/json";

/// Delivery metadata populated on messages received from a consumer.
#[derive(Debug, Clone, Default)]
pub struct DeliveryFields {
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// A message envelope: payload bytes plus AMQP properties. Messages received
/// from a consumer also carry the delivering channel and delivery fields.
#[derive(Clone)]
pub struct Message {
    content: Vec<u8>,
    properties: BasicProperties,
    channel: Option<Channel>,
    fields: Option<DeliveryFields>,
}

impl Message {
    /// A message with a UTF-8 text payload.
    pub fn text(content: impl AsRef<str>) -> Self {
        Self::bytes(content.as_ref().as_bytes().to_vec())
    }

    /// A message with a raw byte payload.
    pub fn bytes(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            properties: BasicProperties::default(),
            channel: None,
            fields: None,
        }
    }

    /// A message with a JSON payload; marks the content type accordingly.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, TopologyError> {
        let content = serde_json::to_vec(value)?;
        let mut message = Self::bytes(content);
        message.properties = message.properties.with_content_type(JSON_CONTENT_TYPE.into());
        Ok(message)
    }

    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    pub fn body(&self) -> &[u8] {
        &self.content
    }

    /// The payload decoded as UTF-8.
    pub fn text_content(&self) -> Result<String, TopologyError> {
        String::from_utf8(self.content.clone())
            .map_err(|err| TopologyError::Serialization(err.to_string()))
    }

    /// The payload parsed as JSON.
    pub fn json_content<T: DeserializeOwned>(&self) -> Result<T, TopologyError> {
        Ok(serde_json::from_slice(&self.content)?)
    }

    /// Whether the producer marked the payload as JSON.
    pub fn is_json(&self) -> bool {
        self.properties.content_type().as_ref().map(ShortString::as_str) == Some(JSON_CONTENT_TYPE)
    }

    /// Delivery fields, present on received messages only.
    pub fn fields(&self) -> Option<&DeliveryFields> {
        self.fields.as_ref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.properties
            .correlation_id()
            .as_ref()
            .map(ShortString::as_str)
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to().as_ref().map(ShortString::as_str)
    }

    pub(crate) fn from_delivery(delivery: Delivery, channel: Option<Channel>) -> Self {
        Self {
            fields: Some(DeliveryFields {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
            }),
            content: delivery.data,
            properties: delivery.properties,
            channel,
        }
    }

    /// Publishes this message to `destination`.
    ///
    /// Queue destinations route through the default exchange with the queue
    /// name as routing key. A failed publish rebuilds the connection and the
    /// message is retransmitted once per rebuild cycle.
    pub async fn send_to(
        &self,
        destination: &Destination,
        routing_key: &str,
    ) -> Result<(), TopologyError> {
        let (exchange, routing_key) = match destination {
            Destination::Queue(queue) => (String::new(), queue.name().to_string()),
            Destination::Exchange(exchange) => {
                (exchange.name().to_string(), routing_key.to_string())
            }
        };
        let connection = destination.node().connection()?;
        loop {
            destination.node().ready().await?;
            let channel = destination.node().channel().await?;
            match channel
                .basic_publish(
                    &exchange,
                    &routing_key,
                    BasicPublishOptions::default(),
                    &self.content,
                    self.properties.clone(),
                )
                .await
            {
                Ok(_confirm) => return Ok(()),
                Err(err) => {
                    warn!(
                        "publish to \"{}\" failed, rebuilding before retransmit: {}",
                        destination.name(),
                        err
                    );
                    ConnectionInner::rebuild_all(&connection, &TopologyError::PublishFailed(err))
                        .await?;
                }
            }
        }
    }

    /// Acknowledges a received message; a no-op on locally built messages.
    pub async fn ack(&self, all_up_to: bool) -> Result<(), TopologyError> {
        let (Some(channel), Some(fields)) = (&self.channel, &self.fields) else {
            return Ok(());
        };
        channel
            .basic_ack(fields.delivery_tag, BasicAckOptions { multiple: all_up_to })
            .await?;
        Ok(())
    }

    /// Rejects a received message; a no-op on locally built messages.
    pub async fn nack(&self, all_up_to: bool, requeue: bool) -> Result<(), TopologyError> {
        let (Some(channel), Some(fields)) = (&self.channel, &self.fields) else {
            return Ok(());
        };
        channel
            .basic_nack(
                fields.delivery_tag,
                BasicNackOptions {
                    multiple: all_up_to,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trips() {
        let message = Message::text("hello");
        assert_eq!(message.text_content().unwrap(), "hello");
        assert!(!message.is_json());
    }

    #[test]
    fn json_round_trips_and_marks_the_content_type() {
        let value = serde_json::json!({"a": [1, 2, 3], "nested": {"b": true}});
        let message = Message::json(&value).unwrap();
        assert!(message.is_json());
        let back: serde_json::Value = message.json_content().unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn bytes_pass_through_untouched() {
        let payload = vec![0u8, 159, 146, 150];
        assert_eq!(Message::bytes(payload.clone()).body(), payload.as_slice());
    }

    #[tokio::test]
    async fn settling_a_local_message_is_a_no_op() {
        let message = Message::text("not from a broker");
        assert!(message.fields().is_none());
        assert!(message.ack(false).await.is_ok());
        assert!(message.nack(false, true).await.is_ok());
    }
}
