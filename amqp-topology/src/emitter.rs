use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_lite::StreamExt;
use lapin::Consumer;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::message::Message;

/// Routes direct-reply-to deliveries to their awaiting RPC calls.
///
/// Each in-flight RPC registers a one-shot slot under its correlation id; the
/// reply consumer looks the slot up, removes it, and fires it. Slots from a
/// previous incarnation are dropped wholesale on rebuild, failing their RPCs
/// fast instead of leaving them waiting on replies that can no longer arrive.
#[derive(Clone)]
pub(crate) struct ReplyEmitter {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>,
}

impl ReplyEmitter {
    pub(crate) fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reserves the slot for `correlation_id` and returns its receiving half.
    pub(crate) fn register(&self, correlation_id: &str) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(correlation_id.to_string(), tx);
        rx
    }

    /// Delivers `message` to the slot registered under `correlation_id`.
    pub(crate) fn emit(&self, correlation_id: &str, message: Message) {
        let slot = self.pending.lock().unwrap().remove(correlation_id);
        match slot {
            Some(tx) => {
                if tx.send(message).is_err() {
                    debug!("rpc caller for correlation id {} went away", correlation_id);
                }
            }
            None => debug!("dropping reply with unknown correlation id {}", correlation_id),
        }
    }

    /// Drops every pending slot; their callers observe an interrupted rpc.
    pub(crate) fn clear(&self) {
        self.pending.lock().unwrap().clear();
    }

    /// Spawns the loop feeding deliveries from `consumer` into the slots.
    pub(crate) fn route(&self, mut consumer: Consumer, owner: String) {
        let replies = self.clone();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let Some(correlation_id) = delivery.properties.correlation_id().clone()
                        else {
                            warn!("{} received a reply without a correlation id", owner);
                            continue;
                        };
                        replies.emit(
                            correlation_id.as_str(),
                            Message::from_delivery(delivery, None),
                        );
                    }
                    Err(err) => error!("reply consumer of {} failed: {}", owner, err),
                }
            }
            debug!("reply consumer of {} ended", owner);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_replies_by_correlation_id() {
        let emitter = ReplyEmitter::new();
        let first = emitter.register("corr-1");
        let second = emitter.register("corr-2");

        // Replies arrive in the opposite order; correlation ids still match.
        emitter.emit("corr-2", Message::text("two"));
        emitter.emit("corr-1", Message::text("one"));

        assert_eq!(first.await.unwrap().text_content().unwrap(), "one");
        assert_eq!(second.await.unwrap().text_content().unwrap(), "two");
    }

    #[tokio::test]
    async fn unknown_correlation_ids_are_dropped() {
        let emitter = ReplyEmitter::new();
        emitter.emit("nobody", Message::text("ignored"));
    }

    #[tokio::test]
    async fn clearing_fails_pending_rpcs_fast() {
        let emitter = ReplyEmitter::new();
        let pending = emitter.register("corr");
        emitter.clear();
        assert!(pending.await.is_err());
    }
}
