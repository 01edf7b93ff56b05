//! Event broker: fan-in from the ingest pipeline onto per-chat bus topics,
//! and ref-counted chat subscriptions feeding the local subscriber hub.
//!
//! Publish is fire-and-forget; the publisher is never blocked by a slow
//! subscriber (bounding happens in the hub's per-client queues). Per-chat
//! ordering holds as long as the bus preserves per-subject FIFO, which NATS
//! does for a single publisher.

use std::collections::HashMap;

use botgate_bus::{BusError, EventBus as _, SharedEventBus};
use botgate_core::{chat_subject, Event};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

struct Topic {
    refcount: usize,
    cancel: CancellationToken,
}

/// One broker per process. Every locally subscribed chat holds exactly one
/// bus subscription regardless of how many clients watch it; decoded events
/// drain into the tap handed out by [`Broker::new`].
pub struct Broker {
    bus: SharedEventBus,
    topics: Mutex<HashMap<i64, Topic>>,
    tap: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
}

impl Broker {
    /// Returns the broker and the receiving end of the local tap. The
    /// caller (the hub wiring) owns draining it.
    pub fn new(bus: SharedEventBus) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tap, rx) = mpsc::unbounded_channel();
        (
            Self {
                bus,
                topics: Mutex::new(HashMap::new()),
                tap,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Publishes onto the event's chat topic. Errors are the caller's to
    /// log; ingest treats fan-out as best-effort once the row is durable.
    pub async fn publish(&self, event: &Event) -> Result<(), BusError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| BusError::Transport(anyhow_from(e)))?;
        self.bus
            .publish_value(&chat_subject(event.chat_id), payload)
            .await?;
        metrics::counter!("broker_events_published").increment(1);
        Ok(())
    }

    /// Adds one local reference to a chat topic, opening the bus
    /// subscription on the first.
    pub async fn subscribe_chat(&self, chat_id: i64) -> Result<(), BusError> {
        let mut topics = self.topics.lock().await;
        if let Some(topic) = topics.get_mut(&chat_id) {
            topic.refcount += 1;
            return Ok(());
        }

        let mut subscription = self.bus.subscribe(&chat_subject(chat_id)).await?;
        let cancel = self.cancel.child_token();
        let task_cancel = cancel.clone();
        let tap = self.tap.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    received = subscription.next() => {
                        let Some(value) = received else { break };
                        match serde_json::from_value::<Event>(value) {
                            Ok(event) => {
                                if tap.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(chat_id, error = %err, "undecodable event on chat topic");
                            }
                        }
                    }
                }
            }
            tracing::debug!(chat_id, "chat topic forwarder stopped");
        });

        topics.insert(
            chat_id,
            Topic {
                refcount: 1,
                cancel,
            },
        );
        tracing::debug!(chat_id, "chat topic opened");
        Ok(())
    }

    /// Drops one local reference; the last one tears the bus subscription
    /// down.
    pub async fn unsubscribe_chat(&self, chat_id: i64) {
        let mut topics = self.topics.lock().await;
        let Some(topic) = topics.get_mut(&chat_id) else {
            return;
        };
        topic.refcount -= 1;
        if topic.refcount == 0 {
            topic.cancel.cancel();
            topics.remove(&chat_id);
            tracing::debug!(chat_id, "chat topic closed");
        }
    }

    /// Cancels every forwarder. Used on gateway shutdown.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.topics.lock().await.clear();
    }

    #[doc(hidden)]
    pub async fn topic_count(&self) -> usize {
        self.topics.lock().await.len()
    }
}

fn anyhow_from(err: serde_json::Error) -> anyhow::Error {
    anyhow::Error::new(err)
}
