use std::{collections::HashMap, pin::Pin, sync::Arc};

use anyhow::Context as _;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;

use crate::BusError;

/// Capacity of one in-memory subject channel. Subscribers that lag past it
/// lose the overwritten events, matching at-most-once bus semantics.
const SUBJECT_CHANNEL_CAPACITY: usize = 1024;

pub type SharedEventBus = Arc<dyn EventBus>;

/// Fire-and-forget pub/sub. Publishing never blocks on slow subscribers.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish_value(&self, subject: &str, payload: Value) -> Result<(), BusError>;

    /// Opens a subscription on one subject. Dropping the subscription
    /// unsubscribes.
    async fn subscribe(&self, subject: &str) -> Result<BusSubscription, BusError>;
}

/// A live subscription yielding decoded JSON payloads. Non-JSON payloads
/// are skipped.
pub struct BusSubscription {
    inner: Pin<Box<dyn Stream<Item = Value> + Send>>,
}

impl BusSubscription {
    pub async fn next(&mut self) -> Option<Value> {
        self.inner.next().await
    }
}

/// NATS core pub/sub binding.
pub struct NatsEventBus {
    client: async_nats::Client,
}

impl NatsEventBus {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish_value(&self, subject: &str, payload: Value) -> Result<(), BusError> {
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| BusError::Transport(anyhow::Error::new(e)))?;
        self.client
            .publish(subject.to_string(), bytes.into())
            .await
            .map_err(|err| BusError::Transport(anyhow::Error::new(err)))
    }

    async fn subscribe(&self, subject: &str) -> Result<BusSubscription, BusError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .with_context(|| format!("subscribe {subject}"))
            .map_err(BusError::Transport)?;
        let stream = subscriber
            .filter_map(|msg| async move { serde_json::from_slice::<Value>(&msg.payload).ok() });
        Ok(BusSubscription {
            inner: Box::pin(stream),
        })
    }
}

/// Broadcast-channel double used by tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    subjects: Arc<Mutex<HashMap<String, broadcast::Sender<Value>>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender(&self, subject: &str) -> broadcast::Sender<Value> {
        let mut guard = self.subjects.lock().await;
        guard
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(SUBJECT_CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish_value(&self, subject: &str, payload: Value) -> Result<(), BusError> {
        // A send error just means nobody is subscribed right now.
        let _ = self.sender(subject).await.send(payload);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<BusSubscription, BusError> {
        let rx = self.sender(subject).await.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|item| async move { item.ok() });
        Ok(BusSubscription {
            inner: Box::pin(stream),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fan_out_reaches_all_subscribers() {
        let bus = InMemoryEventBus::new();
        let mut a = bus.subscribe("chat.1").await.unwrap();
        let mut b = bus.subscribe("chat.1").await.unwrap();
        bus.publish_value("chat.1", json!({"n": 1})).await.unwrap();
        assert_eq!(a.next().await.unwrap()["n"], 1);
        assert_eq!(b.next().await.unwrap()["n"], 1);
    }

    #[tokio::test]
    async fn subjects_are_isolated() {
        let bus = InMemoryEventBus::new();
        let mut one = bus.subscribe("chat.1").await.unwrap();
        bus.publish_value("chat.2", json!({"n": 2})).await.unwrap();
        bus.publish_value("chat.1", json!({"n": 1})).await.unwrap();
        assert_eq!(one.next().await.unwrap()["n"], 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = InMemoryEventBus::new();
        bus.publish_value("chat.9", json!({})).await.unwrap();
    }
}
