use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use async_nats::jetstream::{
    consumer::{pull::Config as PullConfig, AckPolicy},
    stream::{Config as StreamConfig, RetentionPolicy},
    Context as JsContext,
};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::BusError;

pub type SharedJobQueue = Arc<dyn JobQueue>;

/// Terminal observability event for one delivery attempt chain. Not
/// required for correctness; the delivery record is the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryResult {
    pub delivery_id: i64,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Durable FIFO queue of delivery ids with blocking dequeue. The timeout
/// bound lets workers observe cancellation between jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, delivery_id: i64) -> Result<(), BusError>;

    /// Pops the head, waiting up to `timeout`; `None` on timeout.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<i64>, BusError>;

    /// Best-effort result broadcast for observers.
    async fn publish_result(&self, result: &DeliveryResult) -> Result<(), BusError>;
}

/// Channel-backed double preserving strict FIFO order.
pub struct InMemoryJobQueue {
    tx: mpsc::UnboundedSender<i64>,
    rx: Mutex<mpsc::UnboundedReceiver<i64>>,
    results: Mutex<Vec<DeliveryResult>>,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            results: Mutex::new(Vec::new()),
        }
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains recorded results; test helper.
    pub async fn take_results(&self) -> Vec<DeliveryResult> {
        let mut guard = self.results.lock().await;
        std::mem::take(&mut *guard)
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, delivery_id: i64) -> Result<(), BusError> {
        self.tx
            .send(delivery_id)
            .map_err(|_| BusError::Transport(anyhow::anyhow!("queue closed")))
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<i64>, BusError> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(id)) => Ok(Some(id)),
            Ok(None) => Err(BusError::Transport(anyhow::anyhow!("queue closed"))),
            Err(_) => Ok(None),
        }
    }

    async fn publish_result(&self, result: &DeliveryResult) -> Result<(), BusError> {
        self.results.lock().await.push(result.clone());
        Ok(())
    }
}

/// JetStream work-queue binding. Dequeue acks on pop; if a worker dies
/// mid-delivery the pending record is re-enqueued by the restart scan.
pub struct NatsJobQueue {
    client: async_nats::Client,
    js: JsContext,
    consumer: async_nats::jetstream::consumer::Consumer<PullConfig>,
    subject: String,
    result_subject: String,
}

impl NatsJobQueue {
    pub async fn new(
        client: async_nats::Client,
        queue_name: &str,
        result_subject: &str,
    ) -> Result<Self, BusError> {
        let js = async_nats::jetstream::new(client.clone());
        let subject = format!("{queue_name}.jobs");
        let stream_cfg = StreamConfig {
            name: queue_name.to_string(),
            subjects: vec![subject.clone()],
            retention: RetentionPolicy::WorkQueue,
            max_messages: -1,
            max_messages_per_subject: -1,
            max_bytes: -1,
            ..Default::default()
        };
        let stream = js
            .get_or_create_stream(stream_cfg)
            .await
            .with_context(|| format!("ensure stream {queue_name}"))
            .map_err(BusError::Transport)?;
        let consumer_name = format!("{queue_name}-workers");
        let consumer = stream
            .get_or_create_consumer(
                &consumer_name,
                PullConfig {
                    durable_name: Some(consumer_name.clone()),
                    filter_subject: subject.clone(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("ensure consumer {consumer_name}"))
            .map_err(BusError::Transport)?;
        Ok(Self {
            client,
            js,
            consumer,
            subject,
            result_subject: result_subject.to_string(),
        })
    }
}

#[async_trait]
impl JobQueue for NatsJobQueue {
    async fn enqueue(&self, delivery_id: i64) -> Result<(), BusError> {
        let ack = self
            .js
            .publish(self.subject.clone(), delivery_id.to_string().into())
            .await
            .with_context(|| format!("enqueue delivery {delivery_id}"))
            .map_err(BusError::Transport)?;
        ack.await
            .with_context(|| format!("confirm enqueue of delivery {delivery_id}"))
            .map_err(BusError::Transport)?;
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<i64>, BusError> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(timeout)
            .messages()
            .await
            .context("open fetch batch")
            .map_err(BusError::Transport)?;
        let msg = match batch
            .try_next()
            .await
            .map_err(|e| BusError::Transport(anyhow::anyhow!(e)))?
        {
            Some(msg) => msg,
            None => return Ok(None),
        };
        let id = std::str::from_utf8(&msg.payload)
            .ok()
            .and_then(|s| s.parse::<i64>().ok());
        msg.ack()
            .await
            .map_err(|e| BusError::Transport(anyhow::anyhow!(e)))?;
        match id {
            Some(id) => Ok(Some(id)),
            None => {
                tracing::warn!("dropping malformed queue payload");
                Ok(None)
            }
        }
    }

    async fn publish_result(&self, result: &DeliveryResult) -> Result<(), BusError> {
        let bytes = serde_json::to_vec(result)
            .map_err(|e| BusError::Transport(anyhow::Error::new(e)))?;
        self.client
            .publish(self.result_subject.clone(), bytes.into())
            .await
            .map_err(|e| BusError::Transport(anyhow::Error::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let queue = InMemoryJobQueue::new();
        for id in 1..=3 {
            queue.enqueue(id).await.unwrap();
        }
        for expected in 1..=3 {
            let got = queue.dequeue(Duration::from_millis(50)).await.unwrap();
            assert_eq!(got, Some(expected));
        }
    }

    #[tokio::test]
    async fn dequeue_times_out_empty() {
        let queue = InMemoryJobQueue::new();
        let got = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn results_are_recorded() {
        let queue = InMemoryJobQueue::new();
        queue
            .publish_result(&DeliveryResult {
                delivery_id: 7,
                success: false,
                error: Some("boom".into()),
            })
            .await
            .unwrap();
        let results = queue.take_results().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].delivery_id, 7);
        assert!(!results[0].success);
    }
}
