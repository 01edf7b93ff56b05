use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context as _, Result};
use botgate_bus::{DeliveryResult, JobQueue as _, SharedJobQueue};
use botgate_core::{
    backoff, extract_event, Delivery, DeliveryStatus, Event, EventKind, Message, TelegramUpdate,
    Webhook,
};
use botgate_store::{GatewayStore as _, SharedStore};
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerRegistry, BreakerSettings};
use crate::payload::build_payload;
use crate::signer::sign;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub max_retries: u32,
    pub user_agent: String,
    pub dequeue_timeout: Duration,
    pub request_timeout: Duration,
    pub max_response_bytes: usize,
    pub breaker: BreakerSettings,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            user_agent: concat!("botgate-webhook/", env!("CARGO_PKG_VERSION")).to_string(),
            dequeue_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_response_bytes: 1024 * 1024,
            breaker: BreakerSettings::default(),
        }
    }
}

/// N workers over one shared queue, driving signed HTTP POSTs with
/// per-destination circuit breakers and bounded retry.
pub struct WorkerPool {
    store: SharedStore,
    queue: SharedJobQueue,
    http: reqwest::Client,
    breakers: BreakerRegistry,
    config: WorkerConfig,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        store: SharedStore,
        queue: SharedJobQueue,
        config: WorkerConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("build delivery http client")?;
        Ok(Self {
            store,
            queue,
            http,
            breakers: BreakerRegistry::new(config.breaker.clone()),
            config,
            cancel,
        })
    }

    /// Runs `workers` loops until cancellation. Workers observe the cancel
    /// signal between jobs, bounded by one dequeue timeout.
    pub async fn run(self: Arc<Self>, workers: usize) {
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let pool = Arc::clone(&self);
            handles.push(tokio::spawn(async move { pool.worker_loop(worker).await }));
        }
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "delivery worker panicked");
            }
        }
    }

    async fn worker_loop(&self, worker: usize) {
        tracing::info!(worker, "delivery worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.queue.dequeue(self.config.dequeue_timeout).await {
                Ok(Some(delivery_id)) => {
                    if let Err(err) = self.process_delivery(delivery_id).await {
                        tracing::error!(delivery_id, error = %err, "delivery processing failed");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(error = %err, "queue dequeue failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        tracing::info!(worker, "delivery worker stopped");
    }

    /// One attempt for one delivery record, steps 2-6 of the delivery loop.
    pub async fn process_delivery(&self, delivery_id: i64) -> Result<()> {
        let Some(mut delivery) = self
            .store
            .delivery(delivery_id)
            .await
            .map_err(|e| anyhow!(e))?
        else {
            tracing::warn!(delivery_id, "dequeued unknown delivery");
            return Ok(());
        };
        if delivery.status != DeliveryStatus::Pending {
            return Ok(());
        }
        if delivery.attempt_count >= self.config.max_retries {
            return self
                .mark_failed(delivery, "retry budget exhausted".to_string())
                .await;
        }

        let Some(webhook) = self
            .store
            .webhook(delivery.webhook_id)
            .await
            .map_err(|e| anyhow!(e))?
        else {
            return self
                .mark_failed(delivery, "webhook no longer exists".to_string())
                .await;
        };

        let breaker = self.breakers.breaker(&webhook.url);
        let admitted = breaker
            .lock()
            .expect("breaker lock poisoned")
            .try_acquire();
        if !admitted {
            metrics::counter!("delivery_breaker_rejections_total").increment(1);
            tracing::debug!(
                delivery_id,
                url = %webhook.url,
                "circuit open, rescheduling without dialing"
            );
            let wait = backoff(delivery.attempt_count.max(1));
            delivery.next_retry_at = OffsetDateTime::now_utc() + wait;
            self.store
                .update_delivery(&delivery)
                .await
                .map_err(|e| anyhow!(e))?;
            self.schedule_requeue(delivery.id, wait);
            return Ok(());
        }

        let event = self.load_event(&delivery).await?;
        let payload = build_payload(&event, OffsetDateTime::now_utc());
        let body = serde_json::to_vec(&payload).context("encode webhook payload")?;
        let signature = sign(&webhook.secret, &body);

        metrics::counter!("delivery_attempts_total").increment(1);
        let response = self
            .http
            .post(&webhook.url)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, self.config.user_agent.clone())
            .header("X-Webhook-Signature", signature)
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                // Drain (bounded) so the connection can be reused.
                let _ = read_limited(response, self.config.max_response_bytes).await;
                breaker
                    .lock()
                    .expect("breaker lock poisoned")
                    .on_success();
                self.mark_delivered(delivery).await
            }
            Ok(response) => {
                let status = response.status();
                let body = read_limited(response, self.config.max_response_bytes).await;
                let error = format!("status {status}: {}", truncate_for_record(&body));
                breaker
                    .lock()
                    .expect("breaker lock poisoned")
                    .on_failure();
                self.record_attempt_failure(delivery, webhook, error).await
            }
            Err(err) => {
                breaker
                    .lock()
                    .expect("breaker lock poisoned")
                    .on_failure();
                self.record_attempt_failure(delivery, webhook, err.to_string())
                    .await
            }
        }
    }

    async fn load_event(&self, delivery: &Delivery) -> Result<Event> {
        let message = self
            .store
            .message(delivery.message_id)
            .await
            .map_err(|e| anyhow!(e))?
            .with_context(|| format!("message {} missing", delivery.message_id))?;
        let chat = self
            .store
            .chat(message.chat_id)
            .await
            .map_err(|e| anyhow!(e))?
            .with_context(|| format!("chat {} missing", message.chat_id))?;
        let kind = event_kind_of(&message);
        Ok(Event::from_message(kind, &chat, &message))
    }

    async fn mark_delivered(&self, mut delivery: Delivery) -> Result<()> {
        delivery.attempt_count += 1;
        delivery.status = DeliveryStatus::Delivered;
        delivery.delivered_at = Some(OffsetDateTime::now_utc());
        delivery.last_error = None;
        self.store
            .update_delivery(&delivery)
            .await
            .map_err(|e| anyhow!(e))?;
        metrics::counter!("delivery_success_total").increment(1);
        tracing::info!(
            delivery_id = delivery.id,
            attempts = delivery.attempt_count,
            "webhook delivered"
        );
        self.publish_result(&delivery, true, None).await;
        Ok(())
    }

    async fn record_attempt_failure(
        &self,
        mut delivery: Delivery,
        webhook: Webhook,
        error: String,
    ) -> Result<()> {
        delivery.attempt_count += 1;
        delivery.last_error = Some(error.clone());
        if delivery.attempt_count >= self.config.max_retries {
            return self.mark_failed(delivery, error).await;
        }
        let wait = backoff(delivery.attempt_count);
        delivery.next_retry_at = OffsetDateTime::now_utc() + wait;
        self.store
            .update_delivery(&delivery)
            .await
            .map_err(|e| anyhow!(e))?;
        tracing::warn!(
            delivery_id = delivery.id,
            url = %webhook.url,
            attempts = delivery.attempt_count,
            retry_in = ?wait,
            error = %error,
            "webhook attempt failed"
        );
        self.schedule_requeue(delivery.id, wait);
        Ok(())
    }

    async fn mark_failed(&self, mut delivery: Delivery, error: String) -> Result<()> {
        delivery.status = DeliveryStatus::Failed;
        delivery.last_error = Some(error.clone());
        self.store
            .update_delivery(&delivery)
            .await
            .map_err(|e| anyhow!(e))?;
        metrics::counter!("delivery_failure_total").increment(1);
        tracing::warn!(
            delivery_id = delivery.id,
            attempts = delivery.attempt_count,
            error = %error,
            "webhook delivery abandoned"
        );
        self.publish_result(&delivery, false, Some(error)).await;
        Ok(())
    }

    async fn publish_result(&self, delivery: &Delivery, success: bool, error: Option<String>) {
        let result = DeliveryResult {
            delivery_id: delivery.id,
            success,
            error,
        };
        if let Err(err) = self.queue.publish_result(&result).await {
            tracing::debug!(error = %err, "delivery result publish failed");
        }
    }

    fn schedule_requeue(&self, delivery_id: i64, wait: Duration) {
        let queue = Arc::clone(&self.queue);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    if let Err(err) = queue.enqueue(delivery_id).await {
                        tracing::warn!(delivery_id, error = %err, "delayed requeue failed");
                    }
                }
            }
        });
    }
}

/// Re-enqueues every pending delivery already due. Run at deliverer start
/// so attempts abandoned by a previous process resume.
pub async fn requeue_due(
    store: &SharedStore,
    queue: &SharedJobQueue,
    now: OffsetDateTime,
) -> Result<usize> {
    let due = store
        .pending_deliveries(now)
        .await
        .map_err(|e| anyhow!(e))?;
    let count = due.len();
    for delivery in due {
        queue
            .enqueue(delivery.id)
            .await
            .map_err(|e| anyhow!(e))?;
    }
    if count > 0 {
        tracing::info!(count, "requeued due deliveries");
    }
    Ok(count)
}

/// Derives which update field produced the message; the raw envelope keeps
/// that information.
fn event_kind_of(message: &Message) -> EventKind {
    serde_json::from_value::<TelegramUpdate>(message.raw.clone())
        .ok()
        .and_then(|update| extract_event(&update).map(|(kind, _)| kind))
        .unwrap_or(EventKind::NewMessage)
}

async fn read_limited(response: reqwest::Response, cap: usize) -> String {
    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        let remaining = cap.saturating_sub(buf.len());
        if remaining == 0 {
            break;
        }
        let take = chunk.len().min(remaining);
        buf.extend_from_slice(&chunk[..take]);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn truncate_for_record(body: &str) -> &str {
    match body.char_indices().nth(512) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botgate_bus::InMemoryJobQueue;
    use botgate_core::{Direction, MessageKind, NewMessage, TelegramChat, WebhookScope};
    use botgate_store::{GatewayStore, MemoryStore, NewBot, NewWebhook};
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    struct Fixture {
        store: SharedStore,
        queue: Arc<InMemoryJobQueue>,
        delivery_id: i64,
        secret: String,
    }

    async fn fixture(url: &str) -> Fixture {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let bot = store
            .insert_bot(NewBot {
                username: "bot".into(),
                api_token: "t".into(),
                webhook_url: "https://gw.test".into(),
                webhook_secret: "ab".repeat(32),
            })
            .await
            .unwrap();
        let tg: TelegramChat = serde_json::from_value(json!({"id": -42})).unwrap();
        let chat = store.upsert_chat(bot.id, &tg).await.unwrap();
        let message = store
            .insert_message(NewMessage {
                chat_id: chat.id,
                telegram_id: 100,
                direction: Direction::Incoming,
                kind: MessageKind::Text,
                text: "hi".into(),
                reply_to_telegram_id: None,
                sent_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
                raw: json!({"update_id": 1, "message": {"message_id": 100, "date": 1_700_000_000, "chat": {"id": -42}, "text": "hi"}}),
            })
            .await
            .unwrap();
        let secret = "hook-secret".to_string();
        let webhook = store
            .insert_webhook(NewWebhook {
                url: format!("{url}/hook"),
                secret: secret.clone(),
                scope: WebhookScope::Chat,
                chat_id: None,
                reply_to_telegram_id: None,
                active: true,
            })
            .await
            .unwrap();
        let delivery = store
            .create_delivery(webhook.id, message.id, OffsetDateTime::now_utc())
            .await
            .unwrap();
        Fixture {
            store,
            queue: Arc::new(InMemoryJobQueue::new()),
            delivery_id: delivery.id,
            secret,
        }
    }

    fn pool(fixture: &Fixture, config: WorkerConfig) -> WorkerPool {
        WorkerPool::new(
            Arc::clone(&fixture.store),
            fixture.queue.clone(),
            config,
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn success_marks_delivered_and_signs_the_body() {
        let server = MockServer::start().await;
        let fixture = fixture(&server.uri()).await;
        let secret = fixture.secret.clone();
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .respond_with(move |req: &Request| {
                let signature = req
                    .headers
                    .get("x-webhook-signature")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                assert!(crate::signer::verify(&secret, &req.body, signature));
                let payload: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                assert_eq!(payload["event"], "new_message");
                assert_eq!(payload["telegram_id"], 100);
                ResponseTemplate::new(200)
            })
            .expect(1)
            .mount(&server)
            .await;

        let pool = pool(&fixture, WorkerConfig::default());
        pool.process_delivery(fixture.delivery_id).await.unwrap();

        let delivery = fixture
            .store
            .delivery(fixture.delivery_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Delivered);
        assert_eq!(delivery.attempt_count, 1);
        assert!(delivery.delivered_at.is_some());

        let results = fixture.queue.take_results().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
    }

    #[tokio::test]
    async fn failures_backoff_then_succeed() {
        let server = MockServer::start().await;
        let fixture = fixture(&server.uri()).await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let pool = pool(&fixture, WorkerConfig::default());
        let mut retry_gaps = Vec::new();
        for _ in 0..3 {
            let before = OffsetDateTime::now_utc();
            pool.process_delivery(fixture.delivery_id).await.unwrap();
            let delivery = fixture
                .store
                .delivery(fixture.delivery_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(delivery.status, DeliveryStatus::Pending);
            assert!(delivery.last_error.as_deref().unwrap_or("").contains("500"));
            retry_gaps.push(delivery.next_retry_at - before);
        }
        let delivery = fixture
            .store
            .delivery(fixture.delivery_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.attempt_count, 3);

        // Gaps follow the schedule: ~1s, ~10s, ~60s.
        for (gap, expected) in retry_gaps.iter().zip([1i64, 10, 60]) {
            assert!(gap.whole_seconds() >= expected - 1 && gap.whole_seconds() <= expected + 2);
        }

        pool.process_delivery(fixture.delivery_id).await.unwrap();
        let delivery = fixture
            .store
            .delivery(fixture.delivery_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Delivered);
        assert_eq!(delivery.attempt_count, 4);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_marks_failed() {
        let server = MockServer::start().await;
        let fixture = fixture(&server.uri()).await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let config = WorkerConfig {
            max_retries: 2,
            ..WorkerConfig::default()
        };
        let pool = pool(&fixture, config);
        pool.process_delivery(fixture.delivery_id).await.unwrap();
        pool.process_delivery(fixture.delivery_id).await.unwrap();

        let delivery = fixture
            .store
            .delivery(fixture.delivery_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert_eq!(delivery.attempt_count, 2);

        let results = fixture.queue.take_results().await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].error.is_some());
    }

    #[tokio::test]
    async fn open_breaker_reschedules_without_dialing() {
        let server = MockServer::start().await;
        let fixture = fixture(&server.uri()).await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .expect(5)
            .mount(&server)
            .await;

        let config = WorkerConfig {
            max_retries: 100,
            breaker: BreakerSettings {
                failure_threshold: 5,
                reset_timeout: Duration::from_secs(60),
            },
            ..WorkerConfig::default()
        };
        let pool = pool(&fixture, config);
        // Five attempts dial and fail; the breaker opens.
        for _ in 0..5 {
            pool.process_delivery(fixture.delivery_id).await.unwrap();
        }
        let after_five = fixture
            .store
            .delivery(fixture.delivery_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after_five.attempt_count, 5);

        // The sixth finds the breaker open: no dial, no attempt increment.
        pool.process_delivery(fixture.delivery_id).await.unwrap();
        let after_six = fixture
            .store
            .delivery(fixture.delivery_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after_six.attempt_count, 5);
        assert_eq!(after_six.status, DeliveryStatus::Pending);
        server.verify().await;
    }

    #[tokio::test]
    async fn half_open_probe_closes_on_success() {
        let server = MockServer::start().await;
        let fixture = fixture(&server.uri()).await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = WorkerConfig {
            max_retries: 100,
            breaker: BreakerSettings {
                failure_threshold: 2,
                reset_timeout: Duration::from_millis(50),
            },
            ..WorkerConfig::default()
        };
        let pool = pool(&fixture, config);
        pool.process_delivery(fixture.delivery_id).await.unwrap();
        pool.process_delivery(fixture.delivery_id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        // Probe admitted, upstream healthy again: delivered.
        pool.process_delivery(fixture.delivery_id).await.unwrap();
        let delivery = fixture
            .store
            .delivery(fixture.delivery_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn requeue_due_scans_pending_rows() {
        let server = MockServer::start().await;
        let fixture = fixture(&server.uri()).await;
        let queue: SharedJobQueue = fixture.queue.clone();
        let count = requeue_due(&fixture.store, &queue, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(count, 1);
        let popped = fixture
            .queue
            .dequeue(Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(popped, Some(fixture.delivery_id));
    }
}
