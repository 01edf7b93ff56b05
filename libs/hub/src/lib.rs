//! Subscriber hub: owns client connections, translates control frames into
//! broker subscriptions, and fans events out with backpressure against slow
//! clients.
//!
//! Each connected client runs two cooperative tasks in its transport
//! adapter: a reader feeding [`Hub::handle_control`] and an outbound pump
//! draining the client's bounded queue with [`WRITE_DEADLINE`] per write and
//! a [`KEEPALIVE_INTERVAL`] ping tick. The hub never blocks a publisher: a
//! full queue drops the frame for that client and evicts it.

mod client;
mod frames;

use std::{collections::HashMap, sync::Arc, time::Duration};

use botgate_auth::AclEvaluator;
use botgate_broker::Broker;
use botgate_core::{Action, Event};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub use client::{Client, Enqueue, SEND_QUEUE_CAPACITY};
pub use frames::{ControlFrame, ServerFrame};

/// Ping tick for the outbound pump; under the common 60 s idle timeouts of
/// intermediaries.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(54);

/// Upper bound for one frame write before the pump gives up on the client.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// One hub per process.
pub struct Hub {
    clients: RwLock<HashMap<Uuid, Arc<Client>>>,
    broker: Broker,
    acl: AclEvaluator,
}

impl Hub {
    /// Builds the hub and spawns the pump draining the broker's local tap
    /// into [`Hub::deliver_to_chat`].
    pub fn new(broker: Broker, tap: mpsc::UnboundedReceiver<Event>, acl: AclEvaluator) -> Arc<Self> {
        let hub = Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            broker,
            acl,
        });
        let pump = Arc::clone(&hub);
        tokio::spawn(async move {
            let mut tap = tap;
            while let Some(event) = tap.recv().await {
                pump.deliver_to_chat(event.chat_id, &event).await;
            }
            tracing::debug!("hub event tap closed");
        });
        hub
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub async fn register(&self, client: Arc<Client>) {
        let mut clients = self.clients.write().await;
        clients.insert(client.id(), client);
        tracing::info!(clients = clients.len(), "hub client registered");
    }

    /// Removes the client, closes its queue exactly once, and releases its
    /// broker references.
    pub async fn unregister(&self, id: Uuid) {
        let removed = {
            let mut clients = self.clients.write().await;
            let removed = clients.remove(&id);
            if removed.is_some() {
                tracing::info!(clients = clients.len(), "hub client unregistered");
            }
            removed
        };
        if let Some(client) = removed {
            client.close();
            for chat_id in client.take_chats() {
                self.broker.unsubscribe_chat(chat_id).await;
            }
        }
    }

    /// Closes every client queue and clears the registry.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Client>> = {
            let mut clients = self.clients.write().await;
            clients.drain().map(|(_, c)| c).collect()
        };
        for client in &drained {
            client.close();
            for chat_id in client.take_chats() {
                self.broker.unsubscribe_chat(chat_id).await;
            }
        }
        self.broker.shutdown().await;
        tracing::info!(clients = drained.len(), "hub shut down");
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Broadcast entry point: non-blocking enqueue to every subscribed
    /// client. A full queue is a subscriber-level failure — the frame is
    /// dropped for that client and the client is closed.
    pub async fn deliver_to_chat(self: &Arc<Self>, chat_id: i64, event: &Event) {
        let mut lossy = Vec::new();
        {
            let clients = self.clients.read().await;
            for client in clients.values() {
                if !client.subscribed_to(chat_id) {
                    continue;
                }
                match client.enqueue(ServerFrame::Event(event.clone())) {
                    Enqueue::Delivered | Enqueue::Closed => {}
                    Enqueue::Full => {
                        metrics::counter!("hub_slow_client_drops").increment(1);
                        tracing::warn!(
                            client_id = %client.id(),
                            chat_id,
                            "send queue full, evicting slow client"
                        );
                        lossy.push(client.id());
                    }
                }
            }
        }
        for id in lossy {
            self.unregister(id).await;
        }
    }

    /// Processes one inbound control frame. Replies go through the client's
    /// own send queue; decode errors answer with an error frame and keep the
    /// connection.
    pub async fn handle_control(self: &Arc<Self>, client: &Arc<Client>, text: &str) {
        let frame: ControlFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                client.enqueue(ServerFrame::error(format!("malformed control frame: {err}")));
                return;
            }
        };
        match frame.action.as_str() {
            "subscribe" => {
                let Some(chat_id) = frame.chat_id else {
                    client.enqueue(ServerFrame::error("subscribe requires chat_id"));
                    return;
                };
                match self
                    .acl
                    .authorize(client.principal(), chat_id, Action::Read)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        client.enqueue(ServerFrame::error("forbidden"));
                        return;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, chat_id, "subscribe authorization failed");
                        client.enqueue(ServerFrame::error("internal error"));
                        return;
                    }
                }
                if client.add_chat(chat_id) {
                    if let Err(err) = self.broker.subscribe_chat(chat_id).await {
                        tracing::error!(error = %err, chat_id, "chat topic subscription failed");
                        client.remove_chat(chat_id);
                        client.enqueue(ServerFrame::error("internal error"));
                        return;
                    }
                }
                client.enqueue(ServerFrame::ack("subscribe", chat_id));
            }
            "unsubscribe" => {
                let Some(chat_id) = frame.chat_id else {
                    client.enqueue(ServerFrame::error("unsubscribe requires chat_id"));
                    return;
                };
                if client.remove_chat(chat_id) {
                    self.broker.unsubscribe_chat(chat_id).await;
                }
                client.enqueue(ServerFrame::ack("unsubscribe", chat_id));
            }
            "ping" => {
                client.enqueue(ServerFrame::pong());
            }
            other => {
                client.enqueue(ServerFrame::error(format!("unknown action {other}")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botgate_bus::{InMemoryEventBus, InMemoryKvStore};
    use botgate_core::{
        ChatPermission, Direction, EventKind, MessageKind, Principal, TelegramChat,
    };
    use botgate_store::{GatewayStore, MemoryStore, NewBot, SharedStore};
    use std::collections::BTreeMap;
    use time::OffsetDateTime;

    async fn test_hub() -> (Arc<Hub>, SharedStore, i64) {
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
        let chat: TelegramChat = serde_json::from_str(r#"{"id": -42}"#).unwrap();
        let chat = store.upsert_chat(bot.id, &chat).await.unwrap();
        let store: SharedStore = store;
        let acl = AclEvaluator::new(Arc::clone(&store), Arc::new(InMemoryKvStore::new()));
        let (broker, tap) = Broker::new(Arc::new(InMemoryEventBus::new()));
        (Hub::new(broker, tap, acl), store, chat.id)
    }

    async fn grant_read(store: &SharedStore, chat_id: i64, user_id: i64) {
        store
            .upsert_chat_permission(ChatPermission {
                chat_id,
                principal_kind: "user".into(),
                principal_id: user_id,
                can_read: true,
                can_send: false,
                can_manage: false,
            })
            .await
            .unwrap();
    }

    fn principal(user_id: i64) -> Principal {
        Principal::User {
            id: user_id,
            username: "alice".into(),
            roles: Vec::new(),
        }
    }

    fn event(chat_id: i64, telegram_id: i64) -> Event {
        Event {
            kind: EventKind::NewMessage,
            chat_id,
            message_id: 1,
            bot_id: 1,
            telegram_id,
            direction: Direction::Incoming,
            message_type: MessageKind::Text,
            text: "hi".into(),
            from_username: None,
            from_first_name: None,
            sent_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            extra: BTreeMap::new(),
        }
    }

    async fn expect_frame(rx: &mut mpsc::Receiver<ServerFrame>) -> serde_json::Value {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame within deadline")
            .expect("queue open");
        serde_json::from_str(&frame.to_text()).unwrap()
    }

    #[tokio::test]
    async fn subscribe_requires_read_permission() {
        let (hub, store, chat_id) = test_hub().await;
        let (client, mut rx) = Client::new(principal(5));
        hub.register(Arc::clone(&client)).await;

        hub.handle_control(&client, &format!(r#"{{"action":"subscribe","chat_id":{chat_id}}}"#))
            .await;
        assert_eq!(expect_frame(&mut rx).await["type"], "error");

        grant_read(&store, chat_id, 5).await;
        hub.handle_control(&client, &format!(r#"{{"action":"subscribe","chat_id":{chat_id}}}"#))
            .await;
        let ack = expect_frame(&mut rx).await;
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["action"], "subscribe");
        assert_eq!(ack["chat_id"], chat_id);
    }

    #[tokio::test]
    async fn published_events_reach_subscribed_clients() {
        let (hub, store, chat_id) = test_hub().await;
        grant_read(&store, chat_id, 5).await;
        let (client, mut rx) = Client::new(principal(5));
        hub.register(Arc::clone(&client)).await;
        hub.handle_control(&client, &format!(r#"{{"action":"subscribe","chat_id":{chat_id}}}"#))
            .await;
        assert_eq!(expect_frame(&mut rx).await["type"], "ack");

        hub.broker().publish(&event(chat_id, 100)).await.unwrap();
        let frame = expect_frame(&mut rx).await;
        assert_eq!(frame["type"], "new_message");
        assert_eq!(frame["chat_id"], chat_id);
        assert_eq!(frame["telegram_id"], 100);
    }

    #[tokio::test]
    async fn ping_answers_pong_and_garbage_answers_error() {
        let (hub, _, _) = test_hub().await;
        let (client, mut rx) = Client::new(principal(5));
        hub.register(Arc::clone(&client)).await;

        hub.handle_control(&client, r#"{"action":"ping"}"#).await;
        assert_eq!(expect_frame(&mut rx).await["type"], "pong");

        hub.handle_control(&client, "not json").await;
        assert_eq!(expect_frame(&mut rx).await["type"], "error");
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_others_unaffected() {
        let (hub, store, chat_id) = test_hub().await;
        grant_read(&store, chat_id, 5).await;
        grant_read(&store, chat_id, 6).await;

        let (slow, mut slow_rx) = Client::new(principal(5));
        let (healthy, mut healthy_rx) = Client::new(principal(6));
        hub.register(Arc::clone(&slow)).await;
        hub.register(Arc::clone(&healthy)).await;
        for client in [&slow, &healthy] {
            hub.handle_control(client, &format!(r#"{{"action":"subscribe","chat_id":{chat_id}}}"#))
                .await;
        }
        assert_eq!(expect_frame(&mut slow_rx).await["type"], "ack");
        assert_eq!(expect_frame(&mut healthy_rx).await["type"], "ack");

        // The healthy client keeps draining; the slow one never reads.
        let drain = tokio::spawn(async move {
            let mut seen = 0usize;
            while healthy_rx.recv().await.is_some() {
                seen += 1;
            }
            seen
        });

        for i in 0..(2 * SEND_QUEUE_CAPACITY as i64) {
            hub.deliver_to_chat(chat_id, &event(chat_id, i)).await;
            // Let the draining task keep pace so only the stalled client
            // overflows.
            tokio::task::yield_now().await;
        }

        assert!(slow.is_closed());
        assert_eq!(hub.client_count().await, 1);

        hub.shutdown().await;
        let seen = drain.await.unwrap();
        assert_eq!(seen, 2 * SEND_QUEUE_CAPACITY);
        // The slow client got the queued prefix and nothing after eviction.
        let mut slow_seen = 0usize;
        while slow_rx.try_recv().is_ok() {
            slow_seen += 1;
        }
        assert!(slow_seen <= SEND_QUEUE_CAPACITY + 1);
    }

    #[tokio::test]
    async fn unregister_releases_broker_topics() {
        let (hub, store, chat_id) = test_hub().await;
        grant_read(&store, chat_id, 5).await;
        let (client, mut rx) = Client::new(principal(5));
        hub.register(Arc::clone(&client)).await;
        hub.handle_control(&client, &format!(r#"{{"action":"subscribe","chat_id":{chat_id}}}"#))
            .await;
        assert_eq!(expect_frame(&mut rx).await["type"], "ack");
        assert_eq!(hub.broker().topic_count().await, 1);

        hub.unregister(client.id()).await;
        assert_eq!(hub.broker().topic_count().await, 0);
        assert!(client.is_closed());
    }
}
