use std::collections::BTreeMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Message direction relative to Telegram.
///
/// ```
/// use botgate_core::Direction;
///
/// assert_eq!(Direction::Incoming.as_str(), "incoming");
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

/// Descriptive content tag derived from the Telegram payload. The raw
/// envelope is stored verbatim; this tag only drives filtering and display.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Photo => "photo",
            MessageKind::Video => "video",
            MessageKind::Document => "document",
            MessageKind::Audio => "audio",
            MessageKind::Voice => "voice",
            MessageKind::Sticker => "sticker",
        }
    }
}

/// Which Telegram update field produced an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewMessage,
    EditedMessage,
    ChannelPost,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NewMessage => "new_message",
            EventKind::EditedMessage => "edited_message",
            EventKind::ChannelPost => "channel_post",
        }
    }
}

/// Chat-level action checked by the ACL evaluator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Send,
    Manage,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Send => "send",
            Action::Manage => "manage",
        }
    }
}

/// Authenticated identity for one request. Carries no mutable state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Principal {
    User {
        id: i64,
        username: String,
        roles: Vec<String>,
    },
    Key {
        id: i64,
    },
}

impl Principal {
    pub fn kind(&self) -> &'static str {
        match self {
            Principal::User { .. } => "user",
            Principal::Key { .. } => "key",
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Principal::User { id, .. } | Principal::Key { id } => *id,
        }
    }
}

/// A registered Telegram bot. The webhook secret is the sole authenticator
/// of inbound updates: whoever knows the path owns the bot's ingest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bot {
    pub id: i64,
    pub username: String,
    /// Outbound Bot API token, opaque at this layer.
    #[serde(skip_serializing)]
    pub api_token: String,
    pub webhook_url: String,
    #[serde(skip_serializing)]
    pub webhook_secret: String,
}

/// Generates a fresh 64-hex-char webhook secret from 32 random bytes.
///
/// ```
/// let secret = botgate_core::generate_webhook_secret();
/// assert_eq!(secret.len(), 64);
/// assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
/// ```
pub fn generate_webhook_secret() -> String {
    let mut buf = [0u8; 32];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// A chat known to a bot, created on first ingest. `(bot_id, telegram_id)`
/// is unique; the internal id is what subscribers and topics use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Chat {
    pub id: i64,
    pub bot_id: i64,
    pub telegram_id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

/// A persisted message. Append-only; ordering within a chat is
/// `(sent_at desc, id desc)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub telegram_id: i64,
    pub direction: Direction,
    pub kind: MessageKind,
    pub text: String,
    #[serde(default)]
    pub reply_to_telegram_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Full Telegram envelope as received, stored verbatim.
    #[serde(default)]
    pub raw: Value,
}

/// Fields the caller provides when appending a message; ids and
/// `created_at` are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: i64,
    pub telegram_id: i64,
    pub direction: Direction,
    pub kind: MessageKind,
    pub text: String,
    pub reply_to_telegram_id: Option<i64>,
    pub sent_at: OffsetDateTime,
    pub raw: Value,
}

/// Chat-level grant for one principal. Absent row means deny.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatPermission {
    pub chat_id: i64,
    pub principal_kind: String,
    pub principal_id: i64,
    pub can_read: bool,
    pub can_send: bool,
    pub can_manage: bool,
}

impl ChatPermission {
    pub fn allows(&self, action: Action) -> bool {
        match action {
            Action::Read => self.can_read,
            Action::Send => self.can_send,
            Action::Manage => self.can_manage,
        }
    }
}

/// Stored half of an opaque API key credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiKey {
    pub id: i64,
    /// Hex SHA-256 of the full presented key string.
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub active: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
}

/// If any rows exist for a key, the key may only send through listed bots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyBotRestriction {
    pub key_id: i64,
    pub bot_id: i64,
    pub can_send: bool,
}

/// If any rows exist for a key, only listed chats may flow back to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyFeedbackRestriction {
    pub key_id: i64,
    pub chat_id: i64,
}

/// What a webhook subscription matches on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WebhookScope {
    Chat,
    Reply,
}

/// An outbound HTTP subscriber with at-least-once delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Webhook {
    pub id: i64,
    pub url: String,
    /// HMAC-SHA256 signing secret for `X-Webhook-Signature`.
    #[serde(skip_serializing)]
    pub secret: String,
    pub scope: WebhookScope,
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub reply_to_telegram_id: Option<i64>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// Persistent unit of work for one outbound webhook POST.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delivery {
    pub id: i64,
    pub webhook_id: i64,
    pub message_id: i64,
    pub attempt_count: u32,
    pub status: DeliveryStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub next_retry_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub delivered_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// In-flight event published on a chat topic. Lives only in memory and on
/// the bus; durable state is the message row it points at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub chat_id: i64,
    pub message_id: i64,
    pub bot_id: i64,
    pub telegram_id: i64,
    pub direction: Direction,
    pub message_type: MessageKind,
    pub text: String,
    #[serde(default)]
    pub from_username: Option<String>,
    #[serde(default)]
    pub from_first_name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Event {
    /// Projects an event from a persisted message plus its chat. Sender
    /// metadata comes from the verbatim envelope, wherever the routed
    /// update field put it.
    pub fn from_message(kind: EventKind, chat: &Chat, message: &Message) -> Self {
        Self {
            kind,
            chat_id: chat.id,
            message_id: message.id,
            bot_id: chat.bot_id,
            telegram_id: message.telegram_id,
            direction: message.direction,
            message_type: message.kind,
            text: message.text.clone(),
            from_username: sender_field(&message.raw, "username"),
            from_first_name: sender_field(&message.raw, "first_name"),
            sent_at: message.sent_at,
            extra: BTreeMap::new(),
        }
    }
}

fn sender_field(raw: &Value, field: &str) -> Option<String> {
    ["/message", "/edited_message", "/channel_post", ""]
        .iter()
        .find_map(|container| {
            raw.pointer(&format!("{container}/from/{field}"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event {
            kind: EventKind::NewMessage,
            chat_id: 7,
            message_id: 1,
            bot_id: 2,
            telegram_id: 100,
            direction: Direction::Incoming,
            message_type: MessageKind::Text,
            text: "hi".into(),
            from_username: None,
            from_first_name: None,
            sent_at: datetime!(2023-11-14 22:13:20 UTC),
            extra: BTreeMap::new(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "new_message");
        assert_eq!(value["chat_id"], 7);
        assert_eq!(value["telegram_id"], 100);
        assert_eq!(value["message_type"], "text");
        assert_eq!(value["sent_at"], "2023-11-14T22:13:20Z");
    }

    #[test]
    fn event_projects_sender_from_raw() {
        let chat = Chat {
            id: 3,
            bot_id: 9,
            telegram_id: -42,
            ..Default::default()
        };
        let message = Message {
            id: 11,
            chat_id: 3,
            telegram_id: 100,
            direction: Direction::Incoming,
            kind: MessageKind::Text,
            text: "hello".into(),
            reply_to_telegram_id: None,
            sent_at: datetime!(2023-11-14 22:13:20 UTC),
            created_at: datetime!(2023-11-14 22:13:21 UTC),
            raw: json!({"from": {"username": "alice", "first_name": "Alice"}}),
        };
        let event = Event::from_message(EventKind::NewMessage, &chat, &message);
        assert_eq!(event.bot_id, 9);
        assert_eq!(event.from_username.as_deref(), Some("alice"));
        assert_eq!(event.from_first_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn permission_maps_actions() {
        let perm = ChatPermission {
            chat_id: 1,
            principal_kind: "user".into(),
            principal_id: 5,
            can_read: true,
            can_send: false,
            can_manage: false,
        };
        assert!(perm.allows(Action::Read));
        assert!(!perm.allows(Action::Send));
        assert!(!perm.allows(Action::Manage));
    }

    #[test]
    fn secrets_are_distinct() {
        assert_ne!(generate_webhook_secret(), generate_webhook_secret());
    }
}
