//! Persistence seam for the gateway. The trait expresses the entities and
//! invariants the core relies on; backends are swappable (tests use the
//! in-memory store, deployments the SQLite one).

mod memory;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use botgate_core::{
    ApiKey, Bot, Chat, ChatPermission, Delivery, KeyBotRestriction, KeyFeedbackRestriction,
    Message, NewMessage, TelegramChat, Webhook, WebhookScope,
};
use time::OffsetDateTime;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type SharedStore = Arc<dyn GatewayStore>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Insert-side view of a bot; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewBot {
    pub username: String,
    pub api_token: String,
    pub webhook_url: String,
    pub webhook_secret: String,
}

/// Insert-side view of a webhook subscription.
#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub url: String,
    pub secret: String,
    pub scope: WebhookScope,
    pub chat_id: Option<i64>,
    pub reply_to_telegram_id: Option<i64>,
    pub active: bool,
}

#[async_trait]
pub trait GatewayStore: Send + Sync {
    // Bots. Webhook secret lookup is the ingest hot path; both backends
    // resolve it in O(1) (hash map / unique index).
    async fn insert_bot(&self, bot: NewBot) -> Result<Bot, StoreError>;
    async fn bot(&self, id: i64) -> Result<Option<Bot>, StoreError>;
    async fn bot_by_webhook_secret(&self, secret: &str) -> Result<Option<Bot>, StoreError>;

    // Chats: created on first ingest, refreshed on later ones.
    async fn upsert_chat(&self, bot_id: i64, chat: &TelegramChat) -> Result<Chat, StoreError>;
    async fn chat(&self, id: i64) -> Result<Option<Chat>, StoreError>;

    // Messages: append-only, reverse-chronological cursor reads.
    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError>;
    async fn message(&self, id: i64) -> Result<Option<Message>, StoreError>;
    async fn list_messages(
        &self,
        chat_id: i64,
        before: Option<OffsetDateTime>,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError>;
    async fn delete_messages_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError>;

    // Chat-level ACL rows. Absent row means deny.
    async fn chat_permission(
        &self,
        chat_id: i64,
        principal_kind: &str,
        principal_id: i64,
    ) -> Result<Option<ChatPermission>, StoreError>;
    async fn upsert_chat_permission(&self, permission: ChatPermission) -> Result<(), StoreError>;

    // API keys and their optional allowlists.
    async fn insert_api_key(
        &self,
        key_hash: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> Result<ApiKey, StoreError>;
    async fn api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError>;
    async fn touch_api_key(&self, key_id: i64, at: OffsetDateTime) -> Result<(), StoreError>;
    async fn key_bot_restrictions(
        &self,
        key_id: i64,
    ) -> Result<Vec<KeyBotRestriction>, StoreError>;
    async fn insert_key_bot_restriction(
        &self,
        restriction: KeyBotRestriction,
    ) -> Result<(), StoreError>;
    async fn key_feedback_restrictions(
        &self,
        key_id: i64,
    ) -> Result<Vec<KeyFeedbackRestriction>, StoreError>;
    async fn insert_key_feedback_restriction(
        &self,
        restriction: KeyFeedbackRestriction,
    ) -> Result<(), StoreError>;

    // Webhook subscriptions.
    async fn insert_webhook(&self, webhook: NewWebhook) -> Result<Webhook, StoreError>;
    async fn webhook(&self, id: i64) -> Result<Option<Webhook>, StoreError>;
    async fn list_webhooks(&self) -> Result<Vec<Webhook>, StoreError>;
    async fn delete_webhook(&self, id: i64) -> Result<bool, StoreError>;
    /// Active webhooks whose scope matches a freshly persisted message.
    async fn webhooks_for_message(
        &self,
        chat_id: i64,
        reply_to_telegram_id: Option<i64>,
    ) -> Result<Vec<Webhook>, StoreError>;

    // Delivery records.
    async fn create_delivery(
        &self,
        webhook_id: i64,
        message_id: i64,
        next_retry_at: OffsetDateTime,
    ) -> Result<Delivery, StoreError>;
    async fn delivery(&self, id: i64) -> Result<Option<Delivery>, StoreError>;
    async fn update_delivery(&self, delivery: &Delivery) -> Result<(), StoreError>;
    /// Work set for the restart scan: `pending` rows due at or before `now`.
    async fn pending_deliveries(&self, now: OffsetDateTime) -> Result<Vec<Delivery>, StoreError>;
}

/// Scope/chat matching shared by both backends.
pub(crate) fn webhook_matches(
    webhook: &Webhook,
    chat_id: i64,
    reply_to_telegram_id: Option<i64>,
) -> bool {
    if !webhook.active {
        return false;
    }
    let chat_ok = webhook.chat_id.is_none_or(|c| c == chat_id);
    match webhook.scope {
        WebhookScope::Chat => chat_ok,
        WebhookScope::Reply => {
            chat_ok
                && webhook.reply_to_telegram_id.is_some()
                && webhook.reply_to_telegram_id == reply_to_telegram_id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webhook(scope: WebhookScope, chat_id: Option<i64>, reply: Option<i64>) -> Webhook {
        Webhook {
            id: 1,
            url: "https://example.test/hook".into(),
            secret: "s".into(),
            scope,
            chat_id,
            reply_to_telegram_id: reply,
            active: true,
        }
    }

    #[test]
    fn chat_scope_matches_by_chat() {
        let wh = webhook(WebhookScope::Chat, Some(7), None);
        assert!(webhook_matches(&wh, 7, None));
        assert!(!webhook_matches(&wh, 8, None));
    }

    #[test]
    fn chat_scope_without_chat_matches_all() {
        let wh = webhook(WebhookScope::Chat, None, None);
        assert!(webhook_matches(&wh, 1, None));
        assert!(webhook_matches(&wh, 2, Some(5)));
    }

    #[test]
    fn reply_scope_requires_the_pair() {
        let wh = webhook(WebhookScope::Reply, Some(7), Some(100));
        assert!(webhook_matches(&wh, 7, Some(100)));
        assert!(!webhook_matches(&wh, 7, Some(101)));
        assert!(!webhook_matches(&wh, 7, None));
        assert!(!webhook_matches(&wh, 8, Some(100)));
    }

    #[test]
    fn inactive_never_matches() {
        let mut wh = webhook(WebhookScope::Chat, None, None);
        wh.active = false;
        assert!(!webhook_matches(&wh, 1, None));
    }
}
