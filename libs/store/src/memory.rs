use std::collections::HashMap;

use async_trait::async_trait;
use botgate_core::{
    ApiKey, Bot, Chat, ChatPermission, Delivery, DeliveryStatus, KeyBotRestriction,
    KeyFeedbackRestriction, Message, NewMessage, TelegramChat, Webhook,
};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::{webhook_matches, GatewayStore, NewBot, NewWebhook, StoreError};

/// In-memory backend. The default for tests and single-process dev runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    bots: HashMap<i64, Bot>,
    chats: HashMap<i64, Chat>,
    messages: Vec<Message>,
    permissions: HashMap<(i64, String, i64), ChatPermission>,
    api_keys: HashMap<i64, ApiKey>,
    bot_restrictions: Vec<KeyBotRestriction>,
    feedback_restrictions: Vec<KeyFeedbackRestriction>,
    webhooks: HashMap<i64, Webhook>,
    deliveries: HashMap<i64, Delivery>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn insert_bot(&self, bot: NewBot) -> Result<Bot, StoreError> {
        let mut inner = self.inner.write().await;
        if inner
            .bots
            .values()
            .any(|b| b.webhook_secret == bot.webhook_secret)
        {
            return Err(StoreError::Conflict("webhook secret already in use".into()));
        }
        if inner.bots.values().any(|b| b.username == bot.username) {
            return Err(StoreError::Conflict(format!(
                "bot username {} already registered",
                bot.username
            )));
        }
        let id = inner.next_id();
        let bot = Bot {
            id,
            username: bot.username,
            api_token: bot.api_token,
            webhook_url: bot.webhook_url,
            webhook_secret: bot.webhook_secret,
        };
        inner.bots.insert(id, bot.clone());
        Ok(bot)
    }

    async fn bot(&self, id: i64) -> Result<Option<Bot>, StoreError> {
        Ok(self.inner.read().await.bots.get(&id).cloned())
    }

    async fn bot_by_webhook_secret(&self, secret: &str) -> Result<Option<Bot>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .bots
            .values()
            .find(|b| b.webhook_secret == secret)
            .cloned())
    }

    async fn upsert_chat(&self, bot_id: i64, chat: &TelegramChat) -> Result<Chat, StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner
            .chats
            .values_mut()
            .find(|c| c.bot_id == bot_id && c.telegram_id == chat.id)
        {
            existing.title = chat.title.clone();
            existing.username = chat.username.clone();
            existing.first_name = chat.first_name.clone();
            existing.last_name = chat.last_name.clone();
            return Ok(existing.clone());
        }
        let id = inner.next_id();
        let row = Chat {
            id,
            bot_id,
            telegram_id: chat.id,
            title: chat.title.clone(),
            username: chat.username.clone(),
            first_name: chat.first_name.clone(),
            last_name: chat.last_name.clone(),
        };
        inner.chats.insert(id, row.clone());
        Ok(row)
    }

    async fn chat(&self, id: i64) -> Result<Option<Chat>, StoreError> {
        Ok(self.inner.read().await.chats.get(&id).cloned())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.chats.contains_key(&message.chat_id) {
            return Err(StoreError::NotFound(format!("chat {}", message.chat_id)));
        }
        let id = inner.next_id();
        let row = Message {
            id,
            chat_id: message.chat_id,
            telegram_id: message.telegram_id,
            direction: message.direction,
            kind: message.kind,
            text: message.text,
            reply_to_telegram_id: message.reply_to_telegram_id,
            sent_at: message.sent_at,
            created_at: OffsetDateTime::now_utc(),
            raw: message.raw,
        };
        inner.messages.push(row.clone());
        Ok(row)
    }

    async fn message(&self, id: i64) -> Result<Option<Message>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }

    async fn list_messages(
        &self,
        chat_id: i64,
        before: Option<OffsetDateTime>,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .filter(|m| before.is_none_or(|cursor| m.sent_at < cursor))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.sent_at.cmp(&a.sent_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn delete_messages_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.messages.len();
        inner.messages.retain(|m| m.sent_at >= cutoff);
        Ok((before - inner.messages.len()) as u64)
    }

    async fn chat_permission(
        &self,
        chat_id: i64,
        principal_kind: &str,
        principal_id: i64,
    ) -> Result<Option<ChatPermission>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .permissions
            .get(&(chat_id, principal_kind.to_string(), principal_id))
            .cloned())
    }

    async fn upsert_chat_permission(&self, permission: ChatPermission) -> Result<(), StoreError> {
        let key = (
            permission.chat_id,
            permission.principal_kind.clone(),
            permission.principal_id,
        );
        self.inner.write().await.permissions.insert(key, permission);
        Ok(())
    }

    async fn insert_api_key(
        &self,
        key_hash: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> Result<ApiKey, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.api_keys.values().any(|k| k.key_hash == key_hash) {
            return Err(StoreError::Conflict("key hash already present".into()));
        }
        let id = inner.next_id();
        let key = ApiKey {
            id,
            key_hash: key_hash.to_string(),
            active: true,
            expires_at,
            last_used_at: None,
        };
        inner.api_keys.insert(id, key.clone());
        Ok(key)
    }

    async fn api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .api_keys
            .values()
            .find(|k| k.key_hash == key_hash)
            .cloned())
    }

    async fn touch_api_key(&self, key_id: i64, at: OffsetDateTime) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let key = inner
            .api_keys
            .get_mut(&key_id)
            .ok_or_else(|| StoreError::NotFound(format!("api key {key_id}")))?;
        key.last_used_at = Some(at);
        Ok(())
    }

    async fn key_bot_restrictions(
        &self,
        key_id: i64,
    ) -> Result<Vec<KeyBotRestriction>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .bot_restrictions
            .iter()
            .filter(|r| r.key_id == key_id)
            .cloned()
            .collect())
    }

    async fn insert_key_bot_restriction(
        &self,
        restriction: KeyBotRestriction,
    ) -> Result<(), StoreError> {
        self.inner.write().await.bot_restrictions.push(restriction);
        Ok(())
    }

    async fn key_feedback_restrictions(
        &self,
        key_id: i64,
    ) -> Result<Vec<KeyFeedbackRestriction>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .feedback_restrictions
            .iter()
            .filter(|r| r.key_id == key_id)
            .cloned()
            .collect())
    }

    async fn insert_key_feedback_restriction(
        &self,
        restriction: KeyFeedbackRestriction,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .feedback_restrictions
            .push(restriction);
        Ok(())
    }

    async fn insert_webhook(&self, webhook: NewWebhook) -> Result<Webhook, StoreError> {
        let mut inner = self.inner.write().await;
        let id = inner.next_id();
        let row = Webhook {
            id,
            url: webhook.url,
            secret: webhook.secret,
            scope: webhook.scope,
            chat_id: webhook.chat_id,
            reply_to_telegram_id: webhook.reply_to_telegram_id,
            active: webhook.active,
        };
        inner.webhooks.insert(id, row.clone());
        Ok(row)
    }

    async fn webhook(&self, id: i64) -> Result<Option<Webhook>, StoreError> {
        Ok(self.inner.read().await.webhooks.get(&id).cloned())
    }

    async fn list_webhooks(&self) -> Result<Vec<Webhook>, StoreError> {
        let mut rows: Vec<Webhook> = self.inner.read().await.webhooks.values().cloned().collect();
        rows.sort_by_key(|w| w.id);
        Ok(rows)
    }

    async fn delete_webhook(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.inner.write().await.webhooks.remove(&id).is_some())
    }

    async fn webhooks_for_message(
        &self,
        chat_id: i64,
        reply_to_telegram_id: Option<i64>,
    ) -> Result<Vec<Webhook>, StoreError> {
        let mut rows: Vec<Webhook> = self
            .inner
            .read()
            .await
            .webhooks
            .values()
            .filter(|w| webhook_matches(w, chat_id, reply_to_telegram_id))
            .cloned()
            .collect();
        rows.sort_by_key(|w| w.id);
        Ok(rows)
    }

    async fn create_delivery(
        &self,
        webhook_id: i64,
        message_id: i64,
        next_retry_at: OffsetDateTime,
    ) -> Result<Delivery, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.webhooks.contains_key(&webhook_id) {
            return Err(StoreError::NotFound(format!("webhook {webhook_id}")));
        }
        let id = inner.next_id();
        let delivery = Delivery {
            id,
            webhook_id,
            message_id,
            attempt_count: 0,
            status: DeliveryStatus::Pending,
            next_retry_at,
            delivered_at: None,
            last_error: None,
        };
        inner.deliveries.insert(id, delivery.clone());
        Ok(delivery)
    }

    async fn delivery(&self, id: i64) -> Result<Option<Delivery>, StoreError> {
        Ok(self.inner.read().await.deliveries.get(&id).cloned())
    }

    async fn update_delivery(&self, delivery: &Delivery) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.deliveries.contains_key(&delivery.id) {
            return Err(StoreError::NotFound(format!("delivery {}", delivery.id)));
        }
        inner.deliveries.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn pending_deliveries(&self, now: OffsetDateTime) -> Result<Vec<Delivery>, StoreError> {
        let mut rows: Vec<Delivery> = self
            .inner
            .read()
            .await
            .deliveries
            .values()
            .filter(|d| d.status == DeliveryStatus::Pending && d.next_retry_at <= now)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.id);
        Ok(rows)
    }
}
