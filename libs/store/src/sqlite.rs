use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use botgate_core::{
    ApiKey, Bot, Chat, ChatPermission, Delivery, DeliveryStatus, Direction, KeyBotRestriction,
    KeyFeedbackRestriction, Message, MessageKind, NewMessage, TelegramChat, Webhook, WebhookScope,
};
use rusqlite::{params, Connection, Row};
use time::OffsetDateTime;
use tokio::{sync::Mutex, task::spawn_blocking};

use crate::{GatewayStore, NewBot, NewWebhook, StoreError};

const CREATE_SCHEMA_SQL: &str = r#"
PRAGMA foreign_keys = ON;
CREATE TABLE IF NOT EXISTS bots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    api_token TEXT NOT NULL,
    webhook_url TEXT NOT NULL,
    webhook_secret TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS chats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bot_id INTEGER NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
    telegram_id INTEGER NOT NULL,
    title TEXT,
    username TEXT,
    first_name TEXT,
    last_name TEXT,
    UNIQUE (bot_id, telegram_id)
);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
    telegram_id INTEGER NOT NULL,
    direction TEXT NOT NULL,
    kind TEXT NOT NULL,
    text TEXT NOT NULL,
    reply_to_telegram_id INTEGER,
    sent_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    raw TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_chat_sent ON messages (chat_id, sent_at DESC);
CREATE TABLE IF NOT EXISTS chat_permissions (
    chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
    principal_kind TEXT NOT NULL,
    principal_id INTEGER NOT NULL,
    can_read INTEGER NOT NULL,
    can_send INTEGER NOT NULL,
    can_manage INTEGER NOT NULL,
    PRIMARY KEY (chat_id, principal_kind, principal_id)
);
CREATE TABLE IF NOT EXISTS api_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key_hash TEXT NOT NULL UNIQUE,
    active INTEGER NOT NULL DEFAULT 1,
    expires_at INTEGER,
    last_used_at INTEGER
);
CREATE TABLE IF NOT EXISTS key_bot_restrictions (
    key_id INTEGER NOT NULL REFERENCES api_keys(id) ON DELETE CASCADE,
    bot_id INTEGER NOT NULL,
    can_send INTEGER NOT NULL,
    PRIMARY KEY (key_id, bot_id)
);
CREATE TABLE IF NOT EXISTS key_feedback_restrictions (
    key_id INTEGER NOT NULL REFERENCES api_keys(id) ON DELETE CASCADE,
    chat_id INTEGER NOT NULL,
    PRIMARY KEY (key_id, chat_id)
);
CREATE TABLE IF NOT EXISTS webhooks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    secret TEXT NOT NULL,
    scope TEXT NOT NULL,
    chat_id INTEGER,
    reply_to_telegram_id INTEGER,
    active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS deliveries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    webhook_id INTEGER NOT NULL REFERENCES webhooks(id) ON DELETE CASCADE,
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    next_retry_at INTEGER NOT NULL,
    delivered_at INTEGER,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_deliveries_pending ON deliveries (status, next_retry_at);
"#;

/// SQLite backend behind one mutex-guarded connection; every call hops to
/// the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(internal)?;
        conn.execute_batch(CREATE_SCHEMA_SQL).map_err(internal)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(internal)?;
        conn.execute_batch(CREATE_SCHEMA_SQL).map_err(internal)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, func: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || {
            let guard = conn.blocking_lock();
            func(&guard)
        })
        .await
        .map_err(|err| StoreError::Internal(err.into()))?
    }
}

fn internal(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(e, _) = &err {
        if e.code == rusqlite::ErrorCode::ConstraintViolation {
            return StoreError::Conflict(err.to_string());
        }
    }
    StoreError::Internal(err.into())
}

fn ts(dt: OffsetDateTime) -> i64 {
    dt.unix_timestamp_nanos() as i64
}

fn from_ts(ns: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ns as i128).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn parse_direction(raw: &str) -> Result<Direction, StoreError> {
    match raw {
        "incoming" => Ok(Direction::Incoming),
        "outgoing" => Ok(Direction::Outgoing),
        other => Err(StoreError::Internal(anyhow::anyhow!(
            "unknown direction {other}"
        ))),
    }
}

fn parse_kind(raw: &str) -> Result<MessageKind, StoreError> {
    match raw {
        "text" => Ok(MessageKind::Text),
        "photo" => Ok(MessageKind::Photo),
        "video" => Ok(MessageKind::Video),
        "document" => Ok(MessageKind::Document),
        "audio" => Ok(MessageKind::Audio),
        "voice" => Ok(MessageKind::Voice),
        "sticker" => Ok(MessageKind::Sticker),
        other => Err(StoreError::Internal(anyhow::anyhow!(
            "unknown message kind {other}"
        ))),
    }
}

fn parse_scope(raw: &str) -> Result<WebhookScope, StoreError> {
    match raw {
        "chat" => Ok(WebhookScope::Chat),
        "reply" => Ok(WebhookScope::Reply),
        other => Err(StoreError::Internal(anyhow::anyhow!(
            "unknown webhook scope {other}"
        ))),
    }
}

fn parse_status(raw: &str) -> Result<DeliveryStatus, StoreError> {
    match raw {
        "pending" => Ok(DeliveryStatus::Pending),
        "delivered" => Ok(DeliveryStatus::Delivered),
        "failed" => Ok(DeliveryStatus::Failed),
        other => Err(StoreError::Internal(anyhow::anyhow!(
            "unknown delivery status {other}"
        ))),
    }
}

fn bot_from_row(row: &Row<'_>) -> rusqlite::Result<Bot> {
    Ok(Bot {
        id: row.get(0)?,
        username: row.get(1)?,
        api_token: row.get(2)?,
        webhook_url: row.get(3)?,
        webhook_secret: row.get(4)?,
    })
}

fn chat_from_row(row: &Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        telegram_id: row.get(2)?,
        title: row.get(3)?,
        username: row.get(4)?,
        first_name: row.get(5)?,
        last_name: row.get(6)?,
    })
}

fn message_from_row(row: &Row<'_>) -> Result<Message, StoreError> {
    let direction: String = row.get(3).map_err(internal)?;
    let kind: String = row.get(4).map_err(internal)?;
    let raw: String = row.get(9).map_err(internal)?;
    Ok(Message {
        id: row.get(0).map_err(internal)?,
        chat_id: row.get(1).map_err(internal)?,
        telegram_id: row.get(2).map_err(internal)?,
        direction: parse_direction(&direction)?,
        kind: parse_kind(&kind)?,
        text: row.get(5).map_err(internal)?,
        reply_to_telegram_id: row.get(6).map_err(internal)?,
        sent_at: from_ts(row.get(7).map_err(internal)?),
        created_at: from_ts(row.get(8).map_err(internal)?),
        raw: serde_json::from_str(&raw).map_err(|e| StoreError::Internal(e.into()))?,
    })
}

fn webhook_from_row(row: &Row<'_>) -> Result<Webhook, StoreError> {
    let scope: String = row.get(3).map_err(internal)?;
    Ok(Webhook {
        id: row.get(0).map_err(internal)?,
        url: row.get(1).map_err(internal)?,
        secret: row.get(2).map_err(internal)?,
        scope: parse_scope(&scope)?,
        chat_id: row.get(4).map_err(internal)?,
        reply_to_telegram_id: row.get(5).map_err(internal)?,
        active: row.get::<_, i64>(6).map_err(internal)? != 0,
    })
}

fn delivery_from_row(row: &Row<'_>) -> Result<Delivery, StoreError> {
    let status: String = row.get(4).map_err(internal)?;
    Ok(Delivery {
        id: row.get(0).map_err(internal)?,
        webhook_id: row.get(1).map_err(internal)?,
        message_id: row.get(2).map_err(internal)?,
        attempt_count: row.get(3).map_err(internal)?,
        status: parse_status(&status)?,
        next_retry_at: from_ts(row.get(5).map_err(internal)?),
        delivered_at: row
            .get::<_, Option<i64>>(6)
            .map_err(internal)?
            .map(from_ts),
        last_error: row.get(7).map_err(internal)?,
    })
}

const BOT_COLUMNS: &str = "id, username, api_token, webhook_url, webhook_secret";
const CHAT_COLUMNS: &str = "id, bot_id, telegram_id, title, username, first_name, last_name";
const MESSAGE_COLUMNS: &str =
    "id, chat_id, telegram_id, direction, kind, text, reply_to_telegram_id, sent_at, created_at, raw";
const WEBHOOK_COLUMNS: &str = "id, url, secret, scope, chat_id, reply_to_telegram_id, active";
const DELIVERY_COLUMNS: &str =
    "id, webhook_id, message_id, attempt_count, status, next_retry_at, delivered_at, last_error";

#[async_trait]
impl GatewayStore for SqliteStore {
    async fn insert_bot(&self, bot: NewBot) -> Result<Bot, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO bots (username, api_token, webhook_url, webhook_secret)
                 VALUES (?1, ?2, ?3, ?4)",
                params![bot.username, bot.api_token, bot.webhook_url, bot.webhook_secret],
            )
            .map_err(internal)?;
            let id = conn.last_insert_rowid();
            Ok(Bot {
                id,
                username: bot.username,
                api_token: bot.api_token,
                webhook_url: bot.webhook_url,
                webhook_secret: bot.webhook_secret,
            })
        })
        .await
    }

    async fn bot(&self, id: i64) -> Result<Option<Bot>, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {BOT_COLUMNS} FROM bots WHERE id = ?1"),
                params![id],
                bot_from_row,
            )
            .map(Some)
            .or_else(none_on_missing)
        })
        .await
    }

    async fn bot_by_webhook_secret(&self, secret: &str) -> Result<Option<Bot>, StoreError> {
        let secret = secret.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {BOT_COLUMNS} FROM bots WHERE webhook_secret = ?1"),
                params![secret],
                bot_from_row,
            )
            .map(Some)
            .or_else(none_on_missing)
        })
        .await
    }

    async fn upsert_chat(&self, bot_id: i64, chat: &TelegramChat) -> Result<Chat, StoreError> {
        let chat = chat.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO chats (bot_id, telegram_id, title, username, first_name, last_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(bot_id, telegram_id) DO UPDATE SET
                   title = excluded.title,
                   username = excluded.username,
                   first_name = excluded.first_name,
                   last_name = excluded.last_name",
                params![
                    bot_id,
                    chat.id,
                    chat.title,
                    chat.username,
                    chat.first_name,
                    chat.last_name
                ],
            )
            .map_err(internal)?;
            conn.query_row(
                &format!(
                    "SELECT {CHAT_COLUMNS} FROM chats WHERE bot_id = ?1 AND telegram_id = ?2"
                ),
                params![bot_id, chat.id],
                chat_from_row,
            )
            .map_err(internal)
        })
        .await
    }

    async fn chat(&self, id: i64) -> Result<Option<Chat>, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
                params![id],
                chat_from_row,
            )
            .map(Some)
            .or_else(none_on_missing)
        })
        .await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        self.with_conn(move |conn| {
            let raw =
                serde_json::to_string(&message.raw).map_err(|e| StoreError::Internal(e.into()))?;
            let created_at = OffsetDateTime::now_utc();
            conn.execute(
                "INSERT INTO messages
                   (chat_id, telegram_id, direction, kind, text, reply_to_telegram_id, sent_at, created_at, raw)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    message.chat_id,
                    message.telegram_id,
                    message.direction.as_str(),
                    message.kind.as_str(),
                    message.text,
                    message.reply_to_telegram_id,
                    ts(message.sent_at),
                    ts(created_at),
                    raw
                ],
            )
            .map_err(|err| match err {
                rusqlite::Error::SqliteFailure(e, _)
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::NotFound(format!("chat {}", message.chat_id))
                }
                other => internal(other),
            })?;
            let id = conn.last_insert_rowid();
            Ok(Message {
                id,
                chat_id: message.chat_id,
                telegram_id: message.telegram_id,
                direction: message.direction,
                kind: message.kind,
                text: message.text,
                reply_to_telegram_id: message.reply_to_telegram_id,
                sent_at: message.sent_at,
                created_at,
                raw: message.raw,
            })
        })
        .await
    }

    async fn message(&self, id: i64) -> Result<Option<Message>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"
                ))
                .map_err(internal)?;
            let mut rows = stmt.query(params![id]).map_err(internal)?;
            match rows.next().map_err(internal)? {
                Some(row) => Ok(Some(message_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_messages(
        &self,
        chat_id: i64,
        before: Option<OffsetDateTime>,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let before = before.map(ts);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE chat_id = ?1 AND (?2 IS NULL OR sent_at < ?2)
                     ORDER BY sent_at DESC, id DESC
                     LIMIT ?3"
                ))
                .map_err(internal)?;
            let mut rows = stmt
                .query(params![chat_id, before, limit])
                .map_err(internal)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(internal)? {
                out.push(message_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }

    async fn delete_messages_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM messages WHERE sent_at < ?1",
                params![ts(cutoff)],
            )
            .map(|n| n as u64)
            .map_err(internal)
        })
        .await
    }

    async fn chat_permission(
        &self,
        chat_id: i64,
        principal_kind: &str,
        principal_id: i64,
    ) -> Result<Option<ChatPermission>, StoreError> {
        let kind = principal_kind.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT chat_id, principal_kind, principal_id, can_read, can_send, can_manage
                 FROM chat_permissions
                 WHERE chat_id = ?1 AND principal_kind = ?2 AND principal_id = ?3",
                params![chat_id, kind, principal_id],
                |row| {
                    Ok(ChatPermission {
                        chat_id: row.get(0)?,
                        principal_kind: row.get(1)?,
                        principal_id: row.get(2)?,
                        can_read: row.get::<_, i64>(3)? != 0,
                        can_send: row.get::<_, i64>(4)? != 0,
                        can_manage: row.get::<_, i64>(5)? != 0,
                    })
                },
            )
            .map(Some)
            .or_else(none_on_missing)
        })
        .await
    }

    async fn upsert_chat_permission(&self, permission: ChatPermission) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO chat_permissions
                   (chat_id, principal_kind, principal_id, can_read, can_send, can_manage)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(chat_id, principal_kind, principal_id) DO UPDATE SET
                   can_read = excluded.can_read,
                   can_send = excluded.can_send,
                   can_manage = excluded.can_manage",
                params![
                    permission.chat_id,
                    permission.principal_kind,
                    permission.principal_id,
                    permission.can_read as i64,
                    permission.can_send as i64,
                    permission.can_manage as i64
                ],
            )
            .map(|_| ())
            .map_err(internal)
        })
        .await
    }

    async fn insert_api_key(
        &self,
        key_hash: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> Result<ApiKey, StoreError> {
        let key_hash = key_hash.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO api_keys (key_hash, active, expires_at) VALUES (?1, 1, ?2)",
                params![key_hash, expires_at.map(ts)],
            )
            .map_err(internal)?;
            Ok(ApiKey {
                id: conn.last_insert_rowid(),
                key_hash,
                active: true,
                expires_at,
                last_used_at: None,
            })
        })
        .await
    }

    async fn api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError> {
        let key_hash = key_hash.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, key_hash, active, expires_at, last_used_at
                 FROM api_keys WHERE key_hash = ?1",
                params![key_hash],
                |row| {
                    Ok(ApiKey {
                        id: row.get(0)?,
                        key_hash: row.get(1)?,
                        active: row.get::<_, i64>(2)? != 0,
                        expires_at: row.get::<_, Option<i64>>(3)?.map(from_ts),
                        last_used_at: row.get::<_, Option<i64>>(4)?.map(from_ts),
                    })
                },
            )
            .map(Some)
            .or_else(none_on_missing)
        })
        .await
    }

    async fn touch_api_key(&self, key_id: i64, at: OffsetDateTime) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE api_keys SET last_used_at = ?2 WHERE id = ?1",
                    params![key_id, ts(at)],
                )
                .map_err(internal)?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("api key {key_id}")));
            }
            Ok(())
        })
        .await
    }

    async fn key_bot_restrictions(
        &self,
        key_id: i64,
    ) -> Result<Vec<KeyBotRestriction>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT key_id, bot_id, can_send FROM key_bot_restrictions WHERE key_id = ?1",
                )
                .map_err(internal)?;
            let rows = stmt
                .query_map(params![key_id], |row| {
                    Ok(KeyBotRestriction {
                        key_id: row.get(0)?,
                        bot_id: row.get(1)?,
                        can_send: row.get::<_, i64>(2)? != 0,
                    })
                })
                .map_err(internal)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(internal)
        })
        .await
    }

    async fn insert_key_bot_restriction(
        &self,
        restriction: KeyBotRestriction,
    ) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO key_bot_restrictions (key_id, bot_id, can_send)
                 VALUES (?1, ?2, ?3)",
                params![
                    restriction.key_id,
                    restriction.bot_id,
                    restriction.can_send as i64
                ],
            )
            .map(|_| ())
            .map_err(internal)
        })
        .await
    }

    async fn key_feedback_restrictions(
        &self,
        key_id: i64,
    ) -> Result<Vec<KeyFeedbackRestriction>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT key_id, chat_id FROM key_feedback_restrictions WHERE key_id = ?1",
                )
                .map_err(internal)?;
            let rows = stmt
                .query_map(params![key_id], |row| {
                    Ok(KeyFeedbackRestriction {
                        key_id: row.get(0)?,
                        chat_id: row.get(1)?,
                    })
                })
                .map_err(internal)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(internal)
        })
        .await
    }

    async fn insert_key_feedback_restriction(
        &self,
        restriction: KeyFeedbackRestriction,
    ) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO key_feedback_restrictions (key_id, chat_id)
                 VALUES (?1, ?2)",
                params![restriction.key_id, restriction.chat_id],
            )
            .map(|_| ())
            .map_err(internal)
        })
        .await
    }

    async fn insert_webhook(&self, webhook: NewWebhook) -> Result<Webhook, StoreError> {
        self.with_conn(move |conn| {
            let scope = match webhook.scope {
                WebhookScope::Chat => "chat",
                WebhookScope::Reply => "reply",
            };
            conn.execute(
                "INSERT INTO webhooks (url, secret, scope, chat_id, reply_to_telegram_id, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    webhook.url,
                    webhook.secret,
                    scope,
                    webhook.chat_id,
                    webhook.reply_to_telegram_id,
                    webhook.active as i64
                ],
            )
            .map_err(internal)?;
            Ok(Webhook {
                id: conn.last_insert_rowid(),
                url: webhook.url,
                secret: webhook.secret,
                scope: webhook.scope,
                chat_id: webhook.chat_id,
                reply_to_telegram_id: webhook.reply_to_telegram_id,
                active: webhook.active,
            })
        })
        .await
    }

    async fn webhook(&self, id: i64) -> Result<Option<Webhook>, StoreError> {
        self.with_conn(move |conn| {
            match conn.query_row(
                &format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = ?1"),
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            ) {
                Ok((id, url, secret, scope, chat_id, reply, active)) => Ok(Some(Webhook {
                    id,
                    url,
                    secret,
                    scope: parse_scope(&scope)?,
                    chat_id,
                    reply_to_telegram_id: reply,
                    active: active != 0,
                })),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(err) => Err(internal(err)),
            }
        })
        .await
    }

    async fn list_webhooks(&self) -> Result<Vec<Webhook>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {WEBHOOK_COLUMNS} FROM webhooks ORDER BY id"
                ))
                .map_err(internal)?;
            let mut rows = stmt.query([]).map_err(internal)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(internal)? {
                out.push(webhook_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }

    async fn delete_webhook(&self, id: i64) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM webhooks WHERE id = ?1", params![id])
                .map(|n| n > 0)
                .map_err(internal)
        })
        .await
    }

    async fn webhooks_for_message(
        &self,
        chat_id: i64,
        reply_to_telegram_id: Option<i64>,
    ) -> Result<Vec<Webhook>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {WEBHOOK_COLUMNS} FROM webhooks
                     WHERE active = 1 AND (chat_id IS NULL OR chat_id = ?1)
                       AND (scope = 'chat'
                            OR (scope = 'reply'
                                AND reply_to_telegram_id IS NOT NULL
                                AND reply_to_telegram_id = ?2))
                     ORDER BY id"
                ))
                .map_err(internal)?;
            let mut rows = stmt
                .query(params![chat_id, reply_to_telegram_id])
                .map_err(internal)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(internal)? {
                out.push(webhook_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }

    async fn create_delivery(
        &self,
        webhook_id: i64,
        message_id: i64,
        next_retry_at: OffsetDateTime,
    ) -> Result<Delivery, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO deliveries (webhook_id, message_id, attempt_count, status, next_retry_at)
                 VALUES (?1, ?2, 0, 'pending', ?3)",
                params![webhook_id, message_id, ts(next_retry_at)],
            )
            .map_err(internal)?;
            Ok(Delivery {
                id: conn.last_insert_rowid(),
                webhook_id,
                message_id,
                attempt_count: 0,
                status: DeliveryStatus::Pending,
                next_retry_at,
                delivered_at: None,
                last_error: None,
            })
        })
        .await
    }

    async fn delivery(&self, id: i64) -> Result<Option<Delivery>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE id = ?1"
                ))
                .map_err(internal)?;
            let mut rows = stmt.query(params![id]).map_err(internal)?;
            match rows.next().map_err(internal)? {
                Some(row) => Ok(Some(delivery_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn update_delivery(&self, delivery: &Delivery) -> Result<(), StoreError> {
        let delivery = delivery.clone();
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE deliveries SET
                       attempt_count = ?2, status = ?3, next_retry_at = ?4,
                       delivered_at = ?5, last_error = ?6
                     WHERE id = ?1",
                    params![
                        delivery.id,
                        delivery.attempt_count,
                        delivery.status.as_str(),
                        ts(delivery.next_retry_at),
                        delivery.delivered_at.map(ts),
                        delivery.last_error
                    ],
                )
                .map_err(internal)?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("delivery {}", delivery.id)));
            }
            Ok(())
        })
        .await
    }

    async fn pending_deliveries(&self, now: OffsetDateTime) -> Result<Vec<Delivery>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {DELIVERY_COLUMNS} FROM deliveries
                     WHERE status = 'pending' AND next_retry_at <= ?1
                     ORDER BY id"
                ))
                .map_err(internal)?;
            let mut rows = stmt.query(params![ts(now)]).map_err(internal)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(internal)? {
                out.push(delivery_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }
}

fn none_on_missing<T>(err: rusqlite::Error) -> Result<Option<T>, StoreError> {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(internal(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botgate_core::WebhookScope;
    use serde_json::json;
    use time::Duration;

    fn tg_chat(id: i64) -> TelegramChat {
        serde_json::from_value(json!({"id": id, "type": "group", "title": "room"})).unwrap()
    }

    async fn seeded() -> (SqliteStore, Bot, Chat) {
        let store = SqliteStore::open_in_memory().unwrap();
        let bot = store
            .insert_bot(NewBot {
                username: "helper_bot".into(),
                api_token: "token".into(),
                webhook_url: "https://gw.test/api/v1/telegram/webhook".into(),
                webhook_secret: "ab".repeat(32),
            })
            .await
            .unwrap();
        let chat = store.upsert_chat(bot.id, &tg_chat(-42)).await.unwrap();
        (store, bot, chat)
    }

    #[tokio::test]
    async fn persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .insert_bot(NewBot {
                    username: "persisted_bot".into(),
                    api_token: "t".into(),
                    webhook_url: "https://gw.test".into(),
                    webhook_secret: "cd".repeat(32),
                })
                .await
                .unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        let bot = reopened
            .bot_by_webhook_secret(&"cd".repeat(32))
            .await
            .unwrap();
        assert!(bot.is_some());
    }

    #[tokio::test]
    async fn duplicate_secret_is_a_conflict() {
        let (store, _, _) = seeded().await;
        let err = store
            .insert_bot(NewBot {
                username: "other_bot".into(),
                api_token: "t".into(),
                webhook_url: "https://gw.test".into(),
                webhook_secret: "ab".repeat(32),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn upsert_chat_refreshes_metadata() {
        let (store, bot, chat) = seeded().await;
        let mut renamed = tg_chat(-42);
        renamed.title = Some("renamed".into());
        let updated = store.upsert_chat(bot.id, &renamed).await.unwrap();
        assert_eq!(updated.id, chat.id);
        assert_eq!(updated.title.as_deref(), Some("renamed"));
    }

    #[tokio::test]
    async fn message_round_trip_and_cursor() {
        let (store, _, chat) = seeded().await;
        let t0 = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        for i in 0..5i64 {
            store
                .insert_message(NewMessage {
                    chat_id: chat.id,
                    telegram_id: 100 + i,
                    direction: Direction::Incoming,
                    kind: MessageKind::Text,
                    text: format!("m{i}"),
                    reply_to_telegram_id: (i == 2).then_some(100),
                    sent_at: t0 + Duration::seconds(i),
                    raw: json!({"text": format!("m{i}")}),
                })
                .await
                .unwrap();
        }
        let page = store.list_messages(chat.id, None, 2).await.unwrap();
        assert_eq!(page[0].telegram_id, 104);
        assert_eq!(page[1].telegram_id, 103);
        assert_eq!(page[0].raw["text"], "m4");

        let next = store
            .list_messages(chat.id, Some(page[1].sent_at), 2)
            .await
            .unwrap();
        assert_eq!(next[0].telegram_id, 102);
        assert_eq!(next[0].reply_to_telegram_id, Some(100));
    }

    #[tokio::test]
    async fn webhook_match_query_honours_scope() {
        let (store, _, chat) = seeded().await;
        let chat_scoped = store
            .insert_webhook(NewWebhook {
                url: "https://a.test".into(),
                secret: "s".into(),
                scope: WebhookScope::Chat,
                chat_id: Some(chat.id),
                reply_to_telegram_id: None,
                active: true,
            })
            .await
            .unwrap();
        let reply_scoped = store
            .insert_webhook(NewWebhook {
                url: "https://b.test".into(),
                secret: "s".into(),
                scope: WebhookScope::Reply,
                chat_id: None,
                reply_to_telegram_id: Some(100),
                active: true,
            })
            .await
            .unwrap();
        store
            .insert_webhook(NewWebhook {
                url: "https://c.test".into(),
                secret: "s".into(),
                scope: WebhookScope::Chat,
                chat_id: Some(chat.id),
                reply_to_telegram_id: None,
                active: false,
            })
            .await
            .unwrap();

        let plain = store.webhooks_for_message(chat.id, None).await.unwrap();
        assert_eq!(plain.iter().map(|w| w.id).collect::<Vec<_>>(), vec![chat_scoped.id]);

        let reply = store
            .webhooks_for_message(chat.id, Some(100))
            .await
            .unwrap();
        assert_eq!(
            reply.iter().map(|w| w.id).collect::<Vec<_>>(),
            vec![chat_scoped.id, reply_scoped.id]
        );
    }

    #[tokio::test]
    async fn delivery_lifecycle() {
        let (store, _, chat) = seeded().await;
        let message = store
            .insert_message(NewMessage {
                chat_id: chat.id,
                telegram_id: 1,
                direction: Direction::Incoming,
                kind: MessageKind::Text,
                text: "hi".into(),
                reply_to_telegram_id: None,
                sent_at: OffsetDateTime::now_utc(),
                raw: json!({}),
            })
            .await
            .unwrap();
        let webhook = store
            .insert_webhook(NewWebhook {
                url: "https://a.test".into(),
                secret: "s".into(),
                scope: WebhookScope::Chat,
                chat_id: None,
                reply_to_telegram_id: None,
                active: true,
            })
            .await
            .unwrap();
        let now = OffsetDateTime::now_utc();
        let mut delivery = store
            .create_delivery(webhook.id, message.id, now)
            .await
            .unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(store.pending_deliveries(now).await.unwrap().len(), 1);

        delivery.attempt_count = 1;
        delivery.status = DeliveryStatus::Delivered;
        delivery.delivered_at = Some(now);
        store.update_delivery(&delivery).await.unwrap();

        let reloaded = store.delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, DeliveryStatus::Delivered);
        assert!(reloaded.delivered_at.is_some());
        assert!(store.pending_deliveries(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn touch_api_key_sets_last_used() {
        let (store, _, _) = seeded().await;
        let key = store.insert_api_key("hash", None).await.unwrap();
        assert!(key.last_used_at.is_none());
        let at = OffsetDateTime::now_utc();
        store.touch_api_key(key.id, at).await.unwrap();
        let loaded = store.api_key_by_hash("hash").await.unwrap().unwrap();
        assert!(loaded.last_used_at.is_some());
    }
}
