use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use botgate_auth::RequireAuth;
use botgate_core::{
    Action, Direction, Event, EventKind, GatewayError, Message, MessageKind, NewMessage,
};
use botgate_store::GatewayStore as _;
use serde::Deserialize;
use serde_json::json;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::ApiError;
use crate::AppState;

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

/// `GET /api/v1/chats/{id}/messages` — reverse-chronological page strictly
/// older than the cursor.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
    Query(query): Query<ListQuery>,
    RequireAuth(principal): RequireAuth,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .store
        .chat(chat_id)
        .await?
        .ok_or_else(|| GatewayError::not_found(format!("chat {chat_id}")))?;
    if !state.acl.authorize(&principal, chat_id, Action::Read).await? {
        return Err(GatewayError::PermissionDenied.into());
    }

    let cursor = query
        .cursor
        .as_deref()
        .map(|raw| {
            OffsetDateTime::parse(raw, &Rfc3339)
                .map_err(|_| GatewayError::invalid(format!("bad cursor {raw:?}")))
        })
        .transpose()?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let messages: Vec<Message> = state.store.list_messages(chat_id, cursor, limit).await?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
    #[serde(default)]
    pub reply_to_message_id: Option<i64>,
}

/// `POST /api/v1/chats/{id}/messages` — acknowledges queueing. The Telegram
/// send happens outside this layer; the outgoing row and its event are what
/// this service owns.
pub async fn send_message(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
    RequireAuth(principal): RequireAuth,
    Json(body): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let chat = state
        .store
        .chat(chat_id)
        .await?
        .ok_or_else(|| GatewayError::not_found(format!("chat {chat_id}")))?;
    if !state.acl.authorize(&principal, chat_id, Action::Send).await? {
        return Err(GatewayError::PermissionDenied.into());
    }
    if body.text.trim().is_empty() {
        return Err(GatewayError::invalid("text must not be empty").into());
    }

    let now = OffsetDateTime::now_utc();
    let message = state
        .store
        .insert_message(NewMessage {
            chat_id,
            telegram_id: 0,
            direction: Direction::Outgoing,
            kind: MessageKind::Text,
            text: body.text.clone(),
            reply_to_telegram_id: body.reply_to_message_id,
            sent_at: now,
            raw: json!({
                "text": body.text,
                "reply_to_message_id": body.reply_to_message_id,
            }),
        })
        .await?;

    let event = Event::from_message(EventKind::NewMessage, &chat, &message);
    if let Err(err) = state.hub.broker().publish(&event).await {
        tracing::warn!(chat_id, error = %err, "outgoing event publish failed");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "ok": true, "message_id": message.id })),
    ))
}
