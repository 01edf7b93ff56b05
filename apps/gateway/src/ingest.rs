use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use botgate_bus::JobQueue as _;
use botgate_core::{
    classify_message, extract_event, Direction, Event, NewMessage, TelegramUpdate,
};
use botgate_store::GatewayStore as _;
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::AppState;

/// `POST /api/v1/telegram/webhook/{secret}` — the ingest pipeline. The path
/// secret alone establishes bot identity; the payload is never trusted for
/// routing.
pub async fn telegram_webhook(
    State(state): State<AppState>,
    Path(secret): Path<String>,
    body: Bytes,
) -> Response {
    let bot = match state.store.bot_by_webhook_secret(&secret).await {
        Ok(Some(bot)) => bot,
        Ok(None) => {
            metrics::counter!("ingest_rejected_total", "reason" => "secret").increment(1);
            tracing::warn!("webhook update with unknown secret");
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(err) => {
            tracing::error!(error = %err, "bot lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let raw: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(bot_id = bot.id, error = %err, "malformed update body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    let update: TelegramUpdate = match serde_json::from_value(raw.clone()) {
        Ok(update) => update,
        Err(err) => {
            tracing::warn!(bot_id = bot.id, error = %err, "unparseable update envelope");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    // Update kinds outside {message, edited_message, channel_post} are
    // acknowledged untouched.
    let Some((kind, msg)) = extract_event(&update) else {
        return Json(json!({ "ok": true })).into_response();
    };

    let chat = match state.store.upsert_chat(bot.id, &msg.chat).await {
        Ok(chat) => chat,
        Err(err) => {
            tracing::error!(bot_id = bot.id, error = %err, "chat upsert failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let sent_at = OffsetDateTime::from_unix_timestamp(msg.date)
        .unwrap_or_else(|_| OffsetDateTime::now_utc());
    let message = match state
        .store
        .insert_message(NewMessage {
            chat_id: chat.id,
            telegram_id: msg.message_id,
            direction: Direction::Incoming,
            kind: classify_message(msg),
            text: msg.text_or_caption(),
            reply_to_telegram_id: msg.reply_to_telegram_id(),
            sent_at,
            raw,
        })
        .await
    {
        Ok(message) => message,
        Err(err) => {
            tracing::error!(chat_id = chat.id, error = %err, "message append failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // The row is durable; fan-out from here on is best-effort.
    let event = Event::from_message(kind, &chat, &message);
    if let Err(err) = state.hub.broker().publish(&event).await {
        tracing::warn!(chat_id = chat.id, error = %err, "event publish failed");
    }

    match state
        .store
        .webhooks_for_message(chat.id, message.reply_to_telegram_id)
        .await
    {
        Ok(webhooks) => {
            for webhook in webhooks {
                match state
                    .store
                    .create_delivery(webhook.id, message.id, OffsetDateTime::now_utc())
                    .await
                {
                    Ok(delivery) => {
                        if let Err(err) = state.queue.enqueue(delivery.id).await {
                            tracing::error!(
                                delivery_id = delivery.id,
                                error = %err,
                                "delivery enqueue failed, restart scan will pick it up"
                            );
                        }
                    }
                    Err(err) => {
                        tracing::error!(
                            webhook_id = webhook.id,
                            message_id = message.id,
                            error = %err,
                            "delivery record creation failed"
                        );
                    }
                }
            }
        }
        Err(err) => {
            tracing::error!(chat_id = chat.id, error = %err, "webhook match lookup failed");
        }
    }

    metrics::counter!("ingest_accepted_total").increment(1);
    tracing::info!(
        bot_id = bot.id,
        chat_id = chat.id,
        message_id = message.id,
        event = kind.as_str(),
        "update ingested"
    );
    Json(json!({ "ok": true })).into_response()
}
