use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use botgate_auth::RequireAuth;
use botgate_core::{generate_webhook_secret, Action, GatewayError, Principal, WebhookScope};
use botgate_store::{GatewayStore as _, NewWebhook};
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::AppState;

/// Chat-scoped webhooks require `manage` on that chat; unscoped ones only
/// need an authenticated caller.
async fn ensure_manage(
    state: &AppState,
    principal: &Principal,
    chat_id: Option<i64>,
) -> Result<(), ApiError> {
    let Some(chat_id) = chat_id else {
        return Ok(());
    };
    state
        .store
        .chat(chat_id)
        .await?
        .ok_or_else(|| GatewayError::not_found(format!("chat {chat_id}")))?;
    if !state
        .acl
        .authorize(principal, chat_id, Action::Manage)
        .await?
    {
        return Err(GatewayError::PermissionDenied.into());
    }
    Ok(())
}

pub async fn list_webhooks(
    State(state): State<AppState>,
    RequireAuth(_principal): RequireAuth,
) -> Result<Json<serde_json::Value>, ApiError> {
    let webhooks = state.store.list_webhooks().await?;
    Ok(Json(json!({ "webhooks": webhooks })))
}

pub async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    RequireAuth(_principal): RequireAuth,
) -> Result<Json<serde_json::Value>, ApiError> {
    let webhook = state
        .store
        .webhook(id)
        .await?
        .ok_or_else(|| GatewayError::not_found(format!("webhook {id}")))?;
    Ok(Json(json!({ "webhook": webhook })))
}

#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub scope: Option<WebhookScope>,
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub reply_to_message_id: Option<i64>,
    #[serde(default)]
    pub active: Option<bool>,
}

/// `POST /api/v1/webhooks`. The signing secret is returned exactly once,
/// in this response.
pub async fn create_webhook(
    State(state): State<AppState>,
    RequireAuth(principal): RequireAuth,
    Json(body): Json<CreateWebhookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !body.url.starts_with("http://") && !body.url.starts_with("https://") {
        return Err(GatewayError::invalid("url must be http(s)").into());
    }
    let scope = body.scope.unwrap_or(WebhookScope::Chat);
    if scope == WebhookScope::Reply && body.reply_to_message_id.is_none() {
        return Err(GatewayError::invalid("reply scope requires reply_to_message_id").into());
    }
    ensure_manage(&state, &principal, body.chat_id).await?;

    let secret = body.secret.unwrap_or_else(generate_webhook_secret);
    let webhook = state
        .store
        .insert_webhook(NewWebhook {
            url: body.url,
            secret: secret.clone(),
            scope,
            chat_id: body.chat_id,
            reply_to_telegram_id: body.reply_to_message_id,
            active: body.active.unwrap_or(true),
        })
        .await?;
    tracing::info!(webhook_id = webhook.id, "webhook registered");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "ok": true, "webhook": webhook, "secret": secret })),
    ))
}

pub async fn delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    RequireAuth(principal): RequireAuth,
) -> Result<Json<serde_json::Value>, ApiError> {
    let webhook = state
        .store
        .webhook(id)
        .await?
        .ok_or_else(|| GatewayError::not_found(format!("webhook {id}")))?;
    ensure_manage(&state, &principal, webhook.chat_id).await?;
    state.store.delete_webhook(id).await?;
    tracing::info!(webhook_id = id, "webhook removed");
    Ok(Json(json!({ "ok": true })))
}
