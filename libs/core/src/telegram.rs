//! Telegram update envelope, reduced to the fields the ingest pipeline
//! routes on. Everything else survives in the verbatim raw body.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EventKind, MessageKind};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub edited_message: Option<TelegramMessage>,
    #[serde(default)]
    pub channel_post: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub date: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub reply_to_message: Option<Box<ReplyMessageRef>>,
    #[serde(default)]
    pub photo: Option<Vec<Value>>,
    #[serde(default)]
    pub video: Option<Value>,
    #[serde(default)]
    pub document: Option<Value>,
    #[serde(default)]
    pub audio: Option<Value>,
    #[serde(default)]
    pub voice: Option<Value>,
    #[serde(default)]
    pub sticker: Option<Value>,
}

impl TelegramMessage {
    /// Text for the persisted row: message text, falling back to the media
    /// caption, falling back to empty.
    pub fn text_or_caption(&self) -> String {
        self.text
            .clone()
            .or_else(|| self.caption.clone())
            .unwrap_or_default()
    }

    pub fn reply_to_telegram_id(&self) -> Option<i64> {
        self.reply_to_message.as_ref().map(|r| r.message_id)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReplyMessageRef {
    pub message_id: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

/// Picks the routed update field in fixed precedence: `message`,
/// `edited_message`, `channel_post`. Other update kinds are not routed here.
pub fn extract_event(update: &TelegramUpdate) -> Option<(EventKind, &TelegramMessage)> {
    if let Some(msg) = update.message.as_ref() {
        return Some((EventKind::NewMessage, msg));
    }
    if let Some(msg) = update.edited_message.as_ref() {
        return Some((EventKind::EditedMessage, msg));
    }
    update
        .channel_post
        .as_ref()
        .map(|msg| (EventKind::ChannelPost, msg))
}

/// Content-type classification in priority order: photo, video, document,
/// audio, voice, sticker, text.
pub fn classify_message(msg: &TelegramMessage) -> MessageKind {
    if msg.photo.as_ref().is_some_and(|p| !p.is_empty()) {
        MessageKind::Photo
    } else if msg.video.is_some() {
        MessageKind::Video
    } else if msg.document.is_some() {
        MessageKind::Document
    } else if msg.audio.is_some() {
        MessageKind::Audio
    } else if msg.voice.is_some() {
        MessageKind::Voice
    } else if msg.sticker.is_some() {
        MessageKind::Sticker
    } else {
        MessageKind::Text
    }
}
