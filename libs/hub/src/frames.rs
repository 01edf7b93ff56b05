use botgate_core::Event;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Inbound control frame from a connected client.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ControlFrame {
    pub action: String,
    #[serde(default)]
    pub chat_id: Option<i64>,
}

/// Outbound frame written to a client: acks, errors, pongs, or events.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ServerFrame {
    Ack(AckFrame),
    Error(ErrorFrame),
    Pong(PongFrame),
    Event(Event),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AckFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    pub action: String,
    pub chat_id: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PongFrame {
    #[serde(rename = "type")]
    kind: &'static str,
}

impl ServerFrame {
    pub fn ack(action: impl Into<String>, chat_id: i64) -> Self {
        Self::Ack(AckFrame {
            kind: "ack",
            action: action.into(),
            chat_id,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorFrame {
            kind: "error",
            error: message.into(),
        })
    }

    pub fn pong() -> Self {
        Self::Pong(PongFrame { kind: "pong" })
    }

    /// Wire form; events serialize as themselves with their `type` tag.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| json!({"type": "error", "error": "serialization"}).to_string())
    }
}
