use botgate_core::Event;
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Body POSTed to webhook subscribers. A projection of the event plus the
/// delivery timestamp.
pub fn build_payload(event: &Event, now: OffsetDateTime) -> Value {
    json!({
        "event": event.kind.as_str(),
        "message_id": event.message_id,
        "chat_id": event.chat_id,
        "telegram_id": event.telegram_id,
        "text": event.text,
        "from_username": event.from_username,
        "from_first_name": event.from_first_name,
        "direction": event.direction.as_str(),
        "message_type": event.message_type.as_str(),
        "sent_at": event
            .sent_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into()),
        "timestamp": now.unix_timestamp(),
    })
}
