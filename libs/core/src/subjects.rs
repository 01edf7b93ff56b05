//! Bus subject helpers. Topics are addressed by a chat's internal id, never
//! the Telegram-side id.

/// Chat event topic: one subject per chat, publishes serialized per chat so
/// per-subscriber ordering holds.
///
/// ```
/// assert_eq!(botgate_core::chat_subject(7), "botgate.events.chat.7");
/// ```
pub fn chat_subject(chat_id: i64) -> String {
    format!("botgate.events.chat.{chat_id}")
}

/// Durable FIFO queue carrying outbound delivery ids.
///
/// ```
/// assert_eq!(botgate_core::delivery_queue_name(), "botgate-deliveries");
/// ```
pub fn delivery_queue_name() -> &'static str {
    "botgate-deliveries"
}

/// Best-effort delivery result channel, for observers only.
///
/// ```
/// assert_eq!(
///     botgate_core::delivery_result_subject(),
///     "botgate.deliveries.results"
/// );
/// ```
pub fn delivery_result_subject() -> &'static str {
    "botgate.deliveries.results"
}
