//! Core domain types shared by every botgate crate.
//!
//! The gateway sits between Telegram webhook delivery and three consumer
//! classes (WebSocket, gRPC, outbound webhooks). This crate holds the
//! entities they exchange and the small pure helpers (subjects, backoff,
//! update classification) the services agree on.

mod backoff;
mod error;
mod subjects;
mod telegram;
mod types;

pub use backoff::{backoff, MAX_BACKOFF};
pub use error::GatewayError;
pub use subjects::{chat_subject, delivery_queue_name, delivery_result_subject};
pub use telegram::{
    classify_message, extract_event, TelegramChat, TelegramMessage, TelegramUpdate, TelegramUser,
};
pub use types::*;
