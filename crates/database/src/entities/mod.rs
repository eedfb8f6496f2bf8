//! Domain entities for the storage layer

pub mod chat;
pub mod message;
pub mod outbox;

pub use chat::Chat;
pub use message::{Message, NewMessage};
pub use outbox::{OutboxRecord, CHATS_TOPIC, MESSAGES_TOPIC};

use chrono::{DateTime, Utc};

use crate::types::{StoreError, StoreResult};

pub(crate) fn to_millis(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::internal(format!("timestamp out of range: {millis}")))
}
