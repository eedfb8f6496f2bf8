//! Outbox record definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{OutboxEvent, StoreResult};

pub const CHATS_TOPIC: &str = "chats";
pub const MESSAGES_TOPIC: &str = "messages";

/// An event staged for delivery to the message bus.
///
/// `sent_at` stays `None` until the publisher confirms delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub topic: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Serialize `event` into a pending record.
    pub fn for_event(event: &OutboxEvent, created_at: DateTime<Utc>) -> StoreResult<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            topic: event.topic().to_string(),
            payload: event.encode()?,
            created_at,
            sent_at: None,
        })
    }

    /// Partition/deduplication key handed to the bus.
    pub fn key(&self) -> String {
        self.id.to_string()
    }

    pub fn decode(&self) -> StoreResult<OutboxEvent> {
        OutboxEvent::decode(&self.payload)
    }
}
