//! Message entity definitions

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub chat_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    pub published_at: DateTime<Utc>,
}

/// A message that has not been assigned an identifier yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub author_id: Uuid,
    pub body: String,
    pub published_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn new(author_id: Uuid, body: impl Into<String>, published_at: DateTime<Utc>) -> Self {
        Self {
            author_id,
            body: body.into(),
            published_at: published_at.trunc_subsecs(3),
        }
    }

    pub fn into_message(self, id: i64, chat_id: Uuid) -> Message {
        Message {
            id,
            chat_id,
            author_id: self.author_id,
            body: self.body,
            published_at: self.published_at,
        }
    }
}
