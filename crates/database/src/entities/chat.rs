//! Chat entity definitions

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retention;

/// A bounded chat room. Immutable after creation; it disappears at `deadline`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub readonly: bool,
    pub deadline: DateTime<Utc>,
}

impl Chat {
    /// Build a chat with a fresh identifier.
    ///
    /// The deadline is truncated to milliseconds, the precision every backend
    /// persists.
    pub fn new(owner_id: Uuid, readonly: bool, deadline: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            readonly,
            deadline: deadline.trunc_subsecs(3),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        retention::is_expired(self.deadline, now)
    }

    /// Whether `author_id` may post into this chat.
    pub fn accepts_author(&self, author_id: Uuid) -> bool {
        !self.readonly || self.owner_id == author_id
    }
}
