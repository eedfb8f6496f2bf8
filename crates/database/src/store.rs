//! Backend contract for chat storage and its co-located outbox.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use murmur_config::{OutboxConfig, OutboxPolicyConfig};
use tracing::warn;
use uuid::Uuid;

use crate::entities::{Chat, Message, NewMessage, OutboxRecord};
use crate::types::{StoreError, StoreResult, Stored};

/// Chat and message storage for one backend.
///
/// Every mutating call writes its outbox record in the same unit of work as
/// the business data.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persist `chat` and enqueue a `chat_created` event.
    async fn create_chat(&self, chat: Chat) -> StoreResult<Chat>;

    /// Fetch a live chat. Expired chats are reported as not found.
    async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Chat>;

    /// Number of live chats.
    async fn chats_count(&self) -> StoreResult<usize>;

    /// Append a message to a live chat and enqueue a `message_posted` event.
    async fn post_message(&self, chat_id: Uuid, message: NewMessage) -> StoreResult<Message>;

    /// Drop the oldest messages so at most `max_messages` remain. Returns how
    /// many were removed.
    async fn trim_messages(&self, chat_id: Uuid, max_messages: usize) -> StoreResult<usize>;

    /// Retained messages of a live chat, oldest first. Unknown or expired
    /// chats yield an empty history.
    async fn chat_history(&self, chat_id: Uuid) -> StoreResult<Vec<Message>>;

    /// Eagerly reclaim chats past their deadline. Returns how many were removed.
    async fn purge_expired(&self) -> StoreResult<usize>;
}

/// FIFO of events awaiting delivery.
#[async_trait]
pub trait OutboxQueue: Send + Sync {
    /// Oldest pending record, or [`StoreError::OutboxEmpty`].
    async fn next_pending(&self) -> StoreResult<OutboxRecord>;

    /// Mark a record delivered. Confirming an unknown or already confirmed
    /// record is a no-op.
    async fn confirm_sent(&self, outbox_id: Uuid) -> StoreResult<()>;

    async fn pending_count(&self) -> StoreResult<usize>;
}

/// What happens when the outbox half of a write fails after the business half
/// succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutboxPolicy {
    /// Keep the business write and report [`StoreError::NotificationFailed`].
    #[default]
    Lenient,
    /// Undo the business write and report an internal error.
    Strict,
}

impl OutboxPolicy {
    /// Error to hand back once the backend has applied the policy.
    pub(crate) fn enqueue_failed(self, stored: Stored, cause: StoreError) -> StoreError {
        match self {
            OutboxPolicy::Lenient => {
                warn!(kind = stored.kind(), error = %cause, "outbox enqueue failed, keeping primary write");
                StoreError::notification_failed(stored)
            }
            OutboxPolicy::Strict => {
                StoreError::internal(format!("outbox enqueue failed for {}: {cause}", stored.kind()))
            }
        }
    }
}

impl From<OutboxPolicyConfig> for OutboxPolicy {
    fn from(config: OutboxPolicyConfig) -> Self {
        match config {
            OutboxPolicyConfig::Lenient => OutboxPolicy::Lenient,
            OutboxPolicyConfig::Strict => OutboxPolicy::Strict,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutboxOptions {
    pub policy: OutboxPolicy,
    /// Upper bound on pending records; `None` means unbounded.
    pub max_pending: Option<usize>,
}

impl OutboxOptions {
    /// Check whether one more record fits next to `pending` existing ones.
    pub fn admit(&self, pending: usize) -> StoreResult<()> {
        match self.max_pending {
            Some(max) if pending >= max => Err(StoreError::OutboxFull { pending }),
            _ => Ok(()),
        }
    }
}

impl From<&OutboxConfig> for OutboxOptions {
    fn from(config: &OutboxConfig) -> Self {
        Self {
            policy: config.policy.into(),
            max_pending: config.max_pending,
        }
    }
}

/// Source of message identifiers for backends without a native sequence.
pub trait IdGenerator: Send + Sync {
    fn next_message_id(&self) -> i64;
}

/// Monotonic counter scoped to one store instance.
#[derive(Debug, Default)]
pub struct SequentialIds {
    last: AtomicI64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIds {
    fn next_message_id(&self) -> i64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }
}
