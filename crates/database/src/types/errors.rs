//! Error types for the storage layer

use thiserror::Error;
use uuid::Uuid;

use crate::entities::{Chat, Message};

/// A record whose primary write committed even though its outbox entry did not.
#[derive(Debug, Clone, PartialEq)]
pub enum Stored {
    Chat(Chat),
    Message(Message),
}

impl Stored {
    pub fn kind(&self) -> &'static str {
        match self {
            Stored::Chat(_) => "chat",
            Stored::Message(_) => "message",
        }
    }

    pub fn into_chat(self) -> Option<Chat> {
        match self {
            Stored::Chat(chat) => Some(chat),
            Stored::Message(_) => None,
        }
    }
}

/// Errors raised by chat stores and outbox queues
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Chat not found: {id}")]
    ChatNotFound { id: Uuid },

    /// Nothing is waiting in the outbox. Not a failure.
    #[error("Outbox is empty")]
    OutboxEmpty,

    #[error("Outbox is full: {pending} records pending")]
    OutboxFull { pending: usize },

    #[error("Notification was not created for stored {}", .0.kind())]
    NotificationFailed(Box<Stored>),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn chat_not_found(id: Uuid) -> Self {
        Self::ChatNotFound { id }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn notification_failed(stored: Stored) -> Self {
        Self::NotificationFailed(Box::new(stored))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ChatNotFound { .. })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::OutboxEmpty)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(format!("migration failed: {err}"))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Redis(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for StoreError {
    fn from(err: uuid::Error) -> Self {
        Self::Internal(format!("UUID error: {err}"))
    }
}
