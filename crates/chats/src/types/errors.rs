//! Error types for the chat system.

use murmur_database::{Chat, Message, StoreError, Stored};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for chat operations
pub type ChatResult<T> = Result<T, ChatError>;

/// Errors surfaced to callers of the chat service
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Chat not found: {id}")]
    ChatNotFound { id: Uuid },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Maximum number of chats reached ({max})")]
    MaximumChatsReached { max: usize },

    /// The write went through but its event was not queued. The stored
    /// chat or message is carried along.
    #[error("Stored {} but failed to queue its notification", .0.kind())]
    NotificationFailed(Box<Stored>),

    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl ChatError {
    /// Create a not found error for chats
    pub fn chat_not_found(id: Uuid) -> Self {
        Self::ChatNotFound { id }
    }

    /// Create a permission denied error
    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn is_notification_failed(&self) -> bool {
        matches!(self, Self::NotificationFailed(_))
    }

    /// Chat persisted despite a notification failure.
    pub fn stored_chat(&self) -> Option<&Chat> {
        match self {
            Self::NotificationFailed(stored) => match stored.as_ref() {
                Stored::Chat(chat) => Some(chat),
                Stored::Message(_) => None,
            },
            _ => None,
        }
    }

    /// Message persisted despite a notification failure.
    pub fn stored_message(&self) -> Option<&Message> {
        match self {
            Self::NotificationFailed(stored) => match stored.as_ref() {
                Stored::Message(message) => Some(message),
                Stored::Chat(_) => None,
            },
            _ => None,
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ChatNotFound { id } => Self::ChatNotFound { id },
            StoreError::NotificationFailed(stored) => Self::NotificationFailed(stored),
            other => Self::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn store_errors_collapse_to_internal() {
        let err = ChatError::from(StoreError::Database("disk full".to_string()));
        assert!(matches!(err, ChatError::Internal { ref message } if message.contains("disk full")));

        let err = ChatError::from(StoreError::OutboxFull { pending: 3 });
        assert!(matches!(err, ChatError::Internal { .. }));
    }

    #[test]
    fn notification_failure_keeps_the_stored_chat() {
        let chat = Chat::new(Uuid::new_v4(), false, Utc::now());
        let err = ChatError::from(StoreError::notification_failed(Stored::Chat(chat.clone())));

        assert!(err.is_notification_failed());
        assert_eq!(err.stored_chat(), Some(&chat));
        assert!(err.stored_message().is_none());
    }

    #[test]
    fn not_found_keeps_the_id() {
        let id = Uuid::new_v4();
        let err = ChatError::from(StoreError::chat_not_found(id));
        assert!(matches!(err, ChatError::ChatNotFound { id: found } if found == id));
    }
}
