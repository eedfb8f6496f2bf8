//! Domain events carried by outbox records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{Chat, Message, CHATS_TOPIC, MESSAGES_TOPIC};
use crate::types::StoreResult;

/// Event published to the message bus for every state-changing write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboxEvent {
    ChatCreated {
        chat_id: Uuid,
        owner_id: Uuid,
        readonly: bool,
        deadline: DateTime<Utc>,
    },
    MessagePosted {
        message_id: i64,
        chat_id: Uuid,
        author_id: Uuid,
        body: String,
        published_at: DateTime<Utc>,
    },
}

impl OutboxEvent {
    pub fn chat_created(chat: &Chat) -> Self {
        Self::ChatCreated {
            chat_id: chat.id,
            owner_id: chat.owner_id,
            readonly: chat.readonly,
            deadline: chat.deadline,
        }
    }

    pub fn message_posted(message: &Message) -> Self {
        Self::MessagePosted {
            message_id: message.id,
            chat_id: message.chat_id,
            author_id: message.author_id,
            body: message.body.clone(),
            published_at: message.published_at,
        }
    }

    /// Logical bus channel this event belongs to.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::ChatCreated { .. } => CHATS_TOPIC,
            Self::MessagePosted { .. } => MESSAGES_TOPIC,
        }
    }

    pub fn chat_id(&self) -> Uuid {
        match self {
            Self::ChatCreated { chat_id, .. } | Self::MessagePosted { chat_id, .. } => *chat_id,
        }
    }

    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> StoreResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::NewMessage;

    #[test]
    fn chat_created_payload_carries_full_field_set() {
        let chat = Chat::new(Uuid::new_v4(), true, Utc::now());
        let payload = OutboxEvent::chat_created(&chat).encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(json["type"], "chat_created");
        assert_eq!(json["chat_id"], chat.id.to_string());
        assert_eq!(json["owner_id"], chat.owner_id.to_string());
        assert_eq!(json["readonly"], true);
        assert!(json["deadline"].is_string());
    }

    #[test]
    fn message_posted_event_routes_to_messages_topic() {
        let chat_id = Uuid::new_v4();
        let message = NewMessage::new(Uuid::new_v4(), "hello", Utc::now()).into_message(7, chat_id);
        let event = OutboxEvent::message_posted(&message);

        assert_eq!(event.topic(), MESSAGES_TOPIC);
        assert_eq!(event.chat_id(), chat_id);
        assert_eq!(OutboxEvent::decode(&event.encode().unwrap()).unwrap(), event);
    }
}
