//! Chat service: the caller-facing entry point for chats and messages.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use murmur_config::ChatLimitsConfig;
use murmur_database::{
    Chat, ChatStore, Clock, Message, NewMessage, StoreResult, SystemClock,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{ChatError, ChatResult};

/// Limits the service enforces in front of the store.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub max_chats: usize,
    pub max_messages_per_chat: usize,
    pub default_ttl: Duration,
    pub operation_timeout: Duration,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self::from(&ChatLimitsConfig::default())
    }
}

impl From<&ChatLimitsConfig> for ChatOptions {
    fn from(config: &ChatLimitsConfig) -> Self {
        Self {
            max_chats: config.max_chats,
            max_messages_per_chat: config.max_messages_per_chat,
            default_ttl: config.default_ttl(),
            operation_timeout: config.operation_timeout(),
        }
    }
}

/// Service for chat and message operations
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    clock: Arc<dyn Clock>,
    options: ChatOptions,
}

impl ChatService {
    pub fn new(store: Arc<dyn ChatStore>, options: ChatOptions) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            options,
        }
    }

    /// Replace the clock used to compute deadlines and message timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create a chat owned by `owner_id`.
    ///
    /// A non-positive `ttl_seconds` falls back to the configured default TTL.
    /// Fails with [`ChatError::MaximumChatsReached`] without touching the store
    /// when the live chat count is already at the limit.
    pub async fn new_chat(&self, owner_id: Uuid, readonly: bool, ttl_seconds: i64) -> ChatResult<Chat> {
        let ttl = if ttl_seconds <= 0 {
            chrono::Duration::from_std(self.options.default_ttl)
                .map_err(|e| ChatError::internal(format!("default ttl out of range: {e}")))?
        } else {
            chrono::Duration::try_seconds(ttl_seconds)
                .ok_or_else(|| ChatError::internal(format!("ttl of {ttl_seconds}s is out of range")))?
        };
        let deadline = self
            .clock
            .now()
            .checked_add_signed(ttl)
            .ok_or_else(|| ChatError::internal(format!("ttl of {ttl_seconds}s overflows the deadline")))?;

        let live = self.bounded("chats_count", self.store.chats_count()).await?;
        if live >= self.options.max_chats {
            info!(owner_id = %owner_id, live, max = self.options.max_chats, "chat limit reached");
            return Err(ChatError::MaximumChatsReached {
                max: self.options.max_chats,
            });
        }

        let chat = Chat::new(owner_id, readonly, deadline);
        match self.bounded("create_chat", self.store.create_chat(chat)).await {
            Ok(chat) => {
                debug!(chat_id = %chat.id, owner_id = %owner_id, readonly, "chat opened");
                Ok(chat)
            }
            Err(err) => {
                if let Some(chat) = err.stored_chat() {
                    warn!(chat_id = %chat.id, "chat created without notification");
                }
                Err(err)
            }
        }
    }

    /// Post `body` into a chat as `author_id` and trim the chat to its
    /// retention limit.
    pub async fn new_message(
        &self,
        chat_id: Uuid,
        author_id: Uuid,
        body: impl Into<String>,
    ) -> ChatResult<Message> {
        let chat = self.bounded("get_chat", self.store.get_chat(chat_id)).await?;
        if !chat.accepts_author(author_id) {
            return Err(ChatError::permission_denied(format!(
                "chat {chat_id} is readonly for {author_id}"
            )));
        }

        let message = NewMessage::new(author_id, body, self.clock.now());
        let posted = self
            .bounded("post_message", self.store.post_message(chat_id, message))
            .await;

        match &posted {
            Ok(_) => self.trim(chat_id).await,
            Err(err) => {
                if let Some(message) = err.stored_message() {
                    warn!(chat_id = %chat_id, message_id = message.id, "message posted without notification");
                    self.trim(chat_id).await;
                }
            }
        }

        posted
    }

    /// Retained messages of a live chat, oldest first.
    pub async fn chat_history(&self, chat_id: Uuid) -> ChatResult<Vec<Message>> {
        self.bounded("get_chat", self.store.get_chat(chat_id)).await?;
        self.bounded("chat_history", self.store.chat_history(chat_id))
            .await
    }

    /// Trim failures never fail the post that triggered them.
    async fn trim(&self, chat_id: Uuid) {
        let trimmed = self
            .bounded(
                "trim_messages",
                self.store
                    .trim_messages(chat_id, self.options.max_messages_per_chat),
            )
            .await;

        if let Err(err) = trimmed {
            warn!(chat_id = %chat_id, error = %err, "failed to trim messages");
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = StoreResult<T>>,
    ) -> ChatResult<T> {
        match tokio::time::timeout(self.options.operation_timeout, call).await {
            Ok(result) => result.map_err(ChatError::from),
            Err(_) => Err(ChatError::internal(format!(
                "{operation} timed out after {:?}",
                self.options.operation_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use murmur_database::{MemoryChatStore, StoreError};

    /// Store that delegates to memory but can stall or refuse to trim.
    struct FlakyStore {
        inner: MemoryChatStore,
        stall: bool,
        fail_trim: bool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryChatStore::default(),
                stall: false,
                fail_trim: false,
            }
        }

        async fn maybe_stall(&self) {
            if self.stall {
                std::future::pending::<()>().await;
            }
        }
    }

    #[async_trait]
    impl ChatStore for FlakyStore {
        async fn create_chat(&self, chat: Chat) -> StoreResult<Chat> {
            self.maybe_stall().await;
            self.inner.create_chat(chat).await
        }

        async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Chat> {
            self.inner.get_chat(chat_id).await
        }

        async fn chats_count(&self) -> StoreResult<usize> {
            self.inner.chats_count().await
        }

        async fn post_message(&self, chat_id: Uuid, message: NewMessage) -> StoreResult<Message> {
            self.inner.post_message(chat_id, message).await
        }

        async fn trim_messages(&self, chat_id: Uuid, max_messages: usize) -> StoreResult<usize> {
            if self.fail_trim {
                return Err(StoreError::internal("trim unavailable"));
            }
            self.inner.trim_messages(chat_id, max_messages).await
        }

        async fn chat_history(&self, chat_id: Uuid) -> StoreResult<Vec<Message>> {
            self.inner.chat_history(chat_id).await
        }

        async fn purge_expired(&self) -> StoreResult<usize> {
            self.inner.purge_expired().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_store_call_times_out_as_internal() {
        let store = FlakyStore {
            stall: true,
            ..FlakyStore::new()
        };
        let service = ChatService::new(Arc::new(store), ChatOptions::default());

        let err = service.new_chat(Uuid::new_v4(), false, 10).await.unwrap_err();

        assert!(matches!(err, ChatError::Internal { ref message } if message.contains("create_chat")));
    }

    #[tokio::test]
    async fn trim_failure_does_not_fail_the_post() {
        let store = FlakyStore {
            fail_trim: true,
            ..FlakyStore::new()
        };
        let service = ChatService::new(
            Arc::new(store),
            ChatOptions {
                max_messages_per_chat: 1,
                ..ChatOptions::default()
            },
        );
        let chat = service.new_chat(Uuid::new_v4(), false, 10).await.unwrap();

        service.new_message(chat.id, chat.owner_id, "one").await.unwrap();
        service.new_message(chat.id, chat.owner_id, "two").await.unwrap();

        assert_eq!(service.chat_history(chat.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn oversized_ttl_is_rejected_without_storing() {
        let store = Arc::new(MemoryChatStore::default());
        let service = ChatService::new(store.clone(), ChatOptions::default());

        for ttl in [i64::MAX, i64::MAX / 1000, 400_000 * 365 * 24 * 3600] {
            let err = service.new_chat(Uuid::new_v4(), false, ttl).await.unwrap_err();
            assert!(matches!(err, ChatError::Internal { .. }), "ttl {ttl}: {err:?}");
        }
        assert_eq!(store.chats_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn non_positive_ttl_uses_default() {
        let service = ChatService::new(
            Arc::new(MemoryChatStore::default()),
            ChatOptions {
                default_ttl: Duration::from_secs(120),
                ..ChatOptions::default()
            },
        );

        let before = chrono::Utc::now();
        let zero = service.new_chat(Uuid::new_v4(), false, 0).await.unwrap();
        let negative = service.new_chat(Uuid::new_v4(), false, -5).await.unwrap();

        for chat in [zero, negative] {
            let ttl = chat.deadline - before;
            assert!(ttl > chrono::Duration::seconds(119));
            assert!(ttl <= chrono::Duration::seconds(121));
        }
    }
}
