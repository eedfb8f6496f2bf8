//! In-process backend.
//!
//! All chats live in one arena behind a single `RwLock`. Expiry is driven by a
//! min-heap of deadlines guarded by the same lock, so readers never observe a
//! chat the scheduler is halfway through removing.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::entities::{Chat, Message, NewMessage, OutboxRecord};
use crate::retention::{self, Clock, SystemClock};
use crate::store::{
    ChatStore, IdGenerator, OutboxOptions, OutboxPolicy, OutboxQueue, SequentialIds,
};
use crate::types::{OutboxEvent, StoreError, StoreResult, Stored};

#[derive(Debug)]
struct ChatSlot {
    chat: Chat,
    messages: VecDeque<Message>,
}

#[derive(Debug, Default)]
struct Arena {
    chats: HashMap<Uuid, ChatSlot>,
    deadlines: BinaryHeap<Reverse<(DateTime<Utc>, Uuid)>>,
    outbox: VecDeque<OutboxRecord>,
}

impl Arena {
    fn live_slot(&self, chat_id: Uuid, now: DateTime<Utc>) -> Option<&ChatSlot> {
        self.chats
            .get(&chat_id)
            .filter(|slot| !slot.chat.is_expired_at(now))
    }

    fn live_slot_mut(&mut self, chat_id: Uuid, now: DateTime<Utc>) -> Option<&mut ChatSlot> {
        self.chats
            .get_mut(&chat_id)
            .filter(|slot| !slot.chat.is_expired_at(now))
    }

    fn insert_chat(&mut self, chat: Chat) {
        self.deadlines.push(Reverse((chat.deadline, chat.id)));
        self.chats.insert(
            chat.id,
            ChatSlot {
                chat,
                messages: VecDeque::new(),
            },
        );
    }

    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.deadlines.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Pop every heap entry that is due and drop its chat with all messages.
    fn expire_due(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while let Some(Reverse((deadline, chat_id))) = self.deadlines.peek().copied() {
            if !retention::is_expired(deadline, now) {
                break;
            }
            self.deadlines.pop();
            if self.chats.remove(&chat_id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Build the outbox record for `event` if the queue has room for it.
    fn stage(
        &self,
        options: &OutboxOptions,
        event: &OutboxEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<OutboxRecord> {
        options.admit(self.outbox.len())?;
        OutboxRecord::for_event(event, now)
    }
}

/// Chat store backed by process memory.
pub struct MemoryChatStore {
    arena: RwLock<Arena>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    outbox: OutboxOptions,
    schedule_changed: Notify,
}

impl MemoryChatStore {
    pub fn new(outbox: OutboxOptions) -> Self {
        Self {
            arena: RwLock::new(Arena::default()),
            clock: Arc::new(SystemClock),
            ids: Arc::new(SequentialIds::new()),
            outbox,
            schedule_changed: Notify::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Expiry scheduler. Sleeps until the earliest deadline, removes what is
    /// due, and repeats until `shutdown` fires.
    pub async fn run_expiry(self: Arc<Self>, shutdown: CancellationToken) {
        debug!("memory expiry scheduler started");
        loop {
            let next = self.arena.read().await.next_deadline();
            let wait = next.map(|deadline| {
                (deadline - self.clock.now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO)
            });

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.schedule_changed.notified() => continue,
                _ = sleep_or_park(wait) => {}
            }

            let now = self.clock.now();
            let removed = self.arena.write().await.expire_due(now);
            if removed > 0 {
                info!(removed, "expired chats removed");
            }
        }
        debug!("memory expiry scheduler stopped");
    }
}

async fn sleep_or_park(wait: Option<std::time::Duration>) {
    match wait {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

impl Default for MemoryChatStore {
    fn default() -> Self {
        Self::new(OutboxOptions::default())
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn create_chat(&self, chat: Chat) -> StoreResult<Chat> {
        let now = self.clock.now();
        let mut arena = self.arena.write().await;
        arena.expire_due(now);

        if arena.chats.contains_key(&chat.id) {
            return Err(StoreError::internal(format!("chat {} already exists", chat.id)));
        }

        let staged = arena.stage(&self.outbox, &OutboxEvent::chat_created(&chat), now);
        match staged {
            Ok(record) => {
                arena.insert_chat(chat.clone());
                arena.outbox.push_back(record);
            }
            Err(err) => {
                if self.outbox.policy == OutboxPolicy::Lenient {
                    arena.insert_chat(chat.clone());
                    self.schedule_changed.notify_one();
                }
                return Err(self.outbox.policy.enqueue_failed(Stored::Chat(chat), err));
            }
        }
        drop(arena);

        self.schedule_changed.notify_one();
        debug!(chat_id = %chat.id, deadline = %chat.deadline, "chat created");
        Ok(chat)
    }

    async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Chat> {
        let now = self.clock.now();
        self.arena
            .read()
            .await
            .live_slot(chat_id, now)
            .map(|slot| slot.chat.clone())
            .ok_or_else(|| StoreError::chat_not_found(chat_id))
    }

    async fn chats_count(&self) -> StoreResult<usize> {
        let now = self.clock.now();
        let arena = self.arena.read().await;
        Ok(arena
            .chats
            .values()
            .filter(|slot| !slot.chat.is_expired_at(now))
            .count())
    }

    async fn post_message(&self, chat_id: Uuid, message: NewMessage) -> StoreResult<Message> {
        let now = self.clock.now();
        let mut arena = self.arena.write().await;

        if arena.live_slot(chat_id, now).is_none() {
            return Err(StoreError::chat_not_found(chat_id));
        }

        let message = message.into_message(self.ids.next_message_id(), chat_id);
        let staged = arena.stage(&self.outbox, &OutboxEvent::message_posted(&message), now);

        let keep = staged.is_ok() || self.outbox.policy == OutboxPolicy::Lenient;
        if keep {
            if let Some(slot) = arena.live_slot_mut(chat_id, now) {
                slot.messages.push_back(message.clone());
            }
        }

        match staged {
            Ok(record) => {
                arena.outbox.push_back(record);
                debug!(chat_id = %chat_id, message_id = message.id, "message posted");
                Ok(message)
            }
            Err(err) => Err(self
                .outbox
                .policy
                .enqueue_failed(Stored::Message(message), err)),
        }
    }

    async fn trim_messages(&self, chat_id: Uuid, max_messages: usize) -> StoreResult<usize> {
        let mut arena = self.arena.write().await;
        let Some(slot) = arena.chats.get_mut(&chat_id) else {
            return Ok(0);
        };

        let excess = retention::excess(slot.messages.len(), max_messages);
        slot.messages.drain(..excess);
        if excess > 0 {
            debug!(chat_id = %chat_id, removed = excess, "messages trimmed");
        }
        Ok(excess)
    }

    async fn chat_history(&self, chat_id: Uuid) -> StoreResult<Vec<Message>> {
        let now = self.clock.now();
        let arena = self.arena.read().await;
        Ok(arena
            .live_slot(chat_id, now)
            .map(|slot| slot.messages.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let now = self.clock.now();
        let removed = self.arena.write().await.expire_due(now);
        if removed > 0 {
            info!(removed, "expired chats removed");
        }
        Ok(removed)
    }
}

#[async_trait]
impl OutboxQueue for MemoryChatStore {
    async fn next_pending(&self) -> StoreResult<OutboxRecord> {
        self.arena
            .read()
            .await
            .outbox
            .front()
            .cloned()
            .ok_or(StoreError::OutboxEmpty)
    }

    async fn confirm_sent(&self, outbox_id: Uuid) -> StoreResult<()> {
        let mut arena = self.arena.write().await;
        if let Some(index) = arena.outbox.iter().position(|record| record.id == outbox_id) {
            arena.outbox.remove(index);
        }
        Ok(())
    }

    async fn pending_count(&self) -> StoreResult<usize> {
        Ok(self.arena.read().await.outbox.len())
    }
}
