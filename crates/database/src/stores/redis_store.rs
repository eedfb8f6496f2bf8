//! Redis backend.
//!
//! Layout, relative to the configured key prefix:
//!
//! | key | type | contents |
//! |---|---|---|
//! | `chat:{id}` | hash | `owner_id`, `readonly`, `deadline_ms`; expires at the deadline |
//! | `messages:{id}` | list | JSON messages, newest first; expires with the chat |
//! | `chats:deadlines` | sorted set | chat ids scored by `deadline_ms` |
//! | `message:seq` | string | message id counter |
//! | `outbox:queue` | list | pending outbox ids, oldest first |
//! | `outbox:record:{id}` | hash | `topic`, `payload`, `created_ms` |
//!
//! Writes go through `MULTI/EXEC`, except posting, which runs as a script so
//! the chat's liveness is checked in the same atomic step as the write. Redis
//! does not roll back a transaction or script in which one command failed, so
//! a failed write is followed by a best-effort cleanup of every key it may
//! have touched.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use murmur_config::RedisConfig;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Pipeline, Script};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entities::{from_millis, to_millis, Chat, Message, NewMessage, OutboxRecord};
use crate::retention::{self, Clock, SystemClock};
use crate::store::{ChatStore, OutboxOptions, OutboxPolicy, OutboxQueue};
use crate::types::{OutboxEvent, StoreError, StoreResult, Stored};

#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn chat(&self, id: Uuid) -> String {
        format!("{}chat:{id}", self.prefix)
    }

    fn messages(&self, id: Uuid) -> String {
        format!("{}messages:{id}", self.prefix)
    }

    fn deadlines(&self) -> String {
        format!("{}chats:deadlines", self.prefix)
    }

    fn message_seq(&self) -> String {
        format!("{}message:seq", self.prefix)
    }

    fn outbox_queue(&self) -> String {
        format!("{}outbox:queue", self.prefix)
    }

    fn outbox_record(&self, id: Uuid) -> String {
        format!("{}outbox:record:{id}", self.prefix)
    }

    /// Cleanup for a write that failed after some of its commands ran.
    fn compensation(
        &self,
        deleted: &[String],
        chat_id: Option<Uuid>,
        message: Option<(&str, &str)>,
        record_id: Option<Uuid>,
    ) -> Pipeline {
        let mut pipe = redis::pipe();
        for key in deleted {
            pipe.del(key).ignore();
        }
        if let Some(chat_id) = chat_id {
            pipe.zrem(self.deadlines(), chat_id.to_string()).ignore();
        }
        if let Some((messages_key, encoded)) = message {
            pipe.lrem(messages_key, 1, encoded).ignore();
        }
        if let Some(record_id) = record_id {
            pipe.lrem(self.outbox_queue(), 1, record_id.to_string())
                .ignore()
                .del(self.outbox_record(record_id))
                .ignore();
        }
        pipe
    }
}

/// Appends a message to a live chat and, when `ARGV[3]` is `1`, queues its
/// outbox record. Returns 0 without writing anything when the chat is gone.
///
/// KEYS: chat, messages, outbox queue, outbox record.
/// ARGV: now_ms, message, has_record, record id, topic, payload, created_ms.
const POST_MESSAGE_SCRIPT: &str = r#"
local deadline = redis.call('HGET', KEYS[1], 'deadline_ms')
if not deadline or tonumber(deadline) <= tonumber(ARGV[1]) then
  return 0
end
redis.call('LPUSH', KEYS[2], ARGV[2])
redis.call('PEXPIREAT', KEYS[2], deadline)
if ARGV[3] == '1' then
  redis.call('HSET', KEYS[4], 'topic', ARGV[5], 'payload', ARGV[6], 'created_ms', ARGV[7])
  redis.call('RPUSH', KEYS[3], ARGV[4])
end
return 1
"#;

/// Chat store backed by a Redis connection manager.
#[derive(Clone)]
pub struct RedisChatStore {
    conn: ConnectionManager,
    keys: Keys,
    clock: Arc<dyn Clock>,
    outbox: OutboxOptions,
    post_script: Script,
}

impl RedisChatStore {
    pub fn new(conn: ConnectionManager, key_prefix: impl Into<String>, outbox: OutboxOptions) -> Self {
        Self {
            conn,
            keys: Keys {
                prefix: key_prefix.into(),
            },
            clock: Arc::new(SystemClock),
            outbox,
            post_script: Script::new(POST_MESSAGE_SCRIPT),
        }
    }

    /// Open a managed connection to `config.url`.
    pub async fn connect(config: &RedisConfig, outbox: OutboxOptions) -> StoreResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %config.url, prefix = %config.key_prefix, "redis connection established");
        Ok(Self::new(conn, config.key_prefix.clone(), outbox))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Serialize `event` and check the queue has room for it.
    async fn stage(&self, event: &OutboxEvent, now: DateTime<Utc>) -> StoreResult<OutboxRecord> {
        let mut conn = self.conn.clone();
        let pending: usize = conn.llen(self.keys.outbox_queue()).await?;
        self.outbox.admit(pending)?;
        OutboxRecord::for_event(event, now)
    }

    fn push_record(&self, pipe: &mut Pipeline, record: &OutboxRecord) {
        let key = self.keys.outbox_record(record.id);
        pipe.hset(&key, "topic", &record.topic)
            .ignore()
            .hset(&key, "payload", record.payload.as_slice())
            .ignore()
            .hset(&key, "created_ms", to_millis(record.created_at))
            .ignore()
            .rpush(self.keys.outbox_queue(), record.id.to_string())
            .ignore();
    }

    /// Undo whatever part of a failed write was applied.
    async fn compensate(&self, pipe: Pipeline) {
        let mut conn = self.conn.clone();
        if let Err(err) = pipe.query_async::<_, ()>(&mut conn).await {
            warn!(error = %err, "redis compensation failed, keys may be left behind");
        }
    }

    /// Deadline of a live chat, or `None` when it is missing or expired.
    async fn live_deadline(&self, chat_id: Uuid) -> StoreResult<Option<DateTime<Utc>>> {
        let mut conn = self.conn.clone();
        let deadline_ms: Option<i64> = conn.hget(self.keys.chat(chat_id), "deadline_ms").await?;
        let Some(deadline_ms) = deadline_ms else {
            return Ok(None);
        };

        let deadline = from_millis(deadline_ms)?;
        if retention::is_expired(deadline, self.clock.now()) {
            return Ok(None);
        }
        Ok(Some(deadline))
    }
}

#[async_trait]
impl ChatStore for RedisChatStore {
    async fn create_chat(&self, chat: Chat) -> StoreResult<Chat> {
        let now = self.clock.now();
        let staged = match self.stage(&OutboxEvent::chat_created(&chat), now).await {
            Err(err @ StoreError::Redis(_)) => return Err(err),
            Err(err) if self.outbox.policy == OutboxPolicy::Strict => {
                return Err(self.outbox.policy.enqueue_failed(Stored::Chat(chat), err));
            }
            staged => staged,
        };

        let chat_key = self.keys.chat(chat.id);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&chat_key, "owner_id", chat.owner_id.to_string())
            .ignore()
            .hset(&chat_key, "readonly", i64::from(chat.readonly))
            .ignore()
            .hset(&chat_key, "deadline_ms", to_millis(chat.deadline))
            .ignore()
            .pexpire_at(&chat_key, to_millis(chat.deadline))
            .ignore()
            .zadd(self.keys.deadlines(), chat.id.to_string(), to_millis(chat.deadline))
            .ignore();

        let record = staged.as_ref().ok();
        if let Some(record) = record {
            self.push_record(&mut pipe, record);
        }

        let mut conn = self.conn.clone();
        if let Err(err) = pipe.query_async::<_, ()>(&mut conn).await {
            let cleanup = self.keys.compensation(
                &[chat_key],
                Some(chat.id),
                None,
                record.map(|record| record.id),
            );
            self.compensate(cleanup).await;
            return Err(err.into());
        }

        match staged {
            Ok(_) => {
                info!(chat_id = %chat.id, owner_id = %chat.owner_id, "created chat");
                Ok(chat)
            }
            Err(err) => Err(self.outbox.policy.enqueue_failed(Stored::Chat(chat), err)),
        }
    }

    async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Chat> {
        let mut conn = self.conn.clone();
        let (owner_id, readonly, deadline_ms): (Option<String>, Option<i64>, Option<i64>) =
            redis::cmd("HMGET")
                .arg(self.keys.chat(chat_id))
                .arg(&["owner_id", "readonly", "deadline_ms"][..])
                .query_async(&mut conn)
                .await?;

        let (Some(owner_id), Some(readonly), Some(deadline_ms)) = (owner_id, readonly, deadline_ms)
        else {
            return Err(StoreError::chat_not_found(chat_id));
        };

        let chat = Chat {
            id: chat_id,
            owner_id: Uuid::parse_str(&owner_id)?,
            readonly: readonly != 0,
            deadline: from_millis(deadline_ms)?,
        };
        if chat.is_expired_at(self.clock.now()) {
            return Err(StoreError::chat_not_found(chat_id));
        }
        Ok(chat)
    }

    async fn chats_count(&self) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let now = to_millis(self.clock.now());
        let count: usize = conn
            .zcount(self.keys.deadlines(), format!("({now}"), "+inf")
            .await?;
        Ok(count)
    }

    async fn post_message(&self, chat_id: Uuid, message: NewMessage) -> StoreResult<Message> {
        let now = self.clock.now();
        let mut conn = self.conn.clone();
        let id: i64 = conn.incr(self.keys.message_seq(), 1).await?;
        let message = message.into_message(id, chat_id);
        let encoded = serde_json::to_string(&message)?;

        let staged = match self.stage(&OutboxEvent::message_posted(&message), now).await {
            Err(err @ StoreError::Redis(_)) => return Err(err),
            Err(err) if self.outbox.policy == OutboxPolicy::Strict => {
                if self.live_deadline(chat_id).await?.is_none() {
                    return Err(StoreError::chat_not_found(chat_id));
                }
                return Err(self
                    .outbox
                    .policy
                    .enqueue_failed(Stored::Message(message), err));
            }
            staged => staged,
        };

        let messages_key = self.keys.messages(chat_id);
        let record = staged.as_ref().ok();
        let mut invocation = self.post_script.prepare_invoke();
        invocation
            .key(self.keys.chat(chat_id))
            .key(&messages_key)
            .key(self.keys.outbox_queue())
            .arg(to_millis(now))
            .arg(&encoded);
        match record {
            Some(record) => {
                invocation
                    .key(self.keys.outbox_record(record.id))
                    .arg(1)
                    .arg(record.id.to_string())
                    .arg(&record.topic)
                    .arg(record.payload.as_slice())
                    .arg(to_millis(record.created_at));
            }
            None => {
                invocation.key(self.keys.outbox_record(Uuid::nil())).arg(0);
            }
        }

        let posted: i64 = match invocation.invoke_async(&mut conn).await {
            Ok(posted) => posted,
            Err(err) => {
                let cleanup = self.keys.compensation(
                    &[],
                    None,
                    Some((messages_key.as_str(), encoded.as_str())),
                    record.map(|record| record.id),
                );
                self.compensate(cleanup).await;
                return Err(err.into());
            }
        };
        if posted == 0 {
            return Err(StoreError::chat_not_found(chat_id));
        }

        match staged {
            Ok(_) => {
                debug!(chat_id = %chat_id, message_id = message.id, "posted message");
                Ok(message)
            }
            Err(err) => Err(self
                .outbox
                .policy
                .enqueue_failed(Stored::Message(message), err)),
        }
    }

    async fn trim_messages(&self, chat_id: Uuid, max_messages: usize) -> StoreResult<usize> {
        let key = self.keys.messages(chat_id);
        let mut pipe = redis::pipe();
        pipe.atomic().llen(&key);
        if max_messages == 0 {
            pipe.del(&key).ignore();
        } else {
            let stop = isize::try_from(max_messages).unwrap_or(isize::MAX) - 1;
            pipe.ltrim(&key, 0, stop).ignore();
        }

        let mut conn = self.conn.clone();
        let (len,): (usize,) = pipe.query_async(&mut conn).await?;

        let removed = retention::excess(len, max_messages);
        if removed > 0 {
            debug!(chat_id = %chat_id, removed, "trimmed messages");
        }
        Ok(removed)
    }

    async fn chat_history(&self, chat_id: Uuid) -> StoreResult<Vec<Message>> {
        if self.live_deadline(chat_id).await?.is_none() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let newest_first: Vec<String> = conn.lrange(self.keys.messages(chat_id), 0, -1).await?;

        newest_first
            .iter()
            .rev()
            .map(|raw| serde_json::from_str::<Message>(raw).map_err(StoreError::from))
            .collect()
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let now = to_millis(self.clock.now());
        let expired: Vec<String> = conn
            .zrangebyscore(self.keys.deadlines(), "-inf", now)
            .await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for raw in &expired {
            let chat_id = Uuid::parse_str(raw)?;
            pipe.del(self.keys.chat(chat_id))
                .ignore()
                .del(self.keys.messages(chat_id))
                .ignore();
        }
        pipe.zrem(self.keys.deadlines(), &expired).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        info!(removed = expired.len(), "purged expired chats");
        Ok(expired.len())
    }
}

#[async_trait]
impl OutboxQueue for RedisChatStore {
    async fn next_pending(&self) -> StoreResult<OutboxRecord> {
        let mut conn = self.conn.clone();
        let head: Option<String> = conn.lindex(self.keys.outbox_queue(), 0).await?;
        let Some(head) = head else {
            return Err(StoreError::OutboxEmpty);
        };
        let id = Uuid::parse_str(&head)?;

        let (topic, payload, created_ms): (Option<String>, Option<Vec<u8>>, Option<i64>) =
            redis::cmd("HMGET")
                .arg(self.keys.outbox_record(id))
                .arg(&["topic", "payload", "created_ms"][..])
                .query_async(&mut conn)
                .await?;

        match (topic, payload, created_ms) {
            (Some(topic), Some(payload), Some(created_ms)) => Ok(OutboxRecord {
                id,
                topic,
                payload,
                created_at: from_millis(created_ms)?,
                sent_at: None,
            }),
            _ => Err(StoreError::internal(format!("outbox record {id} is missing its body"))),
        }
    }

    async fn confirm_sent(&self, outbox_id: Uuid) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(self.keys.outbox_queue(), 1, outbox_id.to_string())
            .ignore()
            .del(self.keys.outbox_record(outbox_id))
            .ignore();

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn pending_count(&self) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(self.keys.outbox_queue()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_live_under_the_prefix() {
        let keys = Keys {
            prefix: "murmur:".to_string(),
        };
        let id = Uuid::nil();

        assert_eq!(keys.chat(id), format!("murmur:chat:{id}"));
        assert_eq!(keys.messages(id), format!("murmur:messages:{id}"));
        assert_eq!(keys.deadlines(), "murmur:chats:deadlines");
        assert_eq!(keys.message_seq(), "murmur:message:seq");
        assert_eq!(keys.outbox_queue(), "murmur:outbox:queue");
        assert_eq!(keys.outbox_record(id), format!("murmur:outbox:record:{id}"));
    }

    fn packed(pipe: &Pipeline) -> String {
        String::from_utf8_lossy(&pipe.get_packed_pipeline()).into_owned()
    }

    #[test]
    fn failed_chat_write_is_undone_everywhere() {
        let keys = Keys {
            prefix: "murmur:".to_string(),
        };
        let chat_id = Uuid::new_v4();
        let record_id = Uuid::new_v4();

        let cleanup = keys.compensation(&[keys.chat(chat_id)], Some(chat_id), None, Some(record_id));
        let packed = packed(&cleanup);

        assert!(packed.contains("DEL"));
        assert!(packed.contains(&keys.chat(chat_id)));
        assert!(packed.contains("ZREM"));
        assert!(packed.contains(&keys.deadlines()));
        assert!(packed.contains("LREM"));
        assert!(packed.contains(&keys.outbox_queue()));
        assert!(packed.contains(&record_id.to_string()));
        assert!(packed.contains(&keys.outbox_record(record_id)));
    }

    #[test]
    fn failed_post_removes_only_the_message_and_its_record() {
        let keys = Keys {
            prefix: "murmur:".to_string(),
        };
        let chat_id = Uuid::new_v4();
        let messages_key = keys.messages(chat_id);

        let cleanup = keys.compensation(&[], None, Some((messages_key.as_str(), "{\"id\":7}")), None);
        let packed = packed(&cleanup);

        assert!(packed.contains("LREM"));
        assert!(packed.contains(&messages_key));
        assert!(packed.contains("{\"id\":7}"));
        assert!(!packed.contains("DEL"));
        assert!(!packed.contains("ZREM"));
        assert!(!packed.contains(&keys.outbox_queue()));
    }
}
