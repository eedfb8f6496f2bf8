//! SQLite backend.
//!
//! Every mutation runs in a transaction; the outbox insert is nested in a
//! savepoint so a failed enqueue can be undone on its own.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Connection, Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::entities::{from_millis, to_millis, Chat, Message, NewMessage, OutboxRecord};
use crate::retention::{Clock, SystemClock};
use crate::store::{ChatStore, OutboxOptions, OutboxPolicy, OutboxQueue};
use crate::types::{OutboxEvent, StoreError, StoreResult, Stored};

/// Chat store backed by a SQLite pool.
#[derive(Clone)]
pub struct SqliteChatStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    outbox: OutboxOptions,
}

impl SqliteChatStore {
    /// Wrap an already migrated pool.
    pub fn new(pool: SqlitePool, outbox: OutboxOptions) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            outbox,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Write the outbox record for `event` inside a savepoint of `tx`.
    async fn enqueue(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        event: &OutboxEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let record = OutboxRecord::for_event(event, now)?;
        let mut savepoint = tx.begin().await?;

        match insert_record(&mut savepoint, &self.outbox, &record).await {
            Ok(()) => {
                savepoint.commit().await?;
                debug!(outbox_id = %record.id, topic = %record.topic, "outbox record enqueued");
                Ok(())
            }
            Err(err) => {
                savepoint.rollback().await?;
                Err(err)
            }
        }
    }

    /// Apply the outbox policy to a transaction whose enqueue failed.
    async fn settle_failed_enqueue<T>(
        &self,
        tx: Transaction<'static, Sqlite>,
        stored: Stored,
        cause: StoreError,
    ) -> StoreResult<T> {
        match self.outbox.policy {
            OutboxPolicy::Lenient => tx.commit().await?,
            OutboxPolicy::Strict => tx.rollback().await?,
        }
        Err(self.outbox.policy.enqueue_failed(stored, cause))
    }
}

async fn insert_record(
    conn: &mut SqliteConnection,
    options: &OutboxOptions,
    record: &OutboxRecord,
) -> StoreResult<()> {
    let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE sent_ms IS NULL")
        .fetch_one(&mut *conn)
        .await?;
    options.admit(usize::try_from(pending).unwrap_or(usize::MAX))?;

    sqlx::query("INSERT INTO outbox (id, topic, payload, created_ms) VALUES (?, ?, ?, ?)")
        .bind(record.id.to_string())
        .bind(&record.topic)
        .bind(&record.payload)
        .bind(to_millis(record.created_at))
        .execute(&mut *conn)
        .await?;

    Ok(())
}

fn parse_uuid(row: &SqliteRow, column: &str) -> StoreResult<Uuid> {
    let raw: String = row.try_get(column)?;
    Ok(Uuid::parse_str(&raw)?)
}

fn chat_from_row(row: &SqliteRow) -> StoreResult<Chat> {
    Ok(Chat {
        id: parse_uuid(row, "id")?,
        owner_id: parse_uuid(row, "owner_id")?,
        readonly: row.try_get("readonly")?,
        deadline: from_millis(row.try_get("deadline_ms")?)?,
    })
}

fn message_from_row(row: &SqliteRow) -> StoreResult<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        chat_id: parse_uuid(row, "chat_id")?,
        author_id: parse_uuid(row, "author_id")?,
        body: row.try_get("body")?,
        published_at: from_millis(row.try_get("published_ms")?)?,
    })
}

fn record_from_row(row: &SqliteRow) -> StoreResult<OutboxRecord> {
    let sent_ms: Option<i64> = row.try_get("sent_ms")?;
    Ok(OutboxRecord {
        id: parse_uuid(row, "id")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        created_at: from_millis(row.try_get("created_ms")?)?,
        sent_at: sent_ms.map(from_millis).transpose()?,
    })
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn create_chat(&self, chat: Chat) -> StoreResult<Chat> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO chats (id, owner_id, readonly, deadline_ms) VALUES (?, ?, ?, ?)")
            .bind(chat.id.to_string())
            .bind(chat.owner_id.to_string())
            .bind(chat.readonly)
            .bind(to_millis(chat.deadline))
            .execute(&mut *tx)
            .await?;

        let enqueued = self
            .enqueue(&mut tx, &OutboxEvent::chat_created(&chat), now)
            .await;
        if let Err(err) = enqueued {
            return self.settle_failed_enqueue(tx, Stored::Chat(chat), err).await;
        }

        tx.commit().await?;
        info!(chat_id = %chat.id, owner_id = %chat.owner_id, "created chat");
        Ok(chat)
    }

    async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Chat> {
        let row = sqlx::query(
            "SELECT id, owner_id, readonly, deadline_ms FROM chats WHERE id = ? AND deadline_ms > ?",
        )
        .bind(chat_id.to_string())
        .bind(to_millis(self.clock.now()))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => chat_from_row(&row),
            None => Err(StoreError::chat_not_found(chat_id)),
        }
    }

    async fn chats_count(&self) -> StoreResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chats WHERE deadline_ms > ?")
            .bind(to_millis(self.clock.now()))
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn post_message(&self, chat_id: Uuid, message: NewMessage) -> StoreResult<Message> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        // single statement so the transaction takes the write lock up front
        let result = sqlx::query(
            "INSERT INTO messages (chat_id, author_id, body, published_ms)
             SELECT ?, ?, ?, ?
             WHERE EXISTS (SELECT 1 FROM chats WHERE id = ? AND deadline_ms > ?)",
        )
        .bind(chat_id.to_string())
        .bind(message.author_id.to_string())
        .bind(&message.body)
        .bind(to_millis(message.published_at))
        .bind(chat_id.to_string())
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::chat_not_found(chat_id));
        }

        let message = message.into_message(result.last_insert_rowid(), chat_id);

        let enqueued = self
            .enqueue(&mut tx, &OutboxEvent::message_posted(&message), now)
            .await;
        if let Err(err) = enqueued {
            return self
                .settle_failed_enqueue(tx, Stored::Message(message), err)
                .await;
        }

        tx.commit().await?;
        debug!(chat_id = %chat_id, message_id = message.id, "posted message");
        Ok(message)
    }

    async fn trim_messages(&self, chat_id: Uuid, max_messages: usize) -> StoreResult<usize> {
        let result = sqlx::query(
            "DELETE FROM messages WHERE id IN (
                 SELECT id FROM (
                     SELECT id, ROW_NUMBER() OVER (ORDER BY id DESC) AS recency
                     FROM messages WHERE chat_id = ?
                 ) WHERE recency > ?
             )",
        )
        .bind(chat_id.to_string())
        .bind(i64::try_from(max_messages).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;

        let removed = usize::try_from(result.rows_affected()).unwrap_or_default();
        if removed > 0 {
            debug!(chat_id = %chat_id, removed, "trimmed messages");
        }
        Ok(removed)
    }

    async fn chat_history(&self, chat_id: Uuid) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT m.id, m.chat_id, m.author_id, m.body, m.published_ms
             FROM messages m JOIN chats c ON c.id = m.chat_id
             WHERE m.chat_id = ? AND c.deadline_ms > ?
             ORDER BY m.id ASC",
        )
        .bind(chat_id.to_string())
        .bind(to_millis(self.clock.now()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let now = to_millis(self.clock.now());
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE chat_id IN (SELECT id FROM chats WHERE deadline_ms <= ?)")
            .bind(now)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM chats WHERE deadline_ms <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let removed = usize::try_from(result.rows_affected()).unwrap_or_default();
        if removed > 0 {
            info!(removed, "purged expired chats");
        }
        Ok(removed)
    }
}

#[async_trait]
impl OutboxQueue for SqliteChatStore {
    async fn next_pending(&self) -> StoreResult<OutboxRecord> {
        let row = sqlx::query(
            "SELECT id, topic, payload, created_ms, sent_ms FROM outbox
             WHERE sent_ms IS NULL ORDER BY seq ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(StoreError::OutboxEmpty),
        }
    }

    async fn confirm_sent(&self, outbox_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE outbox SET sent_ms = ? WHERE id = ? AND sent_ms IS NULL")
            .bind(to_millis(self.clock.now()))
            .bind(outbox_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_count(&self) -> StoreResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE sent_ms IS NULL")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
