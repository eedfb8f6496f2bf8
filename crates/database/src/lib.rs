//! Murmur Database Crate
//!
//! Chat and message storage with a co-located transactional outbox. Three
//! interchangeable backends implement [`ChatStore`] and [`OutboxQueue`]:
//! process memory, SQLite and Redis.

use murmur_config::DatabaseConfig;
use sqlx::SqlitePool;

pub mod connection;
pub mod entities;
pub mod migrations;
pub mod retention;
pub mod store;
pub mod stores;
pub mod types;

pub use connection::prepare_database;
pub use migrations::run_migrations;

pub use entities::{Chat, Message, NewMessage, OutboxRecord, CHATS_TOPIC, MESSAGES_TOPIC};
pub use retention::{Clock, ManualClock, SystemClock};
pub use store::{
    ChatStore, IdGenerator, OutboxOptions, OutboxPolicy, OutboxQueue, SequentialIds,
};
pub use stores::{MemoryChatStore, RedisChatStore, SqliteChatStore};
pub use types::{OutboxEvent, StoreError, StoreResult, Stored};

/// Open the SQLite pool and bring its schema up to date.
pub async fn initialize_database(config: &DatabaseConfig) -> StoreResult<SqlitePool> {
    let pool = prepare_database(config)
        .await
        .map_err(|e| StoreError::Database(format!("{e:#}")))?;

    run_migrations(&pool)
        .await
        .map_err(|e| StoreError::Database(format!("{e:#}")))?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn initialize_database_applies_schema() {
        let temp_dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite:{}", temp_dir.path().join("init.db").display()),
            max_connections: 1,
        };

        let pool = initialize_database(&config).await.unwrap();

        let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn initialize_database_reports_unusable_path() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let config = DatabaseConfig {
            url: format!("sqlite:{}", blocker.join("db.sqlite").display()),
            max_connections: 1,
        };

        let err = initialize_database(&config).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }
}
