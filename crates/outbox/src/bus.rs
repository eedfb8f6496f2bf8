//! Message bus abstraction and the adapters the publisher can drive.

use async_trait::async_trait;
use murmur_config::RedisConfig;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    #[error("bus rejected {topic}/{key}: {reason}")]
    Rejected {
        topic: String,
        key: String,
        reason: String,
    },
}

impl BusError {
    pub fn rejected(topic: &str, key: &str, reason: impl Into<String>) -> Self {
        Self::Rejected {
            topic: topic.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Downstream event bus. `Ok` means the bus acknowledged the message.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError>;
}

/// Bus that only writes each event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogBus;

#[async_trait]
impl MessageBus for LogBus {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError> {
        info!(
            topic,
            key,
            payload = %String::from_utf8_lossy(payload),
            "event published"
        );
        Ok(())
    }
}

/// Appends every event to a Redis stream named `{stream_prefix}{topic}`.
#[derive(Clone)]
pub struct RedisStreamBus {
    conn: ConnectionManager,
    stream_prefix: String,
}

impl RedisStreamBus {
    pub fn new(conn: ConnectionManager, stream_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            stream_prefix: stream_prefix.into(),
        }
    }

    pub async fn connect(config: &RedisConfig, stream_prefix: impl Into<String>) -> Result<Self, BusError> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, stream_prefix))
    }

    pub fn stream_for(&self, topic: &str) -> String {
        format!("{}{}", self.stream_prefix, topic)
    }
}

#[async_trait]
impl MessageBus for RedisStreamBus {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError> {
        let stream = self.stream_for(topic);
        let mut conn = self.conn.clone();
        let entry: Option<String> = redis::cmd("XADD")
            .arg(&stream)
            .arg("*")
            .arg("key")
            .arg(key)
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        match entry {
            Some(entry) => {
                debug!(stream = %stream, key, entry = %entry, "event appended to stream");
                Ok(())
            }
            None => Err(BusError::rejected(topic, key, "XADD returned no entry id")),
        }
    }
}
