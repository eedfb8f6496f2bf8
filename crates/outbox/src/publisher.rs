//! Background loop that moves outbox records onto the message bus.

use std::sync::Arc;
use std::time::Duration;

use murmur_config::PublisherConfig;
use murmur_database::OutboxQueue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::MessageBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherOptions {
    pub poll_interval: Duration,
    pub max_backoff: Duration,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self::from(&PublisherConfig::default())
    }
}

impl From<&PublisherConfig> for PublisherOptions {
    fn from(config: &PublisherConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_backoff: config.max_backoff(),
        }
    }
}

/// Outcome of a single publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The head record was acknowledged by the bus.
    Published(Uuid),
    /// Nothing pending.
    Idle,
    /// The bus acknowledged the head record but confirming it failed, so it
    /// is still at the head of the queue.
    Unconfirmed(Uuid),
    /// Polling or publishing failed; the head record stays queued.
    Failed,
}

/// Drains one outbox queue in FIFO order with at-least-once delivery.
pub struct Publisher {
    queue: Arc<dyn OutboxQueue>,
    bus: Arc<dyn MessageBus>,
    options: PublisherOptions,
}

impl Publisher {
    pub fn new(queue: Arc<dyn OutboxQueue>, bus: Arc<dyn MessageBus>, options: PublisherOptions) -> Self {
        Self { queue, bus, options }
    }

    /// Run until `shutdown` is cancelled. An in-flight publish and confirm
    /// always complete before the loop exits.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            max_backoff_ms = self.options.max_backoff.as_millis() as u64,
            "outbox publisher started"
        );

        let mut backoff = Backoff::new(self.options);
        while !shutdown.is_cancelled() {
            let wait = match self.publish_next().await {
                Delivery::Published(_) => {
                    backoff.reset();
                    continue;
                }
                Delivery::Idle => {
                    backoff.reset();
                    self.options.poll_interval
                }
                Delivery::Unconfirmed(_) | Delivery::Failed => backoff.next_delay(),
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("outbox publisher stopped");
    }

    /// Publish the oldest pending record, if any, and confirm it.
    pub async fn publish_next(&self) -> Delivery {
        let record = match self.queue.next_pending().await {
            Ok(record) => record,
            Err(err) if err.is_empty() => return Delivery::Idle,
            Err(err) => {
                warn!(error = %err, "failed to poll outbox");
                return Delivery::Failed;
            }
        };

        let key = record.key();
        if let Err(err) = self.bus.publish(&record.topic, &key, &record.payload).await {
            warn!(
                outbox_id = %record.id,
                topic = %record.topic,
                error = %err,
                "failed to publish outbox record"
            );
            return Delivery::Failed;
        }

        // Confirmation is not retried; the record is published again once the
        // loop has backed off.
        match self.queue.confirm_sent(record.id).await {
            Ok(()) => {
                debug!(outbox_id = %record.id, topic = %record.topic, "outbox record delivered");
                Delivery::Published(record.id)
            }
            Err(err) => {
                warn!(
                    outbox_id = %record.id,
                    topic = %record.topic,
                    error = %err,
                    "published to the bus but failed to confirm delivery"
                );
                Delivery::Unconfirmed(record.id)
            }
        }
    }
}

/// Exponential delay between failed attempts.
#[derive(Debug)]
struct Backoff {
    options: PublisherOptions,
    current: Option<Duration>,
}

impl Backoff {
    fn new(options: PublisherOptions) -> Self {
        Self {
            options,
            current: None,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.options.poll_interval,
            Some(previous) => previous.saturating_mul(2).min(self.options.max_backoff),
        };
        self.current = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusError;
    use async_trait::async_trait;
    use chrono::Utc;
    use murmur_database::{
        Chat, ChatStore, MemoryChatStore, NewMessage, OutboxEvent, OutboxRecord, StoreError,
        StoreResult,
    };
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Records what it receives and refuses the first `failures` attempts.
    #[derive(Default)]
    struct RecordingBus {
        failures: Mutex<usize>,
        attempts: Mutex<Vec<Instant>>,
        published: Mutex<Vec<(String, String, Vec<u8>)>>,
    }

    impl RecordingBus {
        fn failing(failures: usize) -> Self {
            Self {
                failures: Mutex::new(failures),
                ..Self::default()
            }
        }

        fn published(&self) -> Vec<(String, String, Vec<u8>)> {
            self.published.lock().unwrap().clone()
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError> {
            self.attempts.lock().unwrap().push(Instant::now());
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(BusError::Unavailable("broker down".to_string()));
                }
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), key.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    /// Queue whose confirmations never stick.
    struct UnconfirmableQueue(Arc<MemoryChatStore>);

    #[async_trait]
    impl OutboxQueue for UnconfirmableQueue {
        async fn next_pending(&self) -> StoreResult<OutboxRecord> {
            self.0.next_pending().await
        }

        async fn confirm_sent(&self, _outbox_id: Uuid) -> StoreResult<()> {
            Err(StoreError::internal("confirm unavailable"))
        }

        async fn pending_count(&self) -> StoreResult<usize> {
            self.0.pending_count().await
        }
    }

    fn options() -> PublisherOptions {
        PublisherOptions {
            poll_interval: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
        }
    }

    async fn store_with_events() -> (Arc<MemoryChatStore>, Chat) {
        let store = Arc::new(MemoryChatStore::default());
        let chat = store
            .create_chat(Chat::new(Uuid::new_v4(), false, Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        store
            .post_message(chat.id, NewMessage::new(chat.owner_id, "hello", Utc::now()))
            .await
            .unwrap();
        (store, chat)
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_order_keyed_by_record_id() {
        let (store, chat) = store_with_events().await;
        let bus = Arc::new(RecordingBus::default());
        let publisher = Publisher::new(store.clone(), bus.clone(), options());

        let first = store.next_pending().await.unwrap();
        assert_eq!(publisher.publish_next().await, Delivery::Published(first.id));
        assert!(matches!(publisher.publish_next().await, Delivery::Published(_)));
        assert_eq!(publisher.publish_next().await, Delivery::Idle);

        let published = bus.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, "chats");
        assert_eq!(published[0].1, first.id.to_string());
        assert_eq!(
            OutboxEvent::decode(&published[0].2).unwrap(),
            OutboxEvent::chat_created(&chat)
        );
        assert_eq!(published[1].0, "messages");
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failures_back_off_exponentially() {
        let (store, _) = store_with_events().await;
        let bus = Arc::new(RecordingBus::failing(4));
        let publisher = Publisher::new(store.clone(), bus.clone(), options());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(publisher.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(20)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let attempts = bus.attempts();
        assert_eq!(attempts.len(), 6);
        let gaps: Vec<u64> = attempts
            .windows(2)
            .take(4)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect();
        assert_eq!(gaps, vec![1, 2, 4, 4]);

        // the retried head record is delivered first
        let published = bus.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, "chats");
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_failure_is_not_retried() {
        let (store, _) = store_with_events().await;
        let queue = Arc::new(UnconfirmableQueue(store));
        let bus = Arc::new(RecordingBus::default());
        let publisher = Publisher::new(queue.clone(), bus.clone(), options());

        let head = queue.next_pending().await.unwrap();
        assert_eq!(publisher.publish_next().await, Delivery::Unconfirmed(head.id));

        assert_eq!(bus.published().len(), 1);
        assert_eq!(queue.pending_count().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_record_is_republished_only_after_backing_off() {
        let (store, _) = store_with_events().await;
        let head = store.next_pending().await.unwrap();
        let queue = Arc::new(UnconfirmableQueue(store));
        let bus = Arc::new(RecordingBus::default());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Publisher::new(queue, bus.clone(), options()).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let attempts = bus.attempts();
        assert_eq!(attempts.len(), 4);
        let gaps: Vec<u64> = attempts
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect();
        assert_eq!(gaps, vec![1, 2, 4]);
        assert!(bus
            .published()
            .iter()
            .all(|(_, key, _)| *key == head.id.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_publisher_stops_on_cancel() {
        let store = Arc::new(MemoryChatStore::default());
        let bus = Arc::new(RecordingBus::default());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Publisher::new(store, bus.clone(), options()).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(3)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(bus.attempts().is_empty());
    }

    #[test]
    fn backoff_doubles_up_to_the_cap_and_resets() {
        let mut backoff = Backoff::new(options());
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 4, 4]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
