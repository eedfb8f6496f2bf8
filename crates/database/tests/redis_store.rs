//! Redis backend tests. They need a running server and skip themselves when
//! none answers at `MURMUR_TEST_REDIS_URL`.

use std::sync::Arc;

use chrono::{Duration, Utc};
use murmur_config::RedisConfig;
use murmur_database::{
    Chat, ChatStore, Clock, ManualClock, NewMessage, OutboxEvent, OutboxOptions, OutboxPolicy,
    OutboxQueue, RedisChatStore, StoreError,
};
use redis::AsyncCommands;
use uuid::Uuid;

struct TestContext {
    store: RedisChatStore,
    clock: Arc<ManualClock>,
    url: String,
    prefix: String,
}

impl TestContext {
    async fn connect(outbox: OutboxOptions) -> Option<Self> {
        let url = std::env::var("MURMUR_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let prefix = format!("murmur-test:{}:", Uuid::new_v4());

        let client = redis::Client::open(url.as_str()).ok()?;
        let probe = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            client.get_multiplexed_async_connection(),
        )
        .await;
        if !matches!(probe, Ok(Ok(_))) {
            eprintln!("skipping redis test: no server at {url}");
            return None;
        }

        let config = RedisConfig {
            url: url.clone(),
            key_prefix: prefix.clone(),
        };
        let clock = Arc::new(ManualClock::default());
        let store = RedisChatStore::connect(&config, outbox)
            .await
            .ok()?
            .with_clock(clock.clone());

        Some(Self {
            store,
            clock,
            url,
            prefix,
        })
    }

    fn chat(&self, ttl: Duration) -> Chat {
        Chat::new(Uuid::new_v4(), false, self.clock.now() + ttl)
    }

    async fn cleanup(self) {
        let Ok(client) = redis::Client::open(self.url.as_str()) else {
            return;
        };
        let Ok(mut conn) = client.get_multiplexed_async_connection().await else {
            return;
        };
        let keys: Vec<String> = conn
            .keys(format!("{}*", self.prefix))
            .await
            .unwrap_or_default();
        if !keys.is_empty() {
            let _: Result<(), _> = conn.del(keys).await;
        }
    }
}

#[tokio::test]
async fn create_chat_and_outbox_in_one_transaction() {
    let Some(ctx) = TestContext::connect(OutboxOptions::default()).await else {
        return;
    };

    let chat = ctx.store.create_chat(ctx.chat(Duration::hours(1))).await.unwrap();

    assert_eq!(ctx.store.get_chat(chat.id).await.unwrap(), chat);
    assert_eq!(ctx.store.chats_count().await.unwrap(), 1);
    assert_eq!(ctx.store.pending_count().await.unwrap(), 1);

    let record = ctx.store.next_pending().await.unwrap();
    assert_eq!(record.decode().unwrap(), OutboxEvent::chat_created(&chat));

    ctx.store.confirm_sent(record.id).await.unwrap();
    ctx.store.confirm_sent(record.id).await.unwrap();
    assert!(ctx.store.next_pending().await.unwrap_err().is_empty());

    ctx.cleanup().await;
}

#[tokio::test]
async fn history_is_oldest_first_and_trim_keeps_newest() {
    let Some(ctx) = TestContext::connect(OutboxOptions::default()).await else {
        return;
    };

    let chat = ctx.store.create_chat(ctx.chat(Duration::hours(1))).await.unwrap();
    for body in ["first", "second", "third"] {
        ctx.store
            .post_message(chat.id, NewMessage::new(chat.owner_id, body, Utc::now()))
            .await
            .unwrap();
    }

    assert_eq!(ctx.store.trim_messages(chat.id, 2).await.unwrap(), 1);
    assert_eq!(ctx.store.trim_messages(chat.id, 2).await.unwrap(), 0);

    let history = ctx.store.chat_history(chat.id).await.unwrap();
    let bodies: Vec<&str> = history.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["second", "third"]);
    assert!(history[0].id < history[1].id);

    ctx.cleanup().await;
}

#[tokio::test]
async fn expired_chat_disappears_and_is_purged() {
    let Some(ctx) = TestContext::connect(OutboxOptions::default()).await else {
        return;
    };

    let chat = ctx.store.create_chat(ctx.chat(Duration::hours(1))).await.unwrap();
    ctx.store
        .post_message(chat.id, NewMessage::new(chat.owner_id, "hi", Utc::now()))
        .await
        .unwrap();

    ctx.clock.advance(Duration::hours(2));

    assert!(ctx.store.get_chat(chat.id).await.unwrap_err().is_not_found());
    assert!(ctx.store.chat_history(chat.id).await.unwrap().is_empty());
    assert_eq!(ctx.store.chats_count().await.unwrap(), 0);
    assert_eq!(ctx.store.purge_expired().await.unwrap(), 1);
    assert_eq!(ctx.store.purge_expired().await.unwrap(), 0);

    ctx.cleanup().await;
}

#[tokio::test]
async fn post_to_vanished_chat_writes_nothing() {
    let Some(ctx) = TestContext::connect(OutboxOptions::default()).await else {
        return;
    };

    let removed = ctx.store.create_chat(ctx.chat(Duration::hours(1))).await.unwrap();
    let expiring = ctx.store.create_chat(ctx.chat(Duration::minutes(1))).await.unwrap();
    let pending = ctx.store.pending_count().await.unwrap();

    let client = redis::Client::open(ctx.url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let _: () = conn.del(format!("{}chat:{}", ctx.prefix, removed.id)).await.unwrap();
    ctx.clock.advance(Duration::minutes(2));

    for chat in [&removed, &expiring] {
        let err = ctx
            .store
            .post_message(chat.id, NewMessage::new(chat.owner_id, "late", Utc::now()))
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "{err:?}");

        let exists: bool = conn
            .exists(format!("{}messages:{}", ctx.prefix, chat.id))
            .await
            .unwrap();
        assert!(!exists);
    }
    assert_eq!(ctx.store.pending_count().await.unwrap(), pending);

    ctx.cleanup().await;
}

#[tokio::test]
async fn full_outbox_follows_policy() {
    let Some(lenient) = TestContext::connect(OutboxOptions {
        policy: OutboxPolicy::Lenient,
        max_pending: Some(0),
    })
    .await
    else {
        return;
    };

    let kept = match lenient.store.create_chat(lenient.chat(Duration::hours(1))).await {
        Err(StoreError::NotificationFailed(stored)) => stored.into_chat().unwrap(),
        other => panic!("expected NotificationFailed, got {other:?}"),
    };
    assert_eq!(lenient.store.get_chat(kept.id).await.unwrap(), kept);
    assert_eq!(lenient.store.pending_count().await.unwrap(), 0);
    lenient.cleanup().await;

    let Some(strict) = TestContext::connect(OutboxOptions {
        policy: OutboxPolicy::Strict,
        max_pending: Some(0),
    })
    .await
    else {
        return;
    };

    let dropped = strict.chat(Duration::hours(1));
    let err = strict.store.create_chat(dropped.clone()).await.unwrap_err();
    assert!(matches!(err, StoreError::Internal(_)));
    assert!(strict.store.get_chat(dropped.id).await.unwrap_err().is_not_found());
    assert_eq!(strict.store.chats_count().await.unwrap(), 0);
    strict.cleanup().await;
}
