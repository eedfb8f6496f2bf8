use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use murmur_chats::{ChatOptions, ChatService};
use murmur_config::{AppConfig, BusKind, StorageBackend};
use murmur_database::{
    initialize_database, ChatStore, MemoryChatStore, OutboxOptions, OutboxQueue, RedisChatStore,
    SqliteChatStore,
};
use murmur_outbox::{LogBus, MessageBus, Publisher, PublisherOptions, RedisStreamBus};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod telemetry {
    use anyhow::Result;
    use tracing::Level;
    use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

    pub fn init_tracing() -> Result<()> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = SubscriberBuilder::default()
            .with_max_level(Level::INFO)
            .with_env_filter(env_filter)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|error| anyhow::anyhow!("failed to set tracing subscriber: {error}"))
    }
}

/// How expired chats are removed for the configured backend.
#[derive(Clone)]
enum Sweeper {
    /// The in-memory store's own deadline scheduler.
    Scheduler(Arc<MemoryChatStore>),
    /// A periodic `purge_expired` call.
    Periodic {
        store: Arc<dyn ChatStore>,
        interval: Duration,
    },
}

#[derive(Clone)]
pub struct BackendServices {
    pub backend: StorageBackend,
    pub chat_service: Arc<ChatService>,
    pub store: Arc<dyn ChatStore>,
    pub outbox: Arc<dyn OutboxQueue>,
    pub bus: Arc<dyn MessageBus>,
    publisher: PublisherOptions,
    sweeper: Sweeper,
}

impl BackendServices {
    pub async fn initialise(config: &AppConfig) -> Result<Self> {
        let outbox_options = OutboxOptions::from(&config.outbox);
        let sweep_interval = config.storage.sweep_interval();

        let (store, outbox, sweeper): (Arc<dyn ChatStore>, Arc<dyn OutboxQueue>, Sweeper) =
            match config.storage.backend {
                StorageBackend::Memory => {
                    let store = Arc::new(MemoryChatStore::new(outbox_options));
                    (store.clone(), store.clone(), Sweeper::Scheduler(store))
                }
                StorageBackend::Sqlite => {
                    let pool = initialize_database(&config.storage.database)
                        .await
                        .context("failed to initialise sqlite database")?;
                    let store = Arc::new(SqliteChatStore::new(pool, outbox_options));
                    let sweeper = Sweeper::Periodic {
                        store: store.clone(),
                        interval: sweep_interval,
                    };
                    (store.clone(), store, sweeper)
                }
                StorageBackend::Redis => {
                    let store = Arc::new(
                        RedisChatStore::connect(&config.storage.redis, outbox_options)
                            .await
                            .context("failed to connect to redis")?,
                    );
                    let sweeper = Sweeper::Periodic {
                        store: store.clone(),
                        interval: sweep_interval,
                    };
                    (store.clone(), store, sweeper)
                }
            };

        let bus: Arc<dyn MessageBus> = match config.publisher.bus {
            BusKind::Log => Arc::new(LogBus),
            BusKind::RedisStream => Arc::new(
                RedisStreamBus::connect(&config.storage.redis, config.publisher.stream_prefix.clone())
                    .await
                    .context("failed to connect the redis stream bus")?,
            ),
        };

        let chat_service = Arc::new(ChatService::new(
            store.clone(),
            ChatOptions::from(&config.chats),
        ));

        info!(
            backend = ?config.storage.backend,
            bus = ?config.publisher.bus,
            policy = ?outbox_options.policy,
            "chat backend initialised"
        );

        Ok(Self {
            backend: config.storage.backend,
            chat_service,
            store,
            outbox,
            bus,
            publisher: PublisherOptions::from(&config.publisher),
            sweeper,
        })
    }

    /// Spawn the outbox publisher and the expiry sweeper.
    pub fn start(&self) -> BackgroundTasks {
        let shutdown = CancellationToken::new();
        let publisher = Publisher::new(self.outbox.clone(), self.bus.clone(), self.publisher);

        let sweeper = match self.sweeper.clone() {
            Sweeper::Scheduler(store) => tokio::spawn(store.run_expiry(shutdown.clone())),
            Sweeper::Periodic { store, interval } => {
                tokio::spawn(sweep_periodically(store, interval, shutdown.clone()))
            }
        };

        BackgroundTasks {
            handles: vec![tokio::spawn(publisher.run(shutdown.clone())), sweeper],
            shutdown,
        }
    }
}

async fn sweep_periodically(store: Arc<dyn ChatStore>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs(), "expiry sweeper started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match store.purge_expired().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "swept expired chats"),
            Err(error) => warn!(%error, "expiry sweep failed"),
        }
    }

    info!("expiry sweeper stopped");
}

/// Handles to the spawned background loops.
pub struct BackgroundTasks {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel every loop and wait for it to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(error) = handle.await {
                warn!(%error, "background task ended abnormally");
            }
        }
    }
}

pub async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(?error, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
