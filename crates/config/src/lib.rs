use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

const DEFAULT_CONFIG_FILES: &[&str] = &[
    "murmur.toml",
    "config/murmur.toml",
    "crates/config/murmur.toml",
    "../murmur.toml",
    "../config/murmur.toml",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub chats: ChatLimitsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
}

/// Admission and retention limits applied by the chat service.
///
/// ```
/// use murmur_config::ChatLimitsConfig;
///
/// let limits = ChatLimitsConfig::default();
/// assert_eq!(limits.max_chats, 100);
/// assert_eq!(limits.default_ttl().as_secs(), 3600);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatLimitsConfig {
    pub max_chats: usize,
    pub max_messages_per_chat: usize,
    pub default_ttl_seconds: u64,
    #[serde(default = "ChatLimitsConfig::default_operation_timeout")]
    pub operation_timeout_ms: u64,
}

impl ChatLimitsConfig {
    const fn default_operation_timeout() -> u64 {
        5_000
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Default for ChatLimitsConfig {
    fn default() -> Self {
        Self {
            max_chats: 100,
            max_messages_per_chat: 50,
            default_ttl_seconds: 3_600,
            operation_timeout_ms: Self::default_operation_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    #[serde(default = "StorageConfig::default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
}

impl StorageConfig {
    const fn default_sweep_interval() -> u64 {
        30
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            sweep_interval_seconds: Self::default_sweep_interval(),
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://murmur.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "RedisConfig::default_key_prefix")]
    pub key_prefix: String,
}

impl RedisConfig {
    fn default_key_prefix() -> String {
        "murmur:".to_string()
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: Self::default_key_prefix(),
        }
    }
}

/// What a store does when the outbox half of a write fails after the
/// primary half succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxPolicyConfig {
    /// Keep the chat or message and report the missing notification.
    #[default]
    Lenient,
    /// Undo the whole write.
    Strict,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboxConfig {
    #[serde(default)]
    pub policy: OutboxPolicyConfig,
    #[serde(default)]
    pub max_pending: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    #[default]
    Log,
    RedisStream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    pub poll_interval_ms: u64,
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub bus: BusKind,
    #[serde(default = "PublisherConfig::default_stream_prefix")]
    pub stream_prefix: String,
}

impl PublisherConfig {
    fn default_stream_prefix() -> String {
        "murmur.events.".to_string()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.poll_interval_ms))
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            max_backoff_ms: 30_000,
            bus: BusKind::default(),
            stream_prefix: Self::default_stream_prefix(),
        }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Load the application configuration by combining defaults, files, and environment overrides.
///
/// ```
/// use murmur_config::load;
///
/// std::env::remove_var("MURMUR_CONFIG");
///
/// let config = load().expect("configuration should load with defaults");
/// assert!(config.chats.max_chats > 0);
/// ```
pub fn load() -> anyhow::Result<AppConfig> {
    let defaults = AppConfig::default();

    let mut builder = config::Config::builder()
        .set_default("chats.max_chats", to_i64(defaults.chats.max_chats as u64))?
        .set_default(
            "chats.max_messages_per_chat",
            to_i64(defaults.chats.max_messages_per_chat as u64),
        )?
        .set_default(
            "chats.default_ttl_seconds",
            to_i64(defaults.chats.default_ttl_seconds),
        )?
        .set_default(
            "chats.operation_timeout_ms",
            to_i64(defaults.chats.operation_timeout_ms),
        )?
        .set_default("storage.backend", "memory")?
        .set_default(
            "storage.sweep_interval_seconds",
            to_i64(defaults.storage.sweep_interval_seconds),
        )?
        .set_default("storage.database.url", defaults.storage.database.url.clone())?
        .set_default(
            "storage.database.max_connections",
            i64::from(defaults.storage.database.max_connections),
        )?
        .set_default("storage.redis.url", defaults.storage.redis.url.clone())?
        .set_default(
            "storage.redis.key_prefix",
            defaults.storage.redis.key_prefix.clone(),
        )?
        .set_default("outbox.policy", "lenient")?
        .set_default(
            "publisher.poll_interval_ms",
            to_i64(defaults.publisher.poll_interval_ms),
        )?
        .set_default(
            "publisher.max_backoff_ms",
            to_i64(defaults.publisher.max_backoff_ms),
        )?
        .set_default("publisher.bus", "log")?
        .set_default(
            "publisher.stream_prefix",
            defaults.publisher.stream_prefix.clone(),
        )?;

    let environment_overrides = config::Environment::with_prefix("MURMUR").separator("__");

    let mut config_file_attached = false;

    if let Ok(path) = std::env::var("MURMUR_CONFIG") {
        builder = builder.add_source(config::File::from(PathBuf::from(&path)));
        config_file_attached = true;
        debug!(path, "loading configuration via MURMUR_CONFIG");
    } else if let Ok(cwd) = std::env::current_dir() {
        let fallback = DEFAULT_CONFIG_FILES
            .iter()
            .map(|candidate| cwd.join(candidate))
            .find(|path| path.exists());

        if let Some(path) = fallback {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(config::File::from(path));
            config_file_attached = true;
        }
    }

    if !config_file_attached {
        debug!("no configuration file found, relying on defaults and environment overrides");
    }

    builder = builder.add_source(environment_overrides);

    let cfg = builder.build().context("unable to build configuration")?;

    let config = cfg
        .try_deserialize::<AppConfig>()
        .context("invalid configuration")?;

    validate(&config)?;

    debug!(?config, "loaded configuration");
    Ok(config)
}

fn validate(config: &AppConfig) -> anyhow::Result<()> {
    if config.chats.max_chats == 0 {
        bail!("invalid configuration: chats.max_chats must be greater than zero");
    }
    if config.chats.max_messages_per_chat == 0 {
        bail!("invalid configuration: chats.max_messages_per_chat must be greater than zero");
    }
    if config.chats.default_ttl_seconds == 0 {
        bail!("invalid configuration: chats.default_ttl_seconds must be greater than zero");
    }
    if config.publisher.poll_interval_ms == 0 {
        bail!("invalid configuration: publisher.poll_interval_ms must be greater than zero");
    }
    Ok(())
}
