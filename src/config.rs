//! Engine settings.
//!
//! Settings come from an optional YAML file layered under environment
//! variables prefixed with `THROTTLEGATE__`, e.g.
//! `THROTTLEGATE__STORE__BACKEND=redis`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::SharedClock;
use crate::error::Result;
use crate::store::document::InMemoryDocuments;
use crate::store::sql::InMemorySqlBackend;
use crate::store::table::InMemoryTable;
use crate::store::{
    CounterStore, DocumentCounterStore, MemoryCounterStore, RedisCounterStore, SqlCounterStore,
    TableCounterStore,
};

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "THROTTLEGATE";

/// Top-level settings for a throttling engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Path to the YAML rules file
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Rules reload interval in seconds; 0 disables hot reload
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    /// Counter namespace used when the rules file does not set one
    #[serde(default)]
    pub unique_name: Option<String>,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreSettings,

    /// Pause between capacity checks of a delayed request, in milliseconds
    #[serde(default = "default_delay_poll_interval")]
    pub delay_poll_interval_ms: u64,

    /// Expired row cleanup interval in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// How long past expiry a row is kept before cleanup, in seconds
    #[serde(default = "default_cleanup_grace")]
    pub cleanup_grace_secs: u64,

    /// Maximum rows removed per cleanup transaction
    #[serde(default = "default_cleanup_batch_size")]
    pub cleanup_batch_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            rules_path: None,
            reload_interval_secs: default_reload_interval(),
            unique_name: None,
            store: StoreSettings::default(),
            delay_poll_interval_ms: default_delay_poll_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            cleanup_grace_secs: default_cleanup_grace(),
            cleanup_batch_size: default_cleanup_batch_size(),
        }
    }
}

fn default_reload_interval() -> u64 {
    60
}

fn default_delay_poll_interval() -> u64 {
    200
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_cleanup_grace() -> u64 {
    300
}

fn default_cleanup_batch_size() -> usize {
    500
}

/// Which counter store backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local counters
    #[default]
    Memory,
    /// Shared counters in Redis
    Redis,
    /// Optimistic table store, in-process emulation
    Table,
    /// Conditional-patch document store, in-process emulation
    Document,
    /// Transactional SQL store, in-process emulation
    Sql,
}

/// Counter store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "throttlegate:".to_string()
}

impl EngineSettings {
    /// Load settings from an optional YAML file plus environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading engine settings");
            builder = builder.add_source(
                config::File::with_name(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parse settings from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn reload_interval(&self) -> Option<Duration> {
        (self.reload_interval_secs > 0).then(|| Duration::from_secs(self.reload_interval_secs))
    }

    pub fn delay_poll_interval(&self) -> Duration {
        Duration::from_millis(self.delay_poll_interval_ms.max(1))
    }

    /// Open the configured counter store. Backends with background cleanup
    /// run it until `shutdown` fires.
    pub async fn open_store(
        &self,
        clock: SharedClock,
        shutdown: &CancellationToken,
    ) -> Result<Arc<dyn CounterStore>> {
        let interval = Duration::from_secs(self.cleanup_interval_secs.max(1));
        let grace = Duration::from_secs(self.cleanup_grace_secs);
        let batch = self.cleanup_batch_size.max(1);

        info!(backend = ?self.store.backend, "Opening counter store");
        let store: Arc<dyn CounterStore> = match self.store.backend {
            StoreBackend::Memory => Arc::new(MemoryCounterStore::with_clock(clock)),
            StoreBackend::Redis => Arc::new(
                RedisCounterStore::connect(&self.store.redis_url, self.store.key_prefix.clone())
                    .await?,
            ),
            StoreBackend::Table => {
                let store = Arc::new(TableCounterStore::with_clock(
                    Arc::new(InMemoryTable::new()),
                    clock,
                ));
                store.clone().spawn_cleanup(interval, grace, batch, shutdown.clone());
                store
            }
            StoreBackend::Document => Arc::new(DocumentCounterStore::with_clock(
                Arc::new(InMemoryDocuments::new()),
                clock,
            )),
            StoreBackend::Sql => {
                let store = Arc::new(SqlCounterStore::with_clock(
                    Arc::new(InMemorySqlBackend::new()),
                    clock,
                ));
                store.clone().spawn_cleanup(interval, grace, batch, shutdown.clone());
                store
            }
        };
        Ok(store)
    }
}
