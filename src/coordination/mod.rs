//! Storage shared by every replica: a named, non-blocking lease plus a small
//! key/value area holding the last announced environment fingerprint.

pub mod memory;
pub mod redis;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{CoordinationBackend, CoordinationConfig};

pub use memory::MemoryStore;
pub use redis::RedisStore;
pub use sqlite::SqliteStore;

/// A held lease. The token proves ownership when releasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub token: String,
}

impl Lease {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Never waits: `None` means someone else holds it right now.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>>;

    /// No-op if the lease already expired or changed hands.
    async fn release(&self, lease: &Lease) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Open the backend named in config.
pub async fn connect(config: &CoordinationConfig) -> Result<Arc<dyn CoordinationStore>> {
    info!("Coordination backend: {}", config.backend);
    let store: Arc<dyn CoordinationStore> = match config.backend {
        CoordinationBackend::Memory => {
            warn!(
                "In-memory coordination store: startup announcements are not deduplicated across processes or restarts"
            );
            Arc::new(MemoryStore::new())
        }
        CoordinationBackend::Sqlite => Arc::new(SqliteStore::open(&config.sqlite_path)?),
        CoordinationBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .context("coordination.redis_url is required for the redis backend")?;
            Arc::new(RedisStore::connect(url).await?)
        }
    };
    Ok(store)
}
