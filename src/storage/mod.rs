//! Storage backends for rate limit records
//!
//! Every backend stores one [`RateLimitRecord`] per key and must behave the
//! same way from the engine's point of view:
//!
//! - **memory**: process-wide map with a time-bucketed expiration index
//! - **redis**: JSON values with native TTL expiration
//! - **database**: PostgreSQL table validated against `information_schema`
//! - **actor**: one task per key, serializing every update for that key
//!
//! A record whose `reset` is at or before "now" is treated as absent by `get`
//! on every backend, whether or not it has been physically removed yet.

use crate::clock::Clock;
use crate::config::StorageConfig;
use crate::error::Result;
use crate::rate_limit::engine::{decide, Decision};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod actor;
pub mod database;
pub mod memory;
pub mod redis;

pub use actor::ActorStorage;
pub use database::DatabaseStorage;
pub use memory::{MemoryStorage, MemoryStore};
pub use redis::{KeyValueClient, RedisStorage};

/// State of one fixed window for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    /// Requests counted in the current window
    pub count: u32,
    /// Unix timestamp (ms) at which the window ends
    pub reset: u64,
}

impl RateLimitRecord {
    pub fn new(count: u32, reset: u64) -> Self {
        Self { count, reset }
    }

    /// Whether the window has lapsed at `now` (ms)
    pub fn is_expired(&self, now: u64) -> bool {
        self.reset <= now
    }
}

/// Common contract implemented by every backend
#[async_trait]
pub trait Storage: Send + Sync {
    /// Backend name for logs and metrics
    fn name(&self) -> &'static str;

    /// Fetch the live record for `key`; expired records read as `None`
    async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>>;

    /// Insert or replace the record for `key`
    async fn set(&self, key: &str, record: RateLimitRecord) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Evict records whose window ended at or before `now` (ms)
    async fn cleanup(&self, now: u64) -> Result<()>;

    /// Release timers and connections held by the backend
    async fn destroy(&self) {}

    /// Count one request against `key`.
    ///
    /// The default is a plain read-modify-write over `get` and `set`: two
    /// concurrent requests for the same key can both read the same record and
    /// both write `count + 1`. Rejections never write.
    async fn apply(&self, key: &str, limit: u32, window_millis: u64, now: u64) -> Result<Decision> {
        let current = self.get(key).await?;
        let decision = decide(current, limit, window_millis, now);

        if let Some(record) = decision.to_persist() {
            self.set(key, record).await?;
        }

        Ok(decision)
    }
}

/// Build the backend selected by `config`
///
/// Redis connects eagerly; PostgreSQL connects lazily and validates its schema
/// on first use.
pub async fn create_storage(
    config: &StorageConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match config {
        StorageConfig::Memory => Arc::new(MemoryStorage::shared(clock)),
        StorageConfig::Redis(options) => Arc::new(RedisStorage::connect(options, clock).await?),
        StorageConfig::Postgres(options) => Arc::new(DatabaseStorage::connect(options, clock)?),
        StorageConfig::Actor => Arc::new(ActorStorage::new(clock)),
    };

    Ok(storage)
}
