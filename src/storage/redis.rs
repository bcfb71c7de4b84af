use super::{RateLimitRecord, Storage};
use crate::clock::Clock;
use crate::config::RedisStorageOptions;
use crate::error::{RateLimiterError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Minimal key-value surface the Redis backend needs
///
/// Implemented for [`ConnectionManager`]; anything speaking the same four
/// commands can stand in for it.
#[async_trait]
pub trait KeyValueClient: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn expire(&self, key: &str, seconds: u64) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Write a value that expires after `seconds`
    ///
    /// Issued as a write followed by an explicit expiry; clients that support
    /// an atomic set-with-expiry should override this.
    async fn set_with_ttl(&self, key: &str, value: &str, seconds: u64) -> Result<()> {
        self.set(key, value).await?;
        self.expire(key, seconds).await
    }
}

#[async_trait]
impl KeyValueClient for ConnectionManager {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<()> {
        let mut conn = self.clone();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, seconds: u64) -> Result<()> {
        let mut conn = self.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(seconds)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

struct Inner<C> {
    client: C,
    prefix: String,
    clock: Arc<dyn Clock>,
}

impl<C: KeyValueClient> Inner<C> {
    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Redis expires keys itself
    fn cleanup(&self, _now: u64) -> Result<()> {
        Ok(())
    }
}

/// Redis-backed storage relying on key TTLs for expiration
///
/// Records are stored as JSON under `{prefix}{key}`. The connection is handed
/// in by the caller; this type never pools or reconnects on its own.
pub struct RedisStorage<C: KeyValueClient = ConnectionManager> {
    inner: Arc<Inner<C>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl RedisStorage<ConnectionManager> {
    /// Open a managed connection from `options.url`
    pub async fn connect(options: &RedisStorageOptions, clock: Arc<dyn Clock>) -> Result<Self> {
        let url = options.url.as_deref().ok_or_else(|| {
            RateLimiterError::invalid_configuration("Redis client is required: set storage.url")
        })?;

        let client = redis::Client::open(url)?;
        let mut connection = ConnectionManager::new(client).await?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut connection)
            .await?;
        info!(prefix = %options.prefix, "Connected to Redis rate limit storage");

        Ok(Self::new(connection, options, clock))
    }
}

impl<C: KeyValueClient> RedisStorage<C> {
    /// Wrap an existing client
    ///
    /// When called inside a Tokio runtime, starts a timer that invokes
    /// `cleanup` every `cleanup_interval_secs`.
    pub fn new(client: C, options: &RedisStorageOptions, clock: Arc<dyn Clock>) -> Self {
        let inner = Arc::new(Inner {
            client,
            prefix: options.prefix.clone(),
            clock,
        });

        let interval = Duration::from_secs(options.cleanup_interval_secs.max(1));
        let cleanup_task = tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| handle.spawn(cleanup_loop(Arc::downgrade(&inner), interval)));

        Self {
            inner,
            cleanup_task: Mutex::new(cleanup_task),
        }
    }

    pub fn client(&self) -> &C {
        &self.inner.client
    }

    fn stop_cleanup(&self) {
        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
        }
    }
}

async fn cleanup_loop<C: KeyValueClient>(inner: Weak<Inner<C>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let now = inner.clock.now_millis();
        if let Err(e) = inner.cleanup(now) {
            warn!(code = e.code(), "Redis cleanup failed: {}", e);
        }
        trace!("Redis cleanup tick");
    }
}

#[async_trait]
impl<C: KeyValueClient> Storage for RedisStorage<C> {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>> {
        let redis_key = self.inner.key(key);
        let Some(data) = self.inner.client.get(&redis_key).await? else {
            return Ok(None);
        };

        debug!(key = %redis_key, data = %data, "Redis GET");

        let record = match serde_json::from_str::<RateLimitRecord>(&data) {
            Ok(record) => record,
            Err(e) => {
                debug!(key = %redis_key, "Ignoring unparseable rate limit record: {}", e);
                return Ok(None);
            }
        };

        // TTLs are rounded up to whole seconds, so the key can outlive the window.
        if record.is_expired(self.inner.clock.now_millis()) {
            return Ok(None);
        }

        Ok(Some(record))
    }

    async fn set(&self, key: &str, record: RateLimitRecord) -> Result<()> {
        let redis_key = self.inner.key(key);
        let now = self.inner.clock.now_millis();

        if record.is_expired(now) {
            return self.inner.client.del(&redis_key).await;
        }

        let ttl = (record.reset - now).div_ceil(1000);
        let value = serde_json::to_string(&record).map_err(|e| {
            RateLimiterError::database_connection(format!("Failed to encode record: {}", e))
        })?;

        debug!(key = %redis_key, value = %value, ttl, "Redis SET");
        self.inner.client.set_with_ttl(&redis_key, &value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let redis_key = self.inner.key(key);
        debug!(key = %redis_key, "Redis DEL");
        self.inner.client.del(&redis_key).await
    }

    async fn cleanup(&self, now: u64) -> Result<()> {
        self.inner.cleanup(now)
    }

    async fn destroy(&self) {
        self.stop_cleanup();
    }
}

impl<C: KeyValueClient> Drop for RedisStorage<C> {
    fn drop(&mut self) {
        self.stop_cleanup();
    }
}
