use super::{RateLimitRecord, Storage};
use crate::clock::Clock;
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Width of one expiration bucket in seconds
pub const BUCKET_SIZE_SECS: u64 = 10;

/// Minimum spacing between passive cleanups, in milliseconds
pub const CLEANUP_INTERVAL_MILLIS: u64 = 10_000;

static GLOBAL_STORE: OnceLock<Arc<MemoryStore>> = OnceLock::new();

/// Record set shared by memory backends
///
/// Records live in a sharded map; a second index groups keys by the
/// [`BUCKET_SIZE_SECS`]-wide bucket their window ends in, so cleanup only
/// visits buckets that have started expiring. The index is a hint: a key may
/// linger in an old bucket after being rewritten, and cleanup re-checks the
/// record before removing anything.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, RateLimitRecord>,
    expirations: Mutex<BTreeMap<u64, HashSet<String>>>,
    last_cleanup: AtomicU64,
}

impl MemoryStore {
    /// Create an isolated store
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide store, created on first use and never dropped
    pub fn global() -> Arc<MemoryStore> {
        GLOBAL_STORE
            .get_or_init(|| Arc::new(MemoryStore::new()))
            .clone()
    }

    /// Number of records held, expired or not
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of non-empty expiration buckets
    pub fn bucket_count(&self) -> usize {
        self.expirations.lock().len()
    }

    /// Drop every record and reset the cleanup schedule
    pub fn clear(&self) {
        let mut index = self.expirations.lock();
        self.records.clear();
        index.clear();
        self.last_cleanup.store(0, Ordering::Release);
    }

    fn bucket(reset: u64) -> u64 {
        reset / 1000 / BUCKET_SIZE_SECS * BUCKET_SIZE_SECS
    }

    fn get(&self, key: &str, now: u64) -> Option<RateLimitRecord> {
        let record = self.records.get(key).map(|entry| *entry.value())?;

        if record.is_expired(now) {
            self.records.remove_if(key, |_, r| r.is_expired(now));
            return None;
        }

        Some(record)
    }

    fn insert(&self, key: &str, record: RateLimitRecord) {
        let previous = self.records.insert(key.to_string(), record);

        let mut index = self.expirations.lock();
        if let Some(previous) = previous {
            Self::unindex(&mut index, key, previous.reset);
        }
        index
            .entry(Self::bucket(record.reset))
            .or_default()
            .insert(key.to_string());
    }

    fn remove(&self, key: &str) {
        if let Some((_, record)) = self.records.remove(key) {
            let mut index = self.expirations.lock();
            Self::unindex(&mut index, key, record.reset);
        }
    }

    fn unindex(index: &mut BTreeMap<u64, HashSet<String>>, key: &str, reset: u64) {
        let bucket = Self::bucket(reset);
        if let Some(keys) = index.get_mut(&bucket) {
            keys.remove(key);
            if keys.is_empty() {
                index.remove(&bucket);
            }
        }
    }

    /// Remove expired records, walking buckets oldest first
    ///
    /// Stops at the first bucket that starts after `now`. The bucket containing
    /// `now` is drained partially, keeping keys whose window is still open.
    pub fn sweep(&self, now: u64) -> usize {
        let now_secs = now / 1000;
        let mut removed = 0;
        let mut drained = Vec::new();
        let mut index = self.expirations.lock();

        for (&bucket, keys) in index.iter_mut() {
            if bucket > now_secs {
                break;
            }

            keys.retain(|key| {
                if self.records.remove_if(key, |_, r| r.is_expired(now)).is_some() {
                    removed += 1;
                    return false;
                }
                // Keep the key only while this bucket is still where it lives.
                self.records
                    .get(key)
                    .is_some_and(|r| Self::bucket(r.reset) == bucket)
            });

            if keys.is_empty() {
                drained.push(bucket);
            }
        }

        for bucket in drained {
            index.remove(&bucket);
        }

        removed
    }

    /// Run [`MemoryStore::sweep`] if the last one was long enough ago
    fn maybe_sweep(&self, now: u64) {
        let last = self.last_cleanup.load(Ordering::Acquire);
        if now.saturating_sub(last) < CLEANUP_INTERVAL_MILLIS {
            return;
        }

        if self
            .last_cleanup
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let removed = self.sweep(now);
            if removed > 0 {
                debug!(removed, "Passive cleanup evicted expired records");
            }
        }
    }
}

/// In-memory storage backend
///
/// All instances created with [`MemoryStorage::shared`] funnel into the same
/// [`MemoryStore`], so several limiters registered in one process share
/// counters for equal keys.
pub struct MemoryStorage {
    store: Arc<MemoryStore>,
    clock: Arc<dyn Clock>,
}

impl MemoryStorage {
    /// Create a backend over an explicit store
    pub fn new(store: Arc<MemoryStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create a backend over the process-wide store
    pub fn shared(clock: Arc<dyn Clock>) -> Self {
        Self::new(MemoryStore::global(), clock)
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>> {
        let now = self.clock.now_millis();
        self.store.maybe_sweep(now);
        Ok(self.store.get(key, now))
    }

    async fn set(&self, key: &str, record: RateLimitRecord) -> Result<()> {
        self.store.maybe_sweep(self.clock.now_millis());
        self.store.insert(key, record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.remove(key);
        Ok(())
    }

    async fn cleanup(&self, now: u64) -> Result<()> {
        self.store.sweep(now);
        Ok(())
    }

    async fn destroy(&self) {
        self.store.clear();
    }
}
