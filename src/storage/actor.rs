use super::{RateLimitRecord, Storage};
use crate::clock::Clock;
use crate::error::{RateLimiterError, Result};
use crate::rate_limit::engine::{decide, Decision};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

/// Commands buffered per key before senders wait
const MAILBOX_CAPACITY: usize = 64;

/// How often a caller re-resolves a key whose actor retired mid-call
const MAX_ATTEMPTS: usize = 8;

/// How long a task holding no record waits for work before retiring
const IDLE_TIMEOUT: Duration = Duration::from_millis(100);

type Mailboxes = DashMap<String, mpsc::Sender<Command>>;

enum Command {
    Get {
        reply: oneshot::Sender<Option<RateLimitRecord>>,
    },
    Set {
        record: RateLimitRecord,
        reply: oneshot::Sender<()>,
    },
    Delete {
        reply: oneshot::Sender<()>,
    },
    Apply {
        limit: u32,
        window_millis: u64,
        now: u64,
        reply: oneshot::Sender<Decision>,
    },
}

/// Single-writer storage: one task per key owns that key's counter
///
/// Every operation for a key is a message to its task, so `apply` runs the
/// whole read-decide-write step without interleaving and concurrent requests
/// are counted exactly. A task arms a timer for its window's end, forgets the
/// record when it fires and retires once its mailbox is idle. State lives in
/// this process only.
pub struct ActorStorage {
    mailboxes: Arc<Mailboxes>,
    clock: Arc<dyn Clock>,
}

impl ActorStorage {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            mailboxes: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Number of keys with a live task
    pub fn active_keys(&self) -> usize {
        self.mailboxes.len()
    }

    fn mailbox(&self, key: &str) -> mpsc::Sender<Command> {
        if let Some(sender) = self.mailboxes.get(key) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        match self.mailboxes.entry(key.to_string()) {
            Entry::Occupied(entry) if !entry.get().is_closed() => entry.get().clone(),
            entry => {
                let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
                let actor = KeyActor {
                    key: key.to_string(),
                    record: None,
                    clock: self.clock.clone(),
                    mailboxes: Arc::downgrade(&self.mailboxes),
                    own: sender.downgrade(),
                };
                tokio::spawn(actor.run(receiver));
                trace!(key, "Spawned rate limit actor");

                entry.insert(sender.clone());
                sender
            }
        }
    }

    /// Send a command to the key's task, retrying if the task retired first
    async fn call<T, F>(&self, key: &str, command: F) -> Result<T>
    where
        F: Fn(oneshot::Sender<T>) -> Command,
    {
        for _ in 0..MAX_ATTEMPTS {
            let sender = self.mailbox(key);
            let (reply, response) = oneshot::channel();

            if sender.send(command(reply)).await.is_err() {
                continue;
            }
            if let Ok(value) = response.await {
                return Ok(value);
            }
        }

        Err(RateLimiterError::database_connection(format!(
            "Rate limit actor for key {} is unavailable",
            key
        )))
    }
}

#[async_trait]
impl Storage for ActorStorage {
    fn name(&self) -> &'static str {
        "actor"
    }

    async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>> {
        self.call(key, |reply| Command::Get { reply }).await
    }

    async fn set(&self, key: &str, record: RateLimitRecord) -> Result<()> {
        self.call(key, |reply| Command::Set { record, reply }).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.call(key, |reply| Command::Delete { reply }).await
    }

    /// Tasks expire their own records; this only drops mailboxes of retired tasks
    async fn cleanup(&self, _now: u64) -> Result<()> {
        let before = self.mailboxes.len();
        self.mailboxes.retain(|_, sender| !sender.is_closed());
        let pruned = before.saturating_sub(self.mailboxes.len());
        if pruned > 0 {
            debug!(pruned, "Pruned retired rate limit actors");
        }
        Ok(())
    }

    async fn destroy(&self) {
        self.mailboxes.clear();
    }

    async fn apply(&self, key: &str, limit: u32, window_millis: u64, now: u64) -> Result<Decision> {
        self.call(key, |reply| Command::Apply {
            limit,
            window_millis,
            now,
            reply,
        })
        .await
    }
}

struct KeyActor {
    key: String,
    record: Option<RateLimitRecord>,
    clock: Arc<dyn Clock>,
    mailboxes: Weak<Mailboxes>,
    own: mpsc::WeakSender<Command>,
}

impl KeyActor {
    async fn run(mut self, mut receiver: mpsc::Receiver<Command>) {
        loop {
            let deadline = self.deadline();

            tokio::select! {
                biased;

                command = receiver.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sleep_until(deadline) => {
                    if self.record.is_some_and(|r| !r.is_expired(self.clock.now_millis())) {
                        continue;
                    }
                    self.retire(&mut receiver);
                    break;
                }
            }
        }

        trace!(key = %self.key, "Rate limit actor stopped");
    }

    /// When the held window ends, or the idle timeout if nothing is held
    fn deadline(&self) -> Instant {
        let now = Instant::now();
        match self.record {
            Some(record) => {
                let left = record.reset.saturating_sub(self.clock.now_millis());
                now + Duration::from_millis(left.max(1))
            }
            None => now + IDLE_TIMEOUT,
        }
    }

    fn handle(&mut self, command: Command) {
        let now = self.clock.now_millis();
        if self.record.is_some_and(|r| r.is_expired(now)) {
            self.record = None;
        }

        match command {
            Command::Get { reply } => {
                let _ = reply.send(self.record);
            }
            Command::Set { record, reply } => {
                self.record = (!record.is_expired(now)).then_some(record);
                let _ = reply.send(());
            }
            Command::Delete { reply } => {
                self.record = None;
                let _ = reply.send(());
            }
            Command::Apply {
                limit,
                window_millis,
                now,
                reply,
            } => {
                let decision = decide(self.record, limit, window_millis, now);
                if let Some(record) = decision.to_persist() {
                    self.record = Some(record);
                }
                let _ = reply.send(decision);
            }
        }
    }

    /// Unregister, then drop anything still queued so callers retry elsewhere
    fn retire(&mut self, receiver: &mut mpsc::Receiver<Command>) {
        if let (Some(mailboxes), Some(own)) = (self.mailboxes.upgrade(), self.own.upgrade()) {
            mailboxes.remove_if(&self.key, |_, sender| sender.same_channel(&own));
        }

        receiver.close();
        while receiver.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};

    fn storage_at(now: u64) -> (Arc<ActorStorage>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        (Arc::new(ActorStorage::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (storage, _) = storage_at(1_000_000);
        let record = RateLimitRecord::new(7, 1_060_000);

        storage.set("k", record).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(record));

        storage.delete("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
        storage.destroy().await;
    }

    #[tokio::test]
    async fn test_logically_expired_record_reads_as_absent() {
        let (storage, clock) = storage_at(1_000_000);
        storage
            .set("k", RateLimitRecord::new(1, 1_060_000))
            .await
            .unwrap();

        clock.advance_secs(60);
        assert_eq!(storage.get("k").await.unwrap(), None);
        storage.destroy().await;
    }

    #[tokio::test]
    async fn test_apply_follows_fixed_window() {
        let (storage, _) = storage_at(0);

        let first = storage.apply("k", 2, 10_000, 0).await.unwrap();
        let second = storage.apply("k", 2, 10_000, 100).await.unwrap();
        let third = storage.apply("k", 2, 10_000, 200).await.unwrap();

        assert_eq!(first, Decision::Started(RateLimitRecord::new(1, 10_000)));
        assert_eq!(second, Decision::Counted(RateLimitRecord::new(2, 10_000)));
        assert_eq!(third, Decision::Exceeded(RateLimitRecord::new(2, 10_000)));

        let reopened = storage.apply("k", 2, 10_000, 10_000).await.unwrap();
        assert_eq!(reopened, Decision::Started(RateLimitRecord::new(1, 20_000)));
        storage.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_key_is_counted_exactly() {
        let (storage, _) = storage_at(0);

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let storage = storage.clone();
                tokio::spawn(async move { storage.apply("hot", 50, 60_000, 0).await })
            })
            .collect();

        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().is_allowed() {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 50);
        assert_eq!(
            storage.get("hot").await.unwrap(),
            Some(RateLimitRecord::new(50, 60_000))
        );
        storage.destroy().await;
    }

    #[tokio::test]
    async fn test_actor_retires_after_window() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let storage = ActorStorage::new(clock.clone());
        let now = clock.now_millis();

        storage.apply("k", 5, 50, now).await.unwrap();
        assert_eq!(storage.active_keys(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(storage.active_keys(), 0);

        let decision = storage.apply("k", 5, 50, clock.now_millis()).await.unwrap();
        assert!(matches!(decision, Decision::Started(_)));
        storage.destroy().await;
    }

    #[tokio::test]
    async fn test_idle_actor_retires_and_cleanup_prunes() {
        let (storage, _) = storage_at(0);
        assert_eq!(storage.get("nobody").await.unwrap(), None);

        tokio::time::sleep(IDLE_TIMEOUT * 3).await;
        storage.cleanup(0).await.unwrap();
        assert_eq!(storage.active_keys(), 0);
    }
}
