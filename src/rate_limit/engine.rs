use super::types::{RateLimitResult, RateLimitStatus};
use crate::client_ip::{client_ip, UNKNOWN_CLIENT};
use crate::clock::{system_clock, Clock};
use crate::config::RateLimiterOptions;
use crate::error::Result;
use crate::metrics;
use crate::storage::{create_storage, RateLimitRecord, Storage};
use http::HeaderMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of applying one request to a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No live window existed; a new one was opened with a count of one
    Started(RateLimitRecord),
    /// Counted against the live window
    Counted(RateLimitRecord),
    /// The window is full; the record is returned unchanged
    Exceeded(RateLimitRecord),
}

impl Decision {
    /// The window state after this decision
    pub fn record(&self) -> RateLimitRecord {
        match self {
            Decision::Started(record) | Decision::Counted(record) | Decision::Exceeded(record) => {
                *record
            }
        }
    }

    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Exceeded(_))
    }

    /// Record to write back, if any; rejections never write
    pub fn to_persist(&self) -> Option<RateLimitRecord> {
        match self {
            Decision::Started(record) | Decision::Counted(record) => Some(*record),
            Decision::Exceeded(_) => None,
        }
    }
}

/// Fixed-window decision for one request
///
/// `current` is whatever the backend returned; an expired record is treated
/// the same as a missing one.
pub fn decide(
    current: Option<RateLimitRecord>,
    limit: u32,
    window_millis: u64,
    now: u64,
) -> Decision {
    match current {
        Some(record) if !record.is_expired(now) => {
            if record.count >= limit {
                Decision::Exceeded(record)
            } else {
                Decision::Counted(RateLimitRecord::new(record.count + 1, record.reset))
            }
        }
        _ => Decision::Started(RateLimitRecord::new(1, now.saturating_add(window_millis))),
    }
}

/// Fixed-window rate limiter over one storage backend
#[derive(Clone)]
pub struct RateLimiter {
    options: Arc<RateLimiterOptions>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.options.limit)
            .field("window", &self.options.window)
            .field("storage", &self.storage.name())
            .finish()
    }
}

impl RateLimiter {
    /// Validate `options` and build the configured backend
    pub async fn new(options: RateLimiterOptions) -> Result<Self> {
        Self::with_clock(options, system_clock()).await
    }

    pub async fn with_clock(options: RateLimiterOptions, clock: Arc<dyn Clock>) -> Result<Self> {
        options.validate()?;
        let storage = create_storage(&options.storage, clock.clone()).await?;
        Self::with_storage(options, storage, clock)
    }

    /// Use a backend constructed by the caller
    pub fn with_storage(
        options: RateLimiterOptions,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        options.validate()?;

        info!(
            limit = options.limit,
            window = options.window,
            storage = storage.name(),
            "Rate limiter initialized"
        );

        Ok(Self {
            options: Arc::new(options),
            storage,
            clock,
        })
    }

    pub fn options(&self) -> &RateLimiterOptions {
        &self.options
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Storage key for a resolved client address
    pub fn key_for(&self, client: Option<&str>) -> String {
        let client = client.unwrap_or(UNKNOWN_CLIENT);
        match &self.options.key_prefix {
            Some(prefix) => format!("{}{}", prefix, client),
            None => client.to_string(),
        }
    }

    /// Resolve the caller from `headers` and count the request
    pub async fn handle_request(
        &self,
        headers: &HeaderMap,
        remote_addr: Option<IpAddr>,
    ) -> RateLimitResult {
        let client = client_ip(headers, remote_addr);
        let key = self.key_for(client.as_deref());
        self.check_key(&key).await
    }

    /// Count one request against an explicit storage key
    pub async fn check_key(&self, key: &str) -> RateLimitResult {
        let now = self.clock.now_millis();
        let limit = self.options.limit;

        let started = Instant::now();
        let outcome = self
            .storage
            .apply(key, limit, self.options.window_millis(), now)
            .await;
        metrics::record_storage_duration(
            self.storage.name(),
            "apply",
            started.elapsed().as_secs_f64(),
        );

        let decision = match outcome {
            Ok(decision) => decision,
            Err(e) => {
                warn!(key, code = e.code(), "Rate limit check failed: {}", e);
                metrics::record_decision(metrics::OUTCOME_ERROR);
                return RateLimitResult::failed(e, limit, now);
            }
        };

        let record = decision.record();
        if self.options.debug {
            debug!(
                key,
                count = record.count,
                reset = record.reset,
                allowed = decision.is_allowed(),
                "Rate limit decision"
            );
        }

        if decision.is_allowed() {
            metrics::record_decision(metrics::OUTCOME_ALLOWED);
            RateLimitResult::allowed(RateLimitStatus {
                remaining: limit.saturating_sub(record.count),
                reset: record.reset,
                limit,
                exceeded: false,
            })
        } else {
            metrics::record_decision(metrics::OUTCOME_REJECTED);
            if self.options.debug {
                debug!(key, limit, "Rate limit exceeded");
            }
            RateLimitResult::rejected(
                RateLimitStatus {
                    remaining: 0,
                    reset: record.reset,
                    limit,
                    exceeded: true,
                },
                now,
                self.options.on_error.clone(),
            )
        }
    }

    /// Run backend cleanup at the current time; failures are logged and dropped
    pub async fn cleanup(&self) {
        let now = self.clock.now_millis();
        if let Err(e) = self.storage.cleanup(now).await {
            warn!(code = e.code(), "Rate limit cleanup failed: {}", e);
        }
    }

    /// Release the backend's timers and connections
    pub async fn destroy(&self) {
        self.storage.destroy().await;
    }
}
