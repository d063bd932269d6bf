//! Distributed sliding-window counter store.
//!
//! This module provides a counter store whose state lives in an external
//! ordered-set store shared by every service instance. Each key holds a log
//! of request timestamps; a check trims entries older than the window, counts
//! what is left, logs the current request and refreshes the key's expiry, all
//! as one atomic operation against the store.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::backend::CounterStore;
use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use super::policy::Policy;
use crate::error::{FloodgateError, Result};

/// Default bound on a single round trip to the external store.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_millis(250);

/// One request to append to a key's event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Request time in epoch milliseconds, used as the entry's score
    pub now_ms: i64,
    /// Window length in milliseconds
    pub window_ms: i64,
    /// Unique member name for this entry
    pub member: String,
}

impl LogEntry {
    /// Entries scored strictly below this are outside the window.
    pub fn cutoff_ms(&self) -> i64 {
        self.now_ms.saturating_sub(self.window_ms)
    }
}

/// An external store holding one ordered event log per key.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Atomically trim, count, insert and expire.
    ///
    /// Removes every entry of `key` scored below `entry.cutoff_ms()`, reads
    /// the remaining cardinality, inserts `entry` and sets the key to expire
    /// after `entry.window_ms`. Returns the cardinality read before the
    /// insert.
    async fn record(&self, key: &str, entry: LogEntry) -> Result<u64>;

    /// Delete the whole log for `key`.
    async fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemorySet {
    entries: BTreeSet<(i64, String)>,
    expires_at_ms: i64,
}

/// An [`EventLog`] with sorted-set semantics kept in process memory.
///
/// Useful for tests and for running the sliding-window strategy on a single
/// node. Every operation on a key runs under that key's shard lock.
///
/// Expired keys are dropped by [`sweep`](Self::sweep), which `record` also
/// runs on its own at most once per window.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    sets: DashMap<String, MemorySet>,
    /// Earliest `now_ms` at which `record` sweeps again
    next_sweep_ms: AtomicI64,
}

impl MemoryEventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently stored for `key`, expired or not.
    pub fn entry_count(&self, key: &str) -> usize {
        self.sets.get(key).map(|set| set.entries.len()).unwrap_or(0)
    }

    /// Whether a log exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.sets.contains_key(key)
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Whether no keys are held.
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Drop every key whose expiry is at or before `now_ms`.
    ///
    /// Returns the number of keys removed.
    pub fn sweep(&self, now_ms: i64) -> usize {
        let before = self.sets.len();
        self.sets.retain(|_, set| set.expires_at_ms > now_ms);
        let removed = before.saturating_sub(self.sets.len());
        if removed > 0 {
            debug!(removed = removed, "swept expired event logs");
        }
        removed
    }

    fn maybe_sweep(&self, entry: &LogEntry) {
        let due = self.next_sweep_ms.load(Ordering::Relaxed);
        if entry.now_ms < due {
            return;
        }
        let next = entry.now_ms.saturating_add(entry.window_ms);
        if self
            .next_sweep_ms
            .compare_exchange(due, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.sweep(entry.now_ms);
        }
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn record(&self, key: &str, entry: LogEntry) -> Result<u64> {
        // Must run before the entry guard below is taken.
        self.maybe_sweep(&entry);

        let mut set = self.sets.entry(key.to_string()).or_default();

        if set.expires_at_ms <= entry.now_ms {
            set.entries.clear();
        }

        let cutoff = entry.cutoff_ms();
        let kept = set.entries.split_off(&(cutoff, String::new()));
        set.entries = kept;

        let count = set.entries.len() as u64;
        set.entries.insert((entry.now_ms, entry.member));
        set.expires_at_ms = entry.now_ms.saturating_add(entry.window_ms);

        Ok(count)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.sets.remove(key);
        Ok(())
    }
}

/// Sliding-window counters held in a shared [`EventLog`].
///
/// Every logged entry younger than the window counts against the key,
/// denied attempts included. A caller that keeps retrying while blocked
/// keeps its own window full; the log for a key never holds more than the
/// requests made within one window, and the store-side expiry removes it
/// once the key goes quiet.
///
/// Backend errors and timeouts fail open: the request is allowed, a warning
/// is logged and [`fail_open_count`](Self::fail_open_count) is incremented.
pub struct DistributedCounterStore {
    policy: Policy,
    log: Arc<dyn EventLog>,
    clock: Arc<dyn Clock>,
    namespace: String,
    timeout: Duration,
    fail_open_total: AtomicU64,
}

impl DistributedCounterStore {
    /// Create a store over `log` on the system clock.
    pub fn new(policy: Policy, log: Arc<dyn EventLog>) -> Self {
        Self {
            policy,
            log,
            clock: Arc::new(SystemClock::new()),
            namespace: String::new(),
            timeout: DEFAULT_BACKEND_TIMEOUT,
            fail_open_total: AtomicU64::new(0),
        }
    }

    /// Prefix every external key with `namespace`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Bound each round trip to the external store by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The external key used for `key`.
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    /// Count a request for `key` and decide whether it is within budget.
    pub async fn check(&self, key: &str) -> Decision {
        let now = self.clock.now();
        let reset_at = self.policy.window_end(now);
        let storage_key = self.storage_key(key);
        let now_ms = now.timestamp_millis();

        let entry = LogEntry {
            now_ms,
            window_ms: self.policy.window_millis(),
            member: format!("{}-{}", now_ms, Uuid::new_v4()),
        };

        trace!(key = %storage_key, now_ms, "Checking distributed rate limit");

        let record = self.log.record(&storage_key, entry);
        let count = match tokio::time::timeout(self.timeout, record).await {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => return self.fail_open(&storage_key, &e, reset_at),
            Err(_) => {
                let e = FloodgateError::Backend(format!(
                    "event log call timed out after {:?}",
                    self.timeout
                ));
                return self.fail_open(&storage_key, &e, reset_at);
            }
        };

        let max = self.policy.max_requests();
        let allowed = count < max;

        if !allowed {
            debug!(
                key = %storage_key,
                count = count,
                limit = max,
                "Distributed rate limit exceeded"
            );
        }

        Decision {
            allowed,
            remaining: max.saturating_sub(count).saturating_sub(1),
            reset_at,
            total_requests: count + 1,
        }
    }

    /// Delete the event log for `key` in the external store.
    pub async fn reset(&self, key: &str) -> Result<()> {
        let storage_key = self.storage_key(key);

        match tokio::time::timeout(self.timeout, self.log.remove(&storage_key)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(FloodgateError::Backend(format!(
                    "event log reset timed out after {:?}",
                    self.timeout
                )))
            }
        }

        debug!(key = %storage_key, "Distributed rate limit reset");
        Ok(())
    }

    /// Number of checks that were allowed because the backend failed.
    pub fn fail_open_count(&self) -> u64 {
        self.fail_open_total.load(Ordering::Relaxed)
    }

    fn fail_open(&self, key: &str, error: &FloodgateError, reset_at: DateTime<Utc>) -> Decision {
        let total = self.fail_open_total.fetch_add(1, Ordering::Relaxed) + 1;

        warn!(
            key = %key,
            error = %error,
            fail_open_total = total,
            "Rate limit backend unavailable, allowing request"
        );

        Decision {
            allowed: true,
            remaining: self.policy.max_requests() - 1,
            reset_at,
            total_requests: 1,
        }
    }
}

#[async_trait]
impl CounterStore for DistributedCounterStore {
    async fn check(&self, key: &str) -> Decision {
        DistributedCounterStore::check(self, key).await
    }

    async fn reset(&self, key: &str) -> Result<()> {
        DistributedCounterStore::reset(self, key).await
    }

    fn policy(&self) -> &Policy {
        &self.policy
    }
}
