//! In-process fixed-window counter store.
//!
//! Counters live in a sharded concurrent map. Every check holds the shard
//! lock for its key across the whole read-modify-write, so two checks on
//! one key can never both observe spare budget and both increment past the
//! limit.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::backend::CounterStore;
use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use super::policy::Policy;
use crate::error::{FloodgateError, Result};

/// Default interval between cleanup sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Request count for one key within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRecord {
    /// Requests allowed so far in this window
    pub count: u64,
    /// When this window ends and the budget is replenished
    pub window_reset_at: DateTime<Utc>,
}

impl CounterRecord {
    fn fresh(now: DateTime<Utc>, policy: &Policy) -> Self {
        Self {
            count: 1,
            window_reset_at: policy.window_end(now),
        }
    }
}

type Records = DashMap<String, CounterRecord>;

/// Fixed-window counters held in local memory.
///
/// A window opens on a key's first request and lasts for the policy window;
/// the first request after it closes opens a new one. Up to twice the budget
/// can therefore land in a short span straddling a window boundary.
///
/// Stale records are removed by a periodic sweep armed with
/// [`start`](Self::start) and cancelled with [`stop`](Self::stop) or on drop.
pub struct InProcessCounterStore {
    policy: Policy,
    records: Arc<Records>,
    clock: Arc<dyn Clock>,
    cleanup_interval: Duration,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl InProcessCounterStore {
    /// Create a store on the system clock.
    pub fn new(policy: Policy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock::new()))
    }

    /// Create a store reading time from `clock`.
    pub fn with_clock(policy: Policy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            records: Arc::new(DashMap::new()),
            clock,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            cleanup_task: Mutex::new(None),
        }
    }

    /// Set how often the cleanup sweep runs once started.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Count a request for `key` and decide whether it is within budget.
    pub fn check(&self, key: &str) -> Decision {
        let now = self.clock.now();
        let max = self.policy.max_requests();

        trace!(key = %key, "Checking in-process rate limit");

        match self.records.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                debug!(key = %key, limit = max, "Creating new rate limit counter");
                let record = vacant.insert(CounterRecord::fresh(now, &self.policy));
                self.opened(&record)
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();

                if now >= record.window_reset_at {
                    *record = CounterRecord::fresh(now, &self.policy);
                    return self.opened(record);
                }

                if record.count >= max {
                    debug!(key = %key, count = record.count, limit = max, "Rate limit exceeded");
                    return Decision {
                        allowed: false,
                        remaining: 0,
                        reset_at: record.window_reset_at,
                        total_requests: record.count,
                    };
                }

                record.count += 1;
                Decision {
                    allowed: true,
                    remaining: max - record.count,
                    reset_at: record.window_reset_at,
                    total_requests: record.count,
                }
            }
        }
    }

    fn opened(&self, record: &CounterRecord) -> Decision {
        Decision {
            allowed: true,
            remaining: self.policy.max_requests() - 1,
            reset_at: record.window_reset_at,
            total_requests: 1,
        }
    }

    /// Delete the record for `key`; its next check starts a fresh window.
    pub fn reset(&self, key: &str) {
        if self.records.remove(key).is_some() {
            debug!(key = %key, "Rate limit counter reset");
        }
    }

    /// Remove every record whose window has already closed.
    ///
    /// Returns the number of records removed.
    pub fn sweep(&self) -> usize {
        sweep_records(&self.records, self.clock.now())
    }

    /// Arm the periodic cleanup sweep on the current tokio runtime.
    ///
    /// Calling `start` on a store that is already sweeping is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.cleanup_interval.is_zero() {
            return Err(FloodgateError::Config(
                "cleanup interval must be greater than zero".to_string(),
            ));
        }

        let mut task = self.cleanup_task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            FloodgateError::Config(format!("cleanup sweep needs a tokio runtime: {}", e))
        })?;

        let records = Arc::downgrade(&self.records);
        let clock = self.clock.clone();
        let interval = self.cleanup_interval;

        *task = Some(runtime.spawn(cleanup_loop(records, clock, interval)));

        info!(interval = ?interval, "Rate limit cleanup armed");
        Ok(())
    }

    /// Cancel the periodic cleanup sweep.
    pub fn stop(&self) {
        if let Some(handle) = self.cleanup_task.lock().take() {
            handle.abort();
            info!("Rate limit cleanup stopped");
        }
    }

    /// Whether the cleanup sweep is currently armed.
    pub fn is_running(&self) -> bool {
        self.cleanup_task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Get the current record for `key`, if any.
    pub fn record(&self, key: &str) -> Option<CounterRecord> {
        self.records.get(key).map(|r| *r)
    }

    /// Get the number of tracked keys.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.records.clear();
    }
}

impl Drop for InProcessCounterStore {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_task.get_mut().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl CounterStore for InProcessCounterStore {
    async fn check(&self, key: &str) -> Decision {
        InProcessCounterStore::check(self, key)
    }

    async fn reset(&self, key: &str) -> Result<()> {
        InProcessCounterStore::reset(self, key);
        Ok(())
    }

    fn policy(&self) -> &Policy {
        &self.policy
    }
}

fn sweep_records(records: &Records, now: DateTime<Utc>) -> usize {
    let mut removed = 0;
    records.retain(|_, record| {
        let live = now < record.window_reset_at;
        if !live {
            removed += 1;
        }
        live
    });
    removed
}

async fn cleanup_loop(records: Weak<Records>, clock: Arc<dyn Clock>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(records) = records.upgrade() else {
            break;
        };
        let removed = sweep_records(&records, clock.now());
        debug!(removed, remaining = records.len(), "Rate limit cleanup sweep");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn store(window_ms: u64, max: u64) -> (InProcessCounterStore, ManualClock) {
        let clock = ManualClock::at_epoch();
        let policy = Policy::new(Duration::from_millis(window_ms), max).unwrap();
        let store = InProcessCounterStore::with_clock(policy, Arc::new(clock.clone()));
        (store, clock)
    }

    #[test]
    fn test_fixed_window_scenario() {
        let (store, clock) = store(1000, 3);

        for expected_remaining in [2, 1, 0] {
            let decision = store.check("1.2.3.4");
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            clock.advance(Duration::from_millis(100));
        }

        // t=300
        let decision = store.check("1.2.3.4");
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at.timestamp_millis(), 1000);

        // t=1100
        clock.advance(Duration::from_millis(800));
        let decision = store.check("1.2.3.4");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.total_requests, 1);
        assert_eq!(decision.reset_at.timestamp_millis(), 2100);
    }

    #[test]
    fn test_denied_checks_do_not_increment() {
        let (store, _clock) = store(1000, 2);

        store.check("key");
        store.check("key");
        for _ in 0..10 {
            let decision = store.check("key");
            assert!(!decision.allowed);
            assert_eq!(decision.total_requests, 2);
        }

        assert_eq!(store.record("key").unwrap().count, 2);
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let (store, clock) = store(1000, 1);

        assert!(store.check("key").allowed);
        clock.advance(Duration::from_millis(999));
        assert!(!store.check("key").allowed);
        clock.advance(Duration::from_millis(1));
        assert!(store.check("key").allowed);
    }

    #[test]
    fn test_keys_are_independent() {
        let (store, _clock) = store(1000, 1);

        assert!(store.check("a").allowed);
        assert!(store.check("b").allowed);
        assert!(!store.check("a").allowed);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_reset_behaves_like_new_key() {
        let (store, clock) = store(1000, 2);

        store.check("key");
        store.check("key");
        assert!(!store.check("key").allowed);

        clock.advance(Duration::from_millis(400));
        store.reset("key");
        assert!(store.record("key").is_none());

        let decision = store.check("key");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        assert_eq!(decision.reset_at.timestamp_millis(), 1400);
    }

    #[test]
    fn test_sweep_removes_only_stale_records() {
        let (store, clock) = store(1000, 5);

        store.check("old");
        clock.advance(Duration::from_millis(600));
        store.check("young");
        clock.advance(Duration::from_millis(400));

        assert_eq!(store.sweep(), 1);
        assert!(store.record("old").is_none());
        assert!(store.record("young").is_some());
    }

    #[test]
    fn test_concurrent_checks_never_exceed_limit() {
        let (store, _clock) = store(60_000, 10);

        let allowed: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..64)
                .map(|_| scope.spawn(|| store.check("shared").allowed))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|allowed| *allowed)
                .count()
        });

        assert_eq!(allowed, 10);
        assert_eq!(store.record("shared").unwrap().count, 10);
    }

    #[tokio::test]
    async fn test_cleanup_task_lifecycle() {
        let (store, clock) = store(1000, 5);
        let store = store.with_cleanup_interval(Duration::from_millis(10));

        store.check("key");
        store.start().unwrap();
        assert!(store.is_running());

        clock.advance(Duration::from_millis(1500));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.is_empty());

        store.stop();
        assert!(!store.is_running());

        // Records stay put once the sweep is stopped.
        store.check("key");
        clock.advance(Duration::from_millis(1500));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_cleanup_interval_rejected() {
        let (store, _clock) = store(1000, 5);
        let store = store.with_cleanup_interval(Duration::ZERO);
        assert!(matches!(store.start(), Err(FloodgateError::Config(_))));
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let (store, _clock) = store(1000, 5);
        assert!(store.start().is_err());
        assert!(!store.is_running());
    }
}
