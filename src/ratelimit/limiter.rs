//! Rate limiter facade binding one policy to one counter store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use super::backend::CounterStore;
use super::clock::{Clock, SystemClock};
use super::counter::{InProcessCounterStore, DEFAULT_CLEANUP_INTERVAL};
use super::decision::Decision;
use super::distributed::{DistributedCounterStore, EventLog, DEFAULT_BACKEND_TIMEOUT};
use super::policy::Policy;
use crate::error::Result;

/// Default namespace for keys written to a shared store.
pub const DEFAULT_KEY_PREFIX: &str = "floodgate:";

/// Which counting strategy a limiter uses, chosen once at construction.
#[derive(Clone)]
pub enum Backend {
    /// Fixed-window counters in this process
    InProcess,
    /// Sliding-window logs in a store shared across instances
    Distributed(Arc<dyn EventLog>),
}

impl Backend {
    /// The strategy tag without the store handle.
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::InProcess => BackendKind::InProcess,
            Backend::Distributed(_) => BackendKind::Distributed,
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::InProcess => f.write_str("InProcess"),
            Backend::Distributed(_) => f.write_str("Distributed(..)"),
        }
    }
}

/// Strategy tag reported by a built limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    InProcess,
    Distributed,
}

/// Tuning shared by limiters, independent of the policy.
#[derive(Clone)]
pub struct LimiterOptions {
    /// Prefix for keys in a shared store
    pub key_prefix: String,
    /// Interval between in-process cleanup sweeps
    pub cleanup_interval: Duration,
    /// Bound on each round trip to a shared store
    pub backend_timeout: Duration,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            clock: Arc::new(SystemClock::new()),
        }
    }
}

enum Store {
    InProcess(InProcessCounterStore),
    Distributed(DistributedCounterStore),
}

/// A named rate limiter.
///
/// This struct is thread-safe and can be shared across multiple tasks.
/// When backed by the in-process store it owns that store's cleanup sweep;
/// the sweep is armed with [`start`](Self::start) and cancelled with
/// [`stop`](Self::stop) or when the limiter is dropped.
pub struct RateLimiter {
    name: String,
    store: Store,
}

impl RateLimiter {
    /// Create a limiter with default options.
    pub fn new(name: impl Into<String>, policy: Policy, backend: Backend) -> Self {
        Self::with_options(name, policy, backend, &LimiterOptions::default())
    }

    /// Create a limiter with explicit options.
    pub fn with_options(
        name: impl Into<String>,
        policy: Policy,
        backend: Backend,
        options: &LimiterOptions,
    ) -> Self {
        let name = name.into();

        let store = match backend {
            Backend::InProcess => Store::InProcess(
                InProcessCounterStore::with_clock(policy, options.clock.clone())
                    .with_cleanup_interval(options.cleanup_interval),
            ),
            Backend::Distributed(log) => Store::Distributed(
                DistributedCounterStore::new(policy, log)
                    .with_namespace(format!("{}{}:", options.key_prefix, name))
                    .with_timeout(options.backend_timeout)
                    .with_clock(options.clock.clone()),
            ),
        };

        Self { name, store }
    }

    fn store(&self) -> &dyn CounterStore {
        match &self.store {
            Store::InProcess(store) => store,
            Store::Distributed(store) => store,
        }
    }

    /// Count a request from `identifier` and decide whether it is within budget.
    pub async fn check(&self, identifier: &str) -> Decision {
        trace!(limiter = %self.name, identifier = %identifier, "Checking rate limit");
        self.store().check(identifier).await
    }

    /// Forget all accounting for `identifier`.
    ///
    /// Only a distributed backend can fail here.
    pub async fn reset(&self, identifier: &str) -> Result<()> {
        self.store().reset(identifier).await
    }

    /// Arm the in-process cleanup sweep. A no-op for distributed limiters.
    pub fn start(&self) -> Result<()> {
        match &self.store {
            Store::InProcess(store) => store.start(),
            Store::Distributed(_) => Ok(()),
        }
    }

    /// Cancel the in-process cleanup sweep. A no-op for distributed limiters.
    pub fn stop(&self) {
        if let Store::InProcess(store) = &self.store {
            store.stop();
        }
    }

    /// Whether a cleanup sweep is currently armed.
    pub fn is_running(&self) -> bool {
        match &self.store {
            Store::InProcess(store) => store.is_running(),
            Store::Distributed(_) => false,
        }
    }

    /// The limiter's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> &Policy {
        self.store().policy()
    }

    /// The counting strategy in use.
    pub fn backend_kind(&self) -> BackendKind {
        match &self.store {
            Store::InProcess(_) => BackendKind::InProcess,
            Store::Distributed(_) => BackendKind::Distributed,
        }
    }

    /// Number of checks allowed because the shared store was unavailable.
    pub fn fail_open_count(&self) -> u64 {
        match &self.store {
            Store::InProcess(_) => 0,
            Store::Distributed(store) => store.fail_open_count(),
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("policy", self.policy())
            .field("backend", &self.backend_kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::distributed::MemoryEventLog;

    fn options(clock: &ManualClock) -> LimiterOptions {
        LimiterOptions {
            clock: Arc::new(clock.clone()),
            ..LimiterOptions::default()
        }
    }

    #[tokio::test]
    async fn test_in_process_scenario() {
        let clock = ManualClock::at_epoch();
        let policy = Policy::new(Duration::from_millis(1000), 3).unwrap();
        let limiter = RateLimiter::with_options("test", policy, Backend::InProcess, &options(&clock));

        assert_eq!(limiter.backend_kind(), BackendKind::InProcess);

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check("10.0.0.1").await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            clock.advance(Duration::from_millis(100));
        }

        let decision = limiter.check("10.0.0.1").await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);

        clock.advance(Duration::from_millis(800));
        let decision = limiter.check("10.0.0.1").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_reset_restores_budget() {
        let clock = ManualClock::at_epoch();
        let policy = Policy::new(Duration::from_secs(60), 1).unwrap();
        let limiter = RateLimiter::with_options("test", policy, Backend::InProcess, &options(&clock));

        let fresh = limiter.check("key").await;
        assert!(!limiter.check("key").await.allowed);

        limiter.reset("key").await.unwrap();
        assert_eq!(limiter.check("key").await, fresh);
    }

    #[tokio::test]
    async fn test_distributed_limiter_namespaces_by_name() {
        let clock = ManualClock::at_epoch();
        let log = Arc::new(MemoryEventLog::new());
        let policy = Policy::new(Duration::from_secs(60), 1).unwrap();
        let limiter = RateLimiter::with_options(
            "otp",
            policy,
            Backend::Distributed(log.clone()),
            &options(&clock),
        );

        assert_eq!(limiter.backend_kind(), BackendKind::Distributed);
        assert!(limiter.check("10.0.0.1").await.allowed);
        assert!(log.contains("floodgate:otp:10.0.0.1"));

        // Distributed limiters own no sweep.
        limiter.start().unwrap();
        assert!(!limiter.is_running());
        assert_eq!(limiter.fail_open_count(), 0);
    }

    #[tokio::test]
    async fn test_start_stop_in_process() {
        let policy = Policy::new(Duration::from_secs(60), 1).unwrap();
        let limiter = RateLimiter::new("test", policy, Backend::InProcess);

        limiter.start().unwrap();
        assert!(limiter.is_running());
        limiter.stop();
        assert!(!limiter.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_checks_allow_exactly_budget() {
        for backend in [
            Backend::InProcess,
            Backend::Distributed(Arc::new(MemoryEventLog::new())),
        ] {
            let policy = Policy::new(Duration::from_secs(600), 3).unwrap();
            let limiter = Arc::new(RateLimiter::new("contact_form", policy, backend));

            let tasks: Vec<_> = (0..32)
                .map(|_| {
                    let limiter = limiter.clone();
                    tokio::spawn(async move { limiter.check("203.0.113.7").await })
                })
                .collect();

            let decisions: Vec<Decision> = futures::future::join_all(tasks)
                .await
                .into_iter()
                .map(|r| r.unwrap())
                .collect();

            assert_eq!(decisions.iter().filter(|d| d.allowed).count(), 3);
            assert!(decisions.iter().filter(|d| !d.allowed).all(|d| d.remaining == 0));
        }
    }
}
