//! Counter store trait for abstracting in-process and distributed accounting.

use async_trait::async_trait;

use super::decision::Decision;
use super::policy::Policy;

/// Trait for counter store implementations.
///
/// This trait abstracts over the in-process fixed-window store and the
/// distributed sliding-window store so the [`RateLimiter`](super::RateLimiter)
/// facade can drive either.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count a request for `key` and decide whether it is within budget.
    ///
    /// Never fails: a store that cannot reach its backing state must still
    /// return a decision.
    async fn check(&self, key: &str) -> Decision;

    /// Forget everything known about `key`.
    async fn reset(&self, key: &str) -> crate::error::Result<()>;

    /// The policy this store enforces.
    fn policy(&self) -> &Policy;
}
