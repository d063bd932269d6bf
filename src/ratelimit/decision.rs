//! The outcome of a single rate limit check.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result of one `check` call.
///
/// Produced fresh on every check and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request is within budget
    pub allowed: bool,
    /// Requests still available in the current window
    pub remaining: u64,
    /// When the budget for this key is next replenished
    pub reset_at: DateTime<Utc>,
    /// Requests counted against the key in the current window as seen by this check
    pub total_requests: u64,
}

impl Decision {
    /// Time left until `reset_at`, saturating at zero.
    ///
    /// This is the value the HTTP layer renders as `Retry-After` on a denial.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}
