//! Rate limit policy: a request budget over a time window.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{FloodgateError, Result};

/// Longest window a policy accepts: 100 years.
pub const MAX_WINDOW: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// An immutable request budget.
///
/// A policy allows at most `max_requests` requests per `window`. Both values
/// are validated at construction; a `Policy` that exists is always usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    window: Duration,
    max_requests: u64,
    /// `window` as a chrono delta, for timestamp arithmetic
    span: chrono::Duration,
}

impl Policy {
    /// Create a new policy.
    ///
    /// Fails with [`FloodgateError::InvalidPolicy`] when `window` is zero,
    /// longer than [`MAX_WINDOW`], or when `max_requests` is zero.
    pub fn new(window: Duration, max_requests: u64) -> Result<Self> {
        if window.is_zero() {
            return Err(FloodgateError::InvalidPolicy(
                "window duration must be greater than zero".to_string(),
            ));
        }
        if window > MAX_WINDOW {
            return Err(FloodgateError::InvalidPolicy(format!(
                "window duration {:?} exceeds the maximum of {:?}",
                window, MAX_WINDOW
            )));
        }
        if max_requests < 1 {
            return Err(FloodgateError::InvalidPolicy(
                "max requests must be at least 1".to_string(),
            ));
        }
        let span = chrono::Duration::from_std(window).map_err(|_| {
            FloodgateError::InvalidPolicy(format!("window duration {:?} is out of range", window))
        })?;

        Ok(Self {
            window,
            max_requests,
            span,
        })
    }

    /// Shorthand for a window expressed in whole seconds.
    pub fn per_seconds(secs: u64, max_requests: u64) -> Result<Self> {
        Self::new(Duration::from_secs(secs), max_requests)
    }

    /// Shorthand for a window expressed in whole minutes.
    pub fn per_minutes(minutes: u64, max_requests: u64) -> Result<Self> {
        Self::new(Duration::from_secs(minutes.saturating_mul(60)), max_requests)
    }

    /// Get the window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Get the maximum number of requests allowed per window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// End of a window opened at `now`, saturating at the latest representable time.
    pub(crate) fn window_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.span)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub(crate) fn window_millis(&self) -> i64 {
        self.span.num_milliseconds().max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_policy() {
        let policy = Policy::new(Duration::from_millis(1000), 3).unwrap();
        assert_eq!(policy.window(), Duration::from_secs(1));
        assert_eq!(policy.max_requests(), 3);
        assert_eq!(policy.window_millis(), 1000);
    }

    #[test]
    fn test_zero_window_rejected() {
        let err = Policy::new(Duration::ZERO, 3).unwrap_err();
        assert!(matches!(err, FloodgateError::InvalidPolicy(_)));
    }

    #[test]
    fn test_zero_max_requests_rejected() {
        let err = Policy::per_seconds(60, 0).unwrap_err();
        assert!(matches!(err, FloodgateError::InvalidPolicy(_)));
    }

    #[test]
    fn test_unrepresentable_window_rejected() {
        let err = Policy::new(Duration::MAX, 1).unwrap_err();
        assert!(matches!(err, FloodgateError::InvalidPolicy(_)));
    }

    #[test]
    fn test_oversized_window_rejected() {
        // Representable as a chrono delta, but past the end of `DateTime<Utc>`.
        let err = Policy::per_seconds(10_000_000_000_000, 1).unwrap_err();
        assert!(matches!(err, FloodgateError::InvalidPolicy(_)));

        assert!(Policy::new(MAX_WINDOW, 1).is_ok());
        assert!(Policy::new(MAX_WINDOW + Duration::from_secs(1), 1).is_err());
    }

    #[test]
    fn test_window_end_saturates() {
        let policy = Policy::new(MAX_WINDOW, 1).unwrap();
        let near_end = DateTime::<Utc>::MAX_UTC - chrono::Duration::days(1);
        assert_eq!(policy.window_end(near_end), DateTime::<Utc>::MAX_UTC);

        let policy = Policy::per_seconds(60, 1).unwrap();
        let now = DateTime::<Utc>::UNIX_EPOCH;
        assert_eq!(policy.window_end(now).timestamp(), 60);
    }

    #[test]
    fn test_shorthands() {
        assert_eq!(
            Policy::per_minutes(15, 5).unwrap().window(),
            Duration::from_secs(900)
        );
        assert_eq!(
            Policy::per_seconds(3600, 100).unwrap().window(),
            Duration::from_secs(3600)
        );
    }
}
