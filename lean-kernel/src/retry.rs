//! Exponential backoff for transient gateway failures.

use std::time::Duration;

use lean_config::TransportSection;
use lean_gateway::TransportError;

const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Backoff schedule applied to `Unavailable` and `RateLimited` failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total send attempts per gateway call, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Creates a policy with the default multiplier of `2.0`.
    #[must_use]
    pub const fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }

    /// Overrides the growth factor.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// Computes `initial_delay * multiplier^attempt`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Delay to wait after `error` on retry number `attempt`.
    ///
    /// A server-provided `retry_after` replaces the computed delay but is still
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, error: &TransportError, attempt: u32) -> Duration {
        match error.retry_after() {
            Some(hint) => hint.min(self.max_delay),
            None => self.delay_for_attempt(attempt),
        }
    }

    /// Returns `true` while another send is permitted after `attempts_made`.
    #[must_use]
    pub const fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

impl From<&TransportSection> for RetryPolicy {
    fn from(section: &TransportSection) -> Self {
        Self::new(
            section.max_attempts,
            section.initial_backoff(),
            section.max_backoff(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_millis(100), Duration::from_secs(1))
    }

    #[test]
    fn grows_exponentially_until_capped() {
        let policy = policy();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn retry_after_overrides_but_stays_capped() {
        let policy = policy();
        let hinted = TransportError::RateLimited {
            retry_after: Some(Duration::from_millis(300)),
        };
        assert_eq!(policy.delay_for(&hinted, 0), Duration::from_millis(300));

        let huge = TransportError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        };
        assert_eq!(policy.delay_for(&huge, 0), Duration::from_secs(1));

        let plain = TransportError::unavailable("down");
        assert_eq!(policy.delay_for(&plain, 1), Duration::from_millis(200));
    }

    #[test]
    fn custom_multiplier() {
        let policy = policy().with_multiplier(3.0);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(300));
    }

    #[test]
    fn attempt_budget() {
        let policy = policy();
        assert!(policy.allows_retry(3));
        assert!(!policy.allows_retry(4));
    }
}
