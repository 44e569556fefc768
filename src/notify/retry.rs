//! Bounded exponential backoff for outbound deliveries.
//!
//! The delay before retry `n` (0-indexed) is `base × 2^n`, clamped to `max`.
//! A delivery walks through an explicit [`RetryState`] instead of recursing,
//! so a delivery loop can be cancelled between attempts and the schedule can
//! be tested without sleeping.
//!
//! ```
//! use astro_supervisor::notify::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(2, Duration::from_millis(100), Duration::from_millis(150));
//! assert_eq!(policy.delay(0), Duration::from_millis(100));
//! assert_eq!(policy.delay(1), Duration::from_millis(150));
//! ```

use crate::config::NotificationConfig;
use std::time::Duration;
use tokio::time::Instant;

const FACTOR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            base,
            max,
        }
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.retry_base_millis),
            Duration::from_millis(config.retry_max_millis),
        )
    }

    /// Delay before retry number `retry`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = retry.min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * FACTOR.powi(exp);
        if !secs.is_finite() || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Fresh state for one delivery, eligible immediately.
    pub fn start(&self, now: Instant) -> RetryState {
        RetryState {
            attempt: 0,
            next_eligible: now,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&NotificationConfig::default())
    }
}

/// Progress of a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempt: u32,
    /// Earliest time for the next attempt.
    pub next_eligible: Instant,
}

impl RetryState {
    /// Record a failed attempt made at `now`.
    ///
    /// Returns `false` once the retry budget is spent and the delivery
    /// should be dropped.
    pub fn record_failure(&mut self, policy: &RetryPolicy, now: Instant) -> bool {
        let retry = self.attempt;
        self.attempt += 1;
        if retry >= policy.max_retries {
            return false;
        }
        self.next_eligible = now + policy.delay(retry);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(10))
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = policy();
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(2), Duration::from_millis(2000));
        assert_eq!(policy.delay(10), Duration::from_secs(10));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_state_schedule() {
        let policy = policy();
        let now = Instant::now();
        let mut state = policy.start(now);
        assert_eq!(state.next_eligible, now);

        assert!(state.record_failure(&policy, now));
        assert_eq!(state.next_eligible, now + Duration::from_millis(500));
        assert!(state.record_failure(&policy, now));
        assert_eq!(state.next_eligible, now + Duration::from_millis(1000));
        assert!(state.record_failure(&policy, now));
        assert_eq!(state.next_eligible, now + Duration::from_millis(2000));

        assert!(!state.record_failure(&policy, now));
        assert_eq!(state.attempt, 4);
    }

    #[test]
    fn test_zero_retries_gives_single_attempt() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1));
        let now = Instant::now();
        let mut state = policy.start(now);
        assert!(!state.record_failure(&policy, now));
    }
}
