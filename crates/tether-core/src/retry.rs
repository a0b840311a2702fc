//! Reconnect backoff calculation.
//!
//! The async scheduling lives in the bridge crate; this module holds the
//! sync-only math so it can be tested without a runtime.

use std::time::Duration;

/// Default base delay for the first reconnect in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default cap for any single reconnect delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default number of consecutive reconnect attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Exponential backoff delay without jitter.
///
/// Formula: `min(max_delay, base_delay * 2^attempt)`.
///
/// Delays strictly increase with `attempt` until they reach `max_delay_ms`
/// and then stay there. Jitter is deliberately absent so the sequence is
/// reproducible.
#[must_use]
pub fn calculate_backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    exponential.min(max_delay_ms)
}

/// Reconnect parameters for one connection manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub cap: Duration,
    /// Consecutive attempts allowed before the manager stops retrying.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay to wait before the reconnect with zero-based index `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(calculate_backoff_delay(
            attempt,
            self.base.as_millis() as u64,
            self.cap.as_millis() as u64,
        ))
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    #[must_use]
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            cap: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_delay_is_base() {
        assert_eq!(calculate_backoff_delay(0, 1000, 30_000), 1000);
    }

    #[test]
    fn delays_double() {
        assert_eq!(calculate_backoff_delay(1, 1000, 30_000), 2000);
        assert_eq!(calculate_backoff_delay(2, 1000, 30_000), 4000);
        assert_eq!(calculate_backoff_delay(3, 1000, 30_000), 8000);
    }

    #[test]
    fn delays_plateau_at_cap() {
        assert_eq!(calculate_backoff_delay(5, 1000, 30_000), 30_000);
        assert_eq!(calculate_backoff_delay(20, 1000, 30_000), 30_000);
        assert_eq!(calculate_backoff_delay(u32::MAX, 1000, 30_000), 30_000);
    }

    #[test]
    fn policy_defaults() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.cap, Duration::from_secs(30));
        assert!(policy.allows(9));
        assert!(!policy.allows(10));
    }

    proptest! {
        #[test]
        fn delays_strictly_increase_then_plateau(
            base in 1u64..5_000,
            cap_factor in 1u64..64,
        ) {
            let cap = base * cap_factor;
            let mut previous = 0;
            let mut reached_cap = false;
            for attempt in 0..40 {
                let delay = calculate_backoff_delay(attempt, base, cap);
                prop_assert!(delay <= cap);
                if reached_cap {
                    prop_assert_eq!(delay, cap);
                } else if attempt > 0 {
                    prop_assert!(delay > previous);
                }
                reached_cap = delay == cap;
                previous = delay;
            }
        }
    }
}
