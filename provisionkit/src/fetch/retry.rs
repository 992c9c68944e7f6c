//! Retry budget for fetch passes.
//!
//! Retrying is modelled as data: [`RetryPolicy`] describes the budget and
//! backoff curve, [`RetryState`] counts the attempts a descriptor has used.
//! One budget covers both transient network failures and integrity
//! failures, since a corrupted mirror looks the same as a flaky one.

use std::time::Duration;

/// Default initial backoff delay (500ms).
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 500;

/// Default backoff cap (30 seconds).
pub const DEFAULT_MAX_DELAY_SECS: u64 = 30;

/// Default backoff multiplier.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default number of fetch passes per descriptor.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// How many passes a descriptor gets and how long to wait between them.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryPolicy {
    /// Single pass, no retry.
    None,

    /// Constant delay between passes.
    Fixed {
        /// Maximum number of passes, including the first.
        max_attempts: u32,
        delay: Duration,
    },

    /// Delay multiplied after every failed pass, capped at `max_delay`.
    ExponentialBackoff {
        /// Maximum number of passes, including the first.
        max_attempts: u32,
        /// Delay after the first failure.
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    /// Exponential backoff from 500ms, doubling, capped at 30s.
    pub fn exponential(max_attempts: u32) -> Self {
        Self::ExponentialBackoff {
            max_attempts,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed {
            max_attempts,
            delay,
        }
    }

    /// Replace the pass budget, keeping the backoff curve.
    pub fn with_max_attempts(self, attempts: u32) -> Self {
        match self {
            Self::None if attempts <= 1 => Self::None,
            Self::None => Self::fixed(attempts, Duration::ZERO),
            Self::Fixed { delay, .. } => Self::Fixed {
                max_attempts: attempts,
                delay,
            },
            Self::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                ..
            } => Self::ExponentialBackoff {
                max_attempts: attempts,
                initial_delay,
                max_delay,
                multiplier,
            },
        }
    }

    /// Delay before the next pass.
    ///
    /// `attempt` is the number of passes already made (1 after the first
    /// failure). Returns `None` once the budget is spent.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed {
                max_attempts,
                delay,
            } => (attempt < *max_attempts).then_some(*delay),
            Self::ExponentialBackoff {
                max_attempts,
                initial_delay,
                max_delay,
                multiplier,
            } => {
                if attempt >= *max_attempts {
                    return None;
                }
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let delay_ms = initial_delay.as_millis() as f64 * factor;
                let capped = delay_ms.min(max_delay.as_millis() as f64) as u64;
                Some(Duration::from_millis(capped).min(*max_delay))
            }
        }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Fixed { max_attempts, .. } => *max_attempts,
            Self::ExponentialBackoff { max_attempts, .. } => *max_attempts,
        }
    }
}

/// Attempts consumed by one descriptor under a policy.
#[derive(Clone, Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::resume(policy, 0)
    }

    /// Continue a budget that already spent `attempts` passes.
    pub fn resume(policy: RetryPolicy, attempts: u32) -> Self {
        Self { policy, attempts }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed pass.
    ///
    /// Returns the delay before the next pass, or `None` when the budget is
    /// exhausted.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        self.policy.delay_for_attempt(self.attempts)
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_three_exponential_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay_for_attempt(3), None);
    }

    #[test]
    fn test_none_policy() {
        assert_eq!(RetryPolicy::None.max_attempts(), 1);
        assert_eq!(RetryPolicy::None.delay_for_attempt(1), None);
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(10)));
        assert_eq!(policy.delay_for_attempt(2), None);
    }

    #[test]
    fn test_exponential_respects_cap() {
        let policy = RetryPolicy::ExponentialBackoff {
            max_attempts: 20,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for_attempt(4), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for_attempt(15), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_with_max_attempts_keeps_curve() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(7)).with_max_attempts(5);
        assert_eq!(policy, RetryPolicy::fixed(5, Duration::from_millis(7)));

        let upgraded = RetryPolicy::None.with_max_attempts(2);
        assert_eq!(upgraded.max_attempts(), 2);
        assert_eq!(RetryPolicy::None.with_max_attempts(1), RetryPolicy::None);
    }

    #[test]
    fn test_state_counts_to_exhaustion() {
        let mut state = RetryState::new(RetryPolicy::fixed(3, Duration::ZERO));
        assert!(state.record_failure().is_some());
        assert!(state.record_failure().is_some());
        assert!(!state.is_exhausted());
        assert!(state.record_failure().is_none());
        assert!(state.is_exhausted());
        assert_eq!(state.attempts(), 3);
    }

    #[test]
    fn test_state_resume_continues_budget() {
        let mut state = RetryState::resume(RetryPolicy::fixed(3, Duration::ZERO), 2);
        assert!(state.record_failure().is_none());
    }
}
