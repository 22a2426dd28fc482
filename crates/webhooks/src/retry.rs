//! Retry scheduling for failed delivery attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff with a ceiling.
///
/// `delay_for_attempt(n) = min(base * 2^(n-1), max)`. No jitter: the schedule
/// of a delivery is fully determined by its attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // 2^31 * anything already exceeds any sane cap; clamp the exponent
        // so the multiplication cannot overflow.
        let factor = 1u32 << (attempt - 1).min(31);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Delay before retrying after `attempt` failed attempts, using the default policy
/// (1s doubling, capped at 30s).
pub fn backoff(attempt: u32) -> Duration {
    RetryPolicy::default().delay_for_attempt(attempt)
}
