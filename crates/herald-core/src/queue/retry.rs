//! Backoff policy: decides delays between delivery attempts.

use std::time::Duration;

/// Backoff between attempts of the same job.
///
/// Exponential backoff: `delay = base_delay * multiplier^(attempts - 1)`.
/// A multiplier of `1.0` gives a fixed delay.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,
}

impl BackoffPolicy {
    /// Exponential backoff doubling from `base_delay`.
    pub fn exponential(base_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier: 2.0,
        }
    }

    /// Same delay before every retry.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Calculate the delay before the next attempt.
    ///
    /// # Arguments
    /// * `attempts` - Number of attempts already made (1-indexed).
    ///
    /// Example with base_delay=1s, multiplier=2.0:
    /// - attempt 1 failed: wait 1s
    /// - attempt 2 failed: wait 2s
    /// - attempt 3 failed: wait 4s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
    }
}

impl Default for BackoffPolicy {
    /// 1s exponential.
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1))
    }
}
