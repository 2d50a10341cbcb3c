//! RateLimiter - 固定窓のレート制限
//!
//! CounterStore の原子的な `increment` だけで判定します（read → write の隙間なし）。
//! 窓の境界をまたぐと最大 `2 * limit` まで通る固定窓方式です。

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::ports::{CounterError, CounterStore};

/// Fixed-window limiter over a shared counter store.
#[derive(Clone)]
pub struct RateLimiter {
    counters: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self { counters }
    }

    fn key(identifier: &str) -> String {
        format!("rate-limit:{identifier}")
    }

    /// Would accepting one more event exceed `limit` per `window` for `identifier`?
    ///
    /// Every call counts as an event, including calls that come back limited.
    /// An empty identifier is always limited.
    pub async fn is_limited(
        &self,
        identifier: &str,
        limit: u64,
        window: Duration,
    ) -> Result<bool, CounterError> {
        if identifier.is_empty() {
            return Ok(true);
        }

        let key = Self::key(identifier);
        let count = self.counters.increment(&key).await?;
        if count == 1 {
            // first event of a fresh window
            self.counters.expire(&key, window).await?;
        }

        let limited = count > limit;
        if limited {
            debug!(identifier, count, limit, "rate limit exceeded");
        }
        Ok(limited)
    }
}
