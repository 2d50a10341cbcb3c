//! InMemoryCounterStore - 単一プロセス用の CounterStore
//!
//! TTL は Clock で判定するので、テストでは FixedClock で窓を進められます。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::ports::{Clock, CounterError, CounterStore};

#[derive(Debug)]
struct Counter {
    value: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl Counter {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Expired counters are dropped at most this often.
const SWEEP_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Default)]
struct Counters {
    entries: HashMap<String, Counter>,
    last_sweep: Option<DateTime<Utc>>,
}

impl Counters {
    fn sweep_expired(&mut self, now: DateTime<Utc>) {
        let due = self.last_sweep.is_none_or(|at| (now - at).num_seconds() >= SWEEP_INTERVAL_SECS);
        if due {
            self.entries.retain(|_, counter| !counter.is_expired(now));
            self.last_sweep = Some(now);
        }
    }
}

/// Counters with optional expiry, held in process memory.
pub struct InMemoryCounterStore {
    counters: Mutex<Counters>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            clock,
        }
    }

    /// Number of keys currently held, expired or not.
    pub async fn len(&self) -> usize {
        self.counters.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str) -> Result<u64, CounterError> {
        let now = self.clock.now();
        let mut counters = self.counters.lock().await;
        counters.sweep_expired(now);
        let counter = counters.entries.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at: None,
        });
        if counter.is_expired(now) {
            counter.value = 0;
            counter.expires_at = None;
        }
        counter.value += 1;
        Ok(counter.value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CounterError> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CounterError::Unavailable(format!("ttl out of range: {e}")))?;
        let mut counters = self.counters.lock().await;
        match counters.entries.get_mut(key) {
            Some(counter) if !counter.is_expired(now) => {
                counter.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn increment_counts_from_one() {
        let store = InMemoryCounterStore::new(clock());
        assert_eq!(store.increment("a").await.unwrap(), 1);
        assert_eq!(store.increment("a").await.unwrap(), 2);
        assert_eq!(store.increment("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_counter_starts_over() {
        let clock = clock();
        let store = InMemoryCounterStore::new(clock.clone());

        store.increment("k").await.unwrap();
        store.increment("k").await.unwrap();
        assert!(store.expire("k", Duration::from_secs(60)).await.unwrap());

        clock.advance(chrono::Duration::seconds(59));
        assert_eq!(store.increment("k").await.unwrap(), 3);

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(store.increment("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expire_on_missing_key_is_false() {
        let store = InMemoryCounterStore::new(clock());
        assert!(!store.expire("nope", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_counters_are_dropped() {
        let clock = clock();
        let store = InMemoryCounterStore::new(clock.clone());

        for sender in ["a", "b", "c"] {
            store.increment(sender).await.unwrap();
            store.expire(sender, Duration::from_secs(60)).await.unwrap();
        }
        assert_eq!(store.len().await, 3);

        clock.advance(chrono::Duration::seconds(61));
        store.increment("d").await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn counter_without_ttl_never_resets() {
        let clock = clock();
        let store = InMemoryCounterStore::new(clock.clone());
        store.increment("k").await.unwrap();
        clock.advance(chrono::Duration::days(365));
        assert_eq!(store.increment("k").await.unwrap(), 2);
    }
}
