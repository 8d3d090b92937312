//! In-process counter store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rust_decimal::Decimal;

use super::{CounterStore, StoreResult};
use crate::clock::{SharedClock, SystemClock};

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    value: Decimal,
    expires_at_ms: Option<u64>,
}

impl CounterEntry {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_none_or(|at| now_ms < at)
    }
}

/// Counter store for single-process deployments and tests.
///
/// All mutations happen under one write lock, so `increment_many` is observed
/// atomically by readers.
#[derive(Debug, Clone)]
pub struct MemoryCounterStore {
    counters: Arc<RwLock<HashMap<String, CounterEntry>>>,
    clock: SharedClock,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// TTL expiry is evaluated against `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            counters: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now_millis();
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<u64> {
        ttl.map(|t| {
            self.clock
                .now_millis()
                .saturating_add(t.as_millis() as u64)
        })
    }

    fn apply(
        counters: &mut HashMap<String, CounterEntry>,
        key: &str,
        amount: Decimal,
        now_ms: u64,
        expires_at_ms: Option<u64>,
    ) -> Decimal {
        let entry = counters.entry(key.to_string()).or_insert(CounterEntry {
            value: Decimal::ZERO,
            expires_at_ms,
        });
        if !entry.is_live(now_ms) {
            *entry = CounterEntry {
                value: Decimal::ZERO,
                expires_at_ms,
            };
        }
        entry.value += amount;
        entry.value
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CounterStore for MemoryCounterStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn increment(&self, key: &str, amount: Decimal) -> StoreResult<Decimal> {
        let now = self.clock.now_millis();
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        Ok(Self::apply(&mut counters, key, amount, now, None))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Decimal>> {
        let now = self.clock.now_millis();
        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        Ok(counters
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value))
    }

    async fn reset(&self, key: &str) -> StoreResult<()> {
        self.counters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn write(&self, key: &str, value: Decimal, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at_ms = self.expiry(ttl);
        self.counters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                key.to_string(),
                CounterEntry {
                    value,
                    expires_at_ms,
                },
            );
        Ok(())
    }

    async fn increment_many(
        &self,
        entries: &[(String, Decimal)],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let now = self.clock.now_millis();
        let expires_at_ms = self.expiry(ttl);
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        for (key, amount) in entries {
            Self::apply(&mut counters, key, *amount, now, expires_at_ms);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_increment_and_read() {
        let store = MemoryCounterStore::new();

        assert_eq!(store.get("cost").await.unwrap(), None);
        assert_eq!(store.read("cost").await.unwrap(), Decimal::ZERO);

        assert_eq!(store.increment("cost", dec!(1.25)).await.unwrap(), dec!(1.25));
        assert_eq!(store.increment("cost", dec!(0.75)).await.unwrap(), dec!(2.00));
        assert_eq!(store.read("cost").await.unwrap(), dec!(2.00));

        store.reset("cost").await.unwrap();
        assert_eq!(store.get("cost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let store = MemoryCounterStore::with_clock(clock.clone());

        store
            .write("seeded", dec!(4), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(store.get("seeded").await.unwrap(), Some(dec!(4)));

        clock.advance(Duration::from_secs(61));
        assert_eq!(store.get("seeded").await.unwrap(), None);

        // Expired entries restart from zero.
        assert_eq!(store.increment("seeded", dec!(1)).await.unwrap(), dec!(1));
    }

    #[tokio::test]
    async fn test_increment_many() {
        let store = MemoryCounterStore::new();
        let entries = vec![
            ("a".to_string(), dec!(1)),
            ("b".to_string(), dec!(2)),
            ("a".to_string(), dec!(3)),
        ];
        store.increment_many(&entries, None).await.unwrap();

        assert_eq!(store.read("a").await.unwrap(), dec!(4));
        assert_eq!(store.read("b").await.unwrap(), dec!(2));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments() {
        let store = MemoryCounterStore::new();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    for _ in 0..100 {
                        store.increment("shared", dec!(0.01)).await.unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.read("shared").await.unwrap(), dec!(10.00));
    }
}
