//! TTL cache for idempotent private queries.
//!
//! Wallet balance, position list and open orders are polled by several loops
//! at once; the cache collapses that into one venue call per TTL. When the
//! rate limiter predicts a wait beyond the degrade threshold, callers get the
//! last known value marked degraded instead of blocking on tokens.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Outcome of a cached read.
#[derive(Clone, Debug)]
pub struct CacheRead<T> {
    pub value: T,
    /// True when the value is stale and was served to avoid a rate-limit wait.
    pub degraded: bool,
    pub stale_ms: u64,
    pub predicted_wait_ms: u64,
}

struct Slot<T> {
    value: T,
    fetched_at: Instant,
}

/// Single-value cache with freshness accounting.
pub struct TtlCache<T> {
    ttl: Duration,
    slot: Mutex<Option<Slot<T>>>,
}

impl<T: Clone> TtlCache<T> {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// A fresh value, if one is inside the TTL.
    pub fn fresh(&self) -> Option<T> {
        let slot = self.slot.lock().unwrap();
        slot.as_ref()
            .filter(|s| s.fetched_at.elapsed() < self.ttl)
            .map(|s| s.value.clone())
    }

    /// Any stored value with its age, fresh or not.
    pub fn stale(&self) -> Option<(T, u64)> {
        let slot = self.slot.lock().unwrap();
        slot.as_ref()
            .map(|s| (s.value.clone(), s.fetched_at.elapsed().as_millis() as u64))
    }

    pub fn store(&self, value: T) {
        let mut slot = self.slot.lock().unwrap();
        *slot = Some(Slot {
            value,
            fetched_at: Instant::now(),
        });
    }

    /// Decide how to satisfy a read given the limiter's predicted wait.
    /// Returns a cache hit (fresh or degraded) or `None` when the caller
    /// should perform the fetch.
    pub fn plan_read(&self, predicted_wait_ms: u64, degrade_after_ms: u64) -> Option<CacheRead<T>> {
        if let Some(value) = self.fresh() {
            return Some(CacheRead {
                value,
                degraded: false,
                stale_ms: 0,
                predicted_wait_ms,
            });
        }
        if predicted_wait_ms > degrade_after_ms {
            if let Some((value, stale_ms)) = self.stale() {
                return Some(CacheRead {
                    value,
                    degraded: true,
                    stale_ms,
                    predicted_wait_ms,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_value_is_served_without_fetch() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.store(7u32);
        let read = cache.plan_read(0, 1_000).expect("fresh hit");
        assert_eq!(read.value, 7);
        assert!(!read.degraded);
    }

    #[test]
    fn expired_value_degrades_only_under_rate_pressure() {
        let cache = TtlCache::new(Duration::from_millis(0));
        cache.store(7u32);
        // No rate pressure: caller should fetch.
        assert!(cache.plan_read(0, 1_000).is_none());
        // Heavy predicted wait: serve stale, marked degraded.
        let read = cache.plan_read(5_000, 1_000).expect("degraded hit");
        assert!(read.degraded);
        assert_eq!(read.value, 7);
        assert_eq!(read.predicted_wait_ms, 5_000);
    }

    #[test]
    fn empty_cache_never_degrades() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(1));
        assert!(cache.plan_read(10_000, 1_000).is_none());
    }
}
