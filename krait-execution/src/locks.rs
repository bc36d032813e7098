//! In-process per-position advisory locks.
//!
//! The paper matcher, the reconciler and the position-sync loop all mutate
//! the same position rows; holding the position's lock across a
//! read-modify-write keeps their updates serialized. Promote to a
//! distributed lock keyed by position id if the core ever runs
//! multi-process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

#[derive(Default)]
pub struct PositionLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PositionLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock handle for one idempotency key, created on first use.
    pub fn for_key(&self, idempotency_key: &str) -> Arc<AsyncMutex<()>> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entry(idempotency_key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drop lock entries for keys no longer in play (closed positions).
    pub fn retain_keys(&self, live: &[String]) {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|key, _| live.iter().any(|k| k == key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_serializes_distinct_keys_do_not() {
        let locks = PositionLocks::new();
        let a1 = locks.for_key("a");
        let a2 = locks.for_key("a");
        assert!(Arc::ptr_eq(&a1, &a2));

        let _held = a1.lock().await;
        // Same key is busy, a different key is immediately available.
        assert!(a2.try_lock().is_err());
        let b = locks.for_key("b");
        assert!(b.try_lock().is_ok());
    }

    #[tokio::test]
    async fn retain_drops_stale_entries() {
        let locks = PositionLocks::new();
        locks.for_key("a");
        locks.for_key("b");
        locks.retain_keys(&["b".to_string()]);
        assert_eq!(locks.inner.lock().unwrap().len(), 1);
        // Dropped keys are simply re-created on next use.
        locks.for_key("a");
        assert_eq!(locks.inner.lock().unwrap().len(), 2);
    }
}
