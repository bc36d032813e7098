//! Distributed plan-level idempotency lock.
//!
//! `SET key token NX PX ttl` to acquire; release runs a compare-and-delete
//! script so only the holder of the token can unlock. Duplicate trade_plan
//! deliveries across consumer instances serialize on this lock.

use redis::aio::ConnectionManager;
use redis::Script;
use tracing::debug;
use uuid::Uuid;

use crate::BusResult;

const UNLOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
  return redis.call("del", KEYS[1])
else
  return 0
end
"#;

/// Factory for plan locks sharing one Redis connection.
#[derive(Clone)]
pub struct PlanLock {
    conn: ConnectionManager,
    ttl_ms: u64,
}

/// Held lock; release is explicit and best-effort (the TTL is the backstop).
pub struct PlanLockGuard {
    key: String,
    token: String,
}

impl PlanLock {
    #[must_use]
    pub fn new(conn: ConnectionManager, ttl_ms: u64) -> Self {
        Self { conn, ttl_ms }
    }

    /// Open a dedicated connection for the lock.
    pub async fn connect(redis_url: &str, ttl_ms: u64) -> crate::BusResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, ttl_ms))
    }

    /// Try to take the lock for a plan. `None` means another consumer holds
    /// it and the delivery should be treated as a duplicate.
    pub async fn acquire(&self, idempotency_key: &str) -> BusResult<Option<PlanLockGuard>> {
        let key = format!("lock:plan:{idempotency_key}");
        let token = Uuid::new_v4().simple().to_string();
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_ms)
            .query_async(&mut conn)
            .await?;
        if acquired.is_none() {
            debug!(key, "plan lock already held; duplicate delivery");
            return Ok(None);
        }
        Ok(Some(PlanLockGuard { key, token }))
    }

    /// Release a held lock. Failure is swallowed: the TTL will reap it.
    pub async fn release(&self, guard: PlanLockGuard) {
        let mut conn = self.conn.clone();
        let script = Script::new(UNLOCK_SCRIPT);
        let released: Result<i64, redis::RedisError> = script
            .key(&guard.key)
            .arg(&guard.token)
            .invoke_async(&mut conn)
            .await;
        if let Err(err) = released {
            debug!(key = %guard.key, error = %err, "plan lock release failed; ttl will expire it");
        }
    }
}
