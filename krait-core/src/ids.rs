//! Identifier and timestamp helpers.

use chrono::Utc;
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// UTC calendar day used to key the daily risk ledger.
#[must_use]
pub fn utc_trade_date() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Fresh event identifier (uuid v4, simple form).
#[must_use]
pub fn new_event_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Fresh trace identifier.
#[must_use]
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Deterministic order/position id derived from an idempotency key, so that
/// retried writes target the same row.
#[must_use]
pub fn derived_id(prefix: &str, idempotency_key: &str) -> String {
    let ns = Uuid::NAMESPACE_OID;
    let uuid = Uuid::new_v5(&ns, format!("{prefix}:{idempotency_key}").as_bytes());
    format!("{prefix}-{}", uuid.simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ids_are_stable_per_key() {
        let a = derived_id("pos", "plan-1");
        let b = derived_id("pos", "plan-1");
        let c = derived_id("pos", "plan-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("pos-"));
    }

    #[test]
    fn event_ids_are_unique() {
        assert_ne!(new_event_id(), new_event_id());
    }
}
