//! Report and risk-event publication.
//!
//! Every event is persisted to its ledger and published to the bus under the
//! same event id, so re-publishing after a retry is a no-op on both sides.
//! Spam-prone risk-event types are suppressed within a per-(type, symbol)
//! window; the window set is process-local, so a restart may emit one
//! duplicate per key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::warn;

use krait_bus::EventLog;
use krait_core::events::{
    topics, Envelope, ExecutionReport, RiskEvent, RiskEventType, Severity,
};
use krait_core::ids::{new_event_id, now_ms, utc_trade_date};
use krait_store::Store;

const SERVICE: &str = "execution-service";

pub struct Publisher {
    log: Arc<dyn EventLog>,
    store: Arc<Store>,
    window_ms: i64,
    dedup: Mutex<HashMap<(RiskEventType, String), i64>>,
}

impl Publisher {
    pub fn new(log: Arc<dyn EventLog>, store: Arc<Store>, window_ms: i64) -> Self {
        Self {
            log,
            store,
            window_ms,
            dedup: Mutex::new(HashMap::new()),
        }
    }

    /// Persist and publish an execution report. Exactly one ledger row and
    /// one stream record per event id.
    pub async fn execution_report(&self, report: &ExecutionReport) -> Result<()> {
        let envelope = Envelope::new(SERVICE, report).context("encode execution report")?;
        let payload = serde_json::to_value(report)?;
        self.store.insert_execution_report(
            &envelope.event_id,
            envelope.ts_ms,
            &report.idempotency_key,
            &report.symbol,
            report.status,
            &payload,
        )?;
        if let Err(err) = self.log.publish(topics::EXECUTION_REPORT, &envelope).await {
            // The ledger row is the source of truth; a failed publish is
            // retried by the next state change, not by duplicating effects.
            warn!(error = %err, event_id = %envelope.event_id, "execution report publish failed");
        }
        Ok(())
    }

    /// Persist and publish a risk event. Returns false when the event was
    /// suppressed by the per-type window.
    pub async fn risk_event(&self, event: &RiskEvent) -> Result<bool> {
        if event.event_type.is_windowed() && !self.window_allows(event) {
            return Ok(false);
        }
        let event_id = new_event_id();
        let envelope = Envelope {
            event_id: event_id.clone(),
            ts_ms: now_ms(),
            env: None,
            service: SERVICE.to_string(),
            trace_id: None,
            schema_version: 1,
            meta: None,
            payload: serde_json::to_value(event)?,
            ext: None,
        };
        let detail = serde_json::Value::Object(event.detail.clone());
        self.store.insert_risk_event(
            &event_id,
            &utc_trade_date(),
            envelope.ts_ms,
            event.event_type,
            event.severity,
            event.symbol.as_deref(),
            &detail,
        )?;
        if let Err(err) = self.log.publish(topics::RISK_EVENT, &envelope).await {
            warn!(error = %err, event_id = %event_id, "risk event publish failed");
        }
        Ok(true)
    }

    fn window_allows(&self, event: &RiskEvent) -> bool {
        let key = (
            event.event_type,
            event.symbol.clone().unwrap_or_default(),
        );
        let now = now_ms();
        let mut dedup = self.dedup.lock().unwrap();
        match dedup.get(&key) {
            Some(last) if now - last < self.window_ms => false,
            _ => {
                dedup.insert(key, now);
                true
            }
        }
    }
}

/// Shorthand constructor for a risk event with a detail map.
#[must_use]
pub fn risk_event(
    event_type: RiskEventType,
    severity: Severity,
    symbol: Option<&str>,
    detail: serde_json::Map<String, serde_json::Value>,
) -> RiskEvent {
    RiskEvent {
        event_type,
        severity,
        symbol: symbol.map(str::to_string),
        retry_after_ms: None,
        detail,
        ext: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use krait_bus::{BusResult, ReadBatch};
    use krait_core::events::ReportStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Event log fake that counts publishes per topic.
    pub struct CountingLog {
        pub published: AtomicUsize,
    }

    #[async_trait]
    impl EventLog for CountingLog {
        async fn publish(&self, _topic: &str, _envelope: &Envelope) -> BusResult<String> {
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok("1-0".into())
        }
        async fn consume(
            &self,
            _topic: &str,
            _group: &str,
            _consumer: &str,
            _count: usize,
            _block_ms: u64,
        ) -> BusResult<ReadBatch> {
            Ok(ReadBatch::default())
        }
        async fn ack(&self, _topic: &str, _group: &str, _record_id: &str) -> BusResult<()> {
            Ok(())
        }
        async fn ensure_group(&self, _topic: &str, _group: &str) -> BusResult<()> {
            Ok(())
        }
        async fn pending_count(&self, _topic: &str, _group: &str) -> BusResult<u64> {
            Ok(0)
        }
        async fn group_lag(&self, _topic: &str, _group: &str) -> BusResult<u64> {
            Ok(0)
        }
    }

    fn publisher(window_ms: i64) -> (Publisher, Arc<CountingLog>) {
        let log = Arc::new(CountingLog {
            published: AtomicUsize::new(0),
        });
        let store = Arc::new(Store::open_in_memory().unwrap());
        (
            Publisher::new(log.clone() as Arc<dyn EventLog>, store, window_ms),
            log,
        )
    }

    #[tokio::test]
    async fn windowed_types_suppress_repeats() {
        let (publisher, log) = publisher(300_000);
        let event = risk_event(
            RiskEventType::ConsistencyDrift,
            Severity::Important,
            Some("BTCUSDT"),
            serde_json::Map::new(),
        );
        assert!(publisher.risk_event(&event).await.unwrap());
        assert!(!publisher.risk_event(&event).await.unwrap());
        assert_eq!(log.published.load(Ordering::SeqCst), 1);

        // A different symbol is a different window key.
        let other = risk_event(
            RiskEventType::ConsistencyDrift,
            Severity::Important,
            Some("ETHUSDT"),
            serde_json::Map::new(),
        );
        assert!(publisher.risk_event(&other).await.unwrap());
    }

    #[tokio::test]
    async fn non_windowed_types_always_emit() {
        let (publisher, log) = publisher(300_000);
        let event = risk_event(
            RiskEventType::OrderRetry,
            Severity::Info,
            Some("BTCUSDT"),
            serde_json::Map::new(),
        );
        assert!(publisher.risk_event(&event).await.unwrap());
        assert!(publisher.risk_event(&event).await.unwrap());
        assert_eq!(log.published.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn execution_reports_persist_to_ledger() {
        let log = Arc::new(CountingLog {
            published: AtomicUsize::new(0),
        });
        let store = Arc::new(Store::open_in_memory().unwrap());
        let publisher = Publisher::new(log as Arc<dyn EventLog>, store.clone(), 300_000);
        let report = ExecutionReport {
            plan_id: None,
            idempotency_key: "k1".into(),
            order_id: None,
            status: ReportStatus::Filled,
            reason: None,
            symbol: "BTCUSDT".into(),
            timeframe: None,
            filled_qty: Some(0.05),
            avg_price: Some(30_000.0),
            latency_ms: None,
            slippage_bps: None,
            retry_count: None,
            fill_ratio: None,
            detail: serde_json::Map::new(),
            ext: serde_json::Map::new(),
        };
        publisher.execution_report(&report).await.unwrap();
        assert_eq!(store.count_execution_reports("k1").unwrap(), 1);
    }
}
