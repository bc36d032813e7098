//! Shared harness: scripted venue, recording event log, service wiring.
//! Each integration binary uses a different slice of it.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use krait_bus::{BusResult, EventLog, ReadBatch};
use krait_config::AppConfig;
use krait_core::events::{topics, BarClose, Envelope, ExecutionReport, RiskEvent};
use krait_core::{ExecutionMode, TradePlan};
use krait_exchange::{
    CacheRead, CreatedOrder, ExchangeError, InstrumentFilters, OrderParams, VenueExecution,
    VenueExecutionRow, VenueOrder, VenueResult, WalletTotals,
};
use krait_execution::Services;
use krait_store::Store;

/// Event log that records every publish for assertions.
#[derive(Default)]
pub struct RecordingLog {
    pub published: Mutex<Vec<(String, Envelope)>>,
}

impl RecordingLog {
    pub fn reports(&self) -> Vec<ExecutionReport> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(topic, _)| topic == topics::EXECUTION_REPORT)
            .filter_map(|(_, env)| env.decode().ok())
            .collect()
    }

    pub fn risk_events(&self) -> Vec<RiskEvent> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(topic, _)| topic == topics::RISK_EVENT)
            .filter_map(|(_, env)| env.decode().ok())
            .collect()
    }
}

#[async_trait]
impl EventLog for RecordingLog {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> BusResult<String> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), envelope.clone()));
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

/// Scripted venue double. Counts every call so tests can assert "zero venue
/// calls" paths.
pub struct MockVenue {
    pub calls: AtomicUsize,
    pub placed: Mutex<Vec<OrderParams>>,
    pub canceled: Mutex<Vec<Option<String>>>,
    pub open_orders: Mutex<Vec<VenueOrder>>,
    pub trading_stops: Mutex<Vec<String>>,
    pub position_size: Mutex<f64>,
    pub equity: Mutex<f64>,
    next_id: AtomicUsize,
}

impl Default for MockVenue {
    fn default() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            placed: Mutex::new(Vec::new()),
            canceled: Mutex::new(Vec::new()),
            open_orders: Mutex::new(Vec::new()),
            trading_stops: Mutex::new(Vec::new()),
            position_size: Mutex::new(0.0),
            equity: Mutex::new(10_000.0),
            next_id: AtomicUsize::new(1),
        }
    }
}

impl MockVenue {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_position_size(&self, size: f64) {
        *self.position_size.lock().unwrap() = size;
    }
}

#[async_trait]
impl VenueExecution for MockVenue {
    async fn place_order(&self, params: OrderParams) -> VenueResult<CreatedOrder> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let link = params.order_link_id.clone();
        self.placed.lock().unwrap().push(params);
        Ok(CreatedOrder {
            order_id: format!("venue-{id}"),
            order_link_id: link,
        })
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        order_id: Option<&str>,
        _order_link_id: Option<&str>,
    ) -> VenueResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.canceled
            .lock()
            .unwrap()
            .push(order_id.map(str::to_string));
        Ok(())
    }

    async fn open_orders(&self, _symbol: &str) -> VenueResult<Vec<VenueOrder>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.open_orders.lock().unwrap().clone())
    }

    async fn position_size(&self, _symbol: &str) -> VenueResult<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.position_size.lock().unwrap())
    }

    async fn set_trading_stop(&self, _symbol: &str, stop_loss: &str) -> VenueResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.trading_stops
            .lock()
            .unwrap()
            .push(stop_loss.to_string());
        Ok(())
    }

    async fn wallet_equity(&self) -> VenueResult<WalletTotals> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(WalletTotals {
            total_equity: Some(*self.equity.lock().unwrap()),
            total_wallet_balance: None,
            total_available: None,
        })
    }

    async fn instrument_filters(&self, _symbol: &str) -> VenueResult<InstrumentFilters> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(InstrumentFilters::default())
    }

    async fn executions(&self, _symbol: &str, _limit: u32) -> VenueResult<Vec<VenueExecutionRow>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    async fn open_orders_degradable(
        &self,
        symbol: &str,
    ) -> VenueResult<CacheRead<Vec<VenueOrder>>> {
        Ok(CacheRead {
            value: self.open_orders(symbol).await?,
            degraded: false,
            stale_ms: 0,
            predicted_wait_ms: 0,
        })
    }
}

/// Venue double whose mutating calls always fail; used to prove failure paths
/// do not corrupt local state.
pub struct RejectingVenue;

#[async_trait]
impl VenueExecution for RejectingVenue {
    async fn place_order(&self, _params: OrderParams) -> VenueResult<CreatedOrder> {
        Err(ExchangeError::Venue {
            ret_code: 110_007,
            ret_msg: "insufficient available balance".into(),
        })
    }
    async fn cancel_order(
        &self,
        _symbol: &str,
        _order_id: Option<&str>,
        _order_link_id: Option<&str>,
    ) -> VenueResult<()> {
        Err(ExchangeError::Transport("down".into()))
    }
    async fn open_orders(&self, _symbol: &str) -> VenueResult<Vec<VenueOrder>> {
        Ok(Vec::new())
    }
    async fn position_size(&self, _symbol: &str) -> VenueResult<f64> {
        Ok(0.0)
    }
    async fn set_trading_stop(&self, _symbol: &str, _stop_loss: &str) -> VenueResult<()> {
        Err(ExchangeError::Transport("down".into()))
    }
    async fn wallet_equity(&self) -> VenueResult<WalletTotals> {
        Ok(WalletTotals {
            total_equity: Some(10_000.0),
            total_wallet_balance: None,
            total_available: None,
        })
    }
    async fn instrument_filters(&self, _symbol: &str) -> VenueResult<InstrumentFilters> {
        Ok(InstrumentFilters::default())
    }
    async fn executions(&self, _symbol: &str, _limit: u32) -> VenueResult<Vec<VenueExecutionRow>> {
        Ok(Vec::new())
    }
}

pub fn test_config(mode: ExecutionMode) -> AppConfig {
    let mut config: AppConfig = serde_json::from_value(serde_json::json!({})).unwrap();
    config.execution_mode = mode;
    config
}

pub struct Harness {
    pub services: Services,
    pub log: Arc<RecordingLog>,
    pub venue: Arc<MockVenue>,
}

pub fn harness(config: AppConfig) -> Harness {
    let log = Arc::new(RecordingLog::default());
    let venue = Arc::new(MockVenue::default());
    let store = Arc::new(Store::open_in_memory().unwrap());
    let services = Services::new(
        Arc::new(config),
        store,
        venue.clone() as Arc<dyn VenueExecution>,
        log.clone() as Arc<dyn EventLog>,
    );
    Harness {
        services,
        log,
        venue,
    }
}

pub fn plan(key: &str, timeframe: &str, side: &str, entry: f64, stop: f64) -> TradePlan {
    serde_json::from_value(serde_json::json!({
        "plan_id": format!("plan-{key}"),
        "idempotency_key": key,
        "symbol": "BTCUSDT",
        "timeframe": timeframe,
        "side": side,
        "entry_price": entry,
        "primary_sl_price": stop,
        "risk_pct": 0.005,
        "close_time_ms": 1_700_000_000_000i64,
        "ext": {"run_id": "run-1"}
    }))
    .unwrap()
}

pub fn bar(close_time_ms: i64, o: f64, h: f64, l: f64, c: f64) -> BarClose {
    serde_json::from_value(serde_json::json!({
        "symbol": "BTCUSDT",
        "timeframe": "1h",
        "close_time_ms": close_time_ms,
        "is_final": true,
        "ohlcv": {"open": o, "high": h, "low": l, "close": c, "volume": 10.0}
    }))
    .unwrap()
}

pub fn bar_envelope(bar: &BarClose) -> Envelope {
    Envelope::new("marketdata-service", bar).unwrap()
}
