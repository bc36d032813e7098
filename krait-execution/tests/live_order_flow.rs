//! Live-mode flows against a scripted venue: limit-entry timeout handling,
//! position sync convergence, WS drift detection, venue rejection rollback.

mod common;

use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;

use krait_core::events::{ReportStatus, RiskEventType};
use krait_core::ids::now_ms;
use krait_core::{
    ExecutionMode, ExitReason, OrderPurpose, OrderStatus, OrderType, PositionStatus, Side,
    Timeframe,
};
use krait_exchange::VenueExecution;
use krait_execution::{
    EntryOrderManager, PositionSync, Reconciler, TradePlanExecutor, WsIngest,
};

use common::{harness, plan, test_config, RejectingVenue, RecordingLog};

fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn live_limit_config() -> krait_config::AppConfig {
    let mut config = test_config(ExecutionMode::Live);
    config.entry.order_type = krait_config::EntryOrderType::Limit;
    config.entry.max_retries = 1;
    config.entry.fallback_market = true;
    config
}

/// Rewind the stored entry order's clock so the manager sees it as stalled.
fn backdate_entry(h: &common::Harness, key: &str, by_ms: i64) {
    let mut order = h
        .services
        .store
        .get_order(key, OrderPurpose::Entry)
        .unwrap()
        .unwrap();
    order.submitted_at_ms = Some(now_ms() - by_ms);
    h.services.store.upsert_order(&order).unwrap();
}

#[tokio::test]
async fn limit_entry_times_out_reprices_then_falls_back_to_market() {
    let h = harness(live_limit_config());
    let executor = TradePlanExecutor::new(h.services.clone(), None);
    let manager = EntryOrderManager::new(h.services.clone());

    executor
        .execute(&plan("s5", "1h", "BUY", 30_000.0, 29_000.0))
        .await
        .unwrap();
    let entry = h
        .services
        .store
        .get_order("s5", OrderPurpose::Entry)
        .unwrap()
        .unwrap();
    assert_eq!(entry.order_type, OrderType::Limit);
    assert_eq!(entry.status, OrderStatus::Submitted);
    assert_eq!(entry.retry_count, 0);

    // 16 s with no fill: cancel + reprice 5 bps toward the market.
    backdate_entry(&h, "s5", 16_000);
    manager.run_once().await.unwrap();
    let entry = h
        .services
        .store
        .get_order("s5", OrderPurpose::Entry)
        .unwrap()
        .unwrap();
    assert_eq!(entry.retry_count, 1);
    assert_eq!(entry.status, OrderStatus::Submitted);
    assert_eq!(entry.price, Some(d("30015"))); // 30000 * (1 + 5/10000)
    assert_eq!(h.venue.canceled.lock().unwrap().len(), 1);

    // Still unfilled after another 16 s: market fallback.
    backdate_entry(&h, "s5", 16_000);
    manager.run_once().await.unwrap();
    let entry = h
        .services
        .store
        .get_order("s5", OrderPurpose::Entry)
        .unwrap()
        .unwrap();
    assert_eq!(entry.order_type, OrderType::Market);
    assert_eq!(entry.price, None);
    assert_eq!(entry.retry_count, 2);
    assert_eq!(h.venue.canceled.lock().unwrap().len(), 2);

    // Venue saw: limit entry, 2 reduce-only TPs, repriced limit, market.
    let placed = h.venue.placed.lock().unwrap();
    let entries: Vec<_> = placed
        .iter()
        .filter(|p| p.order_link_id.starts_with("s5:ENTRY"))
        .collect();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].order_type, OrderType::Limit);
    assert_eq!(entries[1].order_type, OrderType::Limit);
    assert_eq!(entries[1].price.as_deref(), Some("30015"));
    assert_eq!(entries[2].order_type, OrderType::Market);
    assert!(entries[2].order_link_id.ends_with(":FALLBACK"));
    drop(placed);

    let events = h.log.risk_events();
    let kinds: Vec<RiskEventType> = events.iter().map(|e| e.event_type).collect();
    assert!(kinds.contains(&RiskEventType::OrderTimeout));
    assert!(kinds.contains(&RiskEventType::OrderCancelled));
    assert!(kinds.contains(&RiskEventType::OrderRetry));
    assert!(kinds.contains(&RiskEventType::OrderFallbackMarket));

    let reports = h.log.reports();
    assert!(reports.iter().any(|r| {
        r.status == ReportStatus::OrderSubmitted && r.reason.as_deref() == Some("ORDER_RETRY")
    }));
    assert!(reports.iter().any(|r| {
        r.status == ReportStatus::OrderSubmitted
            && r.reason.as_deref() == Some("ORDER_FALLBACK_MARKET")
    }));
}

#[tokio::test]
async fn abandoned_entry_fails_the_position() {
    let mut config = live_limit_config();
    config.entry.max_retries = 0;
    config.entry.fallback_market = false;
    let h = harness(config);
    let executor = TradePlanExecutor::new(h.services.clone(), None);
    let manager = EntryOrderManager::new(h.services.clone());

    executor
        .execute(&plan("dead", "1h", "BUY", 30_000.0, 29_000.0))
        .await
        .unwrap();
    backdate_entry(&h, "dead", 16_000);
    manager.run_once().await.unwrap();

    let entry = h
        .services
        .store
        .get_order("dead", OrderPurpose::Entry)
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, OrderStatus::Failed);
    let position = h
        .services
        .store
        .get_position_by_idem("dead")
        .unwrap()
        .unwrap();
    assert_eq!(position.status, PositionStatus::Failed);
    assert_eq!(position.exit_reason, Some(ExitReason::EntryFailed));
    assert!(h.log.reports().iter().any(|r| {
        r.status == ReportStatus::OrderRejected && r.reason.as_deref() == Some("ORDER_TIMEOUT")
    }));
}

#[tokio::test]
async fn position_sync_closes_stale_rows_with_conservative_reason() {
    let h = harness(test_config(ExecutionMode::Live));
    let executor = TradePlanExecutor::new(h.services.clone(), None);
    let sync = PositionSync::new(h.services.clone());

    executor
        .execute(&plan("stale", "1h", "BUY", 30_000.0, 29_000.0))
        .await
        .unwrap();
    // The venue reports flat while the DB row is OPEN and TP1 never filled.
    h.venue.set_position_size(0.0);
    sync.run_once().await.unwrap();

    let position = h
        .services
        .store
        .get_position_by_idem("stale")
        .unwrap()
        .unwrap();
    assert_eq!(position.status, PositionStatus::Closed);
    assert_eq!(position.exit_reason, Some(ExitReason::StopLoss));
    assert!(h
        .services
        .store
        .active_cooldown("BTCUSDT", Side::Buy, Timeframe::H1, now_ms())
        .unwrap()
        .is_some());
    assert!(h.log.reports().iter().any(|r| {
        r.idempotency_key == "stale" && r.status == ReportStatus::PositionClosed
    }));
}

#[tokio::test]
async fn position_sync_after_tp1_is_exchange_closed_without_cooldown() {
    let h = harness(test_config(ExecutionMode::Live));
    let executor = TradePlanExecutor::new(h.services.clone(), None);
    let sync = PositionSync::new(h.services.clone());

    executor
        .execute(&plan("tp1-done", "1h", "BUY", 30_000.0, 29_000.0))
        .await
        .unwrap();
    let mut position = h
        .services
        .store
        .get_position_by_idem("tp1-done")
        .unwrap()
        .unwrap();
    position.meta.tp1_filled = true;
    h.services.store.upsert_position(&position).unwrap();

    h.venue.set_position_size(0.0);
    sync.run_once().await.unwrap();

    let position = h
        .services
        .store
        .get_position_by_idem("tp1-done")
        .unwrap()
        .unwrap();
    assert_eq!(position.exit_reason, Some(ExitReason::ExchangeClosed));
    assert!(h
        .services
        .store
        .active_cooldown("BTCUSDT", Side::Buy, Timeframe::H1, now_ms())
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn open_positions_on_exchange_are_left_alone() {
    let h = harness(test_config(ExecutionMode::Live));
    let executor = TradePlanExecutor::new(h.services.clone(), None);
    let sync = PositionSync::new(h.services.clone());

    executor
        .execute(&plan("live", "1h", "BUY", 30_000.0, 29_000.0))
        .await
        .unwrap();
    h.venue.set_position_size(0.05);
    sync.run_once().await.unwrap();

    let position = h.services.store.get_position_by_idem("live").unwrap().unwrap();
    assert_eq!(position.status, PositionStatus::Open);
}

#[tokio::test]
async fn reconcile_moves_stop_to_break_even_after_tp1_fill() {
    let h = harness(test_config(ExecutionMode::Live));
    let executor = TradePlanExecutor::new(h.services.clone(), None);
    let reconciler = Reconciler::new(h.services.clone());

    executor
        .execute(&plan("be", "1h", "BUY", 30_000.0, 29_000.0))
        .await
        .unwrap();
    // Venue reports the TP1 child filled; the feed that would have told us
    // first is assumed lost.
    *h.venue.open_orders.lock().unwrap() = vec![serde_json::from_value(serde_json::json!({
        "orderId": "v-tp1",
        "orderLinkId": "be:TP1",
        "symbol": "BTCUSDT",
        "side": "Sell",
        "orderType": "Limit",
        "orderStatus": "Filled",
        "price": "31000",
        "qty": "0.02",
        "cumExecQty": "0.02",
        "avgPrice": "31000"
    }))
    .unwrap()];

    reconciler.run_once().await.unwrap();

    let position = h.services.store.get_position_by_idem("be").unwrap().unwrap();
    assert!(position.meta.tp1_filled);
    assert!(position.meta.tp1_breakeven_applied);
    // Last trading stop pushed to the venue equals the entry price.
    let stops = h.venue.trading_stops.lock().unwrap();
    assert_eq!(stops.last().map(String::as_str), Some("30000"));
    drop(stops);
    assert!(h
        .log
        .reports()
        .iter()
        .any(|r| r.idempotency_key == "be" && r.status == ReportStatus::TpHit));
}

#[tokio::test]
async fn ws_position_drift_emits_once_per_window() {
    let h = harness(test_config(ExecutionMode::Live));
    let executor = TradePlanExecutor::new(h.services.clone(), None);
    let ingest = WsIngest::new(h.services.clone());

    executor
        .execute(&plan("drift", "1h", "BUY", 30_000.0, 29_000.0))
        .await
        .unwrap();
    // Local qty 0.05; WS says 0.056 -> 12% drift, above the 10% threshold.
    let update: krait_exchange::ws::WsPositionUpdate = serde_json::from_value(serde_json::json!({
        "symbol": "BTCUSDT",
        "side": "Buy",
        "size": "0.056"
    }))
    .unwrap();

    ingest
        .handle_event(krait_exchange::ws::PrivateEvent::Position(update.clone()))
        .await
        .unwrap();
    ingest
        .handle_event(krait_exchange::ws::PrivateEvent::Position(update))
        .await
        .unwrap();

    let drift_events = h
        .log
        .risk_events()
        .into_iter()
        .filter(|e| e.event_type == RiskEventType::ConsistencyDrift)
        .count();
    assert_eq!(drift_events, 1, "second snapshot inside the window is suppressed");

    let position = h
        .services
        .store
        .get_position_by_idem("drift")
        .unwrap()
        .unwrap();
    assert!(position.meta.ws_position.is_some());
}

#[tokio::test]
async fn ws_execution_converges_order_to_filled() {
    let h = harness(test_config(ExecutionMode::Live));
    let executor = TradePlanExecutor::new(h.services.clone(), None);
    let ingest = WsIngest::new(h.services.clone());

    executor
        .execute(&plan("conv", "1h", "BUY", 30_000.0, 29_000.0))
        .await
        .unwrap();
    let entry = h
        .services
        .store
        .get_order("conv", OrderPurpose::Entry)
        .unwrap()
        .unwrap();
    let venue_id = entry.venue_order_id.clone().unwrap();

    // Two executions covering the full 0.05 arrive before any order update.
    for (exec_id, qty) in [("e1", "0.03"), ("e2", "0.02")] {
        let update: krait_exchange::ws::WsExecutionUpdate =
            serde_json::from_value(serde_json::json!({
                "execId": exec_id,
                "orderId": venue_id,
                "symbol": "BTCUSDT",
                "side": "Buy",
                "execQty": qty,
                "execPrice": "30000",
                "execTime": "1700000000000"
            }))
            .unwrap();
        ingest
            .handle_event(krait_exchange::ws::PrivateEvent::Execution(update))
            .await
            .unwrap();
    }

    let entry = h
        .services
        .store
        .get_order("conv", OrderPurpose::Entry)
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, OrderStatus::Filled);

    // Redelivering an execution id is a no-op.
    let dup: krait_exchange::ws::WsExecutionUpdate = serde_json::from_value(serde_json::json!({
        "execId": "e1",
        "orderId": venue_id,
        "symbol": "BTCUSDT",
        "side": "Buy",
        "execQty": "0.03",
        "execPrice": "30000",
        "execTime": "1700000000000"
    }))
    .unwrap();
    let reports_before = h.log.reports().len();
    ingest
        .handle_event(krait_exchange::ws::PrivateEvent::Execution(dup))
        .await
        .unwrap();
    assert_eq!(h.log.reports().len(), reports_before);
}

#[tokio::test]
async fn venue_rejection_rolls_the_position_back() {
    let config = live_limit_config();
    let log = Arc::new(RecordingLog::default());
    let store = Arc::new(krait_store::Store::open_in_memory().unwrap());
    let services = krait_execution::Services::new(
        Arc::new(config),
        store.clone(),
        Arc::new(RejectingVenue) as Arc<dyn VenueExecution>,
        log.clone() as Arc<dyn krait_bus::EventLog>,
    );
    let executor = TradePlanExecutor::new(services, None);
    executor
        .execute(&plan("rej", "1h", "BUY", 30_000.0, 29_000.0))
        .await
        .unwrap();

    let position = store.get_position_by_idem("rej").unwrap().unwrap();
    assert_eq!(position.status, PositionStatus::Failed);
    assert_eq!(position.exit_reason, Some(ExitReason::EntryFailed));
    assert!(log.reports().iter().any(|r| {
        r.idempotency_key == "rej" && r.status == ReportStatus::OrderRejected
    }));
    assert_eq!(store.count_open_positions().unwrap(), 0);
}
