//! End-to-end paper flows: admission, TP laddering, stop-outs, idempotent
//! redelivery.

mod common;

use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;

use krait_core::events::ReportStatus;
use krait_core::{ExecutionMode, ExitReason, OrderPurpose, OrderStatus, PositionStatus, Side, Timeframe};
use krait_execution::{BarCloseHandler, TradePlanExecutor};

use common::{bar, bar_envelope, harness, plan, test_config};

const HOUR_MS: i64 = 3_600_000;
const T0: i64 = 1_700_000_000_000;

fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

#[tokio::test]
async fn happy_long_fills_tp1_then_tp2_and_stays_open() {
    let h = harness(test_config(ExecutionMode::Paper));
    let executor = Arc::new(TradePlanExecutor::new(h.services.clone(), None));
    let bars = Arc::new(BarCloseHandler::new(h.services.clone(), executor.clone()));

    executor
        .execute(&plan("s1", "1h", "BUY", 30_000.0, 29_000.0))
        .await
        .unwrap();

    // Entry filled immediately at plan price, qty = 10000 * 0.005 / 1000.
    let position = h.services.store.get_position_by_idem("s1").unwrap().unwrap();
    assert_eq!(position.qty_total, d("0.05"));
    assert_eq!(position.qty_runner, d("0.01"));
    assert_eq!(position.status, PositionStatus::Open);
    let entry = h
        .services
        .store
        .get_order("s1", OrderPurpose::Entry)
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, OrderStatus::Filled);

    // Bar A reaches 31000: TP1 fills, stop moves to break-even.
    bars.handle_envelope(&bar_envelope(&bar(T0 + HOUR_MS, 30_000.0, 31_000.0, 29_900.0, 30_800.0)))
        .await
        .unwrap();
    let position = h.services.store.get_position_by_idem("s1").unwrap().unwrap();
    assert!(position.meta.tp1_filled);
    assert!(!position.meta.tp2_filled);
    assert_eq!(position.meta.qty_open, Some(d("0.03")));
    let tp1 = h
        .services
        .store
        .get_order("s1", OrderPurpose::Tp1)
        .unwrap()
        .unwrap();
    assert_eq!(tp1.status, OrderStatus::Filled);
    assert_eq!(tp1.avg_price, Some(d("31000")));

    // Bar B reaches 32500: TP2 fills at 32000, runner (0.01) stays open.
    bars.handle_envelope(&bar_envelope(&bar(
        T0 + 2 * HOUR_MS,
        30_800.0,
        32_500.0,
        30_700.0,
        32_200.0,
    )))
    .await
    .unwrap();
    let position = h.services.store.get_position_by_idem("s1").unwrap().unwrap();
    assert!(position.meta.tp2_filled);
    assert_eq!(position.meta.qty_open, Some(d("0.01")));
    assert_eq!(position.status, PositionStatus::Open);

    let tp_hits = h
        .log
        .reports()
        .into_iter()
        .filter(|r| r.status == ReportStatus::TpHit)
        .count();
    assert_eq!(tp_hits, 2);
}

#[tokio::test]
async fn primary_stop_in_one_bar_closes_with_cooldown_and_loss_count() {
    let h = harness(test_config(ExecutionMode::Paper));
    let executor = Arc::new(TradePlanExecutor::new(h.services.clone(), None));
    let bars = Arc::new(BarCloseHandler::new(h.services.clone(), executor.clone()));

    executor
        .execute(&plan("s2", "1h", "BUY", 30_000.0, 29_000.0))
        .await
        .unwrap();

    // Down bar that touches both the high and the stop: the down path walks
    // open -> low first, so the stop fires at 29000 before anything else.
    let close_time = T0 + HOUR_MS;
    bars.handle_envelope(&bar_envelope(&bar(close_time, 30_000.0, 30_100.0, 28_900.0, 29_100.0)))
        .await
        .unwrap();

    let position = h.services.store.get_position_by_idem("s2").unwrap().unwrap();
    assert_eq!(position.status, PositionStatus::Closed);
    assert_eq!(position.exit_reason, Some(ExitReason::PrimarySlHit));
    assert_eq!(position.closed_at_ms, Some(close_time));
    assert!(position.closed_at_ms.unwrap() >= position.opened_at_ms);

    // PnL = 0.05 * (29000 - 30000) = -50 USDT, first consecutive loss.
    let closed = h
        .log
        .reports()
        .into_iter()
        .find(|r| r.status == ReportStatus::PositionClosed)
        .expect("close report");
    assert_eq!(closed.ext.get("pnl_usdt").and_then(|v| v.as_f64()), Some(-50.0));
    assert_eq!(
        closed
            .ext
            .get("consecutive_loss_count")
            .and_then(|v| v.as_u64()),
        Some(1)
    );
    assert!(h
        .log
        .reports()
        .iter()
        .any(|r| r.status == ReportStatus::PrimarySlHit));

    // Cooldown for (BTCUSDT, BUY, 1h) until close + 2 bars.
    let cooldown = h
        .services
        .store
        .active_cooldown("BTCUSDT", Side::Buy, Timeframe::H1, close_time)
        .unwrap()
        .expect("cooldown row");
    assert_eq!(cooldown.until_ts_ms, close_time + 2 * HOUR_MS);

    // The next same-key plan inside the window is rejected.
    executor
        .execute(&plan("s2-next", "1h", "BUY", 29_500.0, 28_500.0))
        .await
        .unwrap();
    assert!(h
        .log
        .reports()
        .iter()
        .any(|r| r.idempotency_key == "s2-next"
            && r.status == ReportStatus::OrderRejected
            && r.reason.as_deref() == Some("COOLDOWN_BLOCKED")));
}

#[tokio::test]
async fn redelivered_plan_and_bar_produce_no_duplicate_effects() {
    let h = harness(test_config(ExecutionMode::Paper));
    let executor = Arc::new(TradePlanExecutor::new(h.services.clone(), None));
    let bars = Arc::new(BarCloseHandler::new(h.services.clone(), executor.clone()));

    let p = plan("dup", "1h", "BUY", 30_000.0, 29_000.0);
    executor.execute(&p).await.unwrap();
    let reports_after_first = h.log.reports().len();
    executor.execute(&p).await.unwrap();
    assert_eq!(
        h.log.reports().len(),
        reports_after_first,
        "duplicate plan delivery must not re-report"
    );
    assert_eq!(h.services.store.count_open_positions().unwrap(), 1);

    let tp_bar = bar(T0 + HOUR_MS, 30_000.0, 31_000.0, 29_900.0, 30_800.0);
    let envelope = bar_envelope(&tp_bar);
    bars.handle_envelope(&envelope).await.unwrap();
    let tp1 = h
        .services
        .store
        .get_order("dup", OrderPurpose::Tp1)
        .unwrap()
        .unwrap();
    assert_eq!(tp1.status, OrderStatus::Filled);
    let reports_after_bar = h.log.reports().len();

    // Same close-time bar again: acknowledged without effects.
    bars.handle_envelope(&envelope).await.unwrap();
    assert_eq!(h.log.reports().len(), reports_after_bar);
    let position = h.services.store.get_position_by_idem("dup").unwrap().unwrap();
    assert_eq!(position.meta.qty_open, Some(d("0.03")));
}

#[tokio::test]
async fn short_plans_mirror_stops_and_targets() {
    let h = harness(test_config(ExecutionMode::Paper));
    let executor = Arc::new(TradePlanExecutor::new(h.services.clone(), None));
    let bars = Arc::new(BarCloseHandler::new(h.services.clone(), executor.clone()));

    executor
        .execute(&plan("short", "1h", "SELL", 30_000.0, 31_000.0))
        .await
        .unwrap();
    let tp1 = h
        .services
        .store
        .get_order("short", OrderPurpose::Tp1)
        .unwrap()
        .unwrap();
    assert_eq!(tp1.price, Some(d("29000")));
    assert_eq!(tp1.side, Side::Buy, "short exits buy back");

    // Up bar through the stop closes the short at 31000.
    bars.handle_envelope(&bar_envelope(&bar(T0 + HOUR_MS, 30_000.0, 31_200.0, 29_900.0, 31_100.0)))
        .await
        .unwrap();
    let position = h
        .services
        .store
        .get_position_by_idem("short")
        .unwrap()
        .unwrap();
    assert_eq!(position.status, PositionStatus::Closed);
    assert_eq!(position.exit_reason, Some(ExitReason::PrimarySlHit));
}
