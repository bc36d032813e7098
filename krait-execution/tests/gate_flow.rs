//! Admission-gate flows: kill switch, max positions, mutex priority upgrade.

mod common;

use std::sync::Arc;

use krait_core::events::{ReportStatus, RiskEventType};
use krait_core::{ExecutionMode, ExitReason, OrderPurpose, OrderStatus, PositionStatus, Timeframe};
use krait_execution::TradePlanExecutor;

use common::{harness, plan, test_config};

#[tokio::test]
async fn kill_switch_rejects_with_zero_venue_calls() {
    let mut config = test_config(ExecutionMode::Live);
    config.risk.kill_switch_force_on = true;
    let h = harness(config);
    let executor = TradePlanExecutor::new(h.services.clone(), None);

    executor
        .execute(&plan("ks", "1h", "BUY", 30_000.0, 29_000.0))
        .await
        .unwrap();

    assert_eq!(h.venue.call_count(), 0, "kill switch must precede venue IO");
    let events = h.log.risk_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, RiskEventType::KillSwitchOn);
    let reports = h.log.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, ReportStatus::OrderRejected);
    assert_eq!(reports[0].reason.as_deref(), Some("KILL_SWITCH_ON"));
    assert!(h.services.store.get_position_by_idem("ks").unwrap().is_none());
}

#[tokio::test]
async fn persisted_kill_switch_flag_blocks_entries() {
    let h = harness(test_config(ExecutionMode::Paper));
    h.services
        .store
        .set_runtime_flag("KILL_SWITCH", "true")
        .unwrap();
    let executor = TradePlanExecutor::new(h.services.clone(), None);
    executor
        .execute(&plan("flag", "1h", "BUY", 30_000.0, 29_000.0))
        .await
        .unwrap();
    assert!(h
        .log
        .reports()
        .iter()
        .all(|r| r.status != ReportStatus::OrderSubmitted && r.status != ReportStatus::Filled));
}

#[tokio::test]
async fn expired_plan_is_rejected_as_signal_expired() {
    let h = harness(test_config(ExecutionMode::Paper));
    let executor = TradePlanExecutor::new(h.services.clone(), None);
    let mut p = plan("exp", "1h", "BUY", 30_000.0, 29_000.0);
    p.expires_at_ms = Some(1_000); // long past
    executor.execute(&p).await.unwrap();

    let events = h.log.risk_events();
    assert!(events
        .iter()
        .any(|e| e.event_type == RiskEventType::SignalExpired));
    assert!(h.log.reports().iter().any(|r| {
        r.status == ReportStatus::OrderRejected && r.reason.as_deref() == Some("SIGNAL_EXPIRED")
    }));
}

#[tokio::test]
async fn max_positions_gate_counts_open_rows() {
    let mut config = test_config(ExecutionMode::Paper);
    config.gates.max_open_positions = 1;
    let h = harness(config);
    let executor = TradePlanExecutor::new(h.services.clone(), None);

    executor
        .execute(&plan("first", "1h", "BUY", 30_000.0, 29_000.0))
        .await
        .unwrap();
    executor
        .execute(&plan("second", "1h", "SELL", 2_000.0, 2_100.0))
        .await
        .unwrap();

    assert_eq!(h.services.store.count_open_positions().unwrap(), 1);
    assert!(h
        .log
        .risk_events()
        .iter()
        .any(|e| e.event_type == RiskEventType::MaxPositionsBlocked));
}

#[tokio::test]
async fn mutex_blocks_lower_priority_and_upgrades_higher() {
    let mut config = test_config(ExecutionMode::Paper);
    config.gates.mutex_upgrade_action = krait_config::MutexUpgradeAction::CloseLowerAndOpen;
    let h = harness(config);
    let executor = TradePlanExecutor::new(h.services.clone(), None);

    executor
        .execute(&plan("h1", "1h", "BUY", 30_000.0, 29_000.0))
        .await
        .unwrap();

    // Same-priority duplicate direction: blocked.
    executor
        .execute(&plan("h1-again", "1h", "BUY", 30_100.0, 29_100.0))
        .await
        .unwrap();
    assert!(h
        .log
        .risk_events()
        .iter()
        .any(|e| e.event_type == RiskEventType::PositionMutexBlocked));
    assert!(h
        .services
        .store
        .get_position_by_idem("h1-again")
        .unwrap()
        .is_none());

    // Higher timeframe: the 1h position is force-closed and the 4h opens.
    executor
        .execute(&plan("h4", "4h", "BUY", 30_200.0, 29_200.0))
        .await
        .unwrap();

    let old = h.services.store.get_position_by_idem("h1").unwrap().unwrap();
    assert_eq!(old.status, PositionStatus::Closed);
    assert_eq!(old.exit_reason, Some(ExitReason::MutexUpgrade));
    let old_tp1 = h
        .services
        .store
        .get_order("h1", OrderPurpose::Tp1)
        .unwrap()
        .unwrap();
    assert_eq!(old_tp1.status, OrderStatus::Canceled);
    let old_tp2 = h
        .services
        .store
        .get_order("h1", OrderPurpose::Tp2)
        .unwrap()
        .unwrap();
    assert_eq!(old_tp2.status, OrderStatus::Canceled);

    assert!(h
        .log
        .reports()
        .iter()
        .any(|r| r.idempotency_key == "h1"
            && r.status == ReportStatus::SecondarySlExit
            && r.reason.as_deref() == Some("MUTEX_UPGRADE")));

    let new = h.services.store.get_position_by_idem("h4").unwrap().unwrap();
    assert_eq!(new.status, PositionStatus::Open);
    assert_eq!(new.timeframe, Timeframe::H4);
}

#[tokio::test]
async fn soft_halt_blocks_new_entries_only() {
    let h = harness(test_config(ExecutionMode::Paper));
    let executor = Arc::new(TradePlanExecutor::new(h.services.clone(), None));

    // Open a position before the halt.
    executor
        .execute(&plan("pre", "1h", "BUY", 30_000.0, 29_000.0))
        .await
        .unwrap();

    let mut state = h
        .services
        .store
        .get_or_init_risk_state(&krait_core::ids::utc_trade_date(), "PAPER")
        .unwrap();
    state.soft_halt = true;
    h.services.store.update_risk_state(&state).unwrap();

    // New entry is halted.
    executor
        .execute(&plan("post", "1h", "SELL", 2_000.0, 2_100.0))
        .await
        .unwrap();
    assert!(h
        .log
        .risk_events()
        .iter()
        .any(|e| e.event_type == RiskEventType::RiskCircuitHalt));

    // Closing the existing position still works under the halt.
    executor
        .close_position_market("pre", None, None, ExitReason::ForcedExit)
        .await
        .unwrap();
    let closed = h.services.store.get_position_by_idem("pre").unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
}
