//! Admission gates for incoming trade plans.
//!
//! Gates run in a fixed order and fail fast: the first rejecting gate wins.
//! Each rejection carries the normalized risk-event type, a severity and a
//! detail map; the executor turns that into one `ORDER_REJECTED` report and
//! one typed risk event.

use serde_json::{json, Map, Value};

use krait_config::{GateSettings, MutexUpgradeAction, RiskSettings};
use krait_core::events::{RiskEventType, Severity};
use krait_core::ids::utc_trade_date;
use krait_core::{Position, TradePlan};
use krait_store::{Store, StoreResult};

/// Outcome of one gate.
#[derive(Debug)]
pub enum GateDecision {
    Pass,
    Reject(Rejection),
    /// Mutex gate only: the incoming plan outranks an existing position that
    /// must be force-closed before opening.
    Upgrade(Box<Position>),
}

#[derive(Debug)]
pub struct Rejection {
    pub reason: RiskEventType,
    pub severity: Severity,
    pub detail: Map<String, Value>,
}

impl Rejection {
    fn new(reason: RiskEventType, detail: Map<String, Value>) -> Self {
        Self {
            reason,
            severity: Severity::Important,
            detail,
        }
    }
}

fn detail(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes" | "y"
    )
}

/// Gate 2: operator kill switch (env force-on OR persisted runtime flag).
pub fn kill_switch_gate(store: &Store, risk: &RiskSettings) -> StoreResult<GateDecision> {
    if !risk.kill_switch_enabled {
        return Ok(GateDecision::Pass);
    }
    if risk.kill_switch_force_on {
        return Ok(GateDecision::Reject(Rejection::new(
            RiskEventType::KillSwitchOn,
            detail(&[("reason", json!("FORCE_ON")), ("scope", json!("account"))]),
        )));
    }
    if let Some(value) = store.get_runtime_flag(&risk.kill_switch_flag_name)? {
        if truthy(&value) {
            return Ok(GateDecision::Reject(Rejection::new(
                RiskEventType::KillSwitchOn,
                detail(&[
                    ("reason", json!(format!("RUNTIME_FLAG:{}", risk.kill_switch_flag_name))),
                    ("scope", json!("account")),
                ]),
            )));
        }
    }
    Ok(GateDecision::Pass)
}

/// Gate 3: plan expiry.
#[must_use]
pub fn expiry_gate(plan: &TradePlan, now_ms: i64) -> GateDecision {
    match plan.expires_at_ms {
        Some(expires) if expires > 0 && now_ms > expires => {
            GateDecision::Reject(Rejection::new(
                RiskEventType::SignalExpired,
                detail(&[
                    ("expires_at_ms", json!(expires)),
                    ("now_ms", json!(now_ms)),
                ]),
            ))
        }
        _ => GateDecision::Pass,
    }
}

/// Gate 4: daily drawdown circuit / latched kill switch for today.
pub fn risk_circuit_gate(
    store: &Store,
    risk: &RiskSettings,
    mode: &str,
) -> StoreResult<GateDecision> {
    if !risk.risk_circuit_enabled {
        return Ok(GateDecision::Pass);
    }
    let state = store.get_or_init_risk_state(&utc_trade_date(), mode)?;
    if state.blocks_entries() {
        return Ok(GateDecision::Reject(Rejection::new(
            RiskEventType::RiskCircuitHalt,
            detail(&[
                ("soft_halt", json!(state.soft_halt)),
                ("hard_halt", json!(state.hard_halt)),
                ("kill_switch", json!(state.kill_switch)),
                ("drawdown_pct", json!(state.drawdown_pct.to_string())),
            ]),
        )));
    }
    Ok(GateDecision::Pass)
}

/// Gate 5: post-stop-out cooldown for (symbol, side, timeframe).
pub fn cooldown_gate(
    store: &Store,
    gates: &GateSettings,
    plan: &TradePlan,
    now_ms: i64,
) -> StoreResult<GateDecision> {
    if !gates.cooldown_enabled {
        return Ok(GateDecision::Pass);
    }
    let active = store.active_cooldown(&plan.symbol, plan.side, plan.timeframe, now_ms)?;
    match active {
        Some(cooldown) => Ok(GateDecision::Reject(Rejection::new(
            RiskEventType::CooldownBlocked,
            detail(&[
                ("reason", json!(cooldown.reason)),
                ("until_ts_ms", json!(cooldown.until_ts_ms)),
                ("timeframe", json!(plan.timeframe.as_str())),
            ]),
        ))),
        None => Ok(GateDecision::Pass),
    }
}

/// Gate 6: concurrent open-position cap.
pub fn max_positions_gate(store: &Store, gates: &GateSettings) -> StoreResult<GateDecision> {
    if gates.max_open_positions == 0 {
        return Ok(GateDecision::Pass);
    }
    let open = store.count_open_positions()?;
    if open >= gates.max_open_positions {
        return Ok(GateDecision::Reject(Rejection::new(
            RiskEventType::MaxPositionsBlocked,
            detail(&[
                ("max", json!(gates.max_open_positions)),
                ("current", json!(open)),
            ]),
        )));
    }
    Ok(GateDecision::Pass)
}

/// Gate 7: same-symbol-side mutex with timeframe priority (1d > 4h > 1h).
pub fn mutex_gate(
    store: &Store,
    gates: &GateSettings,
    plan: &TradePlan,
) -> StoreResult<GateDecision> {
    let Some(existing) = store.find_open_same_direction(&plan.symbol, plan.side)? else {
        return Ok(GateDecision::Pass);
    };
    let incoming = plan.timeframe.priority();
    let current = existing.timeframe.priority();
    if incoming <= current {
        return Ok(GateDecision::Reject(Rejection::new(
            RiskEventType::PositionMutexBlocked,
            detail(&[
                ("reason", json!("same_symbol_same_side_position_open")),
                ("incoming_timeframe", json!(plan.timeframe.as_str())),
                ("existing_timeframe", json!(existing.timeframe.as_str())),
                (
                    "existing_idempotency_key",
                    json!(existing.idempotency_key),
                ),
            ]),
        )));
    }
    match gates.mutex_upgrade_action {
        MutexUpgradeAction::CloseLowerAndOpen => Ok(GateDecision::Upgrade(Box::new(existing))),
        MutexUpgradeAction::Block => Ok(GateDecision::Reject(Rejection::new(
            RiskEventType::PositionMutexBlocked,
            detail(&[
                ("reason", json!("upgrade_disabled")),
                ("incoming_timeframe", json!(plan.timeframe.as_str())),
                ("existing_timeframe", json!(existing.timeframe.as_str())),
            ]),
        ))),
    }
}
