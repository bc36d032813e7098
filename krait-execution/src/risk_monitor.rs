//! Daily equity tracking and the drawdown circuit.
//!
//! Each tick refreshes the day's risk row from the wallet. Soft halt stops
//! new entries; hard halt additionally force-closes every OPEN position
//! reduce-only and latches the kill switch. Halts latch for the rest of the
//! trade date. Closing-only operations always remain allowed.

use std::sync::Arc;

use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{error, info, warn};

use krait_core::events::{RiskEventType, Severity};
use krait_core::ids::utc_trade_date;
use krait_core::{ExecutionMode, ExitReason};

use crate::executor::TradePlanExecutor;
use crate::publisher::risk_event;
use crate::sizing::dec;
use crate::Services;

pub struct RiskMonitor {
    services: Services,
    executor: Arc<TradePlanExecutor>,
}

/// Drawdown decision for one equity observation, in percent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CircuitDecision {
    pub drawdown_pct: Decimal,
    pub soft_halt: bool,
    pub hard_halt: bool,
}

/// Evaluate drawdown off the equity high-water mark.
#[must_use]
pub fn eval_drawdown(
    max_equity: Decimal,
    current_equity: Decimal,
    soft_pct: Decimal,
    hard_pct: Decimal,
) -> CircuitDecision {
    let drawdown_pct = if max_equity > Decimal::ZERO {
        (max_equity - current_equity) / max_equity * Decimal::ONE_HUNDRED
    } else {
        Decimal::ZERO
    };
    CircuitDecision {
        drawdown_pct,
        soft_halt: drawdown_pct >= soft_pct,
        hard_halt: drawdown_pct >= hard_pct,
    }
}

impl RiskMonitor {
    pub fn new(services: Services, executor: Arc<TradePlanExecutor>) -> Self {
        Self { services, executor }
    }

    pub async fn run_once(&self) -> Result<()> {
        let config = &self.services.config;
        if config.execution_mode != ExecutionMode::Live || !config.risk.risk_circuit_enabled {
            return Ok(());
        }

        let read = self.services.venue.wallet_equity_degradable().await?;
        if read.degraded {
            let mut event = risk_event(
                RiskEventType::RateLimit,
                Severity::Important,
                None,
                [
                    ("context".to_string(), json!("risk_monitor.wallet_balance")),
                    ("degraded".to_string(), json!(true)),
                    ("stale_ms".to_string(), json!(read.stale_ms)),
                ]
                .into_iter()
                .collect(),
            );
            event.retry_after_ms = Some(read.predicted_wait_ms as i64);
            self.services.publisher.risk_event(&event).await?;
        }
        let Some(equity) = read.value.equity() else {
            warn!("wallet balance returned no equity figure");
            return Ok(());
        };
        let equity = dec(equity);

        let trade_date = utc_trade_date();
        let mode = config.execution_mode.to_string();
        let mut state = self
            .services
            .store
            .get_or_init_risk_state(&trade_date, &mode)?;

        let starting = state.starting_equity.unwrap_or(equity);
        let min_equity = state.min_equity.unwrap_or(equity).min(equity);
        let max_equity = state.max_equity.unwrap_or(equity).max(equity);

        let decision = eval_drawdown(
            max_equity,
            equity,
            dec(config.risk.daily_drawdown_soft_pct),
            dec(config.risk.daily_drawdown_hard_pct),
        );

        let soft_transition = decision.soft_halt && !state.soft_halt;
        let hard_transition = decision.hard_halt && !state.hard_halt;

        // Daily loss limit measured from the day's starting equity.
        let loss_limit_breached = starting > Decimal::ZERO
            && (starting - equity) / starting * Decimal::ONE_HUNDRED
                >= dec(config.risk.daily_loss_limit_pct);

        state.starting_equity = Some(starting);
        state.current_equity = Some(equity);
        state.min_equity = Some(min_equity);
        state.max_equity = Some(max_equity);
        state.drawdown_pct = decision.drawdown_pct;
        state.soft_halt = state.soft_halt || decision.soft_halt;
        state.hard_halt = state.hard_halt || decision.hard_halt;
        state.kill_switch = state.kill_switch || state.hard_halt || loss_limit_breached;
        self.services.store.update_risk_state(&state)?;

        if soft_transition {
            self.services
                .publisher
                .risk_event(&risk_event(
                    RiskEventType::KillSwitchOn,
                    Severity::Important,
                    None,
                    [
                        ("scope".to_string(), json!("soft_halt")),
                        (
                            "drawdown_pct".to_string(),
                            json!(decision.drawdown_pct.to_string()),
                        ),
                    ]
                    .into_iter()
                    .collect(),
                ))
                .await?;
            info!(drawdown_pct = %decision.drawdown_pct, "soft halt engaged");
        }

        if hard_transition {
            self.services
                .publisher
                .risk_event(&risk_event(
                    RiskEventType::KillSwitchOn,
                    Severity::Emergency,
                    None,
                    [
                        ("scope".to_string(), json!("hard_halt")),
                        (
                            "drawdown_pct".to_string(),
                            json!(decision.drawdown_pct.to_string()),
                        ),
                    ]
                    .into_iter()
                    .collect(),
                ))
                .await?;
            warn!(drawdown_pct = %decision.drawdown_pct, "hard halt engaged; flattening book");
            for position in self.services.store.list_open_positions()? {
                if let Err(err) = self
                    .executor
                    .close_position_market(
                        &position.idempotency_key,
                        None,
                        None,
                        ExitReason::RiskCircuit,
                    )
                    .await
                {
                    error!(
                        error = %err,
                        idempotency_key = %position.idempotency_key,
                        "hard halt close failed"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn drawdown_is_measured_from_high_water_mark() {
        let decision = eval_drawdown(d("10000"), d("9700"), d("3"), d("5"));
        assert_eq!(decision.drawdown_pct, d("3"));
        assert!(decision.soft_halt);
        assert!(!decision.hard_halt);
    }

    #[test]
    fn hard_halt_implies_soft() {
        let decision = eval_drawdown(d("10000"), d("9400"), d("3"), d("5"));
        assert!(decision.soft_halt);
        assert!(decision.hard_halt);
        assert_eq!(decision.drawdown_pct, d("6"));
    }

    #[test]
    fn no_drawdown_no_halt() {
        let decision = eval_drawdown(d("10000"), d("10100"), d("3"), d("5"));
        assert!(!decision.soft_halt);
        assert!(!decision.hard_halt);
        assert!(decision.drawdown_pct < Decimal::ZERO);
    }

    #[test]
    fn zero_equity_history_is_safe() {
        let decision = eval_drawdown(Decimal::ZERO, Decimal::ZERO, d("3"), d("5"));
        assert_eq!(decision.drawdown_pct, Decimal::ZERO);
        assert!(!decision.soft_halt);
    }
}
