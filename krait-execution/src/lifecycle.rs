//! Bar-close entry point: dedup, bar history, secondary rule, runner
//! trailing, then paper matching.
//!
//! Effects are a function of current state, so a redelivered bar (tracked in
//! `bar_close_emits`) is acknowledged without side effects.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info};

use krait_core::events::{BarClose, Envelope, RiskEventType, Severity};
use krait_core::{ExitReason, Position};

use crate::executor::TradePlanExecutor;
use crate::paper::PaperMatcher;
use crate::publisher::risk_event;
use crate::sizing::dec;
use crate::trail::{self, BarHistory};
use crate::Services;

pub struct BarCloseHandler {
    services: Services,
    executor: Arc<TradePlanExecutor>,
    matcher: PaperMatcher,
    history: BarHistory,
}

impl BarCloseHandler {
    pub fn new(services: Services, executor: Arc<TradePlanExecutor>) -> Self {
        let matcher = PaperMatcher::new(services.clone());
        Self {
            services,
            executor,
            matcher,
            history: BarHistory::new(),
        }
    }

    /// Entry point for one `bar_close` envelope.
    pub async fn handle_envelope(&self, envelope: &Envelope) -> Result<()> {
        let bar: BarClose = envelope.decode().context("decode bar_close payload")?;
        if !bar.is_final {
            return Ok(());
        }
        let first_delivery = self.services.store.record_bar_emit(
            &bar.symbol,
            bar.timeframe.as_str(),
            bar.close_time_ms,
        )?;
        if !first_delivery {
            let event = risk_event(
                RiskEventType::BarDuplicate,
                Severity::Info,
                Some(&bar.symbol),
                [
                    ("timeframe".to_string(), json!(bar.timeframe.as_str())),
                    ("close_time_ms".to_string(), json!(bar.close_time_ms)),
                ]
                .into_iter()
                .collect(),
            );
            self.services.publisher.risk_event(&event).await?;
            debug!(symbol = %bar.symbol, close_time_ms = bar.close_time_ms, "duplicate bar ignored");
            return Ok(());
        }

        self.history.push(&bar);
        self.manage_open_positions(&bar).await?;
        self.matcher.on_bar_close(&bar).await
    }

    async fn manage_open_positions(&self, bar: &BarClose) -> Result<()> {
        let positions = self.services.store.list_open_positions()?;
        for position in positions {
            if position.symbol != bar.symbol || position.timeframe != bar.timeframe {
                continue;
            }
            self.apply_secondary_rule(&position, bar).await?;
            self.trail_runner_stop(&position, bar)?;
        }
        Ok(())
    }

    /// First bar after entry: the MACD histogram must keep moving in the
    /// position's favor, otherwise the position is force-closed at market.
    async fn apply_secondary_rule(&self, position: &Position, bar: &BarClose) -> Result<()> {
        let exits = &self.services.config.exits;
        if !exits.secondary_rule_enabled
            || position.secondary_rule_checked
            || bar.close_time_ms <= position.entry_close_time_ms
        {
            return Ok(());
        }
        let bars = self.history.bars(&position.symbol, position.timeframe);
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let hist_now = trail::macd_hist(&closes);

        let mut keep = true;
        if let (Some(entry_hist), Some(now_hist)) = (position.hist_entry, hist_now) {
            keep = match position.bias {
                krait_core::Bias::Long => now_hist > entry_hist,
                krait_core::Bias::Short => now_hist < entry_hist,
            };
        }
        // Mark before acting so the rule fires at most once per position.
        self.services
            .store
            .set_secondary_rule_checked(&position.position_id)?;

        if !keep {
            info!(
                idempotency_key = %position.idempotency_key,
                hist_entry = ?position.hist_entry,
                hist_now = ?hist_now,
                "secondary rule exit"
            );
            self.executor
                .close_position_market(
                    &position.idempotency_key,
                    Some(dec(bar.ohlcv.close)),
                    Some(bar.close_time_ms),
                    ExitReason::SecondaryRule,
                )
                .await?;
        }
        Ok(())
    }

    /// Tighten the runner stop; never loosen it.
    fn trail_runner_stop(&self, position: &Position, bar: &BarClose) -> Result<()> {
        if position.qty_runner <= rust_decimal::Decimal::ZERO {
            return Ok(());
        }
        let exits = &self.services.config.exits;
        let bars = self.history.bars(&position.symbol, position.timeframe);
        let Some(candidate) = trail::trail_candidate(
            exits.runner_trail_mode,
            position.bias,
            &bars,
            exits.runner_atr_period,
            exits.runner_atr_mult,
        ) else {
            return Ok(());
        };
        if trail::tightens(position.bias, position.runner_stop_price, candidate) {
            self.services
                .store
                .update_runner_stop(&position.position_id, candidate)?;
            debug!(
                idempotency_key = %position.idempotency_key,
                stop = %candidate,
                close_time_ms = bar.close_time_ms,
                "runner stop tightened"
            );
        }
        Ok(())
    }
}
