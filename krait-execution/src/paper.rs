//! OHLC-path fill simulation for paper/backtest mode.
//!
//! The ambiguity of "did the stop or the target fill first inside this bar"
//! is resolved by a deterministic intra-bar path: `open → high → low → close`
//! for an up bar, `open → low → high → close` otherwise. Levels are filled in
//! the order the path crosses them; a stop fill ends the position.

use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use krait_core::events::{BarClose, ExecutionReport, ReportStatus};
use krait_core::ids::{derived_id, utc_trade_date};
use krait_core::{
    ExitLeg, ExitLegKind, ExitReason, Fill, Order, OrderStatus, Position, Price, Quantity, Side,
};

use crate::executor::decimal_f64;
use crate::sizing::dec;
use crate::Services;

/// Level kinds a bar segment can cross.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    StopLoss,
    Tp1,
    Tp2,
}

/// Deterministic intra-bar price path.
#[must_use]
pub fn bar_path(open: Price, high: Price, low: Price, close: Price) -> [Price; 4] {
    if close >= open {
        [open, high, low, close]
    } else {
        [open, low, high, close]
    }
}

/// Levels inside the segment [a, b], ordered along the direction of travel.
#[must_use]
pub fn segment_levels_in_order(
    a: Price,
    b: Price,
    levels: &[(Level, Price)],
) -> Vec<(Level, Price)> {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hits: Vec<(Level, Price)> = levels
        .iter()
        .copied()
        .filter(|(_, price)| *price >= lo && *price <= hi)
        .collect();
    if b >= a {
        hits.sort_by(|x, y| x.1.cmp(&y.1));
    } else {
        hits.sort_by(|x, y| y.1.cmp(&x.1));
    }
    hits
}

/// Realized PnL in USDT over exit legs for a linear contract.
#[must_use]
pub fn realized_pnl_usdt(side: Side, entry: Price, legs: &[ExitLeg]) -> Decimal {
    let mut pnl = Decimal::ZERO;
    for leg in legs {
        match side {
            Side::Buy => pnl += (leg.price - entry) * leg.qty,
            Side::Sell => pnl += (entry - leg.price) * leg.qty,
        }
    }
    pnl
}

/// Quantity-weighted average exit price over the legs.
#[must_use]
pub fn weighted_avg_exit(legs: &[ExitLeg]) -> Option<Price> {
    let mut value = Decimal::ZERO;
    let mut qty = Decimal::ZERO;
    for leg in legs {
        if leg.qty <= Decimal::ZERO {
            continue;
        }
        value += leg.qty * leg.price;
        qty += leg.qty;
    }
    if qty <= Decimal::ZERO {
        None
    } else {
        Some(value / qty)
    }
}

/// PnL expressed in R multiples against the primary stop.
#[must_use]
pub fn pnl_r(side: Side, entry: Price, stop: Price, exit: Price) -> Decimal {
    let r = (entry - stop).abs();
    if r <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    match side {
        Side::Buy => (exit - entry) / r,
        Side::Sell => (entry - exit) / r,
    }
}

pub struct PaperMatcher {
    services: Services,
}

struct MatchState {
    qty_open: Quantity,
    /// Stop in effect for this whole bar (bar-open view of the meta flags).
    eff_sl: Price,
    /// True while no TP had filled as of bar open: the stop is the primary.
    stop_is_primary: bool,
    tp1_filled: bool,
    tp2_filled: bool,
    exit_reason: Option<ExitReason>,
    legs: Vec<ExitLeg>,
}

impl PaperMatcher {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Simulate fills for every open position on this bar's symbol/timeframe.
    pub async fn on_bar_close(&self, bar: &BarClose) -> Result<()> {
        if !self.services.config.execution_mode.is_simulated() {
            return Ok(());
        }
        let positions = self.services.store.list_open_positions()?;
        for candidate in positions {
            if candidate.symbol != bar.symbol || candidate.timeframe != bar.timeframe {
                continue;
            }
            let lock = self
                .services
                .position_locks
                .for_key(&candidate.idempotency_key);
            let _guard = lock.lock().await;
            let Some(position) = self
                .services
                .store
                .get_position_by_idem(&candidate.idempotency_key)?
            else {
                continue;
            };
            if position.status != krait_core::PositionStatus::Open {
                continue;
            }
            self.match_position(position, bar).await?;
        }
        Ok(())
    }

    async fn match_position(&self, position: Position, bar: &BarClose) -> Result<()> {
        let mut meta = position.meta.clone();
        meta.last_price = Some(dec(bar.ohlcv.close));
        meta.last_close_time_ms = Some(bar.close_time_ms);
        if meta.run_id.is_none() {
            meta.run_id = bar.run_id();
        }

        let qty_open = meta.qty_open.unwrap_or(position.qty_total);
        if qty_open <= Decimal::ZERO {
            // OPEN row with nothing left to unwind: converge to CLOSED.
            warn!(
                idempotency_key = %position.idempotency_key,
                "open position with zero remaining qty; closing defensively"
            );
            meta.qty_open = Some(Decimal::ZERO);
            self.services.store.mark_position_closed(
                &position.position_id,
                bar.close_time_ms,
                ExitReason::ForcedExit,
                &meta,
            )?;
            return Ok(());
        }

        let tp1 = self
            .services
            .store
            .get_order(&position.idempotency_key, krait_core::OrderPurpose::Tp1)?;
        let tp2 = self
            .services
            .store
            .get_order(&position.idempotency_key, krait_core::OrderPurpose::Tp2)?;

        let mut state = MatchState {
            qty_open,
            eff_sl: meta.effective_stop(
                position.entry_price,
                position.primary_sl_price,
                position.runner_stop_price,
            ),
            stop_is_primary: !meta.tp1_filled && !meta.tp2_filled,
            tp1_filled: meta.tp1_filled,
            tp2_filled: meta.tp2_filled,
            exit_reason: None,
            legs: meta.legs.clone(),
        };

        let path = bar_path(
            dec(bar.ohlcv.open),
            dec(bar.ohlcv.high),
            dec(bar.ohlcv.low),
            dec(bar.ohlcv.close),
        );

        'segments: for window in path.windows(2) {
            let (a, b) = (window[0], window[1]);
            let mut levels: Vec<(Level, Price)> = vec![(Level::StopLoss, state.eff_sl)];
            if let Some(order) = tp1.as_ref().filter(|_| !state.tp1_filled) {
                if let Some(price) = order.price {
                    levels.push((Level::Tp1, price));
                }
            }
            if let Some(order) = tp2.as_ref().filter(|_| !state.tp2_filled) {
                if let Some(price) = order.price {
                    levels.push((Level::Tp2, price));
                }
            }
            for (level, price) in segment_levels_in_order(a, b, &levels) {
                if state.qty_open <= Decimal::ZERO {
                    break 'segments;
                }
                match level {
                    Level::StopLoss => {
                        self.fill_stop(&position, &mut state, price, bar).await?;
                        break 'segments;
                    }
                    Level::Tp1 => {
                        if let Some(order) = tp1.as_ref() {
                            self.fill_tp(&position, &mut state, order, price, bar)
                                .await?;
                        }
                    }
                    Level::Tp2 => {
                        if let Some(order) = tp2.as_ref() {
                            self.fill_tp(&position, &mut state, order, price, bar)
                                .await?;
                        }
                    }
                }
            }
        }

        meta.qty_open = Some(state.qty_open.max(Decimal::ZERO));
        meta.tp1_filled = state.tp1_filled;
        meta.tp2_filled = state.tp2_filled;
        meta.legs = state.legs.clone();

        if state.qty_open <= Decimal::ZERO {
            let reason = state.exit_reason.unwrap_or(ExitReason::ForcedExit);
            self.close_out(&position, &mut meta, reason, bar).await?;
        } else {
            self.services
                .store
                .update_position_meta(&position.position_id, &meta)?;
        }
        Ok(())
    }

    async fn fill_tp(
        &self,
        position: &Position,
        state: &mut MatchState,
        order: &Order,
        price: Price,
        bar: &BarClose,
    ) -> Result<()> {
        let planned = order
            .payload
            .get("tp_qty")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .unwrap_or(order.qty);
        let qty = planned.min(state.qty_open);
        if qty <= Decimal::ZERO {
            return Ok(());
        }

        let mut filled = order.clone();
        filled.status = OrderStatus::Filled;
        filled.filled_qty = qty;
        filled.avg_price = Some(price);
        filled.last_fill_at_ms = Some(bar.close_time_ms);
        filled.payload["fill_price"] = json!(price.normalize().to_string());
        filled.payload["fill_time_ms"] = json!(bar.close_time_ms);
        self.services.store.upsert_order(&filled)?;

        let fill = Fill {
            fill_id: derived_id(
                "fill",
                &format!("{}:{}", order.order_id, bar.close_time_ms),
            ),
            order_id: order.order_id.clone(),
            symbol: position.symbol.clone(),
            purpose: order.purpose,
            side: order.side,
            exec_qty: qty,
            exec_price: price,
            fee: None,
            exec_time_ms: bar.close_time_ms,
        };
        self.services.store.insert_fill(&fill)?;

        state.qty_open -= qty;
        state.legs.push(ExitLeg {
            kind: match order.purpose {
                krait_core::OrderPurpose::Tp2 => ExitLegKind::Tp2,
                _ => ExitLegKind::Tp1,
            },
            qty,
            price,
            time_ms: bar.close_time_ms,
        });

        // The stop in effect for the rest of this bar stays the bar-open
        // stop; break-even / runner stops take over from the next bar on.
        match order.purpose {
            krait_core::OrderPurpose::Tp1 => state.tp1_filled = true,
            krait_core::OrderPurpose::Tp2 => state.tp2_filled = true,
            _ => {}
        }

        let mut report = ExecutionReport::new(
            &position.idempotency_key,
            &position.symbol,
            ReportStatus::TpHit,
        );
        report.order_id = Some(order.order_id.clone());
        report.timeframe = Some(position.timeframe);
        report.filled_qty = Some(decimal_f64(qty));
        report.avg_price = Some(decimal_f64(price));
        report
            .detail
            .insert("purpose".into(), json!(order.purpose.as_str()));
        report
            .detail
            .insert("entry_price".into(), json!(position.entry_price.to_string()));
        if let Some(run_id) = &position.meta.run_id {
            report.ext.insert("run_id".into(), json!(run_id));
        }
        self.services.publisher.execution_report(&report).await?;

        debug!(
            idempotency_key = %position.idempotency_key,
            purpose = order.purpose.as_str(),
            qty = %qty,
            price = %price,
            "paper tp fill"
        );
        Ok(())
    }

    async fn fill_stop(
        &self,
        position: &Position,
        state: &mut MatchState,
        price: Price,
        bar: &BarClose,
    ) -> Result<()> {
        // Which stop fired decides the reason: the primary stop (no TP had
        // filled when the bar opened) is a primary stop-out, a break-even or
        // runner stop is not.
        let reason = if state.stop_is_primary {
            ExitReason::PrimarySlHit
        } else {
            ExitReason::SecondarySlExit
        };
        state.legs.push(ExitLeg {
            kind: ExitLegKind::Sl,
            qty: state.qty_open,
            price,
            time_ms: bar.close_time_ms,
        });
        state.exit_reason = Some(reason);
        state.qty_open = Decimal::ZERO;

        if reason.starts_cooldown() {
            self.write_cooldown(position, bar).await?;
        }
        Ok(())
    }

    async fn write_cooldown(&self, position: &Position, bar: &BarClose) -> Result<()> {
        let gates = &self.services.config.gates;
        if !gates.cooldown_enabled {
            return Ok(());
        }
        let bars = gates.cooldown_bars(position.timeframe);
        if bars == 0 {
            return Ok(());
        }
        let until = bar.close_time_ms + i64::from(bars) * position.timeframe.duration_ms();
        let cooldown = krait_core::Cooldown {
            cooldown_id: derived_id(
                "cd",
                &format!("{}:{}", position.idempotency_key, bar.close_time_ms),
            ),
            symbol: position.symbol.clone(),
            side: position.side,
            timeframe: position.timeframe,
            reason: ExitReason::PrimarySlHit.as_str().to_string(),
            until_ts_ms: until,
        };
        self.services.store.insert_cooldown(&cooldown)?;
        Ok(())
    }

    async fn close_out(
        &self,
        position: &Position,
        meta: &mut krait_core::PositionMeta,
        reason: ExitReason,
        bar: &BarClose,
    ) -> Result<()> {
        let exit_avg =
            weighted_avg_exit(&meta.legs).unwrap_or_else(|| dec(bar.ohlcv.close));
        meta.close_price = Some(
            meta.legs
                .last()
                .map(|leg| leg.price)
                .unwrap_or_else(|| dec(bar.ohlcv.close)),
        );
        let pnl = realized_pnl_usdt(position.side, position.entry_price, &meta.legs);
        let r_multiple = pnl_r(
            position.side,
            position.entry_price,
            position.primary_sl_price,
            exit_avg,
        );
        let loss_count = self.services.store.update_consecutive_loss_count(
            &utc_trade_date(),
            &self.services.config.execution_mode.to_string(),
            pnl,
        )?;

        self.services.store.mark_position_closed(
            &position.position_id,
            bar.close_time_ms,
            reason,
            meta,
        )?;

        let status = match reason {
            ExitReason::PrimarySlHit => ReportStatus::PrimarySlHit,
            ExitReason::SecondarySlExit => ReportStatus::SecondarySlExit,
            _ => ReportStatus::PositionClosed,
        };
        let mut stop_report = ExecutionReport::new(
            &position.idempotency_key,
            &position.symbol,
            status,
        )
        .with_reason(reason.as_str());
        stop_report.timeframe = Some(position.timeframe);
        stop_report.filled_qty = meta
            .legs
            .last()
            .map(|leg| decimal_f64(leg.qty));
        stop_report.avg_price = meta.legs.last().map(|leg| decimal_f64(leg.price));
        if let Some(run_id) = &meta.run_id {
            stop_report.ext.insert("run_id".into(), json!(run_id));
        }
        self.services.publisher.execution_report(&stop_report).await?;

        let closed_qty: Decimal = meta.legs.iter().map(|leg| leg.qty).sum();
        let mut report = ExecutionReport::new(
            &position.idempotency_key,
            &position.symbol,
            ReportStatus::PositionClosed,
        )
        .with_reason(reason.as_str());
        report.timeframe = Some(position.timeframe);
        report.filled_qty = Some(decimal_f64(closed_qty));
        report.avg_price = Some(decimal_f64(exit_avg));
        report
            .detail
            .insert("entry_price".into(), json!(position.entry_price.to_string()));
        report
            .detail
            .insert("pnl_r".into(), json!(decimal_f64(r_multiple)));
        report.ext.insert("pnl_usdt".into(), json!(decimal_f64(pnl)));
        report
            .ext
            .insert("exit_avg_price".into(), json!(decimal_f64(exit_avg)));
        report
            .ext
            .insert("consecutive_loss_count".into(), json!(loss_count));
        if let Some(run_id) = &meta.run_id {
            report.ext.insert("run_id".into(), json!(run_id));
        }
        self.services.publisher.execution_report(&report).await?;

        info!(
            idempotency_key = %position.idempotency_key,
            reason = reason.as_str(),
            pnl = %pnl,
            "paper position closed"
        );
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
    fn up_bar_walks_open_high_low_close() {
        let path = bar_path(d("10"), d("12"), d("9"), d("11"));
        assert_eq!(path, [d("10"), d("12"), d("9"), d("11")]);
    }

    #[test]
    fn down_bar_walks_open_low_high_close() {
        let path = bar_path(d("10"), d("12"), d("9"), d("9.5"));
        assert_eq!(path, [d("10"), d("9"), d("12"), d("9.5")]);
    }

    #[test]
    fn rising_segment_orders_levels_ascending() {
        let levels = [
            (Level::Tp2, d("32000")),
            (Level::Tp1, d("31000")),
            (Level::StopLoss, d("29000")),
        ];
        let hits = segment_levels_in_order(d("30000"), d("32500"), &levels);
        assert_eq!(hits, vec![(Level::Tp1, d("31000")), (Level::Tp2, d("32000"))]);
    }

    #[test]
    fn falling_segment_orders_levels_descending() {
        let levels = [
            (Level::Tp1, d("31000")),
            (Level::StopLoss, d("29000")),
        ];
        let hits = segment_levels_in_order(d("30100"), d("28900"), &levels);
        assert_eq!(
            hits,
            vec![(Level::StopLoss, d("29000"))],
            "only the stop lies inside the segment"
        );
    }

    #[test]
    fn boundary_prices_count_as_crossed() {
        let levels = [(Level::Tp1, d("31000"))];
        let hits = segment_levels_in_order(d("30000"), d("31000"), &levels);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn pnl_accumulates_over_legs() {
        let legs = vec![
            ExitLeg {
                kind: ExitLegKind::Tp1,
                qty: d("0.02"),
                price: d("31000"),
                time_ms: 1,
            },
            ExitLeg {
                kind: ExitLegKind::Sl,
                qty: d("0.03"),
                price: d("30000"),
                time_ms: 2,
            },
        ];
        let pnl = realized_pnl_usdt(Side::Buy, d("30000"), &legs);
        assert_eq!(pnl, d("20"));
        let short_pnl = realized_pnl_usdt(Side::Sell, d("30000"), &legs);
        assert_eq!(short_pnl, d("-20"));
    }

    #[test]
    fn weighted_exit_average() {
        let legs = vec![
            ExitLeg {
                kind: ExitLegKind::Tp1,
                qty: d("0.02"),
                price: d("31000"),
                time_ms: 1,
            },
            ExitLeg {
                kind: ExitLegKind::Tp2,
                qty: d("0.02"),
                price: d("32000"),
                time_ms: 2,
            },
        ];
        assert_eq!(weighted_avg_exit(&legs), Some(d("31500")));
        assert_eq!(weighted_avg_exit(&[]), None);
    }

    #[test]
    fn r_multiple_is_directional() {
        assert_eq!(pnl_r(Side::Buy, d("30000"), d("29000"), d("32000")), d("2"));
        assert_eq!(pnl_r(Side::Buy, d("30000"), d("29000"), d("29000")), d("-1"));
        assert_eq!(pnl_r(Side::Sell, d("30000"), d("31000"), d("28000")), d("2"));
    }
}
