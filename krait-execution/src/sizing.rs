//! Position sizing and exit-price arithmetic.
//!
//! `qty = equity × risk_pct / |entry − stop|`, then the isolated-margin
//! notional is clamped into the configured order-value band (re-deriving qty
//! at the clamp), and the result is floored to the venue lot step. TP prices
//! sit at entry ± 1R / 2R rounded to the tick; the split is 40/40/20.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use krait_config::SizingSettings;
use krait_core::{Price, Quantity, Side};
use krait_exchange::InstrumentFilters;

/// Decimal view of the venue lot/price filters.
#[derive(Clone, Copy, Debug)]
pub struct Filters {
    pub qty_step: Decimal,
    pub min_qty: Decimal,
    pub tick_size: Decimal,
}

impl From<InstrumentFilters> for Filters {
    fn from(raw: InstrumentFilters) -> Self {
        Self {
            qty_step: dec(raw.qty_step),
            min_qty: dec(raw.min_qty),
            tick_size: dec(raw.tick_size),
        }
    }
}

impl Default for Filters {
    fn default() -> Self {
        InstrumentFilters::default().into()
    }
}

/// Convert a wire float into a Decimal, zero on non-finite input.
#[must_use]
pub fn dec(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

#[must_use]
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

#[must_use]
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).round() * tick
}

/// Sized quantity for a plan, or zero when the plan cannot meet the venue
/// minimums (caller rejects with `ORDER_VALUE_TOO_SMALL`).
#[must_use]
pub fn calc_qty(
    equity: Decimal,
    risk_pct: Decimal,
    entry: Price,
    stop: Price,
    sizing: &SizingSettings,
    filters: &Filters,
) -> Quantity {
    let unit_risk = (entry - stop).abs();
    if unit_risk <= Decimal::ZERO || entry <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let risk_amount = equity * risk_pct;
    let mut qty = risk_amount / unit_risk;

    // Clamp margin consumption into the configured order-value band. Cross
    // mode consumes the same notional/leverage margin for this purpose.
    let leverage = dec(sizing.leverage).max(Decimal::ONE);
    let margin_divisor = leverage;
    let min_value = dec(sizing.min_order_value_usdt);
    let max_value = dec(sizing.max_order_value_usdt);
    let margin = qty * entry / margin_divisor;
    if max_value > Decimal::ZERO && margin > max_value {
        qty = max_value * margin_divisor / entry;
    } else if min_value > Decimal::ZERO && margin < min_value {
        qty = min_value * margin_divisor / entry;
    }

    let qty = floor_to_step(qty, filters.qty_step);
    if qty < filters.min_qty {
        return Decimal::ZERO;
    }
    qty
}

/// 40% / 40% / 20% split; the runner keeps the rounding remainder.
#[must_use]
pub fn split_tp_qty(total: Quantity, step: Decimal) -> (Quantity, Quantity, Quantity) {
    let forty = Decimal::new(4, 1);
    let tp1 = floor_to_step(total * forty, step);
    let tp2 = floor_to_step(total * forty, step);
    let runner = total - tp1 - tp2;
    (tp1, tp2, runner)
}

/// TP1/TP2 at entry ± 1R/2R, aligned to the tick.
#[must_use]
pub fn tp_prices(side: Side, entry: Price, stop: Price, tick: Decimal) -> (Price, Price) {
    let r = (entry - stop).abs();
    let (p1, p2) = match side {
        Side::Buy => (entry + r, entry + r * Decimal::TWO),
        Side::Sell => (entry - r, entry - r * Decimal::TWO),
    };
    (round_to_tick(p1, tick), round_to_tick(p2, tick))
}

/// Reprice an entry limit toward the market: BUY up, SELL down, scaled by the
/// 1-based attempt number.
#[must_use]
pub fn reprice_toward_market(base: Price, side: Side, bps: u32, attempt: u32) -> Price {
    let factor = Decimal::ONE
        + Decimal::from(bps) / Decimal::from(10_000) * Decimal::from(attempt.max(1));
    match side {
        Side::Buy => base * factor,
        Side::Sell => base / factor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krait_config::MarginMode;
    use std::str::FromStr;

    fn filters() -> Filters {
        Filters {
            qty_step: Decimal::from_str("0.001").unwrap(),
            min_qty: Decimal::from_str("0.001").unwrap(),
            tick_size: Decimal::from_str("0.5").unwrap(),
        }
    }

    fn sizing() -> SizingSettings {
        SizingSettings {
            risk_pct: 0.005,
            leverage: 3.0,
            margin_mode: MarginMode::Isolated,
            min_order_value_usdt: 10.0,
            max_order_value_usdt: 1_000_000.0,
            paper_equity_usdt: 10_000.0,
        }
    }

    #[test]
    fn spec_scenario_sizing() {
        // equity=10000, risk=0.5%, entry=30000, stop=29000 -> qty = 50/1000 = 0.05
        let qty = calc_qty(
            Decimal::from(10_000),
            Decimal::from_str("0.005").unwrap(),
            Decimal::from(30_000),
            Decimal::from(29_000),
            &sizing(),
            &filters(),
        );
        assert_eq!(qty, Decimal::from_str("0.05").unwrap());
    }

    #[test]
    fn zero_unit_risk_yields_zero_qty() {
        let qty = calc_qty(
            Decimal::from(10_000),
            Decimal::from_str("0.005").unwrap(),
            Decimal::from(30_000),
            Decimal::from(30_000),
            &sizing(),
            &filters(),
        );
        assert_eq!(qty, Decimal::ZERO);
    }

    #[test]
    fn margin_above_band_is_clamped_and_requantized() {
        let mut cfg = sizing();
        cfg.max_order_value_usdt = 100.0; // margin cap 100 USDT at 3x
        let qty = calc_qty(
            Decimal::from(1_000_000),
            Decimal::from_str("0.005").unwrap(),
            Decimal::from(30_000),
            Decimal::from(29_000),
            &cfg,
            &filters(),
        );
        // qty = 100 * 3 / 30000 = 0.01
        assert_eq!(qty, Decimal::from_str("0.01").unwrap());
    }

    #[test]
    fn dust_qty_rejects_as_zero() {
        let mut cfg = sizing();
        cfg.min_order_value_usdt = 0.0;
        let qty = calc_qty(
            Decimal::from(10),
            Decimal::from_str("0.0001").unwrap(),
            Decimal::from(30_000),
            Decimal::from(29_000),
            &cfg,
            &filters(),
        );
        assert_eq!(qty, Decimal::ZERO);
    }

    #[test]
    fn split_keeps_runner_remainder() {
        let step = Decimal::from_str("0.001").unwrap();
        let (tp1, tp2, runner) = split_tp_qty(Decimal::from_str("0.05").unwrap(), step);
        assert_eq!(tp1, Decimal::from_str("0.02").unwrap());
        assert_eq!(tp2, Decimal::from_str("0.02").unwrap());
        assert_eq!(runner, Decimal::from_str("0.01").unwrap());
        assert_eq!(tp1 + tp2 + runner, Decimal::from_str("0.05").unwrap());
    }

    #[test]
    fn tp_prices_mirror_by_side() {
        let tick = Decimal::from_str("0.5").unwrap();
        let entry = Decimal::from(30_000);
        let stop = Decimal::from(29_000);
        let (long1, long2) = tp_prices(Side::Buy, entry, stop, tick);
        assert_eq!(long1, Decimal::from(31_000));
        assert_eq!(long2, Decimal::from(32_000));
        let (short1, short2) = tp_prices(Side::Sell, entry, Decimal::from(31_000), tick);
        assert_eq!(short1, Decimal::from(29_000));
        assert_eq!(short2, Decimal::from(28_000));
    }

    #[test]
    fn reprice_moves_toward_market_by_attempt() {
        let base = Decimal::from(30_000);
        let up1 = reprice_toward_market(base, Side::Buy, 5, 1);
        assert_eq!(up1, Decimal::from_str("30015").unwrap());
        let up2 = reprice_toward_market(base, Side::Buy, 5, 2);
        assert_eq!(up2, Decimal::from_str("30030").unwrap());
        let down = reprice_toward_market(base, Side::Sell, 5, 1);
        assert!(down < base);
    }
}
