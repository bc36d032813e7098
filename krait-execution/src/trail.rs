//! Runner-stop trailing and the indicator helpers it needs.
//!
//! The runner (final 20%) trails by ATR (SMA of true range) or by the most
//! recent fractal pivot. Candidates only ever tighten the stop: higher for a
//! long, lower for a short. The MACD histogram feeds the secondary exit rule.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use rust_decimal::Decimal;

use krait_config::RunnerTrailMode;
use krait_core::events::BarClose;
use krait_core::{Bias, Symbol, Timeframe};

use crate::sizing::dec;

const HISTORY_CAP: usize = 400;
const PIVOT_WING: usize = 2;

/// One completed bar kept in the rolling in-process history.
#[derive(Clone, Copy, Debug)]
pub struct Bar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Rolling per-(symbol, timeframe) bar history fed by the bar_close stream.
#[derive(Default)]
pub struct BarHistory {
    series: Mutex<HashMap<(Symbol, Timeframe), VecDeque<Bar>>>,
}

impl BarHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, bar: &BarClose) {
        let mut series = self.series.lock().unwrap();
        let entry = series
            .entry((bar.symbol.clone(), bar.timeframe))
            .or_default();
        entry.push_back(Bar {
            open: bar.ohlcv.open,
            high: bar.ohlcv.high,
            low: bar.ohlcv.low,
            close: bar.ohlcv.close,
        });
        while entry.len() > HISTORY_CAP {
            entry.pop_front();
        }
    }

    #[must_use]
    pub fn bars(&self, symbol: &str, timeframe: Timeframe) -> Vec<Bar> {
        let series = self.series.lock().unwrap();
        series
            .get(&(symbol.to_string(), timeframe))
            .map(|bars| bars.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// ATR as an SMA over true range. Returns the latest value.
#[must_use]
pub fn atr_sma(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let start = bars.len() - period;
    let mut sum = 0.0;
    for i in start..bars.len() {
        let prev_close = bars[i - 1].close;
        let tr = (bars[i].high - bars[i].low)
            .max((bars[i].high - prev_close).abs())
            .max((bars[i].low - prev_close).abs());
        sum += tr;
    }
    Some(sum / period as f64)
}

/// Most recent fractal pivot low: a low strictly below its `PIVOT_WING`
/// neighbours on both sides.
#[must_use]
pub fn last_pivot_low(bars: &[Bar]) -> Option<f64> {
    last_pivot(bars, |candidate, neighbour| candidate < neighbour, |b| b.low)
}

/// Most recent fractal pivot high.
#[must_use]
pub fn last_pivot_high(bars: &[Bar]) -> Option<f64> {
    last_pivot(bars, |candidate, neighbour| candidate > neighbour, |b| b.high)
}

fn last_pivot(
    bars: &[Bar],
    wins: impl Fn(f64, f64) -> bool,
    pick: impl Fn(&Bar) -> f64,
) -> Option<f64> {
    if bars.len() < PIVOT_WING * 2 + 1 {
        return None;
    }
    for center in (PIVOT_WING..bars.len() - PIVOT_WING).rev() {
        let value = pick(&bars[center]);
        let is_pivot = (1..=PIVOT_WING).all(|offset| {
            wins(value, pick(&bars[center - offset])) && wins(value, pick(&bars[center + offset]))
        });
        if is_pivot {
            return Some(value);
        }
    }
    None
}

/// Latest MACD histogram value (12/26 EMA, 9 signal), `None` while the series
/// is too short to be meaningful.
#[must_use]
pub fn macd_hist(closes: &[f64]) -> Option<f64> {
    const FAST: usize = 12;
    const SLOW: usize = 26;
    const SIGNAL: usize = 9;
    if closes.len() < SLOW + SIGNAL {
        return None;
    }
    let ema = |period: usize| -> Vec<f64> {
        let alpha = 2.0 / (period as f64 + 1.0);
        let mut out = Vec::with_capacity(closes.len());
        let mut value = closes[0];
        for close in closes {
            value = alpha * close + (1.0 - alpha) * value;
            out.push(value);
        }
        out
    };
    let fast = ema(FAST);
    let slow = ema(SLOW);
    let macd: Vec<f64> = fast
        .iter()
        .zip(slow.iter())
        .map(|(f, s)| f - s)
        .collect();
    let alpha = 2.0 / (SIGNAL as f64 + 1.0);
    let mut signal = macd[0];
    for value in &macd {
        signal = alpha * value + (1.0 - alpha) * signal;
    }
    Some(macd.last()? - signal)
}

/// Candidate runner stop for the configured mode, before monotonicity.
#[must_use]
pub fn trail_candidate(
    mode: RunnerTrailMode,
    bias: Bias,
    bars: &[Bar],
    atr_period: usize,
    atr_mult: f64,
) -> Option<Decimal> {
    let close = bars.last()?.close;
    match mode {
        RunnerTrailMode::Atr => {
            let atr = atr_sma(bars, atr_period)? * atr_mult;
            let candidate = match bias {
                Bias::Long => close - atr,
                Bias::Short => close + atr,
            };
            Some(dec(candidate))
        }
        RunnerTrailMode::Pivot => {
            let candidate = match bias {
                Bias::Long => last_pivot_low(bars)?,
                Bias::Short => last_pivot_high(bars)?,
            };
            Some(dec(candidate))
        }
    }
}

/// True when `new` protects more of the position than `old`.
#[must_use]
pub fn tightens(bias: Bias, old: Option<Decimal>, new: Decimal) -> bool {
    match old {
        None => true,
        Some(old) => match bias {
            Bias::Long => new > old,
            Bias::Short => new < old,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_bars(count: usize, close: f64, range: f64) -> Vec<Bar> {
        (0..count)
            .map(|_| Bar {
                open: close,
                high: close + range / 2.0,
                low: close - range / 2.0,
                close,
            })
            .collect()
    }

    #[test]
    fn atr_of_constant_range_bars_is_the_range() {
        let bars = flat_bars(20, 100.0, 2.0);
        let atr = atr_sma(&bars, 14).unwrap();
        assert!((atr - 2.0).abs() < 1e-9);
        assert!(atr_sma(&bars[..10], 14).is_none());
    }

    #[test]
    fn pivot_low_finds_local_extreme() {
        let mut bars = flat_bars(10, 100.0, 2.0);
        bars[6].low = 95.0; // pivot low with two higher lows each side
        assert_eq!(last_pivot_low(&bars), Some(95.0));
        assert_eq!(last_pivot_high(&bars), None, "flat highs have no pivot");
    }

    #[test]
    fn atr_candidate_trails_below_close_for_longs() {
        let bars = flat_bars(30, 100.0, 2.0);
        let candidate =
            trail_candidate(RunnerTrailMode::Atr, Bias::Long, &bars, 14, 2.0).unwrap();
        assert_eq!(candidate, dec(96.0));
        let short =
            trail_candidate(RunnerTrailMode::Atr, Bias::Short, &bars, 14, 2.0).unwrap();
        assert_eq!(short, dec(104.0));
    }

    #[test]
    fn tightening_is_monotonic_per_bias() {
        assert!(tightens(Bias::Long, None, dec(95.0)));
        assert!(tightens(Bias::Long, Some(dec(95.0)), dec(96.0)));
        assert!(!tightens(Bias::Long, Some(dec(96.0)), dec(95.0)));
        assert!(tightens(Bias::Short, Some(dec(105.0)), dec(104.0)));
        assert!(!tightens(Bias::Short, Some(dec(104.0)), dec(105.0)));
    }

    #[test]
    fn macd_hist_needs_history_and_tracks_trend() {
        assert!(macd_hist(&[1.0; 10]).is_none());
        let rising: Vec<f64> = (0..80).map(|i| 100.0 + i as f64).collect();
        let hist = macd_hist(&rising).unwrap();
        assert!(hist > 0.0, "rising series has positive histogram");
        let falling: Vec<f64> = (0..80).map(|i| 100.0 - i as f64 * 0.5).collect();
        assert!(macd_hist(&falling).unwrap() < 0.0);
    }

    #[test]
    fn history_caps_and_keys_by_symbol_and_frame() {
        let history = BarHistory::new();
        let mut bar: BarClose = serde_json::from_value(serde_json::json!({
            "symbol": "BTCUSDT",
            "timeframe": "1h",
            "close_time_ms": 0,
            "ohlcv": {"open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5}
        }))
        .unwrap();
        for i in 0..(HISTORY_CAP + 50) {
            bar.close_time_ms = i as i64;
            history.push(&bar);
        }
        assert_eq!(history.bars("BTCUSDT", Timeframe::H1).len(), HISTORY_CAP);
        assert!(history.bars("ETHUSDT", Timeframe::H1).is_empty());
        assert!(history.bars("BTCUSDT", Timeframe::H4).is_empty());
    }
}
