//! Execution-quality metrics attached to fill reports.

/// Submit-to-fill latency; `None` when either timestamp is missing or the
/// fill precedes the submit (clock skew).
#[must_use]
pub fn latency_ms(submit_ts_ms: Option<i64>, fill_ts_ms: Option<i64>) -> Option<i64> {
    let (submit, fill) = (submit_ts_ms?, fill_ts_ms?);
    if fill < submit {
        return None;
    }
    Some(fill - submit)
}

/// Signed slippage in basis points against a reference price.
#[must_use]
pub fn slippage_bps(avg_fill_price: Option<f64>, reference_price: Option<f64>) -> Option<f64> {
    let (fill, reference) = (avg_fill_price?, reference_price?);
    if reference <= 0.0 {
        return None;
    }
    Some((fill - reference) / reference * 10_000.0)
}

/// filled/planned clamped to [0, 1].
#[must_use]
pub fn fill_ratio(filled_qty: Option<f64>, planned_qty: Option<f64>) -> Option<f64> {
    let (filled, planned) = (filled_qty?, planned_qty?);
    if planned <= 0.0 {
        return None;
    }
    Some((filled / planned).clamp(0.0, 1.0))
}
