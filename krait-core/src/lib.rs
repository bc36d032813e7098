//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod events;
pub mod ids;

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// Alias used for human-readable market symbols (e.g., `BTCUSDT`).
pub type Symbol = String;

/// The side of an order or plan, as it appears on the wire.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// The directional bias a filled entry on this side creates.
    #[must_use]
    pub fn bias(self) -> Bias {
        match self {
            Self::Buy => Bias::Long,
            Self::Sell => Bias::Short,
        }
    }

    /// Venue spelling ("Buy"/"Sell") used by the Bybit v5 API.
    #[must_use]
    pub fn as_venue(self) -> &'static str {
        match self {
            Self::Buy => "Buy",
            Self::Sell => "Sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(format!("unsupported side '{other}'")),
        }
    }
}

/// Direction of an open position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Bias {
    Long,
    Short,
}

impl fmt::Display for Bias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

impl FromStr for Bias {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_uppercase().as_str() {
            "LONG" => Ok(Self::Long),
            "SHORT" => Ok(Self::Short),
            other => Err(format!("unsupported bias '{other}'")),
        }
    }
}

/// Bar granularities the execution core accepts.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Timeframe {
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    /// Bar duration in milliseconds.
    #[must_use]
    pub fn duration_ms(self) -> i64 {
        match self {
            Self::M15 => 15 * 60 * 1000,
            Self::M30 => 30 * 60 * 1000,
            Self::H1 => 60 * 60 * 1000,
            Self::H4 => 4 * 60 * 60 * 1000,
            Self::H8 => 8 * 60 * 60 * 1000,
            Self::D1 => 24 * 60 * 60 * 1000,
        }
    }

    /// Cycle priority used by the same-symbol-side mutex: 1d > 4h > 1h,
    /// monitor-only frames rank lowest.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            Self::D1 => 3,
            Self::H4 => 2,
            Self::H1 => 1,
            _ => 0,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::H8 => "8h",
            Self::D1 => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1h" | "60m" => Ok(Self::H1),
            "4h" | "240m" => Ok(Self::H4),
            "8h" => Ok(Self::H8),
            "1d" | "d" => Ok(Self::D1),
            other => Err(format!("unsupported timeframe '{other}'")),
        }
    }
}

/// Order execution style.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    #[must_use]
    pub fn as_venue(self) -> &'static str {
        match self {
            Self::Market => "Market",
            Self::Limit => "Limit",
        }
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "market" => Ok(Self::Market),
            "limit" => Ok(Self::Limit),
            other => Err(format!("unsupported order type '{other}'")),
        }
    }
}

/// Time-in-force constraints forwarded to the venue.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TimeInForce {
    GoodTilCanceled,
    ImmediateOrCancel,
}

impl TimeInForce {
    #[must_use]
    pub fn as_venue(self) -> &'static str {
        match self {
            Self::GoodTilCanceled => "GTC",
            Self::ImmediateOrCancel => "IOC",
        }
    }
}

/// Runtime mode of the execution core.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionMode {
    Live,
    Paper,
    Backtest,
}

impl ExecutionMode {
    /// Paper and backtest share the simulated matching path.
    #[must_use]
    pub fn is_simulated(self) -> bool {
        !matches!(self, Self::Live)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "LIVE"),
            Self::Paper => write!(f, "PAPER"),
            Self::Backtest => write!(f, "BACKTEST"),
        }
    }
}

/// Immutable entry/exit intent produced by the strategy service.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TradePlan {
    #[serde(default)]
    pub plan_id: Option<String>,
    pub idempotency_key: String,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub side: Side,
    pub entry_price: f64,
    pub primary_sl_price: f64,
    #[serde(default)]
    pub risk_pct: Option<f64>,
    #[serde(default)]
    pub bias: Option<Bias>,
    /// MACD histogram at the entry bar, carried for the secondary exit rule.
    #[serde(default)]
    pub hist_entry: Option<f64>,
    #[serde(default)]
    pub close_time_ms: Option<i64>,
    #[serde(default)]
    pub valid_from_ms: Option<i64>,
    #[serde(default)]
    pub expires_at_ms: Option<i64>,
    #[serde(default)]
    pub setup_id: Option<String>,
    #[serde(default)]
    pub trigger_id: Option<String>,
    #[serde(default)]
    pub ext: serde_json::Map<String, serde_json::Value>,
}

impl TradePlan {
    /// The resolved directional bias (explicit field wins, else derived from side).
    #[must_use]
    pub fn resolved_bias(&self) -> Bias {
        self.bias.unwrap_or_else(|| self.side.bias())
    }

    #[must_use]
    pub fn run_id(&self) -> Option<String> {
        self.ext
            .get("run_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

/// Lifecycle state of a position row.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
    Failed,
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl FromStr for PositionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_uppercase().as_str() {
            "OPEN" => Ok(Self::Open),
            "CLOSING" => Ok(Self::Closing),
            "CLOSED" => Ok(Self::Closed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unsupported position status '{other}'")),
        }
    }
}

/// Why a position left the book.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    PrimarySlHit,
    SecondarySlExit,
    StopLoss,
    ExchangeClosed,
    MutexUpgrade,
    SecondaryRule,
    EntryFailed,
    RiskCircuit,
    ForcedExit,
}

impl ExitReason {
    /// Only a primary stop-out (or its conservative live-mode inference)
    /// triggers a cooldown window.
    #[must_use]
    pub fn starts_cooldown(self) -> bool {
        matches!(self, Self::PrimarySlHit | Self::StopLoss)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrimarySlHit => "PRIMARY_SL_HIT",
            Self::SecondarySlExit => "SECONDARY_SL_EXIT",
            Self::StopLoss => "STOP_LOSS",
            Self::ExchangeClosed => "EXCHANGE_CLOSED",
            Self::MutexUpgrade => "MUTEX_UPGRADE",
            Self::SecondaryRule => "SECONDARY_RULE",
            Self::EntryFailed => "ENTRY_FAILED",
            Self::RiskCircuit => "RISK_CIRCUIT",
            Self::ForcedExit => "FORCED_EXIT",
        }
    }
}

impl FromStr for ExitReason {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_uppercase().as_str() {
            "PRIMARY_SL_HIT" => Ok(Self::PrimarySlHit),
            "SECONDARY_SL_EXIT" => Ok(Self::SecondarySlExit),
            "STOP_LOSS" => Ok(Self::StopLoss),
            "EXCHANGE_CLOSED" => Ok(Self::ExchangeClosed),
            "MUTEX_UPGRADE" => Ok(Self::MutexUpgrade),
            "SECONDARY_RULE" => Ok(Self::SecondaryRule),
            "ENTRY_FAILED" => Ok(Self::EntryFailed),
            "RISK_CIRCUIT" => Ok(Self::RiskCircuit),
            "FORCED_EXIT" => Ok(Self::ForcedExit),
            other => Err(format!("unsupported exit reason '{other}'")),
        }
    }
}

/// One row per admitted idempotency key.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Position {
    pub position_id: String,
    pub idempotency_key: String,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub side: Side,
    pub bias: Bias,
    pub qty_total: Quantity,
    pub qty_runner: Quantity,
    pub entry_price: Price,
    pub primary_sl_price: Price,
    pub runner_stop_price: Option<Price>,
    pub status: PositionStatus,
    pub entry_close_time_ms: i64,
    pub opened_at_ms: i64,
    pub closed_at_ms: Option<i64>,
    pub exit_reason: Option<ExitReason>,
    pub secondary_rule_checked: bool,
    pub hist_entry: Option<f64>,
    pub meta: PositionMeta,
}

/// Mutable working state stored alongside the position row.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PositionMeta {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub tp1_filled: bool,
    #[serde(default)]
    pub tp2_filled: bool,
    #[serde(default)]
    pub tp1_filled_ms: Option<i64>,
    #[serde(default)]
    pub tp2_filled_ms: Option<i64>,
    /// Remaining open quantity maintained by the paper matcher.
    #[serde(default)]
    pub qty_open: Option<Quantity>,
    #[serde(default)]
    pub last_price: Option<Price>,
    #[serde(default)]
    pub last_close_time_ms: Option<i64>,
    /// Exit fills accumulated while the position unwinds.
    #[serde(default)]
    pub legs: Vec<ExitLeg>,
    #[serde(default)]
    pub close_price: Option<Price>,
    /// Break-even stop pushed to the venue after TP1.
    #[serde(default)]
    pub tp1_breakeven_applied: bool,
    #[serde(default)]
    pub runner_sl_last_applied: Option<Price>,
    #[serde(default)]
    pub runner_sl_last_applied_ms: Option<i64>,
    #[serde(default)]
    pub open_orders_last_poll_ms: Option<i64>,
    /// Latest position snapshot observed on the private WS stream.
    #[serde(default)]
    pub ws_position: Option<serde_json::Value>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PositionMeta {
    /// Effective stop once TP fills are taken into account: runner stop after
    /// TP2, break-even after TP1, primary stop otherwise.
    #[must_use]
    pub fn effective_stop(
        &self,
        entry: Price,
        primary_sl: Price,
        runner_stop: Option<Price>,
    ) -> Price {
        if self.tp2_filled {
            runner_stop.unwrap_or(primary_sl)
        } else if self.tp1_filled {
            entry
        } else {
            primary_sl
        }
    }
}

/// A partial exit recorded while the position unwinds.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExitLeg {
    pub kind: ExitLegKind,
    pub qty: Quantity,
    pub price: Price,
    pub time_ms: i64,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitLegKind {
    Tp1,
    Tp2,
    Sl,
}

/// What a purpose-scoped child order is for.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderPurpose {
    Entry,
    Tp1,
    Tp2,
    Exit,
    SlAdjust,
}

impl OrderPurpose {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "ENTRY",
            Self::Tp1 => "TP1",
            Self::Tp2 => "TP2",
            Self::Exit => "EXIT",
            Self::SlAdjust => "SL_ADJUST",
        }
    }

    #[must_use]
    pub fn is_take_profit(self) -> bool {
        matches!(self, Self::Tp1 | Self::Tp2)
    }
}

impl FromStr for OrderPurpose {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_uppercase().as_str() {
            "ENTRY" => Ok(Self::Entry),
            "TP1" => Ok(Self::Tp1),
            "TP2" => Ok(Self::Tp2),
            "EXIT" => Ok(Self::Exit),
            "SL_ADJUST" => Ok(Self::SlAdjust),
            other => Err(format!("unsupported order purpose '{other}'")),
        }
    }
}

/// Local lifecycle state of a child order.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Submitted,
    PartiallyFilled,
    Filled,
    Canceled,
    Failed,
}

impl OrderStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Failed)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Submitted => "SUBMITTED",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Failed => "FAILED",
        }
    }

    /// Map a raw venue order status string onto the local enum.
    #[must_use]
    pub fn from_venue(status: &str) -> Self {
        match status {
            "Filled" => Self::Filled,
            "PartiallyFilled" => Self::PartiallyFilled,
            "Cancelled" | "Canceled" | "PartiallyFilledCanceled" | "Deactivated" => Self::Canceled,
            "Rejected" => Self::Failed,
            _ => Self::Submitted,
        }
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_uppercase().as_str() {
            "NEW" => Ok(Self::New),
            "SUBMITTED" => Ok(Self::Submitted),
            "PARTIALLY_FILLED" => Ok(Self::PartiallyFilled),
            "FILLED" => Ok(Self::Filled),
            "CANCELED" => Ok(Self::Canceled),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unsupported order status '{other}'")),
        }
    }
}

/// Purpose-scoped child of a position; unique per (idempotency_key, purpose).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Order {
    pub order_id: String,
    pub idempotency_key: String,
    pub symbol: Symbol,
    pub purpose: OrderPurpose,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Quantity,
    pub price: Option<Price>,
    pub reduce_only: bool,
    pub status: OrderStatus,
    pub venue_order_id: Option<String>,
    pub venue_order_link_id: Option<String>,
    pub filled_qty: Quantity,
    pub avg_price: Option<Price>,
    pub submitted_at_ms: Option<i64>,
    pub retry_count: u32,
    pub last_fill_at_ms: Option<i64>,
    pub payload: serde_json::Value,
}

/// Append-only record of a single execution on the venue.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Fill {
    /// Venue execution id; the unit of fill idempotency.
    pub fill_id: String,
    pub order_id: String,
    pub symbol: Symbol,
    pub purpose: OrderPurpose,
    pub side: Side,
    pub exec_qty: Quantity,
    pub exec_price: Price,
    pub fee: Option<Price>,
    pub exec_time_ms: i64,
}

/// Entry-ban window written after a primary stop-out.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Cooldown {
    pub cooldown_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub timeframe: Timeframe,
    pub reason: String,
    pub until_ts_ms: i64,
}

/// Daily account risk ledger keyed by UTC trade date.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RiskState {
    pub trade_date: String,
    pub mode: String,
    pub starting_equity: Option<Decimal>,
    pub current_equity: Option<Decimal>,
    pub min_equity: Option<Decimal>,
    pub max_equity: Option<Decimal>,
    pub drawdown_pct: Decimal,
    pub soft_halt: bool,
    pub hard_halt: bool,
    pub kill_switch: bool,
    pub meta: RiskStateMeta,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RiskStateMeta {
    #[serde(default)]
    pub consecutive_loss_count: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RiskState {
    /// True when any circuit forbids opening new positions.
    #[must_use]
    pub fn blocks_entries(&self) -> bool {
        self.soft_halt || self.hard_halt || self.kill_switch
    }
}

/// Periodic wallet capture used for drift detection and equity tracking.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WalletSnapshot {
    pub snapshot_id: String,
    pub ts_ms: i64,
    pub source: SnapshotSource,
    pub balance_usdt: Option<Decimal>,
    pub equity_usdt: Option<Decimal>,
    pub available_usdt: Option<Decimal>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SnapshotSource {
    Ws,
    Rest,
}

impl SnapshotSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ws => "WS",
            Self::Rest => "REST",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_priority_matches_mutex_ranking() {
        assert_eq!(Timeframe::D1.priority(), 3);
        assert_eq!(Timeframe::H4.priority(), 2);
        assert_eq!(Timeframe::H1.priority(), 1);
        assert_eq!(Timeframe::M15.priority(), 0);
        assert_eq!(Timeframe::M30.priority(), 0);
        assert_eq!(Timeframe::H8.priority(), 0);
    }

    #[test]
    fn timeframe_round_trips_through_str() {
        for tf in [
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::H8,
            Timeframe::D1,
        ] {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
    }

    #[test]
    fn side_inverse_and_bias() {
        assert_eq!(Side::Buy.inverse(), Side::Sell);
        assert_eq!(Side::Sell.inverse(), Side::Buy);
        assert_eq!(Side::Buy.bias(), Bias::Long);
        assert_eq!(Side::Sell.bias(), Bias::Short);
    }

    #[test]
    fn effective_stop_follows_tp_progression() {
        let entry = Decimal::from(30_000);
        let primary = Decimal::from(29_000);
        let runner = Some(Decimal::from(31_000));

        let mut meta = PositionMeta::default();
        assert_eq!(meta.effective_stop(entry, primary, runner), primary);

        meta.tp1_filled = true;
        assert_eq!(meta.effective_stop(entry, primary, runner), entry);

        meta.tp2_filled = true;
        assert_eq!(
            meta.effective_stop(entry, primary, runner),
            Decimal::from(31_000)
        );
    }

    #[test]
    fn venue_order_status_mapping() {
        assert_eq!(OrderStatus::from_venue("Filled"), OrderStatus::Filled);
        assert_eq!(
            OrderStatus::from_venue("PartiallyFilled"),
            OrderStatus::PartiallyFilled
        );
        assert_eq!(OrderStatus::from_venue("Cancelled"), OrderStatus::Canceled);
        assert_eq!(OrderStatus::from_venue("Rejected"), OrderStatus::Failed);
        assert_eq!(OrderStatus::from_venue("New"), OrderStatus::Submitted);
    }

    #[test]
    fn only_primary_stop_reasons_start_cooldowns() {
        assert!(ExitReason::PrimarySlHit.starts_cooldown());
        assert!(ExitReason::StopLoss.starts_cooldown());
        assert!(!ExitReason::SecondarySlExit.starts_cooldown());
        assert!(!ExitReason::ExchangeClosed.starts_cooldown());
        assert!(!ExitReason::MutexUpgrade.starts_cooldown());
    }

    #[test]
    fn trade_plan_run_id_comes_from_ext() {
        let plan: TradePlan = serde_json::from_value(serde_json::json!({
            "idempotency_key": "abc",
            "symbol": "BTCUSDT",
            "timeframe": "1h",
            "side": "BUY",
            "entry_price": 30000.0,
            "primary_sl_price": 29000.0,
            "ext": {"run_id": "run-7"}
        }))
        .unwrap();
        assert_eq!(plan.run_id().as_deref(), Some("run-7"));
        assert_eq!(plan.resolved_bias(), Bias::Long);
    }
}
