//! Stream envelopes and typed event payloads.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids;
use crate::{Symbol, Timeframe, TradePlan};

/// Topic names on the durable event log.
pub mod topics {
    pub const BAR_CLOSE: &str = "stream:bar_close";
    pub const TRADE_PLAN: &str = "stream:trade_plan";
    pub const EXECUTION_REPORT: &str = "stream:execution_report";
    pub const RISK_EVENT: &str = "stream:risk_event";
    pub const DLQ: &str = "stream:dlq";
}

/// Common wrapper shared by every event on the bus. `event_id` is the unit of
/// idempotency on both the publish and the persist side.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Envelope {
    pub event_id: String,
    pub ts_ms: i64,
    #[serde(default)]
    pub env: Option<String>,
    pub service: String,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub meta: Option<Value>,
    pub payload: Value,
    #[serde(default)]
    pub ext: Option<Value>,
}

fn default_schema_version() -> u32 {
    1
}

impl Envelope {
    /// Wrap a typed payload, stamping a fresh event id and trace id.
    pub fn new<T: Serialize>(service: &str, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            event_id: ids::new_event_id(),
            ts_ms: ids::now_ms(),
            env: None,
            service: service.to_string(),
            trace_id: Some(ids::new_trace_id()),
            schema_version: 1,
            meta: None,
            payload: serde_json::to_value(payload)?,
            ext: None,
        })
    }

    /// Deserialize the payload into its concrete type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }
}

/// OHLCV of a completed bar. Wire values are JSON numbers.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Ohlcv {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

/// Payload of a `bar_close` envelope.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BarClose {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub close_time_ms: i64,
    #[serde(default = "default_true")]
    pub is_final: bool,
    #[serde(default)]
    pub source: Option<String>,
    pub ohlcv: Ohlcv,
    #[serde(default)]
    pub ext: serde_json::Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl BarClose {
    #[must_use]
    pub fn run_id(&self) -> Option<String> {
        self.ext
            .get("run_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

/// Payload of a `trade_plan` envelope (the plan itself).
pub type TradePlanPayload = TradePlan;

/// Closed status vocabulary of the execution-report stream.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    OrderSubmitted,
    OrderRejected,
    PartialFilled,
    Filled,
    TpHit,
    PrimarySlHit,
    SecondarySlExit,
    PositionClosed,
}

impl ReportStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OrderSubmitted => "ORDER_SUBMITTED",
            Self::OrderRejected => "ORDER_REJECTED",
            Self::PartialFilled => "PARTIAL_FILLED",
            Self::Filled => "FILLED",
            Self::TpHit => "TP_HIT",
            Self::PrimarySlHit => "PRIMARY_SL_HIT",
            Self::SecondarySlExit => "SECONDARY_SL_EXIT",
            Self::PositionClosed => "POSITION_CLOSED",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload of an `execution_report` envelope.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExecutionReport {
    #[serde(default)]
    pub plan_id: Option<String>,
    pub idempotency_key: String,
    #[serde(default)]
    pub order_id: Option<String>,
    pub status: ReportStatus,
    #[serde(default)]
    pub reason: Option<String>,
    pub symbol: Symbol,
    #[serde(default)]
    pub timeframe: Option<Timeframe>,
    #[serde(default)]
    pub filled_qty: Option<f64>,
    #[serde(default)]
    pub avg_price: Option<f64>,
    #[serde(default)]
    pub latency_ms: Option<i64>,
    #[serde(default)]
    pub slippage_bps: Option<f64>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub fill_ratio: Option<f64>,
    #[serde(default)]
    pub detail: serde_json::Map<String, Value>,
    #[serde(default)]
    pub ext: serde_json::Map<String, Value>,
}

impl ExecutionReport {
    /// Report skeleton; callers fill in the relevant optional fields.
    #[must_use]
    pub fn new(idempotency_key: &str, symbol: &str, status: ReportStatus) -> Self {
        Self {
            plan_id: None,
            idempotency_key: idempotency_key.to_string(),
            order_id: None,
            status,
            reason: None,
            symbol: symbol.to_string(),
            timeframe: None,
            filled_qty: None,
            avg_price: None,
            latency_ms: None,
            slippage_bps: None,
            retry_count: None,
            fill_ratio: None,
            detail: serde_json::Map::new(),
            ext: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

/// Event severities, INFO upward.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Important,
    Critical,
    Emergency,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Important => "IMPORTANT",
            Self::Critical => "CRITICAL",
            Self::Emergency => "EMERGENCY",
        }
    }
}

/// Closed type vocabulary of the risk-event stream.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskEventType {
    RiskRejected,
    KillSwitchOn,
    SignalExpired,
    RiskCircuitHalt,
    CooldownBlocked,
    MaxPositionsBlocked,
    PositionMutexBlocked,
    RateLimit,
    OrderValueTooSmall,
    DataGap,
    DataLag,
    WsReconnect,
    SignalConflict,
    IdempotencyConflict,
    OrderTimeout,
    OrderPartialFill,
    OrderRetry,
    OrderFallbackMarket,
    OrderCancelled,
    ConsistencyDrift,
    BarDuplicate,
    PriceJump,
    VolumeAnomaly,
    ProcessingLag,
}

impl RiskEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RiskRejected => "RISK_REJECTED",
            Self::KillSwitchOn => "KILL_SWITCH_ON",
            Self::SignalExpired => "SIGNAL_EXPIRED",
            Self::RiskCircuitHalt => "RISK_CIRCUIT_HALT",
            Self::CooldownBlocked => "COOLDOWN_BLOCKED",
            Self::MaxPositionsBlocked => "MAX_POSITIONS_BLOCKED",
            Self::PositionMutexBlocked => "POSITION_MUTEX_BLOCKED",
            Self::RateLimit => "RATE_LIMIT",
            Self::OrderValueTooSmall => "ORDER_VALUE_TOO_SMALL",
            Self::DataGap => "DATA_GAP",
            Self::DataLag => "DATA_LAG",
            Self::WsReconnect => "WS_RECONNECT",
            Self::SignalConflict => "SIGNAL_CONFLICT",
            Self::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            Self::OrderTimeout => "ORDER_TIMEOUT",
            Self::OrderPartialFill => "ORDER_PARTIAL_FILL",
            Self::OrderRetry => "ORDER_RETRY",
            Self::OrderFallbackMarket => "ORDER_FALLBACK_MARKET",
            Self::OrderCancelled => "ORDER_CANCELLED",
            Self::ConsistencyDrift => "CONSISTENCY_DRIFT",
            Self::BarDuplicate => "BAR_DUPLICATE",
            Self::PriceJump => "PRICE_JUMP",
            Self::VolumeAnomaly => "VOLUME_ANOMALY",
            Self::ProcessingLag => "PROCESSING_LAG",
        }
    }

    /// Types whose repeats are suppressed within a per-(type, symbol) window.
    #[must_use]
    pub fn is_windowed(self) -> bool {
        matches!(
            self,
            Self::ConsistencyDrift | Self::RateLimit | Self::DataLag | Self::KillSwitchOn
        )
    }
}

impl fmt::Display for RiskEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RiskEventType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(value.to_uppercase()))
            .map_err(|_| format!("unsupported risk event type '{value}'"))
    }
}

/// Payload of a `risk_event` envelope.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RiskEvent {
    #[serde(rename = "type")]
    pub event_type: RiskEventType,
    pub severity: Severity,
    #[serde(default)]
    pub symbol: Option<Symbol>,
    #[serde(default)]
    pub retry_after_ms: Option<i64>,
    #[serde(default)]
    pub detail: serde_json::Map<String, Value>,
    #[serde(default)]
    pub ext: Option<Value>,
}

/// Payload of a dead-letter envelope: the offending message stored verbatim.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeadLetter {
    pub source_topic: String,
    pub message_id: String,
    pub reason: String,
    pub raw: Value,
}
