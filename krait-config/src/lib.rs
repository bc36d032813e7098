//! Layered configuration loading utilities.
//!
//! Sources (lowest to highest precedence):
//! 1. `config/default.toml`
//! 2. `config/{environment}.toml` (if an environment name is given)
//! 3. `config/local.toml` (optional, ignored in git)
//! 4. Environment variables prefixed with `KRAIT__`

use std::path::{Path, PathBuf};

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use krait_core::ExecutionMode;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_execution_mode")]
    pub execution_mode: ExecutionMode,
    #[serde(default = "default_group")]
    pub stream_group: String,
    #[serde(default = "default_consumer")]
    pub stream_consumer: String,
    #[serde(default)]
    pub bybit: BybitSettings,
    #[serde(default)]
    pub sizing: SizingSettings,
    #[serde(default)]
    pub gates: GateSettings,
    #[serde(default)]
    pub entry: EntrySettings,
    #[serde(default)]
    pub exits: ExitSettings,
    #[serde(default)]
    pub risk: RiskSettings,
    #[serde(default)]
    pub consistency: ConsistencySettings,
    #[serde(default)]
    pub ws: WsSettings,
    #[serde(default)]
    pub loops: LoopSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BybitSettings {
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    #[serde(default = "default_account_type")]
    pub account_type: String,
    #[serde(default)]
    pub position_idx: u8,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SizingSettings {
    /// Fraction of equity risked per plan when the plan omits its own.
    #[serde(default = "default_risk_pct")]
    pub risk_pct: f64,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    #[serde(default = "default_margin_mode")]
    pub margin_mode: MarginMode,
    #[serde(default = "default_min_order_value")]
    pub min_order_value_usdt: f64,
    #[serde(default = "default_max_order_value")]
    pub max_order_value_usdt: f64,
    /// Equity assumed in paper/backtest mode where no wallet exists.
    #[serde(default = "default_paper_equity")]
    pub paper_equity_usdt: f64,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Isolated,
    Cross,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GateSettings {
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,
    #[serde(default = "default_mutex_upgrade_action")]
    pub mutex_upgrade_action: MutexUpgradeAction,
    #[serde(default = "default_true")]
    pub cooldown_enabled: bool,
    #[serde(default = "default_cooldown_bars_1h")]
    pub cooldown_bars_1h: u32,
    #[serde(default = "default_cooldown_bars_4h")]
    pub cooldown_bars_4h: u32,
    #[serde(default = "default_cooldown_bars_1d")]
    pub cooldown_bars_1d: u32,
    #[serde(default = "default_lock_ttl_ms")]
    pub plan_lock_ttl_ms: u64,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutexUpgradeAction {
    Block,
    CloseLowerAndOpen,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EntrySettings {
    #[serde(default = "default_entry_order_type")]
    pub order_type: EntryOrderType,
    #[serde(default = "default_entry_timeout_ms")]
    pub timeout_ms: i64,
    #[serde(default = "default_partial_fill_timeout_ms")]
    pub partial_fill_timeout_ms: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_reprice_bps")]
    pub reprice_bps: u32,
    #[serde(default = "default_true")]
    pub fallback_market: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub enum EntryOrderType {
    Market,
    Limit,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExitSettings {
    #[serde(default = "default_trail_mode")]
    pub runner_trail_mode: RunnerTrailMode,
    #[serde(default = "default_atr_period")]
    pub runner_atr_period: usize,
    #[serde(default = "default_atr_mult")]
    pub runner_atr_mult: f64,
    #[serde(default = "default_true")]
    pub secondary_rule_enabled: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunnerTrailMode {
    Atr,
    Pivot,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RiskSettings {
    #[serde(default = "default_true")]
    pub kill_switch_enabled: bool,
    #[serde(default)]
    pub kill_switch_force_on: bool,
    #[serde(default = "default_kill_switch_flag")]
    pub kill_switch_flag_name: String,
    #[serde(default = "default_true")]
    pub risk_circuit_enabled: bool,
    #[serde(default = "default_soft_pct")]
    pub daily_drawdown_soft_pct: f64,
    #[serde(default = "default_hard_pct")]
    pub daily_drawdown_hard_pct: f64,
    #[serde(default = "default_daily_loss_limit_pct")]
    pub daily_loss_limit_pct: f64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConsistencySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold_pct: f64,
    #[serde(default = "default_drift_window_ms")]
    pub drift_window_ms: i64,
    #[serde(default = "default_wallet_drift_threshold")]
    pub wallet_drift_threshold_pct: f64,
    #[serde(default = "default_wallet_ws_max_age_ms")]
    pub wallet_ws_max_age_ms: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WsSettings {
    #[serde(default)]
    pub private_enabled: bool,
    #[serde(default = "default_subscriptions")]
    pub subscriptions: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoopSettings {
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_position_sync_secs")]
    pub position_sync_interval_secs: u64,
    #[serde(default = "default_risk_monitor_secs")]
    pub risk_monitor_interval_secs: u64,
    #[serde(default = "default_snapshot_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_order_timeout_alert_window_ms")]
    pub order_timeout_alert_window_ms: i64,
    #[serde(default = "default_lag_alert_ms")]
    pub processing_lag_alert_ms: i64,
    /// Reconcile backs off private open-order polling to this interval while
    /// the private WS feed is healthy.
    #[serde(default = "default_open_orders_poll_ms")]
    pub open_orders_poll_interval_ms: i64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default)]
    pub public_rps: Option<f64>,
    #[serde(default)]
    pub private_critical_rps: Option<f64>,
    #[serde(default)]
    pub private_order_query_rps: Option<f64>,
    #[serde(default)]
    pub private_account_query_rps: Option<f64>,
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
}

impl Default for BybitSettings {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            ws_url: default_ws_url(),
            api_key: String::new(),
            api_secret: String::new(),
            category: default_category(),
            recv_window_ms: default_recv_window_ms(),
            account_type: default_account_type(),
            position_idx: 0,
        }
    }
}

impl Default for SizingSettings {
    fn default() -> Self {
        Self {
            risk_pct: default_risk_pct(),
            leverage: default_leverage(),
            margin_mode: default_margin_mode(),
            min_order_value_usdt: default_min_order_value(),
            max_order_value_usdt: default_max_order_value(),
            paper_equity_usdt: default_paper_equity(),
        }
    }
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            max_open_positions: default_max_open_positions(),
            mutex_upgrade_action: default_mutex_upgrade_action(),
            cooldown_enabled: true,
            cooldown_bars_1h: default_cooldown_bars_1h(),
            cooldown_bars_4h: default_cooldown_bars_4h(),
            cooldown_bars_1d: default_cooldown_bars_1d(),
            plan_lock_ttl_ms: default_lock_ttl_ms(),
        }
    }
}

impl Default for EntrySettings {
    fn default() -> Self {
        Self {
            order_type: default_entry_order_type(),
            timeout_ms: default_entry_timeout_ms(),
            partial_fill_timeout_ms: default_partial_fill_timeout_ms(),
            max_retries: default_max_retries(),
            reprice_bps: default_reprice_bps(),
            fallback_market: true,
        }
    }
}

impl Default for ExitSettings {
    fn default() -> Self {
        Self {
            runner_trail_mode: default_trail_mode(),
            runner_atr_period: default_atr_period(),
            runner_atr_mult: default_atr_mult(),
            secondary_rule_enabled: true,
        }
    }
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            kill_switch_enabled: true,
            kill_switch_force_on: false,
            kill_switch_flag_name: default_kill_switch_flag(),
            risk_circuit_enabled: true,
            daily_drawdown_soft_pct: default_soft_pct(),
            daily_drawdown_hard_pct: default_hard_pct(),
            daily_loss_limit_pct: default_daily_loss_limit_pct(),
        }
    }
}

impl Default for ConsistencySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            drift_threshold_pct: default_drift_threshold(),
            drift_window_ms: default_drift_window_ms(),
            wallet_drift_threshold_pct: default_wallet_drift_threshold(),
            wallet_ws_max_age_ms: default_wallet_ws_max_age_ms(),
        }
    }
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            private_enabled: false,
            subscriptions: default_subscriptions(),
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_secs(),
            position_sync_interval_secs: default_position_sync_secs(),
            risk_monitor_interval_secs: default_risk_monitor_secs(),
            snapshot_interval_secs: default_snapshot_secs(),
            order_timeout_alert_window_ms: default_order_timeout_alert_window_ms(),
            processing_lag_alert_ms: default_lag_alert_ms(),
            open_orders_poll_interval_ms: default_open_orders_poll_ms(),
        }
    }
}

impl GateSettings {
    /// Cooldown length in bars for a timeframe; zero disables the write.
    #[must_use]
    pub fn cooldown_bars(&self, timeframe: krait_core::Timeframe) -> u32 {
        use krait_core::Timeframe::*;
        match timeframe {
            H1 => self.cooldown_bars_1h,
            H4 => self.cooldown_bars_4h,
            D1 => self.cooldown_bars_1d,
            _ => 0,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_database_path() -> PathBuf {
    PathBuf::from("./data/execution.db")
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}
fn default_metrics_addr() -> String {
    "127.0.0.1:9464".into()
}
fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::Paper
}
fn default_group() -> String {
    "execution".into()
}
fn default_consumer() -> String {
    "execution-1".into()
}
fn default_rest_url() -> String {
    "https://api-testnet.bybit.com".into()
}
fn default_ws_url() -> String {
    "wss://stream-testnet.bybit.com".into()
}
fn default_category() -> String {
    "linear".into()
}
fn default_recv_window_ms() -> u64 {
    5_000
}
fn default_account_type() -> String {
    "UNIFIED".into()
}
fn default_risk_pct() -> f64 {
    0.005
}
fn default_leverage() -> f64 {
    3.0
}
fn default_margin_mode() -> MarginMode {
    MarginMode::Isolated
}
fn default_min_order_value() -> f64 {
    10.0
}
fn default_max_order_value() -> f64 {
    25_000.0
}
fn default_paper_equity() -> f64 {
    10_000.0
}
fn default_max_open_positions() -> u32 {
    3
}
fn default_mutex_upgrade_action() -> MutexUpgradeAction {
    MutexUpgradeAction::Block
}
fn default_cooldown_bars_1h() -> u32 {
    2
}
fn default_cooldown_bars_4h() -> u32 {
    1
}
fn default_cooldown_bars_1d() -> u32 {
    1
}
fn default_lock_ttl_ms() -> u64 {
    60_000
}
fn default_entry_order_type() -> EntryOrderType {
    EntryOrderType::Market
}
fn default_entry_timeout_ms() -> i64 {
    15_000
}
fn default_partial_fill_timeout_ms() -> i64 {
    20_000
}
fn default_max_retries() -> u32 {
    2
}
fn default_reprice_bps() -> u32 {
    5
}
fn default_trail_mode() -> RunnerTrailMode {
    RunnerTrailMode::Atr
}
fn default_atr_period() -> usize {
    14
}
fn default_atr_mult() -> f64 {
    2.0
}
fn default_kill_switch_flag() -> String {
    "KILL_SWITCH".into()
}
fn default_soft_pct() -> f64 {
    3.0
}
fn default_hard_pct() -> f64 {
    5.0
}
fn default_daily_loss_limit_pct() -> f64 {
    6.0
}
fn default_drift_threshold() -> f64 {
    0.10
}
fn default_drift_window_ms() -> i64 {
    300_000
}
fn default_wallet_drift_threshold() -> f64 {
    0.02
}
fn default_wallet_ws_max_age_ms() -> i64 {
    90_000
}
fn default_subscriptions() -> Vec<String> {
    vec![
        "order".into(),
        "execution".into(),
        "position".into(),
        "wallet".into(),
    ]
}
fn default_reconcile_secs() -> u64 {
    5
}
fn default_position_sync_secs() -> u64 {
    10
}
fn default_risk_monitor_secs() -> u64 {
    30
}
fn default_snapshot_secs() -> u64 {
    30
}
fn default_order_timeout_alert_window_ms() -> i64 {
    60_000
}
fn default_lag_alert_ms() -> i64 {
    10_000
}
fn default_open_orders_poll_ms() -> i64 {
    5_000
}
fn default_true() -> bool {
    true
}

/// Loads configuration by merging files and environment variables.
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(false));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }
    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));
    builder = builder.add_source(
        Environment::with_prefix("KRAIT")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg: AppConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(cfg.execution_mode, ExecutionMode::Paper);
        assert_eq!(cfg.entry.timeout_ms, 15_000);
        assert_eq!(cfg.entry.partial_fill_timeout_ms, 20_000);
        assert_eq!(cfg.entry.max_retries, 2);
        assert_eq!(cfg.entry.reprice_bps, 5);
        assert!(cfg.entry.fallback_market);
        assert_eq!(cfg.gates.max_open_positions, 3);
        assert_eq!(cfg.consistency.drift_threshold_pct, 0.10);
        assert_eq!(cfg.consistency.drift_window_ms, 300_000);
        assert_eq!(cfg.sizing.risk_pct, 0.005);
    }

    #[test]
    fn cooldown_bars_only_for_tradable_frames() {
        let gates = GateSettings::default();
        assert_eq!(gates.cooldown_bars(krait_core::Timeframe::H1), 2);
        assert_eq!(gates.cooldown_bars(krait_core::Timeframe::H4), 1);
        assert_eq!(gates.cooldown_bars(krait_core::Timeframe::D1), 1);
        assert_eq!(gates.cooldown_bars(krait_core::Timeframe::M15), 0);
    }

    #[test]
    fn mode_and_enums_parse_from_wire_spellings() {
        let cfg: AppConfig = serde_json::from_value(serde_json::json!({
            "execution_mode": "LIVE",
            "gates": {"mutex_upgrade_action": "CLOSE_LOWER_AND_OPEN"},
            "entry": {"order_type": "Limit"},
            "exits": {"runner_trail_mode": "PIVOT"},
            "sizing": {"margin_mode": "cross"}
        }))
        .unwrap();
        assert_eq!(cfg.execution_mode, ExecutionMode::Live);
        assert_eq!(
            cfg.gates.mutex_upgrade_action,
            MutexUpgradeAction::CloseLowerAndOpen
        );
        assert_eq!(cfg.entry.order_type, EntryOrderType::Limit);
        assert_eq!(cfg.exits.runner_trail_mode, RunnerTrailMode::Pivot);
        assert_eq!(cfg.sizing.margin_mode, MarginMode::Cross);
    }
}
