//! Bybit v5 REST connector with built-in rate limiting and query caching.
//!
//! Signing follows the v5 header scheme (`X-BAPI-SIGN` over
//! `timestamp + api_key + recv_window + payload`). Every call passes through
//! the endpoint-class rate limiter; responses feed their budget headers back
//! into it. Transient failures retry with exponential backoff honoring any
//! venue-provided retry-after.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use krait_core::ids::now_ms;
use krait_core::{OrderType, Side, TimeInForce};

pub mod cache;
pub mod limiter;
pub mod ws;

pub use cache::{CacheRead, TtlCache};
pub use limiter::{BucketConfig, EndpointClass, HeaderView, LimiterConfig, RateLimiter};

const RETRY_MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 500;
const RETRY_MAX_DELAY_MS: u64 = 5_000;

/// Bybit's "too many visits" business code.
const RET_CODE_RATE_LIMIT: i64 = 10_006;
/// Transient "system busy"/timeout family.
const RET_CODES_BUSY: [i64; 3] = [10_002, 10_016, 170_007];

/// Convenience alias for venue results.
pub type VenueResult<T> = Result<T, ExchangeError>;

/// Errors returned by the connector.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("rate limited (code {ret_code}): {ret_msg}")]
    RateLimited {
        ret_code: i64,
        ret_msg: String,
        retry_after_ms: Option<i64>,
    },
    #[error("venue error (code {ret_code}): {ret_msg}")]
    Venue { ret_code: i64, ret_msg: String },
}

impl ExchangeError {
    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    #[must_use]
    pub fn retry_after_ms(&self) -> Option<i64> {
        match self {
            Self::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// Whether the REST client should retry the call with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::RateLimited { .. } => true,
            Self::Venue { ret_code, .. } => RET_CODES_BUSY.contains(ret_code),
            _ => false,
        }
    }
}

/// API credentials for private endpoints.
#[derive(Clone)]
pub struct BybitCredentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Connector configuration.
#[derive(Clone)]
pub struct BybitConfig {
    pub rest_url: String,
    pub ws_url: String,
    pub category: String,
    pub recv_window_ms: u64,
    pub account_type: String,
    pub position_idx: u8,
    /// Cache TTLs for the idempotent private queries.
    pub wallet_cache_ttl: Duration,
    pub positions_cache_ttl: Duration,
    pub open_orders_cache_ttl: Duration,
    /// Predicted wait above which cached queries serve stale data.
    pub degrade_after_ms: u64,
}

impl Default for BybitConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://api-testnet.bybit.com".into(),
            ws_url: "wss://stream-testnet.bybit.com".into(),
            category: "linear".into(),
            recv_window_ms: 5_000,
            account_type: "UNIFIED".into(),
            position_idx: 0,
            wallet_cache_ttl: Duration::from_secs(10),
            positions_cache_ttl: Duration::from_secs(5),
            open_orders_cache_ttl: Duration::from_secs(3),
            degrade_after_ms: 1_500,
        }
    }
}

/// New-order parameters; quantities and prices are pre-rounded strings so the
/// venue sees exactly what sizing produced.
#[derive(Clone, Debug)]
pub struct OrderParams {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: String,
    pub price: Option<String>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub order_link_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreatedOrder {
    #[serde(rename = "orderId")]
    pub order_id: String,
    #[serde(rename = "orderLinkId")]
    pub order_link_id: String,
}

/// One open/recent order as the venue reports it.
#[derive(Clone, Debug, Deserialize)]
pub struct VenueOrder {
    #[serde(rename = "orderId")]
    pub order_id: String,
    #[serde(rename = "orderLinkId")]
    pub order_link_id: String,
    pub symbol: String,
    pub side: String,
    #[serde(rename = "orderType")]
    pub order_type: String,
    #[serde(rename = "orderStatus")]
    pub order_status: String,
    pub price: String,
    pub qty: String,
    #[serde(rename = "cumExecQty")]
    pub cum_exec_qty: String,
    #[serde(rename = "avgPrice", default)]
    pub avg_price: String,
    #[serde(rename = "createdTime", default)]
    pub created_time: String,
    #[serde(rename = "updatedTime", default)]
    pub updated_time: String,
    #[serde(rename = "reduceOnly", default)]
    pub reduce_only: bool,
}

impl VenueOrder {
    #[must_use]
    pub fn filled_qty(&self) -> f64 {
        self.cum_exec_qty.parse().unwrap_or(0.0)
    }

    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.order_status == "Filled"
    }
}

/// One position row from `/v5/position/list`.
#[derive(Clone, Debug, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: String,
    pub size: String,
    #[serde(rename = "avgPrice", default)]
    pub avg_price: String,
    #[serde(rename = "unrealisedPnl", default)]
    pub unrealised_pnl: String,
}

impl VenuePosition {
    #[must_use]
    pub fn size_abs(&self) -> f64 {
        self.size.parse::<f64>().unwrap_or(0.0).abs()
    }
}

/// Aggregated wallet totals for the configured account type.
#[derive(Clone, Debug, Default)]
pub struct WalletTotals {
    pub total_equity: Option<f64>,
    pub total_wallet_balance: Option<f64>,
    pub total_available: Option<f64>,
}

impl WalletTotals {
    /// Best available equity figure, in preference order.
    #[must_use]
    pub fn equity(&self) -> Option<f64> {
        self.total_equity
            .or(self.total_wallet_balance)
            .or(self.total_available)
    }
}

/// Lot/price filters from instruments-info.
#[derive(Clone, Copy, Debug)]
pub struct InstrumentFilters {
    pub qty_step: f64,
    pub min_qty: f64,
    pub tick_size: f64,
}

impl Default for InstrumentFilters {
    fn default() -> Self {
        // Conservative fallback when instruments-info is unavailable.
        Self {
            qty_step: 0.001,
            min_qty: 0.001,
            tick_size: 0.1,
        }
    }
}

/// One execution from `/v5/execution/list`.
#[derive(Clone, Debug, Deserialize)]
pub struct VenueExecutionRow {
    #[serde(rename = "execId")]
    pub exec_id: String,
    #[serde(rename = "orderId")]
    pub order_id: String,
    #[serde(rename = "orderLinkId", default)]
    pub order_link_id: String,
    pub symbol: String,
    pub side: String,
    #[serde(rename = "execQty")]
    pub exec_qty: String,
    #[serde(rename = "execPrice")]
    pub exec_price: String,
    #[serde(rename = "execFee", default)]
    pub exec_fee: String,
    #[serde(rename = "execTime", default)]
    pub exec_time: String,
}

/// The venue surface the execution core needs. Implemented by [`BybitClient`]
/// and by scripted mocks in tests.
#[async_trait]
pub trait VenueExecution: Send + Sync {
    async fn place_order(&self, params: OrderParams) -> VenueResult<CreatedOrder>;
    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<&str>,
        order_link_id: Option<&str>,
    ) -> VenueResult<()>;
    async fn open_orders(&self, symbol: &str) -> VenueResult<Vec<VenueOrder>>;
    async fn position_size(&self, symbol: &str) -> VenueResult<f64>;
    async fn set_trading_stop(&self, symbol: &str, stop_loss: &str) -> VenueResult<()>;
    async fn wallet_equity(&self) -> VenueResult<WalletTotals>;
    async fn instrument_filters(&self, symbol: &str) -> VenueResult<InstrumentFilters>;
    async fn executions(&self, symbol: &str, limit: u32) -> VenueResult<Vec<VenueExecutionRow>>;

    /// Open orders via a TTL cache when the implementation has one; the
    /// default always fetches fresh.
    async fn open_orders_degradable(&self, symbol: &str) -> VenueResult<CacheRead<Vec<VenueOrder>>> {
        Ok(CacheRead {
            value: self.open_orders(symbol).await?,
            degraded: false,
            stale_ms: 0,
            predicted_wait_ms: 0,
        })
    }

    /// Wallet totals via a TTL cache when the implementation has one.
    async fn wallet_equity_degradable(&self) -> VenueResult<CacheRead<WalletTotals>> {
        Ok(CacheRead {
            value: self.wallet_equity().await?,
            degraded: false,
            stale_ms: 0,
            predicted_wait_ms: 0,
        })
    }
}

type HmacSha256 = Hmac<Sha256>;

struct QueryCaches {
    wallet: TtlCache<WalletTotals>,
    positions: TtlCache<Vec<VenuePosition>>,
    open_orders: TtlCache<Vec<VenueOrder>>,
}

/// A thin wrapper over the Bybit v5 REST API.
pub struct BybitClient {
    http: Client,
    config: BybitConfig,
    credentials: Option<BybitCredentials>,
    limiter: Arc<RateLimiter>,
    caches: QueryCaches,
}

impl BybitClient {
    pub fn new(
        config: BybitConfig,
        credentials: Option<BybitCredentials>,
        limiter: Arc<RateLimiter>,
    ) -> VenueResult<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| ExchangeError::Transport(err.to_string()))?;
        let caches = QueryCaches {
            wallet: TtlCache::new(config.wallet_cache_ttl),
            positions: TtlCache::new(config.positions_cache_ttl),
            open_orders: TtlCache::new(config.open_orders_cache_ttl),
        };
        Ok(Self {
            http,
            config,
            credentials,
            limiter,
            caches,
        })
    }

    #[must_use]
    pub fn ws_url(&self) -> &str {
        &self.config.ws_url
    }

    #[must_use]
    pub fn credentials(&self) -> Option<&BybitCredentials> {
        self.credentials.as_ref()
    }

    #[must_use]
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.rest_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn creds(&self) -> VenueResult<&BybitCredentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| ExchangeError::Authentication("missing Bybit credentials".into()))
    }

    async fn wait_for_tokens(&self, class: EndpointClass, symbol: &str) {
        let wait = self.limiter.acquire(class, symbol);
        if wait > 0 {
            let capped = wait.min(self.limiter.max_wait_ms());
            debug!(class = class.as_str(), symbol, wait_ms = capped, "rate limiter wait");
            tokio::time::sleep(Duration::from_millis(capped)).await;
        }
    }

    async fn request<T>(
        &self,
        method: Method,
        path: &str,
        class: EndpointClass,
        symbol: &str,
        body: Option<Value>,
        query: Option<Vec<(String, String)>>,
    ) -> VenueResult<T>
    where
        T: DeserializeOwned,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.wait_for_tokens(class, symbol).await;
            let result = self
                .request_once(method.clone(), path, class, symbol, body.clone(), query.clone())
                .await;
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < RETRY_MAX_ATTEMPTS => {
                    let backoff = RETRY_BASE_DELAY_MS
                        .saturating_mul(1 << (attempt - 1))
                        .min(RETRY_MAX_DELAY_MS);
                    let delay = err
                        .retry_after_ms()
                        .map(|ra| (ra as u64).max(backoff))
                        .unwrap_or(backoff);
                    warn!(
                        path,
                        attempt,
                        delay_ms = delay,
                        error = %err,
                        "transient venue error; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn request_once<T>(
        &self,
        method: Method,
        path: &str,
        class: EndpointClass,
        symbol: &str,
        body: Option<Value>,
        query: Option<Vec<(String, String)>>,
    ) -> VenueResult<T>
    where
        T: DeserializeOwned,
    {
        let query_string = query
            .as_ref()
            .map(|pairs| {
                pairs
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("&")
            })
            .unwrap_or_default();

        let url = if query_string.is_empty() {
            self.url(path)
        } else {
            format!("{}?{}", self.url(path), query_string)
        };
        let mut request = self.http.request(method.clone(), url);

        if class != EndpointClass::Public {
            let creds = self.creds()?;
            let timestamp = Utc::now().timestamp_millis();
            let payload_part = if method == Method::GET {
                query_string.clone()
            } else {
                body.as_ref().map(Value::to_string).unwrap_or_default()
            };
            let payload = format!(
                "{timestamp}{}{}{}",
                creds.api_key, self.config.recv_window_ms, payload_part
            );
            let mut mac = HmacSha256::new_from_slice(creds.api_secret.as_bytes())
                .map_err(|err| ExchangeError::Authentication(err.to_string()))?;
            mac.update(payload.as_bytes());
            let signature = hex::encode(mac.finalize().into_bytes());
            request = request
                .header("X-BAPI-API-KEY", &creds.api_key)
                .header("X-BAPI-TIMESTAMP", timestamp.to_string())
                .header("X-BAPI-SIGN", signature)
                .header("X-BAPI-RECV-WINDOW", self.config.recv_window_ms.to_string())
                .header("Content-Type", "application/json");
        }
        if method != Method::GET {
            if let Some(body) = &body {
                request = request.json(body);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|err| ExchangeError::Transport(err.to_string()))?;

        let header_view = HeaderView::parse(
            response
                .headers()
                .iter()
                .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
        );
        self.limiter.update_from_headers(class, symbol, &header_view);

        let http_status = response.status();
        if http_status.as_u16() == 429 {
            return Err(ExchangeError::RateLimited {
                ret_code: 429,
                ret_msg: "http 429".into(),
                retry_after_ms: header_view.retry_after_ms,
            });
        }
        if http_status.is_server_error() {
            return Err(ExchangeError::Transport(format!("http {http_status}")));
        }

        let api: ApiResponse<T> = response
            .json()
            .await
            .map_err(|err| ExchangeError::Serialization(err.to_string()))?;
        if api.ret_code == 0 {
            return Ok(api.result);
        }
        if api.ret_code == RET_CODE_RATE_LIMIT {
            return Err(ExchangeError::RateLimited {
                ret_code: api.ret_code,
                ret_msg: api.ret_msg,
                retry_after_ms: header_view.retry_after_ms.or_else(|| {
                    header_view
                        .reset_timestamp_ms
                        .map(|ts| (ts - now_ms()).max(0))
                }),
            });
        }
        Err(ExchangeError::Venue {
            ret_code: api.ret_code,
            ret_msg: api.ret_msg,
        })
    }

    async fn fetch_wallet(&self) -> VenueResult<WalletTotals> {
        let query = vec![
            ("accountType".to_string(), self.config.account_type.clone()),
            ("coin".to_string(), "USDT".to_string()),
        ];
        let result: WalletBalanceResult = self
            .request(
                Method::GET,
                "/v5/account/wallet-balance",
                EndpointClass::PrivateAccountQuery,
                "",
                None,
                Some(query),
            )
            .await?;
        let mut totals = WalletTotals::default();
        if let Some(account) = result.list.first() {
            totals.total_equity = parse_opt(&account.total_equity);
            totals.total_wallet_balance = parse_opt(&account.total_wallet_balance);
            totals.total_available = parse_opt(&account.total_available_balance);
        }
        Ok(totals)
    }

    async fn fetch_positions(&self, symbol: Option<&str>) -> VenueResult<Vec<VenuePosition>> {
        let mut query = vec![("category".to_string(), self.config.category.clone())];
        if let Some(symbol) = symbol {
            query.push(("symbol".to_string(), symbol.to_string()));
        } else {
            query.push(("settleCoin".to_string(), "USDT".to_string()));
        }
        let result: ListResult<VenuePosition> = self
            .request(
                Method::GET,
                "/v5/position/list",
                EndpointClass::PrivateAccountQuery,
                symbol.unwrap_or(""),
                None,
                Some(query),
            )
            .await?;
        Ok(result.list)
    }

    async fn fetch_open_orders(&self, symbol: &str) -> VenueResult<Vec<VenueOrder>> {
        let query = vec![
            ("category".to_string(), self.config.category.clone()),
            ("symbol".to_string(), symbol.to_string()),
            ("openOnly".to_string(), "0".to_string()),
        ];
        let result: ListResult<VenueOrder> = self
            .request(
                Method::GET,
                "/v5/order/realtime",
                EndpointClass::PrivateOrderQuery,
                symbol,
                None,
                Some(query),
            )
            .await?;
        Ok(result.list)
    }

    /// Wallet totals via the TTL cache; stale data is surfaced as degraded
    /// instead of blocking on limiter tokens.
    pub async fn wallet_balance_cached(&self) -> VenueResult<CacheRead<WalletTotals>> {
        let predicted = self
            .limiter
            .estimate_wait_ms(EndpointClass::PrivateAccountQuery, "");
        if let Some(read) = self
            .caches
            .wallet
            .plan_read(predicted, self.config.degrade_after_ms)
        {
            return Ok(read);
        }
        let totals = self.fetch_wallet().await?;
        self.caches.wallet.store(totals.clone());
        Ok(CacheRead {
            value: totals,
            degraded: false,
            stale_ms: 0,
            predicted_wait_ms: predicted,
        })
    }

    /// Position list via the TTL cache.
    pub async fn position_list_cached(&self) -> VenueResult<CacheRead<Vec<VenuePosition>>> {
        let predicted = self
            .limiter
            .estimate_wait_ms(EndpointClass::PrivateAccountQuery, "");
        if let Some(read) = self
            .caches
            .positions
            .plan_read(predicted, self.config.degrade_after_ms)
        {
            return Ok(read);
        }
        let positions = self.fetch_positions(None).await?;
        self.caches.positions.store(positions.clone());
        Ok(CacheRead {
            value: positions,
            degraded: false,
            stale_ms: 0,
            predicted_wait_ms: predicted,
        })
    }

    /// Open orders via the TTL cache (all symbols collapse into one slot; the
    /// reconcile loop filters per position).
    pub async fn open_orders_cached(&self, symbol: &str) -> VenueResult<CacheRead<Vec<VenueOrder>>> {
        let predicted = self
            .limiter
            .estimate_wait_ms(EndpointClass::PrivateOrderQuery, symbol);
        if let Some(read) = self
            .caches
            .open_orders
            .plan_read(predicted, self.config.degrade_after_ms)
        {
            let filtered = read
                .value
                .iter()
                .filter(|o| o.symbol == symbol)
                .cloned()
                .collect();
            return Ok(CacheRead {
                value: filtered,
                degraded: read.degraded,
                stale_ms: read.stale_ms,
                predicted_wait_ms: read.predicted_wait_ms,
            });
        }
        let orders = self.fetch_open_orders(symbol).await?;
        self.caches.open_orders.store(orders.clone());
        Ok(CacheRead {
            value: orders,
            degraded: false,
            stale_ms: 0,
            predicted_wait_ms: predicted,
        })
    }
}

#[async_trait]
impl VenueExecution for BybitClient {
    async fn place_order(&self, params: OrderParams) -> VenueResult<CreatedOrder> {
        let mut payload = json!({
            "category": self.config.category,
            "symbol": params.symbol,
            "side": params.side.as_venue(),
            "orderType": params.order_type.as_venue(),
            "qty": params.qty,
            "timeInForce": params.time_in_force.as_venue(),
            "reduceOnly": params.reduce_only,
            "positionIdx": self.config.position_idx,
            "orderLinkId": params.order_link_id,
        });
        if let Some(price) = &params.price {
            payload["price"] = json!(price);
        }
        self.request(
            Method::POST,
            "/v5/order/create",
            EndpointClass::PrivateCritical,
            &params.symbol,
            Some(payload),
            None,
        )
        .await
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<&str>,
        order_link_id: Option<&str>,
    ) -> VenueResult<()> {
        if order_id.is_none() && order_link_id.is_none() {
            return Err(ExchangeError::InvalidRequest(
                "cancel requires orderId or orderLinkId".into(),
            ));
        }
        let mut payload = json!({
            "category": self.config.category,
            "symbol": symbol,
        });
        if let Some(id) = order_id {
            payload["orderId"] = json!(id);
        }
        if let Some(link) = order_link_id {
            payload["orderLinkId"] = json!(link);
        }
        let _: Value = self
            .request(
                Method::POST,
                "/v5/order/cancel",
                EndpointClass::PrivateCritical,
                symbol,
                Some(payload),
                None,
            )
            .await?;
        Ok(())
    }

    async fn open_orders(&self, symbol: &str) -> VenueResult<Vec<VenueOrder>> {
        self.fetch_open_orders(symbol).await
    }

    async fn position_size(&self, symbol: &str) -> VenueResult<f64> {
        let positions = self.fetch_positions(Some(symbol)).await?;
        Ok(positions.first().map(VenuePosition::size_abs).unwrap_or(0.0))
    }

    async fn set_trading_stop(&self, symbol: &str, stop_loss: &str) -> VenueResult<()> {
        let payload = json!({
            "category": self.config.category,
            "symbol": symbol,
            "positionIdx": self.config.position_idx,
            "stopLoss": stop_loss,
            "tpslMode": "Full",
        });
        let _: Value = self
            .request(
                Method::POST,
                "/v5/position/trading-stop",
                EndpointClass::PrivateCritical,
                symbol,
                Some(payload),
                None,
            )
            .await?;
        Ok(())
    }

    async fn wallet_equity(&self) -> VenueResult<WalletTotals> {
        self.fetch_wallet().await
    }

    async fn instrument_filters(&self, symbol: &str) -> VenueResult<InstrumentFilters> {
        let query = vec![
            ("category".to_string(), self.config.category.clone()),
            ("symbol".to_string(), symbol.to_string()),
        ];
        let result: ListResult<InstrumentInfo> = self
            .request(
                Method::GET,
                "/v5/market/instruments-info",
                EndpointClass::Public,
                symbol,
                None,
                Some(query),
            )
            .await?;
        let Some(info) = result.list.first() else {
            return Ok(InstrumentFilters::default());
        };
        Ok(InstrumentFilters {
            qty_step: parse_opt(&info.lot_size_filter.qty_step).unwrap_or(0.001),
            min_qty: parse_opt(&info.lot_size_filter.min_order_qty).unwrap_or(0.001),
            tick_size: parse_opt(&info.price_filter.tick_size).unwrap_or(0.1),
        })
    }

    async fn executions(&self, symbol: &str, limit: u32) -> VenueResult<Vec<VenueExecutionRow>> {
        let query = vec![
            ("category".to_string(), self.config.category.clone()),
            ("symbol".to_string(), symbol.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        let result: ListResult<VenueExecutionRow> = self
            .request(
                Method::GET,
                "/v5/execution/list",
                EndpointClass::PrivateOrderQuery,
                symbol,
                None,
                Some(query),
            )
            .await?;
        Ok(result.list)
    }

    async fn open_orders_degradable(&self, symbol: &str) -> VenueResult<CacheRead<Vec<VenueOrder>>> {
        self.open_orders_cached(symbol).await
    }

    async fn wallet_equity_degradable(&self) -> VenueResult<CacheRead<WalletTotals>> {
        self.wallet_balance_cached().await
    }
}

fn parse_opt(value: &str) -> Option<f64> {
    if value.is_empty() {
        return None;
    }
    value.parse().ok()
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: T,
}

#[derive(Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Deserialize)]
struct WalletBalanceResult {
    #[serde(default = "Vec::new")]
    list: Vec<WalletAccount>,
}

#[derive(Deserialize)]
struct WalletAccount {
    #[serde(rename = "totalEquity", default)]
    total_equity: String,
    #[serde(rename = "totalWalletBalance", default)]
    total_wallet_balance: String,
    #[serde(rename = "totalAvailableBalance", default)]
    total_available_balance: String,
}

#[derive(Deserialize)]
struct InstrumentInfo {
    #[serde(rename = "lotSizeFilter")]
    lot_size_filter: LotSizeFilter,
    #[serde(rename = "priceFilter")]
    price_filter: PriceFilter,
}

#[derive(Deserialize)]
struct LotSizeFilter {
    #[serde(rename = "qtyStep", default)]
    qty_step: String,
    #[serde(rename = "minOrderQty", default)]
    min_order_qty: String,
}

#[derive(Deserialize)]
struct PriceFilter {
    #[serde(rename = "tickSize", default)]
    tick_size: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_errors_are_retryable_with_retry_after() {
        let err = ExchangeError::RateLimited {
            ret_code: 10_006,
            ret_msg: "too many visits".into(),
            retry_after_ms: Some(1_200),
        };
        assert!(err.is_rate_limit());
        assert!(err.is_retryable());
        assert_eq!(err.retry_after_ms(), Some(1_200));
    }

    #[test]
    fn busy_codes_retry_but_rejections_do_not() {
        let busy = ExchangeError::Venue {
            ret_code: 10_016,
            ret_msg: "system busy".into(),
        };
        assert!(busy.is_retryable());
        let rejected = ExchangeError::Venue {
            ret_code: 110_007,
            ret_msg: "insufficient margin".into(),
        };
        assert!(!rejected.is_retryable());
        assert!(!ExchangeError::InvalidRequest("bad qty".into()).is_retryable());
    }

    #[test]
    fn wallet_totals_prefer_equity() {
        let totals = WalletTotals {
            total_equity: Some(10_000.0),
            total_wallet_balance: Some(9_900.0),
            total_available: Some(9_000.0),
        };
        assert_eq!(totals.equity(), Some(10_000.0));
        let fallback = WalletTotals {
            total_equity: None,
            total_wallet_balance: None,
            total_available: Some(9_000.0),
        };
        assert_eq!(fallback.equity(), Some(9_000.0));
    }

    #[test]
    fn venue_order_parses_fill_progress() {
        let order: VenueOrder = serde_json::from_value(json!({
            "orderId": "o1",
            "orderLinkId": "plan:ENTRY:0",
            "symbol": "BTCUSDT",
            "side": "Buy",
            "orderType": "Limit",
            "orderStatus": "PartiallyFilled",
            "price": "30000",
            "qty": "0.05",
            "cumExecQty": "0.02",
            "avgPrice": "30001.5"
        }))
        .unwrap();
        assert!((order.filled_qty() - 0.02).abs() < 1e-12);
        assert!(!order.is_filled());
    }
}
