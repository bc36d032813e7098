//! In-process venue rate limiting.
//!
//! Endpoint classes get separate global buckets, private classes additionally
//! get per-symbol buckets. The critical class (order create/cancel, trading
//! stop) is throttled least aggressively so account/order queries can never
//! starve order placement. Venue response headers feed back into the buckets:
//! a low remaining budget scales the refill rate down, an exhausted budget or
//! an explicit `Retry-After` freezes the bucket until the reset timestamp.

use std::collections::HashMap;
use std::sync::Mutex;

use krait_core::ids::now_ms;

/// Endpoint families with independent budgets.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpointClass {
    Public,
    PrivateCritical,
    PrivateOrderQuery,
    PrivateAccountQuery,
}

impl EndpointClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::PrivateCritical => "private_critical",
            Self::PrivateOrderQuery => "private_order_query",
            Self::PrivateAccountQuery => "private_account_query",
        }
    }
}

/// Refill rate and capacity of one bucket.
#[derive(Clone, Copy, Debug)]
pub struct BucketConfig {
    pub rate_per_sec: f64,
    pub burst: f64,
}

impl BucketConfig {
    #[must_use]
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            rate_per_sec,
            burst,
        }
    }
}

/// Full limiter configuration; defaults mirror a single-instance deployment.
#[derive(Clone, Debug)]
pub struct LimiterConfig {
    pub public: BucketConfig,
    pub private_critical: BucketConfig,
    pub private_order_query: BucketConfig,
    pub private_account_query: BucketConfig,
    pub per_symbol_critical: BucketConfig,
    pub per_symbol_order_query: BucketConfig,
    pub per_symbol_account_query: BucketConfig,
    pub max_wait_ms: u64,
    /// Remaining-budget floor under which a reset timestamp becomes a hard cooldown.
    pub low_status_threshold: i64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            public: BucketConfig::new(8.0, 16.0),
            private_critical: BucketConfig::new(3.0, 6.0),
            private_order_query: BucketConfig::new(2.0, 4.0),
            private_account_query: BucketConfig::new(2.0, 4.0),
            per_symbol_critical: BucketConfig::new(1.0, 2.0),
            per_symbol_order_query: BucketConfig::new(0.7, 1.5),
            per_symbol_account_query: BucketConfig::new(0.7, 1.5),
            max_wait_ms: 5_000,
            low_status_threshold: 2,
        }
    }
}

struct TokenBucket {
    base_rate: f64,
    burst: f64,
    tokens: f64,
    last_ms: i64,
    cooldown_until_ms: i64,
    rate_multiplier: f64,
}

impl TokenBucket {
    fn new(config: BucketConfig) -> Self {
        let burst = config.burst.max(1.0);
        Self {
            base_rate: config.rate_per_sec.max(0.01),
            burst,
            tokens: burst,
            last_ms: now_ms(),
            cooldown_until_ms: 0,
            rate_multiplier: 1.0,
        }
    }

    fn effective_rate(&self) -> f64 {
        (self.base_rate * self.rate_multiplier).max(0.01)
    }

    fn refill(&mut self, now: i64) {
        if now <= self.last_ms {
            return;
        }
        let elapsed = (now - self.last_ms) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed * self.effective_rate()).min(self.burst);
        self.last_ms = now;
    }

    fn estimate_wait_ms(&mut self, cost: f64) -> u64 {
        let now = now_ms();
        if now < self.cooldown_until_ms {
            return (self.cooldown_until_ms - now) as u64;
        }
        self.refill(now);
        if self.tokens >= cost {
            return 0;
        }
        let needed = cost - self.tokens;
        ((needed / self.effective_rate()) * 1000.0) as u64
    }

    fn acquire(&mut self, cost: f64) -> u64 {
        let now = now_ms();
        if now < self.cooldown_until_ms {
            return (self.cooldown_until_ms - now) as u64;
        }
        self.refill(now);
        if self.tokens >= cost {
            self.tokens -= cost;
            return 0;
        }
        let needed = cost - self.tokens;
        let wait = ((needed / self.effective_rate()) * 1000.0) as u64;
        // The caller will sleep `wait`; treat the refill as spent.
        self.tokens = 0.0;
        self.last_ms = now;
        wait
    }

    fn set_cooldown_until(&mut self, reset_ts_ms: i64) {
        self.cooldown_until_ms = self.cooldown_until_ms.max(reset_ts_ms);
    }

    fn set_rate_multiplier(&mut self, multiplier: f64) {
        self.rate_multiplier = multiplier.clamp(0.1, 1.0);
    }
}

struct LimiterState {
    public: TokenBucket,
    private_critical: TokenBucket,
    private_order_query: TokenBucket,
    private_account_query: TokenBucket,
    per_symbol: HashMap<(EndpointClass, String), TokenBucket>,
}

/// Global + per-symbol token-bucket limiter with adaptive feedback.
pub struct RateLimiter {
    config: LimiterConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: LimiterConfig) -> Self {
        let state = LimiterState {
            public: TokenBucket::new(config.public),
            private_critical: TokenBucket::new(config.private_critical),
            private_order_query: TokenBucket::new(config.private_order_query),
            private_account_query: TokenBucket::new(config.private_account_query),
            per_symbol: HashMap::new(),
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    #[must_use]
    pub fn max_wait_ms(&self) -> u64 {
        self.config.max_wait_ms
    }

    fn symbol_config(&self, class: EndpointClass) -> Option<BucketConfig> {
        match class {
            EndpointClass::Public => None,
            EndpointClass::PrivateCritical => Some(self.config.per_symbol_critical),
            EndpointClass::PrivateOrderQuery => Some(self.config.per_symbol_order_query),
            EndpointClass::PrivateAccountQuery => Some(self.config.per_symbol_account_query),
        }
    }

    /// Consume one token for (class, symbol); returns the wait the caller
    /// must observe before issuing the request.
    pub fn acquire(&self, class: EndpointClass, symbol: &str) -> u64 {
        let symbol_cfg = self.symbol_config(class);
        let mut state = self.state.lock().unwrap();
        let global_wait = global_bucket(&mut state, class).acquire(1.0);
        let symbol_wait = match symbol_cfg {
            Some(cfg) if !symbol.is_empty() => state
                .per_symbol
                .entry((class, symbol.to_string()))
                .or_insert_with(|| TokenBucket::new(cfg))
                .acquire(1.0),
            _ => 0,
        };
        global_wait.max(symbol_wait)
    }

    /// Predicted wait without consuming tokens; used by the TTL cache to
    /// decide between blocking and serving stale data.
    pub fn estimate_wait_ms(&self, class: EndpointClass, symbol: &str) -> u64 {
        let symbol_cfg = self.symbol_config(class);
        let mut state = self.state.lock().unwrap();
        let global_wait = global_bucket(&mut state, class).estimate_wait_ms(1.0);
        let symbol_wait = match symbol_cfg {
            Some(cfg) if !symbol.is_empty() => state
                .per_symbol
                .entry((class, symbol.to_string()))
                .or_insert_with(|| TokenBucket::new(cfg))
                .estimate_wait_ms(1.0),
            _ => 0,
        };
        global_wait.max(symbol_wait)
    }

    /// Freeze the class (and the symbol bucket) until the venue reset time.
    pub fn apply_cooldown(&self, class: EndpointClass, symbol: &str, reset_ts_ms: i64) {
        let mut state = self.state.lock().unwrap();
        global_bucket(&mut state, class).set_cooldown_until(reset_ts_ms);
        if let Some(bucket) = state.per_symbol.get_mut(&(class, symbol.to_string())) {
            bucket.set_cooldown_until(reset_ts_ms);
        }
    }

    /// Scale refill rates from the remaining/limit budget ratio. Critical
    /// endpoints slow down least, queries hardest.
    pub fn apply_limit_status(
        &self,
        class: EndpointClass,
        symbol: &str,
        remaining: Option<i64>,
        limit: Option<i64>,
    ) {
        let Some(remaining) = remaining else { return };
        let ratio = match limit {
            Some(limit) if limit > 0 => remaining as f64 / limit as f64,
            _ => {
                if remaining <= self.config.low_status_threshold {
                    0.05
                } else {
                    1.0
                }
            }
        };
        let multiplier = match class {
            EndpointClass::PrivateCritical => {
                if ratio < 0.25 {
                    0.6
                } else {
                    1.0
                }
            }
            EndpointClass::Public => {
                if ratio < 0.25 {
                    0.5
                } else {
                    1.0
                }
            }
            _ => {
                if ratio < 0.10 {
                    0.2
                } else if ratio < 0.25 {
                    0.5
                } else {
                    1.0
                }
            }
        };
        let mut state = self.state.lock().unwrap();
        global_bucket(&mut state, class).set_rate_multiplier(multiplier);
        if let Some(bucket) = state.per_symbol.get_mut(&(class, symbol.to_string())) {
            bucket.set_rate_multiplier(multiplier);
        }
    }

    /// Single entry-point for header feedback after every REST response.
    pub fn update_from_headers(&self, class: EndpointClass, symbol: &str, headers: &HeaderView) {
        self.apply_limit_status(class, symbol, headers.limit_status, headers.limit);
        let Some(mut reset_ts) = headers.reset_timestamp_ms else {
            return;
        };
        let mut force = headers.retry_after_ms.is_some();
        if !force {
            if let Some(remaining) = headers.limit_status {
                force = remaining <= self.config.low_status_threshold;
            }
        }
        if force {
            if let Some(retry_after) = headers.retry_after_ms {
                reset_ts = reset_ts.max(now_ms() + retry_after);
            }
            self.apply_cooldown(class, symbol, reset_ts);
        }
    }
}

fn global_bucket(state: &mut LimiterState, class: EndpointClass) -> &mut TokenBucket {
    match class {
        EndpointClass::Public => &mut state.public,
        EndpointClass::PrivateCritical => &mut state.private_critical,
        EndpointClass::PrivateOrderQuery => &mut state.private_order_query,
        EndpointClass::PrivateAccountQuery => &mut state.private_account_query,
    }
}

/// Parsed view of the venue rate-limit headers.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderView {
    /// `X-Bapi-Limit-Status`: remaining budget.
    pub limit_status: Option<i64>,
    /// `X-Bapi-Limit`: total budget.
    pub limit: Option<i64>,
    /// `X-Bapi-Limit-Reset-Timestamp`, normalized to milliseconds.
    pub reset_timestamp_ms: Option<i64>,
    /// `Retry-After`, converted to milliseconds.
    pub retry_after_ms: Option<i64>,
}

impl HeaderView {
    /// Parse from raw header (name, value) pairs, case-insensitive.
    #[must_use]
    pub fn parse<'a>(headers: impl Iterator<Item = (&'a str, &'a str)>) -> Self {
        let mut view = Self::default();
        for (name, value) in headers {
            match name.to_ascii_lowercase().as_str() {
                "x-bapi-limit-status" => view.limit_status = parse_int(value),
                "x-bapi-limit" => view.limit = parse_int(value),
                "x-bapi-limit-reset-timestamp" => {
                    view.reset_timestamp_ms = parse_int(value).map(|n| {
                        // Seconds-resolution timestamps get promoted to ms.
                        if n < 10_000_000_000 {
                            n * 1000
                        } else {
                            n
                        }
                    });
                }
                "retry-after" => {
                    view.retry_after_ms = value.parse::<f64>().ok().map(|s| (s * 1000.0) as i64);
                }
                _ => {}
            }
        }
        view
    }
}

fn parse_int(value: &str) -> Option<i64> {
    value.parse::<f64>().ok().map(|f| f as i64)
}
