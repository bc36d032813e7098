use std::convert::Infallible;
use std::fs::{self, OpenOptions};
use std::net::SocketAddr;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use hyper::body::Body;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Method, Request, Response, StatusCode};
use prometheus::{Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, Registry, TextEncoder};
use serde_json::json;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use krait_config::AppConfig;
use krait_core::ExecutionMode;

const SERVICE_NAME: &str = "execution-service";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global tracing subscriber from the service configuration:
/// human-readable stdout at `log_level` (overridable via `RUST_LOG`), plus a
/// JSON audit file when `log_path` is set.
pub fn init_tracing(config: &AppConfig) -> Result<()> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    };

    let stdout_layer = fmt::layer().with_target(false).with_filter(filter());

    let file_layer = match &config.log_path {
        Some(path) => {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create log directory {dir:?}"))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let _ = FILE_GUARD.set(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(writer)
                    .with_filter(filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

/// Prometheus metrics collected by the execution service.
pub struct ExecutionMetrics {
    registry: Registry,
    plans_total: IntCounter,
    bars_total: IntCounter,
    dlq_total: IntCounterVec,
    ws_events_total: IntCounter,
    loop_errors: IntCounterVec,
    equity_gauge: Gauge,
    ws_connected: Gauge,
    stream_lag: GaugeVec,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let plans_total =
            IntCounter::new("krait_trade_plans_total", "Trade plans consumed").unwrap();
        let bars_total = IntCounter::new("krait_bar_closes_total", "Bar closes consumed").unwrap();
        let dlq_total = IntCounterVec::new(
            prometheus::Opts::new("krait_dlq_total", "Messages routed to the dead-letter topic"),
            &["topic"],
        )
        .unwrap();
        let ws_events_total =
            IntCounter::new("krait_ws_events_total", "Private WS events ingested").unwrap();
        let loop_errors = IntCounterVec::new(
            prometheus::Opts::new("krait_loop_errors_total", "Errors per background loop"),
            &["loop"],
        )
        .unwrap();
        let equity_gauge =
            Gauge::new("krait_account_equity", "Last observed account equity").unwrap();
        let ws_connected = Gauge::new(
            "krait_private_ws_connected",
            "Private websocket connection state (1=connected)",
        )
        .unwrap();
        let stream_lag = GaugeVec::new(
            prometheus::Opts::new(
                "krait_stream_lag",
                "Unconsumed records behind the consumer group bookmark",
            ),
            &["topic"],
        )
        .unwrap();

        registry.register(Box::new(plans_total.clone())).unwrap();
        registry.register(Box::new(bars_total.clone())).unwrap();
        registry.register(Box::new(dlq_total.clone())).unwrap();
        registry.register(Box::new(ws_events_total.clone())).unwrap();
        registry.register(Box::new(loop_errors.clone())).unwrap();
        registry.register(Box::new(equity_gauge.clone())).unwrap();
        registry.register(Box::new(ws_connected.clone())).unwrap();
        registry.register(Box::new(stream_lag.clone())).unwrap();

        Self {
            registry,
            plans_total,
            bars_total,
            dlq_total,
            ws_events_total,
            loop_errors,
            equity_gauge,
            ws_connected,
            stream_lag,
        }
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn inc_plan(&self) {
        self.plans_total.inc();
    }

    pub fn inc_bar(&self) {
        self.bars_total.inc();
    }

    pub fn inc_dlq(&self, topic: &str) {
        self.dlq_total.with_label_values(&[topic]).inc();
    }

    pub fn inc_ws_event(&self) {
        self.ws_events_total.inc();
    }

    pub fn inc_loop_error(&self, name: &str) {
        self.loop_errors.with_label_values(&[name]).inc();
    }

    pub fn set_equity(&self, equity: f64) {
        self.equity_gauge.set(equity);
    }

    pub fn set_ws_connected(&self, connected: bool) {
        self.ws_connected.set(if connected { 1.0 } else { 0.0 });
    }

    pub fn set_stream_lag(&self, topic: &str, lag: u64) {
        self.stream_lag.with_label_values(&[topic]).set(lag as f64);
    }
}

impl Default for ExecutionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn render_metrics(registry: &Registry) -> Response<Body> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(error = %err, "failed to encode Prometheus metrics");
        return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics");
    }
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap()
}

fn render_health(mode: ExecutionMode) -> Response<Body> {
    let body = json!({
        "service": SERVICE_NAME,
        "execution_mode": mode.to_string(),
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message))
        .unwrap()
}

/// Serve `/metrics` (Prometheus exposition) and `/healthz` (service identity)
/// on the configured address.
pub fn spawn_metrics_server(
    registry: Registry,
    addr: SocketAddr,
    mode: ExecutionMode,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let response = match req.uri().path() {
                            "/metrics" if req.method() == Method::GET => {
                                render_metrics(&registry)
                            }
                            "/healthz" if req.method() == Method::GET => render_health(mode),
                            _ => plain_response(StatusCode::NOT_FOUND, "not found"),
                        };
                        Ok::<_, Infallible>(response)
                    }
                }))
            }
        });

        if let Err(err) = hyper::Server::bind(&addr).serve(make_svc).await {
            error!(error = %err, %addr, "metrics server terminated");
        } else {
            info!(%addr, "metrics server shutdown");
        }
    })
}
