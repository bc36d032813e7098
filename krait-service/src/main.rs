//! Execution-core service entry point.
//!
//! Wires the service container (store, bus, venue client, publisher), runs
//! one recovery pass (reconcile + position sync) to converge any state left
//! over from a crash, then starts the consumer and maintenance loops.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use krait_bus::{EventLog, PlanLock, RedisEventLog};
use krait_core::ExecutionMode;
use krait_exchange::{
    BucketConfig, BybitClient, BybitConfig, BybitCredentials, LimiterConfig, RateLimiter,
};
use krait_execution::{
    BarCloseHandler, PositionSync, Reconciler, Services, TradePlanExecutor,
};
use krait_store::Store;

mod runtime;
mod telemetry;

use runtime::ShutdownSignal;
use telemetry::ExecutionMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let env = std::env::var("KRAIT_ENV").ok();
    let config = Arc::new(krait_config::load_config(env.as_deref()).context("load config")?);
    telemetry::init_tracing(&config)?;
    info!(
        mode = %config.execution_mode,
        database = %config.database_path.display(),
        "execution service starting"
    );

    if let Some(dir) = config.database_path.parent() {
        std::fs::create_dir_all(dir).context("create data directory")?;
    }
    let store = Arc::new(Store::open(&config.database_path).context("open store")?);

    let log = Arc::new(
        RedisEventLog::connect(&config.redis_url)
            .await
            .context("connect redis")?,
    );

    let limiter = Arc::new(RateLimiter::new(limiter_config(&config)));
    let credentials = (!config.bybit.api_key.is_empty()).then(|| BybitCredentials {
        api_key: config.bybit.api_key.clone(),
        api_secret: config.bybit.api_secret.clone(),
    });
    let venue = Arc::new(
        BybitClient::new(
            BybitConfig {
                rest_url: config.bybit.rest_url.clone(),
                ws_url: config.bybit.ws_url.clone(),
                category: config.bybit.category.clone(),
                recv_window_ms: config.bybit.recv_window_ms,
                account_type: config.bybit.account_type.clone(),
                position_idx: config.bybit.position_idx,
                ..BybitConfig::default()
            },
            credentials,
            limiter,
        )
        .context("build venue client")?,
    );

    let services = Services::new(
        config.clone(),
        store,
        venue,
        log.clone() as Arc<dyn EventLog>,
    );

    // Duplicate trade_plan deliveries across instances serialize on a
    // distributed plan lock; paper/backtest relies on DB idempotency alone.
    let plan_lock = if config.execution_mode == ExecutionMode::Live {
        match PlanLock::connect(&config.redis_url, config.gates.plan_lock_ttl_ms).await {
            Ok(lock) => Some(lock),
            Err(err) => {
                warn!(error = %err, "plan lock unavailable; relying on store idempotency");
                None
            }
        }
    } else {
        None
    };
    let executor = Arc::new(TradePlanExecutor::new(services.clone(), plan_lock));
    let bar_handler = Arc::new(BarCloseHandler::new(services.clone(), executor.clone()));

    // Crash recovery: converge open state once before the loops start.
    if config.execution_mode == ExecutionMode::Live {
        info!("running startup recovery pass");
        if let Err(err) = Reconciler::new(services.clone()).run_once().await {
            warn!(error = %err, "startup reconcile failed");
        }
        if let Err(err) = PositionSync::new(services.clone()).run_once().await {
            warn!(error = %err, "startup position sync failed");
        }
    }

    let metrics = Arc::new(ExecutionMetrics::new());
    let metrics_addr = config
        .metrics_addr
        .parse()
        .context("parse metrics address")?;
    let metrics_task =
        telemetry::spawn_metrics_server(metrics.registry(), metrics_addr, config.execution_mode);

    let shutdown = ShutdownSignal::new();
    let mut tasks = vec![
        runtime::spawn_trade_plan_consumer(
            log.clone(),
            services.clone(),
            executor.clone(),
            metrics.clone(),
            shutdown.clone(),
        ),
        runtime::spawn_bar_close_consumer(
            log.clone(),
            services.clone(),
            bar_handler,
            metrics.clone(),
            shutdown.clone(),
        ),
    ];
    tasks.extend(runtime::spawn_background_loops(
        &services,
        executor,
        metrics.clone(),
        &shutdown,
    ));
    if let Some(handle) = runtime::spawn_ws_ingest(services, metrics, shutdown.clone()) {
        tasks.push(handle);
    }

    info!("execution service running");
    shutdown.wait().await;
    info!("shutdown requested; draining loops");
    for task in tasks {
        if let Err(err) = task.await {
            warn!(error = %err, "loop join failed");
        }
    }
    metrics_task.abort();
    info!("execution service stopped");
    Ok(())
}

fn limiter_config(config: &krait_config::AppConfig) -> LimiterConfig {
    let mut limiter = LimiterConfig::default();
    let overrides = &config.rate_limit;
    if let Some(rps) = overrides.public_rps {
        limiter.public = BucketConfig::new(rps, rps * 2.0);
    }
    if let Some(rps) = overrides.private_critical_rps {
        limiter.private_critical = BucketConfig::new(rps, rps * 2.0);
    }
    if let Some(rps) = overrides.private_order_query_rps {
        limiter.private_order_query = BucketConfig::new(rps, rps * 2.0);
    }
    if let Some(rps) = overrides.private_account_query_rps {
        limiter.private_account_query = BucketConfig::new(rps, rps * 2.0);
    }
    if let Some(max_wait) = overrides.max_wait_ms {
        limiter.max_wait_ms = max_wait;
    }
    limiter
}
