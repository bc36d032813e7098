//! Long-running loops and the shared shutdown signal.
//!
//! One tokio task per logical loop; tasks communicate only through the store
//! and the bus, so each is independently restartable. Consumers use bounded
//! block timeouts so shutdown is honored promptly, and a failed record is
//! dead-lettered and acked rather than wedging the group.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use krait_bus::{EventLog, RedisEventLog, StreamRecord};
use krait_core::events::{topics, RiskEventType, Severity};
use krait_exchange::ws::{spawn_private_stream, PrivateStreamConfig};
use krait_exchange::BybitCredentials;
use krait_execution::publisher::risk_event;
use krait_execution::{
    BarCloseHandler, PositionSync, Reconciler, RiskMonitor, Services, Snapshotter,
    TradePlanExecutor, WsIngest,
};

use crate::telemetry::ExecutionMetrics;

/// Cooperative shutdown: Ctrl-C or an explicit trigger.
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let flag_clone = flag.clone();
        let notify_clone = notify.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                flag_clone.store(true, Ordering::SeqCst);
                notify_clone.notify_waiters();
            }
        });
        Self { flag, notify }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        if self.triggered() {
            return;
        }
        self.notify.notified().await;
    }

    /// Sleep that returns false when shutdown fired first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.notify.notified() => false,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            flag: self.flag.clone(),
            notify: self.notify.clone(),
        }
    }
}

const CONSUME_BLOCK_MS: u64 = 2_000;

pub fn spawn_trade_plan_consumer(
    log: Arc<RedisEventLog>,
    services: Services,
    executor: Arc<TradePlanExecutor>,
    metrics: Arc<ExecutionMetrics>,
    shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    let group = services.config.stream_group.clone();
    let consumer = format!("{}-tradeplan", services.config.stream_consumer);
    tokio::spawn(async move {
        if let Err(err) = log.ensure_group(topics::TRADE_PLAN, &group).await {
            error!(error = %err, "trade_plan group setup failed");
            return;
        }
        while !shutdown.triggered() {
            let batch = match log
                .consume(topics::TRADE_PLAN, &group, &consumer, 20, CONSUME_BLOCK_MS)
                .await
            {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(error = %err, "trade_plan consume failed");
                    metrics.inc_loop_error("trade_plan");
                    if !shutdown.sleep(Duration::from_secs(1)).await {
                        break;
                    }
                    continue;
                }
            };
            dead_letter_malformed(&log, &metrics, &group, batch.malformed).await;
            if batch.records.is_empty() {
                observe_lag(&log, &metrics, topics::TRADE_PLAN, &group).await;
            }
            for record in batch.records {
                metrics.inc_plan();
                alert_processing_lag(&services, &record).await;
                if let Err(err) = executor.handle_envelope(&record.envelope).await {
                    warn!(error = %err, record_id = %record.record_id, "trade plan handling failed");
                    metrics.inc_dlq(topics::TRADE_PLAN);
                    let raw =
                        serde_json::to_value(&record.envelope).unwrap_or(serde_json::Value::Null);
                    let _ = log
                        .publish_dead_letter(
                            topics::TRADE_PLAN,
                            &record.record_id,
                            &err.to_string(),
                            raw,
                        )
                        .await;
                }
                ack(&log, &group, &record).await;
            }
        }
        info!("trade_plan consumer stopped");
    })
}

pub fn spawn_bar_close_consumer(
    log: Arc<RedisEventLog>,
    services: Services,
    handler: Arc<BarCloseHandler>,
    metrics: Arc<ExecutionMetrics>,
    shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    let group = services.config.stream_group.clone();
    let consumer = format!("{}-barclose", services.config.stream_consumer);
    tokio::spawn(async move {
        if let Err(err) = log.ensure_group(topics::BAR_CLOSE, &group).await {
            error!(error = %err, "bar_close group setup failed");
            return;
        }
        while !shutdown.triggered() {
            let batch = match log
                .consume(topics::BAR_CLOSE, &group, &consumer, 200, CONSUME_BLOCK_MS)
                .await
            {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(error = %err, "bar_close consume failed");
                    metrics.inc_loop_error("bar_close");
                    if !shutdown.sleep(Duration::from_secs(1)).await {
                        break;
                    }
                    continue;
                }
            };
            dead_letter_malformed(&log, &metrics, &group, batch.malformed).await;
            if batch.records.is_empty() {
                observe_lag(&log, &metrics, topics::BAR_CLOSE, &group).await;
            }
            for record in batch.records {
                metrics.inc_bar();
                alert_processing_lag(&services, &record).await;
                if let Err(err) = handler.handle_envelope(&record.envelope).await {
                    warn!(error = %err, record_id = %record.record_id, "bar close handling failed");
                    metrics.inc_dlq(topics::BAR_CLOSE);
                    let raw =
                        serde_json::to_value(&record.envelope).unwrap_or(serde_json::Value::Null);
                    let _ = log
                        .publish_dead_letter(
                            topics::BAR_CLOSE,
                            &record.record_id,
                            &err.to_string(),
                            raw,
                        )
                        .await;
                }
                ack(&log, &group, &record).await;
            }
        }
        info!("bar_close consumer stopped");
    })
}

/// Sample group lag and the pending (delivered, unacked) count while idle.
async fn observe_lag(log: &RedisEventLog, metrics: &ExecutionMetrics, topic: &str, group: &str) {
    let lag = log.group_lag(topic, group).await.unwrap_or(0);
    let pending = log.pending_count(topic, group).await.unwrap_or(0);
    metrics.set_stream_lag(topic, lag + pending);
}

async fn ack(log: &RedisEventLog, group: &str, record: &StreamRecord) {
    if let Err(err) = log.ack(&record.topic, group, &record.record_id).await {
        warn!(error = %err, record_id = %record.record_id, "ack failed");
    }
}

async fn dead_letter_malformed(
    log: &RedisEventLog,
    metrics: &ExecutionMetrics,
    group: &str,
    malformed: Vec<krait_bus::MalformedRecord>,
) {
    for record in malformed {
        metrics.inc_dlq(&record.topic);
        let _ = log
            .publish_dead_letter(&record.topic, &record.record_id, &record.reason, record.raw)
            .await;
        if let Err(err) = log.ack(&record.topic, group, &record.record_id).await {
            warn!(error = %err, record_id = %record.record_id, "malformed record ack failed");
        }
    }
}

async fn alert_processing_lag(services: &Services, record: &StreamRecord) {
    let lag = krait_bus::envelope_lag_ms(&record.envelope);
    if lag <= services.config.loops.processing_lag_alert_ms {
        return;
    }
    let event = risk_event(
        RiskEventType::ProcessingLag,
        Severity::Important,
        None,
        [
            ("topic".to_string(), json!(record.topic)),
            ("lag_ms".to_string(), json!(lag)),
            ("record_id".to_string(), json!(record.record_id)),
        ]
        .into_iter()
        .collect(),
    );
    if let Err(err) = services.publisher.risk_event(&event).await {
        warn!(error = %err, "processing lag alert failed");
    }
}

/// Generic fixed-interval loop driver.
pub fn spawn_interval_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    metrics: Arc<ExecutionMetrics>,
    shutdown: ShutdownSignal,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        loop {
            if let Err(err) = tick().await {
                warn!(error = %err, name, "loop tick failed");
                metrics.inc_loop_error(name);
            }
            if !shutdown.sleep(interval).await {
                break;
            }
        }
        info!(name, "loop stopped");
    })
}

pub fn spawn_background_loops(
    services: &Services,
    executor: Arc<TradePlanExecutor>,
    metrics: Arc<ExecutionMetrics>,
    shutdown: &ShutdownSignal,
) -> Vec<JoinHandle<()>> {
    let loops = &services.config.loops;
    let mut handles = Vec::new();

    let reconciler = Arc::new(Reconciler::new(services.clone()));
    handles.push(spawn_interval_loop(
        "reconcile",
        Duration::from_secs(loops.reconcile_interval_secs),
        metrics.clone(),
        shutdown.clone(),
        move || {
            let reconciler = reconciler.clone();
            async move { reconciler.run_once().await }
        },
    ));

    let position_sync = Arc::new(PositionSync::new(services.clone()));
    handles.push(spawn_interval_loop(
        "position_sync",
        Duration::from_secs(loops.position_sync_interval_secs),
        metrics.clone(),
        shutdown.clone(),
        move || {
            let position_sync = position_sync.clone();
            async move { position_sync.run_once().await }
        },
    ));

    let risk_monitor = Arc::new(RiskMonitor::new(services.clone(), executor));
    handles.push(spawn_interval_loop(
        "risk_monitor",
        Duration::from_secs(loops.risk_monitor_interval_secs),
        metrics.clone(),
        shutdown.clone(),
        move || {
            let risk_monitor = risk_monitor.clone();
            async move { risk_monitor.run_once().await }
        },
    ));

    let snapshotter = Arc::new(Snapshotter::new(services.clone()));
    handles.push(spawn_interval_loop(
        "snapshotter",
        Duration::from_secs(loops.snapshot_interval_secs),
        metrics,
        shutdown.clone(),
        move || {
            let snapshotter = snapshotter.clone();
            async move { snapshotter.run_once().await }
        },
    ));

    handles
}

pub fn spawn_ws_ingest(
    services: Services,
    metrics: Arc<ExecutionMetrics>,
    shutdown: ShutdownSignal,
) -> Option<JoinHandle<()>> {
    let config = &services.config;
    if !config.ws.private_enabled || config.execution_mode != krait_core::ExecutionMode::Live {
        info!("private ws ingest disabled");
        return None;
    }
    if config.bybit.api_key.is_empty() || config.bybit.api_secret.is_empty() {
        warn!("private ws enabled but credentials missing; ingest disabled");
        return None;
    }
    let stream_config = PrivateStreamConfig {
        ws_url: config.bybit.ws_url.clone(),
        credentials: BybitCredentials {
            api_key: config.bybit.api_key.clone(),
            api_secret: config.bybit.api_secret.clone(),
        },
        subscriptions: config.ws.subscriptions.clone(),
    };
    let ingest = WsIngest::new(services);
    Some(tokio::spawn(async move {
        let (mut rx, stream_task) = spawn_private_stream(stream_config);
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    metrics.inc_ws_event();
                    match &event {
                        krait_exchange::ws::PrivateEvent::Connected { .. } => {
                            metrics.set_ws_connected(true);
                        }
                        krait_exchange::ws::PrivateEvent::Disconnected { .. } => {
                            metrics.set_ws_connected(false);
                        }
                        _ => {}
                    }
                    if let Err(err) = ingest.handle_event(event).await {
                        warn!(error = %err, "ws event handling failed");
                        metrics.inc_loop_error("ws_ingest");
                    }
                }
                _ = shutdown.wait() => break,
            }
        }
        stream_task.abort();
        info!("ws ingest stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signal_interrupts_sleep() {
        let shutdown = ShutdownSignal::new();
        assert!(!shutdown.triggered());
        assert!(shutdown.sleep(Duration::from_millis(1)).await);

        shutdown.trigger();
        assert!(shutdown.triggered());
        assert!(!shutdown.sleep(Duration::from_secs(60)).await);
        // wait() returns immediately once triggered.
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn shutdown_clone_shares_state() {
        let shutdown = ShutdownSignal::new();
        let clone = shutdown.clone();
        shutdown.trigger();
        assert!(clone.triggered());
    }
}
