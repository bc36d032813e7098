//! Periodic reconciliation of open positions against the venue.
//!
//! Every effect is a function of current venue + DB state: the loop detects
//! TP fills (REST fallback when the WS feed missed them), moves the stop to
//! break-even after TP1, applies runner trailing after TP2, checks WS/DB
//! consistency drift, and delegates stalled entries to the order manager.

use anyhow::Result;
use serde_json::json;
use tracing::{error, info, warn};

use krait_core::events::{ExecutionReport, ReportStatus, RiskEventType, Severity};
use krait_core::ids::now_ms;
use krait_core::{ExecutionMode, OrderPurpose, OrderStatus, Position, PositionStatus};

use crate::executor::decimal_f64;
use crate::order_manager::EntryOrderManager;
use crate::publisher::risk_event;
use crate::trail::tightens;
use crate::Services;

pub struct Reconciler {
    services: Services,
    order_manager: EntryOrderManager,
}

impl Reconciler {
    pub fn new(services: Services) -> Self {
        let order_manager = EntryOrderManager::new(services.clone());
        Self {
            services,
            order_manager,
        }
    }

    /// One reconciliation tick. Live mode only; paper state is managed by the
    /// matcher.
    pub async fn run_once(&self) -> Result<()> {
        if self.services.config.execution_mode != ExecutionMode::Live {
            return Ok(());
        }
        if let Err(err) = self.order_manager.run_once().await {
            error!(error = %err, "entry order manager tick failed");
        }
        for candidate in self.services.store.list_open_positions()? {
            let lock = self
                .services
                .position_locks
                .for_key(&candidate.idempotency_key);
            let _guard = lock.lock().await;
            // Re-read under the lock; another loop may have closed the row.
            let Some(position) = self
                .services
                .store
                .get_position_by_idem(&candidate.idempotency_key)?
            else {
                continue;
            };
            if position.status != PositionStatus::Open {
                continue;
            }
            if let Err(err) = self.reconcile_position(&position).await {
                warn!(
                    error = %err,
                    idempotency_key = %position.idempotency_key,
                    "position reconcile failed"
                );
            }
        }
        Ok(())
    }

    async fn reconcile_position(&self, position: &Position) -> Result<()> {
        let mut meta = position.meta.clone();
        let mut changed = false;
        let now = now_ms();

        self.check_consistency_drift(position, &mut meta, &mut changed)
            .await?;

        // Private REST polling is backed off while the WS feed is healthy.
        let mut need_poll = true;
        if self.services.config.ws.private_enabled {
            let interval = self.services.config.loops.open_orders_poll_interval_ms;
            if let Some(last_poll) = meta.open_orders_last_poll_ms {
                if now - last_poll < interval {
                    need_poll = false;
                }
            }
        }

        let mut tp1_filled = meta.tp1_filled;
        let mut tp2_filled = meta.tp2_filled;
        if need_poll {
            let read = self
                .services
                .venue
                .open_orders_degradable(&position.symbol)
                .await;
            match read {
                Ok(read) => {
                    if read.degraded {
                        let mut event = risk_event(
                            RiskEventType::RateLimit,
                            Severity::Important,
                            Some(&position.symbol),
                            [
                                ("context".to_string(), json!("reconcile.open_orders")),
                                ("degraded".to_string(), json!(true)),
                                ("stale_ms".to_string(), json!(read.stale_ms)),
                            ]
                            .into_iter()
                            .collect(),
                        );
                        event.retry_after_ms = Some(read.predicted_wait_ms as i64);
                        self.services.publisher.risk_event(&event).await?;
                    }
                    let tp1_link = format!("{}:TP1", position.idempotency_key);
                    let tp2_link = format!("{}:TP2", position.idempotency_key);
                    for order in &read.value {
                        if order.order_link_id == tp1_link && order.is_filled() {
                            tp1_filled = true;
                        }
                        if order.order_link_id == tp2_link && order.is_filled() {
                            tp2_filled = true;
                        }
                    }
                    self.alert_aged_orders(position, &read.value, &mut meta, &mut changed, now)
                        .await?;
                }
                Err(err) => {
                    warn!(error = %err, symbol = %position.symbol, "open orders poll failed");
                }
            }
            meta.open_orders_last_poll_ms = Some(now);
            changed = true;
        }

        if tp1_filled && !meta.tp1_filled {
            meta.tp1_filled = true;
            meta.tp1_filled_ms = Some(now);
            changed = true;
            self.mark_tp_order_filled(position, OrderPurpose::Tp1).await?;
        }
        if tp2_filled && !meta.tp2_filled {
            meta.tp2_filled = true;
            meta.tp2_filled_ms = Some(now);
            changed = true;
            self.mark_tp_order_filled(position, OrderPurpose::Tp2).await?;
        }

        // TP1 break-even must run even when the fill was learned over WS.
        if meta.tp1_filled && !meta.tp1_breakeven_applied {
            let stop = position.entry_price.normalize().to_string();
            match self
                .services
                .venue
                .set_trading_stop(&position.symbol, &stop)
                .await
            {
                Ok(()) => {
                    meta.tp1_breakeven_applied = true;
                    changed = true;
                    info!(
                        idempotency_key = %position.idempotency_key,
                        stop = %stop,
                        "stop moved to break-even after TP1"
                    );
                }
                Err(err) => {
                    self.venue_alert(&position.symbol, "reconcile.tp1_breakeven", &err)
                        .await?;
                }
            }
        }

        // After TP2 the runner stop is pushed live whenever it tightens.
        if meta.tp2_filled {
            if let Some(runner_stop) = position.runner_stop_price {
                if tightens(position.bias, meta.runner_sl_last_applied, runner_stop) {
                    let stop = runner_stop.normalize().to_string();
                    match self
                        .services
                        .venue
                        .set_trading_stop(&position.symbol, &stop)
                        .await
                    {
                        Ok(()) => {
                            meta.runner_sl_last_applied = Some(runner_stop);
                            meta.runner_sl_last_applied_ms = Some(now);
                            changed = true;
                        }
                        Err(err) => {
                            self.venue_alert(&position.symbol, "reconcile.runner_trail", &err)
                                .await?;
                        }
                    }
                }
            }
        }

        if changed {
            self.services
                .store
                .update_position_meta(&position.position_id, &meta)?;
        }
        Ok(())
    }

    /// Alert on venue orders sitting unfilled/partially filled beyond the
    /// entry timeout, at most once per alert window per order. Resolution is
    /// the order manager's job; this is the observability side.
    async fn alert_aged_orders(
        &self,
        position: &Position,
        open: &[krait_exchange::VenueOrder],
        meta: &mut krait_core::PositionMeta,
        changed: &mut bool,
        now: i64,
    ) -> Result<()> {
        let timeout_ms = self.services.config.entry.timeout_ms;
        let window_ms = self.services.config.loops.order_timeout_alert_window_ms;
        for order in open {
            let partial = order.order_status == "PartiallyFilled";
            if !partial && order.order_status != "New" {
                continue;
            }
            let Some(created) = order.created_time.parse::<i64>().ok().filter(|t| *t > 0) else {
                continue;
            };
            let age = now - created;
            if age < timeout_ms {
                continue;
            }
            let key = format!("order_age_alert_ms:{}", order.order_link_id);
            let last = meta.extra.get(&key).and_then(|v| v.as_i64()).unwrap_or(0);
            if last != 0 && now - last < window_ms {
                continue;
            }
            meta.extra.insert(key, json!(now));
            *changed = true;
            let event_type = if partial {
                RiskEventType::OrderPartialFill
            } else {
                RiskEventType::OrderTimeout
            };
            self.services
                .publisher
                .risk_event(&risk_event(
                    event_type,
                    Severity::Important,
                    Some(&position.symbol),
                    [
                        ("order_link_id".to_string(), json!(order.order_link_id)),
                        ("order_id".to_string(), json!(order.order_id)),
                        ("status".to_string(), json!(order.order_status)),
                        ("age_ms".to_string(), json!(age)),
                        ("cum_exec_qty".to_string(), json!(order.cum_exec_qty)),
                        ("context".to_string(), json!("reconcile.open_orders")),
                    ]
                    .into_iter()
                    .collect(),
                ))
                .await?;
        }
        Ok(())
    }

    async fn mark_tp_order_filled(
        &self,
        position: &Position,
        purpose: OrderPurpose,
    ) -> Result<()> {
        let Some(order) = self
            .services
            .store
            .get_order(&position.idempotency_key, purpose)?
        else {
            return Ok(());
        };
        self.services.store.update_order_from_venue(
            &order.order_id,
            OrderStatus::Filled,
            Some(order.qty),
            order.price,
            Some(now_ms()),
        )?;
        let mut report = ExecutionReport::new(
            &position.idempotency_key,
            &position.symbol,
            ReportStatus::TpHit,
        );
        report.order_id = Some(order.order_id.clone());
        report.timeframe = Some(position.timeframe);
        report.filled_qty = Some(decimal_f64(order.qty));
        report.avg_price = order.price.map(decimal_f64);
        report
            .detail
            .insert("purpose".into(), json!(purpose.as_str()));
        report.detail.insert("source".into(), json!("rest"));
        self.services.publisher.execution_report(&report).await
    }

    /// Compare the latest WS position snapshot with the local quantity and
    /// emit a windowed drift event above the threshold.
    async fn check_consistency_drift(
        &self,
        position: &Position,
        meta: &mut krait_core::PositionMeta,
        changed: &mut bool,
    ) -> Result<()> {
        let consistency = &self.services.config.consistency;
        if !consistency.enabled {
            return Ok(());
        }
        let Some(snapshot) = meta.ws_position.as_ref() else {
            return Ok(());
        };
        let Some(ws_size) = snapshot
            .get("size")
            .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_f64().map(|f| f.to_string())))
            .and_then(|s| s.parse::<f64>().ok())
        else {
            return Ok(());
        };
        let local = decimal_f64(position.qty_total);
        if local <= 0.0 {
            return Ok(());
        }
        let drift = (ws_size.abs() - local).abs() / local;
        if drift < consistency.drift_threshold_pct {
            return Ok(());
        }
        let emitted = self
            .services
            .publisher
            .risk_event(&risk_event(
                RiskEventType::ConsistencyDrift,
                Severity::Important,
                Some(&position.symbol),
                [
                    ("local_qty_total".to_string(), json!(local)),
                    ("ws_size".to_string(), json!(ws_size)),
                    ("drift_pct".to_string(), json!(drift)),
                    (
                        "threshold_pct".to_string(),
                        json!(consistency.drift_threshold_pct),
                    ),
                    (
                        "idempotency_key".to_string(),
                        json!(position.idempotency_key),
                    ),
                ]
                .into_iter()
                .collect(),
            ))
            .await?;
        if emitted {
            *changed = true;
            meta.extra
                .insert("consistency_drift_last_ms".into(), json!(now_ms()));
        }
        Ok(())
    }

    async fn venue_alert(
        &self,
        symbol: &str,
        context: &str,
        err: &krait_exchange::ExchangeError,
    ) -> Result<()> {
        let mut event = risk_event(
            if err.is_rate_limit() {
                RiskEventType::RateLimit
            } else {
                RiskEventType::RiskRejected
            },
            Severity::Important,
            Some(symbol),
            [
                ("context".to_string(), json!(context)),
                ("error".to_string(), json!(err.to_string())),
            ]
            .into_iter()
            .collect(),
        );
        event.retry_after_ms = err.retry_after_ms();
        self.services.publisher.risk_event(&event).await?;
        Ok(())
    }
}

/// Drift fraction helper shared with tests.
#[must_use]
pub fn drift_fraction(ws_size: f64, local: f64) -> Option<f64> {
    if local <= 0.0 {
        return None;
    }
    Some((ws_size.abs() - local).abs() / local)
}
