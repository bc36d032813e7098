//! Trade-plan executor: admission gates, sizing, position opening, and the
//! forced market-exit path shared by the mutex upgrade, the secondary rule
//! and the hard-halt circuit.

use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use krait_bus::PlanLock;
use krait_config::EntryOrderType;
use krait_core::events::{
    Envelope, ExecutionReport, ReportStatus, RiskEventType, Severity,
};
use krait_core::ids::{derived_id, now_ms, utc_trade_date};
use krait_core::{
    ExecutionMode, ExitReason, Order, OrderPurpose, OrderStatus, OrderType, Position,
    PositionMeta, PositionStatus, TradePlan,
};
use krait_exchange::{ExchangeError, OrderParams};

use crate::gates::{self, GateDecision, Rejection};
use crate::paper::{realized_pnl_usdt, weighted_avg_exit};
use crate::publisher::risk_event;
use crate::sizing::{self, Filters};
use crate::Services;

pub struct TradePlanExecutor {
    services: Services,
    lock: Option<PlanLock>,
}

impl TradePlanExecutor {
    pub fn new(services: Services, lock: Option<PlanLock>) -> Self {
        Self { services, lock }
    }

    /// Entry point for one `trade_plan` envelope. Decode failures bubble up
    /// so the consumer loop can dead-letter the record.
    pub async fn handle_envelope(&self, envelope: &Envelope) -> Result<()> {
        let plan: TradePlan = envelope.decode().context("decode trade_plan payload")?;
        self.execute(&plan).await
    }

    pub async fn execute(&self, plan: &TradePlan) -> Result<()> {
        if plan.idempotency_key.is_empty() {
            let report = ExecutionReport::new("", &plan.symbol, ReportStatus::OrderRejected)
                .with_reason("MISSING_IDEMPOTENCY_KEY");
            self.services.publisher.execution_report(&report).await?;
            return Ok(());
        }
        // Business idempotency: an admitted key already has its position row.
        if self
            .services
            .store
            .get_position_by_idem(&plan.idempotency_key)?
            .is_some()
        {
            debug!(idempotency_key = %plan.idempotency_key, "plan already admitted; duplicate delivery");
            return Ok(());
        }
        let guard = match &self.lock {
            Some(lock) => match lock.acquire(&plan.idempotency_key).await? {
                Some(guard) => Some(guard),
                None => return Ok(()),
            },
            None => None,
        };
        let result = self.execute_admitted(plan).await;
        if let (Some(lock), Some(guard)) = (&self.lock, guard) {
            lock.release(guard).await;
        }
        result
    }

    async fn execute_admitted(&self, plan: &TradePlan) -> Result<()> {
        let config = &self.services.config;
        let store = &self.services.store;
        let now = now_ms();
        let gate_now = plan.close_time_ms.filter(|t| *t > 0).unwrap_or(now);

        if let GateDecision::Reject(rejection) = gates::kill_switch_gate(store, &config.risk)? {
            return self.reject(plan, rejection).await;
        }
        if let GateDecision::Reject(rejection) = gates::expiry_gate(plan, now) {
            return self.reject(plan, rejection).await;
        }
        if let GateDecision::Reject(rejection) =
            gates::risk_circuit_gate(store, &config.risk, &config.execution_mode.to_string())?
        {
            return self.reject(plan, rejection).await;
        }
        if let GateDecision::Reject(rejection) =
            gates::cooldown_gate(store, &config.gates, plan, gate_now)?
        {
            return self.reject(plan, rejection).await;
        }
        if let GateDecision::Reject(rejection) = gates::max_positions_gate(store, &config.gates)? {
            return self.reject(plan, rejection).await;
        }
        match gates::mutex_gate(store, &config.gates, plan)? {
            GateDecision::Reject(rejection) => return self.reject(plan, rejection).await,
            GateDecision::Upgrade(existing) => {
                if !self.upgrade_mutex(plan, &existing, gate_now).await? {
                    return Ok(());
                }
            }
            GateDecision::Pass => {}
        }

        self.open_position(plan, gate_now).await
    }

    /// Force-close the lower-priority position before opening. Returns false
    /// when the incoming plan was rejected instead.
    async fn upgrade_mutex(
        &self,
        plan: &TradePlan,
        existing: &Position,
        gate_now: i64,
    ) -> Result<bool> {
        let closed = self
            .close_position_market(
                &existing.idempotency_key,
                Some(sizing::dec(plan.entry_price)),
                Some(gate_now),
                ExitReason::MutexUpgrade,
            )
            .await;
        if let Err(err) = closed {
            warn!(error = %err, "mutex upgrade close failed; blocking incoming plan");
            self.reject(
                plan,
                Rejection {
                    reason: RiskEventType::PositionMutexBlocked,
                    severity: Severity::Important,
                    detail: [
                        ("reason".to_string(), json!("mutex_upgrade_close_failed")),
                        ("error".to_string(), json!(err.to_string())),
                    ]
                    .into_iter()
                    .collect(),
                },
            )
            .await?;
            return Ok(false);
        }
        // In live mode the exit is asynchronous: give it one reconciliation
        // tick to complete, then refuse to overlap positions.
        if self.services.config.execution_mode == ExecutionMode::Live {
            let deadline = self.services.config.loops.reconcile_interval_secs.max(1);
            let mut settled = false;
            for _ in 0..deadline {
                tokio::time::sleep(Duration::from_secs(1)).await;
                match self.services.venue.position_size(&plan.symbol).await {
                    Ok(size) if size <= f64::EPSILON => {
                        settled = true;
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "mutex exit poll failed"),
                }
            }
            if !settled {
                self.reject(
                    plan,
                    Rejection {
                        reason: RiskEventType::PositionMutexBlocked,
                        severity: Severity::Important,
                        detail: [(
                            "reason".to_string(),
                            json!("mutex_upgrade_exit_incomplete"),
                        )]
                        .into_iter()
                        .collect(),
                    },
                )
                .await?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn open_position(&self, plan: &TradePlan, gate_now: i64) -> Result<()> {
        let config = &self.services.config;
        let mode = config.execution_mode;
        let symbol = plan.symbol.clone();

        let filters: Filters = if mode.is_simulated() {
            Filters::default()
        } else {
            match self.services.venue.instrument_filters(&symbol).await {
                Ok(raw) => raw.into(),
                Err(err) => {
                    warn!(error = %err, symbol = %symbol, "instruments-info failed; using conservative filters");
                    Filters::default()
                }
            }
        };

        let equity = self.equity().await?;
        let entry = sizing::dec(plan.entry_price);
        let stop = sizing::dec(plan.primary_sl_price);
        let risk_pct = plan
            .risk_pct
            .map(sizing::dec)
            .unwrap_or_else(|| sizing::dec(config.sizing.risk_pct));

        let qty_total = sizing::calc_qty(equity, risk_pct, entry, stop, &config.sizing, &filters);
        if qty_total <= Decimal::ZERO {
            return self
                .reject(
                    plan,
                    Rejection {
                        reason: RiskEventType::OrderValueTooSmall,
                        severity: Severity::Important,
                        detail: [
                            ("equity".to_string(), json!(equity.to_string())),
                            ("risk_pct".to_string(), json!(risk_pct.to_string())),
                            ("entry".to_string(), json!(plan.entry_price)),
                            ("sl".to_string(), json!(plan.primary_sl_price)),
                        ]
                        .into_iter()
                        .collect(),
                    },
                )
                .await;
        }

        let (tp1_qty, tp2_qty, runner_qty) = sizing::split_tp_qty(qty_total, filters.qty_step);
        let (tp1_price, tp2_price) = sizing::tp_prices(plan.side, entry, stop, filters.tick_size);
        let idem = plan.idempotency_key.clone();
        let run_id = plan.run_id();

        let mut meta = PositionMeta {
            run_id: run_id.clone(),
            qty_open: Some(qty_total),
            mode: Some(mode.to_string()),
            ..PositionMeta::default()
        };
        meta.extra
            .insert("tp1_price".into(), json!(tp1_price.to_string()));
        meta.extra
            .insert("tp2_price".into(), json!(tp2_price.to_string()));

        let position = Position {
            position_id: derived_id("pos", &idem),
            idempotency_key: idem.clone(),
            symbol: symbol.clone(),
            timeframe: plan.timeframe,
            side: plan.side,
            bias: plan.resolved_bias(),
            qty_total,
            qty_runner: runner_qty,
            entry_price: entry,
            primary_sl_price: stop,
            runner_stop_price: Some(stop),
            status: PositionStatus::Open,
            entry_close_time_ms: gate_now,
            opened_at_ms: gate_now,
            closed_at_ms: None,
            exit_reason: None,
            secondary_rule_checked: false,
            hist_entry: plan.hist_entry,
            meta,
        };
        self.services.store.upsert_position(&position)?;

        if mode.is_simulated() {
            self.open_paper_entry(plan, &position).await?;
        } else {
            self.open_live_entry(plan, &position).await?;
        }

        // Reduce-only take profits, 40% each.
        self.submit_tp(&position, OrderPurpose::Tp1, tp1_qty, tp1_price)
            .await?;
        self.submit_tp(&position, OrderPurpose::Tp2, tp2_qty, tp2_price)
            .await?;

        info!(
            idempotency_key = %idem,
            symbol = %symbol,
            side = %plan.side,
            qty = %qty_total,
            entry = %entry,
            sl = %stop,
            tp1 = %tp1_price,
            tp2 = %tp2_price,
            mode = %mode,
            "position opened"
        );
        Ok(())
    }

    async fn open_paper_entry(&self, plan: &TradePlan, position: &Position) -> Result<()> {
        let idem = &position.idempotency_key;
        let order_id = derived_id("entry", idem);
        let order = Order {
            order_id: order_id.clone(),
            idempotency_key: idem.clone(),
            symbol: position.symbol.clone(),
            purpose: OrderPurpose::Entry,
            side: position.side,
            order_type: OrderType::Market,
            qty: position.qty_total,
            price: None,
            reduce_only: false,
            status: OrderStatus::Filled,
            venue_order_id: Some(order_id.clone()),
            venue_order_link_id: Some(format!("{idem}:ENTRY")),
            filled_qty: position.qty_total,
            avg_price: Some(position.entry_price),
            submitted_at_ms: Some(position.opened_at_ms),
            retry_count: 0,
            last_fill_at_ms: Some(position.opened_at_ms),
            payload: json!({
                "mode": self.services.config.execution_mode.to_string(),
                "fill_price": plan.entry_price,
            }),
        };
        self.services.store.upsert_order(&order)?;

        let mut report = ExecutionReport::new(idem, &position.symbol, ReportStatus::Filled);
        report.plan_id = plan.plan_id.clone();
        report.order_id = Some(order_id);
        report.timeframe = Some(position.timeframe);
        report.filled_qty = Some(decimal_f64(position.qty_total));
        report.avg_price = Some(plan.entry_price);
        report.latency_ms = Some(0);
        report.slippage_bps = Some(0.0);
        report.fill_ratio = Some(1.0);
        report.detail.insert("side".into(), json!(plan.side));
        report
            .detail
            .insert("sl".into(), json!(plan.primary_sl_price));
        if let Some(run_id) = plan.run_id() {
            report.ext.insert("run_id".into(), json!(run_id));
        }
        self.services.publisher.execution_report(&report).await
    }

    async fn open_live_entry(&self, plan: &TradePlan, position: &Position) -> Result<()> {
        let config = &self.services.config;
        let idem = &position.idempotency_key;
        let entry_type = match config.entry.order_type {
            EntryOrderType::Limit => OrderType::Limit,
            EntryOrderType::Market => OrderType::Market,
        };
        let link = match entry_type {
            OrderType::Limit => format!("{idem}:ENTRY:0"),
            OrderType::Market => format!("{idem}:ENTRY"),
        };
        let params = OrderParams {
            symbol: position.symbol.clone(),
            side: position.side,
            order_type: entry_type,
            qty: position.qty_total.normalize().to_string(),
            price: (entry_type == OrderType::Limit)
                .then(|| position.entry_price.normalize().to_string()),
            time_in_force: match entry_type {
                OrderType::Limit => krait_core::TimeInForce::GoodTilCanceled,
                OrderType::Market => krait_core::TimeInForce::ImmediateOrCancel,
            },
            reduce_only: false,
            order_link_id: link.clone(),
        };
        let created = match self.services.venue.place_order(params).await {
            Ok(created) => created,
            Err(err) => return self.handle_entry_failure(plan, position, err).await,
        };

        let submitted_at = now_ms();
        let order = Order {
            order_id: derived_id("entry", idem),
            idempotency_key: idem.clone(),
            symbol: position.symbol.clone(),
            purpose: OrderPurpose::Entry,
            side: position.side,
            order_type: entry_type,
            qty: position.qty_total,
            price: (entry_type == OrderType::Limit).then_some(position.entry_price),
            reduce_only: false,
            status: OrderStatus::Submitted,
            venue_order_id: Some(created.order_id.clone()),
            venue_order_link_id: Some(link),
            filled_qty: Decimal::ZERO,
            avg_price: None,
            submitted_at_ms: Some(submitted_at),
            retry_count: 0,
            last_fill_at_ms: None,
            payload: json!({
                "mode": "LIVE",
                "base_price": plan.entry_price,
            }),
        };
        self.services.store.upsert_order(&order)?;

        // Initial stop-loss via venue trading stop; failure alerts, does not
        // abort the entry (reconciliation re-applies it).
        if let Err(err) = self
            .services
            .venue
            .set_trading_stop(
                &position.symbol,
                &position.primary_sl_price.normalize().to_string(),
            )
            .await
        {
            self.alert_venue_error(&position.symbol, "set_trading_stop", &err)
                .await?;
        }

        let mut report =
            ExecutionReport::new(idem, &position.symbol, ReportStatus::OrderSubmitted);
        report.plan_id = plan.plan_id.clone();
        report.order_id = Some(order.order_id.clone());
        report.timeframe = Some(position.timeframe);
        report.detail.insert("purpose".into(), json!("ENTRY"));
        report
            .detail
            .insert("order_type".into(), json!(entry_type.as_venue()));
        if let Some(run_id) = plan.run_id() {
            report.ext.insert("run_id".into(), json!(run_id));
        }
        self.services.publisher.execution_report(&report).await
    }

    /// Venue rejected the entry outright: roll the position back.
    async fn handle_entry_failure(
        &self,
        plan: &TradePlan,
        position: &Position,
        err: ExchangeError,
    ) -> Result<()> {
        warn!(error = %err, symbol = %position.symbol, "entry placement rejected by venue");
        if err.is_rate_limit() {
            let mut event = risk_event(
                RiskEventType::RateLimit,
                Severity::Important,
                Some(&position.symbol),
                [("endpoint".to_string(), json!("/v5/order/create"))]
                    .into_iter()
                    .collect(),
            );
            event.retry_after_ms = err.retry_after_ms();
            self.services.publisher.risk_event(&event).await?;
        }
        let mut failed = position.clone();
        failed.status = PositionStatus::Failed;
        failed.closed_at_ms = Some(now_ms());
        failed.exit_reason = Some(ExitReason::EntryFailed);
        self.services.store.upsert_position(&failed)?;

        let mut report = ExecutionReport::new(
            &position.idempotency_key,
            &position.symbol,
            ReportStatus::OrderRejected,
        )
        .with_reason(&err.to_string());
        report.plan_id = plan.plan_id.clone();
        report.timeframe = Some(position.timeframe);
        self.services.publisher.execution_report(&report).await
    }

    async fn submit_tp(
        &self,
        position: &Position,
        purpose: OrderPurpose,
        qty: Decimal,
        price: Decimal,
    ) -> Result<()> {
        if qty <= Decimal::ZERO {
            return Ok(());
        }
        let idem = &position.idempotency_key;
        let live = !self.services.config.execution_mode.is_simulated();
        let link = format!("{idem}:{}", purpose.as_str());
        let mut venue_order_id = None;
        let mut status = OrderStatus::Submitted;

        if live {
            let params = OrderParams {
                symbol: position.symbol.clone(),
                side: position.side.inverse(),
                order_type: OrderType::Limit,
                qty: qty.normalize().to_string(),
                price: Some(price.normalize().to_string()),
                time_in_force: krait_core::TimeInForce::GoodTilCanceled,
                reduce_only: true,
                order_link_id: link.clone(),
            };
            match self.services.venue.place_order(params).await {
                Ok(created) => venue_order_id = Some(created.order_id),
                Err(err) => {
                    self.alert_venue_error(&position.symbol, "tp_place", &err)
                        .await?;
                    status = OrderStatus::Failed;
                }
            }
        } else {
            venue_order_id = Some(derived_id(&purpose.as_str().to_lowercase(), idem));
        }

        let order = Order {
            order_id: derived_id(&purpose.as_str().to_lowercase(), idem),
            idempotency_key: idem.clone(),
            symbol: position.symbol.clone(),
            purpose,
            side: position.side.inverse(),
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            reduce_only: true,
            status,
            venue_order_id,
            venue_order_link_id: Some(link),
            filled_qty: Decimal::ZERO,
            avg_price: None,
            submitted_at_ms: Some(now_ms()),
            retry_count: 0,
            last_fill_at_ms: None,
            payload: json!({
                "tp_price": price.normalize().to_string(),
                "tp_qty": qty.normalize().to_string(),
            }),
        };
        self.services.store.upsert_order(&order)?;
        Ok(())
    }

    async fn reject(&self, plan: &TradePlan, rejection: Rejection) -> Result<()> {
        let mut detail = rejection.detail.clone();
        detail.insert(
            "idempotency_key".into(),
            json!(plan.idempotency_key.clone()),
        );
        let event = risk_event(
            rejection.reason,
            rejection.severity,
            Some(&plan.symbol),
            detail,
        );
        self.services.publisher.risk_event(&event).await?;

        let mut report = ExecutionReport::new(
            &plan.idempotency_key,
            &plan.symbol,
            ReportStatus::OrderRejected,
        )
        .with_reason(rejection.reason.as_str());
        report.plan_id = plan.plan_id.clone();
        report.timeframe = Some(plan.timeframe);
        for (key, value) in rejection.detail {
            report.detail.insert(key, value);
        }
        if let Some(run_id) = plan.run_id() {
            report.ext.insert("run_id".into(), json!(run_id));
        }
        self.services.publisher.execution_report(&report).await?;
        info!(
            idempotency_key = %plan.idempotency_key,
            reason = rejection.reason.as_str(),
            "trade plan rejected"
        );
        Ok(())
    }

    async fn alert_venue_error(
        &self,
        symbol: &str,
        stage: &str,
        err: &ExchangeError,
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
                ("stage".to_string(), json!(stage)),
                ("error".to_string(), json!(err.to_string())),
            ]
            .into_iter()
            .collect(),
        );
        event.retry_after_ms = err.retry_after_ms();
        self.services.publisher.risk_event(&event).await?;
        Ok(())
    }

    async fn equity(&self) -> Result<Decimal> {
        let config = &self.services.config;
        if config.execution_mode.is_simulated() {
            return Ok(sizing::dec(config.sizing.paper_equity_usdt));
        }
        let read = self.services.venue.wallet_equity_degradable().await?;
        if read.degraded {
            let mut event = risk_event(
                RiskEventType::RateLimit,
                Severity::Important,
                None,
                [
                    ("context".to_string(), json!("executor.wallet_balance")),
                    ("degraded".to_string(), json!(true)),
                    ("stale_ms".to_string(), json!(read.stale_ms)),
                ]
                .into_iter()
                .collect(),
            );
            event.retry_after_ms = Some(read.predicted_wait_ms as i64);
            self.services.publisher.risk_event(&event).await?;
        }
        Ok(sizing::dec(read.value.equity().unwrap_or(0.0)))
    }

    /// Reduce-only market close of the whole remaining position. Used by the
    /// mutex upgrade, the secondary rule and the hard-halt circuit.
    pub async fn close_position_market(
        &self,
        idempotency_key: &str,
        close_price: Option<Decimal>,
        close_time_ms: Option<i64>,
        reason: ExitReason,
    ) -> Result<()> {
        let Some(position) = self.services.store.get_position_by_idem(idempotency_key)? else {
            debug!(idempotency_key, "force close: no such position");
            return Ok(());
        };
        if position.status == PositionStatus::Closed {
            return Ok(());
        }
        self.cancel_tp_orders(&position, reason).await?;

        if self.services.config.execution_mode.is_simulated() {
            self.close_paper(&position, close_price, close_time_ms, reason)
                .await
        } else {
            self.close_live(&position, reason).await
        }
    }

    async fn cancel_tp_orders(&self, position: &Position, reason: ExitReason) -> Result<()> {
        let live = !self.services.config.execution_mode.is_simulated();
        let orders = self
            .services
            .store
            .list_orders_by_idem(&position.idempotency_key)?;
        for mut order in orders {
            if !order.purpose.is_take_profit() || order.status.is_terminal() {
                continue;
            }
            if live {
                let cancel = self
                    .services
                    .venue
                    .cancel_order(
                        &order.symbol,
                        order.venue_order_id.as_deref(),
                        order.venue_order_link_id.as_deref(),
                    )
                    .await;
                if let Err(err) = cancel {
                    self.alert_venue_error(&order.symbol, "cancel_tp", &err)
                        .await?;
                }
            }
            order.status = OrderStatus::Canceled;
            order.payload["cancel_reason"] = json!(format!("position_close:{}", reason.as_str()));
            self.services.store.upsert_order(&order)?;
        }
        Ok(())
    }

    async fn close_paper(
        &self,
        position: &Position,
        close_price: Option<Decimal>,
        close_time_ms: Option<i64>,
        reason: ExitReason,
    ) -> Result<()> {
        let mut meta = position.meta.clone();
        let close_time = close_time_ms.unwrap_or_else(now_ms);
        let price = close_price
            .or(meta.last_price)
            .unwrap_or(position.entry_price);
        let remaining = meta.qty_open.unwrap_or(position.qty_total);
        if remaining > Decimal::ZERO {
            meta.legs.push(krait_core::ExitLeg {
                kind: krait_core::ExitLegKind::Sl,
                qty: remaining,
                price,
                time_ms: close_time,
            });
        }
        meta.qty_open = Some(Decimal::ZERO);
        meta.close_price = Some(price);

        let pnl = realized_pnl_usdt(position.side, position.entry_price, &meta.legs);
        let exit_avg = weighted_avg_exit(&meta.legs).unwrap_or(price);
        let loss_count = self.services.store.update_consecutive_loss_count(
            &utc_trade_date(),
            &self.services.config.execution_mode.to_string(),
            pnl,
        )?;

        self.services.store.mark_position_closed(
            &position.position_id,
            close_time,
            reason,
            &meta,
        )?;

        let mut report = ExecutionReport::new(
            &position.idempotency_key,
            &position.symbol,
            ReportStatus::SecondarySlExit,
        )
        .with_reason(reason.as_str());
        report.timeframe = Some(position.timeframe);
        report.filled_qty = Some(decimal_f64(position.qty_total));
        report.avg_price = Some(decimal_f64(exit_avg));
        report
            .detail
            .insert("entry_price".into(), json!(position.entry_price.to_string()));
        report.ext.insert("pnl_usdt".into(), json!(decimal_f64(pnl)));
        report
            .ext
            .insert("exit_avg_price".into(), json!(decimal_f64(exit_avg)));
        report
            .ext
            .insert("consecutive_loss_count".into(), json!(loss_count));
        if let Some(run_id) = &meta.run_id {
            report.ext.insert("run_id".into(), json!(run_id));
        }
        self.services.publisher.execution_report(&report).await?;

        let mut closed = ExecutionReport::new(
            &position.idempotency_key,
            &position.symbol,
            ReportStatus::PositionClosed,
        )
        .with_reason(reason.as_str());
        closed.timeframe = Some(position.timeframe);
        closed.ext.insert("pnl_usdt".into(), json!(decimal_f64(pnl)));
        closed
            .ext
            .insert("exit_avg_price".into(), json!(decimal_f64(exit_avg)));
        closed
            .ext
            .insert("consecutive_loss_count".into(), json!(loss_count));
        self.services.publisher.execution_report(&closed).await
    }

    async fn close_live(&self, position: &Position, reason: ExitReason) -> Result<()> {
        let remaining = position
            .meta
            .qty_open
            .unwrap_or(position.qty_total)
            .max(Decimal::ZERO);
        let params = OrderParams {
            symbol: position.symbol.clone(),
            side: position.side.inverse(),
            order_type: OrderType::Market,
            qty: remaining.normalize().to_string(),
            price: None,
            time_in_force: krait_core::TimeInForce::ImmediateOrCancel,
            reduce_only: true,
            order_link_id: format!("{}:FORCE_EXIT", position.idempotency_key),
        };
        match self.services.venue.place_order(params).await {
            Ok(created) => {
                let order = Order {
                    order_id: derived_id("exit", &position.idempotency_key),
                    idempotency_key: position.idempotency_key.clone(),
                    symbol: position.symbol.clone(),
                    purpose: OrderPurpose::Exit,
                    side: position.side.inverse(),
                    order_type: OrderType::Market,
                    qty: remaining,
                    price: None,
                    reduce_only: true,
                    status: OrderStatus::Submitted,
                    venue_order_id: Some(created.order_id),
                    venue_order_link_id: Some(format!(
                        "{}:FORCE_EXIT",
                        position.idempotency_key
                    )),
                    filled_qty: Decimal::ZERO,
                    avg_price: None,
                    submitted_at_ms: Some(now_ms()),
                    retry_count: 0,
                    last_fill_at_ms: None,
                    payload: json!({"reason": reason.as_str()}),
                };
                self.services.store.upsert_order(&order)?;
                self.services
                    .store
                    .set_position_status(&position.position_id, PositionStatus::Closing)?;

                let mut report = ExecutionReport::new(
                    &position.idempotency_key,
                    &position.symbol,
                    ReportStatus::SecondarySlExit,
                )
                .with_reason(reason.as_str());
                report.timeframe = Some(position.timeframe);
                report.order_id = Some(order.order_id.clone());
                report
                    .detail
                    .insert("exit_qty".into(), json!(remaining.to_string()));
                self.services.publisher.execution_report(&report).await
            }
            Err(err) => {
                self.alert_venue_error(&position.symbol, "force_exit", &err)
                    .await?;
                Err(anyhow::anyhow!("force exit placement failed: {err}"))
            }
        }
    }
}

pub(crate) fn decimal_f64(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(0.0)
}
