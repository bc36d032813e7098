//! Private-stream ingest: order / execution / position / wallet topics.
//!
//! Handlers are idempotent "current state" computations: fills dedupe on the
//! venue execution id, order updates never downgrade a terminal local status,
//! and cross-topic ordering is irrelevant because every handler re-reads the
//! rows it touches.

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use krait_core::events::{ExecutionReport, ReportStatus, RiskEventType, Severity};
use krait_core::ids::{derived_id, now_ms};
use krait_core::{Fill, OrderPurpose, OrderStatus, SnapshotSource};
use krait_exchange::ws::{PrivateEvent, WsExecutionUpdate, WsOrderUpdate, WsPositionUpdate};
use krait_store::WalletSnapshotRow;

use crate::publisher::risk_event;
use crate::reconcile::drift_fraction;
use crate::sizing::dec;
use crate::Services;

pub struct WsIngest {
    services: Services,
}

impl WsIngest {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn handle_event(&self, event: PrivateEvent) -> Result<()> {
        match event {
            PrivateEvent::Connected { connect_count } => {
                self.services
                    .publisher
                    .risk_event(&risk_event(
                        RiskEventType::WsReconnect,
                        Severity::Info,
                        None,
                        [
                            ("event".to_string(), json!("WS_PRIVATE_CONNECTED")),
                            ("connect_count".to_string(), json!(connect_count)),
                        ]
                        .into_iter()
                        .collect(),
                    ))
                    .await?;
                Ok(())
            }
            PrivateEvent::Disconnected { reason } => {
                self.services
                    .publisher
                    .risk_event(&risk_event(
                        RiskEventType::WsReconnect,
                        Severity::Important,
                        None,
                        [
                            ("event".to_string(), json!("WS_PRIVATE_DISCONNECTED")),
                            ("reason".to_string(), json!(reason)),
                        ]
                        .into_iter()
                        .collect(),
                    ))
                    .await?;
                Ok(())
            }
            PrivateEvent::Order(update) => self.handle_order(update).await,
            PrivateEvent::Execution(update) => self.handle_execution(update).await,
            PrivateEvent::Position(update) => self.handle_position(update).await,
            PrivateEvent::Wallet(payload) => self.handle_wallet(payload).await,
        }
    }

    async fn handle_order(&self, update: WsOrderUpdate) -> Result<()> {
        let Some(order) = self.services.store.get_order_by_venue_ids(
            Some(&update.order_id),
            (!update.order_link_id.is_empty()).then_some(update.order_link_id.as_str()),
        )?
        else {
            debug!(order_id = %update.order_id, "ws order update for unknown order");
            return Ok(());
        };

        let status = OrderStatus::from_venue(&update.order_status);
        let filled_qty = update.cum_exec_qty.parse().ok().map(dec);
        let avg_price = update.avg_price.parse().ok().map(dec);
        self.services.store.update_order_from_venue(
            &order.order_id,
            status,
            filled_qty,
            avg_price,
            filled_qty.and(Some(now_ms())),
        )?;

        if status == OrderStatus::Filled && order.purpose.is_take_profit() {
            self.propagate_tp_fill(&order.idempotency_key, order.purpose)?;
        }

        // Terminal transitions are operator-relevant; plain submit acks stay
        // in the log only.
        let report_status = match (status, order.purpose) {
            (OrderStatus::Filled, OrderPurpose::Entry) => Some(ReportStatus::Filled),
            (OrderStatus::Filled, OrderPurpose::Tp1 | OrderPurpose::Tp2) => {
                Some(ReportStatus::TpHit)
            }
            (OrderStatus::Filled, _) => Some(ReportStatus::PositionClosed),
            (OrderStatus::Canceled | OrderStatus::Failed, _) => {
                Some(ReportStatus::OrderRejected)
            }
            (OrderStatus::PartiallyFilled, _) => Some(ReportStatus::PartialFilled),
            _ => None,
        };
        if let Some(report_status) = report_status {
            let mut report =
                ExecutionReport::new(&order.idempotency_key, &update.symbol, report_status);
            report.order_id = Some(order.order_id.clone());
            report.filled_qty = update.cum_exec_qty.parse().ok();
            report.avg_price = update.avg_price.parse().ok();
            report
                .detail
                .insert("purpose".into(), json!(order.purpose.as_str()));
            report
                .detail
                .insert("order_status".into(), json!(update.order_status));
            report.detail.insert("source".into(), json!("ws"));
            if report_status == ReportStatus::OrderRejected {
                report.reason = Some(update.order_status.clone());
            }
            self.services.publisher.execution_report(&report).await?;
        }
        Ok(())
    }

    async fn handle_execution(&self, update: WsExecutionUpdate) -> Result<()> {
        let Some(order) = self.services.store.get_order_by_venue_ids(
            Some(&update.order_id),
            (!update.order_link_id.is_empty()).then_some(update.order_link_id.as_str()),
        )?
        else {
            debug!(exec_id = %update.exec_id, "ws execution for unknown order");
            return Ok(());
        };

        let exec_time = update.exec_time.parse().unwrap_or_else(|_| now_ms());
        let fill = Fill {
            fill_id: update.exec_id.clone(),
            order_id: order.order_id.clone(),
            symbol: update.symbol.clone(),
            purpose: order.purpose,
            side: order.side,
            exec_qty: update.exec_qty.parse().ok().map(dec).unwrap_or_default(),
            exec_price: update.exec_price.parse().ok().map(dec).unwrap_or_default(),
            fee: update.exec_fee.parse().ok().map(dec),
            exec_time_ms: exec_time,
        };
        let inserted = self.services.store.insert_fill(&fill)?;
        if !inserted {
            // Redelivered execution; everything downstream already happened.
            return Ok(());
        }
        self.services.store.update_order_from_venue(
            &order.order_id,
            OrderStatus::PartiallyFilled,
            None,
            None,
            Some(exec_time),
        )?;

        // When accumulated fills cover the order, converge it to FILLED
        // proactively instead of waiting for the order topic.
        if let Some(progress) = self.services.store.fill_progress(&order.order_id)? {
            if progress.is_complete() && !progress.status.is_terminal() {
                self.services.store.update_order_from_venue(
                    &order.order_id,
                    OrderStatus::Filled,
                    Some(progress.filled_qty),
                    progress.avg_price,
                    Some(exec_time),
                )?;
                if order.purpose.is_take_profit() {
                    self.propagate_tp_fill(&order.idempotency_key, order.purpose)?;
                }
                let mut report = ExecutionReport::new(
                    &order.idempotency_key,
                    &update.symbol,
                    match order.purpose {
                        OrderPurpose::Entry => ReportStatus::Filled,
                        OrderPurpose::Tp1 | OrderPurpose::Tp2 => ReportStatus::TpHit,
                        _ => ReportStatus::PositionClosed,
                    },
                );
                report.order_id = Some(order.order_id.clone());
                report.filled_qty = Some(crate::executor::decimal_f64(progress.filled_qty));
                report
                    .detail
                    .insert("purpose".into(), json!(order.purpose.as_str()));
                report
                    .detail
                    .insert("source".into(), json!("ws_execution_converge"));
                self.services.publisher.execution_report(&report).await?;
                return Ok(());
            }
        }

        let mut report = ExecutionReport::new(
            &order.idempotency_key,
            &update.symbol,
            ReportStatus::PartialFilled,
        );
        report.order_id = Some(order.order_id.clone());
        report.filled_qty = update.exec_qty.parse().ok();
        report.avg_price = update.exec_price.parse().ok();
        report
            .detail
            .insert("purpose".into(), json!(order.purpose.as_str()));
        report.detail.insert("source".into(), json!("ws"));
        self.services.publisher.execution_report(&report).await
    }

    fn propagate_tp_fill(&self, idempotency_key: &str, purpose: OrderPurpose) -> Result<()> {
        let Some(position) = self.services.store.get_position_by_idem(idempotency_key)? else {
            return Ok(());
        };
        let mut meta = position.meta.clone();
        let changed = match purpose {
            OrderPurpose::Tp1 if !meta.tp1_filled => {
                meta.tp1_filled = true;
                meta.tp1_filled_ms = Some(now_ms());
                true
            }
            OrderPurpose::Tp2 if !meta.tp2_filled => {
                meta.tp2_filled = true;
                meta.tp2_filled_ms = Some(now_ms());
                true
            }
            _ => false,
        };
        if changed {
            meta.extra.insert("tp_source".into(), json!("ws"));
            self.services
                .store
                .update_position_meta(&position.position_id, &meta)?;
            info!(
                idempotency_key,
                purpose = purpose.as_str(),
                "tp fill learned over ws"
            );
        }
        Ok(())
    }

    async fn handle_position(&self, update: WsPositionUpdate) -> Result<()> {
        let positions = self.services.store.list_open_positions()?;
        let Some(position) = positions.into_iter().find(|p| p.symbol == update.symbol) else {
            return Ok(());
        };
        let mut meta = position.meta.clone();
        meta.ws_position = Some(json!({
            "size": update.size.clone(),
            "side": update.side.clone(),
            "entry_price": update.entry_price.clone(),
            "unrealised_pnl": update.unrealised_pnl.clone(),
            "ts_ms": now_ms(),
        }));
        self.services
            .store
            .update_position_meta(&position.position_id, &meta)?;

        let consistency = &self.services.config.consistency;
        if !consistency.enabled {
            return Ok(());
        }
        let local = crate::executor::decimal_f64(position.qty_total);
        let Some(drift) = drift_fraction(update.size_abs(), local) else {
            return Ok(());
        };
        // Inclusive at the boundary, like every other drift site.
        if drift >= consistency.drift_threshold_pct {
            self.services
                .publisher
                .risk_event(&risk_event(
                    RiskEventType::ConsistencyDrift,
                    Severity::Important,
                    Some(&position.symbol),
                    [
                        ("local_qty_total".to_string(), json!(local)),
                        ("ws_size".to_string(), json!(update.size_abs())),
                        ("drift_pct".to_string(), json!(drift)),
                        (
                            "idempotency_key".to_string(),
                            json!(position.idempotency_key),
                        ),
                    ]
                    .into_iter()
                    .collect(),
                ))
                .await?;
        }
        Ok(())
    }

    async fn handle_wallet(&self, payload: Value) -> Result<()> {
        let entry = match &payload {
            Value::Array(items) => items.first().cloned(),
            other => Some(other.clone()),
        };
        let Some(entry) = entry else { return Ok(()) };
        let parse = |key: &str| {
            entry
                .get(key)
                .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_f64().map(|f| f.to_string())))
                .and_then(|s| s.parse::<f64>().ok())
                .map(dec)
        };
        let ts = now_ms();
        let snapshot = WalletSnapshotRow {
            snapshot_id: derived_id("wallet", &format!("WS:{ts}")),
            ts_ms: ts,
            source: SnapshotSource::Ws,
            balance_usdt: parse("totalWalletBalance"),
            equity_usdt: parse("totalEquity"),
            available_usdt: parse("totalAvailableBalance"),
        };
        if snapshot.equity_usdt.is_none() && snapshot.balance_usdt.is_none() {
            warn!("ws wallet payload carried no usable totals");
            return Ok(());
        }
        self.services
            .store
            .insert_wallet_snapshot(&snapshot, &payload)?;

        // Compare against the latest REST ground truth; the publisher window
        // keeps the two comparison directions from double-alerting.
        let consistency = &self.services.config.consistency;
        if !consistency.enabled {
            return Ok(());
        }
        let Some(rest) = self
            .services
            .store
            .latest_wallet_snapshot(SnapshotSource::Rest)?
        else {
            return Ok(());
        };
        if ts - rest.ts_ms > consistency.wallet_ws_max_age_ms {
            return Ok(());
        }
        let drift = [
            crate::snapshotter::wallet_drift_pct(snapshot.equity_usdt, rest.equity_usdt),
            crate::snapshotter::wallet_drift_pct(snapshot.balance_usdt, rest.balance_usdt),
        ]
        .into_iter()
        .flatten()
        .max();
        let Some(drift) = drift else { return Ok(()) };
        let threshold = dec(consistency.wallet_drift_threshold_pct);
        if drift < threshold {
            return Ok(());
        }
        self.services
            .publisher
            .risk_event(&risk_event(
                RiskEventType::ConsistencyDrift,
                Severity::Important,
                None,
                [
                    ("scope".to_string(), json!("wallet")),
                    ("drift_pct".to_string(), json!(drift.to_string())),
                    ("threshold_pct".to_string(), json!(threshold.to_string())),
                    ("source".to_string(), json!("ws")),
                ]
                .into_iter()
                .collect(),
            ))
            .await?;
        Ok(())
    }
}
