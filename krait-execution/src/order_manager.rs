//! Entry-order state machine for live Limit entries.
//!
//! SUBMITTED → (PARTIALLY_FILLED*) → FILLED, or on timeout/partial stall:
//! cancel → reprice-retry (bounded) → market fallback → or give up and fail
//! the position. Market entries bypass the manager entirely.

use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, warn};

use krait_core::events::{ExecutionReport, ReportStatus, RiskEventType, Severity};
use krait_core::ids::now_ms;
use krait_core::{
    ExecutionMode, ExitReason, Order, OrderStatus, OrderType, PositionStatus, TimeInForce,
};
use krait_config::EntryOrderType;
use krait_exchange::{OrderParams, VenueOrder};

use crate::executor::decimal_f64;
use crate::publisher::risk_event;
use crate::sizing::{self, reprice_toward_market};
use crate::Services;

pub struct EntryOrderManager {
    services: Services,
}

impl EntryOrderManager {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// One manager tick: scan pending ENTRY limits and resolve stalls.
    pub async fn run_once(&self) -> Result<()> {
        let config = &self.services.config;
        if config.execution_mode != ExecutionMode::Live
            || config.entry.order_type != EntryOrderType::Limit
        {
            return Ok(());
        }
        let pending = self
            .services
            .store
            .list_orders_by_status(OrderStatus::Submitted, krait_core::OrderPurpose::Entry)?;
        if pending.is_empty() {
            return Ok(());
        }
        let now = now_ms();
        for order in pending {
            if order.order_type != OrderType::Limit {
                continue;
            }
            if let Err(err) = self.check_order(order, now).await {
                // One stuck order must not starve the rest of the scan.
                warn!(error = %err, "entry order check failed");
            }
        }
        Ok(())
    }

    async fn check_order(&self, mut order: Order, now: i64) -> Result<()> {
        let entry = &self.services.config.entry;

        // Enrich fill progress from the venue's view of the order.
        let open = self
            .services
            .venue
            .open_orders_degradable(&order.symbol)
            .await;
        if let Ok(read) = &open {
            if read.degraded {
                self.degraded_alert(&order.symbol, read.predicted_wait_ms, read.stale_ms)
                    .await?;
            }
            if let Some(venue_order) = find_match(&read.value, &order) {
                let filled = sizing::dec(venue_order.filled_qty());
                if filled > order.filled_qty {
                    order.filled_qty = filled;
                    order.last_fill_at_ms = Some(now);
                }
                if venue_order.is_filled() {
                    self.services.store.update_order_from_venue(
                        &order.order_id,
                        OrderStatus::Filled,
                        Some(filled),
                        venue_order.avg_price.parse().ok(),
                        Some(now),
                    )?;
                    return Ok(());
                }
                self.services.store.update_order_from_venue(
                    &order.order_id,
                    OrderStatus::Submitted,
                    Some(filled),
                    None,
                    order.last_fill_at_ms,
                )?;
            }
        }

        let submitted_at = order.submitted_at_ms.unwrap_or(now);
        if order.filled_qty > Decimal::ZERO {
            let last_fill = order.last_fill_at_ms.unwrap_or(submitted_at);
            if now - last_fill < entry.partial_fill_timeout_ms {
                return Ok(());
            }
            self.resolve_stall(order, true).await
        } else {
            if now - submitted_at < entry.timeout_ms {
                return Ok(());
            }
            self.resolve_stall(order, false).await
        }
    }

    async fn resolve_stall(&self, order: Order, partial: bool) -> Result<()> {
        let entry = &self.services.config.entry;
        let remaining = (order.qty - order.filled_qty).max(Decimal::ZERO);

        let (alert_type, severity) = if partial {
            (RiskEventType::OrderPartialFill, Severity::Important)
        } else {
            (RiskEventType::OrderTimeout, Severity::Important)
        };
        self.services
            .publisher
            .risk_event(&risk_event(
                alert_type,
                severity,
                Some(&order.symbol),
                [
                    ("purpose".to_string(), json!("ENTRY")),
                    ("order_id".to_string(), json!(order.order_id)),
                    ("filled_qty".to_string(), json!(order.filled_qty.to_string())),
                    ("total_qty".to_string(), json!(order.qty.to_string())),
                    ("action".to_string(), json!("cancel_retry_or_fallback")),
                ]
                .into_iter()
                .collect(),
            ))
            .await?;

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
            if err.is_rate_limit() {
                let mut event = risk_event(
                    RiskEventType::RateLimit,
                    Severity::Important,
                    Some(&order.symbol),
                    [("action".to_string(), json!("cancel_failed"))]
                        .into_iter()
                        .collect(),
                );
                event.retry_after_ms = err.retry_after_ms();
                self.services.publisher.risk_event(&event).await?;
                return Ok(());
            }
            // "Already filled" and friends: re-query and converge instead of
            // fighting the venue.
            return self.converge_after_failed_cancel(order, &err.to_string()).await;
        }
        self.services
            .publisher
            .risk_event(&risk_event(
                RiskEventType::OrderCancelled,
                Severity::Info,
                Some(&order.symbol),
                [
                    ("purpose".to_string(), json!("ENTRY")),
                    ("order_id".to_string(), json!(order.order_id)),
                    (
                        "reason".to_string(),
                        json!(if partial { "partial_fill_stalled" } else { "timeout" }),
                    ),
                ]
                .into_iter()
                .collect(),
            ))
            .await?;

        if remaining <= Decimal::ZERO {
            self.services.store.update_order_from_venue(
                &order.order_id,
                OrderStatus::Filled,
                None,
                None,
                None,
            )?;
            return Ok(());
        }

        let attempt = order.retry_count + 1;
        let base_price = order.price.or_else(|| {
            order
                .payload
                .get("base_price")
                .and_then(|v| v.as_f64())
                .map(sizing::dec)
        });
        if attempt <= entry.max_retries {
            if let Some(base) = base_price {
                return self.reprice_and_resubmit(order, base, remaining, attempt).await;
            }
        }
        if entry.fallback_market {
            return self.fallback_to_market(order, remaining, attempt).await;
        }
        self.give_up(order).await
    }

    async fn reprice_and_resubmit(
        &self,
        mut order: Order,
        base_price: Decimal,
        remaining: Decimal,
        attempt: u32,
    ) -> Result<()> {
        let entry = &self.services.config.entry;
        let new_price = reprice_toward_market(base_price, order.side, entry.reprice_bps, attempt);
        let link = format!("{}:ENTRY:{attempt}", order.idempotency_key);
        let placed = self
            .services
            .venue
            .place_order(OrderParams {
                symbol: order.symbol.clone(),
                side: order.side,
                order_type: OrderType::Limit,
                qty: remaining.normalize().to_string(),
                price: Some(new_price.normalize().to_string()),
                time_in_force: TimeInForce::GoodTilCanceled,
                reduce_only: false,
                order_link_id: link.clone(),
            })
            .await;
        let created = match placed {
            Ok(created) => created,
            Err(err) => {
                return self.placement_failed(&order, "retry_place_failed", &err).await;
            }
        };

        order.price = Some(new_price);
        order.status = OrderStatus::Submitted;
        order.venue_order_id = Some(created.order_id);
        order.venue_order_link_id = Some(link);
        order.submitted_at_ms = Some(now_ms());
        order.retry_count = attempt;
        self.services.store.upsert_order(&order)?;

        self.services
            .publisher
            .risk_event(&risk_event(
                RiskEventType::OrderRetry,
                Severity::Info,
                Some(&order.symbol),
                [
                    ("purpose".to_string(), json!("ENTRY")),
                    ("order_id".to_string(), json!(order.order_id)),
                    ("attempt".to_string(), json!(attempt)),
                    ("new_price".to_string(), json!(new_price.to_string())),
                    ("remaining_qty".to_string(), json!(remaining.to_string())),
                ]
                .into_iter()
                .collect(),
            ))
            .await?;

        let mut report = ExecutionReport::new(
            &order.idempotency_key,
            &order.symbol,
            ReportStatus::OrderSubmitted,
        )
        .with_reason(RiskEventType::OrderRetry.as_str());
        report.order_id = Some(order.order_id.clone());
        report.retry_count = Some(attempt);
        report.avg_price = Some(decimal_f64(new_price));
        self.services.publisher.execution_report(&report).await?;

        info!(
            order_id = %order.order_id,
            attempt,
            price = %new_price,
            "entry repriced and resubmitted"
        );
        Ok(())
    }

    async fn fallback_to_market(
        &self,
        mut order: Order,
        remaining: Decimal,
        attempt: u32,
    ) -> Result<()> {
        let link = format!("{}:ENTRY:FALLBACK", order.idempotency_key);
        let placed = self
            .services
            .venue
            .place_order(OrderParams {
                symbol: order.symbol.clone(),
                side: order.side,
                order_type: OrderType::Market,
                qty: remaining.normalize().to_string(),
                price: None,
                time_in_force: TimeInForce::ImmediateOrCancel,
                reduce_only: false,
                order_link_id: link.clone(),
            })
            .await;
        let created = match placed {
            Ok(created) => created,
            Err(err) => {
                return self
                    .placement_failed(&order, "fallback_place_failed", &err)
                    .await;
            }
        };

        order.order_type = OrderType::Market;
        order.price = None;
        order.status = OrderStatus::Submitted;
        order.venue_order_id = Some(created.order_id);
        order.venue_order_link_id = Some(link);
        order.submitted_at_ms = Some(now_ms());
        order.retry_count = attempt;
        self.services.store.upsert_order(&order)?;

        self.services
            .publisher
            .risk_event(&risk_event(
                RiskEventType::OrderFallbackMarket,
                Severity::Important,
                Some(&order.symbol),
                [
                    ("purpose".to_string(), json!("ENTRY")),
                    ("order_id".to_string(), json!(order.order_id)),
                    ("remaining_qty".to_string(), json!(remaining.to_string())),
                ]
                .into_iter()
                .collect(),
            ))
            .await?;

        let mut report = ExecutionReport::new(
            &order.idempotency_key,
            &order.symbol,
            ReportStatus::OrderSubmitted,
        )
        .with_reason(RiskEventType::OrderFallbackMarket.as_str());
        report.order_id = Some(order.order_id.clone());
        report.retry_count = Some(attempt);
        self.services.publisher.execution_report(&report).await?;

        info!(order_id = %order.order_id, "entry fell back to market");
        Ok(())
    }

    /// No retries left and no fallback: the entry is dead.
    async fn give_up(&self, order: Order) -> Result<()> {
        self.services.store.update_order_from_venue(
            &order.order_id,
            OrderStatus::Failed,
            None,
            None,
            None,
        )?;
        self.services
            .publisher
            .risk_event(&risk_event(
                RiskEventType::OrderTimeout,
                Severity::Important,
                Some(&order.symbol),
                [
                    ("purpose".to_string(), json!("ENTRY")),
                    ("order_id".to_string(), json!(order.order_id)),
                    ("action".to_string(), json!("entry_abandoned")),
                ]
                .into_iter()
                .collect(),
            ))
            .await?;

        if let Some(mut position) = self
            .services
            .store
            .get_position_by_idem(&order.idempotency_key)?
        {
            if order.filled_qty <= Decimal::ZERO {
                position.status = PositionStatus::Failed;
                position.closed_at_ms = Some(now_ms());
                position.exit_reason = Some(ExitReason::EntryFailed);
                self.services.store.upsert_position(&position)?;
            } else {
                // Keep what actually filled; exits will manage the remainder.
                position.qty_total = order.filled_qty;
                position.meta.qty_open = Some(order.filled_qty);
                self.services.store.upsert_position(&position)?;
            }
        }

        let mut report = ExecutionReport::new(
            &order.idempotency_key,
            &order.symbol,
            ReportStatus::OrderRejected,
        )
        .with_reason(RiskEventType::OrderTimeout.as_str());
        report.order_id = Some(order.order_id.clone());
        report.retry_count = Some(order.retry_count);
        report.fill_ratio = crate::quality::fill_ratio(
            Some(decimal_f64(order.filled_qty)),
            Some(decimal_f64(order.qty)),
        );
        self.services.publisher.execution_report(&report).await?;
        warn!(order_id = %order.order_id, "entry abandoned after retries");
        Ok(())
    }

    async fn converge_after_failed_cancel(&self, order: Order, error: &str) -> Result<()> {
        let open = self
            .services
            .venue
            .open_orders(&order.symbol)
            .await
            .unwrap_or_default();
        if let Some(venue_order) = find_match(&open, &order) {
            let status = OrderStatus::from_venue(&venue_order.order_status);
            self.services.store.update_order_from_venue(
                &order.order_id,
                status,
                Some(sizing::dec(venue_order.filled_qty())),
                venue_order.avg_price.parse().ok(),
                None,
            )?;
            if status == OrderStatus::Filled {
                let mut report = ExecutionReport::new(
                    &order.idempotency_key,
                    &order.symbol,
                    ReportStatus::Filled,
                );
                report.order_id = Some(order.order_id.clone());
                report.filled_qty = Some(venue_order.filled_qty());
                report.avg_price = venue_order.avg_price.parse().ok();
                self.services.publisher.execution_report(&report).await?;
            }
        } else {
            warn!(order_id = %order.order_id, error, "cancel failed and order not visible; leaving for reconciliation");
        }
        Ok(())
    }

    async fn placement_failed(
        &self,
        order: &Order,
        action: &str,
        err: &krait_exchange::ExchangeError,
    ) -> Result<()> {
        let mut event = risk_event(
            if err.is_rate_limit() {
                RiskEventType::RateLimit
            } else {
                RiskEventType::RiskRejected
            },
            Severity::Important,
            Some(&order.symbol),
            [
                ("purpose".to_string(), json!("ENTRY")),
                ("order_id".to_string(), json!(order.order_id)),
                ("action".to_string(), json!(action)),
                ("error".to_string(), json!(err.to_string())),
            ]
            .into_iter()
            .collect(),
        );
        event.retry_after_ms = err.retry_after_ms();
        self.services.publisher.risk_event(&event).await?;
        Ok(())
    }

    async fn degraded_alert(&self, symbol: &str, predicted_wait_ms: u64, stale_ms: u64) -> Result<()> {
        let mut event = risk_event(
            RiskEventType::RateLimit,
            Severity::Important,
            Some(symbol),
            [
                ("context".to_string(), json!("order_manager.open_orders")),
                ("degraded".to_string(), json!(true)),
                ("stale_ms".to_string(), json!(stale_ms)),
            ]
            .into_iter()
            .collect(),
        );
        event.retry_after_ms = Some(predicted_wait_ms as i64);
        self.services.publisher.risk_event(&event).await?;
        Ok(())
    }
}

fn find_match<'a>(open: &'a [VenueOrder], order: &Order) -> Option<&'a VenueOrder> {
    open.iter().find(|candidate| {
        order
            .venue_order_id
            .as_deref()
            .is_some_and(|id| id == candidate.order_id)
            || order
                .venue_order_link_id
                .as_deref()
                .is_some_and(|link| link == candidate.order_link_id)
    })
}
