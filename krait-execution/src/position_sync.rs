//! DB-vs-exchange position reconciliation.
//!
//! Covers manual exchange-side closes, stop fills the WS feed dropped, and
//! any divergence where the venue reports a flat book while the DB still has
//! an OPEN row. Exit-reason attribution is conservative: no recorded TP1 fill
//! means the close was most likely the stop, which also starts a cooldown.

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use krait_core::events::{ExecutionReport, ReportStatus};
use krait_core::ids::{derived_id, now_ms};
use krait_core::{Cooldown, ExecutionMode, ExitReason, Position, PositionStatus};

use crate::Services;

pub struct PositionSync {
    services: Services,
}

impl PositionSync {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn run_once(&self) -> Result<()> {
        if self.services.config.execution_mode != ExecutionMode::Live {
            return Ok(());
        }
        // CLOSING rows (forced exits in flight) converge here too.
        for candidate in self.services.store.list_active_positions()? {
            let lock = self
                .services
                .position_locks
                .for_key(&candidate.idempotency_key);
            let _guard = lock.lock().await;
            let Some(position) = self
                .services
                .store
                .get_position_by_idem(&candidate.idempotency_key)?
            else {
                continue;
            };
            if !matches!(
                position.status,
                PositionStatus::Open | PositionStatus::Closing
            ) {
                continue;
            }
            if let Err(err) = self.sync_position(&position).await {
                warn!(
                    error = %err,
                    idempotency_key = %position.idempotency_key,
                    "position sync failed"
                );
            }
        }
        Ok(())
    }

    async fn sync_position(&self, position: &Position) -> Result<()> {
        let size = self
            .services
            .venue
            .position_size(&position.symbol)
            .await?;
        if size > f64::EPSILON {
            return Ok(());
        }

        // Exchange is flat; converge the DB row.
        let now = now_ms();
        let exit_reason = if position.status == PositionStatus::Closing {
            // A forced exit completed; recover the reason it was fired with.
            self.services
                .store
                .get_order(&position.idempotency_key, krait_core::OrderPurpose::Exit)?
                .and_then(|order| {
                    order
                        .payload
                        .get("reason")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse::<ExitReason>().ok())
                })
                .unwrap_or(ExitReason::ForcedExit)
        } else if !position.meta.tp1_filled {
            ExitReason::StopLoss
        } else {
            ExitReason::ExchangeClosed
        };

        if exit_reason.starts_cooldown() && self.services.config.gates.cooldown_enabled {
            let bars = self.services.config.gates.cooldown_bars(position.timeframe);
            if bars > 0 {
                let until = now + i64::from(bars) * position.timeframe.duration_ms();
                self.services.store.insert_cooldown(&Cooldown {
                    cooldown_id: derived_id(
                        "cd",
                        &format!("{}:sync:{now}", position.idempotency_key),
                    ),
                    symbol: position.symbol.clone(),
                    side: position.side,
                    timeframe: position.timeframe,
                    reason: exit_reason.as_str().to_string(),
                    until_ts_ms: until,
                })?;
            }
        }

        self.services.store.mark_position_closed(
            &position.position_id,
            now,
            exit_reason,
            &position.meta,
        )?;

        let mut report = ExecutionReport::new(
            &position.idempotency_key,
            &position.symbol,
            ReportStatus::PositionClosed,
        )
        .with_reason(exit_reason.as_str());
        report.timeframe = Some(position.timeframe);
        report
            .detail
            .insert("source".into(), json!("position_sync"));
        report
            .detail
            .insert("tp1_filled".into(), json!(position.meta.tp1_filled));
        self.services.publisher.execution_report(&report).await?;

        info!(
            idempotency_key = %position.idempotency_key,
            reason = exit_reason.as_str(),
            "db position closed after exchange reported flat"
        );
        Ok(())
    }
}
