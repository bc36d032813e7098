//! Periodic wallet/account snapshots and REST-vs-WS wallet drift detection.
//!
//! Snapshots are observability: a failure never touches trading state. The
//! REST snapshot is the periodic ground truth; when a recent WS wallet
//! snapshot diverges beyond the threshold a windowed `CONSISTENCY_DRIFT`
//! (wallet scope) is emitted.

use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::debug;

use krait_core::events::{RiskEventType, Severity};
use krait_core::ids::{derived_id, now_ms, utc_trade_date};
use krait_core::{ExecutionMode, SnapshotSource};
use krait_store::{AccountSnapshotRow, WalletSnapshotRow};

use crate::publisher::risk_event;
use crate::sizing::dec;
use crate::Services;

pub struct Snapshotter {
    services: Services,
}

/// Relative drift between two observations, `None` when not comparable.
#[must_use]
pub fn wallet_drift_pct(a: Option<Decimal>, b: Option<Decimal>) -> Option<Decimal> {
    let (a, b) = (a?, b?);
    if b.abs() <= Decimal::new(1, 9) {
        return None;
    }
    Some((a - b).abs() / b.abs())
}

impl Snapshotter {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn run_once(&self) -> Result<()> {
        let ts = now_ms();
        let trade_date = utc_trade_date();
        let mode = self.services.config.execution_mode;

        if mode != ExecutionMode::Live {
            // Derived snapshot: open-position count only.
            let open = self.services.store.count_open_positions()?;
            self.services.store.insert_account_snapshot(
                &AccountSnapshotRow {
                    snapshot_id: derived_id("acct", &format!("{mode}:{ts}")),
                    ts_ms: ts,
                    trade_date,
                    mode: mode.to_string(),
                    equity_usdt: Some(dec(self.services.config.sizing.paper_equity_usdt)),
                    unrealized_pnl: None,
                    position_count: open,
                },
                &json!({"derived": true}),
            )?;
            return Ok(());
        }

        let read = self.services.venue.wallet_equity_degradable().await?;
        if read.degraded {
            let mut event = risk_event(
                RiskEventType::RateLimit,
                Severity::Important,
                None,
                [
                    ("context".to_string(), json!("snapshotter.wallet_balance")),
                    ("degraded".to_string(), json!(true)),
                    ("stale_ms".to_string(), json!(read.stale_ms)),
                ]
                .into_iter()
                .collect(),
            );
            event.retry_after_ms = Some(read.predicted_wait_ms as i64);
            self.services.publisher.risk_event(&event).await?;
        }
        let totals = read.value;

        let rest_snapshot = WalletSnapshotRow {
            snapshot_id: derived_id("wallet", &format!("REST:{ts}")),
            ts_ms: ts,
            source: SnapshotSource::Rest,
            balance_usdt: totals.total_wallet_balance.map(dec),
            equity_usdt: totals.total_equity.map(dec),
            available_usdt: totals.total_available.map(dec),
        };
        self.services
            .store
            .insert_wallet_snapshot(&rest_snapshot, &json!({"source": "REST"}))?;

        self.check_wallet_drift(&rest_snapshot, &trade_date).await?;

        let open = self.services.store.count_open_positions()?;
        self.services.store.insert_account_snapshot(
            &AccountSnapshotRow {
                snapshot_id: derived_id("acct", &format!("LIVE:{ts}")),
                ts_ms: ts,
                trade_date: utc_trade_date(),
                mode: mode.to_string(),
                equity_usdt: rest_snapshot.equity_usdt,
                unrealized_pnl: None,
                position_count: open,
            },
            &json!({"source": "REST"}),
        )?;
        Ok(())
    }

    async fn check_wallet_drift(
        &self,
        rest: &WalletSnapshotRow,
        _trade_date: &str,
    ) -> Result<()> {
        let consistency = &self.services.config.consistency;
        if !consistency.enabled {
            return Ok(());
        }
        let Some(ws) = self
            .services
            .store
            .latest_wallet_snapshot(SnapshotSource::Ws)?
        else {
            return Ok(());
        };
        if rest.ts_ms - ws.ts_ms > consistency.wallet_ws_max_age_ms {
            debug!("ws wallet snapshot too old for drift comparison");
            return Ok(());
        }
        let drift = [
            wallet_drift_pct(rest.equity_usdt, ws.equity_usdt),
            wallet_drift_pct(rest.balance_usdt, ws.balance_usdt),
            wallet_drift_pct(rest.available_usdt, ws.available_usdt),
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
                    (
                        "rest".to_string(),
                        json!({
                            "equity": rest.equity_usdt.map(|d| d.to_string()),
                            "ts_ms": rest.ts_ms,
                        }),
                    ),
                    (
                        "ws".to_string(),
                        json!({
                            "equity": ws.equity_usdt.map(|d| d.to_string()),
                            "ts_ms": ws.ts_ms,
                        }),
                    ),
                ]
                .into_iter()
                .collect(),
            ))
            .await?;
        Ok(())
    }
}
