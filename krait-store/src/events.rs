//! Append-only ledgers: execution reports, risk events, snapshots, bar emits.

use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;

use krait_core::events::{ReportStatus, RiskEventType, Severity};
use krait_core::SnapshotSource;

use crate::{dec_opt_from_sql, dec_opt_to_sql, Store, StoreResult};

/// Stored wallet snapshot used for drift comparison.
#[derive(Clone, Debug)]
pub struct WalletSnapshotRow {
    pub snapshot_id: String,
    pub ts_ms: i64,
    pub source: SnapshotSource,
    pub balance_usdt: Option<Decimal>,
    pub equity_usdt: Option<Decimal>,
    pub available_usdt: Option<Decimal>,
}

/// Stored account snapshot (observability only).
#[derive(Clone, Debug)]
pub struct AccountSnapshotRow {
    pub snapshot_id: String,
    pub ts_ms: i64,
    pub trade_date: String,
    pub mode: String,
    pub equity_usdt: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub position_count: u32,
}

impl Store {
    /// Persist an execution report by event id. Returns false when the event
    /// was already recorded (idempotent publish).
    pub fn insert_execution_report(
        &self,
        event_id: &str,
        ts_ms: i64,
        idempotency_key: &str,
        symbol: &str,
        status: ReportStatus,
        payload: &serde_json::Value,
    ) -> StoreResult<bool> {
        let payload = serde_json::to_string(payload)?;
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO execution_reports \
                 (event_id, ts_ms, idempotency_key, symbol, status, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![event_id, ts_ms, idempotency_key, symbol, status.as_str(), payload],
            )?;
            Ok(inserted > 0)
        })
    }

    /// Persist a risk event by event id; idempotent like reports.
    pub fn insert_risk_event(
        &self,
        event_id: &str,
        trade_date: &str,
        ts_ms: i64,
        event_type: RiskEventType,
        severity: Severity,
        symbol: Option<&str>,
        detail: &serde_json::Value,
    ) -> StoreResult<bool> {
        let detail = serde_json::to_string(detail)?;
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO risk_events \
                 (event_id, trade_date, ts_ms, type, severity, symbol, detail) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event_id,
                    trade_date,
                    ts_ms,
                    event_type.as_str(),
                    severity.as_str(),
                    symbol,
                    detail,
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn count_execution_reports(&self, idempotency_key: &str) -> StoreResult<u32> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM execution_reports WHERE idempotency_key = ?1",
                params![idempotency_key],
                |row| row.get(0),
            )?;
            Ok(count as u32)
        })
    }

    /// Record that a bar was processed. Returns false when the triple was
    /// already seen, which marks the envelope as a duplicate delivery.
    pub fn record_bar_emit(
        &self,
        symbol: &str,
        timeframe: &str,
        close_time_ms: i64,
    ) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO bar_close_emits (symbol, timeframe, close_time_ms) \
                 VALUES (?1, ?2, ?3)",
                params![symbol, timeframe, close_time_ms],
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn insert_wallet_snapshot(
        &self,
        snapshot: &WalletSnapshotRow,
        payload: &serde_json::Value,
    ) -> StoreResult<()> {
        let payload = serde_json::to_string(payload)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO wallet_snapshots \
                 (snapshot_id, ts_ms, source, balance_usdt, equity_usdt, available_usdt, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    snapshot.snapshot_id,
                    snapshot.ts_ms,
                    snapshot.source.as_str(),
                    dec_opt_to_sql(snapshot.balance_usdt),
                    dec_opt_to_sql(snapshot.equity_usdt),
                    dec_opt_to_sql(snapshot.available_usdt),
                    payload,
                ],
            )?;
            Ok(())
        })
    }

    pub fn latest_wallet_snapshot(
        &self,
        source: SnapshotSource,
    ) -> StoreResult<Option<WalletSnapshotRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT snapshot_id, ts_ms, balance_usdt, equity_usdt, available_usdt \
                     FROM wallet_snapshots WHERE source = ?1 ORDER BY ts_ms DESC LIMIT 1",
                    params![source.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                        ))
                    },
                )
                .optional()?;
            let Some((snapshot_id, ts_ms, balance, equity, available)) = row else {
                return Ok(None);
            };
            Ok(Some(WalletSnapshotRow {
                snapshot_id,
                ts_ms,
                source,
                balance_usdt: dec_opt_from_sql(balance)?,
                equity_usdt: dec_opt_from_sql(equity)?,
                available_usdt: dec_opt_from_sql(available)?,
            }))
        })
    }

    pub fn insert_account_snapshot(
        &self,
        snapshot: &AccountSnapshotRow,
        payload: &serde_json::Value,
    ) -> StoreResult<()> {
        let payload = serde_json::to_string(payload)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO account_snapshots \
                 (snapshot_id, ts_ms, trade_date, mode, equity_usdt, unrealized_pnl, position_count, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    snapshot.snapshot_id,
                    snapshot.ts_ms,
                    snapshot.trade_date,
                    snapshot.mode,
                    dec_opt_to_sql(snapshot.equity_usdt),
                    dec_opt_to_sql(snapshot.unrealized_pnl),
                    snapshot.position_count as i64,
                    payload,
                ],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execution_reports_are_idempotent_by_event_id() {
        let store = Store::open_in_memory().unwrap();
        let payload = json!({"status": "FILLED"});
        assert!(store
            .insert_execution_report("e1", 1, "k1", "BTCUSDT", ReportStatus::Filled, &payload)
            .unwrap());
        assert!(!store
            .insert_execution_report("e1", 1, "k1", "BTCUSDT", ReportStatus::Filled, &payload)
            .unwrap());
        assert_eq!(store.count_execution_reports("k1").unwrap(), 1);
    }

    #[test]
    fn risk_events_are_idempotent_by_event_id() {
        let store = Store::open_in_memory().unwrap();
        let detail = json!({"reason": "KILL_SWITCH_ON"});
        assert!(store
            .insert_risk_event(
                "r1",
                "2026-08-02",
                1,
                RiskEventType::KillSwitchOn,
                Severity::Important,
                Some("BTCUSDT"),
                &detail,
            )
            .unwrap());
        assert!(!store
            .insert_risk_event(
                "r1",
                "2026-08-02",
                1,
                RiskEventType::KillSwitchOn,
                Severity::Important,
                Some("BTCUSDT"),
                &detail,
            )
            .unwrap());
    }

    #[test]
    fn bar_emits_deduplicate_redelivery() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.record_bar_emit("BTCUSDT", "1h", 1_000).unwrap());
        assert!(!store.record_bar_emit("BTCUSDT", "1h", 1_000).unwrap());
        assert!(store.record_bar_emit("BTCUSDT", "1h", 2_000).unwrap());
    }

    #[test]
    fn latest_wallet_snapshot_orders_by_time() {
        let store = Store::open_in_memory().unwrap();
        for (id, ts, equity) in [("w1", 1_000, "100"), ("w2", 2_000, "105")] {
            store
                .insert_wallet_snapshot(
                    &WalletSnapshotRow {
                        snapshot_id: id.into(),
                        ts_ms: ts,
                        source: SnapshotSource::Ws,
                        balance_usdt: None,
                        equity_usdt: Some(equity.parse().unwrap()),
                        available_usdt: None,
                    },
                    &json!({}),
                )
                .unwrap();
        }
        let latest = store
            .latest_wallet_snapshot(SnapshotSource::Ws)
            .unwrap()
            .unwrap();
        assert_eq!(latest.snapshot_id, "w2");
        assert!(store
            .latest_wallet_snapshot(SnapshotSource::Rest)
            .unwrap()
            .is_none());
    }
}
