//! Position repository: one row per admitted idempotency key.

use rusqlite::{params, OptionalExtension, Row};

use krait_core::{Bias, ExitReason, Position, PositionMeta, PositionStatus, Side, Timeframe};

use crate::{dec_from_sql, dec_opt_from_sql, dec_opt_to_sql, dec_to_sql, Store, StoreResult};

impl Store {
    /// Insert or update a position by its idempotency key.
    pub fn upsert_position(&self, position: &Position) -> StoreResult<()> {
        let meta = serde_json::to_string(&position.meta)?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO positions (
                    position_id, idempotency_key, symbol, timeframe, side, bias,
                    qty_total, qty_runner, entry_price, primary_sl_price, runner_stop_price,
                    status, entry_close_time_ms, opened_at_ms, closed_at_ms, exit_reason,
                    secondary_rule_checked, hist_entry, meta
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
                ON CONFLICT (idempotency_key) DO UPDATE SET
                    symbol = excluded.symbol,
                    timeframe = excluded.timeframe,
                    side = excluded.side,
                    bias = excluded.bias,
                    qty_total = excluded.qty_total,
                    qty_runner = excluded.qty_runner,
                    entry_price = excluded.entry_price,
                    primary_sl_price = excluded.primary_sl_price,
                    runner_stop_price = excluded.runner_stop_price,
                    status = excluded.status,
                    entry_close_time_ms = excluded.entry_close_time_ms,
                    opened_at_ms = excluded.opened_at_ms,
                    closed_at_ms = excluded.closed_at_ms,
                    exit_reason = excluded.exit_reason,
                    secondary_rule_checked = excluded.secondary_rule_checked,
                    hist_entry = excluded.hist_entry,
                    meta = excluded.meta
                "#,
                params![
                    position.position_id,
                    position.idempotency_key,
                    position.symbol,
                    position.timeframe.as_str(),
                    position.side.to_string(),
                    position.bias.to_string(),
                    dec_to_sql(position.qty_total),
                    dec_to_sql(position.qty_runner),
                    dec_to_sql(position.entry_price),
                    dec_to_sql(position.primary_sl_price),
                    dec_opt_to_sql(position.runner_stop_price),
                    position.status.to_string(),
                    position.entry_close_time_ms,
                    position.opened_at_ms,
                    position.closed_at_ms,
                    position.exit_reason.map(|r| r.as_str()),
                    position.secondary_rule_checked as i64,
                    position.hist_entry,
                    meta,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_position_by_idem(&self, idempotency_key: &str) -> StoreResult<Option<Position>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("{POSITION_SELECT} WHERE idempotency_key = ?1"),
                    params![idempotency_key],
                    position_from_row,
                )
                .optional()?;
            row.transpose()
        })
    }

    pub fn list_open_positions(&self) -> StoreResult<Vec<Position>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{POSITION_SELECT} WHERE status = 'OPEN' ORDER BY opened_at_ms"
            ))?;
            let rows = stmt.query_map([], position_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
    }

    /// OPEN plus CLOSING rows: everything that still needs exchange-side
    /// convergence.
    pub fn list_active_positions(&self) -> StoreResult<Vec<Position>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{POSITION_SELECT} WHERE status IN ('OPEN', 'CLOSING') ORDER BY opened_at_ms"
            ))?;
            let rows = stmt.query_map([], position_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
    }

    pub fn count_open_positions(&self) -> StoreResult<u32> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM positions WHERE status = 'OPEN'",
                [],
                |row| row.get(0),
            )?;
            Ok(count as u32)
        })
    }

    /// The OPEN position on the same (symbol, side), if any. Feeds the
    /// same-symbol-side mutex gate.
    pub fn find_open_same_direction(
        &self,
        symbol: &str,
        side: Side,
    ) -> StoreResult<Option<Position>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!(
                        "{POSITION_SELECT} WHERE status = 'OPEN' AND symbol = ?1 AND side = ?2 \
                         ORDER BY opened_at_ms LIMIT 1"
                    ),
                    params![symbol, side.to_string()],
                    position_from_row,
                )
                .optional()?;
            row.transpose()
        })
    }

    /// Terminal close. CLOSED rows are never reopened.
    pub fn mark_position_closed(
        &self,
        position_id: &str,
        closed_at_ms: i64,
        exit_reason: ExitReason,
        meta: &PositionMeta,
    ) -> StoreResult<()> {
        let meta = serde_json::to_string(meta)?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE positions SET status = 'CLOSED', closed_at_ms = ?2, exit_reason = ?3, meta = ?4 \
                 WHERE position_id = ?1 AND status != 'CLOSED'",
                params![position_id, closed_at_ms, exit_reason.as_str(), meta],
            )?;
            Ok(())
        })
    }

    pub fn update_position_meta(&self, position_id: &str, meta: &PositionMeta) -> StoreResult<()> {
        let meta = serde_json::to_string(meta)?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE positions SET meta = ?2 WHERE position_id = ?1",
                params![position_id, meta],
            )?;
            Ok(())
        })
    }

    pub fn update_runner_stop(
        &self,
        position_id: &str,
        runner_stop: rust_decimal::Decimal,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE positions SET runner_stop_price = ?2 WHERE position_id = ?1",
                params![position_id, dec_to_sql(runner_stop)],
            )?;
            Ok(())
        })
    }

    pub fn set_secondary_rule_checked(&self, position_id: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE positions SET secondary_rule_checked = 1 WHERE position_id = ?1",
                params![position_id],
            )?;
            Ok(())
        })
    }

    pub fn set_position_status(
        &self,
        position_id: &str,
        status: PositionStatus,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE positions SET status = ?2 WHERE position_id = ?1 AND status != 'CLOSED'",
                params![position_id, status.to_string()],
            )?;
            Ok(())
        })
    }
}

const POSITION_SELECT: &str = r#"
SELECT position_id, idempotency_key, symbol, timeframe, side, bias,
       qty_total, qty_runner, entry_price, primary_sl_price, runner_stop_price,
       status, entry_close_time_ms, opened_at_ms, closed_at_ms, exit_reason,
       secondary_rule_checked, hist_entry, meta
FROM positions
"#;

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<StoreResult<Position>> {
    Ok(build_position(row))
}

fn build_position(row: &Row<'_>) -> StoreResult<Position> {
    let timeframe: String = row.get(3)?;
    let side: String = row.get(4)?;
    let bias: String = row.get(5)?;
    let status: String = row.get(11)?;
    let exit_reason: Option<String> = row.get(15)?;
    let meta: String = row.get(18)?;
    Ok(Position {
        position_id: row.get(0)?,
        idempotency_key: row.get(1)?,
        symbol: row.get(2)?,
        timeframe: timeframe
            .parse::<Timeframe>()
            .map_err(crate::StoreError::Corrupt)?,
        side: side.parse::<Side>().map_err(crate::StoreError::Corrupt)?,
        bias: bias.parse::<Bias>().map_err(crate::StoreError::Corrupt)?,
        qty_total: dec_from_sql(&row.get::<_, String>(6)?)?,
        qty_runner: dec_from_sql(&row.get::<_, String>(7)?)?,
        entry_price: dec_from_sql(&row.get::<_, String>(8)?)?,
        primary_sl_price: dec_from_sql(&row.get::<_, String>(9)?)?,
        runner_stop_price: dec_opt_from_sql(row.get(10)?)?,
        status: status
            .parse::<PositionStatus>()
            .map_err(crate::StoreError::Corrupt)?,
        entry_close_time_ms: row.get(12)?,
        opened_at_ms: row.get(13)?,
        closed_at_ms: row.get(14)?,
        exit_reason: exit_reason
            .map(|r| r.parse::<ExitReason>())
            .transpose()
            .map_err(crate::StoreError::Corrupt)?,
        secondary_rule_checked: row.get::<_, i64>(16)? != 0,
        hist_entry: row.get(17)?,
        meta: serde_json::from_str(&meta)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn sample_position(key: &str) -> Position {
        Position {
            position_id: format!("pos-{key}"),
            idempotency_key: key.to_string(),
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::H1,
            side: Side::Buy,
            bias: Bias::Long,
            qty_total: Decimal::new(5, 2),
            qty_runner: Decimal::new(1, 2),
            entry_price: Decimal::from(30_000),
            primary_sl_price: Decimal::from(29_000),
            runner_stop_price: None,
            status: PositionStatus::Open,
            entry_close_time_ms: 1_000,
            opened_at_ms: 1_000,
            closed_at_ms: None,
            exit_reason: None,
            secondary_rule_checked: false,
            hist_entry: Some(-1.5),
            meta: PositionMeta::default(),
        }
    }

    #[test]
    fn upsert_is_idempotent_per_key() {
        let store = Store::open_in_memory().unwrap();
        let position = sample_position("k1");
        store.upsert_position(&position).unwrap();
        store.upsert_position(&position).unwrap();
        assert_eq!(store.count_open_positions().unwrap(), 1);

        let loaded = store.get_position_by_idem("k1").unwrap().unwrap();
        assert_eq!(loaded.qty_total, Decimal::new(5, 2));
        assert_eq!(loaded.timeframe, Timeframe::H1);
        assert_eq!(loaded.hist_entry, Some(-1.5));
    }

    #[test]
    fn same_direction_lookup_ignores_other_sides() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_position(&sample_position("k1")).unwrap();

        let hit = store
            .find_open_same_direction("BTCUSDT", Side::Buy)
            .unwrap();
        assert!(hit.is_some());
        let miss = store
            .find_open_same_direction("BTCUSDT", Side::Sell)
            .unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn closed_is_terminal() {
        let store = Store::open_in_memory().unwrap();
        let position = sample_position("k1");
        store.upsert_position(&position).unwrap();
        store
            .mark_position_closed(
                &position.position_id,
                2_000,
                ExitReason::PrimarySlHit,
                &position.meta,
            )
            .unwrap();

        // A later status write must not resurrect the row.
        store
            .set_position_status(&position.position_id, PositionStatus::Open)
            .unwrap();
        let loaded = store.get_position_by_idem("k1").unwrap().unwrap();
        assert_eq!(loaded.status, PositionStatus::Closed);
        assert_eq!(loaded.exit_reason, Some(ExitReason::PrimarySlHit));
        assert_eq!(loaded.closed_at_ms, Some(2_000));
        assert_eq!(store.count_open_positions().unwrap(), 0);
    }
}
