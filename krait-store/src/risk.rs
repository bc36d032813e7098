//! Risk ledger, cooldowns and runtime flags.

use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;

use krait_core::ids::now_ms;
use krait_core::{Cooldown, RiskState, RiskStateMeta, Side, Timeframe};

use crate::{dec_opt_from_sql, dec_opt_to_sql, dec_to_sql, Store, StoreResult};

impl Store {
    /// Fetch today's risk row, creating an empty one on first touch.
    pub fn get_or_init_risk_state(&self, trade_date: &str, mode: &str) -> StoreResult<RiskState> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO risk_state (trade_date, mode) VALUES (?1, ?2) \
                 ON CONFLICT (trade_date) DO NOTHING",
                params![trade_date, mode],
            )?;
            conn.query_row(
                &format!("{RISK_SELECT} WHERE trade_date = ?1"),
                params![trade_date],
                risk_from_row,
            )?
        })
    }

    pub fn update_risk_state(&self, state: &RiskState) -> StoreResult<()> {
        let meta = serde_json::to_string(&state.meta)?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
                UPDATE risk_state SET
                    mode = ?2,
                    starting_equity = ?3,
                    current_equity = ?4,
                    min_equity = ?5,
                    max_equity = ?6,
                    drawdown_pct = ?7,
                    soft_halt = ?8,
                    hard_halt = ?9,
                    kill_switch = ?10,
                    meta = ?11
                WHERE trade_date = ?1
                "#,
                params![
                    state.trade_date,
                    state.mode,
                    dec_opt_to_sql(state.starting_equity),
                    dec_opt_to_sql(state.current_equity),
                    dec_opt_to_sql(state.min_equity),
                    dec_opt_to_sql(state.max_equity),
                    dec_to_sql(state.drawdown_pct),
                    state.soft_halt as i64,
                    state.hard_halt as i64,
                    state.kill_switch as i64,
                    meta,
                ],
            )?;
            Ok(())
        })
    }

    /// Consecutive-loss bookkeeping: negative PnL increments, anything else
    /// resets. Returns the new count.
    pub fn update_consecutive_loss_count(
        &self,
        trade_date: &str,
        mode: &str,
        pnl_usdt: Decimal,
    ) -> StoreResult<u32> {
        let mut state = self.get_or_init_risk_state(trade_date, mode)?;
        let next = if pnl_usdt < Decimal::ZERO {
            state.meta.consecutive_loss_count + 1
        } else {
            0
        };
        state.meta.consecutive_loss_count = next;
        self.update_risk_state(&state)?;
        Ok(next)
    }

    pub fn insert_cooldown(&self, cooldown: &Cooldown) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO cooldowns \
                 (cooldown_id, symbol, side, timeframe, reason, until_ts_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    cooldown.cooldown_id,
                    cooldown.symbol,
                    cooldown.side.to_string(),
                    cooldown.timeframe.as_str(),
                    cooldown.reason,
                    cooldown.until_ts_ms,
                ],
            )?;
            Ok(())
        })
    }

    /// An active cooldown row for (symbol, side, timeframe), if any. Multiple
    /// rows are tolerated; any with `until_ts_ms > now` blocks.
    pub fn active_cooldown(
        &self,
        symbol: &str,
        side: Side,
        timeframe: Timeframe,
        now_ms: i64,
    ) -> StoreResult<Option<Cooldown>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT cooldown_id, symbol, side, timeframe, reason, until_ts_ms \
                     FROM cooldowns \
                     WHERE symbol = ?1 AND side = ?2 AND timeframe = ?3 AND until_ts_ms > ?4 \
                     ORDER BY until_ts_ms DESC LIMIT 1",
                    params![symbol, side.to_string(), timeframe.as_str(), now_ms],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )
                .optional()?;
            let Some((cooldown_id, symbol, side, timeframe, reason, until_ts_ms)) = row else {
                return Ok(None);
            };
            Ok(Some(Cooldown {
                cooldown_id,
                symbol,
                side: side.parse().map_err(crate::StoreError::Corrupt)?,
                timeframe: timeframe.parse().map_err(crate::StoreError::Corrupt)?,
                reason,
                until_ts_ms,
            }))
        })
    }

    pub fn get_runtime_flag(&self, name: &str) -> StoreResult<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM runtime_flags WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn set_runtime_flag(&self, name: &str, value: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runtime_flags (name, value, updated_at_ms) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (name) DO UPDATE SET value = excluded.value, \
                 updated_at_ms = excluded.updated_at_ms",
                params![name, value, now_ms()],
            )?;
            Ok(())
        })
    }
}

const RISK_SELECT: &str = r#"
SELECT trade_date, mode, starting_equity, current_equity, min_equity, max_equity,
       drawdown_pct, soft_halt, hard_halt, kill_switch, meta
FROM risk_state
"#;

fn risk_from_row(row: &Row<'_>) -> rusqlite::Result<StoreResult<RiskState>> {
    Ok(build_risk(row))
}

fn build_risk(row: &Row<'_>) -> StoreResult<RiskState> {
    let meta: String = row.get(10)?;
    let meta: RiskStateMeta = serde_json::from_str(&meta)?;
    Ok(RiskState {
        trade_date: row.get(0)?,
        mode: row.get(1)?,
        starting_equity: dec_opt_from_sql(row.get(2)?)?,
        current_equity: dec_opt_from_sql(row.get(3)?)?,
        min_equity: dec_opt_from_sql(row.get(4)?)?,
        max_equity: dec_opt_from_sql(row.get(5)?)?,
        drawdown_pct: crate::dec_from_sql(&row.get::<_, String>(6)?)?,
        soft_halt: row.get::<_, i64>(7)? != 0,
        hard_halt: row.get::<_, i64>(8)? != 0,
        kill_switch: row.get::<_, i64>(9)? != 0,
        meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_state_initializes_once_per_date() {
        let store = Store::open_in_memory().unwrap();
        let first = store.get_or_init_risk_state("2026-08-02", "PAPER").unwrap();
        assert!(!first.blocks_entries());

        let mut updated = first.clone();
        updated.soft_halt = true;
        store.update_risk_state(&updated).unwrap();

        let again = store.get_or_init_risk_state("2026-08-02", "PAPER").unwrap();
        assert!(again.soft_halt);
        assert!(again.blocks_entries());
    }

    #[test]
    fn consecutive_losses_increment_and_reset() {
        let store = Store::open_in_memory().unwrap();
        let date = "2026-08-02";
        assert_eq!(
            store
                .update_consecutive_loss_count(date, "PAPER", Decimal::from(-50))
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .update_consecutive_loss_count(date, "PAPER", Decimal::from(-10))
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .update_consecutive_loss_count(date, "PAPER", Decimal::ZERO)
                .unwrap(),
            0,
            "break-even resets the streak"
        );
    }

    #[test]
    fn cooldowns_expire_by_timestamp() {
        let store = Store::open_in_memory().unwrap();
        let cooldown = Cooldown {
            cooldown_id: "cd-1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            timeframe: Timeframe::H1,
            reason: "PRIMARY_SL_HIT".into(),
            until_ts_ms: 10_000,
        };
        store.insert_cooldown(&cooldown).unwrap();

        let active = store
            .active_cooldown("BTCUSDT", Side::Buy, Timeframe::H1, 9_999)
            .unwrap();
        assert!(active.is_some());

        let expired = store
            .active_cooldown("BTCUSDT", Side::Buy, Timeframe::H1, 10_000)
            .unwrap();
        assert!(expired.is_none());

        let other_side = store
            .active_cooldown("BTCUSDT", Side::Sell, Timeframe::H1, 9_999)
            .unwrap();
        assert!(other_side.is_none());
    }

    #[test]
    fn runtime_flags_upsert() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_runtime_flag("KILL_SWITCH").unwrap().is_none());
        store.set_runtime_flag("KILL_SWITCH", "true").unwrap();
        store.set_runtime_flag("KILL_SWITCH", "false").unwrap();
        assert_eq!(
            store.get_runtime_flag("KILL_SWITCH").unwrap().as_deref(),
            Some("false")
        );
    }
}
