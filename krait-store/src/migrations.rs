//! Forward-only schema migrations. Each entry runs at most once, inside a
//! transaction, and is recorded in `schema_migrations`.

use rusqlite::Connection;

use crate::StoreResult;

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            position_id TEXT PRIMARY KEY,
            idempotency_key TEXT NOT NULL UNIQUE,
            symbol TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            side TEXT NOT NULL,
            bias TEXT NOT NULL,
            qty_total TEXT NOT NULL,
            qty_runner TEXT NOT NULL,
            entry_price TEXT NOT NULL,
            primary_sl_price TEXT NOT NULL,
            runner_stop_price TEXT,
            status TEXT NOT NULL,
            entry_close_time_ms INTEGER NOT NULL,
            opened_at_ms INTEGER NOT NULL,
            closed_at_ms INTEGER,
            exit_reason TEXT,
            secondary_rule_checked INTEGER NOT NULL DEFAULT 0,
            hist_entry REAL,
            meta TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);
        CREATE INDEX IF NOT EXISTS idx_positions_symbol_side ON positions(symbol, side, status);

        CREATE TABLE IF NOT EXISTS orders (
            order_id TEXT PRIMARY KEY,
            idempotency_key TEXT NOT NULL,
            symbol TEXT NOT NULL,
            purpose TEXT NOT NULL,
            side TEXT NOT NULL,
            order_type TEXT NOT NULL,
            qty TEXT NOT NULL,
            price TEXT,
            reduce_only INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            venue_order_id TEXT,
            venue_order_link_id TEXT,
            filled_qty TEXT NOT NULL DEFAULT '0',
            avg_price TEXT,
            submitted_at_ms INTEGER,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_fill_at_ms INTEGER,
            payload TEXT NOT NULL DEFAULT '{}',
            UNIQUE (idempotency_key, purpose)
        );
        CREATE INDEX IF NOT EXISTS idx_orders_status_purpose ON orders(status, purpose);
        CREATE INDEX IF NOT EXISTS idx_orders_venue_id ON orders(venue_order_id);
        CREATE INDEX IF NOT EXISTS idx_orders_venue_link ON orders(venue_order_link_id);

        CREATE TABLE IF NOT EXISTS fills (
            fill_id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            purpose TEXT NOT NULL,
            side TEXT NOT NULL,
            exec_qty TEXT NOT NULL,
            exec_price TEXT NOT NULL,
            fee TEXT,
            exec_time_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_fills_order ON fills(order_id);

        CREATE TABLE IF NOT EXISTS execution_reports (
            event_id TEXT PRIMARY KEY,
            ts_ms INTEGER NOT NULL,
            idempotency_key TEXT NOT NULL,
            symbol TEXT NOT NULL,
            status TEXT NOT NULL,
            payload TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS risk_events (
            event_id TEXT PRIMARY KEY,
            trade_date TEXT NOT NULL,
            ts_ms INTEGER NOT NULL,
            type TEXT NOT NULL,
            severity TEXT NOT NULL,
            symbol TEXT,
            detail TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cooldowns (
            cooldown_id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            reason TEXT NOT NULL,
            until_ts_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_cooldowns_key ON cooldowns(symbol, side, timeframe, until_ts_ms);

        CREATE TABLE IF NOT EXISTS risk_state (
            trade_date TEXT PRIMARY KEY,
            mode TEXT NOT NULL,
            starting_equity TEXT,
            current_equity TEXT,
            min_equity TEXT,
            max_equity TEXT,
            drawdown_pct TEXT NOT NULL DEFAULT '0',
            soft_halt INTEGER NOT NULL DEFAULT 0,
            hard_halt INTEGER NOT NULL DEFAULT 0,
            kill_switch INTEGER NOT NULL DEFAULT 0,
            meta TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS runtime_flags (
            name TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS wallet_snapshots (
            snapshot_id TEXT PRIMARY KEY,
            ts_ms INTEGER NOT NULL,
            source TEXT NOT NULL,
            balance_usdt TEXT,
            equity_usdt TEXT,
            available_usdt TEXT,
            payload TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_wallet_snapshots_source ON wallet_snapshots(source, ts_ms);

        CREATE TABLE IF NOT EXISTS account_snapshots (
            snapshot_id TEXT PRIMARY KEY,
            ts_ms INTEGER NOT NULL,
            trade_date TEXT NOT NULL,
            mode TEXT NOT NULL,
            balance_usdt TEXT,
            equity_usdt TEXT,
            available_usdt TEXT,
            unrealized_pnl TEXT,
            position_count INTEGER NOT NULL DEFAULT 0,
            payload TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS bar_close_emits (
            symbol TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            close_time_ms INTEGER NOT NULL,
            PRIMARY KEY (symbol, timeframe, close_time_ms)
        );
        "#,
    ),
];

/// Apply all migrations newer than the recorded version.
pub fn run(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at_ms INTEGER NOT NULL DEFAULT (CAST(strftime('%s','now') AS INTEGER) * 1000)
        );",
    )?;
    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        conn.execute_batch("BEGIN")?;
        let applied = conn
            .execute_batch(sql)
            .and_then(|()| {
                conn.execute(
                    "INSERT INTO schema_migrations(version) VALUES (?1)",
                    [version],
                )
                .map(|_| ())
            });
        match applied {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(err.into());
            }
        }
    }
    Ok(())
}
