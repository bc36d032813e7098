//! SQLite persistence for the execution core.
//!
//! All writes are upserts keyed on the business identity of the row
//! (idempotency key, event id, venue execution id), so re-delivered events
//! and retried operations never duplicate state. Money columns are stored as
//! decimal strings; JSON blobs hold the flexible meta/payload parts.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::Connection;
use rust_decimal::Decimal;
use thiserror::Error;

mod events;
mod migrations;
mod orders;
mod positions;
mod risk;

pub use events::{AccountSnapshotRow, WalletSnapshotRow};
pub use orders::FillProgress;

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the repository layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Handle over the execution database. Cheap to share behind an `Arc`; the
/// inner mutex keeps transactions short-lived and serialized.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and bring the schema forward.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Apply pending forward-only migrations. Safe to call repeatedly.
    fn migrate(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        migrations::run(&conn)
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }
}

pub(crate) fn dec_to_sql(value: Decimal) -> String {
    value.normalize().to_string()
}

pub(crate) fn dec_opt_to_sql(value: Option<Decimal>) -> Option<String> {
    value.map(dec_to_sql)
}

pub(crate) fn dec_from_sql(value: &str) -> StoreResult<Decimal> {
    Decimal::from_str(value).map_err(|err| StoreError::Corrupt(format!("decimal '{value}': {err}")))
}

pub(crate) fn dec_opt_from_sql(value: Option<String>) -> StoreResult<Option<Decimal>> {
    value.map(|v| dec_from_sql(&v)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let store = Store::open_in_memory().unwrap();
        // Second run must be a no-op, not an error.
        store.migrate().unwrap();
        let version: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert!(version >= 1);
    }

    #[test]
    fn open_creates_file_backed_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("execution.db");
        let store = Store::open(&path).unwrap();
        drop(store);
        assert!(path.exists());
        // Re-opening migrates forward without error.
        Store::open(&path).unwrap();
    }

    #[test]
    fn decimal_round_trip() {
        let d = Decimal::from_str("0.0500").unwrap();
        let s = dec_to_sql(d);
        assert_eq!(s, "0.05");
        assert_eq!(dec_from_sql(&s).unwrap(), d);
    }
}
