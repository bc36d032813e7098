//! Order and fill repositories.

use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;

use krait_core::{Fill, Order, OrderPurpose, OrderStatus, OrderType, Side};

use crate::{dec_from_sql, dec_opt_from_sql, dec_opt_to_sql, dec_to_sql, Store, StoreResult};

/// Aggregated fill state of one order.
#[derive(Clone, Debug)]
pub struct FillProgress {
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub status: OrderStatus,
}

impl FillProgress {
    /// True when accumulated executions cover (within rounding) the order.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        if self.qty <= Decimal::ZERO {
            return false;
        }
        self.filled_qty >= self.qty * Decimal::new(999, 3)
    }
}

impl Store {
    /// Insert or update an order; unique per (idempotency_key, purpose).
    pub fn upsert_order(&self, order: &Order) -> StoreResult<()> {
        let payload = serde_json::to_string(&order.payload)?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO orders (
                    order_id, idempotency_key, symbol, purpose, side, order_type,
                    qty, price, reduce_only, status, venue_order_id, venue_order_link_id,
                    filled_qty, avg_price, submitted_at_ms, retry_count, last_fill_at_ms, payload
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                ON CONFLICT (idempotency_key, purpose) DO UPDATE SET
                    symbol = excluded.symbol,
                    side = excluded.side,
                    order_type = excluded.order_type,
                    qty = excluded.qty,
                    price = excluded.price,
                    reduce_only = excluded.reduce_only,
                    status = excluded.status,
                    venue_order_id = excluded.venue_order_id,
                    venue_order_link_id = excluded.venue_order_link_id,
                    filled_qty = excluded.filled_qty,
                    avg_price = excluded.avg_price,
                    submitted_at_ms = excluded.submitted_at_ms,
                    retry_count = excluded.retry_count,
                    last_fill_at_ms = excluded.last_fill_at_ms,
                    payload = excluded.payload
                "#,
                params![
                    order.order_id,
                    order.idempotency_key,
                    order.symbol,
                    order.purpose.as_str(),
                    order.side.to_string(),
                    order.order_type.as_venue(),
                    dec_to_sql(order.qty),
                    dec_opt_to_sql(order.price),
                    order.reduce_only as i64,
                    order.status.as_str(),
                    order.venue_order_id,
                    order.venue_order_link_id,
                    dec_to_sql(order.filled_qty),
                    dec_opt_to_sql(order.avg_price),
                    order.submitted_at_ms,
                    order.retry_count as i64,
                    order.last_fill_at_ms,
                    payload,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_order(
        &self,
        idempotency_key: &str,
        purpose: OrderPurpose,
    ) -> StoreResult<Option<Order>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("{ORDER_SELECT} WHERE idempotency_key = ?1 AND purpose = ?2"),
                params![idempotency_key, purpose.as_str()],
                order_from_row,
            )
            .optional()?
            .transpose()
        })
    }

    pub fn list_orders_by_idem(&self, idempotency_key: &str) -> StoreResult<Vec<Order>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{ORDER_SELECT} WHERE idempotency_key = ?1"))?;
            let rows = stmt.query_map(params![idempotency_key], order_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
    }

    /// Orders in a given local status with a given purpose; drives the entry
    /// order manager's scan for stalled ENTRY limits.
    pub fn list_orders_by_status(
        &self,
        status: OrderStatus,
        purpose: OrderPurpose,
    ) -> StoreResult<Vec<Order>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{ORDER_SELECT} WHERE status = ?1 AND purpose = ?2"))?;
            let rows = stmt.query_map(params![status.as_str(), purpose.as_str()], order_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
    }

    /// Resolve a local order from the venue identifiers a WS update carries.
    pub fn get_order_by_venue_ids(
        &self,
        venue_order_id: Option<&str>,
        venue_order_link_id: Option<&str>,
    ) -> StoreResult<Option<Order>> {
        self.with_conn(|conn| {
            if let Some(id) = venue_order_id {
                let found = conn
                    .query_row(
                        &format!("{ORDER_SELECT} WHERE venue_order_id = ?1"),
                        params![id],
                        order_from_row,
                    )
                    .optional()?
                    .transpose()?;
                if found.is_some() {
                    return Ok(found);
                }
            }
            if let Some(link) = venue_order_link_id {
                return conn
                    .query_row(
                        &format!("{ORDER_SELECT} WHERE venue_order_link_id = ?1"),
                        params![link],
                        order_from_row,
                    )
                    .optional()?
                    .transpose();
            }
            Ok(None)
        })
    }

    /// Converge an order's status/fill columns from a venue update. Terminal
    /// local states are never downgraded.
    pub fn update_order_from_venue(
        &self,
        order_id: &str,
        status: OrderStatus,
        filled_qty: Option<Decimal>,
        avg_price: Option<Decimal>,
        last_fill_at_ms: Option<i64>,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                UPDATE orders SET
                    status = ?2,
                    filled_qty = COALESCE(?3, filled_qty),
                    avg_price = COALESCE(?4, avg_price),
                    last_fill_at_ms = COALESCE(?5, last_fill_at_ms)
                WHERE order_id = ?1
                  AND status NOT IN ('FILLED', 'CANCELED', 'FAILED')
                "#,
                params![
                    order_id,
                    status.as_str(),
                    dec_opt_to_sql(filled_qty),
                    dec_opt_to_sql(avg_price),
                    last_fill_at_ms,
                ],
            )?;
            Ok(())
        })
    }

    /// Append-only fill insert keyed by venue execution id. Returns false on
    /// a duplicate delivery.
    pub fn insert_fill(&self, fill: &Fill) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                r#"
                INSERT OR IGNORE INTO fills (
                    fill_id, order_id, symbol, purpose, side, exec_qty, exec_price, fee, exec_time_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    fill.fill_id,
                    fill.order_id,
                    fill.symbol,
                    fill.purpose.as_str(),
                    fill.side.to_string(),
                    dec_to_sql(fill.exec_qty),
                    dec_to_sql(fill.exec_price),
                    dec_opt_to_sql(fill.fee),
                    fill.exec_time_ms,
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    /// Order quantity versus the sum of its recorded fills.
    pub fn fill_progress(&self, order_id: &str) -> StoreResult<Option<FillProgress>> {
        self.with_conn(|conn| {
            let order = conn
                .query_row(
                    "SELECT qty, status, avg_price FROM orders WHERE order_id = ?1",
                    params![order_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    },
                )
                .optional()?;
            let Some((qty, status, avg_price)) = order else {
                return Ok(None);
            };
            let filled: Option<String> = conn.query_row(
                "SELECT SUM(CAST(exec_qty AS REAL)) FROM fills WHERE order_id = ?1",
                params![order_id],
                |row| row.get::<_, Option<f64>>(0),
            )?
            .map(|f| f.to_string());
            Ok(Some(FillProgress {
                qty: dec_from_sql(&qty)?,
                filled_qty: filled
                    .map(|f| dec_from_sql(&f))
                    .transpose()?
                    .unwrap_or(Decimal::ZERO),
                avg_price: dec_opt_from_sql(avg_price)?,
                status: status
                    .parse::<OrderStatus>()
                    .map_err(crate::StoreError::Corrupt)?,
            }))
        })
    }
}

const ORDER_SELECT: &str = r#"
SELECT order_id, idempotency_key, symbol, purpose, side, order_type,
       qty, price, reduce_only, status, venue_order_id, venue_order_link_id,
       filled_qty, avg_price, submitted_at_ms, retry_count, last_fill_at_ms, payload
FROM orders
"#;

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<StoreResult<Order>> {
    Ok(build_order(row))
}

fn build_order(row: &Row<'_>) -> StoreResult<Order> {
    let purpose: String = row.get(3)?;
    let side: String = row.get(4)?;
    let order_type: String = row.get(5)?;
    let status: String = row.get(9)?;
    let payload: String = row.get(17)?;
    Ok(Order {
        order_id: row.get(0)?,
        idempotency_key: row.get(1)?,
        symbol: row.get(2)?,
        purpose: purpose
            .parse::<OrderPurpose>()
            .map_err(crate::StoreError::Corrupt)?,
        side: side.parse::<Side>().map_err(crate::StoreError::Corrupt)?,
        order_type: order_type
            .parse::<OrderType>()
            .map_err(crate::StoreError::Corrupt)?,
        qty: dec_from_sql(&row.get::<_, String>(6)?)?,
        price: dec_opt_from_sql(row.get(7)?)?,
        reduce_only: row.get::<_, i64>(8)? != 0,
        status: status
            .parse::<OrderStatus>()
            .map_err(crate::StoreError::Corrupt)?,
        venue_order_id: row.get(10)?,
        venue_order_link_id: row.get(11)?,
        filled_qty: dec_from_sql(&row.get::<_, String>(12)?)?,
        avg_price: dec_opt_from_sql(row.get(13)?)?,
        submitted_at_ms: row.get(14)?,
        retry_count: row.get::<_, i64>(15)? as u32,
        last_fill_at_ms: row.get(16)?,
        payload: serde_json::from_str(&payload)?,
    })
}
