//! # Balance Store
//!
//! Quantity on hand per (variant, location).
//!
//! ## Compare-and-Set
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  compare_and_set(key, expected, new)                                   │
//! │                                                                         │
//! │  UPDATE stock_balances SET quantity_available = new                    │
//! │   WHERE key = ? AND quantity_available = expected                      │
//! │       │                                                                 │
//! │       ├── 1 row  ──────────────────────────────────────────► Ok        │
//! │       │                                                                 │
//! │       └── 0 rows ── expected == 0 ? ── INSERT .. ON CONFLICT DO NOTHING │
//! │                          │                  │                           │
//! │                          no                 ├── 1 row ─────► Ok        │
//! │                          │                  └── 0 rows ─┐              │
//! │                          ▼                              ▼              │
//! │                        Stale ◄──────────────────────── Stale           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `expected` is compared as canonical text, the only form a quantity is ever
//! written in, so `2.5` matches a stored `2.5` exactly.
//!
//! A missing row reads as 0. Rows are created on the first mutation of a key
//! and never deleted; 0 is a valid resting balance.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tally_core::{Quantity, StockBalance, StockKey, ValidationError};
use tracing::debug;

use crate::error::{DbResult, LedgerError, LedgerResult};

/// Repository for stock balances.
#[derive(Debug, Clone)]
pub struct BalanceStore {
    pool: SqlitePool,
}

impl BalanceStore {
    /// Creates a new BalanceStore.
    pub fn new(pool: SqlitePool) -> Self {
        BalanceStore { pool }
    }

    // =========================================================================
    // Read side
    // =========================================================================

    /// Current quantity for `key`, 0 when the key was never mutated.
    pub async fn get(&self, key: &StockKey) -> DbResult<Quantity> {
        let mut conn = self.pool.acquire().await?;
        Self::read(&mut conn, key).await
    }

    /// The full balance row, if the key was ever mutated.
    pub async fn find(&self, key: &StockKey) -> DbResult<Option<StockBalance>> {
        let balance = sqlx::query_as::<_, StockBalance>(
            r#"
            SELECT product_variant_id, location_id, quantity_available, last_mutated_at
            FROM stock_balances
            WHERE product_variant_id = ?1 AND location_id = ?2
            "#,
        )
        .bind(key.product_variant_id.as_str())
        .bind(key.location_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(balance)
    }

    /// Every balance held at a location, ordered by variant.
    pub async fn list_for_location(&self, location_id: &str) -> DbResult<Vec<StockBalance>> {
        let balances = sqlx::query_as::<_, StockBalance>(
            r#"
            SELECT product_variant_id, location_id, quantity_available, last_mutated_at
            FROM stock_balances
            WHERE location_id = ?1
            ORDER BY product_variant_id
            "#,
        )
        .bind(location_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(balances)
    }

    /// Every location's balance for a variant, ordered by location.
    pub async fn list_for_variant(&self, product_variant_id: &str) -> DbResult<Vec<StockBalance>> {
        let balances = sqlx::query_as::<_, StockBalance>(
            r#"
            SELECT product_variant_id, location_id, quantity_available, last_mutated_at
            FROM stock_balances
            WHERE product_variant_id = ?1
            ORDER BY location_id
            "#,
        )
        .bind(product_variant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(balances)
    }

    // =========================================================================
    // Unit side
    // =========================================================================

    /// Reads the balance inside the caller's unit.
    pub async fn read(conn: &mut SqliteConnection, key: &StockKey) -> DbResult<Quantity> {
        let quantity: Option<Quantity> = sqlx::query_scalar(
            r#"
            SELECT quantity_available
            FROM stock_balances
            WHERE product_variant_id = ?1 AND location_id = ?2
            "#,
        )
        .bind(key.product_variant_id.as_str())
        .bind(key.location_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        Ok(quantity.unwrap_or(Quantity::ZERO))
    }

    /// Writes `new` only if the stored balance still equals `expected`.
    ///
    /// ## Returns
    /// * `Ok(())` - Written
    /// * `Err(Stale)` - The balance moved since it was read; nothing written
    pub async fn compare_and_set(
        conn: &mut SqliteConnection,
        key: &StockKey,
        expected: Quantity,
        new: Quantity,
    ) -> LedgerResult<()> {
        if new.is_negative() {
            return Err(ValidationError::MustNotBeNegative {
                field: "quantity_available".to_string(),
            }
            .into());
        }

        let now = Utc::now();

        let updated = sqlx::query(
            r#"
            UPDATE stock_balances
            SET quantity_available = ?1, last_mutated_at = ?2
            WHERE product_variant_id = ?3 AND location_id = ?4 AND quantity_available = ?5
            "#,
        )
        .bind(new)
        .bind(now)
        .bind(key.product_variant_id.as_str())
        .bind(key.location_id.as_str())
        .bind(expected)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if updated == 1 {
            debug!(key = %key, %expected, %new, "Balance updated");
            return Ok(());
        }

        if expected.is_zero() {
            let inserted = sqlx::query(
                r#"
                INSERT INTO stock_balances
                    (product_variant_id, location_id, quantity_available, last_mutated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT (product_variant_id, location_id) DO NOTHING
                "#,
            )
            .bind(key.product_variant_id.as_str())
            .bind(key.location_id.as_str())
            .bind(new)
            .bind(now)
            .execute(&mut *conn)
            .await?
            .rows_affected();

            if inserted == 1 {
                debug!(key = %key, %new, "Balance row created");
                return Ok(());
            }
        }

        debug!(key = %key, %expected, "Balance compare-and-set went stale");
        Err(LedgerError::Stale(key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    async fn setup() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_missing_key_reads_zero() {
        let db = setup().await;
        let key = StockKey::new("VAR-1", "LOC-A");

        assert_eq!(db.balances().get(&key).await.unwrap(), Quantity::ZERO);
        assert!(db.balances().find(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cas_creates_row_from_zero() {
        let db = setup().await;
        let key = StockKey::new("VAR-1", "LOC-A");

        let mut conn = db.pool().acquire().await.unwrap();
        BalanceStore::compare_and_set(&mut conn, &key, q("0"), q("12.5")).await.unwrap();
        drop(conn);

        let balance = db.balances().find(&key).await.unwrap().unwrap();
        assert_eq!(balance.quantity_available, q("12.5"));
        assert_eq!(balance.key(), key);
    }

    #[tokio::test]
    async fn test_cas_with_wrong_expectation_is_stale() {
        let db = setup().await;
        let key = StockKey::new("VAR-1", "LOC-A");

        let mut conn = db.pool().acquire().await.unwrap();
        BalanceStore::compare_and_set(&mut conn, &key, q("0"), q("10")).await.unwrap();

        let stale = BalanceStore::compare_and_set(&mut conn, &key, q("9.999"), q("5")).await;
        assert!(matches!(stale, Err(LedgerError::Stale(ref k)) if *k == key));

        // expected 0 against an existing non-zero row must not insert
        let stale_zero = BalanceStore::compare_and_set(&mut conn, &key, q("0"), q("5")).await;
        assert!(matches!(stale_zero, Err(LedgerError::Stale(_))));

        assert_eq!(BalanceStore::read(&mut conn, &key).await.unwrap(), q("10"));
    }

    #[tokio::test]
    async fn test_cas_refuses_negative() {
        let db = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let result =
            BalanceStore::compare_and_set(&mut conn, &StockKey::new("V", "L"), q("0"), q("-0.5"))
                .await;
        assert!(matches!(result, Err(LedgerError::Domain(_))));
    }

    #[tokio::test]
    async fn test_cas_matches_equal_values_written_with_trailing_zeros() {
        let db = setup().await;
        let key = StockKey::new("VAR-1", "LOC-A");
        let mut conn = db.pool().acquire().await.unwrap();

        BalanceStore::compare_and_set(&mut conn, &key, q("0"), q("7.50")).await.unwrap();
        BalanceStore::compare_and_set(&mut conn, &key, q("7.5"), q("3.000")).await.unwrap();

        let stored: String =
            sqlx::query_scalar("SELECT quantity_available FROM stock_balances")
                .fetch_one(&mut *conn)
                .await
                .unwrap();
        assert_eq!(stored, "3");
    }

    #[tokio::test]
    async fn test_listings() {
        let db = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        for (variant, location, qty) in [("V1", "A", "1"), ("V2", "A", "2"), ("V1", "B", "0.5")] {
            let key = StockKey::new(variant, location);
            BalanceStore::compare_and_set(&mut conn, &key, Quantity::ZERO, q(qty))
                .await
                .unwrap();
        }
        drop(conn);

        let at_a = db.balances().list_for_location("A").await.unwrap();
        assert_eq!(at_a.len(), 2);
        assert_eq!(at_a[0].product_variant_id, "V1");

        let v1 = db.balances().list_for_variant("V1").await.unwrap();
        assert_eq!(
            v1.iter().map(|b| b.quantity_available).collect::<Vec<_>>(),
            vec![q("1"), q("0.5")]
        );
    }
}
