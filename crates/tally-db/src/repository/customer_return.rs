//! # Customer Return Repository
//!
//! Returns, their lines, and the once-only replacement flag.
//!
//! ## Idempotency Flag
//! ```text
//! UPDATE customer_returns
//!    SET replacement_issued = 1, ..
//!  WHERE id = ? AND replacement_issued = 0
//!
//!  1 row  → this unit owns the issuance
//!  0 rows → someone else already issued; the unit fails AlreadyIssued
//! ```
//! The flip runs in the same unit as the replacement deductions, so a
//! committed flag always has its stock movements and vice versa.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tally_core::workflow::{CustomerReturn, ReturnItem, ReturnStatus};
use tally_core::{DocumentKind, Quantity};
use tracing::debug;

use crate::error::{DbResult, LedgerResult};
use crate::repository::expect_one_row;

const RETURN_COLUMNS: &str = r#"
    id, sale_id, customer_id, location_id, status, reason, created_by, created_at,
    approved_by, approved_at, rejected_by, rejected_at, rejection_reason,
    replacement_issued, replacement_issued_at, replacement_issued_by, replacement_sale_id
"#;

/// Repository for customer returns.
#[derive(Debug, Clone)]
pub struct ReturnRepository {
    pool: SqlitePool,
}

impl ReturnRepository {
    /// Creates a new ReturnRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ReturnRepository { pool }
    }

    // =========================================================================
    // Read side
    // =========================================================================

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<CustomerReturn>> {
        let mut conn = self.pool.acquire().await?;
        Self::load(&mut conn, id).await
    }

    pub async fn get_items(&self, return_id: &str) -> DbResult<Vec<ReturnItem>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_items(&mut conn, return_id).await
    }

    /// Every return raised against a sale, oldest first.
    pub async fn list_for_sale(&self, sale_id: &str) -> DbResult<Vec<CustomerReturn>> {
        let sql = format!(
            "SELECT {RETURN_COLUMNS} FROM customer_returns WHERE sale_id = ?1 ORDER BY created_at"
        );
        let returns = sqlx::query_as::<_, CustomerReturn>(&sql)
            .bind(sale_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(returns)
    }

    // =========================================================================
    // Unit side
    // =========================================================================

    pub async fn load(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<CustomerReturn>> {
        let sql = format!("SELECT {RETURN_COLUMNS} FROM customer_returns WHERE id = ?1");
        let customer_return = sqlx::query_as::<_, CustomerReturn>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(customer_return)
    }

    pub async fn load_items(
        conn: &mut SqliteConnection,
        return_id: &str,
    ) -> DbResult<Vec<ReturnItem>> {
        let items = sqlx::query_as::<_, ReturnItem>(
            r#"
            SELECT id, return_id, product_variant_id, location_id, quantity, condition, return_type
            FROM return_items
            WHERE return_id = ?1
            ORDER BY rowid
            "#,
        )
        .bind(return_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(items)
    }

    /// Quantity of `product_variant_id` already claimed by non-rejected
    /// returns against `sale_id`.
    ///
    /// Summed as decimals here; SQLite would sum the TEXT column as floats.
    pub async fn returned_quantity(
        conn: &mut SqliteConnection,
        sale_id: &str,
        product_variant_id: &str,
    ) -> DbResult<Quantity> {
        let claimed: Vec<Quantity> = sqlx::query_scalar(
            r#"
            SELECT ri.quantity
            FROM return_items ri
            JOIN customer_returns cr ON cr.id = ri.return_id
            WHERE cr.sale_id = ?1 AND ri.product_variant_id = ?2 AND cr.status <> ?3
            "#,
        )
        .bind(sale_id)
        .bind(product_variant_id)
        .bind(ReturnStatus::Rejected)
        .fetch_all(&mut *conn)
        .await?;

        Ok(claimed.into_iter().sum())
    }

    /// Whether any pending or approved return exists against `sale_id`.
    ///
    /// A sale with such a return cannot be voided: the return already
    /// restocks, or will restock, the same goods.
    pub async fn has_open_returns(conn: &mut SqliteConnection, sale_id: &str) -> DbResult<bool> {
        let exists: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM customer_returns
                WHERE sale_id = ?1 AND status <> ?2
            )
            "#,
        )
        .bind(sale_id)
        .bind(ReturnStatus::Rejected)
        .fetch_one(&mut *conn)
        .await?;

        Ok(exists != 0)
    }

    pub async fn insert(conn: &mut SqliteConnection, ret: &CustomerReturn) -> DbResult<()> {
        debug!(id = %ret.id, sale_id = %ret.sale_id, "Inserting customer return");

        sqlx::query(
            r#"
            INSERT INTO customer_returns (
                id, sale_id, customer_id, location_id, status, reason, created_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(ret.id.as_str())
        .bind(ret.sale_id.as_str())
        .bind(ret.customer_id.as_deref())
        .bind(ret.location_id.as_str())
        .bind(ret.status)
        .bind(ret.reason.as_deref())
        .bind(ret.created_by.as_str())
        .bind(ret.created_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn insert_item(conn: &mut SqliteConnection, item: &ReturnItem) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO return_items (
                id, return_id, product_variant_id, location_id, quantity, condition, return_type
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(item.id.as_str())
        .bind(item.return_id.as_str())
        .bind(item.product_variant_id.as_str())
        .bind(item.location_id.as_str())
        .bind(item.quantity)
        .bind(item.condition)
        .bind(item.return_type)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// `pending → approved`.
    pub async fn mark_approved(
        conn: &mut SqliteConnection,
        id: &str,
        actor_id: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE customer_returns SET status = ?1, approved_by = ?2, approved_at = ?3
            WHERE id = ?4 AND status = ?5
            "#,
        )
        .bind(ReturnStatus::Approved)
        .bind(actor_id)
        .bind(at)
        .bind(id)
        .bind(ReturnStatus::Pending)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        expect_one_row(rows, DocumentKind::CustomerReturn, id)
    }

    /// `pending → rejected`.
    pub async fn mark_rejected(
        conn: &mut SqliteConnection,
        id: &str,
        actor_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE customer_returns
            SET status = ?1, rejected_by = ?2, rejection_reason = ?3, rejected_at = ?4
            WHERE id = ?5 AND status = ?6
            "#,
        )
        .bind(ReturnStatus::Rejected)
        .bind(actor_id)
        .bind(reason)
        .bind(at)
        .bind(id)
        .bind(ReturnStatus::Pending)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        expect_one_row(rows, DocumentKind::CustomerReturn, id)
    }

    /// Flips the replacement flag false → true.
    ///
    /// ## Returns
    /// * `Ok(true)` - This call flipped it
    /// * `Ok(false)` - It was already set; nothing written
    pub async fn flip_replacement_issued(
        conn: &mut SqliteConnection,
        id: &str,
        actor_id: &str,
        replacement_sale_id: &str,
        at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE customer_returns
            SET replacement_issued = 1,
                replacement_issued_at = ?1,
                replacement_issued_by = ?2,
                replacement_sale_id = ?3
            WHERE id = ?4 AND replacement_issued = 0 AND status = ?5
            "#,
        )
        .bind(at)
        .bind(actor_id)
        .bind(replacement_sale_id)
        .bind(id)
        .bind(ReturnStatus::Approved)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }
}
