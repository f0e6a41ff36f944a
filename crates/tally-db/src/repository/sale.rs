//! # Sale Repository
//!
//! Database operations for sales and sale items.
//!
//! ## Sale Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sale Lifecycle                                    │
//! │                                                                         │
//! │  1. CREATE DRAFT                                                       │
//! │     └── insert() + insert_item() → Sale { status: Draft }              │
//! │                                                                         │
//! │  2. COMPLETE (same unit as the `sale` deductions)                      │
//! │     └── mark_completed() → Sale { status: Completed }                  │
//! │                                                                         │
//! │  3. (OPTIONAL) VOID (same unit as the `sale_reversal` restocks)        │
//! │     └── mark_voided() → Sale { status: Voided }                        │
//! │                                                                         │
//! │  Replacement sales are inserted directly as Completed.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tally_core::workflow::{Sale, SaleItem, SaleStatus};
use tally_core::{DocumentKind, Quantity};
use tracing::debug;

use crate::error::{DbResult, LedgerResult};
use crate::repository::expect_one_row;

const SALE_COLUMNS: &str = r#"
    id, receipt_number, sale_type, status, customer_id, location_id, total_cents,
    replacement_for_return_id, created_by, created_at, completed_at,
    voided_by, voided_at, void_reason
"#;

/// Repository for sale database operations.
#[derive(Debug, Clone)]
pub struct SaleRepository {
    pool: SqlitePool,
}

impl SaleRepository {
    /// Creates a new SaleRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SaleRepository { pool }
    }

    // =========================================================================
    // Read side
    // =========================================================================

    /// Gets a sale by ID.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Sale>> {
        let mut conn = self.pool.acquire().await?;
        Self::load(&mut conn, id).await
    }

    /// Gets the items of a sale.
    pub async fn get_items(&self, sale_id: &str) -> DbResult<Vec<SaleItem>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_items(&mut conn, sale_id).await
    }

    /// The replacement sale issued for a return, if any.
    pub async fn replacement_for(&self, return_id: &str) -> DbResult<Option<Sale>> {
        let sql = format!(
            "SELECT {SALE_COLUMNS} FROM sales WHERE replacement_for_return_id = ?1"
        );
        let sale = sqlx::query_as::<_, Sale>(&sql)
            .bind(return_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(sale)
    }

    // =========================================================================
    // Unit side
    // =========================================================================

    pub async fn load(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Sale>> {
        let sql = format!("SELECT {SALE_COLUMNS} FROM sales WHERE id = ?1");
        let sale = sqlx::query_as::<_, Sale>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(sale)
    }

    pub async fn load_items(conn: &mut SqliteConnection, sale_id: &str) -> DbResult<Vec<SaleItem>> {
        let items = sqlx::query_as::<_, SaleItem>(
            r#"
            SELECT id, sale_id, product_variant_id, quantity, unit_price_cents, line_total_cents
            FROM sale_items
            WHERE sale_id = ?1
            ORDER BY rowid
            "#,
        )
        .bind(sale_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(items)
    }

    /// Inserts a sale row as given.
    pub async fn insert(conn: &mut SqliteConnection, sale: &Sale) -> DbResult<()> {
        debug!(id = %sale.id, receipt_number = %sale.receipt_number, "Inserting sale");

        sqlx::query(
            r#"
            INSERT INTO sales (
                id, receipt_number, sale_type, status, customer_id, location_id, total_cents,
                replacement_for_return_id, created_by, created_at, completed_at,
                voided_by, voided_at, void_reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(sale.id.as_str())
        .bind(sale.receipt_number.as_str())
        .bind(sale.sale_type)
        .bind(sale.status)
        .bind(sale.customer_id.as_deref())
        .bind(sale.location_id.as_str())
        .bind(sale.total_cents)
        .bind(sale.replacement_for_return_id.as_deref())
        .bind(sale.created_by.as_str())
        .bind(sale.created_at)
        .bind(sale.completed_at)
        .bind(sale.voided_by.as_deref())
        .bind(sale.voided_at)
        .bind(sale.void_reason.as_deref())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Adds an item to a sale.
    ///
    /// Price is snapshotted on the item so history survives price changes.
    pub async fn insert_item(conn: &mut SqliteConnection, item: &SaleItem) -> DbResult<()> {
        debug!(sale_id = %item.sale_id, variant = %item.product_variant_id, "Adding sale item");

        sqlx::query(
            r#"
            INSERT INTO sale_items (
                id, sale_id, product_variant_id, quantity, unit_price_cents, line_total_cents
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(item.id.as_str())
        .bind(item.sale_id.as_str())
        .bind(item.product_variant_id.as_str())
        .bind(item.quantity)
        .bind(item.unit_price_cents)
        .bind(item.line_total_cents)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// `draft → completed`, only if the sale is still a draft.
    pub async fn mark_completed(
        conn: &mut SqliteConnection,
        id: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE sales SET status = ?1, completed_at = ?2
            WHERE id = ?3 AND status = ?4
            "#,
        )
        .bind(SaleStatus::Completed)
        .bind(at)
        .bind(id)
        .bind(SaleStatus::Draft)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        expect_one_row(rows, DocumentKind::Sale, id)
    }

    /// `completed → voided`, only if the sale is still completed.
    pub async fn mark_voided(
        conn: &mut SqliteConnection,
        id: &str,
        actor_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE sales SET status = ?1, voided_by = ?2, void_reason = ?3, voided_at = ?4
            WHERE id = ?5 AND status = ?6
            "#,
        )
        .bind(SaleStatus::Voided)
        .bind(actor_id)
        .bind(reason)
        .bind(at)
        .bind(id)
        .bind(SaleStatus::Completed)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        expect_one_row(rows, DocumentKind::Sale, id)
    }

    /// Next receipt number for `location_id` on the day of `at`.
    ///
    /// Counted inside the unit, so two units racing for the same number
    /// serialize on the write and the loser retries with a fresh count.
    pub async fn next_receipt_number(
        conn: &mut SqliteConnection,
        location_id: &str,
        at: DateTime<Utc>,
    ) -> DbResult<String> {
        let prefix = receipt_prefix(location_id, at);

        let issued: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sales WHERE receipt_number LIKE ?1 || '%'",
        )
        .bind(prefix.as_str())
        .fetch_one(&mut *conn)
        .await?;

        Ok(format!("{}{:04}", prefix, issued + 1))
    }
}

/// Receipt number prefix: `YYYYMMDD-LC-`.
///
/// ## Format
/// - YYYYMMDD: Date
/// - LC: Location code (last 2 chars of location_id, uppercased)
///
/// ## Example
/// `20260131-0A-` for location `LOC-0A`
fn receipt_prefix(location_id: &str, at: DateTime<Utc>) -> String {
    let date_part = at.format("%Y%m%d");

    let chars: Vec<char> = location_id.chars().collect();
    let location_code: String = if chars.len() < 2 {
        "00".to_string()
    } else {
        chars[chars.len() - 2..].iter().collect::<String>().to_uppercase()
    };

    format!("{}-{}-", date_part, location_code)
}
