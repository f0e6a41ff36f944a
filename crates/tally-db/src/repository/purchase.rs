//! # Purchase Order Repository
//!
//! Purchase orders, their lines, and the goods receipts recorded against
//! them. Each receipt call writes one `goods_receipts` row plus one
//! `goods_receipt_lines` row per requested line, including lines where
//! nothing was accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tally_core::workflow::{
    AcceptedLine, GoodsReceipt, PurchaseOrder, PurchaseOrderLine, PurchaseOrderStatus,
};
use tally_core::{DocumentKind, Quantity};
use tracing::debug;

use crate::error::{DbResult, LedgerResult};
use crate::repository::expect_one_row;

const ORDER_COLUMNS: &str = r#"
    id, supplier_id, location_id, status, created_by, created_at,
    approved_by, approved_at, cancelled_by, cancelled_at, received_at
"#;

const LINE_COLUMNS: &str = r#"
    id, purchase_order_id, product_variant_id, quantity_ordered, quantity_received, unit_cost_cents
"#;

/// One stored receipt line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ReceiptLineRecord {
    pub purchase_order_line_id: String,
    pub quantity_requested: Quantity,
    pub quantity_accepted: Quantity,
}

/// A goods receipt with its lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub receipt: GoodsReceipt,
    pub lines: Vec<ReceiptLineRecord>,
}

/// Repository for purchase orders and goods receipts.
#[derive(Debug, Clone)]
pub struct PurchaseRepository {
    pool: SqlitePool,
}

impl PurchaseRepository {
    /// Creates a new PurchaseRepository.
    pub fn new(pool: SqlitePool) -> Self {
        PurchaseRepository { pool }
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<PurchaseOrder>> {
        let mut conn = self.pool.acquire().await?;
        Self::load(&mut conn, id).await
    }

    pub async fn get_lines(&self, purchase_order_id: &str) -> DbResult<Vec<PurchaseOrderLine>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_lines(&mut conn, purchase_order_id).await
    }

    /// Receipts recorded against an order, oldest first.
    pub async fn receipts_for(&self, purchase_order_id: &str) -> DbResult<Vec<ReceiptRecord>> {
        let mut conn = self.pool.acquire().await?;

        let receipts = sqlx::query_as::<_, GoodsReceipt>(
            r#"
            SELECT id, purchase_order_id, location_id, received_by, received_at
            FROM goods_receipts
            WHERE purchase_order_id = ?1
            ORDER BY received_at, rowid
            "#,
        )
        .bind(purchase_order_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut records = Vec::with_capacity(receipts.len());
        for receipt in receipts {
            let lines = sqlx::query_as::<_, ReceiptLineRecord>(
                r#"
                SELECT purchase_order_line_id, quantity_requested, quantity_accepted
                FROM goods_receipt_lines
                WHERE goods_receipt_id = ?1
                ORDER BY id
                "#,
            )
            .bind(receipt.id.as_str())
            .fetch_all(&mut *conn)
            .await?;

            records.push(ReceiptRecord { receipt, lines });
        }

        Ok(records)
    }

    // =========================================================================
    // Unit side
    // =========================================================================

    pub async fn load(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<PurchaseOrder>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM purchase_orders WHERE id = ?1");
        let order = sqlx::query_as::<_, PurchaseOrder>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(order)
    }

    pub async fn load_lines(
        conn: &mut SqliteConnection,
        purchase_order_id: &str,
    ) -> DbResult<Vec<PurchaseOrderLine>> {
        let sql = format!(
            "SELECT {LINE_COLUMNS} FROM purchase_order_lines WHERE purchase_order_id = ?1 ORDER BY rowid"
        );
        let lines = sqlx::query_as::<_, PurchaseOrderLine>(&sql)
            .bind(purchase_order_id)
            .fetch_all(&mut *conn)
            .await?;

        Ok(lines)
    }

    pub async fn insert(conn: &mut SqliteConnection, order: &PurchaseOrder) -> DbResult<()> {
        debug!(id = %order.id, supplier = %order.supplier_id, "Inserting purchase order");

        sqlx::query(
            r#"
            INSERT INTO purchase_orders (id, supplier_id, location_id, status, created_by, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(order.id.as_str())
        .bind(order.supplier_id.as_str())
        .bind(order.location_id.as_str())
        .bind(order.status)
        .bind(order.created_by.as_str())
        .bind(order.created_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn insert_line(conn: &mut SqliteConnection, line: &PurchaseOrderLine) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO purchase_order_lines (
                id, purchase_order_id, product_variant_id, quantity_ordered,
                quantity_received, unit_cost_cents
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(line.id.as_str())
        .bind(line.purchase_order_id.as_str())
        .bind(line.product_variant_id.as_str())
        .bind(line.quantity_ordered)
        .bind(line.quantity_received)
        .bind(line.unit_cost_cents)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// `draft → approved`.
    pub async fn mark_approved(
        conn: &mut SqliteConnection,
        id: &str,
        actor_id: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE purchase_orders SET status = ?1, approved_by = ?2, approved_at = ?3
            WHERE id = ?4 AND status = ?5
            "#,
        )
        .bind(PurchaseOrderStatus::Approved)
        .bind(actor_id)
        .bind(at)
        .bind(id)
        .bind(PurchaseOrderStatus::Draft)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        expect_one_row(rows, DocumentKind::PurchaseOrder, id)
    }

    /// `draft | approved → cancelled`, guarded on the status the caller saw.
    pub async fn mark_cancelled(
        conn: &mut SqliteConnection,
        id: &str,
        from: PurchaseOrderStatus,
        actor_id: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE purchase_orders SET status = ?1, cancelled_by = ?2, cancelled_at = ?3
            WHERE id = ?4 AND status = ?5
            "#,
        )
        .bind(PurchaseOrderStatus::Cancelled)
        .bind(actor_id)
        .bind(at)
        .bind(id)
        .bind(from)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        expect_one_row(rows, DocumentKind::PurchaseOrder, id)
    }

    /// Adds `quantity` to a line's received total.
    ///
    /// Refused as a conflict if the line would exceed its ordered quantity,
    /// which only happens when another receipt got there first. The write is
    /// conditional on the received total read here.
    pub async fn add_received(
        conn: &mut SqliteConnection,
        purchase_order_id: &str,
        line_id: &str,
        quantity: Quantity,
    ) -> LedgerResult<()> {
        let conflict = || expect_one_row(0, DocumentKind::PurchaseOrder, purchase_order_id);

        let current: Option<(Quantity, Quantity)> = sqlx::query_as(
            r#"
            SELECT quantity_ordered, quantity_received
            FROM purchase_order_lines
            WHERE id = ?1 AND purchase_order_id = ?2
            "#,
        )
        .bind(line_id)
        .bind(purchase_order_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some((ordered, received)) = current else {
            return conflict();
        };
        let updated = match received.checked_add(quantity) {
            Some(total) if total <= ordered => total,
            _ => return conflict(),
        };

        let rows = sqlx::query(
            r#"
            UPDATE purchase_order_lines SET quantity_received = ?1
            WHERE id = ?2 AND purchase_order_id = ?3 AND quantity_received = ?4
            "#,
        )
        .bind(updated)
        .bind(line_id)
        .bind(purchase_order_id)
        .bind(received)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        expect_one_row(rows, DocumentKind::PurchaseOrder, purchase_order_id)
    }

    /// Status write after a receipt: `approved | partially_received →
    /// partially_received | received`. Reaching `received` stamps
    /// `received_at`.
    pub async fn set_receipt_status(
        conn: &mut SqliteConnection,
        id: &str,
        from: PurchaseOrderStatus,
        to: PurchaseOrderStatus,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let received_at = (to == PurchaseOrderStatus::Received).then_some(at);

        let rows = sqlx::query(
            r#"
            UPDATE purchase_orders SET status = ?1, received_at = COALESCE(?2, received_at)
            WHERE id = ?3 AND status = ?4
            "#,
        )
        .bind(to)
        .bind(received_at)
        .bind(id)
        .bind(from)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        expect_one_row(rows, DocumentKind::PurchaseOrder, id)
    }

    /// Records one receipt call with every planned line.
    pub async fn insert_goods_receipt(
        conn: &mut SqliteConnection,
        receipt: &GoodsReceipt,
        plan: &[AcceptedLine],
    ) -> DbResult<()> {
        debug!(
            id = %receipt.id,
            purchase_order_id = %receipt.purchase_order_id,
            lines = plan.len(),
            "Recording goods receipt"
        );

        sqlx::query(
            r#"
            INSERT INTO goods_receipts (id, purchase_order_id, location_id, received_by, received_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(receipt.id.as_str())
        .bind(receipt.purchase_order_id.as_str())
        .bind(receipt.location_id.as_str())
        .bind(receipt.received_by.as_str())
        .bind(receipt.received_at)
        .execute(&mut *conn)
        .await?;

        for line in plan {
            sqlx::query(
                r#"
                INSERT INTO goods_receipt_lines (
                    goods_receipt_id, purchase_order_line_id, quantity_requested, quantity_accepted
                ) VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(receipt.id.as_str())
            .bind(line.line_id.as_str())
            .bind(line.requested)
            .bind(line.accepted)
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    }
}
