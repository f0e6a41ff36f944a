//! # Inventory Correction Repository
//!
//! Corrections freeze the system count at submission; approval applies the
//! difference to whatever the balance is by then.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tally_core::workflow::{CorrectionStatus, InventoryCorrection};
use tally_core::{DocumentKind, StockKey};
use tracing::debug;

use crate::error::{DbResult, LedgerResult};
use crate::repository::expect_one_row;

const CORRECTION_COLUMNS: &str = r#"
    id, product_variant_id, location_id, system_count_at_submission, physical_count,
    reason, status, created_by, created_at, approved_by, approved_at,
    rejected_by, rejected_at, rejection_reason
"#;

/// Repository for inventory corrections.
#[derive(Debug, Clone)]
pub struct CorrectionRepository {
    pool: SqlitePool,
}

impl CorrectionRepository {
    /// Creates a new CorrectionRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CorrectionRepository { pool }
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<InventoryCorrection>> {
        let mut conn = self.pool.acquire().await?;
        Self::load(&mut conn, id).await
    }

    /// Pending corrections for a key, oldest first.
    pub async fn list_pending_for(&self, key: &StockKey) -> DbResult<Vec<InventoryCorrection>> {
        let sql = format!(
            r#"
            SELECT {CORRECTION_COLUMNS} FROM inventory_corrections
            WHERE product_variant_id = ?1 AND location_id = ?2 AND status = ?3
            ORDER BY created_at
            "#
        );
        let corrections = sqlx::query_as::<_, InventoryCorrection>(&sql)
            .bind(key.product_variant_id.as_str())
            .bind(key.location_id.as_str())
            .bind(CorrectionStatus::Pending)
            .fetch_all(&self.pool)
            .await?;

        Ok(corrections)
    }

    // =========================================================================
    // Unit side
    // =========================================================================

    pub async fn load(
        conn: &mut SqliteConnection,
        id: &str,
    ) -> DbResult<Option<InventoryCorrection>> {
        let sql = format!("SELECT {CORRECTION_COLUMNS} FROM inventory_corrections WHERE id = ?1");
        let correction = sqlx::query_as::<_, InventoryCorrection>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(correction)
    }

    pub async fn insert(
        conn: &mut SqliteConnection,
        correction: &InventoryCorrection,
    ) -> DbResult<()> {
        debug!(
            id = %correction.id,
            key = %correction.key(),
            system_count = %correction.system_count_at_submission,
            physical_count = %correction.physical_count,
            "Inserting inventory correction"
        );

        sqlx::query(
            r#"
            INSERT INTO inventory_corrections (
                id, product_variant_id, location_id, system_count_at_submission,
                physical_count, reason, status, created_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(correction.id.as_str())
        .bind(correction.product_variant_id.as_str())
        .bind(correction.location_id.as_str())
        .bind(correction.system_count_at_submission)
        .bind(correction.physical_count)
        .bind(correction.reason.as_deref())
        .bind(correction.status)
        .bind(correction.created_by.as_str())
        .bind(correction.created_at)
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
            UPDATE inventory_corrections SET status = ?1, approved_by = ?2, approved_at = ?3
            WHERE id = ?4 AND status = ?5
            "#,
        )
        .bind(CorrectionStatus::Approved)
        .bind(actor_id)
        .bind(at)
        .bind(id)
        .bind(CorrectionStatus::Pending)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        expect_one_row(rows, DocumentKind::InventoryCorrection, id)
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
            UPDATE inventory_corrections
            SET status = ?1, rejected_by = ?2, rejection_reason = ?3, rejected_at = ?4
            WHERE id = ?5 AND status = ?6
            "#,
        )
        .bind(CorrectionStatus::Rejected)
        .bind(actor_id)
        .bind(reason)
        .bind(at)
        .bind(id)
        .bind(CorrectionStatus::Pending)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        expect_one_row(rows, DocumentKind::InventoryCorrection, id)
    }
}
