//! # Stock Transfer Repository
//!
//! Transfers, their lines, and conditional status writes. Each status
//! write stamps the audit columns belonging to the target status:
//!
//! | target    | columns written                                   |
//! |-----------|---------------------------------------------------|
//! | approved  | approved_by, approved_at                          |
//! | sent      | sent_by, sent_at                                  |
//! | completed | completed_by, completed_at                        |
//! | rejected  | rejected_by, rejected_at, rejection_reason        |
//! | cancelled | cancelled_by, cancelled_at                        |
//! | draft     | approval and dispatch stamps cleared (reopen)     |

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tally_core::workflow::{StockTransfer, TransferItem, TransferStatus};
use tally_core::DocumentKind;
use tracing::debug;

use crate::error::{DbResult, LedgerResult};
use crate::repository::expect_one_row;

const TRANSFER_COLUMNS: &str = r#"
    id, source_location_id, destination_location_id, status, notes, created_by, created_at,
    approved_by, approved_at, sent_by, sent_at, completed_by, completed_at,
    rejected_by, rejected_at, rejection_reason, cancelled_by, cancelled_at
"#;

/// Repository for stock transfers.
#[derive(Debug, Clone)]
pub struct TransferRepository {
    pool: SqlitePool,
}

impl TransferRepository {
    /// Creates a new TransferRepository.
    pub fn new(pool: SqlitePool) -> Self {
        TransferRepository { pool }
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<StockTransfer>> {
        let mut conn = self.pool.acquire().await?;
        Self::load(&mut conn, id).await
    }

    pub async fn get_items(&self, transfer_id: &str) -> DbResult<Vec<TransferItem>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_items(&mut conn, transfer_id).await
    }

    /// Transfers in a given status, oldest first.
    pub async fn list_by_status(&self, status: TransferStatus) -> DbResult<Vec<StockTransfer>> {
        let sql = format!(
            "SELECT {TRANSFER_COLUMNS} FROM stock_transfers WHERE status = ?1 ORDER BY created_at"
        );
        let transfers = sqlx::query_as::<_, StockTransfer>(&sql)
            .bind(status)
            .fetch_all(&self.pool)
            .await?;

        Ok(transfers)
    }

    // =========================================================================
    // Unit side
    // =========================================================================

    pub async fn load(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<StockTransfer>> {
        let sql = format!("SELECT {TRANSFER_COLUMNS} FROM stock_transfers WHERE id = ?1");
        let transfer = sqlx::query_as::<_, StockTransfer>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(transfer)
    }

    pub async fn load_items(
        conn: &mut SqliteConnection,
        transfer_id: &str,
    ) -> DbResult<Vec<TransferItem>> {
        let items = sqlx::query_as::<_, TransferItem>(
            r#"
            SELECT id, transfer_id, product_variant_id, quantity
            FROM transfer_items
            WHERE transfer_id = ?1
            ORDER BY rowid
            "#,
        )
        .bind(transfer_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(items)
    }

    pub async fn insert(conn: &mut SqliteConnection, transfer: &StockTransfer) -> DbResult<()> {
        debug!(
            id = %transfer.id,
            from = %transfer.source_location_id,
            to = %transfer.destination_location_id,
            "Inserting stock transfer"
        );

        sqlx::query(
            r#"
            INSERT INTO stock_transfers (
                id, source_location_id, destination_location_id, status, notes,
                created_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(transfer.id.as_str())
        .bind(transfer.source_location_id.as_str())
        .bind(transfer.destination_location_id.as_str())
        .bind(transfer.status)
        .bind(transfer.notes.as_deref())
        .bind(transfer.created_by.as_str())
        .bind(transfer.created_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn insert_item(conn: &mut SqliteConnection, item: &TransferItem) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transfer_items (id, transfer_id, product_variant_id, quantity)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(item.id.as_str())
        .bind(item.transfer_id.as_str())
        .bind(item.product_variant_id.as_str())
        .bind(item.quantity)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Moves `id` from `from` to `to` and stamps the target's audit columns.
    ///
    /// `reason` is only stored for `rejected`.
    pub async fn set_status(
        conn: &mut SqliteConnection,
        id: &str,
        from: TransferStatus,
        to: TransferStatus,
        actor_id: &str,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let (audit, stamped) = match to {
            TransferStatus::Approved => (", approved_by = ?4, approved_at = ?5", true),
            TransferStatus::Sent => (", sent_by = ?4, sent_at = ?5", true),
            TransferStatus::Completed => (", completed_by = ?4, completed_at = ?5", true),
            TransferStatus::Rejected => (
                ", rejected_by = ?4, rejected_at = ?5, rejection_reason = ?6",
                true,
            ),
            TransferStatus::Cancelled => (", cancelled_by = ?4, cancelled_at = ?5", true),
            TransferStatus::Draft => (
                ", approved_by = NULL, approved_at = NULL, sent_by = NULL, sent_at = NULL",
                false,
            ),
        };

        let sql = format!(
            "UPDATE stock_transfers SET status = ?1{audit} WHERE id = ?2 AND status = ?3"
        );

        let mut query = sqlx::query(&sql).bind(to).bind(id).bind(from);
        if stamped {
            query = query.bind(actor_id).bind(at);
        }
        if to == TransferStatus::Rejected {
            query = query.bind(reason);
        }

        let rows = query.execute(&mut *conn).await?.rows_affected();
        expect_one_row(rows, DocumentKind::StockTransfer, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::pool::{Database, DbConfig};

    fn draft() -> StockTransfer {
        StockTransfer {
            id: "t-1".into(),
            source_location_id: "LOC-A".into(),
            destination_location_id: "LOC-B".into(),
            status: TransferStatus::Draft,
            notes: None,
            created_by: "clerk".into(),
            created_at: Utc::now(),
            approved_by: None,
            approved_at: None,
            sent_by: None,
            sent_at: None,
            completed_by: None,
            completed_at: None,
            rejected_by: None,
            rejected_at: None,
            rejection_reason: None,
            cancelled_by: None,
            cancelled_at: None,
        }
    }

    #[tokio::test]
    async fn test_status_walk_stamps_audit_columns() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        TransferRepository::insert(&mut conn, &draft()).await.unwrap();

        use TransferStatus as S;
        TransferRepository::set_status(&mut conn, "t-1", S::Draft, S::Approved, "mgr", None, Utc::now())
            .await
            .unwrap();
        TransferRepository::set_status(&mut conn, "t-1", S::Approved, S::Sent, "driver", None, Utc::now())
            .await
            .unwrap();
        TransferRepository::set_status(
            &mut conn,
            "t-1",
            S::Sent,
            S::Rejected,
            "store-b",
            Some("damaged pallet"),
            Utc::now(),
        )
        .await
        .unwrap();

        let rejected = TransferRepository::load(&mut conn, "t-1").await.unwrap().unwrap();
        assert_eq!(rejected.status, S::Rejected);
        assert_eq!(rejected.sent_by.as_deref(), Some("driver"));
        assert_eq!(rejected.rejection_reason.as_deref(), Some("damaged pallet"));

        TransferRepository::set_status(&mut conn, "t-1", S::Rejected, S::Draft, "mgr", None, Utc::now())
            .await
            .unwrap();
        let reopened = TransferRepository::load(&mut conn, "t-1").await.unwrap().unwrap();
        assert_eq!(reopened.status, S::Draft);
        assert!(reopened.approved_by.is_none());
        assert!(reopened.sent_at.is_none());
    }

    #[tokio::test]
    async fn test_wrong_source_status_conflicts() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        TransferRepository::insert(&mut conn, &draft()).await.unwrap();

        let result = TransferRepository::set_status(
            &mut conn,
            "t-1",
            TransferStatus::Sent,
            TransferStatus::Completed,
            "store-b",
            None,
            Utc::now(),
        )
        .await;
        assert!(matches!(result, Err(LedgerError::Conflict { .. })));
        drop(conn);

        assert_eq!(
            db.transfers()
                .list_by_status(TransferStatus::Draft)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_same_location_is_refused_by_schema() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let mut transfer = draft();
        transfer.destination_location_id = "LOC-A".into();

        assert!(TransferRepository::insert(&mut conn, &transfer).await.is_err());
    }
}
