//! # Ledger Recorder
//!
//! Appends the two audit rows every stock mutation produces.
//!
//! ## Dual Append
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   inside the caller's unit of work                      │
//! │                                                                         │
//! │  INSERT INTO transaction_log (..)   ──► id = T                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  INSERT INTO history_log (transaction_log_id = T, ..)  ──► id = H      │
//! │                                                                         │
//! │  Either insert failing fails the unit: there is never a T without an   │
//! │  H, and never an H without its T.                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both tables reject UPDATE and DELETE at the database level.

use chrono::Utc;
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tally_core::{
    DocumentKind, HistoryLogEntry, Quantity, StockKey, StockMutation, TransactionLogEntry,
};
use tracing::debug;

use crate::error::{DbResult, LedgerResult};

/// Ids of the two rows one mutation produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntryIds {
    pub transaction_entry_id: i64,
    pub history_entry_id: i64,
}

/// A consistency problem found by [`LedgerRecorder::verify_pairing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PairingViolation {
    /// Transaction log row with no history twin.
    MissingHistory { transaction_log_id: i64 },
    /// History row whose twin does not exist.
    OrphanHistory { history_log_id: i64 },
    /// Twins disagree on key, quantity, type or reference.
    Mismatch {
        transaction_log_id: i64,
        history_log_id: i64,
    },
    /// Stored balance differs from the last entry's resulting balance.
    BalanceDrift {
        product_variant_id: String,
        location_id: String,
        balance: Quantity,
        last_resulting_balance: Quantity,
    },
}

/// Repository for the transaction log and history log.
#[derive(Debug, Clone)]
pub struct LedgerRecorder {
    pool: SqlitePool,
}

impl LedgerRecorder {
    /// Creates a new LedgerRecorder.
    pub fn new(pool: SqlitePool) -> Self {
        LedgerRecorder { pool }
    }

    // =========================================================================
    // Unit side
    // =========================================================================

    /// Appends one transaction log row and its history twin.
    ///
    /// ## Arguments
    /// * `conn` - The caller's open unit of work
    /// * `mutation` - The mutation just applied to the balance
    /// * `resulting_balance` - Balance immediately after the mutation
    pub async fn append(
        conn: &mut SqliteConnection,
        mutation: &StockMutation,
        resulting_balance: Quantity,
    ) -> LedgerResult<LedgerEntryIds> {
        let now = Utc::now();

        let transaction_entry_id = sqlx::query(
            r#"
            INSERT INTO transaction_log (
                product_variant_id, location_id, quantity_delta, resulting_balance,
                transaction_type, reference_type, reference_id, actor_id, note, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(mutation.key.product_variant_id.as_str())
        .bind(mutation.key.location_id.as_str())
        .bind(mutation.delta)
        .bind(resulting_balance)
        .bind(mutation.transaction_type)
        .bind(mutation.reference.kind)
        .bind(mutation.reference.id.as_str())
        .bind(mutation.actor_id.as_str())
        .bind(mutation.note.as_deref())
        .bind(now)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        let history_entry_id = sqlx::query(
            r#"
            INSERT INTO history_log (
                transaction_log_id, product_variant_id, location_id, quantity_change,
                transaction_type, reference_type, reference_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(transaction_entry_id)
        .bind(mutation.key.product_variant_id.as_str())
        .bind(mutation.key.location_id.as_str())
        .bind(mutation.delta)
        .bind(mutation.transaction_type)
        .bind(mutation.reference.kind)
        .bind(mutation.reference.id.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        debug!(
            key = %mutation.key,
            delta = %mutation.delta,
            transaction_type = %mutation.transaction_type,
            reference = %mutation.reference,
            transaction_entry_id,
            history_entry_id,
            "Ledger entries appended"
        );

        Ok(LedgerEntryIds {
            transaction_entry_id,
            history_entry_id,
        })
    }

    /// Whether any transaction log row exists for `key`, seen from the unit.
    pub async fn has_transactions_in(conn: &mut SqliteConnection, key: &StockKey) -> DbResult<bool> {
        let exists: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM transaction_log
                WHERE product_variant_id = ?1 AND location_id = ?2
            )
            "#,
        )
        .bind(key.product_variant_id.as_str())
        .bind(key.location_id.as_str())
        .fetch_one(&mut *conn)
        .await?;

        Ok(exists != 0)
    }

    // =========================================================================
    // Read side
    // =========================================================================

    /// Whether any transaction log row exists for `key`.
    pub async fn has_transactions(&self, key: &StockKey) -> DbResult<bool> {
        let mut conn = self.pool.acquire().await?;
        Self::has_transactions_in(&mut conn, key).await
    }

    /// Every transaction log row for `key`, oldest first.
    pub async fn transactions_for(&self, key: &StockKey) -> DbResult<Vec<TransactionLogEntry>> {
        let entries = sqlx::query_as::<_, TransactionLogEntry>(
            r#"
            SELECT id, product_variant_id, location_id, quantity_delta, resulting_balance,
                   transaction_type, reference_type, reference_id, actor_id, note, created_at
            FROM transaction_log
            WHERE product_variant_id = ?1 AND location_id = ?2
            ORDER BY id
            "#,
        )
        .bind(key.product_variant_id.as_str())
        .bind(key.location_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// Every transaction log row produced by one document, oldest first.
    pub async fn transactions_for_reference(
        &self,
        kind: DocumentKind,
        reference_id: &str,
    ) -> DbResult<Vec<TransactionLogEntry>> {
        let entries = sqlx::query_as::<_, TransactionLogEntry>(
            r#"
            SELECT id, product_variant_id, location_id, quantity_delta, resulting_balance,
                   transaction_type, reference_type, reference_id, actor_id, note, created_at
            FROM transaction_log
            WHERE reference_type = ?1 AND reference_id = ?2
            ORDER BY id
            "#,
        )
        .bind(kind)
        .bind(reference_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// Every history row produced by one document, oldest first.
    pub async fn history_for_reference(
        &self,
        kind: DocumentKind,
        reference_id: &str,
    ) -> DbResult<Vec<HistoryLogEntry>> {
        let entries = sqlx::query_as::<_, HistoryLogEntry>(
            r#"
            SELECT id, transaction_log_id, product_variant_id, location_id, quantity_change,
                   transaction_type, reference_type, reference_id, created_at
            FROM history_log
            WHERE reference_type = ?1 AND reference_id = ?2
            ORDER BY id
            "#,
        )
        .bind(kind)
        .bind(reference_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// Row counts of (transaction_log, history_log).
    pub async fn counts(&self) -> DbResult<(i64, i64)> {
        let counts: (i64, i64) = sqlx::query_as(
            r#"
            SELECT (SELECT COUNT(*) FROM transaction_log),
                   (SELECT COUNT(*) FROM history_log)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(counts)
    }

    /// Checks that both ledgers and the balances agree.
    ///
    /// Quantities are compared as decimals, not as stored text.
    ///
    /// ## Checks
    /// - every transaction row has exactly one history twin and vice versa
    /// - twins carry the same key, quantity, type and reference
    /// - each balance equals the resulting balance of its key's last entry
    ///
    /// ## Returns
    /// Every violation found; empty means consistent.
    pub async fn verify_pairing(&self) -> DbResult<Vec<PairingViolation>> {
        let mut violations = Vec::new();

        let missing: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT t.id
            FROM transaction_log t
            LEFT JOIN history_log h ON h.transaction_log_id = t.id
            WHERE h.id IS NULL
            ORDER BY t.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        violations.extend(
            missing
                .into_iter()
                .map(|(transaction_log_id,)| PairingViolation::MissingHistory { transaction_log_id }),
        );

        let orphans: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT h.id
            FROM history_log h
            LEFT JOIN transaction_log t ON t.id = h.transaction_log_id
            WHERE t.id IS NULL
            ORDER BY h.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        violations.extend(
            orphans
                .into_iter()
                .map(|(history_log_id,)| PairingViolation::OrphanHistory { history_log_id }),
        );

        let twins: Vec<(i64, i64, Quantity, Quantity, bool)> = sqlx::query_as(
            r#"
            SELECT t.id, h.id, t.quantity_delta, h.quantity_change,
                   (t.product_variant_id <> h.product_variant_id
                    OR t.location_id <> h.location_id
                    OR t.transaction_type <> h.transaction_type
                    OR t.reference_type <> h.reference_type
                    OR t.reference_id <> h.reference_id)
            FROM transaction_log t
            JOIN history_log h ON h.transaction_log_id = t.id
            ORDER BY t.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        violations.extend(
            twins
                .into_iter()
                .filter(|(_, _, delta, change, fields_differ)| *fields_differ || delta != change)
                .map(|(transaction_log_id, history_log_id, ..)| PairingViolation::Mismatch {
                    transaction_log_id,
                    history_log_id,
                }),
        );

        let balances: Vec<(String, String, Quantity, Option<Quantity>)> = sqlx::query_as(
            r#"
            SELECT b.product_variant_id, b.location_id, b.quantity_available,
                   t.resulting_balance
            FROM stock_balances b
            LEFT JOIN transaction_log t ON t.id = (
                SELECT MAX(id) FROM transaction_log
                WHERE product_variant_id = b.product_variant_id
                  AND location_id = b.location_id
            )
            ORDER BY b.product_variant_id, b.location_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        violations.extend(balances.into_iter().filter_map(
            |(product_variant_id, location_id, balance, last)| {
                let last_resulting_balance = last.unwrap_or(Quantity::ZERO);
                (balance != last_resulting_balance).then(|| PairingViolation::BalanceDrift {
                    product_variant_id,
                    location_id,
                    balance,
                    last_resulting_balance,
                })
            },
        ));

        Ok(violations)
    }
}
