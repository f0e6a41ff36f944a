//! # Expense Repository
//!
//! Expenses and the journal entries posting and voiding write.
//!
//! Journal entries are append-only in practice: a void writes a reversing
//! entry and leaves the original in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tally_core::workflow::{is_balanced, Expense, ExpenseStatus, JournalLine};
use tally_core::{DocumentKind, Reference, ValidationError};
use tracing::debug;

use crate::error::{DbResult, LedgerResult};
use crate::repository::{expect_one_row, new_id};

const EXPENSE_COLUMNS: &str = r#"
    id, location_id, description, amount_cents, expense_account, payment_account,
    status, created_by, created_at, posted_by, posted_at, voided_by, voided_at, void_reason
"#;

/// Header of a journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct JournalEntry {
    pub id: String,
    pub reference_type: DocumentKind,
    pub reference_id: String,
    pub memo: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// A journal entry with its lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedEntry {
    pub entry: JournalEntry,
    pub lines: Vec<JournalLine>,
}

/// Repository for expenses and the general journal.
#[derive(Debug, Clone)]
pub struct ExpenseRepository {
    pool: SqlitePool,
}

impl ExpenseRepository {
    /// Creates a new ExpenseRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ExpenseRepository { pool }
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Expense>> {
        let mut conn = self.pool.acquire().await?;
        Self::load(&mut conn, id).await
    }

    /// Journal entries written for a document, in posting order.
    pub async fn journal_for(&self, reference: &Reference) -> DbResult<Vec<PostedEntry>> {
        let mut conn = self.pool.acquire().await?;

        let entries = sqlx::query_as::<_, JournalEntry>(
            r#"
            SELECT id, reference_type, reference_id, memo, created_by, created_at
            FROM journal_entries
            WHERE reference_type = ?1 AND reference_id = ?2
            ORDER BY created_at, rowid
            "#,
        )
        .bind(reference.kind)
        .bind(reference.id.as_str())
        .fetch_all(&mut *conn)
        .await?;

        let mut posted = Vec::with_capacity(entries.len());
        for entry in entries {
            let lines = sqlx::query_as::<_, JournalLine>(
                r#"
                SELECT account, debit_cents, credit_cents
                FROM journal_lines
                WHERE entry_id = ?1
                ORDER BY id
                "#,
            )
            .bind(entry.id.as_str())
            .fetch_all(&mut *conn)
            .await?;

            posted.push(PostedEntry { entry, lines });
        }

        Ok(posted)
    }

    // =========================================================================
    // Unit side
    // =========================================================================

    pub async fn load(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Expense>> {
        let sql = format!("SELECT {EXPENSE_COLUMNS} FROM expenses WHERE id = ?1");
        let expense = sqlx::query_as::<_, Expense>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(expense)
    }

    pub async fn insert(conn: &mut SqliteConnection, expense: &Expense) -> DbResult<()> {
        debug!(
            id = %expense.id,
            amount_cents = expense.amount_cents,
            account = %expense.expense_account,
            "Inserting expense"
        );

        sqlx::query(
            r#"
            INSERT INTO expenses (
                id, location_id, description, amount_cents, expense_account,
                payment_account, status, created_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(expense.id.as_str())
        .bind(expense.location_id.as_str())
        .bind(expense.description.as_str())
        .bind(expense.amount_cents)
        .bind(expense.expense_account.as_str())
        .bind(expense.payment_account.as_str())
        .bind(expense.status)
        .bind(expense.created_by.as_str())
        .bind(expense.created_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// `draft → posted`.
    pub async fn mark_posted(
        conn: &mut SqliteConnection,
        id: &str,
        actor_id: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE expenses SET status = ?1, posted_by = ?2, posted_at = ?3
            WHERE id = ?4 AND status = ?5
            "#,
        )
        .bind(ExpenseStatus::Posted)
        .bind(actor_id)
        .bind(at)
        .bind(id)
        .bind(ExpenseStatus::Draft)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        expect_one_row(rows, DocumentKind::Expense, id)
    }

    /// `posted → void`.
    pub async fn mark_voided(
        conn: &mut SqliteConnection,
        id: &str,
        actor_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE expenses SET status = ?1, voided_by = ?2, void_reason = ?3, voided_at = ?4
            WHERE id = ?5 AND status = ?6
            "#,
        )
        .bind(ExpenseStatus::Void)
        .bind(actor_id)
        .bind(reason)
        .bind(at)
        .bind(id)
        .bind(ExpenseStatus::Posted)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        expect_one_row(rows, DocumentKind::Expense, id)
    }

    /// Writes a journal entry and its lines, returning the entry id.
    ///
    /// Unbalanced or empty line sets are refused before anything is written.
    pub async fn insert_journal_entry(
        conn: &mut SqliteConnection,
        reference: &Reference,
        memo: &str,
        actor_id: &str,
        lines: &[JournalLine],
        at: DateTime<Utc>,
    ) -> LedgerResult<String> {
        if lines.is_empty() || !is_balanced(lines) {
            return Err(ValidationError::Invalid {
                field: "journal_lines".to_string(),
                reason: "debits must equal credits".to_string(),
            }
            .into());
        }

        let entry_id = new_id();
        debug!(entry_id = %entry_id, reference = %reference, lines = lines.len(), "Writing journal entry");

        sqlx::query(
            r#"
            INSERT INTO journal_entries (id, reference_type, reference_id, memo, created_by, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(entry_id.as_str())
        .bind(reference.kind)
        .bind(reference.id.as_str())
        .bind(memo)
        .bind(actor_id)
        .bind(at)
        .execute(&mut *conn)
        .await?;

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO journal_lines (entry_id, account, debit_cents, credit_cents)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(entry_id.as_str())
            .bind(line.account.as_str())
            .bind(line.debit_cents)
            .bind(line.credit_cents)
            .execute(&mut *conn)
            .await?;
        }

        Ok(entry_id)
    }
}
