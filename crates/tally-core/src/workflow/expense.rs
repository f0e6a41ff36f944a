//! # Expense
//!
//! ```text
//!   draft ──post──► posted ──void(reason)──► void
//!     │                │                       │
//!     │                └─ journal entry        └─ reversing journal entry
//!     └─ no accounting effect
//! ```
//!
//! Expenses never touch stock. Posting writes a balanced two-line journal
//! entry: debit the expense account, credit the account it was paid from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Transition, WorkflowAction};
use crate::ledger::DocumentKind;
use crate::validation::{validate_reason, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum ExpenseStatus {
    Draft,
    Posted,
    Void,
}

impl fmt::Display for ExpenseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExpenseStatus::Draft => "draft",
            ExpenseStatus::Posted => "posted",
            ExpenseStatus::Void => "void",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpenseAction {
    Post,
    Void { reason: String },
}

impl WorkflowAction for ExpenseAction {
    fn name(&self) -> &'static str {
        match self {
            ExpenseAction::Post => "post",
            ExpenseAction::Void { .. } => "void",
        }
    }

    fn permission(&self) -> &'static str {
        match self {
            ExpenseAction::Post => "expense.post",
            ExpenseAction::Void { .. } => "expense.void",
        }
    }

    fn validate(&self) -> ValidationResult<()> {
        if let ExpenseAction::Void { reason } = self {
            validate_reason("void_reason", reason)?;
        }
        Ok(())
    }
}

impl Transition for ExpenseStatus {
    type Action = ExpenseAction;
    const KIND: DocumentKind = DocumentKind::Expense;

    fn next(self, action: &ExpenseAction) -> Option<Self> {
        match (self, action) {
            (ExpenseStatus::Draft, ExpenseAction::Post) => Some(ExpenseStatus::Posted),
            (ExpenseStatus::Posted, ExpenseAction::Void { .. }) => Some(ExpenseStatus::Void),
            _ => None,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, ExpenseStatus::Void)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Expense {
    pub id: String,
    pub location_id: String,
    pub description: String,
    /// Amount in cents.
    pub amount_cents: i64,
    pub expense_account: String,
    pub payment_account: String,
    pub status: ExpenseStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub posted_by: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub voided_by: Option<String>,
    pub voided_at: Option<DateTime<Utc>>,
    pub void_reason: Option<String>,
}

impl Expense {
    /// Lines of the entry written at posting.
    pub fn posting_lines(&self) -> [JournalLine; 2] {
        [
            JournalLine::debit(&self.expense_account, self.amount_cents),
            JournalLine::credit(&self.payment_account, self.amount_cents),
        ]
    }

    /// Lines of the entry written at void, mirroring [`Expense::posting_lines`].
    pub fn reversal_lines(&self) -> [JournalLine; 2] {
        [
            JournalLine::debit(&self.payment_account, self.amount_cents),
            JournalLine::credit(&self.expense_account, self.amount_cents),
        ]
    }
}

/// One side of a journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct JournalLine {
    pub account: String,
    pub debit_cents: i64,
    pub credit_cents: i64,
}

impl JournalLine {
    pub fn debit(account: &str, cents: i64) -> Self {
        JournalLine {
            account: account.to_string(),
            debit_cents: cents,
            credit_cents: 0,
        }
    }

    pub fn credit(account: &str, cents: i64) -> Self {
        JournalLine {
            account: account.to_string(),
            debit_cents: 0,
            credit_cents: cents,
        }
    }
}

/// Whether total debits equal total credits.
pub fn is_balanced(lines: &[JournalLine]) -> bool {
    let debits: i64 = lines.iter().map(|l| l.debit_cents).sum();
    let credits: i64 = lines.iter().map(|l| l.credit_cents).sum();
    debits == credits
}
