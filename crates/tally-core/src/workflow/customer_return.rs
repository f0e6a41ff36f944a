//! # Customer Return
//!
//! ```text
//!   pending ──approve──► approved ──issue_replacement──► approved + replacement_issued
//!      │                                 (once, flag only flips false → true)
//!      └──reject──► rejected
//! ```
//!
//! Approval restocks every `resellable` line. Refund lines stop there; the
//! refund itself is a financial side effect outside the stock ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Transition, WorkflowAction};
use crate::error::{CoreError, CoreResult};
use crate::ledger::{DocumentKind, StockKey};
use crate::quantity::Quantity;
use crate::validation::{validate_reason, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum ReturnStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for ReturnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReturnStatus::Pending => "pending",
            ReturnStatus::Approved => "approved",
            ReturnStatus::Rejected => "rejected",
        })
    }
}

/// Physical state of a returned item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum ItemCondition {
    /// Goes back on the shelf at approval.
    Resellable,
    Damaged,
}

/// What the customer gets back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum ReturnType {
    Refund,
    Replacement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnAction {
    Approve,
    Reject { reason: String },
    IssueReplacement,
}

impl WorkflowAction for ReturnAction {
    fn name(&self) -> &'static str {
        match self {
            ReturnAction::Approve => "approve",
            ReturnAction::Reject { .. } => "reject",
            ReturnAction::IssueReplacement => "issue replacement",
        }
    }

    fn permission(&self) -> &'static str {
        match self {
            ReturnAction::Approve => "customer_return.approve",
            ReturnAction::Reject { .. } => "customer_return.reject",
            ReturnAction::IssueReplacement => "customer_return.issue_replacement",
        }
    }

    fn validate(&self) -> ValidationResult<()> {
        if let ReturnAction::Reject { reason } = self {
            validate_reason("rejection_reason", reason)?;
        }
        Ok(())
    }
}

impl Transition for ReturnStatus {
    type Action = ReturnAction;
    const KIND: DocumentKind = DocumentKind::CustomerReturn;

    fn next(self, action: &ReturnAction) -> Option<Self> {
        match (self, action) {
            (ReturnStatus::Pending, ReturnAction::Approve) => Some(ReturnStatus::Approved),
            (ReturnStatus::Pending, ReturnAction::Reject { .. }) => Some(ReturnStatus::Rejected),
            (ReturnStatus::Approved, ReturnAction::IssueReplacement) => {
                Some(ReturnStatus::Approved)
            }
            _ => None,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, ReturnStatus::Rejected)
    }
}

/// A customer return against a completed sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct CustomerReturn {
    pub id: String,
    pub sale_id: String,
    pub customer_id: Option<String>,
    pub location_id: String,
    pub status: ReturnStatus,
    pub reason: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    /// Only ever flips false → true.
    pub replacement_issued: bool,
    pub replacement_issued_at: Option<DateTime<Utc>>,
    pub replacement_issued_by: Option<String>,
    pub replacement_sale_id: Option<String>,
}

impl CustomerReturn {
    /// Checks the idempotency flag first, then the status.
    ///
    /// The flag is checked before the status so a double-submitted "issue
    /// replacement" reports `AlreadyIssued` rather than a state error.
    pub fn ensure_replacement_issuable(&self) -> CoreResult<()> {
        if self.replacement_issued {
            return Err(CoreError::AlreadyIssued {
                return_id: self.id.clone(),
            });
        }
        self.status
            .apply(&self.id, &ReturnAction::IssueReplacement)
            .map(|_| ())
    }
}

/// One returned line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ReturnItem {
    pub id: String,
    pub return_id: String,
    pub product_variant_id: String,
    pub location_id: String,
    pub quantity: Quantity,
    pub condition: ItemCondition,
    pub return_type: ReturnType,
}

impl ReturnItem {
    pub fn key(&self) -> StockKey {
        StockKey::new(&self.product_variant_id, &self.location_id)
    }

    /// Whether approval puts this line back on the shelf.
    pub fn restocks_on_approval(&self) -> bool {
        self.condition == ItemCondition::Resellable
    }

    pub fn wants_replacement(&self) -> bool {
        self.return_type == ReturnType::Replacement
    }
}
