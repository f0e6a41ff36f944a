//! # Sale
//!
//! ```text
//!   draft ──complete──► completed ──void(reason)──► voided
//!                          │                          │
//!                          └─ sale: −qty per line     └─ sale_reversal: +qty per line
//! ```
//!
//! Replacement sales skip `draft`: they are written directly as `completed`
//! with a zero total by the replacement issuer, and their deductions are
//! booked as `replacement_issued` against the return.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Transition, WorkflowAction};
use crate::error::{CoreError, CoreResult};
use crate::ledger::{DocumentKind, Reference, StockKey, StockMutation, TransactionType};
use crate::quantity::Quantity;
use crate::validation::{validate_reason, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus {
    /// Cart being built; no stock effect yet.
    Draft,
    Completed,
    Voided,
}

impl fmt::Display for SaleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SaleStatus::Draft => "draft",
            SaleStatus::Completed => "completed",
            SaleStatus::Voided => "voided",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum SaleType {
    Regular,
    Replacement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleAction {
    Complete,
    Void { reason: String },
}

impl WorkflowAction for SaleAction {
    fn name(&self) -> &'static str {
        match self {
            SaleAction::Complete => "complete",
            SaleAction::Void { .. } => "void",
        }
    }

    fn permission(&self) -> &'static str {
        match self {
            SaleAction::Complete => "sale.complete",
            SaleAction::Void { .. } => "sale.void",
        }
    }

    fn validate(&self) -> ValidationResult<()> {
        if let SaleAction::Void { reason } = self {
            validate_reason("void_reason", reason)?;
        }
        Ok(())
    }
}

impl Transition for SaleStatus {
    type Action = SaleAction;
    const KIND: DocumentKind = DocumentKind::Sale;

    fn next(self, action: &SaleAction) -> Option<Self> {
        match (self, action) {
            (SaleStatus::Draft, SaleAction::Complete) => Some(SaleStatus::Completed),
            (SaleStatus::Completed, SaleAction::Void { .. }) => Some(SaleStatus::Voided),
            _ => None,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, SaleStatus::Voided)
    }
}

/// A sale transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Sale {
    pub id: String,
    /// Human-readable receipt number (YYYYMMDD-LC-NNNN).
    pub receipt_number: String,
    pub sale_type: SaleType,
    pub status: SaleStatus,
    pub customer_id: Option<String>,
    pub location_id: String,
    /// Total in cents. Always 0 for replacement sales.
    pub total_cents: i64,
    /// Set on replacement sales only.
    pub replacement_for_return_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub voided_by: Option<String>,
    pub voided_at: Option<DateTime<Utc>>,
    pub void_reason: Option<String>,
}

impl Sale {
    /// Returns, approvals of returns and replacements all need the sale to
    /// still be `completed`. A draft or voided sale refuses with action
    /// `return`.
    pub fn ensure_returnable(&self) -> CoreResult<()> {
        if self.status == SaleStatus::Completed {
            return Ok(());
        }
        Err(CoreError::InvalidTransition {
            document: DocumentKind::Sale.label().to_string(),
            id: self.id.clone(),
            status: self.status.to_string(),
            action: "return".to_string(),
        })
    }

    /// One deduction per line, booked as `sale`.
    pub fn completion_mutations(&self, items: &[SaleItem], actor_id: &str) -> Vec<StockMutation> {
        self.line_mutations(items, actor_id, true, TransactionType::Sale)
    }

    /// One restock per line, booked as `sale_reversal`.
    pub fn void_mutations(&self, items: &[SaleItem], actor_id: &str) -> Vec<StockMutation> {
        self.line_mutations(items, actor_id, false, TransactionType::SaleReversal)
    }

    fn line_mutations(
        &self,
        items: &[SaleItem],
        actor_id: &str,
        deduct: bool,
        transaction_type: TransactionType,
    ) -> Vec<StockMutation> {
        let reference = Reference::new(DocumentKind::Sale, &self.id);
        items
            .iter()
            .map(|item| {
                StockMutation::new(
                    StockKey::new(&item.product_variant_id, &self.location_id),
                    if deduct { -item.quantity } else { item.quantity },
                    transaction_type,
                    reference.clone(),
                    actor_id,
                )
            })
            .collect()
    }
}

/// Line item in a sale. Price is snapshotted at the time the line is added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SaleItem {
    pub id: String,
    pub sale_id: String,
    pub product_variant_id: String,
    pub quantity: Quantity,
    pub unit_price_cents: i64,
    pub line_total_cents: i64,
}
