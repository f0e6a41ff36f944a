//! # Stock Transfer
//!
//! Moves goods between two locations.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   draft ──approve──► approved ──send──► sent ──complete──► completed    │
//! │     ▲  │                                 │                              │
//! │     │  └──cancel──► cancelled            └──reject──► rejected          │
//! │     │                                                    │              │
//! │     └──────────────────────reopen────────────────────────┘              │
//! │                                                                         │
//! │   Only `complete` touches stock:                                        │
//! │     transfer_out at source + transfer_in at destination, ONE unit       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Transition, WorkflowAction};
use crate::ledger::{DocumentKind, Reference, StockKey, StockMutation, TransactionType};
use crate::quantity::Quantity;
use crate::validation::{validate_reason, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Draft,
    Approved,
    Sent,
    Completed,
    Rejected,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Draft => "draft",
            TransferStatus::Approved => "approved",
            TransferStatus::Sent => "sent",
            TransferStatus::Completed => "completed",
            TransferStatus::Rejected => "rejected",
            TransferStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferAction {
    Approve,
    Send,
    Complete,
    /// Receiving side refuses the shipment.
    Reject {
        reason: String,
    },
    Reopen,
    Cancel,
}

impl WorkflowAction for TransferAction {
    fn name(&self) -> &'static str {
        match self {
            TransferAction::Approve => "approve",
            TransferAction::Send => "send",
            TransferAction::Complete => "complete",
            TransferAction::Reject { .. } => "reject",
            TransferAction::Reopen => "reopen",
            TransferAction::Cancel => "cancel",
        }
    }

    fn permission(&self) -> &'static str {
        match self {
            TransferAction::Approve => "stock_transfer.approve",
            TransferAction::Send => "stock_transfer.send",
            TransferAction::Complete => "stock_transfer.complete",
            TransferAction::Reject { .. } => "stock_transfer.reject",
            TransferAction::Reopen => "stock_transfer.reopen",
            TransferAction::Cancel => "stock_transfer.cancel",
        }
    }

    fn validate(&self) -> ValidationResult<()> {
        if let TransferAction::Reject { reason } = self {
            validate_reason("rejection_reason", reason)?;
        }
        Ok(())
    }
}

impl Transition for TransferStatus {
    type Action = TransferAction;
    const KIND: DocumentKind = DocumentKind::StockTransfer;

    fn next(self, action: &TransferAction) -> Option<Self> {
        use TransferAction as A;
        use TransferStatus as S;

        match (self, action) {
            (S::Draft, A::Approve) => Some(S::Approved),
            (S::Draft, A::Cancel) => Some(S::Cancelled),
            (S::Approved, A::Send) => Some(S::Sent),
            (S::Sent, A::Complete) => Some(S::Completed),
            (S::Sent, A::Reject { .. }) => Some(S::Rejected),
            (S::Rejected, A::Reopen) => Some(S::Draft),
            _ => None,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct StockTransfer {
    pub id: String,
    pub source_location_id: String,
    pub destination_location_id: String,
    pub status: TransferStatus,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub sent_by: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_by: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl StockTransfer {
    /// The paired mutations `complete` applies, in line order.
    ///
    /// Each line yields a `transfer_out` at the source followed by a
    /// `transfer_in` at the destination.
    pub fn completion_mutations(
        &self,
        items: &[TransferItem],
        actor_id: &str,
    ) -> Vec<StockMutation> {
        let reference = Reference::new(DocumentKind::StockTransfer, &self.id);

        items
            .iter()
            .flat_map(|item| {
                [
                    StockMutation::new(
                        StockKey::new(&item.product_variant_id, &self.source_location_id),
                        -item.quantity,
                        TransactionType::TransferOut,
                        reference.clone(),
                        actor_id,
                    ),
                    StockMutation::new(
                        StockKey::new(&item.product_variant_id, &self.destination_location_id),
                        item.quantity,
                        TransactionType::TransferIn,
                        reference.clone(),
                        actor_id,
                    ),
                ]
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct TransferItem {
    pub id: String,
    pub transfer_id: String,
    pub product_variant_id: String,
    pub quantity: Quantity,
}
