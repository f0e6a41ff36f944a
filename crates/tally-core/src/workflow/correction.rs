//! # Inventory Correction
//!
//! ```text
//!   pending ──approve──► approved      (applies physical − system_at_submission)
//!      └─────reject───► rejected
//! ```
//!
//! `system_count_at_submission` is frozen when the correction is submitted.
//! Sales that happen between submission and approval do not change what the
//! correction means.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Transition, WorkflowAction};
use crate::ledger::{DocumentKind, StockKey};
use crate::quantity::Quantity;
use crate::validation::{validate_reason, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum CorrectionStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for CorrectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CorrectionStatus::Pending => "pending",
            CorrectionStatus::Approved => "approved",
            CorrectionStatus::Rejected => "rejected",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrectionAction {
    Approve,
    Reject { reason: String },
}

impl WorkflowAction for CorrectionAction {
    fn name(&self) -> &'static str {
        match self {
            CorrectionAction::Approve => "approve",
            CorrectionAction::Reject { .. } => "reject",
        }
    }

    fn permission(&self) -> &'static str {
        match self {
            CorrectionAction::Approve => "inventory_correction.approve",
            CorrectionAction::Reject { .. } => "inventory_correction.reject",
        }
    }

    fn validate(&self) -> ValidationResult<()> {
        if let CorrectionAction::Reject { reason } = self {
            validate_reason("rejection_reason", reason)?;
        }
        Ok(())
    }
}

impl Transition for CorrectionStatus {
    type Action = CorrectionAction;
    const KIND: DocumentKind = DocumentKind::InventoryCorrection;

    fn next(self, action: &CorrectionAction) -> Option<Self> {
        match (self, action) {
            (CorrectionStatus::Pending, CorrectionAction::Approve) => {
                Some(CorrectionStatus::Approved)
            }
            (CorrectionStatus::Pending, CorrectionAction::Reject { .. }) => {
                Some(CorrectionStatus::Rejected)
            }
            _ => None,
        }
    }

    fn is_terminal(self) -> bool {
        !matches!(self, CorrectionStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct InventoryCorrection {
    pub id: String,
    pub product_variant_id: String,
    pub location_id: String,
    /// Balance read at submission, never re-read.
    pub system_count_at_submission: Quantity,
    pub physical_count: Quantity,
    pub reason: Option<String>,
    pub status: CorrectionStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
}

impl InventoryCorrection {
    pub fn key(&self) -> StockKey {
        StockKey::new(&self.product_variant_id, &self.location_id)
    }

    /// The adjustment approval applies.
    pub fn difference(&self) -> Quantity {
        self.physical_count - self.system_count_at_submission
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difference_uses_frozen_baseline() {
        let correction = InventoryCorrection {
            id: "c-1".into(),
            product_variant_id: "VAR-1".into(),
            location_id: "LOC-A".into(),
            system_count_at_submission: "95.5".parse().unwrap(),
            physical_count: "93".parse().unwrap(),
            reason: None,
            status: CorrectionStatus::Pending,
            created_by: "u-1".into(),
            created_at: Utc::now(),
            approved_by: None,
            approved_at: None,
            rejected_by: None,
            rejected_at: None,
            rejection_reason: None,
        };
        assert_eq!(correction.difference().to_string(), "-2.5");
    }

    #[test]
    fn test_only_pending_moves() {
        assert_eq!(
            CorrectionStatus::Pending.next(&CorrectionAction::Approve),
            Some(CorrectionStatus::Approved)
        );
        assert!(CorrectionStatus::Approved
            .next(&CorrectionAction::Approve)
            .is_none());
        assert!(CorrectionStatus::Rejected.is_terminal());
    }
}
