//! # Purchase Order & Goods Receipt
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  draft ──approve──► approved ──receive──► partially_received            │
//! │    │                   │   │                   │      ▲  │              │
//! │    └──cancel──┐        │   └──receive (all)──┐ └──────┘  │ receive      │
//! │               ▼        │                     ▼           ▼ (rest)       │
//! │           cancelled ◄──┘ cancel           received ◄─────┘              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Receipt Rules
//! - `accepted = min(requested, ordered − received)` per line
//! - `quantity_received` never exceeds `quantity_ordered`
//! - a receipt that accepts nothing at all is refused
//! - every receipt call is recorded as a [`GoodsReceipt`]; the ledger rows
//!   reference that receipt, not the order

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Transition, WorkflowAction};
use crate::error::{CoreResult, ValidationError};
use crate::ledger::{DocumentKind, StockKey};
use crate::quantity::Quantity;
use crate::validation::{validate_line_count, validate_line_quantity, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum PurchaseOrderStatus {
    Draft,
    Approved,
    PartiallyReceived,
    Received,
    Cancelled,
}

impl fmt::Display for PurchaseOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PurchaseOrderStatus::Draft => "draft",
            PurchaseOrderStatus::Approved => "approved",
            PurchaseOrderStatus::PartiallyReceived => "partially_received",
            PurchaseOrderStatus::Received => "received",
            PurchaseOrderStatus::Cancelled => "cancelled",
        })
    }
}

/// Requested quantity for one order line in a receipt call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLine {
    pub line_id: String,
    pub quantity: Quantity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseAction {
    Approve,
    Receive { lines: Vec<ReceiptLine> },
    Cancel,
}

impl WorkflowAction for PurchaseAction {
    fn name(&self) -> &'static str {
        match self {
            PurchaseAction::Approve => "approve",
            PurchaseAction::Receive { .. } => "receive",
            PurchaseAction::Cancel => "cancel",
        }
    }

    fn permission(&self) -> &'static str {
        match self {
            PurchaseAction::Approve => "purchase_order.approve",
            PurchaseAction::Receive { .. } => "purchase_order.receive",
            PurchaseAction::Cancel => "purchase_order.cancel",
        }
    }

    fn validate(&self) -> ValidationResult<()> {
        if let PurchaseAction::Receive { lines } = self {
            validate_line_count("receipt lines", lines.len())?;
            for line in lines {
                validate_line_quantity(line.quantity)?;
            }
        }
        Ok(())
    }
}

impl Transition for PurchaseOrderStatus {
    type Action = PurchaseAction;
    const KIND: DocumentKind = DocumentKind::PurchaseOrder;

    /// For `Receive` this yields `PartiallyReceived`; the engine promotes it
    /// to `Received` with [`status_after_receipt`] once quantities are known.
    fn next(self, action: &PurchaseAction) -> Option<Self> {
        use PurchaseAction as A;
        use PurchaseOrderStatus as S;

        match (self, action) {
            (S::Draft, A::Approve) => Some(S::Approved),
            (S::Draft | S::Approved, A::Cancel) => Some(S::Cancelled),
            (S::Approved | S::PartiallyReceived, A::Receive { .. }) => {
                Some(S::PartiallyReceived)
            }
            _ => None,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            PurchaseOrderStatus::Received | PurchaseOrderStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct PurchaseOrder {
    pub id: String,
    pub supplier_id: String,
    pub location_id: String,
    pub status: PurchaseOrderStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct PurchaseOrderLine {
    pub id: String,
    pub purchase_order_id: String,
    pub product_variant_id: String,
    pub quantity_ordered: Quantity,
    pub quantity_received: Quantity,
    pub unit_cost_cents: i64,
}

impl PurchaseOrderLine {
    pub fn outstanding(&self) -> Quantity {
        (self.quantity_ordered - self.quantity_received).max(Quantity::ZERO)
    }

    pub fn is_fully_received(&self) -> bool {
        self.quantity_received >= self.quantity_ordered
    }
}

/// One receipt call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct GoodsReceipt {
    pub id: String,
    pub purchase_order_id: String,
    pub location_id: String,
    pub received_by: String,
    pub received_at: DateTime<Utc>,
}

/// A receipt line after capping to what is still outstanding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedLine {
    pub line_id: String,
    pub key: StockKey,
    pub requested: Quantity,
    pub accepted: Quantity,
}

/// Caps each requested quantity to the line's outstanding quantity.
///
/// ## Arguments
/// * `location_id` - Where the order is received
/// * `lines` - Current order lines
/// * `requested` - Receipt request, one entry per order line
///
/// ## Returns
/// Accepted lines in request order, including zero-accepted lines so the
/// caller can report them. Fails if a line id is unknown or repeated, or if
/// nothing at all would be accepted.
pub fn plan_receipt(
    location_id: &str,
    lines: &[PurchaseOrderLine],
    requested: &[ReceiptLine],
) -> CoreResult<Vec<AcceptedLine>> {
    let mut plan: Vec<AcceptedLine> = Vec::with_capacity(requested.len());

    for request in requested {
        if plan.iter().any(|p| p.line_id == request.line_id) {
            return Err(ValidationError::Invalid {
                field: "line_id".to_string(),
                reason: format!("line {} appears more than once", request.line_id),
            }
            .into());
        }

        let line = lines
            .iter()
            .find(|l| l.id == request.line_id)
            .ok_or_else(|| ValidationError::Invalid {
                field: "line_id".to_string(),
                reason: format!("line {} is not on this order", request.line_id),
            })?;

        plan.push(AcceptedLine {
            line_id: line.id.clone(),
            key: StockKey::new(&line.product_variant_id, location_id),
            requested: request.quantity,
            accepted: request.quantity.min(line.outstanding()),
        });
    }

    if plan.iter().all(|p| p.accepted.is_zero()) {
        return Err(ValidationError::Invalid {
            field: "receipt lines".to_string(),
            reason: "every requested line is already fully received".to_string(),
        }
        .into());
    }

    Ok(plan)
}

/// Status once `lines` reflect the latest receipt.
pub fn status_after_receipt(lines: &[PurchaseOrderLine]) -> PurchaseOrderStatus {
    if lines.iter().all(PurchaseOrderLine::is_fully_received) {
        PurchaseOrderStatus::Received
    } else {
        PurchaseOrderStatus::PartiallyReceived
    }
}
