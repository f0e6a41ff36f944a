//! # Workflow State Machines
//!
//! One explicit status enum and one transition function per document type.
//!
//! ## Shared Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  transition(document, action, actor)                    │
//! │                                                                         │
//! │  1. document exists?            ── no ──► DocumentNotFound             │
//! │  2. status.next(action)?        ── no ──► InvalidTransition            │
//! │  3. authorizer allows action?   ── no ──► Unauthorized                 │
//! │  4. action.validate() + stock   ── no ──► Validation / Insufficient    │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  stock mutations + new status + audit fields in ONE atomic unit        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Steps 2 and 4 live here as pure functions; steps 1 and 3 and the atomic
//! unit live in tally-db / tally-engine.

pub mod correction;
pub mod customer_return;
pub mod expense;
pub mod purchase;
pub mod sale;
pub mod transfer;

use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::ledger::DocumentKind;
use crate::validation::ValidationResult;

pub use correction::{CorrectionAction, CorrectionStatus, InventoryCorrection};
pub use customer_return::{
    CustomerReturn, ItemCondition, ReturnAction, ReturnItem, ReturnStatus, ReturnType,
};
pub use expense::{is_balanced, Expense, ExpenseAction, ExpenseStatus, JournalLine};
pub use purchase::{
    plan_receipt, status_after_receipt, AcceptedLine, GoodsReceipt, PurchaseAction,
    PurchaseOrder, PurchaseOrderLine, PurchaseOrderStatus, ReceiptLine,
};
pub use sale::{Sale, SaleAction, SaleItem, SaleStatus, SaleType};
pub use transfer::{StockTransfer, TransferAction, TransferItem, TransferStatus};

/// An action that can be requested on a workflow document.
pub trait WorkflowAction {
    /// Short verb used in errors and logs ("approve", "void").
    fn name(&self) -> &'static str;

    /// Permission string handed to the authorization collaborator.
    fn permission(&self) -> &'static str;

    /// Action-specific field checks (step 4 of the shared shape).
    fn validate(&self) -> ValidationResult<()> {
        Ok(())
    }
}

/// A document status that knows its own legal moves.
pub trait Transition: Copy + Eq + fmt::Display {
    type Action: WorkflowAction;

    /// Which document this status belongs to.
    const KIND: DocumentKind;

    /// The status `action` leads to, or `None` if `self` is not a valid
    /// source state for it.
    fn next(self, action: &Self::Action) -> Option<Self>;

    /// No further action is accepted.
    fn is_terminal(self) -> bool;

    /// Like [`Transition::next`] but with a typed error.
    fn apply(self, id: &str, action: &Self::Action) -> CoreResult<Self> {
        self.next(action).ok_or_else(|| CoreError::InvalidTransition {
            document: Self::KIND.label().to_string(),
            id: id.to_string(),
            status: self.to_string(),
            action: action.name().to_string(),
        })
    }
}
