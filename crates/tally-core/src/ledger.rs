//! # Ledger Types
//!
//! Balance keys, stock mutations and the two audit record shapes.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Ledger Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    StockKey     │   │  StockMutation  │   │  StockBalance   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  variant id     │   │  key            │   │  key            │       │
//! │  │  location id    │   │  signed delta   │   │  qty available  │       │
//! │  └─────────────────┘   │  txn type       │   │  last mutated   │       │
//! │                        │  reference      │   └─────────────────┘       │
//! │                        │  actor          │                              │
//! │                        └────────┬────────┘                              │
//! │                                 │ one commit produces exactly           │
//! │                    ┌────────────┴────────────┐                          │
//! │                    ▼                         ▼                          │
//! │  ┌──────────────────────────┐   ┌──────────────────────────┐           │
//! │  │  TransactionLogEntry     │   │  HistoryLogEntry         │           │
//! │  │  delta, resulting bal.   │   │  quantity change         │           │
//! │  │  type, reference, actor  │   │  type, reference         │           │
//! │  └──────────────────────────┘   └──────────────────────────┘           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::quantity::Quantity;

// =============================================================================
// Balance Key
// =============================================================================

/// Identifies one stock quantity: (product variant, location).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockKey {
    pub product_variant_id: String,
    pub location_id: String,
}

impl StockKey {
    pub fn new(product_variant_id: impl Into<String>, location_id: impl Into<String>) -> Self {
        StockKey {
            product_variant_id: product_variant_id.into(),
            location_id: location_id.into(),
        }
    }
}

impl fmt::Display for StockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.product_variant_id, self.location_id)
    }
}

// =============================================================================
// Transaction Type
// =============================================================================

/// Why a balance moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Opening,
    Sale,
    SaleReversal,
    CustomerReturn,
    ReplacementIssued,
    TransferOut,
    TransferIn,
    Receipt,
    Adjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Opening => "opening",
            TransactionType::Sale => "sale",
            TransactionType::SaleReversal => "sale_reversal",
            TransactionType::CustomerReturn => "customer_return",
            TransactionType::ReplacementIssued => "replacement_issued",
            TransactionType::TransferOut => "transfer_out",
            TransactionType::TransferIn => "transfer_in",
            TransactionType::Receipt => "receipt",
            TransactionType::Adjustment => "adjustment",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Document Kind & Reference
// =============================================================================

/// The business documents a ledger entry can point back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    OpeningStock,
    Sale,
    CustomerReturn,
    InventoryCorrection,
    StockTransfer,
    Expense,
    PurchaseOrder,
    GoodsReceipt,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::OpeningStock => "opening_stock",
            DocumentKind::Sale => "sale",
            DocumentKind::CustomerReturn => "customer_return",
            DocumentKind::InventoryCorrection => "inventory_correction",
            DocumentKind::StockTransfer => "stock_transfer",
            DocumentKind::Expense => "expense",
            DocumentKind::PurchaseOrder => "purchase_order",
            DocumentKind::GoodsReceipt => "goods_receipt",
        }
    }

    /// Human-readable label used in error messages.
    pub fn label(&self) -> &'static str {
        match self {
            DocumentKind::OpeningStock => "Opening stock",
            DocumentKind::Sale => "Sale",
            DocumentKind::CustomerReturn => "Customer return",
            DocumentKind::InventoryCorrection => "Inventory correction",
            DocumentKind::StockTransfer => "Stock transfer",
            DocumentKind::Expense => "Expense",
            DocumentKind::PurchaseOrder => "Purchase order",
            DocumentKind::GoodsReceipt => "Goods receipt",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Polymorphic pointer to the originating business document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub kind: DocumentKind,
    pub id: String,
}

impl Reference {
    pub fn new(kind: DocumentKind, id: impl Into<String>) -> Self {
        Reference {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// =============================================================================
// Stock Mutation
// =============================================================================

/// A requested change to one balance.
///
/// Built by workflows, consumed by the stock mutator. The mutation itself
/// holds no state about the current balance; [`StockMutation::apply_to`]
/// is the only place the non-negative rule is computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMutation {
    pub key: StockKey,
    /// Signed change: negative deducts, positive adds.
    pub delta: Quantity,
    pub transaction_type: TransactionType,
    pub reference: Reference,
    pub actor_id: String,
    pub note: Option<String>,
}

impl StockMutation {
    pub fn new(
        key: StockKey,
        delta: Quantity,
        transaction_type: TransactionType,
        reference: Reference,
        actor_id: impl Into<String>,
    ) -> Self {
        StockMutation {
            key,
            delta,
            transaction_type,
            reference,
            actor_id: actor_id.into(),
            note: None,
        }
    }

    /// Attaches a free-text note to the transaction log entry.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Computes the balance this mutation would leave behind.
    ///
    /// ## Returns
    /// * `Ok(candidate)` - `current + delta`, never negative
    /// * `Err(InsufficientStock)` - `available = current`, `requested = -delta`
    pub fn apply_to(&self, current: Quantity) -> CoreResult<Quantity> {
        let candidate = current.checked_add(self.delta).ok_or_else(|| {
            CoreError::Validation(ValidationError::Invalid {
                field: "quantity".to_string(),
                reason: "is out of range".to_string(),
            })
        })?;

        if candidate.is_negative() {
            return Err(CoreError::InsufficientStock {
                product_variant_id: self.key.product_variant_id.clone(),
                location_id: self.key.location_id.clone(),
                available: current,
                requested: -self.delta,
            });
        }

        Ok(candidate)
    }
}

/// What a committed mutation produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationReceipt {
    pub key: StockKey,
    pub previous_balance: Quantity,
    pub new_balance: Quantity,
    pub transaction_entry_id: i64,
    pub history_entry_id: i64,
}

// =============================================================================
// Stored Rows
// =============================================================================

/// Current quantity on hand for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct StockBalance {
    pub product_variant_id: String,
    pub location_id: String,
    pub quantity_available: Quantity,
    pub last_mutated_at: DateTime<Utc>,
}

impl StockBalance {
    pub fn key(&self) -> StockKey {
        StockKey::new(&self.product_variant_id, &self.location_id)
    }
}

/// Fine-grained, append-only audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct TransactionLogEntry {
    pub id: i64,
    pub product_variant_id: String,
    pub location_id: String,
    pub quantity_delta: Quantity,
    /// Balance snapshot immediately after this entry's mutation.
    pub resulting_balance: Quantity,
    pub transaction_type: TransactionType,
    pub reference_type: DocumentKind,
    pub reference_id: String,
    pub actor_id: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Business-facing audit row, one per transaction log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct HistoryLogEntry {
    pub id: i64,
    pub transaction_log_id: i64,
    pub product_variant_id: String,
    pub location_id: String,
    pub quantity_change: Quantity,
    pub transaction_type: TransactionType,
    pub reference_type: DocumentKind,
    pub reference_id: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Unit Tests
// =============================================================================
