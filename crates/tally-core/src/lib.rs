//! # tally-core: Pure Stock Ledger Logic
//!
//! This crate is the **heart** of the stock ledger. It contains the balance
//! keys, the two audit record shapes, every workflow state machine and the
//! domain error taxonomy, all as pure code with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Architecture                               │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 tally-engine (WorkflowEngine)                   │   │
//! │  │   exists? ─► valid state? ─► authorized? ─► business rules     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  ledger   │  │ workflow  │  │   error   │  │ validation│  │   │
//! │  │   │ StockKey  │  │ Transfer  │  │ CoreError │  │   rules   │  │   │
//! │  │   │ Mutation  │  │ Return .. │  │           │  │  checks   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tally-db (Database Layer)                    │   │
//! │  │       balances, ledgers, documents, atomic units of work        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ledger`] - Balance keys, mutations and the two audit record shapes
//! - [`quantity`] - Exact decimal stock quantities
//! - [`workflow`] - One explicit state machine per workflow document
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use tally_core::{DocumentKind, Quantity, Reference, StockKey, StockMutation, TransactionType};
//!
//! let key = StockKey::new("VAR-001", "LOC-A");
//! let sale = StockMutation::new(
//!     key,
//!     Quantity::from(-2),
//!     TransactionType::Sale,
//!     Reference::new(DocumentKind::Sale, "sale-1"),
//!     "cashier-7",
//! );
//!
//! // 100 on hand, selling 2 leaves 98
//! assert_eq!(sale.apply_to(Quantity::from(100)).unwrap(), Quantity::from(98));
//!
//! // 1 on hand cannot cover a sale of 2
//! assert!(sale.apply_to(Quantity::from(1)).is_err());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod ledger;
pub mod quantity;
pub mod validation;
pub mod workflow;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use ledger::*;
pub use quantity::Quantity;
pub use workflow::{Transition, WorkflowAction};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum number of line items on a single workflow document.
///
/// ## Business Reason
/// Every line becomes at least one ledger pair inside a single atomic unit;
/// a cap keeps those units short.
pub const MAX_DOCUMENT_LINES: usize = 200;

/// Maximum quantity on a single document line, in whole units.
pub const MAX_LINE_QUANTITY: i64 = 1_000_000;

/// Decimal places a quantity may carry (0.0001 kg, 0.0001 m).
pub const MAX_QUANTITY_SCALE: u32 = 4;

/// Maximum length of free-text reasons (void, reject, correction notes).
pub const MAX_REASON_LEN: usize = 500;
