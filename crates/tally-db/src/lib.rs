//! # tally-db: Database Layer for the Tally stock ledger
//!
//! SQLite storage for balances, the two audit ledgers and every workflow
//! document, plus the atomic unit-of-work runner all writes go through.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Data Flow                                  │
//! │                                                                         │
//! │  WorkflowEngine::transition(..)                                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐   ┌────────────────┐   ┌──────────────┐    │   │
//! │  │   │  Database     │   │ StockMutator   │   │  Migrations  │    │   │
//! │  │   │  atomic(..)   │──►│  BalanceStore  │   │  (embedded)  │    │   │
//! │  │   │  retry loop   │   │  LedgerRecorder│   │              │    │   │
//! │  │   └───────────────┘   └────────────────┘   └──────────────┘    │   │
//! │  │           │                                                     │   │
//! │  │           ▼                                                     │   │
//! │  │   Document repositories: sales, returns, corrections,          │   │
//! │  │   transfers, expenses, purchase orders                         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (WAL)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`unit`] - Atomic units of work with contention retry
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database and ledger error types
//! - [`repository`] - Balance store, ledger, stock mutator, documents
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig};
//! use tally_core::{Quantity, StockKey};
//!
//! let db = Database::new(DbConfig::new("tally.db")).await?;
//!
//! let key = StockKey::new("VAR-001", "LOC-A");
//! db.opening().set_opening_stock(&key, "12.5".parse()?, "admin").await?;
//! assert_eq!(db.balances().get(&key).await?, "12.5".parse::<Quantity>()?);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod unit;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult, LedgerError, LedgerResult};
pub use pool::{Database, DbConfig};
pub use unit::{RetryPolicy, UnitTx};

// Repository re-exports for convenience
pub use repository::balance::BalanceStore;
pub use repository::correction::CorrectionRepository;
pub use repository::customer_return::ReturnRepository;
pub use repository::expense::{ExpenseRepository, JournalEntry, PostedEntry};
pub use repository::ledger::{LedgerRecorder, PairingViolation};
pub use repository::opening::OpeningStockGuard;
pub use repository::purchase::{PurchaseRepository, ReceiptRecord};
pub use repository::sale::SaleRepository;
pub use repository::stock::StockMutator;
pub use repository::transfer::TransferRepository;
