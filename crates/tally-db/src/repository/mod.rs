//! # Repository Module
//!
//! Database repository implementations for the stock ledger.
//!
//! ## Two Kinds of Method
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Read side (&self, own pooled connection)                              │
//! │       db.balances().get(&key)                                          │
//! │       db.ledger().transactions_for(&key)                               │
//! │       db.transfers().get_by_id(id)                                     │
//! │                                                                         │
//! │  Unit side (associated fn, caller's transaction)                       │
//! │       BalanceStore::compare_and_set(conn, ..)                          │
//! │       LedgerRecorder::append(conn, ..)                                 │
//! │       TransferRepository::load(conn, id)                               │
//! │                                                                         │
//! │  Unit-side functions never acquire a second connection, so they are    │
//! │  safe on a single-connection pool and always see their own writes.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`balance::BalanceStore`] - Quantity on hand with compare-and-set
//! - [`ledger::LedgerRecorder`] - Transaction log + history log
//! - [`stock::StockMutator`] - The only writer of balances
//! - [`opening::OpeningStockGuard`] - Once-only balance seeding
//! - [`sale::SaleRepository`] - Sales and sale items
//! - [`customer_return::ReturnRepository`] - Customer returns
//! - [`correction::CorrectionRepository`] - Inventory corrections
//! - [`transfer::TransferRepository`] - Stock transfers
//! - [`expense::ExpenseRepository`] - Expenses and journal entries
//! - [`purchase::PurchaseRepository`] - Purchase orders and goods receipts

pub mod balance;
pub mod correction;
pub mod customer_return;
pub mod expense;
pub mod ledger;
pub mod opening;
pub mod purchase;
pub mod sale;
pub mod stock;
pub mod transfer;

use tally_core::DocumentKind;

use crate::error::{LedgerError, LedgerResult};

/// Requires exactly one row to have been updated by a conditional status
/// write (`... WHERE id = ? AND status = ?`).
pub(crate) fn expect_one_row(rows: u64, kind: DocumentKind, id: &str) -> LedgerResult<()> {
    if rows == 1 {
        Ok(())
    } else {
        Err(LedgerError::Conflict {
            document: kind.label().to_string(),
            id: id.to_string(),
        })
    }
}

/// Fresh document / line id.
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
