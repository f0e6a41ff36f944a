//! # Stock Mutator
//!
//! The only code path that writes `stock_balances`.
//!
//! ## One Mutation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  current   = BalanceStore::read(key)                                   │
//! │  candidate = current + delta                                           │
//! │       │                                                                 │
//! │       ├── candidate < 0 ──► InsufficientStock { available: current,    │
//! │       │                                         requested: -delta }    │
//! │       │                     (nothing written)                          │
//! │       ▼                                                                 │
//! │  compare_and_set(key, current, candidate)                              │
//! │       │                                                                 │
//! │       ├── Stale ──► unit runner retries the whole unit                 │
//! │       ▼                                                                 │
//! │  LedgerRecorder::append(mutation, candidate)                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  MutationReceipt { previous, new, ledger ids }                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Workflows call [`StockMutator::apply`] several times inside one unit; a
//! single stand-alone adjustment goes through [`StockMutator::mutate`].

use sqlx::SqliteConnection;
use tally_core::{MutationReceipt, StockMutation};
use tracing::info;

use crate::error::LedgerResult;
use crate::pool::Database;
use crate::repository::balance::BalanceStore;
use crate::repository::ledger::LedgerRecorder;

/// Applies stock mutations.
#[derive(Debug, Clone)]
pub struct StockMutator {
    db: Database,
}

impl StockMutator {
    /// Creates a new StockMutator.
    pub fn new(db: Database) -> Self {
        StockMutator { db }
    }

    /// Applies one mutation inside the caller's unit of work.
    ///
    /// ## Returns
    /// * `Ok(MutationReceipt)` - Balance written and both ledger rows appended
    /// * `Err(Domain(InsufficientStock))` - Nothing written
    /// * `Err(Stale)` - Balance moved concurrently; the unit must be retried
    pub async fn apply(
        conn: &mut SqliteConnection,
        mutation: &StockMutation,
    ) -> LedgerResult<MutationReceipt> {
        let current = BalanceStore::read(conn, &mutation.key).await?;
        let candidate = mutation.apply_to(current)?;

        BalanceStore::compare_and_set(conn, &mutation.key, current, candidate).await?;
        let ids = LedgerRecorder::append(conn, mutation, candidate).await?;

        Ok(MutationReceipt {
            key: mutation.key.clone(),
            previous_balance: current,
            new_balance: candidate,
            transaction_entry_id: ids.transaction_entry_id,
            history_entry_id: ids.history_entry_id,
        })
    }

    /// Applies several mutations in order inside the caller's unit.
    ///
    /// Stops at the first failure; the caller's unit then rolls back every
    /// mutation applied before it.
    pub async fn apply_all(
        conn: &mut SqliteConnection,
        mutations: &[StockMutation],
    ) -> LedgerResult<Vec<MutationReceipt>> {
        let mut receipts = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            receipts.push(Self::apply(conn, mutation).await?);
        }
        Ok(receipts)
    }

    /// Applies one mutation in its own unit of work.
    ///
    /// ## Example
    /// ```rust,ignore
    /// let receipt = db.stock().mutate(&StockMutation::new(
    ///     StockKey::new("VAR-001", "LOC-A"),
    ///     Quantity::from(-2),
    ///     TransactionType::Sale,
    ///     Reference::new(DocumentKind::Sale, &sale.id),
    ///     "cashier-7",
    /// )).await?;
    /// ```
    pub async fn mutate(&self, mutation: &StockMutation) -> LedgerResult<MutationReceipt> {
        let receipt = self
            .db
            .atomic("stock mutation", |mut tx| async move {
                let result = Self::apply(&mut tx, mutation).await;
                (tx, result)
            })
            .await?;

        info!(
            key = %receipt.key,
            delta = %mutation.delta,
            new_balance = %receipt.new_balance,
            transaction_type = %mutation.transaction_type,
            "Stock mutated"
        );

        Ok(receipt)
    }
}
