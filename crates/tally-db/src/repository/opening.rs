//! # Opening Stock Guard
//!
//! Seeds a key's balance exactly once.
//!
//! ```text
//!   unset ──set_opening_stock──► set (locked forever)
//!
//!   "unset" means: no transaction_log row exists for the key, of any type.
//!   Setting a quantity of 0 still locks the key.
//! ```
//!
//! The check runs inside the same unit as the mutation. A partial unique
//! index on opening entries backs it up, and a violation of that index is
//! reported as `OpeningStockLocked` like the check itself.

use tally_core::validation::{validate_count, validate_id};
use tally_core::{
    CoreError, DocumentKind, MutationReceipt, Quantity, Reference, StockKey, StockMutation,
    TransactionType,
};
use tracing::info;

use crate::error::{LedgerError, LedgerResult};
use crate::pool::Database;
use crate::repository::ledger::LedgerRecorder;
use crate::repository::stock::StockMutator;

const OPENING_INDEX_COLUMN: &str = "transaction_log.product_variant_id";

/// Once-only balance initialization.
#[derive(Debug, Clone)]
pub struct OpeningStockGuard {
    db: Database,
}

impl OpeningStockGuard {
    /// Creates a new OpeningStockGuard.
    pub fn new(db: Database) -> Self {
        OpeningStockGuard { db }
    }

    /// Sets the opening quantity for `key`.
    ///
    /// ## Returns
    /// * `Ok(MutationReceipt)` - Opening entry written; the key is now locked
    /// * `Err(Domain(OpeningStockLocked))` - The key already has transactions
    /// * `Err(Domain(Validation))` - Negative quantity or empty ids
    pub async fn set_opening_stock(
        &self,
        key: &StockKey,
        quantity: Quantity,
        actor_id: &str,
    ) -> LedgerResult<MutationReceipt> {
        validate_id("product_variant_id", &key.product_variant_id)?;
        validate_id("location_id", &key.location_id)?;
        validate_count("quantity", quantity)?;

        let mutation = StockMutation::new(
            key.clone(),
            quantity,
            TransactionType::Opening,
            Reference::new(DocumentKind::OpeningStock, key.to_string()),
            actor_id,
        );

        let receipt = self
            .db
            .atomic("opening stock", |mut tx| {
                let mutation = &mutation;
                async move {
                    let result = Self::apply(&mut tx, mutation).await;
                    (tx, result)
                }
            })
            .await?;

        info!(key = %key, %quantity, actor_id, "Opening stock set");
        Ok(receipt)
    }

    /// Whether the key can still receive opening stock.
    pub async fn is_open(&self, key: &StockKey) -> LedgerResult<bool> {
        Ok(!self.db.ledger().has_transactions(key).await?)
    }

    async fn apply(
        conn: &mut sqlx::SqliteConnection,
        mutation: &StockMutation,
    ) -> LedgerResult<MutationReceipt> {
        if LedgerRecorder::has_transactions_in(conn, &mutation.key).await? {
            return Err(locked(&mutation.key));
        }

        StockMutator::apply(conn, mutation)
            .await
            .map_err(|err| match err {
                LedgerError::Db(db_err) if db_err.is_unique_violation_on(OPENING_INDEX_COLUMN) => {
                    locked(&mutation.key)
                }
                other => other,
            })
    }
}

fn locked(key: &StockKey) -> LedgerError {
    CoreError::OpeningStockLocked {
        product_variant_id: key.product_variant_id.clone(),
        location_id: key.location_id.clone(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbConfig;

    async fn setup() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    fn is_locked(result: &LedgerResult<MutationReceipt>) -> bool {
        matches!(
            result,
            Err(LedgerError::Domain(CoreError::OpeningStockLocked { .. }))
        )
    }

    #[tokio::test]
    async fn test_opening_sets_balance_once() {
        let db = setup().await;
        let key = StockKey::new("VAR-1", "LOC-A");

        let receipt = db.opening().set_opening_stock(&key, q("100.5"), "admin").await.unwrap();
        assert_eq!(receipt.new_balance, q("100.5"));
        assert!(!db.opening().is_open(&key).await.unwrap());

        let second = db.opening().set_opening_stock(&key, q("50"), "admin").await;
        assert!(is_locked(&second));
        assert_eq!(db.balances().get(&key).await.unwrap(), q("100.5"));
    }

    #[tokio::test]
    async fn test_zero_still_locks() {
        let db = setup().await;
        let key = StockKey::new("VAR-1", "LOC-A");

        db.opening().set_opening_stock(&key, Quantity::ZERO, "admin").await.unwrap();
        assert!(is_locked(
            &db.opening().set_opening_stock(&key, q("10"), "admin").await
        ));
    }

    #[tokio::test]
    async fn test_any_prior_transaction_locks() {
        let db = setup().await;
        let key = StockKey::new("VAR-1", "LOC-A");

        db.stock()
            .mutate(&StockMutation::new(
                key.clone(),
                q("4"),
                TransactionType::Receipt,
                Reference::new(DocumentKind::GoodsReceipt, "gr-1"),
                "clerk",
            ))
            .await
            .unwrap();

        assert!(is_locked(
            &db.opening().set_opening_stock(&key, q("10"), "admin").await
        ));
        assert_eq!(db.balances().get(&key).await.unwrap(), q("4"));
    }

    #[tokio::test]
    async fn test_negative_quantity_is_invalid() {
        let db = setup().await;
        let result = db
            .opening()
            .set_opening_stock(&StockKey::new("VAR-1", "LOC-A"), q("-1"), "admin")
            .await;
        assert!(matches!(
            result,
            Err(LedgerError::Domain(CoreError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn test_other_keys_stay_open() {
        let db = setup().await;
        db.opening()
            .set_opening_stock(&StockKey::new("VAR-1", "LOC-A"), q("5"), "admin")
            .await
            .unwrap();

        assert!(db
            .opening()
            .is_open(&StockKey::new("VAR-1", "LOC-B"))
            .await
            .unwrap());
    }
}
