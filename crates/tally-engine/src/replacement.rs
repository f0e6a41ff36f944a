//! # Replacement Issuance
//!
//! Turns an approved customer return into a zero-price replacement sale
//! plus the matching stock deductions, at most once per return.
//!
//! ## Steps
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  outside the unit (fast refusal)                                       │
//! │    1. flag already set?              → AlreadyIssued                    │
//! │    2. status approved?               → InvalidTransition                │
//! │    3. authorized?                    → Unauthorized                     │
//! │    4. any replacement lines?         → Validation                       │
//! │                                                                         │
//! │  inside ONE unit                                                        │
//! │    1-2 again on a fresh read                                            │
//! │    original sale still completed?    → InvalidTransition                │
//! │    5. stock preflight per key        → InsufficientStock (nothing set)  │
//! │    6. replacement sale (completed, total 0, original customer/location) │
//! │    7. replacement_issued deductions referencing the return              │
//! │    8. flip flag WHERE replacement_issued = 0                            │
//! │       0 rows                         → AlreadyIssued, unit rolls back   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Partial availability is refused: every replacement line must be
//! coverable, or nothing is issued.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tally_core::workflow::{
    CustomerReturn, ReturnAction, ReturnItem, Sale, SaleItem, SaleStatus, SaleType,
};
use tally_core::{
    CoreError, DocumentKind, MutationReceipt, Quantity, Reference, StockKey, StockMutation,
    TransactionType, ValidationError, WorkflowAction,
};
use tally_db::{
    BalanceStore, Database, LedgerError, LedgerResult, ReturnRepository, SaleRepository,
    StockMutator,
};
use tracing::info;

use crate::auth::Authorizer;
use crate::engine::{new_id, receipt_clash};

/// What a successful issuance produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementOutcome {
    pub return_id: String,
    pub replacement_sale: Sale,
    pub replacement_items: Vec<SaleItem>,
    pub receipts: Vec<MutationReceipt>,
}

#[derive(Clone)]
pub struct ReplacementIssuer {
    db: Database,
    authorizer: Arc<dyn Authorizer>,
}

impl ReplacementIssuer {
    pub fn new(db: Database, authorizer: Arc<dyn Authorizer>) -> Self {
        ReplacementIssuer { db, authorizer }
    }

    /// Issues the replacement for `return_id`.
    ///
    /// ## Returns
    /// * `Ok(ReplacementOutcome)` - Sale, deductions and flag committed together
    /// * `Err(Domain(AlreadyIssued))` - Flag already set, possibly by a racing call
    /// * `Err(Domain(InsufficientStock))` - A replacement line cannot be covered
    pub async fn issue_replacement(
        &self,
        return_id: &str,
        actor_id: &str,
    ) -> LedgerResult<ReplacementOutcome> {
        let customer_return = self
            .db
            .returns()
            .get_by_id(return_id)
            .await?
            .ok_or_else(|| CoreError::not_found(DocumentKind::CustomerReturn.label(), return_id))?;
        customer_return.ensure_replacement_issuable()?;

        let action = ReturnAction::IssueReplacement;
        let reference = Reference::new(DocumentKind::CustomerReturn, return_id);
        if !self
            .authorizer
            .is_authorized(actor_id, action.permission(), &reference)
        {
            return Err(CoreError::Unauthorized {
                actor_id: actor_id.to_string(),
                permission: action.permission().to_string(),
            }
            .into());
        }

        let items = self.db.returns().get_items(return_id).await?;
        replacement_lines(return_id, &items)?;

        let at = Utc::now();
        let outcome = self
            .db
            .atomic("issue replacement", |mut tx| async move {
                let result = Self::issue_in_unit(&mut tx, return_id, actor_id, at).await;
                (tx, result)
            })
            .await?;

        info!(
            return_id,
            replacement_sale_id = %outcome.replacement_sale.id,
            receipt_number = %outcome.replacement_sale.receipt_number,
            lines = outcome.replacement_items.len(),
            actor_id,
            "Replacement issued"
        );

        Ok(outcome)
    }

    async fn issue_in_unit(
        conn: &mut sqlx::SqliteConnection,
        return_id: &str,
        actor_id: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<ReplacementOutcome> {
        let customer_return = ReturnRepository::load(conn, return_id)
            .await?
            .ok_or_else(|| CoreError::not_found(DocumentKind::CustomerReturn.label(), return_id))?;
        customer_return.ensure_replacement_issuable()?;

        let original = SaleRepository::load(conn, &customer_return.sale_id)
            .await?
            .ok_or_else(|| CoreError::not_found(DocumentKind::Sale.label(), &customer_return.sale_id))?;
        original.ensure_returnable()?;

        let items = ReturnRepository::load_items(conn, return_id).await?;
        let lines = replacement_lines(return_id, &items)?;

        let mutations = replacement_mutations(&customer_return, &lines, actor_id);
        preflight(conn, &mutations).await?;

        let sale = Sale {
            id: new_id(),
            receipt_number: SaleRepository::next_receipt_number(conn, &original.location_id, at)
                .await?,
            sale_type: SaleType::Replacement,
            status: SaleStatus::Completed,
            customer_id: original.customer_id.clone(),
            location_id: original.location_id.clone(),
            total_cents: 0,
            replacement_for_return_id: Some(return_id.to_string()),
            created_by: actor_id.to_string(),
            created_at: at,
            completed_at: Some(at),
            voided_by: None,
            voided_at: None,
            void_reason: None,
        };
        SaleRepository::insert(conn, &sale)
            .await
            .map_err(|e| receipt_clash(e, &sale.id))?;

        let mut sale_items = Vec::with_capacity(lines.len());
        for line in &lines {
            let item = SaleItem {
                id: new_id(),
                sale_id: sale.id.clone(),
                product_variant_id: line.product_variant_id.clone(),
                quantity: line.quantity,
                unit_price_cents: 0,
                line_total_cents: 0,
            };
            SaleRepository::insert_item(conn, &item).await?;
            sale_items.push(item);
        }

        let receipts = StockMutator::apply_all(conn, &mutations).await?;

        let flipped =
            ReturnRepository::flip_replacement_issued(conn, return_id, actor_id, &sale.id, at)
                .await?;
        if !flipped {
            return Err(LedgerError::Domain(CoreError::AlreadyIssued {
                return_id: return_id.to_string(),
            }));
        }

        Ok(ReplacementOutcome {
            return_id: return_id.to_string(),
            replacement_sale: sale,
            replacement_items: sale_items,
            receipts,
        })
    }
}

/// Lines the customer wants replaced. Empty is a validation error.
fn replacement_lines(return_id: &str, items: &[ReturnItem]) -> LedgerResult<Vec<ReturnItem>> {
    let lines: Vec<ReturnItem> = items
        .iter()
        .filter(|item| item.wants_replacement())
        .cloned()
        .collect();

    if lines.is_empty() {
        return Err(ValidationError::Invalid {
            field: "return_items".to_string(),
            reason: format!("return {return_id} has no replacement lines"),
        }
        .into());
    }

    Ok(lines)
}

fn replacement_mutations(
    customer_return: &CustomerReturn,
    lines: &[ReturnItem],
    actor_id: &str,
) -> Vec<StockMutation> {
    let reference = Reference::new(DocumentKind::CustomerReturn, &customer_return.id);
    lines
        .iter()
        .map(|line| {
            StockMutation::new(
                line.key(),
                -line.quantity,
                TransactionType::ReplacementIssued,
                reference.clone(),
                actor_id,
            )
        })
        .collect()
}

/// Refuses the whole issuance if any key cannot cover its total deduction.
async fn preflight(
    conn: &mut sqlx::SqliteConnection,
    mutations: &[StockMutation],
) -> LedgerResult<()> {
    let mut needed: BTreeMap<StockKey, Quantity> = BTreeMap::new();
    for mutation in mutations {
        *needed.entry(mutation.key.clone()).or_default() -= mutation.delta;
    }

    for (key, requested) in needed {
        let available = BalanceStore::read(conn, &key).await?;
        if available < requested {
            return Err(CoreError::InsufficientStock {
                product_variant_id: key.product_variant_id,
                location_id: key.location_id,
                available,
                requested,
            }
            .into());
        }
    }

    Ok(())
}
