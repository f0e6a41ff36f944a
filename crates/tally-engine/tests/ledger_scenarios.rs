//! End-to-end ledger scenarios through `WorkflowEngine`.
//!
//! Each test builds a fresh database. Most use the in-memory pool; the
//! concurrency tests need a real file so several connections can race.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tally_core::workflow::{
    CorrectionAction, ExpenseAction, ExpenseStatus, ItemCondition, JournalLine, PurchaseAction,
    PurchaseOrderStatus, ReceiptLine, ReturnAction, ReturnStatus, ReturnType, Sale, SaleAction,
    SaleStatus, SaleType, TransferAction, TransferStatus,
};
use tally_core::{CoreError, DocumentKind, Quantity, Reference, StockKey, TransactionType};
use tally_db::{Database, DbConfig, LedgerError, RetryPolicy, SaleRepository, StockMutator};
use tally_engine::{
    Alert, AlertDispatcher, AlertError, AlertSink, AllowAll, DocumentStatus, NewCorrection,
    NewExpense, NewPurchaseLine, NewPurchaseOrder, NewReturn, NewReturnLine, NewSale, NewSaleLine,
    NewTransfer, NewTransferLine, PermissionGrants, WorkflowEngine,
};
use uuid::Uuid;

const SHOP: &str = "LOC-01";
const ACTOR: &str = "user-1";

// =============================================================================
// Helpers
// =============================================================================

async fn setup() -> WorkflowEngine {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    WorkflowEngine::new(db, Arc::new(AllowAll))
}

/// A file-backed database that lets several connections write concurrently.
struct FileDb {
    path: PathBuf,
}

impl FileDb {
    fn new() -> Self {
        FileDb {
            path: std::env::temp_dir().join(format!("tally-{}.db", Uuid::new_v4())),
        }
    }

    async fn open(&self) -> Database {
        let retry = RetryPolicy::default()
            .max_attempts(50)
            .initial_backoff(Duration::from_millis(2))
            .max_backoff(Duration::from_millis(50));
        let config = DbConfig::new(&self.path)
            .max_connections(8)
            .busy_timeout(Duration::from_secs(10))
            .retry(retry);
        Database::new(config).await.unwrap()
    }
}

impl Drop for FileDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = self.path.clone().into_os_string();
            sidecar.push(suffix);
            let _ = std::fs::remove_file(sidecar);
        }
    }
}

fn key(variant: &str, location: &str) -> StockKey {
    StockKey::new(variant, location)
}

/// `3` or `"2.5"` as a quantity.
fn q(value: impl ToString) -> Quantity {
    value.to_string().parse().unwrap()
}

async fn open_stock(engine: &WorkflowEngine, variant: &str, location: &str, quantity: Quantity) {
    engine
        .database()
        .opening()
        .set_opening_stock(&key(variant, location), quantity, ACTOR)
        .await
        .unwrap();
}

async fn balance(engine: &WorkflowEngine, variant: &str, location: &str) -> Quantity {
    engine
        .database()
        .balances()
        .get(&key(variant, location))
        .await
        .unwrap()
}

async fn draft_sale(engine: &WorkflowEngine, variant: &str, quantity: Quantity) -> Sale {
    let input = NewSale {
        location_id: SHOP.to_string(),
        customer_id: Some("cust-1".to_string()),
        lines: vec![NewSaleLine {
            product_variant_id: variant.to_string(),
            quantity,
            unit_price_cents: 1_500,
        }],
    };
    engine.create_sale(input, ACTOR).await.unwrap()
}

async fn completed_sale(engine: &WorkflowEngine, variant: &str, quantity: Quantity) -> Sale {
    let sale = draft_sale(engine, variant, quantity).await;
    engine
        .transition(&sale.id, SaleAction::Complete, ACTOR)
        .await
        .unwrap();
    sale
}

fn replacement_return(sale_id: &str, variant: &str, quantity: Quantity) -> NewReturn {
    NewReturn {
        sale_id: sale_id.to_string(),
        reason: Some("Cracked casing".to_string()),
        lines: vec![NewReturnLine {
            product_variant_id: variant.to_string(),
            quantity,
            condition: ItemCondition::Resellable,
            return_type: ReturnType::Replacement,
        }],
    }
}

async fn assert_ledger_paired(engine: &WorkflowEngine) {
    let violations = engine.database().ledger().verify_pairing().await.unwrap();
    assert!(violations.is_empty(), "unpaired ledger rows: {violations:?}");
}

fn domain(err: &LedgerError) -> &CoreError {
    err.as_domain()
        .unwrap_or_else(|| panic!("expected a domain error, got {err:?}"))
}

// =============================================================================
// Sales, returns and replacements
// =============================================================================

#[tokio::test]
async fn test_sale_return_replacement_lifecycle() {
    let engine = setup().await;
    open_stock(&engine, "VAR-1", SHOP, q(100)).await;

    let sale = completed_sale(&engine, "VAR-1", q(2)).await;
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(98));

    let customer_return = engine
        .create_return(replacement_return(&sale.id, "VAR-1", q(1)), ACTOR)
        .await
        .unwrap();
    assert_eq!(customer_return.status, ReturnStatus::Pending);
    assert_eq!(customer_return.location_id, SHOP);
    assert_eq!(customer_return.customer_id.as_deref(), Some("cust-1"));

    let approved = engine
        .transition(&customer_return.id, ReturnAction::Approve, ACTOR)
        .await
        .unwrap();
    assert_eq!(approved.new_status, DocumentStatus::CustomerReturn(ReturnStatus::Approved));
    assert_eq!(approved.receipts.len(), 1);
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(99));

    let issued = engine
        .issue_replacement(&customer_return.id, ACTOR)
        .await
        .unwrap();
    assert_eq!(issued.replacement_sale.sale_type, SaleType::Replacement);
    assert_eq!(issued.replacement_sale.status, SaleStatus::Completed);
    assert_eq!(issued.replacement_sale.total_cents, 0);
    assert_eq!(
        issued.replacement_sale.replacement_for_return_id.as_deref(),
        Some(customer_return.id.as_str())
    );
    assert_eq!(issued.replacement_sale.customer_id.as_deref(), Some("cust-1"));
    assert_ne!(issued.replacement_sale.receipt_number, sale.receipt_number);
    assert!(issued.replacement_items.iter().all(|i| i.unit_price_cents == 0));
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(98));

    let err = engine
        .issue_replacement(&customer_return.id, ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::AlreadyIssued { .. }));
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(98));

    let stored = engine
        .database()
        .returns()
        .get_by_id(&customer_return.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.replacement_issued);
    assert_eq!(
        stored.replacement_sale_id.as_deref(),
        Some(issued.replacement_sale.id.as_str())
    );

    let types: Vec<TransactionType> = engine
        .database()
        .ledger()
        .transactions_for(&key("VAR-1", SHOP))
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.transaction_type)
        .collect();
    assert_eq!(
        types,
        vec![
            TransactionType::Opening,
            TransactionType::Sale,
            TransactionType::CustomerReturn,
            TransactionType::ReplacementIssued,
        ]
    );
    assert_ledger_paired(&engine).await;
}

#[tokio::test]
async fn test_issue_replacement_through_transition() {
    let engine = setup().await;
    open_stock(&engine, "VAR-1", SHOP, q(10)).await;
    let sale = completed_sale(&engine, "VAR-1", q(1)).await;

    let customer_return = engine
        .create_return(replacement_return(&sale.id, "VAR-1", q(1)), ACTOR)
        .await
        .unwrap();

    // not approved yet
    let err = engine
        .transition(&customer_return.id, ReturnAction::IssueReplacement, ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::InvalidTransition { .. }));

    engine
        .transition(&customer_return.id, ReturnAction::Approve, ACTOR)
        .await
        .unwrap();
    let outcome = engine
        .transition(&customer_return.id, ReturnAction::IssueReplacement, ACTOR)
        .await
        .unwrap();

    assert_eq!(outcome.previous_status, outcome.new_status);
    let created = outcome.created.unwrap();
    assert_eq!(created.kind, DocumentKind::Sale);
    assert!(engine
        .database()
        .sales()
        .get_by_id(&created.id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_replacement_refused_when_stock_is_short() {
    let engine = setup().await;
    open_stock(&engine, "VAR-1", SHOP, q(1)).await;
    let sale = completed_sale(&engine, "VAR-1", q(1)).await;

    let input = NewReturn {
        lines: vec![NewReturnLine {
            product_variant_id: "VAR-1".to_string(),
            quantity: q(1),
            condition: ItemCondition::Damaged,
            return_type: ReturnType::Replacement,
        }],
        ..replacement_return(&sale.id, "VAR-1", q(1))
    };
    let customer_return = engine.create_return(input, ACTOR).await.unwrap();
    engine
        .transition(&customer_return.id, ReturnAction::Approve, ACTOR)
        .await
        .unwrap();
    // damaged goods are not restocked
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(0));

    let err = engine
        .issue_replacement(&customer_return.id, ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::InsufficientStock { .. }));

    let stored = engine
        .database()
        .returns()
        .get_by_id(&customer_return.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!stored.replacement_issued);

    // stock at another location does not cover the return's location
    open_stock(&engine, "VAR-1", "LOC-02", q(5)).await;
    let err = engine
        .issue_replacement(&customer_return.id, ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::InsufficientStock { .. }));
    assert_ledger_paired(&engine).await;
}

#[tokio::test]
async fn test_sale_void_restores_stock() {
    let engine = setup().await;
    open_stock(&engine, "VAR-1", SHOP, q(5)).await;
    let sale = completed_sale(&engine, "VAR-1", q(2)).await;
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(3));

    let outcome = engine
        .transition(
            &sale.id,
            SaleAction::Void {
                reason: "Customer changed mind".to_string(),
            },
            ACTOR,
        )
        .await
        .unwrap();
    assert_eq!(outcome.new_status, DocumentStatus::Sale(SaleStatus::Voided));
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(5));

    let err = engine
        .transition(
            &sale.id,
            SaleAction::Void {
                reason: "again".to_string(),
            },
            ACTOR,
        )
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::InvalidTransition { .. }));
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(5));
    assert_ledger_paired(&engine).await;
}

fn void(reason: &str) -> SaleAction {
    SaleAction::Void {
        reason: reason.to_string(),
    }
}

/// Voids a sale and restocks it at the repository level, the way rows
/// written before the engine checked for returns look.
async fn void_without_return_check(engine: &WorkflowEngine, sale_id: &str) {
    engine
        .database()
        .atomic("legacy void", |mut tx| async move {
            let result = async {
                let sale = SaleRepository::load(&mut tx, sale_id).await?.unwrap();
                let items = SaleRepository::load_items(&mut tx, sale_id).await?;
                StockMutator::apply_all(&mut tx, &sale.void_mutations(&items, ACTOR)).await?;
                SaleRepository::mark_voided(&mut tx, sale_id, ACTOR, "legacy", Utc::now()).await
            }
            .await;
            (tx, result)
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_void_refused_after_return_is_approved() {
    let engine = setup().await;
    open_stock(&engine, "VAR-1", SHOP, q(5)).await;
    let sale = completed_sale(&engine, "VAR-1", q(2)).await;

    let customer_return = engine
        .create_return(replacement_return(&sale.id, "VAR-1", q(1)), ACTOR)
        .await
        .unwrap();
    engine
        .transition(&customer_return.id, ReturnAction::Approve, ACTOR)
        .await
        .unwrap();
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(4));

    let err = engine
        .transition(&sale.id, void("Customer changed mind"), ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::Validation(_)));

    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(4));
    let stored = engine.database().sales().get_by_id(&sale.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SaleStatus::Completed);
    assert!(engine
        .database()
        .ledger()
        .transactions_for_reference(DocumentKind::Sale, &sale.id)
        .await
        .unwrap()
        .iter()
        .all(|e| e.transaction_type != TransactionType::SaleReversal));
    assert_ledger_paired(&engine).await;
}

#[tokio::test]
async fn test_void_refused_while_return_is_pending() {
    let engine = setup().await;
    open_stock(&engine, "VAR-1", SHOP, q(5)).await;
    let sale = completed_sale(&engine, "VAR-1", q(2)).await;

    let customer_return = engine
        .create_return(replacement_return(&sale.id, "VAR-1", q(2)), ACTOR)
        .await
        .unwrap();

    let err = engine
        .transition(&sale.id, void("Wrong customer"), ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::Validation(_)));
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(3));

    // once the return is rejected the sale can be voided normally
    engine
        .transition(
            &customer_return.id,
            ReturnAction::Reject {
                reason: "Receipt missing".to_string(),
            },
            ACTOR,
        )
        .await
        .unwrap();
    engine
        .transition(&sale.id, void("Wrong customer"), ACTOR)
        .await
        .unwrap();
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(5));
    assert_ledger_paired(&engine).await;
}

#[tokio::test]
async fn test_return_approval_refused_once_sale_is_voided() {
    let engine = setup().await;
    open_stock(&engine, "VAR-1", SHOP, q(5)).await;
    let sale = completed_sale(&engine, "VAR-1", q(2)).await;

    let customer_return = engine
        .create_return(replacement_return(&sale.id, "VAR-1", q(2)), ACTOR)
        .await
        .unwrap();
    void_without_return_check(&engine, &sale.id).await;
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(5));

    let err = engine
        .transition(&customer_return.id, ReturnAction::Approve, ACTOR)
        .await
        .unwrap_err();
    match domain(&err) {
        CoreError::InvalidTransition {
            id, status, action, ..
        } => {
            assert_eq!(id, &sale.id);
            assert_eq!(status, "voided");
            assert_eq!(action, "return");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(5));
    let stored = engine
        .database()
        .returns()
        .get_by_id(&customer_return.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, ReturnStatus::Pending);
    assert_ledger_paired(&engine).await;
}

#[tokio::test]
async fn test_replacement_refused_once_sale_is_voided() {
    let engine = setup().await;
    open_stock(&engine, "VAR-1", SHOP, q(5)).await;
    let sale = completed_sale(&engine, "VAR-1", q(2)).await;

    let customer_return = engine
        .create_return(replacement_return(&sale.id, "VAR-1", q(1)), ACTOR)
        .await
        .unwrap();
    engine
        .transition(&customer_return.id, ReturnAction::Approve, ACTOR)
        .await
        .unwrap();
    void_without_return_check(&engine, &sale.id).await;
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(6));

    let err = engine
        .issue_replacement(&customer_return.id, ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::InvalidTransition { .. }));

    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(6));
    let stored = engine
        .database()
        .returns()
        .get_by_id(&customer_return.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!stored.replacement_issued);
    assert_ledger_paired(&engine).await;
}

#[tokio::test]
async fn test_fractional_quantities_flow_through_sale_and_return() {
    let engine = setup().await;
    open_stock(&engine, "RICE-KG", SHOP, q("12.5")).await;

    let sale = completed_sale(&engine, "RICE-KG", q("2.25")).await;
    assert_eq!(sale.total_cents, 3_375);
    assert_eq!(balance(&engine, "RICE-KG", SHOP).await, q("10.25"));

    let customer_return = engine
        .create_return(replacement_return(&sale.id, "RICE-KG", q("0.75")), ACTOR)
        .await
        .unwrap();
    engine
        .transition(&customer_return.id, ReturnAction::Approve, ACTOR)
        .await
        .unwrap();
    assert_eq!(balance(&engine, "RICE-KG", SHOP).await, q(11));

    // 0.75 already returned, 1.5 still returnable
    let err = engine
        .create_return(replacement_return(&sale.id, "RICE-KG", q("1.6")), ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::Validation(_)));

    let err = engine
        .create_return(replacement_return(&sale.id, "RICE-KG", q("0.00001")), ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::Validation(_)));

    let entries = engine
        .database()
        .ledger()
        .transactions_for(&key("RICE-KG", SHOP))
        .await
        .unwrap();
    assert_eq!(entries.last().unwrap().resulting_balance.to_string(), "11");
    assert_ledger_paired(&engine).await;
}

#[tokio::test]
async fn test_sale_cannot_drive_balance_negative() {
    let engine = setup().await;
    open_stock(&engine, "VAR-1", SHOP, q(1)).await;
    let sale = draft_sale(&engine, "VAR-1", q(2)).await;

    let err = engine
        .transition(&sale.id, SaleAction::Complete, ACTOR)
        .await
        .unwrap_err();
    match domain(&err) {
        CoreError::InsufficientStock {
            available,
            requested,
            ..
        } => {
            assert_eq!(*available, q(1));
            assert_eq!(*requested, q(2));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let stored = engine.database().sales().get_by_id(&sale.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SaleStatus::Draft);
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(1));
}

#[tokio::test]
async fn test_return_quantity_is_capped_by_sale() {
    let engine = setup().await;
    open_stock(&engine, "VAR-1", SHOP, q(10)).await;

    let draft = draft_sale(&engine, "VAR-1", q(2)).await;
    let err = engine
        .create_return(replacement_return(&draft.id, "VAR-1", q(1)), ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::InvalidTransition { .. }));

    let sale = completed_sale(&engine, "VAR-1", q(2)).await;

    let err = engine
        .create_return(replacement_return(&sale.id, "VAR-1", q(3)), ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::Validation(_)));

    let err = engine
        .create_return(replacement_return(&sale.id, "VAR-9", q(1)), ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::Validation(_)));

    let first = engine
        .create_return(replacement_return(&sale.id, "VAR-1", q(2)), ACTOR)
        .await
        .unwrap();
    let err = engine
        .create_return(replacement_return(&sale.id, "VAR-1", q(1)), ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::Validation(_)));

    // a rejected return frees its quantity
    engine
        .transition(
            &first.id,
            ReturnAction::Reject {
                reason: "Outside return window".to_string(),
            },
            ACTOR,
        )
        .await
        .unwrap();
    engine
        .create_return(replacement_return(&sale.id, "VAR-1", q(1)), ACTOR)
        .await
        .unwrap();
}

// =============================================================================
// Corrections
// =============================================================================

#[tokio::test]
async fn test_correction_uses_count_frozen_at_submission() {
    let engine = setup().await;
    open_stock(&engine, "VAR-1", SHOP, q(95)).await;

    let correction = engine
        .submit_correction(
            NewCorrection {
                product_variant_id: "VAR-1".to_string(),
                location_id: SHOP.to_string(),
                physical_count: q(93),
                reason: Some("Shelf count".to_string()),
            },
            ACTOR,
        )
        .await
        .unwrap();
    assert_eq!(correction.system_count_at_submission, q(95));

    completed_sale(&engine, "VAR-1", q(1)).await;
    completed_sale(&engine, "VAR-1", q(1)).await;
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(93));

    let outcome = engine
        .transition(&correction.id, CorrectionAction::Approve, ACTOR)
        .await
        .unwrap();
    assert_eq!(outcome.receipts.len(), 1);
    assert_eq!(outcome.receipts[0].previous_balance, q(93));
    assert_eq!(outcome.receipts[0].new_balance, q(91));
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(91));

    let entries = engine
        .database()
        .ledger()
        .transactions_for_reference(DocumentKind::InventoryCorrection, &correction.id)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].quantity_delta, q(-2));
    assert_eq!(entries[0].transaction_type, TransactionType::Adjustment);

    let err = engine
        .transition(&correction.id, CorrectionAction::Approve, ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::InvalidTransition { .. }));
    assert_ledger_paired(&engine).await;
}

#[tokio::test]
async fn test_rejected_correction_leaves_stock_alone() {
    let engine = setup().await;
    open_stock(&engine, "VAR-1", SHOP, q(10)).await;

    let correction = engine
        .submit_correction(
            NewCorrection {
                product_variant_id: "VAR-1".to_string(),
                location_id: SHOP.to_string(),
                physical_count: q(4),
                reason: None,
            },
            ACTOR,
        )
        .await
        .unwrap();

    let err = engine
        .transition(
            &correction.id,
            CorrectionAction::Reject {
                reason: "  ".to_string(),
            },
            ACTOR,
        )
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::Validation(_)));

    engine
        .transition(
            &correction.id,
            CorrectionAction::Reject {
                reason: "Recount".to_string(),
            },
            ACTOR,
        )
        .await
        .unwrap();
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(10));
}

// =============================================================================
// Transfers
// =============================================================================

fn two_line_transfer() -> NewTransfer {
    NewTransfer {
        source_location_id: "LOC-A".to_string(),
        destination_location_id: "LOC-B".to_string(),
        notes: None,
        lines: vec![
            NewTransferLine {
                product_variant_id: "VAR-1".to_string(),
                quantity: q(3),
            },
            NewTransferLine {
                product_variant_id: "VAR-2".to_string(),
                quantity: q(2),
            },
        ],
    }
}

#[tokio::test]
async fn test_transfer_completion_is_all_or_nothing() {
    let engine = setup().await;
    open_stock(&engine, "VAR-1", "LOC-A", q(5)).await;
    open_stock(&engine, "VAR-2", "LOC-A", q(1)).await;

    let transfer = engine.create_transfer(two_line_transfer(), ACTOR).await.unwrap();
    engine
        .transition(&transfer.id, TransferAction::Approve, "manager")
        .await
        .unwrap();
    engine
        .transition(&transfer.id, TransferAction::Send, ACTOR)
        .await
        .unwrap();

    let err = engine
        .transition(&transfer.id, TransferAction::Complete, ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::InsufficientStock { .. }));

    assert_eq!(balance(&engine, "VAR-1", "LOC-A").await, q(5));
    assert_eq!(balance(&engine, "VAR-1", "LOC-B").await, q(0));
    assert_eq!(balance(&engine, "VAR-2", "LOC-A").await, q(1));
    let stored = engine
        .database()
        .transfers()
        .get_by_id(&transfer.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TransferStatus::Sent);
    assert!(engine
        .database()
        .ledger()
        .transactions_for_reference(DocumentKind::StockTransfer, &transfer.id)
        .await
        .unwrap()
        .is_empty());

    // reject, reopen, and the approval has to be given again
    engine
        .transition(
            &transfer.id,
            TransferAction::Reject {
                reason: "Short on VAR-2".to_string(),
            },
            ACTOR,
        )
        .await
        .unwrap();
    let reopened = engine
        .transition(&transfer.id, TransferAction::Reopen, ACTOR)
        .await
        .unwrap();
    assert_eq!(
        reopened.new_status,
        DocumentStatus::StockTransfer(TransferStatus::Draft)
    );
    let stored = engine
        .database()
        .transfers()
        .get_by_id(&transfer.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.approved_by, None);
    assert_eq!(stored.sent_by, None);
    assert_ledger_paired(&engine).await;
}

#[tokio::test]
async fn test_transfer_moves_stock_between_locations() {
    let engine = setup().await;
    open_stock(&engine, "VAR-1", "LOC-A", q(5)).await;
    open_stock(&engine, "VAR-2", "LOC-A", q(2)).await;

    let transfer = engine.create_transfer(two_line_transfer(), ACTOR).await.unwrap();
    for action in [TransferAction::Approve, TransferAction::Send] {
        engine.transition(&transfer.id, action, ACTOR).await.unwrap();
    }
    let outcome = engine
        .transition(&transfer.id, TransferAction::Complete, ACTOR)
        .await
        .unwrap();
    assert_eq!(outcome.receipts.len(), 4);

    assert_eq!(balance(&engine, "VAR-1", "LOC-A").await, q(2));
    assert_eq!(balance(&engine, "VAR-1", "LOC-B").await, q(3));
    assert_eq!(balance(&engine, "VAR-2", "LOC-A").await, q(0));
    assert_eq!(balance(&engine, "VAR-2", "LOC-B").await, q(2));

    let entries = engine
        .database()
        .ledger()
        .transactions_for_reference(DocumentKind::StockTransfer, &transfer.id)
        .await
        .unwrap();
    let total: Quantity = entries.iter().map(|e| e.quantity_delta).sum();
    assert_eq!(entries.len(), 4);
    assert!(total.is_zero());

    let err = engine
        .transition(&transfer.id, TransferAction::Cancel, ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::InvalidTransition { .. }));
    assert_ledger_paired(&engine).await;
}

// =============================================================================
// Authorization and precondition order
// =============================================================================

#[tokio::test]
async fn test_precondition_order() {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let grants = PermissionGrants::new()
        .grant("clerk", "stock_transfer.create")
        .grant("clerk", "stock_transfer.send")
        .grant("manager", "stock_transfer.*");
    let engine = WorkflowEngine::new(db, Arc::new(grants));
    open_stock(&engine, "VAR-1", "LOC-A", q(5)).await;
    open_stock(&engine, "VAR-2", "LOC-A", q(5)).await;

    let err = engine
        .transition("missing", TransferAction::Approve, "manager")
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::DocumentNotFound { .. }));

    let transfer = engine.create_transfer(two_line_transfer(), "clerk").await.unwrap();

    // illegal from draft: reported before the missing grant
    let err = engine
        .transition(&transfer.id, TransferAction::Complete, "clerk")
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::InvalidTransition { .. }));

    let err = engine
        .transition(&transfer.id, TransferAction::Approve, "clerk")
        .await
        .unwrap_err();
    match domain(&err) {
        CoreError::Unauthorized {
            actor_id,
            permission,
        } => {
            assert_eq!(actor_id, "clerk");
            assert_eq!(permission, "stock_transfer.approve");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    engine
        .transition(&transfer.id, TransferAction::Approve, "manager")
        .await
        .unwrap();
    engine
        .transition(&transfer.id, TransferAction::Send, "clerk")
        .await
        .unwrap();

    // refused before the blank reason is looked at
    let err = engine
        .transition(
            &transfer.id,
            TransferAction::Reject {
                reason: String::new(),
            },
            "clerk",
        )
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::Unauthorized { .. }));

    let err = engine
        .transition(
            &transfer.id,
            TransferAction::Reject {
                reason: String::new(),
            },
            "manager",
        )
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::Validation(_)));

    let err = engine
        .create_sale(
            NewSale {
                location_id: SHOP.to_string(),
                customer_id: None,
                lines: vec![NewSaleLine {
                    product_variant_id: "VAR-1".to_string(),
                    quantity: q(1),
                    unit_price_cents: 100,
                }],
            },
            "clerk",
        )
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::Unauthorized { .. }));
}

// =============================================================================
// Opening stock
// =============================================================================

#[tokio::test]
async fn test_opening_stock_locks_after_first_entry() {
    let engine = setup().await;
    let target = key("VAR-1", SHOP);

    engine
        .database()
        .opening()
        .set_opening_stock(&target, q(0), ACTOR)
        .await
        .unwrap();
    let err = engine
        .database()
        .opening()
        .set_opening_stock(&target, q(10), ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::OpeningStockLocked { .. }));
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(0));

    // a key that has only seen receipts is also locked
    let (order, lines) = engine
        .create_purchase_order(
            NewPurchaseOrder {
                supplier_id: "SUP-1".to_string(),
                location_id: SHOP.to_string(),
                lines: vec![NewPurchaseLine {
                    product_variant_id: "VAR-2".to_string(),
                    quantity_ordered: q(4),
                    unit_cost_cents: 900,
                }],
            },
            ACTOR,
        )
        .await
        .unwrap();
    engine
        .transition(&order.id, PurchaseAction::Approve, ACTOR)
        .await
        .unwrap();
    engine
        .transition(
            &order.id,
            PurchaseAction::Receive {
                lines: vec![ReceiptLine {
                    line_id: lines[0].id.clone(),
                    quantity: q(4),
                }],
            },
            ACTOR,
        )
        .await
        .unwrap();

    let err = engine
        .database()
        .opening()
        .set_opening_stock(&key("VAR-2", SHOP), q(50), ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::OpeningStockLocked { .. }));
    assert_eq!(balance(&engine, "VAR-2", SHOP).await, q(4));
}

// =============================================================================
// Purchasing
// =============================================================================

#[tokio::test]
async fn test_partial_then_full_receipt() {
    let engine = setup().await;

    let (order, lines) = engine
        .create_purchase_order(
            NewPurchaseOrder {
                supplier_id: "SUP-1".to_string(),
                location_id: SHOP.to_string(),
                lines: vec![
                    NewPurchaseLine {
                        product_variant_id: "VAR-1".to_string(),
                        quantity_ordered: q(10),
                        unit_cost_cents: 700,
                    },
                    NewPurchaseLine {
                        product_variant_id: "VAR-2".to_string(),
                        quantity_ordered: q(4),
                        unit_cost_cents: 300,
                    },
                ],
            },
            ACTOR,
        )
        .await
        .unwrap();
    assert_eq!(order.status, PurchaseOrderStatus::Draft);

    // nothing can be received before approval
    let receive_first = PurchaseAction::Receive {
        lines: vec![ReceiptLine {
            line_id: lines[0].id.clone(),
            quantity: q(6),
        }],
    };
    let err = engine
        .transition(&order.id, receive_first.clone(), ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::InvalidTransition { .. }));

    engine
        .transition(&order.id, PurchaseAction::Approve, ACTOR)
        .await
        .unwrap();
    let partial = engine
        .transition(&order.id, receive_first, ACTOR)
        .await
        .unwrap();
    assert_eq!(
        partial.new_status,
        DocumentStatus::PurchaseOrder(PurchaseOrderStatus::PartiallyReceived)
    );
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(6));

    let goods_receipt = partial.created.unwrap();
    assert_eq!(goods_receipt.kind, DocumentKind::GoodsReceipt);
    let entries = engine
        .database()
        .ledger()
        .transactions_for_reference(DocumentKind::GoodsReceipt, &goods_receipt.id)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].transaction_type, TransactionType::Receipt);

    // over-delivery is capped at what is still outstanding
    let full = engine
        .transition(
            &order.id,
            PurchaseAction::Receive {
                lines: vec![
                    ReceiptLine {
                        line_id: lines[0].id.clone(),
                        quantity: q(10),
                    },
                    ReceiptLine {
                        line_id: lines[1].id.clone(),
                        quantity: q(4),
                    },
                ],
            },
            ACTOR,
        )
        .await
        .unwrap();
    assert_eq!(
        full.new_status,
        DocumentStatus::PurchaseOrder(PurchaseOrderStatus::Received)
    );
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(10));
    assert_eq!(balance(&engine, "VAR-2", SHOP).await, q(4));

    let stored_lines = engine.database().purchases().get_lines(&order.id).await.unwrap();
    assert!(stored_lines
        .iter()
        .all(|line| line.quantity_received == line.quantity_ordered));
    let receipts = engine
        .database()
        .purchases()
        .receipts_for(&order.id)
        .await
        .unwrap();
    assert_eq!(receipts.len(), 2);

    let err = engine
        .transition(&order.id, PurchaseAction::Cancel, ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::InvalidTransition { .. }));
    assert_ledger_paired(&engine).await;
}

// =============================================================================
// Expenses
// =============================================================================

#[tokio::test]
async fn test_expense_post_and_void_journal() {
    let engine = setup().await;

    let err = engine
        .create_expense(
            NewExpense {
                location_id: SHOP.to_string(),
                description: "Electricity".to_string(),
                amount_cents: 12_500,
                expense_account: "cash".to_string(),
                payment_account: "cash".to_string(),
            },
            ACTOR,
        )
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::Validation(_)));

    let expense = engine
        .create_expense(
            NewExpense {
                location_id: SHOP.to_string(),
                description: "Electricity".to_string(),
                amount_cents: 12_500,
                expense_account: "utilities".to_string(),
                payment_account: "cash".to_string(),
            },
            ACTOR,
        )
        .await
        .unwrap();
    assert_eq!(expense.status, ExpenseStatus::Draft);

    engine
        .transition(&expense.id, ExpenseAction::Post, ACTOR)
        .await
        .unwrap();
    let err = engine
        .transition(
            &expense.id,
            ExpenseAction::Void {
                reason: String::new(),
            },
            ACTOR,
        )
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::Validation(_)));

    let voided = engine
        .transition(
            &expense.id,
            ExpenseAction::Void {
                reason: "Duplicate bill".to_string(),
            },
            ACTOR,
        )
        .await
        .unwrap();
    assert_eq!(voided.new_status, DocumentStatus::Expense(ExpenseStatus::Void));
    assert!(voided.receipts.is_empty());

    let journal = engine
        .database()
        .expenses()
        .journal_for(&Reference::new(DocumentKind::Expense, &expense.id))
        .await
        .unwrap();
    assert_eq!(journal.len(), 2);
    assert_eq!(journal[0].entry.memo, "Electricity");
    assert_eq!(journal[0].lines[0], JournalLine::debit("utilities", 12_500));
    assert_eq!(journal[1].entry.memo, "Void: Duplicate bill");
    assert_eq!(journal[1].lines[0], JournalLine::debit("cash", 12_500));
    for posted in &journal {
        let debits: i64 = posted.lines.iter().map(|l| l.debit_cents).sum();
        let credits: i64 = posted.lines.iter().map(|l| l.credit_cents).sum();
        assert_eq!(debits, credits);
    }

    let err = engine
        .transition(
            &expense.id,
            ExpenseAction::Void {
                reason: "Again".to_string(),
            },
            ACTOR,
        )
        .await
        .unwrap_err();
    assert!(matches!(domain(&err), CoreError::InvalidTransition { .. }));
}

// =============================================================================
// Alerts
// =============================================================================

#[derive(Default)]
struct CollectingSink {
    alerts: Mutex<Vec<Alert>>,
}

#[async_trait]
impl AlertSink for CollectingSink {
    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_alerts_follow_commits() {
    let sink = Arc::new(CollectingSink::default());
    let (dispatcher, handle) = AlertDispatcher::spawn(sink.clone(), 16);

    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let engine = WorkflowEngine::new(db, Arc::new(AllowAll)).with_alerts(dispatcher, q(5));
    open_stock(&engine, "VAR-1", SHOP, q(6)).await;

    let sale = completed_sale(&engine, "VAR-1", q(2)).await;

    // refusals raise nothing
    let _ = engine.transition(&sale.id, SaleAction::Complete, ACTOR).await;

    drop(engine);
    handle.await.unwrap();

    let alerts = sink.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 2);
    assert!(alerts.iter().any(|alert| matches!(
        alert,
        Alert::TransitionCommitted { reference, new_status, .. }
            if reference.id == sale.id && new_status == "completed"
    )));
    assert!(alerts.iter().any(|alert| matches!(
        alert,
        Alert::LowStock { balance, threshold, .. } if *balance == q(4) && *threshold == q(5)
    )));
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_replacement_issues_exactly_once() {
    let file = FileDb::new();
    let engine = WorkflowEngine::new(file.open().await, Arc::new(AllowAll));
    open_stock(&engine, "VAR-1", SHOP, q(10)).await;

    let sale = completed_sale(&engine, "VAR-1", q(1)).await;
    let customer_return = engine
        .create_return(replacement_return(&sale.id, "VAR-1", q(1)), ACTOR)
        .await
        .unwrap();
    engine
        .transition(&customer_return.id, ReturnAction::Approve, ACTOR)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for n in 0..8 {
        let engine = engine.clone();
        let return_id = customer_return.id.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .issue_replacement(&return_id, &format!("user-{n}"))
                .await
        }));
    }

    let mut issued = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => issued += 1,
            Err(err) => assert!(
                matches!(domain(&err), CoreError::AlreadyIssued { .. }),
                "unexpected error: {err:?}"
            ),
        }
    }
    assert_eq!(issued, 1);

    // 10 - 1 sold + 1 restocked - 1 replacement
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(9));
    let deductions = engine
        .database()
        .ledger()
        .transactions_for_reference(DocumentKind::CustomerReturn, &customer_return.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.transaction_type == TransactionType::ReplacementIssued)
        .count();
    assert_eq!(deductions, 1);
    assert_ledger_paired(&engine).await;

    engine.database().close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sales_never_oversell() {
    let file = FileDb::new();
    let engine = WorkflowEngine::new(file.open().await, Arc::new(AllowAll));
    open_stock(&engine, "VAR-1", SHOP, q(5)).await;

    let mut sales = Vec::new();
    for _ in 0..8 {
        sales.push(draft_sale(&engine, "VAR-1", q(1)).await);
    }

    let mut tasks = Vec::new();
    for sale in sales {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.transition(&sale.id, SaleAction::Complete, ACTOR).await
        }));
    }

    let mut completed = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => completed += 1,
            Err(err) => assert!(
                matches!(domain(&err), CoreError::InsufficientStock { .. }),
                "unexpected error: {err:?}"
            ),
        }
    }
    assert_eq!(completed, 5);
    assert_eq!(balance(&engine, "VAR-1", SHOP).await, q(0));

    let entries = engine
        .database()
        .ledger()
        .transactions_for(&key("VAR-1", SHOP))
        .await
        .unwrap();
    assert!(entries.iter().all(|e| !e.resulting_balance.is_negative()));
    assert_ledger_paired(&engine).await;

    engine.database().close().await;
}
