//! # Workflow Engine
//!
//! Runs one action against one workflow document.
//!
//! ## Transition Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                transition(document_id, action, actor)                   │
//! │                                                                         │
//! │  pre-read (own connection)                                             │
//! │    1. load document              ── missing ──► DocumentNotFound       │
//! │    2. status.apply(action)       ── illegal ──► InvalidTransition      │
//! │    3. authorizer                 ── refused ──► Unauthorized           │
//! │    4. action.validate()          ── bad     ──► Validation             │
//! │                                                                         │
//! │  unit of work (Database::atomic)                                       │
//! │    reload + re-apply (status may have moved since the pre-read)        │
//! │    stock mutations ──► conditional status write ──► audit columns      │
//! │                                                                         │
//! │  after commit                                                          │
//! │    info! event, TransitionCommitted alert, LowStock alerts             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The pre-read gives callers a cheap and precise refusal. The unit repeats
//! steps 1 and 2 on a fresh read, so a racing transition surfaces as
//! `InvalidTransition` (or is retried by the runner) rather than a double
//! effect.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use std::fmt;
use std::sync::Arc;
use tally_core::workflow::{
    plan_receipt, status_after_receipt, CorrectionAction, CorrectionStatus, ExpenseAction,
    ExpenseStatus, GoodsReceipt, PurchaseAction, PurchaseOrderStatus, ReturnAction, ReturnStatus,
    SaleAction, SaleStatus, SaleType, TransferAction, TransferStatus,
};
use tally_core::{
    CoreError, DocumentKind, MutationReceipt, Quantity, Reference, StockMutation,
    TransactionType, Transition, ValidationError, WorkflowAction,
};
use tally_db::{
    CorrectionRepository, Database, DbError, ExpenseRepository, LedgerError, LedgerResult,
    PurchaseRepository, ReturnRepository, SaleRepository, StockMutator, TransferRepository,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::alert::{Alert, AlertDispatcher};
use crate::auth::Authorizer;
use crate::replacement::{ReplacementIssuer, ReplacementOutcome};

const RECEIPT_NUMBER_COLUMN: &str = "sales.receipt_number";

// =============================================================================
// Actions & Statuses
// =============================================================================

/// An action on any workflow document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "document", content = "action", rename_all = "snake_case")]
pub enum DocumentAction {
    Sale(SaleAction),
    CustomerReturn(ReturnAction),
    InventoryCorrection(CorrectionAction),
    StockTransfer(TransferAction),
    Expense(ExpenseAction),
    PurchaseOrder(PurchaseAction),
}

impl DocumentAction {
    pub fn kind(&self) -> DocumentKind {
        match self {
            DocumentAction::Sale(_) => DocumentKind::Sale,
            DocumentAction::CustomerReturn(_) => DocumentKind::CustomerReturn,
            DocumentAction::InventoryCorrection(_) => DocumentKind::InventoryCorrection,
            DocumentAction::StockTransfer(_) => DocumentKind::StockTransfer,
            DocumentAction::Expense(_) => DocumentKind::Expense,
            DocumentAction::PurchaseOrder(_) => DocumentKind::PurchaseOrder,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DocumentAction::Sale(a) => a.name(),
            DocumentAction::CustomerReturn(a) => a.name(),
            DocumentAction::InventoryCorrection(a) => a.name(),
            DocumentAction::StockTransfer(a) => a.name(),
            DocumentAction::Expense(a) => a.name(),
            DocumentAction::PurchaseOrder(a) => a.name(),
        }
    }
}

impl From<SaleAction> for DocumentAction {
    fn from(action: SaleAction) -> Self {
        DocumentAction::Sale(action)
    }
}

impl From<ReturnAction> for DocumentAction {
    fn from(action: ReturnAction) -> Self {
        DocumentAction::CustomerReturn(action)
    }
}

impl From<CorrectionAction> for DocumentAction {
    fn from(action: CorrectionAction) -> Self {
        DocumentAction::InventoryCorrection(action)
    }
}

impl From<TransferAction> for DocumentAction {
    fn from(action: TransferAction) -> Self {
        DocumentAction::StockTransfer(action)
    }
}

impl From<ExpenseAction> for DocumentAction {
    fn from(action: ExpenseAction) -> Self {
        DocumentAction::Expense(action)
    }
}

impl From<PurchaseAction> for DocumentAction {
    fn from(action: PurchaseAction) -> Self {
        DocumentAction::PurchaseOrder(action)
    }
}

/// Status of any workflow document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DocumentStatus {
    Sale(SaleStatus),
    CustomerReturn(ReturnStatus),
    InventoryCorrection(CorrectionStatus),
    StockTransfer(TransferStatus),
    Expense(ExpenseStatus),
    PurchaseOrder(PurchaseOrderStatus),
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentStatus::Sale(s) => s.fmt(f),
            DocumentStatus::CustomerReturn(s) => s.fmt(f),
            DocumentStatus::InventoryCorrection(s) => s.fmt(f),
            DocumentStatus::StockTransfer(s) => s.fmt(f),
            DocumentStatus::Expense(s) => s.fmt(f),
            DocumentStatus::PurchaseOrder(s) => s.fmt(f),
        }
    }
}

impl From<SaleStatus> for DocumentStatus {
    fn from(status: SaleStatus) -> Self {
        DocumentStatus::Sale(status)
    }
}

impl From<ReturnStatus> for DocumentStatus {
    fn from(status: ReturnStatus) -> Self {
        DocumentStatus::CustomerReturn(status)
    }
}

impl From<CorrectionStatus> for DocumentStatus {
    fn from(status: CorrectionStatus) -> Self {
        DocumentStatus::InventoryCorrection(status)
    }
}

impl From<TransferStatus> for DocumentStatus {
    fn from(status: TransferStatus) -> Self {
        DocumentStatus::StockTransfer(status)
    }
}

impl From<ExpenseStatus> for DocumentStatus {
    fn from(status: ExpenseStatus) -> Self {
        DocumentStatus::Expense(status)
    }
}

impl From<PurchaseOrderStatus> for DocumentStatus {
    fn from(status: PurchaseOrderStatus) -> Self {
        DocumentStatus::PurchaseOrder(status)
    }
}

/// What a committed transition did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub reference: Reference,
    pub action: &'static str,
    pub previous_status: DocumentStatus,
    pub new_status: DocumentStatus,
    /// One receipt per stock mutation, in the order they were applied.
    pub receipts: Vec<MutationReceipt>,
    /// Document the transition created (goods receipt, replacement sale).
    pub created: Option<Reference>,
}

/// Result of a unit: statuses before/after plus the stock receipts.
struct UnitResult<S> {
    previous: S,
    next: S,
    receipts: Vec<MutationReceipt>,
    created: Option<Reference>,
}

impl<S> UnitResult<S> {
    fn new(previous: S, next: S, receipts: Vec<MutationReceipt>) -> Self {
        UnitResult {
            previous,
            next,
            receipts,
            created: None,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Entry point for every document transition.
///
/// Cheap to clone; clones share the pool, the authorizer and the alert
/// queue, so one engine can serve many concurrent handlers.
#[derive(Clone)]
pub struct WorkflowEngine {
    db: Database,
    authorizer: Arc<dyn Authorizer>,
    replacements: ReplacementIssuer,
    alerts: AlertDispatcher,
    low_stock_threshold: Quantity,
}

impl WorkflowEngine {
    /// Creates an engine with alerts disabled.
    pub fn new(db: Database, authorizer: Arc<dyn Authorizer>) -> Self {
        WorkflowEngine {
            replacements: ReplacementIssuer::new(db.clone(), authorizer.clone()),
            db,
            authorizer,
            alerts: AlertDispatcher::disabled(),
            low_stock_threshold: Quantity::ZERO,
        }
    }

    /// Routes alerts to `alerts`; deductions ending at or below
    /// `low_stock_threshold` also raise `LowStock`.
    pub fn with_alerts(mut self, alerts: AlertDispatcher, low_stock_threshold: Quantity) -> Self {
        self.alerts = alerts;
        self.low_stock_threshold = low_stock_threshold;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Applies `action` to the document `document_id`.
    ///
    /// ## Returns
    /// * `Ok(TransitionOutcome)` - Status, audit fields and stock committed together
    /// * `Err(Domain(DocumentNotFound))` - No such document
    /// * `Err(Domain(InvalidTransition))` - Action illegal from the current status
    /// * `Err(Domain(Unauthorized))` - Authorizer refused
    /// * `Err(Domain(Validation | InsufficientStock))` - Business precondition failed
    /// * `Err(Domain(ConcurrencyExhausted))` - Contention outlasted the retry policy
    pub async fn transition(
        &self,
        document_id: &str,
        action: impl Into<DocumentAction>,
        actor_id: &str,
    ) -> LedgerResult<TransitionOutcome> {
        let action = action.into();
        debug!(document_id, kind = %action.kind(), action = action.name(), actor_id, "Transition requested");

        let outcome = match action {
            DocumentAction::Sale(a) => self.sale(document_id, a, actor_id).await,
            DocumentAction::CustomerReturn(a) => self.customer_return(document_id, a, actor_id).await,
            DocumentAction::InventoryCorrection(a) => self.correction(document_id, a, actor_id).await,
            DocumentAction::StockTransfer(a) => self.transfer(document_id, a, actor_id).await,
            DocumentAction::Expense(a) => self.expense(document_id, a, actor_id).await,
            DocumentAction::PurchaseOrder(a) => self.purchase(document_id, a, actor_id).await,
        }?;

        self.announce(&outcome, actor_id);
        Ok(outcome)
    }

    /// Issues the replacement for an approved return.
    ///
    /// Same effect as `transition(return_id, ReturnAction::IssueReplacement, ..)`
    /// but hands back the replacement sale.
    pub async fn issue_replacement(
        &self,
        return_id: &str,
        actor_id: &str,
    ) -> LedgerResult<ReplacementOutcome> {
        let issued = self.replacements.issue_replacement(return_id, actor_id).await?;
        self.announce(&replacement_transition(&issued), actor_id);
        Ok(issued)
    }

    // =========================================================================
    // Shared checks
    // =========================================================================

    pub(crate) fn authorize(
        &self,
        actor_id: &str,
        permission: &str,
        reference: &Reference,
    ) -> LedgerResult<()> {
        if self.authorizer.is_authorized(actor_id, permission, reference) {
            return Ok(());
        }

        debug!(actor_id, permission, document = %reference, "Authorization refused");
        Err(CoreError::Unauthorized {
            actor_id: actor_id.to_string(),
            permission: permission.to_string(),
        }
        .into())
    }

    /// Steps 2 to 4 of the pipeline against the pre-read status.
    fn check<S: Transition>(
        &self,
        id: &str,
        status: S,
        action: &S::Action,
        actor_id: &str,
    ) -> LedgerResult<S> {
        let next = status.apply(id, action)?;
        self.authorize(actor_id, action.permission(), &Reference::new(S::KIND, id))?;
        action.validate()?;
        Ok(next)
    }

    fn finish<S: Into<DocumentStatus>>(
        kind: DocumentKind,
        id: &str,
        action: &'static str,
        result: UnitResult<S>,
    ) -> TransitionOutcome {
        TransitionOutcome {
            reference: Reference::new(kind, id),
            action,
            previous_status: result.previous.into(),
            new_status: result.next.into(),
            receipts: result.receipts,
            created: result.created,
        }
    }

    fn announce(&self, outcome: &TransitionOutcome, actor_id: &str) {
        info!(
            document = %outcome.reference,
            action = outcome.action,
            from = %outcome.previous_status,
            to = %outcome.new_status,
            mutations = outcome.receipts.len(),
            actor_id,
            "Transition committed"
        );

        self.alerts.notify(Alert::TransitionCommitted {
            reference: outcome.reference.clone(),
            action: outcome.action.to_string(),
            previous_status: outcome.previous_status.to_string(),
            new_status: outcome.new_status.to_string(),
            actor_id: actor_id.to_string(),
            at: Utc::now(),
        });

        for alert in Alert::low_stock_from(&outcome.receipts, self.low_stock_threshold) {
            self.alerts.notify(alert);
        }
    }

    // =========================================================================
    // Sale
    // =========================================================================

    async fn sale(
        &self,
        id: &str,
        action: SaleAction,
        actor_id: &str,
    ) -> LedgerResult<TransitionOutcome> {
        let sale = self
            .db
            .sales()
            .get_by_id(id)
            .await?
            .ok_or_else(|| not_found(DocumentKind::Sale, id))?;
        self.check(id, sale.status, &action, actor_id)?;

        if sale.sale_type == SaleType::Replacement && matches!(action, SaleAction::Void { .. }) {
            return Err(ValidationError::Invalid {
                field: "sale_type".to_string(),
                reason: "replacement sales cannot be voided".to_string(),
            }
            .into());
        }

        let at = Utc::now();
        let result = self
            .db
            .atomic("sale transition", |mut tx| {
                let action = &action;
                async move {
                    let result = Self::sale_unit(&mut tx, id, action, actor_id, at).await;
                    (tx, result)
                }
            })
            .await?;

        Ok(Self::finish(DocumentKind::Sale, id, action.name(), result))
    }

    async fn sale_unit(
        conn: &mut SqliteConnection,
        id: &str,
        action: &SaleAction,
        actor_id: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<UnitResult<SaleStatus>> {
        let sale = SaleRepository::load(conn, id)
            .await?
            .ok_or_else(|| not_found(DocumentKind::Sale, id))?;
        let next = sale.status.apply(id, action)?;
        let items = SaleRepository::load_items(conn, id).await?;

        let receipts = match action {
            SaleAction::Complete => {
                let mutations = sale.completion_mutations(&items, actor_id);
                let receipts = StockMutator::apply_all(conn, &mutations).await?;
                SaleRepository::mark_completed(conn, id, at).await?;
                receipts
            }
            SaleAction::Void { reason } => {
                // the restock would be booked a second time by the return
                if ReturnRepository::has_open_returns(conn, id).await? {
                    return Err(ValidationError::Invalid {
                        field: "customer_returns".to_string(),
                        reason: format!(
                            "sale {id} has pending or approved returns; reject them before voiding"
                        ),
                    }
                    .into());
                }
                let mutations = sale.void_mutations(&items, actor_id);
                let receipts = StockMutator::apply_all(conn, &mutations).await?;
                SaleRepository::mark_voided(conn, id, actor_id, reason.trim(), at).await?;
                receipts
            }
        };

        Ok(UnitResult::new(sale.status, next, receipts))
    }

    // =========================================================================
    // Customer return
    // =========================================================================

    async fn customer_return(
        &self,
        id: &str,
        action: ReturnAction,
        actor_id: &str,
    ) -> LedgerResult<TransitionOutcome> {
        if action == ReturnAction::IssueReplacement {
            let issued = self.replacements.issue_replacement(id, actor_id).await?;
            return Ok(replacement_transition(&issued));
        }

        let customer_return = self
            .db
            .returns()
            .get_by_id(id)
            .await?
            .ok_or_else(|| not_found(DocumentKind::CustomerReturn, id))?;
        self.check(id, customer_return.status, &action, actor_id)?;

        let at = Utc::now();
        let result = self
            .db
            .atomic("return transition", |mut tx| {
                let action = &action;
                async move {
                    let result = Self::return_unit(&mut tx, id, action, actor_id, at).await;
                    (tx, result)
                }
            })
            .await?;

        Ok(Self::finish(DocumentKind::CustomerReturn, id, action.name(), result))
    }

    async fn return_unit(
        conn: &mut SqliteConnection,
        id: &str,
        action: &ReturnAction,
        actor_id: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<UnitResult<ReturnStatus>> {
        let customer_return = ReturnRepository::load(conn, id)
            .await?
            .ok_or_else(|| not_found(DocumentKind::CustomerReturn, id))?;
        let next = customer_return.status.apply(id, action)?;

        let receipts = match action {
            ReturnAction::Approve => {
                SaleRepository::load(conn, &customer_return.sale_id)
                    .await?
                    .ok_or_else(|| not_found(DocumentKind::Sale, &customer_return.sale_id))?
                    .ensure_returnable()?;

                let reference = Reference::new(DocumentKind::CustomerReturn, id);
                let mutations: Vec<StockMutation> = ReturnRepository::load_items(conn, id)
                    .await?
                    .iter()
                    .filter(|item| item.restocks_on_approval())
                    .map(|item| {
                        StockMutation::new(
                            item.key(),
                            item.quantity,
                            TransactionType::CustomerReturn,
                            reference.clone(),
                            actor_id,
                        )
                    })
                    .collect();

                let receipts = StockMutator::apply_all(conn, &mutations).await?;
                ReturnRepository::mark_approved(conn, id, actor_id, at).await?;
                receipts
            }
            ReturnAction::Reject { reason } => {
                ReturnRepository::mark_rejected(conn, id, actor_id, reason.trim(), at).await?;
                Vec::new()
            }
            // handled by ReplacementIssuer before a unit is opened
            ReturnAction::IssueReplacement => {
                return Err(CoreError::InvalidTransition {
                    document: DocumentKind::CustomerReturn.label().to_string(),
                    id: id.to_string(),
                    status: customer_return.status.to_string(),
                    action: action.name().to_string(),
                }
                .into());
            }
        };

        Ok(UnitResult::new(customer_return.status, next, receipts))
    }

    // =========================================================================
    // Inventory correction
    // =========================================================================

    async fn correction(
        &self,
        id: &str,
        action: CorrectionAction,
        actor_id: &str,
    ) -> LedgerResult<TransitionOutcome> {
        let correction = self
            .db
            .corrections()
            .get_by_id(id)
            .await?
            .ok_or_else(|| not_found(DocumentKind::InventoryCorrection, id))?;
        self.check(id, correction.status, &action, actor_id)?;

        let at = Utc::now();
        let result = self
            .db
            .atomic("correction transition", |mut tx| {
                let action = &action;
                async move {
                    let result = Self::correction_unit(&mut tx, id, action, actor_id, at).await;
                    (tx, result)
                }
            })
            .await?;

        Ok(Self::finish(DocumentKind::InventoryCorrection, id, action.name(), result))
    }

    async fn correction_unit(
        conn: &mut SqliteConnection,
        id: &str,
        action: &CorrectionAction,
        actor_id: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<UnitResult<CorrectionStatus>> {
        let correction = CorrectionRepository::load(conn, id)
            .await?
            .ok_or_else(|| not_found(DocumentKind::InventoryCorrection, id))?;
        let next = correction.status.apply(id, action)?;

        let receipts = match action {
            CorrectionAction::Approve => {
                // delta comes from the count frozen at submission
                let mutation = StockMutation::new(
                    correction.key(),
                    correction.difference(),
                    TransactionType::Adjustment,
                    Reference::new(DocumentKind::InventoryCorrection, id),
                    actor_id,
                )
                .with_note(format!(
                    "physical {} vs system {}",
                    correction.physical_count, correction.system_count_at_submission
                ));

                let receipt = StockMutator::apply(conn, &mutation).await?;
                CorrectionRepository::mark_approved(conn, id, actor_id, at).await?;
                vec![receipt]
            }
            CorrectionAction::Reject { reason } => {
                CorrectionRepository::mark_rejected(conn, id, actor_id, reason.trim(), at).await?;
                Vec::new()
            }
        };

        Ok(UnitResult::new(correction.status, next, receipts))
    }

    // =========================================================================
    // Stock transfer
    // =========================================================================

    async fn transfer(
        &self,
        id: &str,
        action: TransferAction,
        actor_id: &str,
    ) -> LedgerResult<TransitionOutcome> {
        let transfer = self
            .db
            .transfers()
            .get_by_id(id)
            .await?
            .ok_or_else(|| not_found(DocumentKind::StockTransfer, id))?;
        self.check(id, transfer.status, &action, actor_id)?;

        let at = Utc::now();
        let result = self
            .db
            .atomic("transfer transition", |mut tx| {
                let action = &action;
                async move {
                    let result = Self::transfer_unit(&mut tx, id, action, actor_id, at).await;
                    (tx, result)
                }
            })
            .await?;

        Ok(Self::finish(DocumentKind::StockTransfer, id, action.name(), result))
    }

    async fn transfer_unit(
        conn: &mut SqliteConnection,
        id: &str,
        action: &TransferAction,
        actor_id: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<UnitResult<TransferStatus>> {
        let transfer = TransferRepository::load(conn, id)
            .await?
            .ok_or_else(|| not_found(DocumentKind::StockTransfer, id))?;
        let next = transfer.status.apply(id, action)?;

        let receipts = if *action == TransferAction::Complete {
            let items = TransferRepository::load_items(conn, id).await?;
            let mutations = transfer.completion_mutations(&items, actor_id);
            StockMutator::apply_all(conn, &mutations).await?
        } else {
            Vec::new()
        };

        let reason = match action {
            TransferAction::Reject { reason } => Some(reason.trim()),
            _ => None,
        };
        TransferRepository::set_status(conn, id, transfer.status, next, actor_id, reason, at)
            .await?;

        Ok(UnitResult::new(transfer.status, next, receipts))
    }

    // =========================================================================
    // Expense
    // =========================================================================

    async fn expense(
        &self,
        id: &str,
        action: ExpenseAction,
        actor_id: &str,
    ) -> LedgerResult<TransitionOutcome> {
        let expense = self
            .db
            .expenses()
            .get_by_id(id)
            .await?
            .ok_or_else(|| not_found(DocumentKind::Expense, id))?;
        self.check(id, expense.status, &action, actor_id)?;

        let at = Utc::now();
        let result = self
            .db
            .atomic("expense transition", |mut tx| {
                let action = &action;
                async move {
                    let result = Self::expense_unit(&mut tx, id, action, actor_id, at).await;
                    (tx, result)
                }
            })
            .await?;

        Ok(Self::finish(DocumentKind::Expense, id, action.name(), result))
    }

    async fn expense_unit(
        conn: &mut SqliteConnection,
        id: &str,
        action: &ExpenseAction,
        actor_id: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<UnitResult<ExpenseStatus>> {
        let expense = ExpenseRepository::load(conn, id)
            .await?
            .ok_or_else(|| not_found(DocumentKind::Expense, id))?;
        let next = expense.status.apply(id, action)?;
        let reference = Reference::new(DocumentKind::Expense, id);

        match action {
            ExpenseAction::Post => {
                ExpenseRepository::mark_posted(conn, id, actor_id, at).await?;
                ExpenseRepository::insert_journal_entry(
                    conn,
                    &reference,
                    &expense.description,
                    actor_id,
                    &expense.posting_lines(),
                    at,
                )
                .await?;
            }
            ExpenseAction::Void { reason } => {
                let reason = reason.trim();
                ExpenseRepository::mark_voided(conn, id, actor_id, reason, at).await?;
                ExpenseRepository::insert_journal_entry(
                    conn,
                    &reference,
                    &format!("Void: {reason}"),
                    actor_id,
                    &expense.reversal_lines(),
                    at,
                )
                .await?;
            }
        }

        Ok(UnitResult::new(expense.status, next, Vec::new()))
    }

    // =========================================================================
    // Purchase order
    // =========================================================================

    async fn purchase(
        &self,
        id: &str,
        action: PurchaseAction,
        actor_id: &str,
    ) -> LedgerResult<TransitionOutcome> {
        let order = self
            .db
            .purchases()
            .get_by_id(id)
            .await?
            .ok_or_else(|| not_found(DocumentKind::PurchaseOrder, id))?;
        self.check(id, order.status, &action, actor_id)?;

        let at = Utc::now();
        let result = self
            .db
            .atomic("purchase transition", |mut tx| {
                let action = &action;
                async move {
                    let result = Self::purchase_unit(&mut tx, id, action, actor_id, at).await;
                    (tx, result)
                }
            })
            .await?;

        Ok(Self::finish(DocumentKind::PurchaseOrder, id, action.name(), result))
    }

    async fn purchase_unit(
        conn: &mut SqliteConnection,
        id: &str,
        action: &PurchaseAction,
        actor_id: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<UnitResult<PurchaseOrderStatus>> {
        let order = PurchaseRepository::load(conn, id)
            .await?
            .ok_or_else(|| not_found(DocumentKind::PurchaseOrder, id))?;
        let next = order.status.apply(id, action)?;

        match action {
            PurchaseAction::Approve => {
                PurchaseRepository::mark_approved(conn, id, actor_id, at).await?;
                Ok(UnitResult::new(order.status, next, Vec::new()))
            }
            PurchaseAction::Cancel => {
                PurchaseRepository::mark_cancelled(conn, id, order.status, actor_id, at).await?;
                Ok(UnitResult::new(order.status, next, Vec::new()))
            }
            PurchaseAction::Receive { lines: requested } => {
                let lines = PurchaseRepository::load_lines(conn, id).await?;
                let plan = plan_receipt(&order.location_id, &lines, requested)?;

                let receipt = GoodsReceipt {
                    id: new_id(),
                    purchase_order_id: id.to_string(),
                    location_id: order.location_id.clone(),
                    received_by: actor_id.to_string(),
                    received_at: at,
                };
                PurchaseRepository::insert_goods_receipt(conn, &receipt, &plan).await?;

                let reference = Reference::new(DocumentKind::GoodsReceipt, &receipt.id);
                let accepted: Vec<_> = plan
                    .iter()
                    .filter(|line| line.accepted.is_positive())
                    .collect();

                let mutations: Vec<StockMutation> = accepted
                    .iter()
                    .map(|line| {
                        StockMutation::new(
                            line.key.clone(),
                            line.accepted,
                            TransactionType::Receipt,
                            reference.clone(),
                            actor_id,
                        )
                    })
                    .collect();
                let receipts = StockMutator::apply_all(conn, &mutations).await?;

                for line in &accepted {
                    PurchaseRepository::add_received(conn, id, &line.line_id, line.accepted)
                        .await?;
                }

                let lines = PurchaseRepository::load_lines(conn, id).await?;
                let next = status_after_receipt(&lines);
                PurchaseRepository::set_receipt_status(conn, id, order.status, next, at).await?;

                Ok(UnitResult {
                    previous: order.status,
                    next,
                    receipts,
                    created: Some(reference),
                })
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub(crate) fn not_found(kind: DocumentKind, id: &str) -> LedgerError {
    CoreError::not_found(kind.label(), id).into()
}

/// Fresh document / line id.
pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Two units that counted the same receipt number race on the UNIQUE index;
/// the loser retries with a fresh count.
pub(crate) fn receipt_clash(err: DbError, sale_id: &str) -> LedgerError {
    if err.is_unique_violation_on(RECEIPT_NUMBER_COLUMN) {
        debug!(sale_id, "Receipt number taken concurrently");
        LedgerError::Conflict {
            document: DocumentKind::Sale.label().to_string(),
            id: sale_id.to_string(),
        }
    } else {
        LedgerError::Db(err)
    }
}

fn replacement_transition(issued: &ReplacementOutcome) -> TransitionOutcome {
    TransitionOutcome {
        reference: Reference::new(DocumentKind::CustomerReturn, &issued.return_id),
        action: ReturnAction::IssueReplacement.name(),
        previous_status: ReturnStatus::Approved.into(),
        new_status: ReturnStatus::Approved.into(),
        receipts: issued.receipts.clone(),
        created: Some(Reference::new(DocumentKind::Sale, &issued.replacement_sale.id)),
    }
}
