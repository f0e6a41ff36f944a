//! # Document Creation
//!
//! Opens new workflow documents in their initial status. None of these
//! touch stock; the first stock effect always comes from a transition.
//!
//! | Operation               | Initial status | Extra rule                               |
//! |-------------------------|----------------|------------------------------------------|
//! | `create_sale`           | draft          | receipt number allocated in the unit     |
//! | `create_return`         | pending        | sale completed, qty ≤ sold − returned    |
//! | `submit_correction`     | pending        | system count read and frozen in the unit |
//! | `create_transfer`       | draft          | source ≠ destination                     |
//! | `create_expense`        | draft          | amount > 0, accounts differ              |
//! | `create_purchase_order` | draft          |                                          |
//!
//! Creation is authorized with `<document>.create`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use tally_core::validation::{
    validate_amount_cents, validate_count, validate_distinct_locations, validate_id,
    validate_line_count, validate_line_quantity, validate_price_cents, validate_reason,
};
use tally_core::workflow::{
    CorrectionStatus, CustomerReturn, Expense, ExpenseStatus, InventoryCorrection, ItemCondition,
    PurchaseOrder, PurchaseOrderLine, PurchaseOrderStatus, ReturnItem, ReturnStatus, ReturnType,
    Sale, SaleItem, SaleStatus, SaleType, StockTransfer, TransferItem, TransferStatus,
};
use tally_core::{DocumentKind, Quantity, Reference, StockKey, ValidationError};
use tally_db::{
    BalanceStore, CorrectionRepository, ExpenseRepository, LedgerError, LedgerResult,
    PurchaseRepository, ReturnRepository, SaleRepository, TransferRepository,
};
use tracing::info;

use crate::engine::{new_id, not_found, receipt_clash, WorkflowEngine};

// =============================================================================
// Inputs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSaleLine {
    pub product_variant_id: String,
    pub quantity: Quantity,
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSale {
    pub location_id: String,
    pub customer_id: Option<String>,
    pub lines: Vec<NewSaleLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReturnLine {
    pub product_variant_id: String,
    pub quantity: Quantity,
    pub condition: ItemCondition,
    pub return_type: ReturnType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReturn {
    pub sale_id: String,
    pub reason: Option<String>,
    pub lines: Vec<NewReturnLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCorrection {
    pub product_variant_id: String,
    pub location_id: String,
    pub physical_count: Quantity,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransferLine {
    pub product_variant_id: String,
    pub quantity: Quantity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransfer {
    pub source_location_id: String,
    pub destination_location_id: String,
    pub notes: Option<String>,
    pub lines: Vec<NewTransferLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExpense {
    pub location_id: String,
    pub description: String,
    pub amount_cents: i64,
    pub expense_account: String,
    pub payment_account: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPurchaseLine {
    pub product_variant_id: String,
    pub quantity_ordered: Quantity,
    pub unit_cost_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPurchaseOrder {
    pub supplier_id: String,
    pub location_id: String,
    pub lines: Vec<NewPurchaseLine>,
}

// =============================================================================
// Creation
// =============================================================================

impl WorkflowEngine {
    fn authorize_create(&self, kind: DocumentKind, id: &str, actor_id: &str) -> LedgerResult<()> {
        let permission = format!("{}.create", kind.as_str());
        self.authorize(actor_id, &permission, &Reference::new(kind, id))
    }

    /// Opens a draft sale. Stock is deducted when it is completed.
    pub async fn create_sale(&self, input: NewSale, actor_id: &str) -> LedgerResult<Sale> {
        validate_id("location_id", &input.location_id)?;
        validate_line_count("sale lines", input.lines.len())?;
        for line in &input.lines {
            validate_id("product_variant_id", &line.product_variant_id)?;
            validate_line_quantity(line.quantity)?;
            validate_price_cents(line.unit_price_cents)?;
        }

        let id = new_id();
        self.authorize_create(DocumentKind::Sale, &id, actor_id)?;

        let mut items = Vec::with_capacity(input.lines.len());
        for line in &input.lines {
            items.push(SaleItem {
                id: new_id(),
                sale_id: id.clone(),
                product_variant_id: line.product_variant_id.clone(),
                quantity: line.quantity,
                unit_price_cents: line.unit_price_cents,
                line_total_cents: line_total(line.quantity, line.unit_price_cents)?,
            });
        }
        let total_cents = items.iter().try_fold(0i64, |total, item| {
            total.checked_add(item.line_total_cents).ok_or_else(too_large)
        })?;

        let at = Utc::now();
        let template = Sale {
            id: id.clone(),
            receipt_number: String::new(),
            sale_type: SaleType::Regular,
            status: SaleStatus::Draft,
            customer_id: input.customer_id.clone(),
            location_id: input.location_id.trim().to_string(),
            total_cents,
            replacement_for_return_id: None,
            created_by: actor_id.to_string(),
            created_at: at,
            completed_at: None,
            voided_by: None,
            voided_at: None,
            void_reason: None,
        };

        let sale = self
            .database()
            .atomic("create sale", |mut tx| {
                let (template, items) = (&template, &items);
                async move {
                    let result = Self::insert_sale(&mut tx, template, items, at).await;
                    (tx, result)
                }
            })
            .await?;

        info!(
            sale_id = %sale.id,
            receipt_number = %sale.receipt_number,
            total_cents = sale.total_cents,
            lines = items.len(),
            actor_id,
            "Sale created"
        );
        Ok(sale)
    }

    async fn insert_sale(
        conn: &mut SqliteConnection,
        template: &Sale,
        items: &[SaleItem],
        at: DateTime<Utc>,
    ) -> LedgerResult<Sale> {
        let mut sale = template.clone();
        sale.receipt_number =
            SaleRepository::next_receipt_number(conn, &sale.location_id, at).await?;

        SaleRepository::insert(conn, &sale)
            .await
            .map_err(|e| receipt_clash(e, &sale.id))?;
        for item in items {
            SaleRepository::insert_item(conn, item).await?;
        }

        Ok(sale)
    }

    /// Opens a pending return against a completed sale.
    ///
    /// Every line's variant must be on the sale, and the total returned per
    /// variant across all non-rejected returns may not exceed what was sold.
    pub async fn create_return(
        &self,
        input: NewReturn,
        actor_id: &str,
    ) -> LedgerResult<CustomerReturn> {
        validate_id("sale_id", &input.sale_id)?;
        validate_line_count("return lines", input.lines.len())?;
        for line in &input.lines {
            validate_id("product_variant_id", &line.product_variant_id)?;
            validate_line_quantity(line.quantity)?;
        }
        let reason = optional_reason("reason", input.reason.as_deref())?;

        let id = new_id();
        self.authorize_create(DocumentKind::CustomerReturn, &id, actor_id)?;

        let at = Utc::now();
        let customer_return = self
            .database()
            .atomic("create return", |mut tx| {
                let (id, input, reason) = (id.as_str(), &input, &reason);
                async move {
                    let result =
                        Self::insert_return(&mut tx, id, input, reason.clone(), actor_id, at).await;
                    (tx, result)
                }
            })
            .await?;

        info!(
            return_id = %customer_return.id,
            sale_id = %customer_return.sale_id,
            lines = input.lines.len(),
            actor_id,
            "Customer return created"
        );
        Ok(customer_return)
    }

    async fn insert_return(
        conn: &mut SqliteConnection,
        id: &str,
        input: &NewReturn,
        reason: Option<String>,
        actor_id: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<CustomerReturn> {
        let sale = SaleRepository::load(conn, &input.sale_id)
            .await?
            .ok_or_else(|| not_found(DocumentKind::Sale, &input.sale_id))?;
        sale.ensure_returnable()?;

        let mut sold: BTreeMap<String, Quantity> = BTreeMap::new();
        for item in SaleRepository::load_items(conn, &sale.id).await? {
            *sold.entry(item.product_variant_id).or_default() += item.quantity;
        }

        let mut requested: BTreeMap<&str, Quantity> = BTreeMap::new();
        for line in &input.lines {
            *requested.entry(line.product_variant_id.as_str()).or_default() += line.quantity;
        }

        for (variant, quantity) in &requested {
            let Some(&sold_quantity) = sold.get(*variant) else {
                return Err(ValidationError::Invalid {
                    field: "product_variant_id".to_string(),
                    reason: format!("{variant} is not on sale {}", sale.id),
                }
                .into());
            };

            let already = ReturnRepository::returned_quantity(conn, &sale.id, variant).await?;
            let returnable = sold_quantity - already;
            if *quantity > returnable {
                return Err(ValidationError::Invalid {
                    field: "quantity".to_string(),
                    reason: format!(
                        "returning {quantity} of {variant} exceeds the {returnable} still returnable"
                    ),
                }
                .into());
            }
        }

        let customer_return = CustomerReturn {
            id: id.to_string(),
            sale_id: sale.id.clone(),
            customer_id: sale.customer_id.clone(),
            location_id: sale.location_id.clone(),
            status: ReturnStatus::Pending,
            reason,
            created_by: actor_id.to_string(),
            created_at: at,
            approved_by: None,
            approved_at: None,
            rejected_by: None,
            rejected_at: None,
            rejection_reason: None,
            replacement_issued: false,
            replacement_issued_at: None,
            replacement_issued_by: None,
            replacement_sale_id: None,
        };
        ReturnRepository::insert(conn, &customer_return).await?;

        for line in &input.lines {
            ReturnRepository::insert_item(
                conn,
                &ReturnItem {
                    id: new_id(),
                    return_id: id.to_string(),
                    product_variant_id: line.product_variant_id.clone(),
                    location_id: sale.location_id.clone(),
                    quantity: line.quantity,
                    condition: line.condition,
                    return_type: line.return_type,
                },
            )
            .await?;
        }

        Ok(customer_return)
    }

    /// Records a physical count for approval.
    ///
    /// The system count is read inside the same unit as the insert and
    /// never re-read; approval applies `physical − system_at_submission`
    /// whatever happened to the balance in between.
    pub async fn submit_correction(
        &self,
        input: NewCorrection,
        actor_id: &str,
    ) -> LedgerResult<InventoryCorrection> {
        validate_id("product_variant_id", &input.product_variant_id)?;
        validate_id("location_id", &input.location_id)?;
        validate_count("physical_count", input.physical_count)?;
        let reason = optional_reason("reason", input.reason.as_deref())?;

        let id = new_id();
        self.authorize_create(DocumentKind::InventoryCorrection, &id, actor_id)?;

        let key = StockKey::new(input.product_variant_id.trim(), input.location_id.trim());
        let at = Utc::now();

        let correction = self
            .database()
            .atomic("submit correction", |mut tx| {
                let (id, key, reason) = (id.as_str(), &key, &reason);
                let physical_count = input.physical_count;
                async move {
                    let result = Self::insert_correction(
                        &mut tx,
                        id,
                        key,
                        physical_count,
                        reason.clone(),
                        actor_id,
                        at,
                    )
                    .await;
                    (tx, result)
                }
            })
            .await?;

        info!(
            correction_id = %correction.id,
            key = %key,
            system_count = %correction.system_count_at_submission,
            physical_count = %correction.physical_count,
            actor_id,
            "Inventory correction submitted"
        );
        Ok(correction)
    }

    async fn insert_correction(
        conn: &mut SqliteConnection,
        id: &str,
        key: &StockKey,
        physical_count: Quantity,
        reason: Option<String>,
        actor_id: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<InventoryCorrection> {
        let system_count = BalanceStore::read(conn, key).await?;

        let correction = InventoryCorrection {
            id: id.to_string(),
            product_variant_id: key.product_variant_id.clone(),
            location_id: key.location_id.clone(),
            system_count_at_submission: system_count,
            physical_count,
            reason,
            status: CorrectionStatus::Pending,
            created_by: actor_id.to_string(),
            created_at: at,
            approved_by: None,
            approved_at: None,
            rejected_by: None,
            rejected_at: None,
            rejection_reason: None,
        };
        CorrectionRepository::insert(conn, &correction).await?;

        Ok(correction)
    }

    /// Opens a draft transfer between two different locations.
    pub async fn create_transfer(
        &self,
        input: NewTransfer,
        actor_id: &str,
    ) -> LedgerResult<StockTransfer> {
        validate_distinct_locations(&input.source_location_id, &input.destination_location_id)?;
        validate_line_count("transfer lines", input.lines.len())?;
        for line in &input.lines {
            validate_id("product_variant_id", &line.product_variant_id)?;
            validate_line_quantity(line.quantity)?;
        }

        let id = new_id();
        self.authorize_create(DocumentKind::StockTransfer, &id, actor_id)?;

        let transfer = StockTransfer {
            id: id.clone(),
            source_location_id: input.source_location_id.trim().to_string(),
            destination_location_id: input.destination_location_id.trim().to_string(),
            status: TransferStatus::Draft,
            notes: input.notes.clone(),
            created_by: actor_id.to_string(),
            created_at: Utc::now(),
            approved_by: None,
            approved_at: None,
            sent_by: None,
            sent_at: None,
            completed_by: None,
            completed_at: None,
            rejected_by: None,
            rejected_at: None,
            rejection_reason: None,
            cancelled_by: None,
            cancelled_at: None,
        };
        let items: Vec<TransferItem> = input
            .lines
            .iter()
            .map(|line| TransferItem {
                id: new_id(),
                transfer_id: id.clone(),
                product_variant_id: line.product_variant_id.clone(),
                quantity: line.quantity,
            })
            .collect();

        self.database()
            .atomic("create transfer", |mut tx| {
                let (transfer, items) = (&transfer, &items);
                async move {
                    let result = Self::insert_transfer(&mut tx, transfer, items).await;
                    (tx, result)
                }
            })
            .await?;

        info!(
            transfer_id = %transfer.id,
            from = %transfer.source_location_id,
            to = %transfer.destination_location_id,
            lines = items.len(),
            actor_id,
            "Stock transfer created"
        );
        Ok(transfer)
    }

    async fn insert_transfer(
        conn: &mut SqliteConnection,
        transfer: &StockTransfer,
        items: &[TransferItem],
    ) -> LedgerResult<()> {
        TransferRepository::insert(conn, transfer).await?;
        for item in items {
            TransferRepository::insert_item(conn, item).await?;
        }
        Ok(())
    }

    /// Opens a draft expense. Posting writes the journal entry.
    pub async fn create_expense(&self, input: NewExpense, actor_id: &str) -> LedgerResult<Expense> {
        validate_id("location_id", &input.location_id)?;
        let description = validate_reason("description", &input.description)?;
        validate_amount_cents("amount_cents", input.amount_cents)?;
        validate_id("expense_account", &input.expense_account)?;
        validate_id("payment_account", &input.payment_account)?;
        if input.expense_account.trim() == input.payment_account.trim() {
            return Err(ValidationError::MustDiffer {
                field: "payment_account".to_string(),
                other: "expense_account".to_string(),
            }
            .into());
        }

        let id = new_id();
        self.authorize_create(DocumentKind::Expense, &id, actor_id)?;

        let expense = Expense {
            id,
            location_id: input.location_id.trim().to_string(),
            description,
            amount_cents: input.amount_cents,
            expense_account: input.expense_account.trim().to_string(),
            payment_account: input.payment_account.trim().to_string(),
            status: ExpenseStatus::Draft,
            created_by: actor_id.to_string(),
            created_at: Utc::now(),
            posted_by: None,
            posted_at: None,
            voided_by: None,
            voided_at: None,
            void_reason: None,
        };

        self.database()
            .atomic("create expense", |mut tx| {
                let expense = &expense;
                async move {
                    let result = ExpenseRepository::insert(&mut tx, expense)
                        .await
                        .map_err(LedgerError::from);
                    (tx, result)
                }
            })
            .await?;

        info!(
            expense_id = %expense.id,
            amount_cents = expense.amount_cents,
            account = %expense.expense_account,
            actor_id,
            "Expense created"
        );
        Ok(expense)
    }

    /// Opens a draft purchase order.
    pub async fn create_purchase_order(
        &self,
        input: NewPurchaseOrder,
        actor_id: &str,
    ) -> LedgerResult<(PurchaseOrder, Vec<PurchaseOrderLine>)> {
        validate_id("supplier_id", &input.supplier_id)?;
        validate_id("location_id", &input.location_id)?;
        validate_line_count("purchase order lines", input.lines.len())?;
        for line in &input.lines {
            validate_id("product_variant_id", &line.product_variant_id)?;
            validate_line_quantity(line.quantity_ordered)?;
            validate_price_cents(line.unit_cost_cents)?;
        }

        let id = new_id();
        self.authorize_create(DocumentKind::PurchaseOrder, &id, actor_id)?;

        let order = PurchaseOrder {
            id: id.clone(),
            supplier_id: input.supplier_id.trim().to_string(),
            location_id: input.location_id.trim().to_string(),
            status: PurchaseOrderStatus::Draft,
            created_by: actor_id.to_string(),
            created_at: Utc::now(),
            approved_by: None,
            approved_at: None,
            cancelled_by: None,
            cancelled_at: None,
            received_at: None,
        };
        let lines: Vec<PurchaseOrderLine> = input
            .lines
            .iter()
            .map(|line| PurchaseOrderLine {
                id: new_id(),
                purchase_order_id: id.clone(),
                product_variant_id: line.product_variant_id.clone(),
                quantity_ordered: line.quantity_ordered,
                quantity_received: Quantity::ZERO,
                unit_cost_cents: line.unit_cost_cents,
            })
            .collect();

        self.database()
            .atomic("create purchase order", |mut tx| {
                let (order, lines) = (&order, &lines);
                async move {
                    let result = Self::insert_purchase_order(&mut tx, order, lines).await;
                    (tx, result)
                }
            })
            .await?;

        info!(
            purchase_order_id = %order.id,
            supplier = %order.supplier_id,
            lines = lines.len(),
            actor_id,
            "Purchase order created"
        );
        Ok((order, lines))
    }

    async fn insert_purchase_order(
        conn: &mut SqliteConnection,
        order: &PurchaseOrder,
        lines: &[PurchaseOrderLine],
    ) -> LedgerResult<()> {
        PurchaseRepository::insert(conn, order).await?;
        for line in lines {
            PurchaseRepository::insert_line(conn, line).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Whole cents; half a cent rounds away from zero.
fn line_total(quantity: Quantity, unit_price_cents: i64) -> LedgerResult<i64> {
    quantity
        .line_total_cents(unit_price_cents)
        .ok_or_else(too_large)
        .map_err(LedgerError::from)
}

fn too_large() -> ValidationError {
    ValidationError::OutOfRange {
        field: "total_cents".to_string(),
        min: 0,
        max: i64::MAX,
    }
}

/// Blank reasons are stored as `None`.
fn optional_reason(field: &str, reason: Option<&str>) -> LedgerResult<Option<String>> {
    match reason.map(str::trim).filter(|r| !r.is_empty()) {
        Some(reason) => Ok(Some(validate_reason(field, reason)?)),
        None => Ok(None),
    }
}
