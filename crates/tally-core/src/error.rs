//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Business rule violations                       │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  tally-db errors (separate crate)                                      │
//! │  ├── DbError          - Database operation failures                    │
//! │  └── LedgerError      - CoreError | DbError | internal contention      │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → LedgerError → caller              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Recovery Classes
//! - `InsufficientStock` - caller adjusts quantity or stocks more
//! - `InvalidTransition` - programming/UI error, surfaced verbatim
//! - `AlreadyIssued` / `OpeningStockLocked` - "already done", never retried
//! - `Unauthorized` - permissions error
//! - `ConcurrencyExhausted` - transient, "try again"

use thiserror::Error;

use crate::quantity::Quantity;

// =============================================================================
// Core Error
// =============================================================================

/// Core business logic errors.
///
/// Every variant carries enough structure for the caller to decide whether
/// to adjust and resubmit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A deduction would take the balance below zero.
    ///
    /// ## User Workflow
    /// ```text
    /// Sell 5 of VAR-001 at LOC-A
    ///      │
    ///      ▼
    /// Balance read: available=3
    ///      │
    ///      ▼
    /// InsufficientStock { available: 3, requested: 5 }
    ///      │
    ///      ▼
    /// Nothing written. UI shows: "Only 3 in stock"
    /// ```
    #[error(
        "Insufficient stock for {product_variant_id} at {location_id}: available {available}, requested {requested}"
    )]
    InsufficientStock {
        product_variant_id: String,
        location_id: String,
        available: Quantity,
        requested: Quantity,
    },

    /// The action is not valid from the document's current status.
    #[error("{document} {id} is {status}, cannot {action}")]
    InvalidTransition {
        document: String,
        id: String,
        status: String,
        action: String,
    },

    /// The replacement for this return has already been issued.
    #[error("Replacement already issued for return {return_id}")]
    AlreadyIssued { return_id: String },

    /// Opening stock was already set, or the key already has transactions.
    #[error("Opening stock is locked for {product_variant_id} at {location_id}")]
    OpeningStockLocked {
        product_variant_id: String,
        location_id: String,
    },

    /// The authorization collaborator refused the action.
    #[error("{actor_id} is not allowed to {permission}")]
    Unauthorized { actor_id: String, permission: String },

    /// Compare-and-set retries ran out.
    #[error("{operation} could not complete after {attempts} attempts due to concurrent updates, try again")]
    ConcurrencyExhausted { operation: String, attempts: u32 },

    /// The workflow document does not exist.
    #[error("{document} not found: {id}")]
    DocumentNotFound { document: String, id: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Creates a DocumentNotFound error.
    pub fn not_found(document: impl Into<String>, id: impl Into<String>) -> Self {
        CoreError::DocumentNotFound {
            document: document.into(),
            id: id.into(),
        }
    }

    /// Returns true for the idempotency violations ("already done").
    pub fn is_already_done(&self) -> bool {
        matches!(
            self,
            CoreError::AlreadyIssued { .. } | CoreError::OpeningStockLocked { .. }
        )
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Used for early validation before any storage is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// More decimal places than a quantity may carry.
    #[error("{field} allows at most {max_scale} decimal places")]
    TooPrecise { field: String, max_scale: u32 },

    /// Value must not be negative.
    #[error("{field} must not be negative")]
    MustNotBeNegative { field: String },

    /// Too many line items on one document.
    #[error("{field} cannot have more than {max} lines")]
    TooManyLines { field: String, max: usize },

    /// Two fields that must differ are equal.
    #[error("{field} must differ from {other}")]
    MustDiffer { field: String, other: String },

    /// Value is not in the allowed set.
    #[error("{field} {reason}")]
    Invalid { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_stock_message() {
        let err = CoreError::InsufficientStock {
            product_variant_id: "VAR-001".to_string(),
            location_id: "LOC-A".to_string(),
            available: "2.5".parse().unwrap(),
            requested: Quantity::from(5),
        };
        assert_eq!(
            err.to_string(),
            "Insufficient stock for VAR-001 at LOC-A: available 2.5, requested 5"
        );
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = CoreError::InvalidTransition {
            document: "Stock transfer".to_string(),
            id: "t-1".to_string(),
            status: "draft".to_string(),
            action: "complete".to_string(),
        };
        assert_eq!(err.to_string(), "Stock transfer t-1 is draft, cannot complete");
    }

    #[test]
    fn test_already_done_classification() {
        assert!(CoreError::AlreadyIssued {
            return_id: "r-1".into()
        }
        .is_already_done());
        assert!(!CoreError::not_found("Expense", "e-1").is_already_done());
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "reason".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
