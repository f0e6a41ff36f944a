//! # Validation Module
//!
//! Input validation for workflow documents and stock requests.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Caller (UI / API)                                            │
//! │  └── Basic format checks, immediate feedback                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: tally-engine                                                 │
//! │  └── THIS MODULE: quantities, reasons, line counts, locations          │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── CHECK (quantity_available >= 0)                                   │
//! │  ├── UNIQUE opening entry per key                                      │
//! │  └── Triggers refusing UPDATE/DELETE on ledger tables                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use tally_core::validation::{validate_line_quantity, validate_reason};
//! use tally_core::Quantity;
//!
//! validate_line_quantity(Quantity::from(5)).unwrap();
//! validate_line_quantity("2.25".parse().unwrap()).unwrap();
//! assert!(validate_reason("void reason", "   ").is_err());
//! ```

use crate::error::ValidationError;
use crate::quantity::Quantity;
use crate::{MAX_DOCUMENT_LINES, MAX_LINE_QUANTITY, MAX_QUANTITY_SCALE, MAX_REASON_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Identifier Validators
// =============================================================================

/// Validates that an identifier is present.
///
/// ## Example
/// ```rust
/// use tally_core::validation::validate_id;
///
/// assert!(validate_id("location_id", "LOC-A").is_ok());
/// assert!(validate_id("location_id", "  ").is_err());
/// ```
pub fn validate_id(field: &str, value: &str) -> ValidationResult<()> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > 64 {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: 64,
        });
    }

    Ok(())
}

/// Validates that a transfer moves stock between two different locations.
pub fn validate_distinct_locations(source: &str, destination: &str) -> ValidationResult<()> {
    validate_id("source_location_id", source)?;
    validate_id("destination_location_id", destination)?;

    if source.trim() == destination.trim() {
        return Err(ValidationError::MustDiffer {
            field: "destination_location_id".to_string(),
            other: "source_location_id".to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a document line quantity.
///
/// ## Rules
/// - Must be positive (> 0)
/// - Must not exceed MAX_LINE_QUANTITY
/// - At most MAX_QUANTITY_SCALE decimal places
pub fn validate_line_quantity(qty: Quantity) -> ValidationResult<()> {
    if !qty.is_positive() {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > Quantity::from(MAX_LINE_QUANTITY) {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 0,
            max: MAX_LINE_QUANTITY,
        });
    }

    validate_scale("quantity", qty)
}

/// Validates a counted quantity (opening stock, physical count).
///
/// Zero is a valid count.
pub fn validate_count(field: &str, qty: Quantity) -> ValidationResult<()> {
    if qty.is_negative() {
        return Err(ValidationError::MustNotBeNegative {
            field: field.to_string(),
        });
    }

    if qty > Quantity::from(MAX_LINE_QUANTITY) {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min: 0,
            max: MAX_LINE_QUANTITY,
        });
    }

    validate_scale(field, qty)
}

fn validate_scale(field: &str, qty: Quantity) -> ValidationResult<()> {
    if qty.scale() > MAX_QUANTITY_SCALE {
        return Err(ValidationError::TooPrecise {
            field: field.to_string(),
            max_scale: MAX_QUANTITY_SCALE,
        });
    }

    Ok(())
}

/// Validates a monetary amount in cents that must be strictly positive.
pub fn validate_amount_cents(field: &str, cents: i64) -> ValidationResult<()> {
    if cents <= 0 {
        return Err(ValidationError::MustBePositive {
            field: field.to_string(),
        });
    }

    Ok(())
}

/// Validates a unit price in cents. Zero is allowed (replacement lines).
pub fn validate_price_cents(cents: i64) -> ValidationResult<()> {
    if cents < 0 {
        return Err(ValidationError::MustNotBeNegative {
            field: "unit_price_cents".to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Text Validators
// =============================================================================

/// Validates a mandatory free-text reason.
///
/// ## Rules
/// - Must not be blank
/// - At most MAX_REASON_LEN characters
///
/// ## Returns
/// The trimmed reason.
pub fn validate_reason(field: &str, reason: &str) -> ValidationResult<String> {
    let reason = reason.trim();

    if reason.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if reason.chars().count() > MAX_REASON_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_REASON_LEN,
        });
    }

    Ok(reason.to_string())
}

// =============================================================================
// Collection Validators
// =============================================================================

/// Validates the number of lines on a document.
///
/// ## Rules
/// - At least one line
/// - At most MAX_DOCUMENT_LINES
pub fn validate_line_count(field: &str, lines: usize) -> ValidationResult<()> {
    if lines == 0 {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if lines > MAX_DOCUMENT_LINES {
        return Err(ValidationError::TooManyLines {
            field: field.to_string(),
            max: MAX_DOCUMENT_LINES,
        });
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
