//! # Ledger Storage Errors
//!
//! Two layers. [`DbError`] classifies what SQLite reported. [`LedgerError`]
//! is what units of work return: a domain refusal, a storage failure, or one
//! of the contention signals the unit runner consumes.
//!
//! ```text
//!  sqlx::Error ──► DbError ─────────────┐
//!                  (Busy, UniqueViolation, ...)
//!                                       ▼
//!  CoreError ─────────────────────► LedgerError ──► Stale / Conflict / Db(Busy)?
//!                                                      yes: retried by Database::atomic
//!                                                      no:  returned to the caller
//! ```

use tally_core::{CoreError, StockKey, ValidationError};
use thiserror::Error;

/// A storage failure, classified from the SQLite error.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// `field` is SQLite's `table.column` list, e.g. `sales.receipt_number`.
    ///
    /// Raised by a second opening entry for a key, a receipt number clash,
    /// or a second history row for one transaction row.
    #[error("Unique constraint violated on {field}")]
    UniqueViolation { field: String },

    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    /// Another writer holds the database lock, or this transaction's read
    /// snapshot went stale before it could write.
    ///
    /// ## When This Occurs
    /// - SQLITE_BUSY / SQLITE_BUSY_SNAPSHOT under concurrent units
    /// - SQLITE_LOCKED on a shared-cache table
    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Any other statement failure. CHECK constraints (a negative balance)
    /// and the append-only ledger triggers land here.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// No connection came free within the acquire timeout.
    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Whether this is a UNIQUE violation on the given `table.column` list.
    pub fn is_unique_violation_on(&self, target: &str) -> bool {
        matches!(self, DbError::UniqueViolation { field, .. } if field.contains(target))
    }
}

/// SQLite result codes that mean "someone else is writing".
///
/// 5 = SQLITE_BUSY, 6 = SQLITE_LOCKED, 261 = SQLITE_BUSY_RECOVERY,
/// 517 = SQLITE_BUSY_SNAPSHOT, 262 = SQLITE_LOCKED_SHAREDCACHE
const BUSY_CODES: [&str; 5] = ["5", "6", "261", "517", "262"];

/// Busy codes and lock messages become [`DbError::Busy`]; constraint
/// messages are parsed for the UNIQUE target.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("row", "?"),

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();
                let busy_code = db_err
                    .code()
                    .map(|code| BUSY_CODES.contains(&&*code))
                    .unwrap_or(false);

                if busy_code || msg.contains("database is locked") || msg.contains("is busy") {
                    DbError::Busy(msg.to_string())
                } else if msg.contains("UNIQUE constraint failed") {
                    // "UNIQUE constraint failed: <table>.<column>[, <table>.<column>]"
                    let field = msg
                        .split_once("UNIQUE constraint failed: ")
                        .map(|(_, target)| target.to_string())
                        .unwrap_or_default();
                    DbError::UniqueViolation { field }
                } else if msg.contains("FOREIGN KEY constraint failed") {
                    DbError::ForeignKeyViolation {
                        message: msg.to_string(),
                    }
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("pool closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;

// =============================================================================
// Ledger Error
// =============================================================================

/// Error returned by every ledger operation and workflow transition.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A business rule refused the operation. Never retried.
    #[error(transparent)]
    Domain(#[from] CoreError),

    /// Storage failed.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The balance changed between read and compare-and-set.
    #[error("Balance for {0} changed concurrently")]
    Stale(StockKey),

    /// A document's status changed between read and write.
    #[error("{document} {id} changed concurrently")]
    Conflict { document: String, id: String },
}

impl LedgerError {
    /// Whether the unit runner should retry the whole unit.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            LedgerError::Stale(_) | LedgerError::Conflict { .. } | LedgerError::Db(DbError::Busy(_))
        )
    }

    /// The domain error, if this is one.
    pub fn as_domain(&self) -> Option<&CoreError> {
        match self {
            LedgerError::Domain(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Db(DbError::from(err))
    }
}

impl From<ValidationError> for LedgerError {
    fn from(err: ValidationError) -> Self {
        LedgerError::Domain(CoreError::Validation(err))
    }
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;
