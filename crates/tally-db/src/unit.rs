//! # Atomic Units of Work
//!
//! Every ledger write happens inside one SQLite transaction opened by
//! [`Database::atomic`]. A unit either commits everything it wrote (balance
//! rows, both ledger rows, document status, idempotency flags) or nothing.
//!
//! ## Retry Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  attempt = 1                                                           │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  BEGIN ──► unit(tx) ──► Ok ──► COMMIT ──► Ok ──────────────► done     │
//! │                 │                  │                                    │
//! │                 │ Err              │ Err (BUSY)                         │
//! │                 ▼                  ▼                                    │
//! │             ROLLBACK         contention?                               │
//! │                 │           ┌─────┴─────┐                              │
//! │                 ▼           │ yes       │ no ──► return error          │
//! │            contention? ─────┘           │                              │
//! │                             ▼                                           │
//! │              attempt < max? ── no ──► ConcurrencyExhausted             │
//! │                    │ yes                                                │
//! │                    ▼                                                    │
//! │           sleep(backoff) ──► attempt += 1 ──► BEGIN ...                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Contention is a stale compare-and-set, a document whose status moved
//! underneath us, or SQLite reporting BUSY. Business errors are never
//! retried.
//!
//! ## Calling Convention
//! The unit receives the transaction by value and hands it back together
//! with its result, so it can borrow anything from the caller's scope:
//!
//! ```rust,ignore
//! let receipt = db
//!     .atomic("sale", |mut tx| async move {
//!         let result = StockMutator::apply(&mut tx, &mutation).await;
//!         (tx, result)
//!     })
//!     .await?;
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use sqlx::{Sqlite, Transaction};
use std::future::Future;
use std::time::Duration;
use tally_core::CoreError;
use tracing::{debug, warn};

use crate::error::{DbError, LedgerError, LedgerResult};
use crate::pool::Database;

/// An open unit of work.
pub type UnitTx = Transaction<'static, Sqlite>;

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounded exponential backoff for contended units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Creates the exponential backoff for one call.
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            // attempts are bounded by max_attempts instead
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

// =============================================================================
// Runner
// =============================================================================

impl Database {
    /// Runs `unit` inside one transaction, retrying on contention.
    ///
    /// ## Arguments
    /// * `operation` - Name used in logs and in `ConcurrencyExhausted`
    /// * `unit` - Called once per attempt with a fresh transaction
    ///
    /// ## Returns
    /// * `Ok(T)` - The unit's value, committed
    /// * `Err(Domain(ConcurrencyExhausted))` - Every attempt hit contention
    /// * `Err(..)` - The first non-contention error, nothing committed
    pub async fn atomic<T, F, Fut>(&self, operation: &'static str, mut unit: F) -> LedgerResult<T>
    where
        F: FnMut(UnitTx) -> Fut,
        Fut: Future<Output = (UnitTx, LedgerResult<T>)>,
    {
        let mut backoff = self.retry.create_backoff();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let tx = self.pool().begin().await.map_err(DbError::from)?;
            let (tx, result) = unit(tx).await;

            let outcome = match result {
                Ok(value) => tx
                    .commit()
                    .await
                    .map(|()| value)
                    .map_err(LedgerError::from),
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(operation, error = %rollback_err, "Rollback failed");
                    }
                    Err(err)
                }
            };

            match outcome {
                Ok(value) => {
                    debug!(operation, attempt, "Unit committed");
                    return Ok(value);
                }
                Err(err) if !err.is_contention() => return Err(err),
                Err(err) if attempt >= self.retry.max_attempts => {
                    warn!(operation, attempt, error = %err, "Retries exhausted");
                    return Err(CoreError::ConcurrencyExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                    }
                    .into());
                }
                Err(err) => {
                    let delay = backoff.next_backoff().unwrap_or(self.retry.max_backoff);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Contention, retrying unit"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
