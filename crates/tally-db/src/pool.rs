//! # Connection Pool
//!
//! `Database` is the one handle the rest of the workspace holds. It owns the
//! sqlx pool, the retry policy for units of work, and hands out repositories.
//!
//! ```text
//!  DbConfig ──► Database::new ──► SqlitePool (WAL, FKs, busy_timeout)
//!                                      │
//!          ┌──────────────┬────────────┼─────────────┬─────────────────┐
//!          ▼              ▼            ▼             ▼                 ▼
//!     balances()      ledger()     stock()       opening()     sales() returns() ...
//!     (reads)         (reads)      (units)       (units)       (reads; units via atomic)
//! ```
//!
//! Readers never wait on a writer under WAL. Two writers on different
//! connections are serialized by SQLite; the loser's unit sees BUSY and is
//! retried by [`Database::atomic`](crate::unit).

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::balance::BalanceStore;
use crate::repository::correction::CorrectionRepository;
use crate::repository::customer_return::ReturnRepository;
use crate::repository::expense::ExpenseRepository;
use crate::repository::ledger::LedgerRecorder;
use crate::repository::opening::OpeningStockGuard;
use crate::repository::purchase::PurchaseRepository;
use crate::repository::sale::SaleRepository;
use crate::repository::stock::StockMutator;
use crate::repository::transfer::TransferRepository;
use crate::unit::RetryPolicy;

// =============================================================================
// Configuration
// =============================================================================

/// Pool and retry settings.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/path/to/tally.db")
///     .max_connections(5)
///     .retry(RetryPolicy::default().max_attempts(8));
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite file; created on first connect.
    pub database_path: PathBuf,

    /// Upper bound on concurrent units of work (default 5).
    pub max_connections: u32,

    /// Connections kept open while idle (default 1).
    pub min_connections: u32,

    /// Wait for a free connection before giving up (default 30s).
    pub connect_timeout: Duration,

    /// Idle connections above the minimum close after this (default 10m).
    pub idle_timeout: Duration,

    /// How long SQLite waits on a lock before reporting BUSY (default 5s).
    pub busy_timeout: Duration,

    /// Apply `migrations/sqlite` on connect (default true).
    pub run_migrations: bool,

    /// Retry policy for contended units of work.
    pub retry: RetryPolicy,
}

impl DbConfig {
    /// Defaults for a ledger file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            busy_timeout: Duration::from_secs(5),
            run_migrations: true,
            retry: RetryPolicy::default(),
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Sets the retry policy for contended units of work.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// A private in-memory ledger.
    ///
    /// Limited to one connection, since every `:memory:` connection is its
    /// own database. Units never acquire a second connection, so this is
    /// enough for single-task tests; concurrency tests need a file.
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(":memory:"),
            max_connections: 1,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            busy_timeout: Duration::from_secs(5),
            run_migrations: true,
            retry: RetryPolicy::default(),
        }
    }
}

// =============================================================================
// Database
// =============================================================================

/// Shared handle to the ledger database.
///
/// Clones share one pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,

    /// Applied by [`Database::atomic`](crate::unit).
    pub(crate) retry: RetryPolicy,
}

impl Database {
    /// Opens (or creates) the ledger file and applies migrations.
    ///
    /// Every connection runs in WAL mode with `synchronous = NORMAL`,
    /// foreign keys on, and the configured busy timeout.
    ///
    /// ## Returns
    /// * `Err(DbError::ConnectionFailed)` - Bad path or unreachable file
    /// * `Err(DbError::MigrationFailed)` - Schema could not be applied
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(path = %config.database_path.display(), "Opening ledger database");

        let connect_url = format!("sqlite://{}?mode=rwc", config.database_path.display());

        let connect_options = SqliteConnectOptions::from_str(&connect_url)
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        info!(
            max_connections = config.max_connections,
            max_attempts = config.retry.max_attempts,
            "Ledger pool ready"
        );

        let db = Database {
            pool,
            retry: config.retry,
        };

        if config.run_migrations {
            db.run_migrations().await?;
        }

        Ok(db)
    }

    /// Applies pending migrations. Already-applied ones are skipped.
    pub async fn run_migrations(&self) -> DbResult<()> {
        migrations::run_migrations(&self.pool).await?;
        debug!("Ledger schema up to date");
        Ok(())
    }

    /// Raw pool, for tests and ad-hoc reporting queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The retry policy applied to units of work.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Current balances.
    pub fn balances(&self) -> BalanceStore {
        BalanceStore::new(self.pool.clone())
    }

    /// Transaction and history log queries.
    pub fn ledger(&self) -> LedgerRecorder {
        LedgerRecorder::new(self.pool.clone())
    }

    /// Stand-alone stock mutations, each in its own unit.
    pub fn stock(&self) -> StockMutator {
        StockMutator::new(self.clone())
    }

    pub fn opening(&self) -> OpeningStockGuard {
        OpeningStockGuard::new(self.clone())
    }

    pub fn sales(&self) -> SaleRepository {
        SaleRepository::new(self.pool.clone())
    }

    pub fn returns(&self) -> ReturnRepository {
        ReturnRepository::new(self.pool.clone())
    }

    pub fn corrections(&self) -> CorrectionRepository {
        CorrectionRepository::new(self.pool.clone())
    }

    pub fn transfers(&self) -> TransferRepository {
        TransferRepository::new(self.pool.clone())
    }

    /// Expenses and their journal entries.
    pub fn expenses(&self) -> ExpenseRepository {
        ExpenseRepository::new(self.pool.clone())
    }

    /// Purchase orders and goods receipts.
    pub fn purchases(&self) -> PurchaseRepository {
        PurchaseRepository::new(self.pool.clone())
    }

    /// Waits for checked-out connections to return, then closes the pool.
    pub async fn close(&self) {
        info!("Closing ledger database");
        self.pool.close().await;
    }

    /// `true` if a trivial query succeeds.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{Quantity, StockKey};

    #[tokio::test]
    async fn test_in_memory_ledger_starts_empty() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.health_check().await);
        assert_eq!(db.ledger().counts().await.unwrap(), (0, 0));
        assert_eq!(
            db.balances().get(&StockKey::new("VAR-1", "LOC-A")).await.unwrap(),
            Quantity::ZERO
        );
    }

    #[test]
    fn test_builder_carries_retry_policy() {
        let config = DbConfig::new("tally.db")
            .max_connections(8)
            .busy_timeout(Duration::from_millis(250))
            .retry(RetryPolicy::default().max_attempts(3));

        assert_eq!(config.max_connections, 8);
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(DbConfig::in_memory().max_connections, 1);
    }

    #[tokio::test]
    async fn test_closed_pool_is_unhealthy() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.close().await;
        assert!(!db.health_check().await);
    }
}
