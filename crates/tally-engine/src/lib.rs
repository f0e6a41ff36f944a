//! # tally-engine: Workflow Orchestration
//!
//! Runs workflow transitions on top of tally-db: the precondition pipeline,
//! replacement issuance, authorization and alerting seams, configuration and
//! logging setup.
//!
//! ## Startup
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_db::Database;
//! use tally_engine::{telemetry, AlertDispatcher, EngineConfig, LogSink, PermissionGrants, WorkflowEngine};
//!
//! telemetry::init();
//!
//! let config = EngineConfig::load_or_default(None);
//! let db = Database::new(config.db_config()).await?;
//!
//! let grants = PermissionGrants::new()
//!     .grant("owner", "*")
//!     .grant("clerk", "sale.*");
//! let (alerts, _task) = AlertDispatcher::from_settings(&config.alerts, Arc::new(LogSink));
//!
//! let engine = WorkflowEngine::new(db, Arc::new(grants))
//!     .with_alerts(alerts, config.alerts.low_stock_threshold);
//! ```
//!
//! ## Modules
//!
//! - [`engine`] - `WorkflowEngine::transition` and the per-document units
//! - [`documents`] - Creating documents in their initial status
//! - [`replacement`] - At-most-once replacement issuance
//! - [`auth`] - The `Authorizer` seam
//! - [`alert`] - Post-commit alerts over a bounded channel
//! - [`config`] - TOML + environment configuration
//! - [`telemetry`] - tracing-subscriber setup

pub mod alert;
pub mod auth;
pub mod config;
pub mod documents;
pub mod engine;
pub mod error;
pub mod replacement;
pub mod telemetry;

pub use alert::{Alert, AlertDispatcher, AlertSink, LogSink};
pub use auth::{AllowAll, Authorizer, PermissionGrants};
pub use config::EngineConfig;
pub use documents::{
    NewCorrection, NewExpense, NewPurchaseLine, NewPurchaseOrder, NewReturn, NewReturnLine,
    NewSale, NewSaleLine, NewTransfer, NewTransferLine,
};
pub use engine::{DocumentAction, DocumentStatus, TransitionOutcome, WorkflowEngine};
pub use error::{AlertError, ConfigError, ConfigResult};
pub use replacement::{ReplacementIssuer, ReplacementOutcome};
