//! # Alerts
//!
//! Notifications raised after a unit of work commits.
//!
//! ## Delivery Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  WorkflowEngine ──commit──► AlertDispatcher::notify (try_send)         │
//! │                                   │                                     │
//! │                                   │ bounded mpsc                        │
//! │                                   ▼                                     │
//! │                            background task ──► AlertSink::deliver      │
//! │                                                                         │
//! │  A full queue drops the alert with a warning. A failing sink logs a    │
//! │  warning. Neither reaches the caller: the transition already committed.│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tally_core::{MutationReceipt, Quantity, Reference, StockKey};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AlertSettings;
use crate::error::AlertError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Alert {
    /// A document moved to a new status.
    TransitionCommitted {
        reference: Reference,
        action: String,
        previous_status: String,
        new_status: String,
        actor_id: String,
        at: DateTime<Utc>,
    },

    /// A committed deduction left a balance at or below the threshold.
    LowStock {
        key: StockKey,
        balance: Quantity,
        threshold: Quantity,
    },
}

impl Alert {
    /// Low-stock alerts for every receipt that deducted down to `threshold`.
    pub fn low_stock_from(receipts: &[MutationReceipt], threshold: Quantity) -> Vec<Alert> {
        receipts
            .iter()
            .filter(|r| r.new_balance < r.previous_balance && r.new_balance <= threshold)
            .map(|r| Alert::LowStock {
                key: r.key.clone(),
                balance: r.new_balance,
                threshold,
            })
            .collect()
    }
}

/// Destination for alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Writes each alert as a JSON `info!` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        let payload = serde_json::to_string(alert)?;
        info!(target: "tally::alerts", alert = %payload, "Alert");
        Ok(())
    }
}

/// Handle the engine uses to raise alerts.
#[derive(Debug, Clone)]
pub struct AlertDispatcher {
    tx: Option<mpsc::Sender<Alert>>,
}

impl AlertDispatcher {
    /// Starts the delivery task. Must be called inside a tokio runtime.
    ///
    /// The task drains the queue and exits once every dispatcher clone is
    /// dropped; await the handle to wait for that.
    pub fn spawn(sink: Arc<dyn AlertSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Alert>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(alert) = rx.recv().await {
                if let Err(e) = sink.deliver(&alert).await {
                    warn!(error = %e, "Alert sink failed");
                }
            }
            debug!("Alert dispatcher stopped");
        });

        (AlertDispatcher { tx: Some(tx) }, handle)
    }

    /// Dispatcher that discards everything.
    pub fn disabled() -> Self {
        AlertDispatcher { tx: None }
    }

    /// Builds a dispatcher from `[alerts]` settings.
    pub fn from_settings(
        settings: &AlertSettings,
        sink: Arc<dyn AlertSink>,
    ) -> (Self, Option<JoinHandle<()>>) {
        if !settings.enabled {
            return (Self::disabled(), None);
        }
        let (dispatcher, handle) = Self::spawn(sink, settings.queue_capacity);
        (dispatcher, Some(handle))
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queues an alert without waiting.
    pub fn notify(&self, alert: Alert) {
        let Some(tx) = &self.tx else {
            return;
        };

        match tx.try_send(alert) {
            Ok(()) => {}
            Err(TrySendError::Full(alert)) => {
                warn!(?alert, "Alert queue full, dropping alert");
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Alert dispatcher is closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tally_core::{DocumentKind, StockKey};

    #[derive(Default)]
    struct Collect(Mutex<Vec<Alert>>);

    #[async_trait]
    impl AlertSink for Collect {
        async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
            self.0.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl AlertSink for Broken {
        async fn deliver(&self, _alert: &Alert) -> Result<(), AlertError> {
            Err(AlertError::DeliveryFailed("offline".into()))
        }
    }

    fn low(balance: &str) -> Alert {
        Alert::LowStock {
            key: StockKey::new("VAR-1", "LOC-A"),
            balance: balance.parse().unwrap(),
            threshold: Quantity::from(5),
        }
    }

    #[tokio::test]
    async fn test_alerts_reach_sink_in_order() {
        let sink = Arc::new(Collect::default());
        let (dispatcher, handle) = AlertDispatcher::spawn(sink.clone(), 8);

        dispatcher.notify(low("3"));
        dispatcher.notify(low("2.5"));
        drop(dispatcher);
        handle.await.unwrap();

        assert_eq!(*sink.0.lock().unwrap(), vec![low("3"), low("2.5")]);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_stop_dispatcher() {
        let (dispatcher, handle) = AlertDispatcher::spawn(Arc::new(Broken), 4);
        dispatcher.notify(low("1"));
        dispatcher.notify(low("0"));
        drop(dispatcher);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_dispatcher_is_silent() {
        let settings = AlertSettings {
            enabled: false,
            ..AlertSettings::default()
        };
        let (dispatcher, handle) = AlertDispatcher::from_settings(&settings, Arc::new(LogSink));
        assert!(!dispatcher.is_enabled());
        assert!(handle.is_none());
        dispatcher.notify(low("0"));
    }

    #[test]
    fn test_low_stock_only_on_deductions_at_threshold() {
        let receipt = |previous: &str, new: &str| MutationReceipt {
            key: StockKey::new("VAR-1", "LOC-A"),
            previous_balance: previous.parse().unwrap(),
            new_balance: new.parse().unwrap(),
            transaction_entry_id: 1,
            history_entry_id: 1,
        };

        let alerts = Alert::low_stock_from(
            &[
                receipt("10", "5"),
                receipt("10", "5.01"),
                receipt("2", "4"),
                receipt("6", "4.5"),
            ],
            Quantity::from(5),
        );
        assert_eq!(alerts, vec![low("5"), low("4.5")]);
    }

    #[test]
    fn test_alert_json_shape() {
        let alert = Alert::TransitionCommitted {
            reference: Reference::new(DocumentKind::Sale, "s-1"),
            action: "complete".into(),
            previous_status: "draft".into(),
            new_status: "completed".into(),
            actor_id: "clerk".into(),
            at: Utc::now(),
        };
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["type"], "transition_committed");
        assert_eq!(json["reference"]["kind"], "sale");
    }
}
