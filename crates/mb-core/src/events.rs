//! Platform event bus.
//!
//! A thin broadcast-channel bus carrying the domain events other platform
//! services publish for the connector (and vice-versa). Subscribers receive
//! every event published after they subscribed; a lagging subscriber drops
//! the oldest events rather than blocking publishers.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// Errors from the event bus.
#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("failed to publish event: {0}")]
    Publish(String),
}

/// Domain events exchanged with the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlatformEvent {
    /// Request to re-populate observables on MISP alerts whose artifact
    /// arrays are empty.
    UpdateMispAlertArtifact,
    /// A case export to a remote server completed; carries the alert id of
    /// the reconciliation alert.
    MispExportCompleted { alert_id: String },
}

impl PlatformEvent {
    /// Event kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PlatformEvent::UpdateMispAlertArtifact => "update_misp_alert_artifact",
            PlatformEvent::MispExportCompleted { .. } => "misp_export_completed",
        }
    }
}

/// Broadcast event bus.
pub struct EventBus {
    tx: broadcast::Sender<PlatformEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all current subscribers. Publishing with no
    /// subscribers is not an error.
    pub fn publish(&self, event: PlatformEvent) -> Result<(), EventBusError> {
        debug!(kind = event.kind(), "publishing platform event");
        match self.tx.send(event) {
            Ok(receivers) => {
                debug!(receivers, "event delivered");
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    /// Subscribes to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
