//! Observable backfill for MISP alerts.
//!
//! Listens for the `UpdateMispAlertArtifact` domain event and re-populates
//! every MISP alert whose artifact array is empty by re-fetching its
//! attributes with no watermark. At most five alerts are refreshed at a
//! time; a missing instance is logged and skipped, never fatal.

use crate::error::{SyncError, SyncResult};
use crate::ingest::{fetch_event_artifacts, ALERT_TYPE};
use crate::registry::InstanceRegistry;
use mb_core::{AlertPatch, AlertStore, AuthContext, EventBus, PlatformEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

const BACKFILL_CONCURRENCY: usize = 5;

/// Event-driven worker re-hydrating alerts that lost their observables.
pub struct AlertBackfillWorker {
    registry: Arc<InstanceRegistry>,
    alerts: Arc<dyn AlertStore>,
}

impl AlertBackfillWorker {
    pub fn new(registry: Arc<InstanceRegistry>, alerts: Arc<dyn AlertStore>) -> Self {
        Self { registry, alerts }
    }

    /// Subscribes to the bus and runs a backfill pass on every
    /// `UpdateMispAlertArtifact` event until the bus closes.
    pub fn spawn(self: Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PlatformEvent::UpdateMispAlertArtifact) => {
                        let ctx = AuthContext::service();
                        match self.backfill(&ctx).await {
                            Ok(refreshed) => info!(refreshed, "alert backfill pass finished"),
                            Err(err) => warn!(%err, "alert backfill pass failed"),
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "backfill worker lagged behind the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// One pass: refresh every MISP alert with an empty artifact array.
    /// Returns how many alerts were refreshed.
    pub async fn backfill(&self, ctx: &AuthContext) -> SyncResult<u64> {
        let alerts = self.alerts.find_by_type(ctx, ALERT_TYPE).await?;
        let semaphore = Arc::new(Semaphore::new(BACKFILL_CONCURRENCY));
        let mut tasks = JoinSet::new();

        for alert in alerts.into_iter().filter(|a| a.artifacts.is_empty()) {
            let instance = match self.registry.get(&alert.source) {
                Ok(instance) => instance.clone(),
                Err(err) => {
                    warn!(alert = %alert.id, source = %alert.source, %err, "skipping alert with unknown instance");
                    continue;
                }
            };
            let semaphore = Arc::clone(&semaphore);
            let alerts_store = Arc::clone(&self.alerts);
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| SyncError::Fetch(e.to_string()))?;
                let (_, descriptors) =
                    fetch_event_artifacts(&instance, &alert.source_ref, None).await?;
                alerts_store
                    .update(
                        &ctx,
                        &alert.id,
                        AlertPatch {
                            artifacts: Some(descriptors),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok::<_, SyncError>(())
            });
        }

        let mut refreshed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => refreshed += 1,
                Ok(Err(err)) => warn!(%err, "alert backfill failed for one alert"),
                Err(err) => warn!(%err, "alert backfill task panicked"),
            }
        }
        Ok(refreshed)
    }
}
