//! Periodic synchronization driver.
//!
//! One task ticks at the configured interval (default one hour). Each tick
//! checks the platform readiness gate, runs a delta synchronization under a
//! service auth context, and bulk-releases the temp files the cycle
//! allocated. The stop handle cancels the loop promptly; an in-flight tick
//! is allowed to finish.

use crate::ingest::IngestionPipeline;
use mb_core::{AuthContext, TempStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Default tick interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);

/// Gate the platform supplies; synchronization only runs once migrations
/// have finished.
pub trait ReadinessGate: Send + Sync {
    fn ready(&self) -> bool;
}

/// Gate that is always open, for wiring without a migration state.
pub struct AlwaysReady;

impl ReadinessGate for AlwaysReady {
    fn ready(&self) -> bool {
        true
    }
}

/// Periodic synchronization task.
pub struct SyncScheduler {
    pipeline: Arc<IngestionPipeline>,
    temp: Arc<TempStore>,
    readiness: Arc<dyn ReadinessGate>,
    interval: Duration,
}

impl SyncScheduler {
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        temp: Arc<TempStore>,
        readiness: Arc<dyn ReadinessGate>,
        interval: Duration,
    ) -> Self {
        Self {
            pipeline,
            temp,
            readiness,
            interval,
        }
    }

    /// Spawns the periodic task. The first tick fires immediately.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let scheduler = self;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => scheduler.tick().await,
                    _ = stop_rx.changed() => {
                        info!("sync scheduler stopping");
                        break;
                    }
                }
            }
        });
        SchedulerHandle { stop: stop_tx, task }
    }

    /// One synchronization cycle. Never fails the process.
    pub async fn tick(&self) {
        if !self.readiness.ready() {
            info!("platform not ready, skipping synchronization tick");
            return;
        }
        let ctx = AuthContext::service();
        let report = self.pipeline.synchronize(&ctx).await;
        info!(
            instances = report.instances.len(),
            changed = report.total_changed(),
            failed = report.total_failed(),
            "synchronization tick finished"
        );
        self.temp.release_all();
    }
}

/// Stop hook for the scheduler task.
pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Cancels the periodic task and waits for it to wind down.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            warn!(%err, "scheduler task did not shut down cleanly");
        }
    }
}
