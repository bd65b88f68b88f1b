//! Scheduled ingestion of published MISP events into platform alerts.
//!
//! Instances are scanned concurrently; within one instance events are
//! processed one at a time so alert updates never race. A failing event is
//! recorded in the report and never aborts the rest of the batch; a failing
//! instance is logged and dropped for the tick, which leaves its watermark
//! where it was so the next tick retries from the last successful point.

use crate::attachment::AttachmentHandler;
use crate::error::{SyncError, SyncResult};
use crate::registry::{InstanceRegistry, MispInstance};
use crate::transform::transform_attribute;
use crate::wire::{parse_attributes, parse_event_summaries, MispAttribute, MispEventSummary};
use mb_core::{
    Alert, AlertFields, AlertPatch, AlertStatus, AlertStore, ArtifactDescriptor, ArtifactStore,
    AuthContext, CasePatch, CaseStatus, CaseStore, TempStore,
};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Alert type every record produced by this connector carries.
pub const ALERT_TYPE: &str = "misp";

/// What happened to one remote event.
#[derive(Debug)]
pub enum EventOutcome {
    Created(Alert),
    Updated(Alert),
    /// Alert exists but is not followed; returned as-is.
    Unchanged(Alert),
}

impl EventOutcome {
    pub fn alert(&self) -> &Alert {
        match self {
            EventOutcome::Created(a) | EventOutcome::Updated(a) | EventOutcome::Unchanged(a) => a,
        }
    }
}

/// Per-instance tick report.
#[derive(Debug, Default)]
pub struct InstanceReport {
    pub instance: String,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
    /// Per-event outcomes, in processing order.
    pub outcomes: Vec<Result<EventOutcome, SyncError>>,
    /// Set when the whole instance batch was dropped.
    pub instance_error: Option<SyncError>,
}

impl InstanceReport {
    fn new(instance: &str) -> Self {
        Self {
            instance: instance.to_string(),
            ..Default::default()
        }
    }

    fn dropped(instance: &str, error: SyncError) -> Self {
        Self {
            instance: instance.to_string(),
            instance_error: Some(error),
            ..Default::default()
        }
    }

    fn record(&mut self, outcome: Result<EventOutcome, SyncError>) {
        match &outcome {
            Ok(EventOutcome::Created(_)) => self.created += 1,
            Ok(EventOutcome::Updated(_)) => self.updated += 1,
            Ok(EventOutcome::Unchanged(_)) => self.unchanged += 1,
            Err(_) => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }
}

/// Aggregated report for one synchronization tick.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub instances: Vec<InstanceReport>,
}

impl SyncReport {
    pub fn total_failed(&self) -> u64 {
        self.instances.iter().map(|i| i.failed).sum()
    }

    pub fn total_changed(&self) -> u64 {
        self.instances.iter().map(|i| i.created + i.updated).sum()
    }
}

/// The ingestion core.
#[derive(Clone)]
pub struct IngestionPipeline {
    registry: Arc<InstanceRegistry>,
    alerts: Arc<dyn AlertStore>,
    cases: Arc<dyn CaseStore>,
    artifacts: Arc<dyn ArtifactStore>,
    attachments: AttachmentHandler,
}

impl IngestionPipeline {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        alerts: Arc<dyn AlertStore>,
        cases: Arc<dyn CaseStore>,
        artifacts: Arc<dyn ArtifactStore>,
        temp: Arc<TempStore>,
    ) -> Self {
        Self {
            registry,
            alerts,
            cases,
            artifacts,
            attachments: AttachmentHandler::new(temp),
        }
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Delta synchronization across all configured instances.
    pub async fn synchronize(&self, ctx: &AuthContext) -> SyncReport {
        self.run(ctx, false).await
    }

    /// Synchronization with no watermark: every event is re-evaluated and
    /// alert artifact arrays are rebuilt from the full attribute set.
    pub async fn full_synchronize(&self, ctx: &AuthContext) -> SyncReport {
        self.run(ctx, true).await
    }

    async fn run(&self, ctx: &AuthContext, full: bool) -> SyncReport {
        let mut tasks = JoinSet::new();
        for instance in self.registry.iter() {
            let pipeline = self.clone();
            let instance = instance.clone();
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let name = instance.config.name.clone();
                match pipeline.sync_instance(&ctx, &instance, full).await {
                    Ok(report) => report,
                    Err(err) => {
                        warn!(instance = %name, %err, "instance batch dropped for this tick");
                        InstanceReport::dropped(&name, err)
                    }
                }
            });
        }

        let mut report = SyncReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(instance_report) => report.instances.push(instance_report),
                Err(err) => warn!(%err, "instance sync task panicked"),
            }
        }
        report
    }

    /// One instance: watermark, index scan, then events strictly in order.
    async fn sync_instance(
        &self,
        ctx: &AuthContext,
        instance: &MispInstance,
        full: bool,
    ) -> SyncResult<InstanceReport> {
        let name = &instance.config.name;
        let watermark = if full {
            None
        } else {
            Some(
                self.alerts
                    .max_last_sync(ctx, ALERT_TYPE, name)
                    .await?
                    .unwrap_or(0),
            )
        };

        let body = instance.api.event_index_since(watermark.unwrap_or(0)).await?;
        let (summaries, raw_count) = parse_event_summaries(&body);
        if summaries.len() != raw_count {
            warn!(
                instance = %name,
                parsed = summaries.len(),
                raw = raw_count,
                "some event summaries failed to parse"
            );
        }
        info!(instance = %name, events = summaries.len(), full, "scanning published events");

        let mut report = InstanceReport::new(name);
        for summary in &summaries {
            let outcome = self.process_event(ctx, instance, summary, watermark, full).await;
            if let Err(err) = &outcome {
                warn!(instance = %name, event = %summary.id, %err, "event sync failed");
            }
            report.record(outcome);
        }
        info!(
            instance = %name,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failed,
            "instance sync finished"
        );
        Ok(report)
    }

    async fn process_event(
        &self,
        ctx: &AuthContext,
        instance: &MispInstance,
        summary: &MispEventSummary,
        watermark: Option<i64>,
        full: bool,
    ) -> SyncResult<EventOutcome> {
        let source = &instance.config.name;
        let existing = self
            .alerts
            .get(ctx, ALERT_TYPE, source, &summary.id)
            .await?;

        // Delta fetches start from what this alert has already seen; full
        // sync and first contact take everything.
        let since = match (watermark, &existing) {
            (Some(_), Some(alert)) => Some(alert.last_sync_date),
            _ => None,
        };

        let (attributes, descriptors) =
            fetch_event_artifacts(instance, &summary.id, since).await?;
        let attribute_high_water = attributes.iter().map(|a| a.timestamp).max().unwrap_or(0);
        let last_sync = summary.publish_timestamp.max(attribute_high_water);

        match existing {
            None => {
                let alert = self
                    .alerts
                    .create(
                        ctx,
                        AlertFields {
                            alert_type: ALERT_TYPE.to_string(),
                            source: source.clone(),
                            source_ref: summary.id.clone(),
                            title: summary.info.clone(),
                            description: format!(
                                "Imported from MISP instance {source}, event {}",
                                summary.id
                            ),
                            severity: summary.severity(),
                            date: summary.event_date(),
                            last_sync_date: last_sync,
                            status: AlertStatus::New,
                            follow: true,
                            tags: summary.tags.clone(),
                            case_template: instance.config.case_template.clone(),
                            artifacts: descriptors,
                            case_id: None,
                        },
                    )
                    .await?;
                Ok(EventOutcome::Created(alert))
            }
            Some(alert) if alert.follow || full => {
                // Delta runs only fetched attributes newer than the alert's
                // watermark, so the refreshed array keeps what was already
                // there; full sync rebuilds it from scratch.
                let artifacts = if full {
                    descriptors.clone()
                } else {
                    merge_artifacts(&alert.artifacts, &descriptors)
                };
                let status = match (full, alert.status) {
                    (true, _) => None,
                    (false, AlertStatus::New) => None,
                    (false, _) => Some(AlertStatus::Updated),
                };
                let updated = self
                    .alerts
                    .update(
                        ctx,
                        &alert.id,
                        AlertPatch {
                            title: Some(summary.info.clone()),
                            severity: Some(summary.severity()),
                            tags: Some(summary.tags.clone()),
                            last_sync_date: Some(alert.last_sync_date.max(last_sync)),
                            status,
                            artifacts: Some(artifacts),
                            ..Default::default()
                        },
                    )
                    .await?;

                if let Some(case_id) = &alert.case_id {
                    self.merge_into_case(ctx, case_id, summary, &descriptors, full)
                        .await?;
                }
                Ok(EventOutcome::Updated(updated))
            }
            Some(alert) => Ok(EventOutcome::Unchanged(alert)),
        }
    }

    /// Propagates refreshed event fields into the case opened from the
    /// alert, then appends the newly ingested observables to it.
    async fn merge_into_case(
        &self,
        ctx: &AuthContext,
        case_id: &str,
        summary: &MispEventSummary,
        new_descriptors: &[ArtifactDescriptor],
        full: bool,
    ) -> SyncResult<()> {
        let patch = CasePatch {
            title: Some(summary.info.clone()),
            severity: Some(summary.severity()),
            tags: Some(summary.tags.clone()),
            // New intel re-opens the case; a full resync leaves whatever
            // state the analyst put it in.
            status: if full { None } else { Some(CaseStatus::Open) },
            ..Default::default()
        };
        self.cases.update(ctx, case_id, patch).await?;
        if !new_descriptors.is_empty() {
            self.artifacts.create(ctx, case_id, new_descriptors).await?;
        }
        Ok(())
    }

    /// Resolves remote-attachment references on a promoted alert's
    /// observables into local files, unwrapping malware samples.
    pub async fn hydrate_remote_attachments(
        &self,
        instance_name: &str,
        descriptors: &[ArtifactDescriptor],
    ) -> SyncResult<Vec<ArtifactDescriptor>> {
        let instance = self.registry.get(instance_name)?;
        let mut hydrated = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            hydrated.push(
                self.attachments
                    .materialize(instance.api.as_ref(), descriptor)
                    .await?,
            );
        }
        Ok(hydrated)
    }
}

/// Fetches and transforms the attributes of one event. Shared with the
/// backfill worker.
pub(crate) async fn fetch_event_artifacts(
    instance: &MispInstance,
    event_id: &str,
    since: Option<i64>,
) -> SyncResult<(Vec<MispAttribute>, Vec<ArtifactDescriptor>)> {
    let body = instance.api.attribute_search(event_id, since).await?;
    let attributes = parse_attributes(&body);
    let descriptors = attributes
        .iter()
        .flat_map(|a| transform_attribute(&instance.config, since, a))
        .collect();
    Ok((attributes, descriptors))
}

/// Appends newly ingested descriptors to an alert's existing array,
/// skipping values that are already present.
fn merge_artifacts(
    existing: &[ArtifactDescriptor],
    incoming: &[ArtifactDescriptor],
) -> Vec<ArtifactDescriptor> {
    let mut merged = existing.to_vec();
    for descriptor in incoming {
        let duplicate = merged.iter().any(|d| {
            d.data_type == descriptor.data_type
                && d.comparison_value() == descriptor.comparison_value()
        });
        if !duplicate {
            merged.push(descriptor.clone());
        }
    }
    merged
}
