//! Case to MISP event export.
//!
//! Creates or reuses a remote event for the case, submits only attributes
//! the remote side does not already hold, and records the result as a
//! non-followed reconciliation alert so a later export finds the event
//! again.

use crate::client::MispResponse;
use crate::error::{SyncError, SyncResult};
use crate::ingest::ALERT_TYPE;
use crate::registry::InstanceRegistry;
use crate::taxonomy;
use crate::wire::{created_event_id, parse_attributes, rejected_attribute_indexes};
use base64::Engine;
use mb_core::{
    Alert, AlertFields, AlertPatch, AlertStatus, AlertStore, ArtifactDescriptor, ArtifactStore,
    ArtifactValue, AttachmentStore, AuthContext, Case, CaseStore, EventBus, PlatformEvent,
    StoredAttachment,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

/// Staging record for one observable during export.
#[derive(Debug, Clone)]
pub struct ExportedAttribute {
    pub category: &'static str,
    pub misp_type: &'static str,
    pub value: ExportedValue,
    pub comment: String,
    /// Descriptor the attribute was built from, kept for the
    /// reconciliation alert.
    descriptor: ArtifactDescriptor,
}

/// Either inline text or a binary attachment handle.
#[derive(Debug, Clone)]
pub enum ExportedValue {
    Inline(String),
    Attachment(StoredAttachment),
}

impl ExportedAttribute {
    /// Value used for deduplication and the already-exported check.
    fn comparison_value(&self) -> &str {
        match &self.value {
            ExportedValue::Inline(data) => data,
            ExportedValue::Attachment(attachment) => &attachment.name,
        }
    }
}

/// The case export core.
pub struct ExportPipeline {
    registry: Arc<InstanceRegistry>,
    alerts: Arc<dyn AlertStore>,
    cases: Arc<dyn CaseStore>,
    artifacts: Arc<dyn ArtifactStore>,
    attachments: Arc<dyn AttachmentStore>,
    bus: Option<Arc<EventBus>>,
}

impl ExportPipeline {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        alerts: Arc<dyn AlertStore>,
        cases: Arc<dyn CaseStore>,
        artifacts: Arc<dyn ArtifactStore>,
        attachments: Arc<dyn AttachmentStore>,
    ) -> Self {
        Self {
            registry,
            alerts,
            cases,
            artifacts,
            attachments,
            bus: None,
        }
    }

    /// Publishes an export-completed event after each successful export.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Exports a case to the named instance. Unknown instance names are
    /// fatal to the call; attribute-level rejections are reported after the
    /// reconciliation alert has been written.
    pub async fn export(
        &self,
        ctx: &AuthContext,
        instance_name: &str,
        case_id: &str,
    ) -> SyncResult<Alert> {
        let instance = self.registry.get(instance_name)?;
        let case = self.cases.get(ctx, case_id).await?;

        // A previous export of this case left a reconciliation alert whose
        // source_ref is the remote event id.
        let previous = self
            .alerts
            .find_by_case(ctx, ALERT_TYPE, instance_name, case_id)
            .await?;
        let previous_event = previous.as_ref().map(|a| a.source_ref.clone());

        let case_artifacts = self.artifacts.find_by_case(ctx, case_id).await?;
        let mut staged = Vec::with_capacity(case_artifacts.len());
        for artifact in &case_artifacts {
            staged.push(stage_attribute(&artifact.descriptor)?);
        }
        let deduped = dedup_last_occurrence(staged);

        let (event_id, already_exported) = match previous_event {
            None => self.create_remote_event(instance_name, &case, &deduped).await?,
            Some(event_id) => {
                let body = instance.api.attribute_search(&event_id, None).await?;
                let exported = parse_attributes(&body)
                    .into_iter()
                    .map(|a| a.value)
                    .collect::<HashSet<_>>();
                (event_id, exported)
            }
        };

        let mut failures = Vec::new();
        for attribute in &deduped {
            if already_exported.contains(attribute.comparison_value()) {
                continue;
            }
            if let Err(err) = self.upload_attribute(ctx, instance_name, &event_id, attribute).await
            {
                warn!(instance = %instance_name, event = %event_id, %err, "attribute export rejected");
                failures.push(err);
            }
        }

        let alert = self
            .write_reconciliation_alert(ctx, instance_name, &case, &event_id, previous, &deduped)
            .await?;
        info!(
            instance = %instance_name,
            case = %case.id,
            event = %event_id,
            attributes = deduped.len(),
            failed = failures.len(),
            "case exported"
        );
        if let Some(bus) = &self.bus {
            let _ = bus.publish(PlatformEvent::MispExportCompleted {
                alert_id: alert.id.clone(),
            });
        }

        match failures.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(alert),
        }
    }

    /// Creates the remote event carrying all inline attributes, and returns
    /// the new event id plus the set of values MISP accepted with it.
    async fn create_remote_event(
        &self,
        instance_name: &str,
        case: &Case,
        attributes: &[ExportedAttribute],
    ) -> SyncResult<(String, HashSet<String>)> {
        let instance = self.registry.get(instance_name)?;
        let inline: Vec<&ExportedAttribute> = attributes
            .iter()
            .filter(|a| matches!(a.value, ExportedValue::Inline(_)))
            .collect();
        let attribute_payload: Vec<Value> = inline
            .iter()
            .map(|a| {
                json!({
                    "category": a.category,
                    "type": a.misp_type,
                    "value": a.comparison_value(),
                    "comment": a.comment,
                })
            })
            .collect();

        let payload = json!({
            "distribution": 0,
            "threat_level_id": case.severity,
            "analysis": 0,
            "info": case.title,
            "date": case.start_date.format("%y-%m-%d").to_string(),
            "published": false,
            "Attribute": attribute_payload,
        });

        let response = instance.api.create_event(&payload).await?;
        if !response.is_success() {
            return Err(SyncError::Export {
                message: response_message(&response),
                artifact: format!("case {}", case.id),
            });
        }
        let event_id = created_event_id(&response.body).ok_or_else(|| {
            SyncError::Parse("event creation response carries no event id".to_string())
        })?;

        // Attributes MISP rejected inside the create call are not exported;
        // everything else submitted with the event is.
        let rejected = rejected_attribute_indexes(&response.body);
        let exported = inline
            .iter()
            .enumerate()
            .filter(|(index, _)| !rejected.contains(index))
            .map(|(_, a)| a.comparison_value().to_string())
            .collect();
        Ok((event_id, exported))
    }

    async fn upload_attribute(
        &self,
        ctx: &AuthContext,
        instance_name: &str,
        event_id: &str,
        attribute: &ExportedAttribute,
    ) -> SyncResult<()> {
        let instance = self.registry.get(instance_name)?;
        let response = match &attribute.value {
            ExportedValue::Attachment(stored) => {
                let mut source = self.attachments.source(ctx, &stored.id).await?;
                let mut bytes = Vec::new();
                source
                    .read_to_end(&mut bytes)
                    .await
                    .map_err(|e| SyncError::Persistence(e.into()))?;
                let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
                let body = json!({
                    "request": {
                        "event_id": event_id_value(event_id),
                        "category": "Payload delivery",
                        "type": "malware-sample",
                        "comment": attribute.comment,
                        "files": [ { "filename": stored.name, "data": encoded } ],
                    }
                });
                instance.api.upload_sample(&body).await?
            }
            ExportedValue::Inline(data) => {
                let body = json!({
                    "category": attribute.category,
                    "type": attribute.misp_type,
                    "value": data,
                    "comment": attribute.comment,
                });
                instance.api.add_attribute(event_id, &body).await?
            }
        };

        if response.is_success() {
            Ok(())
        } else {
            Err(SyncError::Export {
                message: response_message(&response),
                artifact: attribute.comparison_value().to_string(),
            })
        }
    }

    /// Creates or refreshes the alert that ties the case to the remote
    /// event. It is never followed and carries a zero watermark, so delta
    /// ingestion leaves it alone.
    async fn write_reconciliation_alert(
        &self,
        ctx: &AuthContext,
        instance_name: &str,
        case: &Case,
        event_id: &str,
        previous: Option<Alert>,
        attributes: &[ExportedAttribute],
    ) -> SyncResult<Alert> {
        let instance = self.registry.get(instance_name)?;
        let descriptors: Vec<ArtifactDescriptor> =
            attributes.iter().map(|a| a.descriptor.clone()).collect();

        let alert = match previous {
            Some(existing) => {
                self.alerts
                    .update(
                        ctx,
                        &existing.id,
                        AlertPatch {
                            title: Some(case.title.clone()),
                            severity: Some(case.severity),
                            status: Some(AlertStatus::Imported),
                            follow: Some(false),
                            last_sync_date: Some(0),
                            artifacts: Some(descriptors),
                            ..Default::default()
                        },
                    )
                    .await?
            }
            None => {
                self.alerts
                    .create(
                        ctx,
                        AlertFields {
                            alert_type: ALERT_TYPE.to_string(),
                            source: instance_name.to_string(),
                            source_ref: event_id.to_string(),
                            title: case.title.clone(),
                            description: format!("Case {} exported to MISP", case.id),
                            severity: case.severity,
                            date: case.start_date,
                            last_sync_date: 0,
                            status: AlertStatus::Imported,
                            follow: false,
                            tags: case.tags.clone(),
                            case_template: instance.config.case_template.clone(),
                            artifacts: descriptors,
                            case_id: Some(case.id.clone()),
                        },
                    )
                    .await?
            }
        };
        Ok(alert)
    }
}

/// Builds the staging record for one case observable via the taxonomy
/// tables. Remote references and unpersisted files cannot be exported and
/// violate the descriptor invariant.
fn stage_attribute(descriptor: &ArtifactDescriptor) -> SyncResult<ExportedAttribute> {
    let (value, routing_value) = match &descriptor.value {
        ArtifactValue::Inline { data } => (ExportedValue::Inline(data.clone()), data.clone()),
        ArtifactValue::Stored { attachment } => (
            ExportedValue::Attachment(attachment.clone()),
            attachment.name.clone(),
        ),
        ArtifactValue::File { handle } => {
            return Err(SyncError::Export {
                message: "observable holds an unpersisted file".to_string(),
                artifact: handle.name.clone(),
            });
        }
        ArtifactValue::Remote { filename, .. } => {
            return Err(SyncError::Export {
                message: "observable still references a remote attachment".to_string(),
                artifact: filename.clone(),
            });
        }
    };
    let (category, misp_type) = taxonomy::misp_pair_for(&descriptor.data_type, &routing_value);
    Ok(ExportedAttribute {
        category,
        misp_type,
        value,
        comment: descriptor.message.clone(),
        descriptor: descriptor.clone(),
    })
}

/// Keeps the last occurrence of each `(category, type, value)` triple.
fn dedup_last_occurrence(attributes: Vec<ExportedAttribute>) -> Vec<ExportedAttribute> {
    let mut deduped: Vec<ExportedAttribute> = Vec::with_capacity(attributes.len());
    for attribute in attributes {
        let collision = deduped.iter().position(|existing| {
            existing.category == attribute.category
                && existing.misp_type == attribute.misp_type
                && existing.comparison_value() == attribute.comparison_value()
        });
        match collision {
            Some(index) => deduped[index] = attribute,
            None => deduped.push(attribute),
        }
    }
    deduped
}

/// Best-effort error text from a MISP rejection body.
fn response_message(response: &MispResponse) -> String {
    let message = response.body.get("message").and_then(Value::as_str);
    let errors = response.body.get("errors").map(render_value);
    match (message, errors) {
        (Some(message), Some(errors)) => format!("{message} {errors}"),
        (Some(message), None) => message.to_string(),
        (None, Some(errors)) => errors,
        (None, None) => format!(
            "MISP export failed: status {} body {}",
            response.status, response.body
        ),
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// upload_sample wants a numeric event id; fall back to the raw string if
/// the server handed us something else.
fn event_id_value(event_id: &str) -> Value {
    event_id
        .parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(event_id))
}
