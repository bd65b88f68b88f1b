//! In-memory store implementations.
//!
//! Used by the test suites and by the demo wiring in the CLI. State lives
//! behind `Arc<RwLock<..>>` maps; write operations are recorded so tests can
//! assert on what the connector actually asked the platform to do.

use crate::models::{
    Alert, AlertFields, AlertPatch, Artifact, ArtifactDescriptor, ArtifactValue, AuthContext,
    Case, CasePatch, StoredAttachment,
};
use crate::store::{
    AlertStore, ArtifactStore, AttachmentSource, AttachmentStore, CaseStore, StoreError,
    StoreResult,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory alert storage.
#[derive(Default)]
pub struct InMemoryAlertStore {
    alerts: Arc<RwLock<HashMap<String, Alert>>>,
    update_calls: AtomicU64,
}

impl InMemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `update` calls issued so far.
    pub fn update_call_count(&self) -> u64 {
        self.update_calls.load(Ordering::Relaxed)
    }

    /// Snapshot of all stored alerts.
    pub async fn all(&self) -> Vec<Alert> {
        self.alerts.read().await.values().cloned().collect()
    }

    /// Seeds an alert directly, bypassing `create`.
    pub async fn insert(&self, alert: Alert) {
        self.alerts.write().await.insert(alert.id.clone(), alert);
    }
}

#[async_trait]
impl AlertStore for InMemoryAlertStore {
    async fn get(
        &self,
        _ctx: &AuthContext,
        alert_type: &str,
        source: &str,
        source_ref: &str,
    ) -> StoreResult<Option<Alert>> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .values()
            .find(|a| {
                a.alert_type == alert_type && a.source == source && a.source_ref == source_ref
            })
            .cloned())
    }

    async fn find_by_type(&self, _ctx: &AuthContext, alert_type: &str) -> StoreResult<Vec<Alert>> {
        let alerts = self.alerts.read().await;
        let mut found: Vec<Alert> = alerts
            .values()
            .filter(|a| a.alert_type == alert_type)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn find_by_case(
        &self,
        _ctx: &AuthContext,
        alert_type: &str,
        source: &str,
        case_id: &str,
    ) -> StoreResult<Option<Alert>> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .values()
            .find(|a| {
                a.alert_type == alert_type
                    && a.source == source
                    && a.case_id.as_deref() == Some(case_id)
            })
            .cloned())
    }

    async fn max_last_sync(
        &self,
        _ctx: &AuthContext,
        alert_type: &str,
        source: &str,
    ) -> StoreResult<Option<i64>> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .values()
            .filter(|a| a.alert_type == alert_type && a.source == source)
            .map(|a| a.last_sync_date)
            .max())
    }

    async fn create(&self, _ctx: &AuthContext, fields: AlertFields) -> StoreResult<Alert> {
        let mut alerts = self.alerts.write().await;
        let duplicate = alerts.values().any(|a| {
            a.alert_type == fields.alert_type
                && a.source == fields.source
                && a.source_ref == fields.source_ref
        });
        if duplicate {
            return Err(StoreError::Rejected(format!(
                "alert ({}, {}, {}) already exists",
                fields.alert_type, fields.source, fields.source_ref
            )));
        }
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            alert_type: fields.alert_type,
            source: fields.source,
            source_ref: fields.source_ref,
            title: fields.title,
            description: fields.description,
            severity: fields.severity,
            date: fields.date,
            last_sync_date: fields.last_sync_date,
            status: fields.status,
            follow: fields.follow,
            tags: fields.tags,
            case_template: fields.case_template,
            artifacts: fields.artifacts,
            case_id: fields.case_id,
        };
        alerts.insert(alert.id.clone(), alert.clone());
        Ok(alert)
    }

    async fn update(&self, _ctx: &AuthContext, id: &str, patch: AlertPatch) -> StoreResult<Alert> {
        self.update_calls.fetch_add(1, Ordering::Relaxed);
        let mut alerts = self.alerts.write().await;
        let alert = alerts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("alert {id}")))?;
        if let Some(title) = patch.title {
            alert.title = title;
        }
        if let Some(description) = patch.description {
            alert.description = description;
        }
        if let Some(severity) = patch.severity {
            alert.severity = severity;
        }
        if let Some(date) = patch.date {
            alert.date = date;
        }
        if let Some(last_sync_date) = patch.last_sync_date {
            alert.last_sync_date = last_sync_date;
        }
        if let Some(status) = patch.status {
            alert.status = status;
        }
        if let Some(follow) = patch.follow {
            alert.follow = follow;
        }
        if let Some(tags) = patch.tags {
            alert.tags = tags;
        }
        if let Some(artifacts) = patch.artifacts {
            alert.artifacts = artifacts;
        }
        if let Some(case_id) = patch.case_id {
            alert.case_id = Some(case_id);
        }
        Ok(alert.clone())
    }
}

/// In-memory case storage.
#[derive(Default)]
pub struct InMemoryCaseStore {
    cases: Arc<RwLock<HashMap<String, Case>>>,
}

impl InMemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, case: Case) {
        self.cases.write().await.insert(case.id.clone(), case);
    }
}

#[async_trait]
impl CaseStore for InMemoryCaseStore {
    async fn get(&self, _ctx: &AuthContext, id: &str) -> StoreResult<Case> {
        let cases = self.cases.read().await;
        cases
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("case {id}")))
    }

    async fn update(&self, _ctx: &AuthContext, id: &str, patch: CasePatch) -> StoreResult<Case> {
        let mut cases = self.cases.write().await;
        let case = cases
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("case {id}")))?;
        if let Some(title) = patch.title {
            case.title = title;
        }
        if let Some(description) = patch.description {
            case.description = description;
        }
        if let Some(severity) = patch.severity {
            case.severity = severity;
        }
        if let Some(status) = patch.status {
            case.status = status;
        }
        if let Some(tags) = patch.tags {
            case.tags = tags;
        }
        Ok(case.clone())
    }
}

/// In-memory attachment storage.
#[derive(Default)]
pub struct InMemoryAttachmentStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores bytes and returns the assigned attachment id.
    pub async fn put(&self, bytes: Vec<u8>) -> String {
        let id = Uuid::new_v4().to_string();
        self.blobs.write().await.insert(id.clone(), bytes);
        id
    }
}

#[async_trait]
impl AttachmentStore for InMemoryAttachmentStore {
    async fn source(&self, _ctx: &AuthContext, id: &str) -> StoreResult<AttachmentSource> {
        let blobs = self.blobs.read().await;
        let bytes = blobs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("attachment {id}")))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }
}

/// In-memory case-observable storage. File descriptors are ingested into the
/// paired attachment store on creation, as the platform does.
pub struct InMemoryArtifactStore {
    artifacts: Arc<RwLock<Vec<Artifact>>>,
    attachments: Arc<InMemoryAttachmentStore>,
}

impl InMemoryArtifactStore {
    pub fn new(attachments: Arc<InMemoryAttachmentStore>) -> Self {
        Self {
            artifacts: Arc::new(RwLock::new(Vec::new())),
            attachments,
        }
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn find_by_case(&self, _ctx: &AuthContext, case_id: &str) -> StoreResult<Vec<Artifact>> {
        let artifacts = self.artifacts.read().await;
        Ok(artifacts
            .iter()
            .filter(|a| a.case_id == case_id)
            .cloned()
            .collect())
    }

    async fn create(
        &self,
        _ctx: &AuthContext,
        case_id: &str,
        descriptors: &[ArtifactDescriptor],
    ) -> StoreResult<Vec<Artifact>> {
        let mut created = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let mut descriptor = descriptor.clone();
            if let ArtifactValue::File { handle } = &descriptor.value {
                let bytes = tokio::fs::read(&handle.path).await?;
                let id = self.attachments.put(bytes).await;
                descriptor.value = ArtifactValue::Stored {
                    attachment: StoredAttachment {
                        id,
                        name: handle.name.clone(),
                        content_type: handle.content_type.clone(),
                    },
                };
            }
            created.push(Artifact {
                id: Uuid::new_v4().to_string(),
                case_id: case_id.to_string(),
                descriptor,
            });
        }
        self.artifacts.write().await.extend(created.clone());
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::io::AsyncReadExt;

    fn alert_fields(source_ref: &str) -> AlertFields {
        AlertFields {
            alert_type: "misp".to_string(),
            source: "demo".to_string(),
            source_ref: source_ref.to_string(),
            title: "phish".to_string(),
            description: String::new(),
            severity: 2,
            date: Utc::now(),
            last_sync_date: 100,
            status: crate::models::AlertStatus::New,
            follow: true,
            tags: vec![],
            case_template: None,
            artifacts: vec![],
            case_id: None,
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_source_ref() {
        let ctx = AuthContext::service();
        let store = InMemoryAlertStore::new();
        store.create(&ctx, alert_fields("42")).await.unwrap();
        let err = store.create(&ctx, alert_fields("42")).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn max_last_sync_aggregates_per_source() {
        let ctx = AuthContext::service();
        let store = InMemoryAlertStore::new();
        let mut a = alert_fields("1");
        a.last_sync_date = 10;
        let mut b = alert_fields("2");
        b.last_sync_date = 30;
        store.create(&ctx, a).await.unwrap();
        store.create(&ctx, b).await.unwrap();

        let max = store.max_last_sync(&ctx, "misp", "demo").await.unwrap();
        assert_eq!(max, Some(30));
        let none = store.max_last_sync(&ctx, "misp", "other").await.unwrap();
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn update_patches_only_given_fields() {
        let ctx = AuthContext::service();
        let store = InMemoryAlertStore::new();
        let alert = store.create(&ctx, alert_fields("7")).await.unwrap();

        let patched = store
            .update(
                &ctx,
                &alert.id,
                AlertPatch {
                    last_sync_date: Some(999),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(patched.last_sync_date, 999);
        assert_eq!(patched.title, "phish");
        assert_eq!(store.update_call_count(), 1);
    }

    #[tokio::test]
    async fn attachment_roundtrip_through_artifact_create() {
        let ctx = AuthContext::service();
        let attachments = Arc::new(InMemoryAttachmentStore::new());
        let store = InMemoryArtifactStore::new(Arc::clone(&attachments));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, b"binary-bytes").await.unwrap();

        let descriptor = ArtifactDescriptor {
            data_type: "file".to_string(),
            value: ArtifactValue::File {
                handle: crate::models::AttachmentHandle {
                    name: "payload.bin".to_string(),
                    content_type: "application/octet-stream".to_string(),
                    path,
                },
            },
            message: String::new(),
            tlp: 2,
            tags: vec![],
            start_date: Utc::now(),
        };

        let created = store.create(&ctx, "case-1", &[descriptor]).await.unwrap();
        let ArtifactValue::Stored { attachment } = &created[0].descriptor.value else {
            panic!("file descriptor was not ingested into attachment storage");
        };

        let mut source = attachments.source(&ctx, &attachment.id).await.unwrap();
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, b"binary-bytes");
    }
}
