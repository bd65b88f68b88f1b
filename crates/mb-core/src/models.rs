//! Core data models shared between the platform and the connector.
//!
//! Alerts and cases are owned by the platform stores; the connector only
//! holds transient views of them. Observable values are a tagged union so
//! that "exactly one of data / attachment / remote reference" holds by
//! construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identity and permission scope of the caller, threaded explicitly through
/// every store and pipeline call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    /// Login of the acting user, or a service identity.
    pub user: String,
    /// Permission scopes granted to this context.
    pub scopes: Vec<String>,
}

impl AuthContext {
    /// Context used by scheduled synchronization runs.
    pub fn service() -> Self {
        Self {
            user: "misp-bridge".to_string(),
            scopes: vec!["alert".to_string(), "case".to_string()],
        }
    }

    /// Context for an interactive user.
    pub fn user(login: impl Into<String>, scopes: Vec<String>) -> Self {
        Self {
            user: login.into(),
            scopes,
        }
    }
}

/// Triage status of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AlertStatus {
    /// Never seen by an analyst.
    New,
    /// Refreshed by synchronization since an analyst last looked.
    Updated,
    /// Promoted to a case, or produced by an export.
    Imported,
    /// Dismissed by an analyst.
    Ignored,
}

/// Status of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum CaseStatus {
    Open,
    Resolved,
    Deleted,
}

/// A file produced by the connector, living in the temp store until the
/// platform persists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentHandle {
    /// Original filename.
    pub name: String,
    /// MIME type.
    pub content_type: String,
    /// Location of the bytes on disk.
    pub path: PathBuf,
}

/// A binary persisted by the platform's attachment store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAttachment {
    /// Attachment id assigned by the store.
    pub id: String,
    /// Original filename.
    pub name: String,
    /// MIME type.
    pub content_type: String,
}

/// The value carried by an observable. Exactly one variant holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ArtifactValue {
    /// Plain textual observable (an IP, a hash, a URL, ...).
    Inline { data: String },
    /// A file already materialized on disk, pending persistence.
    File { handle: AttachmentHandle },
    /// A binary persisted by the platform.
    Stored { attachment: StoredAttachment },
    /// A reference to a binary still held by the remote server.
    Remote {
        filename: String,
        reference: String,
        attachment_type: String,
    },
}

/// Platform-side description of one observable, before or after persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Platform observable taxonomy ("ip", "hash", "file", ...).
    pub data_type: String,
    pub value: ArtifactValue,
    /// Free-text annotation.
    pub message: String,
    /// Traffic Light Protocol marking, 0 (white) to 3 (red).
    pub tlp: u8,
    pub tags: Vec<String>,
    /// When the observable was (last) seen.
    pub start_date: DateTime<Utc>,
}

impl ArtifactDescriptor {
    /// The value used to compare observables for equality across systems:
    /// inline data, or the filename for binary observables.
    pub fn comparison_value(&self) -> &str {
        match &self.value {
            ArtifactValue::Inline { data } => data,
            ArtifactValue::File { handle } => &handle.name,
            ArtifactValue::Stored { attachment } => &attachment.name,
            ArtifactValue::Remote { filename, .. } => filename,
        }
    }
}

/// An observable attached to a case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub case_id: String,
    #[serde(flatten)]
    pub descriptor: ArtifactDescriptor,
}

/// Platform record of an externally observed event awaiting triage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    /// Connector family that produced the alert ("misp").
    pub alert_type: String,
    /// Name of the remote instance the alert came from.
    pub source: String,
    /// Identifier of the event on that instance.
    pub source_ref: String,
    pub title: String,
    pub description: String,
    /// 1 (low) to 3 (high).
    pub severity: u8,
    /// Date carried by the remote event.
    pub date: DateTime<Utc>,
    /// Most recent remote attribute timestamp already ingested, seconds
    /// since epoch. Monotonic per alert.
    pub last_sync_date: i64,
    pub status: AlertStatus,
    /// Whether synchronization keeps refreshing this alert.
    pub follow: bool,
    pub tags: Vec<String>,
    /// Case template applied when the alert is promoted.
    pub case_template: Option<String>,
    pub artifacts: Vec<ArtifactDescriptor>,
    /// Case created from this alert, if any.
    pub case_id: Option<String>,
}

/// Field set for creating an alert.
#[derive(Debug, Clone)]
pub struct AlertFields {
    pub alert_type: String,
    pub source: String,
    pub source_ref: String,
    pub title: String,
    pub description: String,
    pub severity: u8,
    pub date: DateTime<Utc>,
    pub last_sync_date: i64,
    pub status: AlertStatus,
    pub follow: bool,
    pub tags: Vec<String>,
    pub case_template: Option<String>,
    pub artifacts: Vec<ArtifactDescriptor>,
    pub case_id: Option<String>,
}

/// Partial update of an alert. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct AlertPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub severity: Option<u8>,
    pub date: Option<DateTime<Utc>>,
    pub last_sync_date: Option<i64>,
    pub status: Option<AlertStatus>,
    pub follow: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub artifacts: Option<Vec<ArtifactDescriptor>>,
    pub case_id: Option<String>,
}

/// Platform investigation opened from an alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub id: String,
    pub title: String,
    pub description: String,
    /// 1 (low) to 3 (high).
    pub severity: u8,
    pub start_date: DateTime<Utc>,
    pub status: CaseStatus,
    pub tags: Vec<String>,
}

/// Partial update of a case. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct CasePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub severity: Option<u8>,
    pub status: Option<CaseStatus>,
    pub tags: Option<Vec<String>>,
}
