//! Persistence contracts the connector depends on.
//!
//! The platform owns alert, case, artifact and attachment storage; the
//! connector only ever talks to these traits. Every call takes the acting
//! [`AuthContext`] as its first argument.

use crate::models::{
    Alert, AlertFields, AlertPatch, Artifact, ArtifactDescriptor, AuthContext, Case, CasePatch,
};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Errors surfaced by platform stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Byte source for a stored attachment.
pub type AttachmentSource = Box<dyn AsyncRead + Send + Unpin>;

/// Alert persistence.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Looks up the alert identified by `(alert_type, source, source_ref)`.
    /// Absence is normal and returns `Ok(None)`.
    async fn get(
        &self,
        ctx: &AuthContext,
        alert_type: &str,
        source: &str,
        source_ref: &str,
    ) -> StoreResult<Option<Alert>>;

    /// All alerts of one connector family.
    async fn find_by_type(&self, ctx: &AuthContext, alert_type: &str) -> StoreResult<Vec<Alert>>;

    /// The alert linking `case_id` to `source`, if one exists.
    async fn find_by_case(
        &self,
        ctx: &AuthContext,
        alert_type: &str,
        source: &str,
        case_id: &str,
    ) -> StoreResult<Option<Alert>>;

    /// Aggregation: maximum `last_sync_date` over alerts of
    /// `(alert_type, source)`. `None` when no alert matches.
    async fn max_last_sync(
        &self,
        ctx: &AuthContext,
        alert_type: &str,
        source: &str,
    ) -> StoreResult<Option<i64>>;

    async fn create(&self, ctx: &AuthContext, fields: AlertFields) -> StoreResult<Alert>;

    async fn update(&self, ctx: &AuthContext, id: &str, patch: AlertPatch) -> StoreResult<Alert>;
}

/// Case persistence.
#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn get(&self, ctx: &AuthContext, id: &str) -> StoreResult<Case>;

    async fn update(&self, ctx: &AuthContext, id: &str, patch: CasePatch) -> StoreResult<Case>;
}

/// Case observable persistence.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn find_by_case(&self, ctx: &AuthContext, case_id: &str) -> StoreResult<Vec<Artifact>>;

    /// Persists descriptors onto a case. File values are ingested into
    /// attachment storage as part of creation.
    async fn create(
        &self,
        ctx: &AuthContext,
        case_id: &str,
        descriptors: &[ArtifactDescriptor],
    ) -> StoreResult<Vec<Artifact>>;
}

/// Attachment binary storage.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Opens a byte stream over the stored attachment.
    async fn source(&self, ctx: &AuthContext, id: &str) -> StoreResult<AttachmentSource>;
}
