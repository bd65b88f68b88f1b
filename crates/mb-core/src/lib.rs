//! # mb-core
//!
//! Platform-side domain model and collaborator contracts for misp-bridge.
//!
//! This crate defines the records the case-management platform owns
//! (alerts, cases, observables), the persistence traits the synchronization
//! connector depends on, in-memory implementations of those traits, the
//! platform event bus, and the shared temporary-file store.

pub mod events;
pub mod memory;
pub mod models;
pub mod store;
pub mod temp;

pub use events::{EventBus, EventBusError, PlatformEvent};
pub use memory::{
    InMemoryAlertStore, InMemoryArtifactStore, InMemoryAttachmentStore, InMemoryCaseStore,
};
pub use models::{
    Alert, AlertFields, AlertPatch, AlertStatus, Artifact, ArtifactDescriptor, ArtifactValue,
    AttachmentHandle, AuthContext, Case, CasePatch, CaseStatus, StoredAttachment,
};
pub use store::{
    AlertStore, ArtifactStore, AttachmentStore, CaseStore, StoreError, StoreResult,
};
pub use temp::TempStore;
