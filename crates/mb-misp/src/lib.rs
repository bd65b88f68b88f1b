//! # mb-misp
//!
//! Bidirectional synchronization between the case-management platform and
//! remote MISP threat-intelligence servers: scheduled ingestion of
//! published events as alerts with observables, export of cases back as
//! MISP events, attribute/observable taxonomy translation, and handling of
//! password-protected malware-sample archives.

pub mod attachment;
pub mod backfill;
pub mod client;
pub mod error;
pub mod export;
pub mod ingest;
pub mod registry;
pub mod scheduler;
pub mod secret;
pub mod taxonomy;
pub mod testing;
pub mod transform;
pub mod wire;

pub use attachment::AttachmentHandler;
pub use backfill::AlertBackfillWorker;
pub use client::{MispApi, MispClient, MispResponse, RawDownload};
pub use error::{SyncError, SyncResult};
pub use export::{ExportPipeline, ExportedAttribute, ExportedValue};
pub use ingest::{
    EventOutcome, IngestionPipeline, InstanceReport, SyncReport, ALERT_TYPE,
};
pub use registry::{InstanceConfig, InstanceRegistry, MispInstance};
pub use scheduler::{
    AlwaysReady, ReadinessGate, SchedulerHandle, SyncScheduler, DEFAULT_INTERVAL,
};
pub use secret::ApiKey;
pub use transform::transform_attribute;
pub use wire::{MispAttribute, MispEventSummary};
