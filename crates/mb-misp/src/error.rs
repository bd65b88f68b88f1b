//! Connector error taxonomy.

use mb_core::StoreError;
use thiserror::Error;

/// Errors raised by the synchronization connector.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Unknown instance name or invalid instance configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP transport failure or non-2xx response.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Malformed JSON, event or attribute.
    #[error("parse error: {0}")]
    Parse(String),

    /// Unreadable or malformed archive. Degrades to the original file at
    /// the attachment layer and is not surfaced past it.
    #[error("archive error: {0}")]
    Archive(String),

    /// Rejection from a platform store.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Rejection from the remote server during export, with the observable
    /// that was being exported.
    #[error("export of {artifact} rejected: {message}")]
    Export { message: String, artifact: String },
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub(crate) fn fetch(err: impl std::fmt::Display) -> Self {
        SyncError::Fetch(err.to_string())
    }

    pub(crate) fn parse(err: impl std::fmt::Display) -> Self {
        SyncError::Parse(err.to_string())
    }
}
