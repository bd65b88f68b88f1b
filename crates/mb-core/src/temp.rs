//! Process-wide temporary-file store.
//!
//! Downloads and archive extractions allocate files here; the scheduler
//! releases the whole batch at the end of each synchronization cycle, so a
//! failure mid-cycle still frees everything at the next cycle boundary.

use crate::store::{StoreError, StoreResult};
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::{Builder, TempDir, TempPath};
use tracing::debug;

/// Batching temp-file allocator.
pub struct TempStore {
    root: TempDir,
    live: Mutex<Vec<TempPath>>,
}

impl TempStore {
    pub fn new() -> StoreResult<Self> {
        let root = Builder::new()
            .prefix("misp-bridge-")
            .tempdir()
            .map_err(StoreError::Io)?;
        Ok(Self {
            root,
            live: Mutex::new(Vec::new()),
        })
    }

    /// Allocates a fresh file under the store root. The file lives until the
    /// next [`TempStore::release_all`].
    pub fn new_temporary_file(&self, prefix: &str, name: &str) -> StoreResult<PathBuf> {
        let file = Builder::new()
            .prefix(&format!("{prefix}-"))
            .suffix(&format!("-{}", sanitize(name)))
            .tempfile_in(self.root.path())
            .map_err(StoreError::Io)?;
        let temp_path = file.into_temp_path();
        let path = temp_path.to_path_buf();
        self.live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(temp_path);
        Ok(path)
    }

    /// Deletes every file allocated since the last release.
    pub fn release_all(&self) {
        let mut live = self
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = live.len();
        live.clear();
        if count > 0 {
            debug!(count, "released temporary files");
        }
    }

    /// Number of files currently held.
    pub fn live_count(&self) -> usize {
        self.live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Keeps only filename-safe characters from a caller-supplied name.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
