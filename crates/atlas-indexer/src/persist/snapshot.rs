//! Flat snapshot persistence.
//!
//! The entire state travels as one MessagePack blob. Writes replace the
//! whole file through a temp-file-and-rename, reads decode everything.
//! Simplicity over incrementality: every write costs the total state
//! size, which is the accepted trade-off for this backend.

use super::{PersistedState, Persistence};
use crate::crawl::ClockMap;
use crate::module_index::{IndexState, PlatformMap};
use crate::store::{FileMap, MergeOutcome};
use crate::IndexerError;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Snapshot-file persistence backend.
pub struct SnapshotPersistence {
    path: PathBuf,
}

impl SnapshotPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_state(&self, state: &PersistedState) -> Result<(), IndexerError> {
        let data = rmp_serde::to_vec(state)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, &data)?;
        std::fs::rename(&temp_path, &self.path)?;

        debug!(path = ?self.path, size = data.len(), "Saved snapshot");
        Ok(())
    }
}

impl Persistence for SnapshotPersistence {
    fn kind(&self) -> &'static str {
        "snapshot"
    }

    fn read_state(&self) -> Result<PersistedState, IndexerError> {
        if !self.path.exists() {
            return Ok(PersistedState::default());
        }

        let data = std::fs::read(&self.path)?;
        match rmp_serde::from_slice(&data) {
            Ok(state) => Ok(state),
            Err(e) => {
                // A corrupt or incompatible snapshot costs a fresh build,
                // not a failed one.
                warn!(path = ?self.path, error = %e, "Discarding unreadable snapshot");
                Ok(PersistedState::default())
            }
        }
    }

    fn read_files(&self) -> Result<FileMap, IndexerError> {
        Ok(self.read_state()?.files)
    }

    fn commit(
        &self,
        outcome: &MergeOutcome,
        index: &IndexState,
        clocks: &ClockMap,
    ) -> Result<(), IndexerError> {
        // `outcome.files` already is the final merged set, so fresh and
        // incremental commits look identical here.
        let state = PersistedState {
            files: outcome.files.clone(),
            index: index.clone(),
            clocks: clocks.clone(),
        };
        self.write_state(&state)
    }

    fn module_entry(&self, name: &str) -> Result<Option<PlatformMap>, IndexerError> {
        Ok(self.read_state()?.index.map.remove(name))
    }

    fn mock_path(&self, name: &str) -> Result<Option<PathBuf>, IndexerError> {
        Ok(self.read_state()?.index.mocks.remove(name))
    }

    fn clear_index(&self) -> Result<(), IndexerError> {
        let mut state = self.read_state()?;
        state.index.map.clear();
        state.index.duplicates.clear();
        self.write_state(&state)
    }

    fn clear_mocks(&self) -> Result<(), IndexerError> {
        let mut state = self.read_state()?;
        state.index.mocks.clear();
        self.write_state(&state)
    }
}
