//! Persistence layer for the index.
//!
//! Two interchangeable backends store the file records, module index
//! and checkpoint tokens between runs: a flat serialized snapshot and
//! an embedded relational store. Both expose the same contract and must
//! produce structurally equal state for identical build sequences.

mod snapshot;
mod sqlite;

pub use snapshot::SnapshotPersistence;
pub use sqlite::{SqlModuleIndex, SqlitePersistence, StoreRegistry};

use crate::crawl::ClockMap;
use crate::module_index::{IndexState, PlatformMap};
use crate::store::{FileMap, MergeOutcome};
use crate::IndexerError;
use atlas_core::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a backend owns between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub files: FileMap,
    pub index: IndexState,
    pub clocks: ClockMap,
}

/// Durable storage for index state.
pub trait Persistence: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Reconstruct the full persisted state. Missing or unreadable
    /// state yields the empty state, never an error the caller has to
    /// recover from.
    fn read_state(&self) -> Result<PersistedState, IndexerError>;

    /// Read only the file records.
    fn read_files(&self) -> Result<FileMap, IndexerError>;

    /// Durably apply one build's outcome.
    ///
    /// Fresh outcomes replace the stored file set; incremental outcomes
    /// delete `removed` and upsert `changed`. Either way the observable
    /// end state equals the in-memory merge.
    fn commit(
        &self,
        outcome: &MergeOutcome,
        index: &IndexState,
        clocks: &ClockMap,
    ) -> Result<(), IndexerError>;

    /// Point lookup of one module's platform entries.
    fn module_entry(&self, name: &str) -> Result<Option<PlatformMap>, IndexerError>;

    /// Point lookup of one mock path.
    fn mock_path(&self, name: &str) -> Result<Option<PathBuf>, IndexerError>;

    /// Drop the module index (live map and duplicates). Subsequent
    /// point reads must not surface entries removed here.
    fn clear_index(&self) -> Result<(), IndexerError>;

    /// Drop the mock index, with the same read-suppression guarantee.
    fn clear_mocks(&self) -> Result<(), IndexerError>;
}

/// Open the configured backend for a store path.
pub fn open_backend(
    kind: BackendKind,
    path: &Path,
    registry: &StoreRegistry,
) -> Result<Arc<dyn Persistence>, IndexerError> {
    match kind {
        BackendKind::Snapshot => Ok(Arc::new(SnapshotPersistence::new(path))),
        BackendKind::Sqlite => Ok(Arc::new(SqlitePersistence::open(path, registry)?)),
    }
}
