//! Atlas Indexer
//!
//! This crate provides the incremental file-index and module-resolution
//! engine for Atlas, including:
//! - Crawling with a daemon-backed strategy and a filesystem-walk fallback
//! - The file metadata store and its incremental merge against crawl deltas
//! - Module name resolution with platform variants and duplicate tracking
//! - Interchangeable snapshot and relational persistence backends
//! - Build orchestration and watch mode with immutable index snapshots

mod error;
pub mod crawl;
pub mod extract;
pub mod module_index;
pub mod orchestrator;
pub mod persist;
pub mod store;
pub mod watcher;

pub use error::IndexerError;
pub use extract::{ExtractedMetadata, Extractor};
pub use module_index::{
    DuplicateCandidatesError, ModuleIndex, ModuleKind, ModuleResolver, Platform,
};
pub use orchestrator::{BuildOrchestrator, BuildState, ChangeEvent, IndexSnapshot};
pub use persist::{Persistence, SnapshotPersistence, SqlitePersistence, StoreRegistry};
pub use store::{FileRecord, FileStore, MergeOutcome};
