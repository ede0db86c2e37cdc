//! The extraction seam.
//!
//! Turning one file's source text into identity metadata is an external
//! capability: a pure, idempotent async function invoked once per
//! unvisited file. The orchestrator fans calls out over a bounded
//! worker pool and back-fills the results into the file records.

use crate::IndexerError;
use async_trait::async_trait;
use std::path::Path;

/// Identity metadata extracted from one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedMetadata {
    /// Module name the file declares, if it declares one
    pub id: Option<String>,
    /// Required module names, in declaration order
    pub dependencies: Vec<String>,
    /// Content hash, when requested
    pub hash: Option<String>,
}

/// Per-file metadata extraction.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract identity metadata for `file`.
    ///
    /// Must be side-effect-free on the filesystem; `root_dir` is only
    /// context for relativizing names.
    async fn extract(
        &self,
        file: &Path,
        root_dir: &Path,
        compute_hash: bool,
    ) -> Result<ExtractedMetadata, IndexerError>;
}
