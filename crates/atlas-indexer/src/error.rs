//! Indexer error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during index operations.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// I/O error during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A single crawl strategy failed
    #[error("Crawl error: {0}")]
    Crawl(String),

    /// Both crawl strategies failed; the build cannot proceed
    #[error("Crawl failed. Daemon crawl: {daemon}. Filesystem crawl: {fallback}")]
    CrawlFallback { daemon: String, fallback: String },

    /// Extraction failed for one file
    #[error("Extraction failed for {path}: {message}")]
    Extraction { path: PathBuf, message: String },

    /// Two or more files claim the same module name and the build is
    /// configured to treat that as fatal
    #[error("{0}")]
    ModuleCollision(#[from] crate::module_index::DuplicateCandidatesError),

    /// Persistence backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// File watcher error
    #[error("Watcher error: {0}")]
    Watcher(String),

    /// An ignore or mock pattern failed to compile
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),
}

impl From<rmp_serde::encode::Error> for IndexerError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        IndexerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for IndexerError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        IndexerError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for IndexerError {
    fn from(e: rusqlite::Error) -> Self {
        IndexerError::Storage(e.to_string())
    }
}

impl From<regex::Error> for IndexerError {
    fn from(e: regex::Error) -> Self {
        IndexerError::InvalidPattern(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: IndexerError = io_err.into();
        assert!(matches!(err, IndexerError::Io(_)));
    }

    #[test]
    fn test_crawl_fallback_embeds_both_messages() {
        let err = IndexerError::CrawlFallback {
            daemon: "socket missing".to_string(),
            fallback: "permission denied".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("socket missing"));
        assert!(msg.contains("permission denied"));
    }
}
