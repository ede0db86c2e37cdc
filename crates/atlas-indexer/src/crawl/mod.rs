//! Crawlers turn a filesystem observation into a minimal changeset.
//!
//! Two strategies implement one contract: the daemon-backed crawler
//! queries the crawl daemon for changes since a checkpoint token, and
//! the plain filesystem walker lists everything and diffs against the
//! prior observations. A failing daemon crawl falls back to the walker
//! once; both failing is fatal for the build.

mod daemon;
mod walk;

pub use daemon::DaemonCrawler;
pub use walk::WalkCrawler;

pub(crate) use walk::hash_file;

use crate::IndexerError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Excludes a file from the crawl; returns `true` to drop it.
pub type IgnoreMatcher = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Remaps one observed file to zero or more virtual logical paths.
pub type Mapper = Arc<dyn Fn(&Path) -> Option<Vec<PathBuf>> + Send + Sync>;

/// Per-root checkpoint tokens, keyed by root-relative path.
pub type ClockMap = BTreeMap<PathBuf, String>;

/// What a crawl observed about one changed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFileStat {
    pub mtime: u64,
    pub size: u64,
    pub hash: Option<String>,
}

/// The changeset produced by one crawl.
#[derive(Debug, Clone, Default)]
pub struct CrawlResult {
    /// The listing is complete; prior state outside `changed` is stale
    pub is_fresh: bool,
    /// New or changed files, keyed by root-relative path
    pub changed: BTreeMap<PathBuf, ChangedFileStat>,
    /// Files gone since the checkpoint; disjoint from `changed`
    pub removed: BTreeSet<PathBuf>,
    /// Checkpoint tokens to hand to the next crawl
    pub clocks: ClockMap,
}

/// Inputs shared by both crawl strategies.
#[derive(Clone)]
pub struct CrawlOptions {
    /// Directory result paths are made relative to
    pub root_dir: PathBuf,
    /// Absolute directories to crawl
    pub roots: Vec<PathBuf>,
    /// Extensions to include, without the leading dot
    pub extensions: Vec<String>,
    pub ignore: IgnoreMatcher,
    pub mapper: Option<Mapper>,
    pub clocks: ClockMap,
    /// Prior (mtime, size) observations, for crawlers without checkpoints
    pub previous: BTreeMap<PathBuf, (u64, u64)>,
    pub compute_hash: bool,
    /// List files under vendor directories instead of skipping them
    pub retain_all_files: bool,
    /// Directory names treated as third-party content
    pub vendor_dirs: Vec<String>,
}

impl CrawlOptions {
    /// Make an absolute path relative to the configured root.
    pub fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    pub fn has_extension(&self, path: &Path) -> bool {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => self.extensions.iter().any(|e| e == ext),
            None => false,
        }
    }

    /// Whether any component of `path` is a vendor directory.
    pub fn is_vendor_path(&self, path: &Path) -> bool {
        path.components().any(|c| {
            c.as_os_str()
                .to_str()
                .is_some_and(|name| self.vendor_dirs.iter().any(|v| v == name))
        })
    }

    /// Apply the mapper and ignore predicate to one observed file.
    ///
    /// Returns the logical absolute paths the observation stands for:
    /// usually the file itself, possibly several virtual paths, or none
    /// when everything is ignored.
    pub fn admit(&self, path: &Path) -> Vec<PathBuf> {
        if let Some(mapper) = &self.mapper {
            if let Some(virtual_paths) = mapper(path) {
                return virtual_paths
                    .into_iter()
                    .filter(|v| !(self.ignore)(v))
                    .collect();
            }
        }
        if (self.ignore)(path) {
            Vec::new()
        } else {
            vec![path.to_path_buf()]
        }
    }
}

/// A crawl strategy.
#[async_trait]
pub trait Crawler: Send + Sync {
    async fn crawl(&self, options: &CrawlOptions) -> Result<CrawlResult, IndexerError>;

    fn name(&self) -> &'static str;
}

/// Run the primary crawler, retrying once with the fallback on failure.
///
/// With no primary configured the fallback runs directly and its error
/// is surfaced as-is. When both strategies fail the returned error
/// embeds both underlying messages.
pub async fn crawl_with_fallback(
    primary: Option<&dyn Crawler>,
    fallback: &dyn Crawler,
    options: &CrawlOptions,
) -> Result<CrawlResult, IndexerError> {
    let primary_err = match primary {
        Some(crawler) => match crawler.crawl(options).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                warn!(
                    crawler = crawler.name(),
                    error = %e,
                    "Primary crawl failed, retrying with {}",
                    fallback.name()
                );
                e
            }
        },
        None => return fallback.crawl(options).await,
    };

    match fallback.crawl(options).await {
        Ok(result) => Ok(result),
        Err(fallback_err) => Err(IndexerError::CrawlFallback {
            daemon: primary_err.to_string(),
            fallback: fallback_err.to_string(),
        }),
    }
}
