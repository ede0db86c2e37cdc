//! Configuration for the Atlas index engine.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Which persistence backend stores the index between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// One serialized blob per index, rewritten wholesale on every build.
    Snapshot,
    /// Embedded relational store with incremental, transactional writes.
    Sqlite,
}

/// What a build does when extraction fails for a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionErrorPolicy {
    /// Reject the whole build on the first extraction failure.
    Abort,
    /// Keep the raw file record, leave it out of the module index.
    Skip,
}

/// Index engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Directory all indexed paths are stored relative to
    pub root_dir: PathBuf,

    /// Top-level directories to crawl (absolute, or relative to `root_dir`)
    pub roots: Vec<PathBuf>,

    /// File extensions to index, without the leading dot
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Regex patterns; a file matching any of them is never indexed
    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    /// Declared platform tags recognized as filename suffixes ("ios", "android", ...)
    #[serde(default = "default_platforms")]
    pub platforms: Vec<String>,

    /// Directory names holding third-party content, skipped unless `retain_all_files`
    #[serde(default = "default_vendor_dirs")]
    pub vendor_dirs: Vec<String>,

    /// Regex selecting mock implementation files
    #[serde(default)]
    pub mocks_pattern: Option<String>,

    /// List files under vendor directories (they are still never extracted)
    #[serde(default)]
    pub retain_all_files: bool,

    /// Abort the build on a duplicate module name instead of warning
    #[serde(default)]
    pub throw_on_collision: bool,

    /// Record a content hash for every file
    #[serde(default)]
    pub compute_hash: bool,

    /// Upper bound on concurrent extraction jobs
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Keep watching the roots after the first build
    #[serde(default)]
    pub watch: bool,

    /// Persistence backend selection
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Per-file extraction failure policy
    #[serde(default = "default_extraction_errors")]
    pub extraction_errors: ExtractionErrorPolicy,

    /// Directory holding persisted index state
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Caller-supplied token mixed into the cache key; bump it when the
    /// extraction logic itself changes
    #[serde(default)]
    pub cache_id: String,

    /// Unix socket of the crawl daemon; `None` disables the daemon crawler
    #[serde(default)]
    pub daemon_socket: Option<PathBuf>,
}

fn default_extensions() -> Vec<String> {
    vec!["js".to_string(), "json".to_string()]
}

fn default_platforms() -> Vec<String> {
    Vec::new()
}

fn default_vendor_dirs() -> Vec<String> {
    vec!["node_modules".to_string()]
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_backend() -> BackendKind {
    BackendKind::Snapshot
}

fn default_extraction_errors() -> ExtractionErrorPolicy {
    ExtractionErrorPolicy::Skip
}

fn default_cache_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("atlas")
}

impl IndexConfig {
    /// Create a configuration with defaults for everything but the roots.
    pub fn new(root_dir: impl Into<PathBuf>, roots: Vec<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            roots,
            extensions: default_extensions(),
            ignore_patterns: Vec::new(),
            platforms: default_platforms(),
            vendor_dirs: default_vendor_dirs(),
            mocks_pattern: None,
            retain_all_files: false,
            throw_on_collision: false,
            compute_hash: false,
            max_workers: default_max_workers(),
            watch: false,
            backend: default_backend(),
            extraction_errors: default_extraction_errors(),
            cache_dir: default_cache_dir(),
            cache_id: String::new(),
            daemon_socket: None,
        }
    }

    /// Load configuration from a YAML file.
    pub fn load_from(path: &Path) -> Result<Self, crate::CoreError> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| crate::CoreError::InvalidConfig(e.to_string()))
    }

    /// Resolve the configured roots to absolute paths.
    pub fn absolute_roots(&self) -> Vec<PathBuf> {
        self.roots
            .iter()
            .map(|r| {
                if r.is_absolute() {
                    r.clone()
                } else {
                    self.root_dir.join(r)
                }
            })
            .collect()
    }

    /// Path of the persisted index for this configuration.
    ///
    /// Every input that changes what the index would contain participates
    /// in the key, so a config change invalidates the previous state
    /// instead of corrupting it.
    pub fn cache_path(&self) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(self.root_dir.to_string_lossy().as_bytes());
        for root in &self.roots {
            hasher.update(root.to_string_lossy().as_bytes());
        }
        hasher.update(self.extensions.join(",").as_bytes());
        hasher.update(self.platforms.join(",").as_bytes());
        hasher.update([
            self.compute_hash as u8,
            self.retain_all_files as u8,
        ]);
        hasher.update(self.cache_id.as_bytes());
        let digest = format!("{:x}", hasher.finalize());

        let name = format!("index-{}", &digest[..16]);
        self.cache_dir.join(name)
    }

    /// Ensure the cache directory exists.
    pub fn ensure_cache_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.cache_dir)
    }
}
