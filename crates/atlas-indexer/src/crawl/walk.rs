//! Plain filesystem walk crawler.
//!
//! Lists every matching file under the roots in parallel, then diffs
//! the listing against the prior observations to produce a delta. Used
//! directly when no daemon is configured and as the fallback when the
//! daemon crawl fails.

use super::{ChangedFileStat, CrawlOptions, CrawlResult, Crawler};
use crate::IndexerError;
use async_trait::async_trait;
use ignore::{WalkBuilder, WalkState};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::UNIX_EPOCH;
use tracing::debug;

/// Filesystem walk crawler.
#[derive(Debug, Default)]
pub struct WalkCrawler;

impl WalkCrawler {
    pub fn new() -> Self {
        Self
    }

    fn walk_roots(options: &CrawlOptions) -> Result<CrawlResult, IndexerError> {
        let mut seen: BTreeMap<PathBuf, (u64, u64)> = BTreeMap::new();

        for root in &options.roots {
            if !root.exists() {
                return Err(IndexerError::Crawl(format!(
                    "root does not exist: {}",
                    root.display()
                )));
            }

            let (tx, rx) = mpsc::channel::<(PathBuf, u64, u64)>();
            let walker = WalkBuilder::new(root)
                .follow_links(false)
                // The ignore predicate is the only filter; no implicit
                // gitignore or hidden-file rules apply to an index crawl.
                .standard_filters(false)
                .filter_entry({
                    let vendor_dirs = options.vendor_dirs.clone();
                    let retain = options.retain_all_files;
                    move |entry| {
                        if retain || !entry.file_type().is_some_and(|ft| ft.is_dir()) {
                            return true;
                        }
                        !entry
                            .file_name()
                            .to_str()
                            .is_some_and(|name| vendor_dirs.iter().any(|v| v == name))
                    }
                })
                .build_parallel();

            walker.run(|| {
                let tx = tx.clone();
                Box::new(move |result| {
                    match result {
                        Ok(entry) => {
                            if entry.file_type().is_some_and(|ft| ft.is_file()) {
                                if let Ok(metadata) = entry.metadata() {
                                    let mtime = metadata
                                        .modified()
                                        .ok()
                                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                                        .map(|d| d.as_secs())
                                        .unwrap_or(0);
                                    let _ = tx.send((
                                        entry.path().to_path_buf(),
                                        mtime,
                                        metadata.len(),
                                    ));
                                }
                            }
                        }
                        Err(e) => {
                            // Individual unreadable entries don't fail the crawl.
                            debug!(error = %e, "Walk error");
                        }
                    }
                    WalkState::Continue
                })
            });

            drop(tx);

            for (path, mtime, size) in rx {
                if !options.has_extension(&path) {
                    continue;
                }
                for admitted in options.admit(&path) {
                    seen.insert(options.relative(&admitted), (mtime, size));
                }
            }
        }

        let is_fresh = options.previous.is_empty();
        let mut changed = BTreeMap::new();
        for (rel, (mtime, size)) in &seen {
            let unchanged = options
                .previous
                .get(rel)
                .is_some_and(|(prev_mtime, _)| prev_mtime == mtime);
            if !is_fresh && unchanged {
                continue;
            }
            let hash = if options.compute_hash {
                hash_file(&options.root_dir.join(rel))
            } else {
                None
            };
            changed.insert(
                rel.clone(),
                ChangedFileStat {
                    mtime: *mtime,
                    size: *size,
                    hash,
                },
            );
        }

        let removed = options
            .previous
            .keys()
            .filter(|rel| !seen.contains_key(*rel))
            .cloned()
            .collect();

        Ok(CrawlResult {
            is_fresh,
            changed,
            removed,
            // The walker has no checkpoint mechanism; daemon tokens pass
            // through untouched.
            clocks: options.clocks.clone(),
        })
    }
}

#[async_trait]
impl Crawler for WalkCrawler {
    async fn crawl(&self, options: &CrawlOptions) -> Result<CrawlResult, IndexerError> {
        let options = options.clone();
        tokio::task::spawn_blocking(move || Self::walk_roots(&options))
            .await
            .map_err(|e| IndexerError::Crawl(format!("walk task panicked: {e}")))?
    }

    fn name(&self) -> &'static str {
        "walk"
    }
}

/// Content hash of one file, hex-encoded. Unreadable files get no hash.
pub(crate) fn hash_file(path: &std::path::Path) -> Option<String> {
    let contents = std::fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Some(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::ClockMap;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn options_for(root: &Path) -> CrawlOptions {
        CrawlOptions {
            root_dir: root.to_path_buf(),
            roots: vec![root.to_path_buf()],
            extensions: vec!["js".to_string(), "json".to_string()],
            ignore: Arc::new(|_| false),
            mapper: None,
            clocks: ClockMap::new(),
            previous: BTreeMap::new(),
            compute_hash: false,
            retain_all_files: false,
            vendor_dirs: vec!["node_modules".to_string()],
        }
    }

    #[tokio::test]
    async fn test_fresh_walk_lists_matching_files() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("Banana.js"), "banana").unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), "skip me").unwrap();
        std::fs::create_dir(temp_dir.path().join("sub")).unwrap();
        std::fs::write(temp_dir.path().join("sub/Melon.js"), "melon").unwrap();

        let result = WalkCrawler::new()
            .crawl(&options_for(temp_dir.path()))
            .await
            .unwrap();

        assert!(result.is_fresh);
        assert!(result.removed.is_empty());
        let paths: Vec<_> = result.changed.keys().cloned().collect();
        assert_eq!(
            paths,
            vec![PathBuf::from("Banana.js"), PathBuf::from("sub/Melon.js")]
        );
        let banana = &result.changed[Path::new("Banana.js")];
        assert_eq!(banana.size, 6);
        assert!(banana.mtime > 0);
        assert!(banana.hash.is_none());
    }

    #[tokio::test]
    async fn test_ignore_predicate_excludes_files() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("Kept.js"), "a").unwrap();
        std::fs::write(temp_dir.path().join("Dropped.js"), "b").unwrap();

        let mut opts = options_for(temp_dir.path());
        opts.ignore = Arc::new(|p: &Path| p.to_string_lossy().contains("Dropped"));

        let result = WalkCrawler::new().crawl(&opts).await.unwrap();
        assert_eq!(result.changed.len(), 1);
        assert!(result.changed.contains_key(Path::new("Kept.js")));
    }

    #[tokio::test]
    async fn test_vendor_dirs_skipped_unless_retained() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("App.js"), "app").unwrap();
        std::fs::create_dir_all(temp_dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(temp_dir.path().join("node_modules/pkg/index.js"), "dep").unwrap();

        let opts = options_for(temp_dir.path());
        let result = WalkCrawler::new().crawl(&opts).await.unwrap();
        assert_eq!(result.changed.len(), 1);

        let mut retained = options_for(temp_dir.path());
        retained.retain_all_files = true;
        let result = WalkCrawler::new().crawl(&retained).await.unwrap();
        assert_eq!(result.changed.len(), 2);
        assert!(result
            .changed
            .contains_key(Path::new("node_modules/pkg/index.js")));
    }

    #[tokio::test]
    async fn test_delta_against_previous_observations() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("Stale.js"), "stale").unwrap();
        std::fs::write(temp_dir.path().join("New.js"), "new").unwrap();

        let stale_mtime = std::fs::metadata(temp_dir.path().join("Stale.js"))
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();

        let mut opts = options_for(temp_dir.path());
        opts.previous
            .insert(PathBuf::from("Stale.js"), (stale_mtime, 5));
        opts.previous.insert(PathBuf::from("Gone.js"), (1, 1));

        let result = WalkCrawler::new().crawl(&opts).await.unwrap();

        assert!(!result.is_fresh);
        // The delta contains only new information.
        assert!(!result.changed.contains_key(Path::new("Stale.js")));
        assert!(result.changed.contains_key(Path::new("New.js")));
        assert_eq!(
            result.removed.iter().collect::<Vec<_>>(),
            vec![Path::new("Gone.js")]
        );
    }

    #[tokio::test]
    async fn test_compute_hash() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("Banana.js"), "banana").unwrap();

        let mut opts = options_for(temp_dir.path());
        opts.compute_hash = true;

        let result = WalkCrawler::new().crawl(&opts).await.unwrap();
        let hash = result.changed[Path::new("Banana.js")].hash.as_deref();
        assert!(hash.is_some_and(|h| h.len() == 64));
    }

    #[tokio::test]
    async fn test_missing_root_is_an_error() {
        let temp_dir = tempdir().unwrap();
        let mut opts = options_for(temp_dir.path());
        opts.roots = vec![temp_dir.path().join("does-not-exist")];

        let result = WalkCrawler::new().crawl(&opts).await;
        assert!(matches!(result, Err(IndexerError::Crawl(_))));
    }

    #[tokio::test]
    async fn test_mapper_produces_virtual_paths() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("bundle.js"), "bundle").unwrap();

        let mut opts = options_for(temp_dir.path());
        opts.mapper = Some(Arc::new(|p: &Path| {
            if p.file_name().is_some_and(|n| n == "bundle.js") {
                Some(vec![
                    p.with_file_name("bundle.first.js"),
                    p.with_file_name("bundle.second.js"),
                ])
            } else {
                None
            }
        }));

        let result = WalkCrawler::new().crawl(&opts).await.unwrap();
        let paths: Vec<_> = result.changed.keys().cloned().collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("bundle.first.js"),
                PathBuf::from("bundle.second.js")
            ]
        );
    }
}
