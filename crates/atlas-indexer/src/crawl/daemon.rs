//! Daemon-backed crawler.
//!
//! Queries the crawl daemon once per root, handing back the previous
//! checkpoint token so the daemon answers with a delta. Each query runs
//! over its own connection, which is released when the query returns,
//! error or not.

use super::{ChangedFileStat, ClockMap, CrawlOptions, CrawlResult, Crawler};
use crate::IndexerError;
use async_trait::async_trait;
use atlas_ipc::IpcClient;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Crawler delegating observation to the crawl daemon.
pub struct DaemonCrawler {
    client: IpcClient,
}

impl DaemonCrawler {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            client: IpcClient::new(socket_path),
        }
    }
}

#[async_trait]
impl Crawler for DaemonCrawler {
    async fn crawl(&self, options: &CrawlOptions) -> Result<CrawlResult, IndexerError> {
        let mut is_fresh = false;
        let mut changed: BTreeMap<PathBuf, ChangedFileStat> = BTreeMap::new();
        let mut removed: BTreeSet<PathBuf> = BTreeSet::new();
        let mut clocks: ClockMap = options.clocks.clone();

        for root in &options.roots {
            let rel_root = options.relative(root);
            let since = options.clocks.get(&rel_root).cloned();

            let result = self
                .client
                .query(root, since, options.extensions.clone(), options.compute_hash)
                .await
                .map_err(|e| {
                    IndexerError::Crawl(format!(
                        "daemon query for {} failed: {e}",
                        root.display()
                    ))
                })?;

            debug!(
                root = %root.display(),
                files = result.files.len(),
                is_fresh = result.is_fresh,
                "Daemon query answered"
            );

            is_fresh = is_fresh || result.is_fresh;
            clocks.insert(rel_root, result.clock);

            for delta in result.files {
                let absolute = root.join(&delta.path);

                if !delta.exists {
                    removed.insert(options.relative(&absolute));
                    continue;
                }
                if !options.retain_all_files && options.is_vendor_path(&absolute) {
                    continue;
                }

                let stat = ChangedFileStat {
                    mtime: delta.mtime,
                    size: delta.size,
                    hash: delta.hash.clone(),
                };
                for admitted in options.admit(&absolute) {
                    changed.insert(options.relative(&admitted), stat.clone());
                }
            }
        }

        Ok(CrawlResult {
            is_fresh,
            changed,
            removed,
            clocks,
        })
    }

    fn name(&self) -> &'static str {
        "daemon"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::{crawl_with_fallback, WalkCrawler};
    use async_trait::async_trait;
    use atlas_ipc::{
        ErrorCode, FileDelta, IpcServer, QueryResult, Request, RequestHandler, Response,
        ResponseData,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Scripted daemon: full listing without a checkpoint, fixed delta
    /// with one.
    struct ScriptedDaemon;

    #[async_trait]
    impl RequestHandler for ScriptedDaemon {
        async fn handle(&self, request: Request) -> Response {
            match request {
                Request::Query { since, .. } => {
                    let result = if since.is_none() {
                        QueryResult {
                            clock: "c:1".to_string(),
                            is_fresh: true,
                            files: vec![
                                FileDelta {
                                    path: PathBuf::from("Banana.js"),
                                    exists: true,
                                    mtime: 30,
                                    size: 64,
                                    hash: None,
                                },
                                FileDelta {
                                    path: PathBuf::from("node_modules/pkg/index.js"),
                                    exists: true,
                                    mtime: 10,
                                    size: 5,
                                    hash: None,
                                },
                            ],
                        }
                    } else {
                        QueryResult {
                            clock: "c:2".to_string(),
                            is_fresh: false,
                            files: vec![
                                FileDelta {
                                    path: PathBuf::from("Melon.js"),
                                    exists: true,
                                    mtime: 42,
                                    size: 7,
                                    hash: Some("beef".to_string()),
                                },
                                FileDelta {
                                    path: PathBuf::from("Banana.js"),
                                    exists: false,
                                    mtime: 0,
                                    size: 0,
                                    hash: None,
                                },
                            ],
                        }
                    };
                    Response::ok_with(ResponseData::Query { result })
                }
                _ => Response::error(ErrorCode::InvalidRequest, "unexpected request"),
            }
        }
    }

    async fn start_daemon(socket_path: &Path) {
        let server = IpcServer::new(socket_path, Arc::new(ScriptedDaemon))
            .await
            .unwrap();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn options_for(root: &Path) -> CrawlOptions {
        CrawlOptions {
            root_dir: root.to_path_buf(),
            roots: vec![root.join("src")],
            extensions: vec!["js".to_string()],
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
    async fn test_fresh_query_without_checkpoint() {
        let temp_dir = tempdir().unwrap();
        let socket = temp_dir.path().join("daemon.sock");
        start_daemon(&socket).await;

        let crawler = DaemonCrawler::new(&socket);
        let result = crawler.crawl(&options_for(temp_dir.path())).await.unwrap();

        assert!(result.is_fresh);
        assert_eq!(result.clocks[Path::new("src")], "c:1");
        // Vendor content is dropped before it reaches the changeset.
        assert_eq!(result.changed.len(), 1);
        assert!(result.changed.contains_key(Path::new("src/Banana.js")));
    }

    #[tokio::test]
    async fn test_delta_query_with_checkpoint() {
        let temp_dir = tempdir().unwrap();
        let socket = temp_dir.path().join("daemon.sock");
        start_daemon(&socket).await;

        let crawler = DaemonCrawler::new(&socket);
        let mut opts = options_for(temp_dir.path());
        opts.clocks.insert(PathBuf::from("src"), "c:1".to_string());

        let result = crawler.crawl(&opts).await.unwrap();

        assert!(!result.is_fresh);
        assert_eq!(result.clocks[Path::new("src")], "c:2");
        assert!(result.changed.contains_key(Path::new("src/Melon.js")));
        assert_eq!(
            result.changed[Path::new("src/Melon.js")].hash.as_deref(),
            Some("beef")
        );
        assert!(result.removed.contains(Path::new("src/Banana.js")));
    }

    #[tokio::test]
    async fn test_vendor_files_retained_when_configured() {
        let temp_dir = tempdir().unwrap();
        let socket = temp_dir.path().join("daemon.sock");
        start_daemon(&socket).await;

        let crawler = DaemonCrawler::new(&socket);
        let mut opts = options_for(temp_dir.path());
        opts.retain_all_files = true;

        let result = crawler.crawl(&opts).await.unwrap();
        assert!(result
            .changed
            .contains_key(Path::new("src/node_modules/pkg/index.js")));
    }

    #[tokio::test]
    async fn test_missing_daemon_falls_back_to_walk() {
        let temp_dir = tempdir().unwrap();
        let src = temp_dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("Banana.js"), "banana").unwrap();

        let daemon = DaemonCrawler::new(temp_dir.path().join("no-daemon.sock"));
        let walk = WalkCrawler::new();
        let opts = options_for(temp_dir.path());

        let result = crawl_with_fallback(Some(&daemon as &dyn Crawler), &walk, &opts)
            .await
            .unwrap();
        assert!(result.changed.contains_key(Path::new("src/Banana.js")));
    }
}
