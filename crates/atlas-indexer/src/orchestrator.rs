//! Build orchestration.
//!
//! One orchestrator drives one index: a full build runs
//! crawl → merge → extract → index → persist and resolves with an
//! immutable snapshot; watch mode keeps rebuilding incrementally from
//! coalesced file events and emits a fresh snapshot per batch. Emitted
//! snapshots never mutate; every cycle produces new structures.

use crate::crawl::{
    crawl_with_fallback, hash_file, ChangedFileStat, ClockMap, CrawlOptions, CrawlResult,
    Crawler, DaemonCrawler, IgnoreMatcher, Mapper, WalkCrawler,
};
use crate::extract::Extractor;
use crate::module_index::{
    platform_for_path, DuplicateCandidatesError, DuplicateSet, InsertOutcome, ModuleIndex,
    ModuleKind, ModuleLocation,
};
use crate::persist::{open_backend, Persistence, StoreRegistry};
use crate::store::{FileRecord, FileStore, MergeOutcome};
use crate::watcher::{EventBatcher, FileWatcher, WatchEvent, WatchEventKind, WatcherOptions};
use crate::IndexerError;
use atlas_core::{ExtractionErrorPolicy, IndexConfig};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a burst of watch events may go quiet before it is processed.
const EVENT_QUIET_PERIOD: Duration = Duration::from_millis(100);

/// Phases of one build cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Idle,
    Crawling,
    Merging,
    Extracting,
    Indexing,
    Persisting,
    Ready,
    Watching,
}

/// Point-in-time view of the index, immutable once handed out.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    pub files: Arc<FileStore>,
    pub index: Arc<ModuleIndex>,
}

/// One watch-mode update: the coalesced events and the snapshot that
/// incorporates them.
pub struct ChangeEvent {
    pub events: Vec<WatchEvent>,
    pub snapshot: IndexSnapshot,
}

/// Everything a build cycle needs, shared between the orchestrator and
/// the watch task.
struct Pipeline {
    config: IndexConfig,
    ignore: IgnoreMatcher,
    mapper: Option<Mapper>,
    mock_pattern: Option<Regex>,
    extractor: Arc<dyn Extractor>,
    persistence: Arc<dyn Persistence>,
    /// Names already warned about; each duplicate name logs once per
    /// orchestrator lifetime
    warned_modules: Mutex<HashSet<String>>,
    warned_mocks: Mutex<HashSet<String>>,
}

impl Pipeline {
    fn new(
        config: IndexConfig,
        extractor: Arc<dyn Extractor>,
        mapper: Option<Mapper>,
        registry: &StoreRegistry,
    ) -> Result<Self, IndexerError> {
        let mut ignore_patterns = Vec::with_capacity(config.ignore_patterns.len());
        for pattern in &config.ignore_patterns {
            ignore_patterns.push(Regex::new(pattern)?);
        }
        let ignore_patterns = Arc::new(ignore_patterns);
        let ignore: IgnoreMatcher = Arc::new(move |path: &Path| {
            let text = path.to_string_lossy();
            ignore_patterns.iter().any(|p| p.is_match(&text))
        });

        let mock_pattern = config
            .mocks_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;

        config.ensure_cache_dir()?;
        let persistence = open_backend(config.backend, &config.cache_path(), registry)?;

        Ok(Self {
            config,
            ignore,
            mapper,
            mock_pattern,
            extractor,
            persistence,
            warned_modules: Mutex::new(HashSet::new()),
            warned_mocks: Mutex::new(HashSet::new()),
        })
    }

    fn crawl_options(&self, clocks: &ClockMap, files: &FileStore) -> CrawlOptions {
        CrawlOptions {
            root_dir: self.config.root_dir.clone(),
            roots: self.config.absolute_roots(),
            extensions: self.config.extensions.clone(),
            ignore: self.ignore.clone(),
            mapper: self.mapper.clone(),
            clocks: clocks.clone(),
            previous: files.observations(),
            compute_hash: self.config.compute_hash,
            retain_all_files: self.config.retain_all_files,
            vendor_dirs: self.config.vendor_dirs.clone(),
        }
    }

    async fn run_crawl(&self, options: &CrawlOptions) -> Result<CrawlResult, IndexerError> {
        let walk = WalkCrawler::new();
        match &self.config.daemon_socket {
            Some(socket) => {
                let daemon = DaemonCrawler::new(socket);
                crawl_with_fallback(Some(&daemon as &dyn Crawler), &walk, options).await
            }
            None => crawl_with_fallback(None, &walk, options).await,
        }
    }

    fn is_vendor(&self, rel: &Path) -> bool {
        rel.components().any(|c| {
            c.as_os_str()
                .to_str()
                .is_some_and(|name| self.config.vendor_dirs.iter().any(|v| v == name))
        })
    }

    fn is_mock(&self, rel: &Path) -> bool {
        self.mock_pattern
            .as_ref()
            .is_some_and(|p| p.is_match(&rel.to_string_lossy()))
    }

    /// Dispatch extraction for every unvisited changed record and
    /// back-fill the results.
    ///
    /// Retained vendor files are listed but never extracted.
    async fn extract_changed(&self, outcome: &mut MergeOutcome) -> Result<(), IndexerError> {
        let jobs: Vec<PathBuf> = outcome
            .changed
            .iter()
            .filter(|(rel, record)| !record.visited && !self.is_vendor(rel))
            .map(|(rel, _)| rel.clone())
            .collect();
        if jobs.is_empty() {
            return Ok(());
        }

        debug!(files = jobs.len(), "Dispatching extraction");

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.max_workers.max(1)));
        let mut tasks = tokio::task::JoinSet::new();
        for rel in jobs {
            let semaphore = semaphore.clone();
            let extractor = self.extractor.clone();
            let absolute = self.config.root_dir.join(&rel);
            let root_dir = self.config.root_dir.clone();
            let compute_hash = self.config.compute_hash;
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            rel,
                            Err(IndexerError::Extraction {
                                path: absolute,
                                message: "worker pool closed".to_string(),
                            }),
                        )
                    }
                };
                let result = extractor.extract(&absolute, &root_dir, compute_hash).await;
                (rel, result)
            });
        }

        // Fan in every dispatched result before indexing proceeds.
        while let Some(joined) = tasks.join_next().await {
            let (rel, result) = joined.map_err(|e| IndexerError::Extraction {
                path: PathBuf::new(),
                message: format!("extraction task failed: {e}"),
            })?;
            match result {
                Ok(meta) => {
                    for record in [outcome.changed.get_mut(&rel), outcome.files.get_mut(&rel)]
                        .into_iter()
                        .flatten()
                    {
                        record.module_id = meta.id.clone().unwrap_or_default();
                        record.dependencies = meta.dependencies.clone();
                        if meta.hash.is_some() {
                            record.hash = meta.hash.clone();
                        }
                        record.visited = true;
                    }
                }
                Err(e) => match self.config.extraction_errors {
                    ExtractionErrorPolicy::Abort => return Err(e),
                    ExtractionErrorPolicy::Skip => {
                        warn!(path = ?rel, error = %e, "Extraction failed, file kept unindexed");
                    }
                },
            }
        }

        Ok(())
    }

    /// Rebuild or incrementally update the module index from the merge
    /// outcome.
    fn apply_index(
        &self,
        prior_index: &ModuleIndex,
        prior_files: &FileStore,
        outcome: &MergeOutcome,
    ) -> Result<ModuleIndex, IndexerError> {
        let mut index = if outcome.is_fresh {
            ModuleIndex::new(&self.config.root_dir)
        } else {
            prior_index.clone()
        };

        if !outcome.is_fresh {
            for removed in &outcome.removed {
                if let Some(old) = prior_files.record(removed) {
                    self.deregister(&mut index, removed, old);
                }
            }
            for rel in outcome.changed.keys() {
                if let Some(old) = prior_files.record(rel) {
                    self.deregister(&mut index, rel, old);
                }
            }
        }

        let additions = if outcome.is_fresh {
            &outcome.files
        } else {
            &outcome.changed
        };
        for (rel, record) in additions {
            self.register(&mut index, rel, record)?;
        }

        Ok(index)
    }

    fn deregister(&self, index: &mut ModuleIndex, rel: &Path, record: &FileRecord) {
        if !record.module_id.is_empty() {
            let platform = platform_for_path(rel, &self.config.platforms);
            index.remove(&record.module_id, &platform, rel);
        }
        if self.is_mock(rel) {
            index.remove_mock(&mock_name(rel), rel);
        }
    }

    fn register(
        &self,
        index: &mut ModuleIndex,
        rel: &Path,
        record: &FileRecord,
    ) -> Result<(), IndexerError> {
        // Vendor content can be listed (retain_all_files) but never
        // contributes to the module index.
        if self.is_vendor(rel) {
            return Ok(());
        }

        if self.is_mock(rel) {
            let name = mock_name(rel);
            let displaced = index
                .state()
                .mocks
                .get(&name)
                .is_some_and(|existing| existing != rel);
            if displaced && self.warned_mocks.lock().insert(name.clone()) {
                warn!(
                    mock = %name,
                    path = %rel.display(),
                    "Duplicate mock implementation, keeping the newest"
                );
            }
            index.set_mock(name, rel);
        }

        if record.module_id.is_empty() {
            return Ok(());
        }

        let platform = platform_for_path(rel, &self.config.platforms);
        let kind = if rel.file_name().is_some_and(|n| n == "package.json") {
            ModuleKind::Package
        } else {
            ModuleKind::Module
        };
        let location = ModuleLocation {
            path: rel.to_path_buf(),
            kind,
        };

        match index.insert(&record.module_id, platform.clone(), location) {
            InsertOutcome::Inserted => Ok(()),
            InsertOutcome::Collision(candidates) => {
                let candidates: DuplicateSet = candidates
                    .into_iter()
                    .map(|(path, kind)| (self.config.root_dir.join(path), kind))
                    .collect();
                let collision = DuplicateCandidatesError {
                    name: record.module_id.clone(),
                    platform,
                    supports_native: false,
                    candidates,
                };
                if self.config.throw_on_collision {
                    return Err(collision.into());
                }
                if self
                    .warned_modules
                    .lock()
                    .insert(record.module_id.clone())
                {
                    warn!("{collision}");
                }
                Ok(())
            }
        }
    }

    async fn persist(
        &self,
        outcome: MergeOutcome,
        index: ModuleIndex,
        clocks: &ClockMap,
    ) -> Result<(MergeOutcome, ModuleIndex), IndexerError> {
        let persistence = self.persistence.clone();
        let clocks = clocks.clone();
        tokio::task::spawn_blocking(move || {
            persistence
                .commit(&outcome, index.state(), &clocks)
                .map(|_| (outcome, index))
        })
        .await
        .map_err(|e| IndexerError::Storage(format!("persist task failed: {e}")))?
    }

    /// Merge, extract, index and persist one crawl result.
    async fn run_cycle(
        &self,
        prior_files: &FileStore,
        prior_index: &ModuleIndex,
        crawl: CrawlResult,
    ) -> Result<(FileStore, ModuleIndex, ClockMap), IndexerError> {
        let mut outcome = prior_files.merge(&crawl);
        self.extract_changed(&mut outcome).await?;
        let index = self.apply_index(prior_index, prior_files, &outcome)?;
        let (outcome, index) = self.persist(outcome, index, &crawl.clocks).await?;

        let files = FileStore::from_files(&self.config.root_dir, outcome.files);
        Ok((files, index, crawl.clocks))
    }

    /// Whether a watch event concerns a file this index cares about.
    fn admits_event(&self, event: &WatchEvent) -> bool {
        let rel = self.relative(&event.path);
        let has_extension = event
            .path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.config.extensions.iter().any(|e| e == ext));
        if !has_extension {
            return false;
        }
        if !self.config.retain_all_files && self.is_vendor(&rel) {
            return false;
        }
        !(self.ignore)(&event.path)
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.config.root_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// The mock name a file registers under: its path below the innermost
/// mock directory, without the file extension.
fn mock_name(rel: &Path) -> String {
    let components: Vec<&str> = rel
        .iter()
        .filter_map(|c| c.to_str())
        .collect();
    let below_mock_dir = components
        .iter()
        .rposition(|c| *c == "__mocks__")
        .map(|at| &components[at + 1..])
        .unwrap_or(&components[components.len().saturating_sub(1)..]);

    let mut name = below_mock_dir.join("/");
    if let Some(ext) = rel.extension().and_then(|e| e.to_str()) {
        name.truncate(name.len() - ext.len() - 1);
    }
    name
}

/// Drives builds and the watch loop for one configured index.
pub struct BuildOrchestrator {
    pipeline: Arc<Pipeline>,
    registry: Arc<StoreRegistry>,
    state: BuildState,
    files: Arc<FileStore>,
    index: Arc<ModuleIndex>,
    clocks: ClockMap,
    loaded: bool,
    watch_task: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

impl BuildOrchestrator {
    pub fn new(
        config: IndexConfig,
        extractor: Arc<dyn Extractor>,
    ) -> Result<Self, IndexerError> {
        Self::construct(config, extractor, None)
    }

    /// An orchestrator whose crawls remap observed files through
    /// `mapper` before ignore checks.
    pub fn with_mapper(
        config: IndexConfig,
        extractor: Arc<dyn Extractor>,
        mapper: Mapper,
    ) -> Result<Self, IndexerError> {
        Self::construct(config, extractor, Some(mapper))
    }

    fn construct(
        config: IndexConfig,
        extractor: Arc<dyn Extractor>,
        mapper: Option<Mapper>,
    ) -> Result<Self, IndexerError> {
        let registry = Arc::new(StoreRegistry::new());
        let root_dir = config.root_dir.clone();
        let pipeline = Arc::new(Pipeline::new(config, extractor, mapper, &registry)?);
        Ok(Self {
            pipeline,
            registry,
            state: BuildState::Idle,
            files: Arc::new(FileStore::new(&root_dir)),
            index: Arc::new(ModuleIndex::new(&root_dir)),
            clocks: ClockMap::new(),
            loaded: false,
            watch_task: None,
            shutdown: None,
        })
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    /// The latest snapshot this orchestrator produced.
    pub fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            files: self.files.clone(),
            index: self.index.clone(),
        }
    }

    /// Run one full build cycle and return the resulting snapshot.
    pub async fn build(&mut self) -> Result<IndexSnapshot, IndexerError> {
        if self.watch_task.is_some() {
            return Err(IndexerError::Watcher(
                "cannot run a build while the watch loop is active".to_string(),
            ));
        }

        if !self.loaded {
            let persistence = self.pipeline.persistence.clone();
            let state = tokio::task::spawn_blocking(move || persistence.read_state())
                .await
                .map_err(|e| IndexerError::Storage(format!("read task failed: {e}")))??;
            self.files = Arc::new(FileStore::from_files(
                &self.pipeline.config.root_dir,
                state.files,
            ));
            self.index = Arc::new(ModuleIndex::from_state(
                &self.pipeline.config.root_dir,
                state.index,
            ));
            self.clocks = state.clocks;
            self.loaded = true;
            debug!(files = self.files.len(), "Loaded persisted state");
        }

        self.state = BuildState::Crawling;
        let options = self.pipeline.crawl_options(&self.clocks, &self.files);
        let crawl = self.pipeline.run_crawl(&options).await?;

        self.state = BuildState::Merging;
        let mut outcome = self.files.merge(&crawl);

        self.state = BuildState::Extracting;
        self.pipeline.extract_changed(&mut outcome).await?;

        self.state = BuildState::Indexing;
        let index = self
            .pipeline
            .apply_index(&self.index, &self.files, &outcome)?;

        self.state = BuildState::Persisting;
        let (outcome, index) = self.pipeline.persist(outcome, index, &crawl.clocks).await?;

        self.files = Arc::new(FileStore::from_files(
            &self.pipeline.config.root_dir,
            outcome.files,
        ));
        self.index = Arc::new(index);
        self.clocks = crawl.clocks;
        self.state = BuildState::Ready;

        info!(
            files = self.files.len(),
            modules = self.index.state().map.len(),
            "Build complete"
        );

        Ok(self.snapshot())
    }

    /// Start the watch loop and return the change event stream.
    ///
    /// Builds first when no build has run yet. Each emitted event
    /// carries a fresh snapshot; snapshots handed out earlier are never
    /// touched again.
    pub async fn watch(&mut self) -> Result<mpsc::Receiver<ChangeEvent>, IndexerError> {
        if !self.pipeline.config.watch {
            return Err(IndexerError::Watcher(
                "watch mode is disabled by configuration".to_string(),
            ));
        }
        if self.watch_task.is_some() {
            return Err(IndexerError::Watcher("already watching".to_string()));
        }
        if self.state != BuildState::Ready {
            self.build().await?;
        }

        let mut watcher = FileWatcher::new(WatcherOptions::default());
        for root in self.pipeline.config.absolute_roots() {
            watcher.watch(&root)?;
        }

        let (events_tx, events_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(watch_loop(
            self.pipeline.clone(),
            watcher,
            self.files.clone(),
            self.index.clone(),
            self.clocks.clone(),
            events_tx,
            shutdown_rx,
        ));

        self.watch_task = Some(task);
        self.shutdown = Some(shutdown_tx);
        self.state = BuildState::Watching;

        Ok(events_rx)
    }

    /// Stop watching, release all handles and fire no further events.
    pub async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.watch_task.take() {
            let _ = task.await;
        }
        self.registry.close_all();
        self.state = BuildState::Idle;
    }
}

async fn watch_loop(
    pipeline: Arc<Pipeline>,
    mut watcher: FileWatcher,
    mut files: Arc<FileStore>,
    mut index: Arc<ModuleIndex>,
    mut clocks: ClockMap,
    events_tx: mpsc::Sender<ChangeEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut batcher = EventBatcher::new(EVENT_QUIET_PERIOD);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            maybe_event = watcher.next() => match maybe_event {
                Some(event) => {
                    if pipeline.admits_event(&event) {
                        batcher.add(event);
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep(EVENT_QUIET_PERIOD / 2), if !batcher.is_empty() => {}
        }

        if !batcher.is_ready() {
            continue;
        }
        let events = batcher.take();

        match process_events(&pipeline, &files, &index, &clocks, &events).await {
            Ok(Some((new_files, new_index, new_clocks))) => {
                files = Arc::new(new_files);
                index = Arc::new(new_index);
                clocks = new_clocks;

                let change = ChangeEvent {
                    events,
                    snapshot: IndexSnapshot {
                        files: files.clone(),
                        index: index.clone(),
                    },
                };
                if events_tx.send(change).await.is_err() {
                    debug!("Change receiver dropped, continuing to persist updates");
                }
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "Watch rebuild failed"),
        }
    }

    debug!("Watch loop stopped");
}

/// Turn one coalesced event batch into a crawl delta and run a cycle.
async fn process_events(
    pipeline: &Arc<Pipeline>,
    files: &Arc<FileStore>,
    index: &Arc<ModuleIndex>,
    clocks: &ClockMap,
    events: &[WatchEvent],
) -> Result<Option<(FileStore, ModuleIndex, ClockMap)>, IndexerError> {
    let mut changed: BTreeMap<PathBuf, ChangedFileStat> = BTreeMap::new();
    let mut removed: BTreeSet<PathBuf> = BTreeSet::new();

    for event in events {
        let rel = pipeline.relative(&event.path);
        match event.kind {
            WatchEventKind::Deleted => {
                removed.insert(rel);
            }
            WatchEventKind::Added | WatchEventKind::Changed => {
                match std::fs::metadata(&event.path) {
                    Ok(metadata) => {
                        let mtime = metadata
                            .modified()
                            .ok()
                            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                            .map(|d| d.as_secs())
                            .unwrap_or(0);
                        let hash = if pipeline.config.compute_hash {
                            hash_file(&event.path)
                        } else {
                            None
                        };
                        changed.insert(
                            rel,
                            ChangedFileStat {
                                mtime,
                                size: metadata.len(),
                                hash,
                            },
                        );
                    }
                    // Deleted again before we could stat it.
                    Err(_) => {
                        removed.insert(rel);
                    }
                }
            }
        }
    }

    if changed.is_empty() && removed.is_empty() {
        return Ok(None);
    }

    let crawl = CrawlResult {
        is_fresh: false,
        changed,
        removed,
        clocks: clocks.clone(),
    };
    pipeline.run_cycle(files, index, crawl).await.map(Some)
}
