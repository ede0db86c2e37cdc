//! File system watcher for live index updates.
//!
//! Uses FSEvents on macOS and inotify on Linux for efficient file
//! system event monitoring with debouncing. The orchestrator consumes
//! the event stream through a channel and coalesces bursts with an
//! [`EventBatcher`] before rebuilding.

use crate::IndexerError;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebouncedEvent, Debouncer, RecommendedCache};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// File change type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Changed,
    Deleted,
}

/// A file system change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Absolute path to the changed file
    pub path: PathBuf,
    pub kind: WatchEventKind,
}

/// Options for the file watcher.
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Debounce duration
    pub debounce: Duration,
    /// Whether to watch recursively
    pub recursive: bool,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(200),
            recursive: true,
        }
    }
}

/// Debounced file system watcher over any number of roots.
pub struct FileWatcher {
    options: WatcherOptions,
    tx: mpsc::Sender<WatchEvent>,
    rx: mpsc::Receiver<WatchEvent>,
    debouncers: Vec<Debouncer<RecommendedWatcher, RecommendedCache>>,
}

impl FileWatcher {
    /// Create a new file watcher.
    pub fn new(options: WatcherOptions) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        Self {
            options,
            tx,
            rx,
            debouncers: Vec::new(),
        }
    }

    /// Start watching a root directory.
    ///
    /// Returns only once the subscription is active, which doubles as
    /// the readiness signal for this root.
    pub fn watch(&mut self, path: &Path) -> Result<(), IndexerError> {
        let path = path
            .canonicalize()
            .map_err(|e| IndexerError::Watcher(format!("{}: {e}", path.display())))?;

        let tx = self.tx.clone();

        let mut debouncer = new_debouncer(
            self.options.debounce,
            None,
            move |result: Result<Vec<DebouncedEvent>, Vec<notify::Error>>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(change) = convert_event(&event.event) {
                            if let Err(e) = tx.blocking_send(change) {
                                error!(error = %e, "Failed to send change event");
                            }
                        }
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "Watcher error");
                    }
                }
            },
        )
        .map_err(|e| IndexerError::Watcher(e.to_string()))?;

        let mode = if self.options.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        debouncer
            .watch(&path, mode)
            .map_err(|e: notify::Error| IndexerError::Watcher(e.to_string()))?;

        info!(path = ?path, recursive = self.options.recursive, "Started watching");

        self.debouncers.push(debouncer);

        Ok(())
    }

    /// Receive the next change event.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Try to receive a change event without blocking.
    pub fn try_next(&mut self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }
}

/// Convert a notify Event to our WatchEvent.
fn convert_event(event: &Event) -> Option<WatchEvent> {
    let path = event.paths.first()?.clone();

    // Only file events count; directory creation and removal are
    // reflected through the events of the files inside them.
    if path.is_dir() {
        return None;
    }

    let kind = match &event.kind {
        EventKind::Create(_) => WatchEventKind::Added,
        EventKind::Modify(_) => WatchEventKind::Changed,
        EventKind::Remove(_) => WatchEventKind::Deleted,
        EventKind::Any | EventKind::Access(_) | EventKind::Other => return None,
    };

    debug!(path = ?path, kind = ?kind, "File change detected");

    Some(WatchEvent { path, kind })
}

/// Coalesces change events into batches for one rebuild each.
///
/// Repeated events for the same path collapse into one; a deletion
/// always wins over an earlier add or change.
pub struct EventBatcher {
    events: Vec<WatchEvent>,
    quiet_period: Duration,
    last_add: Option<Instant>,
}

impl EventBatcher {
    /// Create a batcher that flushes after `quiet_period` without new
    /// events.
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            events: Vec::new(),
            quiet_period,
            last_add: None,
        }
    }

    /// Add an event to the batch.
    pub fn add(&mut self, event: WatchEvent) {
        self.last_add = Some(Instant::now());

        if let Some(existing) = self.events.iter_mut().find(|e| e.path == event.path) {
            if event.kind == WatchEventKind::Deleted {
                existing.kind = WatchEventKind::Deleted;
            } else if existing.kind != WatchEventKind::Deleted {
                existing.kind = event.kind;
            }
        } else {
            self.events.push(event);
        }
    }

    /// Whether the batch should be processed now.
    pub fn is_ready(&self) -> bool {
        !self.events.is_empty()
            && self
                .last_add
                .is_some_and(|at| at.elapsed() >= self.quiet_period)
    }

    /// Take the current batch and reset.
    pub fn take(&mut self) -> Vec<WatchEvent> {
        self.last_add = None;
        std::mem::take(&mut self.events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_watcher_options_default() {
        let options = WatcherOptions::default();
        assert_eq!(options.debounce, Duration::from_millis(200));
        assert!(options.recursive);
    }

    #[tokio::test]
    async fn test_watcher_watch_roots() {
        let temp_dir = tempdir().unwrap();
        let other_dir = tempdir().unwrap();
        let mut watcher = FileWatcher::new(WatcherOptions::default());

        assert!(watcher.watch(temp_dir.path()).is_ok());
        assert!(watcher.watch(other_dir.path()).is_ok());
    }

    #[tokio::test]
    async fn test_watcher_missing_root() {
        let temp_dir = tempdir().unwrap();
        let mut watcher = FileWatcher::new(WatcherOptions::default());

        let result = watcher.watch(&temp_dir.path().join("missing"));
        assert!(matches!(result, Err(IndexerError::Watcher(_))));
    }

    #[test]
    fn test_batcher_deduplicates_same_path() {
        let mut batcher = EventBatcher::new(Duration::from_millis(100));

        batcher.add(WatchEvent {
            path: PathBuf::from("Banana.js"),
            kind: WatchEventKind::Changed,
        });
        batcher.add(WatchEvent {
            path: PathBuf::from("Banana.js"),
            kind: WatchEventKind::Changed,
        });

        assert_eq!(batcher.len(), 1);
    }

    #[test]
    fn test_batcher_delete_wins() {
        let mut batcher = EventBatcher::new(Duration::from_millis(100));

        batcher.add(WatchEvent {
            path: PathBuf::from("Banana.js"),
            kind: WatchEventKind::Changed,
        });
        batcher.add(WatchEvent {
            path: PathBuf::from("Banana.js"),
            kind: WatchEventKind::Deleted,
        });
        // A later change does not resurrect the file within one batch.
        batcher.add(WatchEvent {
            path: PathBuf::from("Banana.js"),
            kind: WatchEventKind::Changed,
        });

        let batch = batcher.take();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, WatchEventKind::Deleted);
    }

    #[test]
    fn test_batcher_take_resets() {
        let mut batcher = EventBatcher::new(Duration::from_millis(0));

        batcher.add(WatchEvent {
            path: PathBuf::from("a.js"),
            kind: WatchEventKind::Added,
        });
        batcher.add(WatchEvent {
            path: PathBuf::from("b.js"),
            kind: WatchEventKind::Changed,
        });

        let batch = batcher.take();
        assert_eq!(batch.len(), 2);
        assert!(batcher.is_empty());
        assert!(!batcher.is_ready());
    }

    #[test]
    fn test_batcher_quiet_period() {
        let mut batcher = EventBatcher::new(Duration::from_millis(250));
        batcher.add(WatchEvent {
            path: PathBuf::from("a.js"),
            kind: WatchEventKind::Added,
        });

        // Just added: not ready yet.
        assert!(!batcher.is_ready());

        let mut instant_batcher = EventBatcher::new(Duration::from_millis(0));
        instant_batcher.add(WatchEvent {
            path: PathBuf::from("a.js"),
            kind: WatchEventKind::Added,
        });
        assert!(instant_batcher.is_ready());
    }

    #[test]
    fn test_convert_event_kinds() {
        let event = |kind| Event {
            kind,
            paths: vec![PathBuf::from("Banana.js")],
            attrs: Default::default(),
        };

        let added = convert_event(&event(EventKind::Create(notify::event::CreateKind::File)));
        assert_eq!(added.unwrap().kind, WatchEventKind::Added);

        let changed = convert_event(&event(EventKind::Modify(notify::event::ModifyKind::Data(
            notify::event::DataChange::Content,
        ))));
        assert_eq!(changed.unwrap().kind, WatchEventKind::Changed);

        let deleted = convert_event(&event(EventKind::Remove(notify::event::RemoveKind::File)));
        assert_eq!(deleted.unwrap().kind, WatchEventKind::Deleted);

        let access = convert_event(&event(EventKind::Access(notify::event::AccessKind::Read)));
        assert!(access.is_none());
    }

    #[test]
    fn test_convert_event_skips_directories() {
        let temp_dir = tempdir().unwrap();
        let event = Event {
            kind: EventKind::Create(notify::event::CreateKind::Folder),
            paths: vec![temp_dir.path().to_path_buf()],
            attrs: Default::default(),
        };

        assert!(convert_event(&event).is_none());
    }
}
