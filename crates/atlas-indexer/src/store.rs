//! File metadata store and the incremental merge against crawl results.
//!
//! The store owns one [`FileRecord`] per indexed file, keyed by path
//! relative to the project root. Merging a crawl result is a pure
//! function from (prior records, crawl delta) to a new record set, so a
//! store handed out to a caller never mutates under them.

use crate::crawl::CrawlResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Metadata for one indexed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Logical module name this file declares; empty when the file is not
    /// a module or has not been extracted yet
    pub module_id: String,
    /// Modification time, seconds since epoch
    pub mtime: u64,
    /// File size in bytes
    pub size: u64,
    /// Extraction has run since the current content was observed
    pub visited: bool,
    /// Required module names, in declaration order
    pub dependencies: Vec<String>,
    /// Content hash, present only when hash computation is enabled
    pub hash: Option<String>,
}

impl FileRecord {
    /// A record for newly observed content, before extraction.
    pub fn unvisited(mtime: u64, size: u64, hash: Option<String>) -> Self {
        Self {
            module_id: String::new(),
            mtime,
            size,
            visited: false,
            dependencies: Vec::new(),
            hash,
        }
    }
}

/// Records keyed by root-relative path.
pub type FileMap = BTreeMap<PathBuf, FileRecord>;

/// Result of merging a crawl into the prior record set.
///
/// `changed` is both the extraction dispatch list and the persistence
/// write-set; `files` is the complete merged state.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub files: FileMap,
    pub changed: FileMap,
    pub removed: BTreeSet<PathBuf>,
    pub is_fresh: bool,
}

/// Immutable view over the merged file records.
#[derive(Debug, Clone, Default)]
pub struct FileStore {
    root: PathBuf,
    files: FileMap,
}

impl FileStore {
    /// Create an empty store for the given project root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: FileMap::new(),
        }
    }

    /// Create a store over an existing record set.
    pub fn from_files(root: impl Into<PathBuf>, files: FileMap) -> Self {
        Self {
            root: root.into(),
            files,
        }
    }

    /// The project root all record paths are relative to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Merge a crawl result into this store's records.
    ///
    /// Fresh crawls replace everything: every listed file becomes a new
    /// unvisited record. Delta crawls delete `removed`, then for each
    /// changed path:
    /// - identical mtime keeps the existing record untouched (cache hit,
    ///   no re-extraction),
    /// - matching content hash updates only mtime/size (touch without
    ///   edit),
    /// - anything else becomes a fresh unvisited record.
    pub fn merge(&self, crawl: &CrawlResult) -> MergeOutcome {
        let mut changed = FileMap::new();

        if crawl.is_fresh {
            let mut files = FileMap::new();
            for (path, observed) in &crawl.changed {
                let record =
                    FileRecord::unvisited(observed.mtime, observed.size, observed.hash.clone());
                files.insert(path.clone(), record.clone());
                changed.insert(path.clone(), record);
            }
            return MergeOutcome {
                files,
                changed,
                removed: BTreeSet::new(),
                is_fresh: true,
            };
        }

        let mut files = self.files.clone();
        for removed in &crawl.removed {
            files.remove(removed);
        }

        for (path, observed) in &crawl.changed {
            match files.get_mut(path) {
                Some(existing) if existing.mtime == observed.mtime => {
                    changed.insert(path.clone(), existing.clone());
                }
                Some(existing)
                    if observed.hash.is_some() && existing.hash == observed.hash =>
                {
                    existing.mtime = observed.mtime;
                    existing.size = observed.size;
                    changed.insert(path.clone(), existing.clone());
                }
                _ => {
                    let record =
                        FileRecord::unvisited(observed.mtime, observed.size, observed.hash.clone());
                    files.insert(path.clone(), record.clone());
                    changed.insert(path.clone(), record);
                }
            }
        }

        MergeOutcome {
            files,
            changed,
            removed: crawl.removed.clone(),
            is_fresh: false,
        }
    }

    /// The (mtime, size) observations the crawler diffs against.
    pub fn observations(&self) -> BTreeMap<PathBuf, (u64, u64)> {
        self.files
            .iter()
            .map(|(path, record)| (path.clone(), (record.mtime, record.size)))
            .collect()
    }

    /// Look up a record by relative or absolute path.
    pub fn record(&self, path: &Path) -> Option<&FileRecord> {
        self.files.get(&self.to_relative(path))
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.record(path).is_some()
    }

    /// The module name a file declares, if any.
    pub fn module_name(&self, path: &Path) -> Option<&str> {
        self.record(path)
            .map(|r| r.module_id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn size(&self, path: &Path) -> Option<u64> {
        self.record(path).map(|r| r.size)
    }

    pub fn hash(&self, path: &Path) -> Option<&str> {
        self.record(path).and_then(|r| r.hash.as_deref())
    }

    /// Dependencies recorded for a file; `None` when the file is unknown.
    pub fn dependencies(&self, path: &Path) -> Option<&[String]> {
        self.record(path).map(|r| r.dependencies.as_slice())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Iterate records by relative path.
    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &FileRecord)> {
        self.files.iter()
    }

    /// Iterate indexed files as absolute paths.
    pub fn absolute_paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.files.keys().map(move |rel| self.root.join(rel))
    }

    /// All files whose relative path matches the regex.
    pub fn match_files(&self, pattern: &regex::Regex) -> Vec<PathBuf> {
        self.files
            .keys()
            .filter(|rel| pattern.is_match(&rel.to_string_lossy()))
            .map(|rel| self.root.join(rel))
            .collect()
    }

    /// All files matching any of the glob patterns.
    ///
    /// Globs are matched against paths relative to `root` when given,
    /// otherwise against absolute paths.
    pub fn match_glob(
        &self,
        globs: &[glob::Pattern],
        root: Option<&Path>,
    ) -> BTreeSet<PathBuf> {
        let mut matched = BTreeSet::new();
        for absolute in self.absolute_paths() {
            let candidate = match root {
                Some(root) => absolute.strip_prefix(root).unwrap_or(&absolute).to_path_buf(),
                None => absolute.clone(),
            };
            if globs.iter().any(|g| g.matches_path(&candidate)) {
                matched.insert(absolute);
            }
        }
        matched
    }

    /// Borrow the underlying record map.
    pub fn files(&self) -> &FileMap {
        &self.files
    }

    fn to_relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::{ChangedFileStat, CrawlResult};
    use std::collections::BTreeMap;

    fn stat(mtime: u64, size: u64, hash: Option<&str>) -> ChangedFileStat {
        ChangedFileStat {
            mtime,
            size,
            hash: hash.map(str::to_string),
        }
    }

    fn visited_record(id: &str, mtime: u64, deps: &[&str], hash: Option<&str>) -> FileRecord {
        FileRecord {
            module_id: id.to_string(),
            mtime,
            size: 100,
            visited: true,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            hash: hash.map(str::to_string),
        }
    }

    fn store_with(records: Vec<(&str, FileRecord)>) -> FileStore {
        let files = records
            .into_iter()
            .map(|(p, r)| (PathBuf::from(p), r))
            .collect();
        FileStore::from_files("/project", files)
    }

    fn delta(
        changed: Vec<(&str, ChangedFileStat)>,
        removed: Vec<&str>,
        is_fresh: bool,
    ) -> CrawlResult {
        CrawlResult {
            is_fresh,
            changed: changed
                .into_iter()
                .map(|(p, s)| (PathBuf::from(p), s))
                .collect(),
            removed: removed.into_iter().map(PathBuf::from).collect(),
            clocks: BTreeMap::new(),
        }
    }

    #[test]
    fn test_fresh_merge_discards_prior_state() {
        let store = store_with(vec![("Old.js", visited_record("Old", 1, &[], None))]);
        let crawl = delta(vec![("New.js", stat(5, 10, None))], vec![], true);

        let outcome = store.merge(&crawl);

        assert!(outcome.is_fresh);
        assert_eq!(outcome.files.len(), 1);
        let record = &outcome.files[Path::new("New.js")];
        assert!(!record.visited);
        assert!(record.module_id.is_empty());
        assert!(record.dependencies.is_empty());
        assert_eq!(outcome.changed.len(), 1);
    }

    #[test]
    fn test_unchanged_mtime_keeps_record_identity() {
        let record = visited_record("Banana", 30, &["Strawberry"], None);
        let store = store_with(vec![("Banana.js", record.clone())]);
        let crawl = delta(vec![("Banana.js", stat(30, 200, None))], vec![], false);

        let outcome = store.merge(&crawl);

        // Same mtime: the record survives byte-for-byte, no re-extraction.
        assert_eq!(outcome.files[Path::new("Banana.js")], record);
        assert!(outcome.changed[Path::new("Banana.js")].visited);
    }

    #[test]
    fn test_hash_match_preserves_extraction_results() {
        let record = visited_record("Banana", 30, &["Strawberry"], Some("abcd"));
        let store = store_with(vec![("Banana.js", record)]);
        let crawl = delta(
            vec![("Banana.js", stat(42, 201, Some("abcd")))],
            vec![],
            false,
        );

        let outcome = store.merge(&crawl);
        let merged = &outcome.files[Path::new("Banana.js")];

        // Touched but not edited: stat fields move, identity stays.
        assert_eq!(merged.mtime, 42);
        assert_eq!(merged.size, 201);
        assert_eq!(merged.module_id, "Banana");
        assert_eq!(merged.dependencies, vec!["Strawberry".to_string()]);
        assert!(merged.visited);
    }

    #[test]
    fn test_content_change_resets_record() {
        let record = visited_record("Banana", 30, &["Strawberry"], Some("abcd"));
        let store = store_with(vec![("Banana.js", record)]);
        let crawl = delta(
            vec![("Banana.js", stat(42, 201, Some("ffff")))],
            vec![],
            false,
        );

        let outcome = store.merge(&crawl);
        let merged = &outcome.files[Path::new("Banana.js")];

        assert!(!merged.visited);
        assert!(merged.module_id.is_empty());
        assert!(merged.dependencies.is_empty());
        assert_eq!(merged.hash.as_deref(), Some("ffff"));
    }

    #[test]
    fn test_merge_set_algebra() {
        let store = store_with(vec![
            ("Kept.js", visited_record("Kept", 1, &[], None)),
            ("Removed.js", visited_record("Removed", 1, &[], None)),
        ]);
        let crawl = delta(
            vec![("Added.js", stat(9, 1, None))],
            vec!["Removed.js"],
            false,
        );

        let outcome = store.merge(&crawl);

        // (prior − removed) ∪ changed
        let paths: Vec<_> = outcome.files.keys().cloned().collect();
        assert_eq!(
            paths,
            vec![PathBuf::from("Added.js"), PathBuf::from("Kept.js")]
        );
        assert_eq!(outcome.removed.len(), 1);
    }

    #[test]
    fn test_unvisited_invariant() {
        let record = FileRecord::unvisited(10, 20, None);
        assert!(!record.visited);
        assert!(record.module_id.is_empty());
        assert!(record.dependencies.is_empty());
    }

    #[test]
    fn test_lookups_accept_absolute_and_relative_paths() {
        let store = store_with(vec![(
            "sub/Banana.js",
            visited_record("Banana", 30, &["Kiwi"], Some("abcd")),
        )]);

        assert!(store.exists(Path::new("sub/Banana.js")));
        assert!(store.exists(Path::new("/project/sub/Banana.js")));
        assert_eq!(store.module_name(Path::new("sub/Banana.js")), Some("Banana"));
        assert_eq!(store.size(Path::new("sub/Banana.js")), Some(100));
        assert_eq!(store.hash(Path::new("sub/Banana.js")), Some("abcd"));
        assert_eq!(
            store.dependencies(Path::new("sub/Banana.js")),
            Some(&["Kiwi".to_string()][..])
        );
        assert!(!store.exists(Path::new("sub/Melon.js")));
        assert_eq!(store.dependencies(Path::new("sub/Melon.js")), None);
    }

    #[test]
    fn test_empty_module_id_is_not_a_module_name() {
        let store = store_with(vec![("raw.json", FileRecord::unvisited(1, 2, None))]);
        assert!(store.exists(Path::new("raw.json")));
        assert_eq!(store.module_name(Path::new("raw.json")), None);
    }

    #[test]
    fn test_match_files_regex() {
        let store = store_with(vec![
            ("src/Banana.js", visited_record("Banana", 1, &[], None)),
            ("src/Banana.test.js", visited_record("", 1, &[], None)),
        ]);

        let pattern = regex::Regex::new(r"\.test\.js$").unwrap();
        let matched = store.match_files(&pattern);
        assert_eq!(matched, vec![PathBuf::from("/project/src/Banana.test.js")]);
    }

    #[test]
    fn test_match_glob_relative_to_root() {
        let store = store_with(vec![
            ("src/Banana.js", visited_record("Banana", 1, &[], None)),
            ("lib/Melon.js", visited_record("Melon", 1, &[], None)),
        ]);

        let globs = vec![glob::Pattern::new("src/*.js").unwrap()];
        let matched = store.match_glob(&globs, Some(Path::new("/project")));
        assert_eq!(matched.len(), 1);
        assert!(matched.contains(&PathBuf::from("/project/src/Banana.js")));
    }

    #[test]
    fn test_observations() {
        let store = store_with(vec![("Banana.js", visited_record("Banana", 30, &[], None))]);
        let obs = store.observations();
        assert_eq!(obs[Path::new("Banana.js")], (30, 100));
    }
}
