//! Embedded relational persistence.
//!
//! Five tables hold the same state the snapshot backend serializes as
//! one blob: `files`, `module_index`, `mocks`, `duplicates` and
//! `clocks`. File writes are incremental (deletes plus upserts) inside
//! one transaction per build; index tables are rewritten from the
//! in-memory state inside the same transaction.
//!
//! Connections are cached in an explicit [`StoreRegistry`] owned by the
//! orchestrator, one serialized writer per store path. A write-through
//! cache fronts the point lookups so repeated resolution within one
//! process does not requery the store.

use super::{PersistedState, Persistence};
use crate::crawl::ClockMap;
use crate::module_index::{
    locate, DuplicateSet, IndexState, ModuleKind, ModuleLocation, ModuleResolver, Platform,
    PlatformMap,
};
use crate::store::{FileMap, FileRecord, MergeOutcome};
use crate::IndexerError;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Joins dependency lists into one column.
const DEPENDENCY_DELIM: char = '\0';

const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS files(
    path TEXT PRIMARY KEY,
    module_id TEXT NOT NULL,
    mtime INTEGER NOT NULL,
    size INTEGER NOT NULL,
    visited INTEGER NOT NULL,
    dependencies TEXT NOT NULL,
    hash TEXT
);
CREATE TABLE IF NOT EXISTS module_index(
    name TEXT NOT NULL,
    platform TEXT NOT NULL,
    path TEXT NOT NULL,
    kind INTEGER NOT NULL,
    PRIMARY KEY (name, platform)
);
CREATE TABLE IF NOT EXISTS mocks(
    name TEXT PRIMARY KEY,
    path TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS duplicates(
    name TEXT PRIMARY KEY,
    serialized BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS clocks(
    root TEXT PRIMARY KEY,
    token TEXT NOT NULL
);
";

type SharedConnection = Arc<Mutex<Connection>>;

/// Open store handles, keyed by path and owned by the orchestrator.
///
/// One mutex per store path serializes writers; handles are reused
/// across builds within the registry's lifetime.
#[derive(Default)]
pub struct StoreRegistry {
    conns: Mutex<HashMap<PathBuf, SharedConnection>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open or reuse the connection for a store path.
    pub fn open(&self, path: &Path) -> Result<SharedConnection, IndexerError> {
        let mut conns = self.conns.lock();
        if let Some(conn) = conns.get(path) {
            return Ok(conn.clone());
        }
        let conn = Arc::new(Mutex::new(open_store(path)?));
        conns.insert(path.to_path_buf(), conn.clone());
        Ok(conn)
    }

    /// Drop every cached handle, closing stores with no other users.
    pub fn close_all(&self) {
        self.conns.lock().clear();
    }
}

fn open_store(path: &Path) -> Result<Connection, IndexerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match Connection::open(path).and_then(|conn| init_schema(&conn).map(|_| conn)) {
        Ok(conn) => Ok(conn),
        Err(e) => {
            // A corrupt or incompatible store is discarded and rebuilt,
            // costing a fresh build instead of a crash.
            warn!(path = ?path, error = %e, "Discarding unusable store");
            let _ = std::fs::remove_file(path);
            let conn = Connection::open(path)?;
            init_schema(&conn)?;
            Ok(conn)
        }
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version != 0 && version != SCHEMA_VERSION {
        conn.execute_batch(
            "DROP TABLE IF EXISTS files;
             DROP TABLE IF EXISTS module_index;
             DROP TABLE IF EXISTS mocks;
             DROP TABLE IF EXISTS duplicates;
             DROP TABLE IF EXISTS clocks;",
        )?;
    }
    conn.execute_batch(SCHEMA)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// One transaction applying a whole build: incremental file writes,
/// index tables rewritten from the in-memory state.
///
/// Rewriting the (small) index tables wholesale keeps the
/// one-live-place invariant between `module_index` and `duplicates`
/// without diffing the two states.
fn write_all(
    conn: &mut Connection,
    outcome: &MergeOutcome,
    index: &IndexState,
    clocks: &ClockMap,
) -> Result<(), IndexerError> {
    let tx = conn.transaction()?;
    {
        if outcome.is_fresh {
            tx.execute("DELETE FROM files", [])?;
        } else {
            let mut delete = tx.prepare("DELETE FROM files WHERE path = ?1")?;
            for removed in &outcome.removed {
                delete.execute(params![path_text(removed)])?;
            }
        }

        let mut upsert = tx.prepare(
            "INSERT OR REPLACE INTO files \
             (path, module_id, mtime, size, visited, dependencies, hash) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for (path, record) in &outcome.changed {
            upsert.execute(params![
                path_text(path),
                record.module_id,
                record.mtime as i64,
                record.size as i64,
                record.visited as i64,
                join_dependencies(&record.dependencies),
                record.hash,
            ])?;
        }

        tx.execute("DELETE FROM module_index", [])?;
        let mut insert_entry = tx.prepare(
            "INSERT INTO module_index (name, platform, path, kind) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (name, by_platform) in &index.map {
            for (platform, location) in by_platform {
                insert_entry.execute(params![
                    name,
                    platform.as_label(),
                    path_text(&location.path),
                    location.kind.as_u8() as i64,
                ])?;
            }
        }

        tx.execute("DELETE FROM mocks", [])?;
        let mut insert_mock = tx.prepare("INSERT INTO mocks (name, path) VALUES (?1, ?2)")?;
        for (name, path) in &index.mocks {
            insert_mock.execute(params![name, path_text(path)])?;
        }

        tx.execute("DELETE FROM duplicates", [])?;
        let mut insert_duplicate =
            tx.prepare("INSERT INTO duplicates (name, serialized) VALUES (?1, ?2)")?;
        for (name, by_platform) in &index.duplicates {
            let serialized = rmp_serde::to_vec(by_platform)?;
            insert_duplicate.execute(params![name, serialized])?;
        }

        tx.execute("DELETE FROM clocks", [])?;
        let mut insert_clock = tx.prepare("INSERT INTO clocks (root, token) VALUES (?1, ?2)")?;
        for (root, token) in clocks {
            insert_clock.execute(params![path_text(root), token])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Cached point-lookup results, including negative ones.
#[derive(Default)]
struct PointCache {
    modules: HashMap<String, Option<PlatformMap>>,
    mocks: HashMap<String, Option<PathBuf>>,
    /// Set by `clear_index`/`clear_mocks`; suppresses point reads of
    /// entries removed but not recommitted yet.
    index_cleared: bool,
    mocks_cleared: bool,
}

/// Relational persistence backend.
pub struct SqlitePersistence {
    path: PathBuf,
    conn: SharedConnection,
    cache: Mutex<PointCache>,
}

impl SqlitePersistence {
    /// Open the store at `path`, creating or repairing it as needed.
    pub fn open(path: impl Into<PathBuf>, registry: &StoreRegistry) -> Result<Self, IndexerError> {
        let path = path.into();
        let conn = registry.open(&path)?;
        Ok(Self {
            path,
            conn,
            cache: Mutex::new(PointCache::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All duplicate entries, decoded.
    pub fn read_duplicates(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<Platform, DuplicateSet>>, IndexerError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name, serialized FROM duplicates")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut duplicates = BTreeMap::new();
        for row in rows {
            let (name, serialized) = row?;
            let by_platform: BTreeMap<Platform, DuplicateSet> =
                rmp_serde::from_slice(&serialized)?;
            duplicates.insert(name, by_platform);
        }
        Ok(duplicates)
    }

    fn query_module_entry(
        conn: &Connection,
        name: &str,
    ) -> Result<Option<PlatformMap>, IndexerError> {
        let mut stmt =
            conn.prepare("SELECT platform, path, kind FROM module_index WHERE name = ?1")?;
        let rows = stmt.query_map(params![name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut entry = PlatformMap::new();
        for row in rows {
            let (platform, path, kind) = row?;
            entry.insert(
                Platform::from_label(&platform),
                ModuleLocation {
                    path: PathBuf::from(path),
                    kind: ModuleKind::from_u8(kind as u8),
                },
            );
        }
        Ok(if entry.is_empty() { None } else { Some(entry) })
    }
}

impl Persistence for SqlitePersistence {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn read_state(&self) -> Result<PersistedState, IndexerError> {
        let files = self.read_files()?;
        let duplicates = self.read_duplicates()?;

        let conn = self.conn.lock();

        let mut map: BTreeMap<String, PlatformMap> = BTreeMap::new();
        let mut stmt = conn.prepare("SELECT name, platform, path, kind FROM module_index")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        for row in rows {
            let (name, platform, path, kind) = row?;
            map.entry(name).or_default().insert(
                Platform::from_label(&platform),
                ModuleLocation {
                    path: PathBuf::from(path),
                    kind: ModuleKind::from_u8(kind as u8),
                },
            );
        }

        let mut mocks = BTreeMap::new();
        let mut stmt = conn.prepare("SELECT name, path FROM mocks")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (name, path) = row?;
            mocks.insert(name, PathBuf::from(path));
        }

        let mut clocks = ClockMap::new();
        let mut stmt = conn.prepare("SELECT root, token FROM clocks")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (root, token) = row?;
            clocks.insert(PathBuf::from(root), token);
        }

        Ok(PersistedState {
            files,
            index: IndexState {
                map,
                duplicates,
                mocks,
            },
            clocks,
        })
    }

    fn read_files(&self) -> Result<FileMap, IndexerError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT path, module_id, mtime, size, visited, dependencies, hash FROM files",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                FileRecord {
                    module_id: row.get(1)?,
                    mtime: row.get::<_, i64>(2)? as u64,
                    size: row.get::<_, i64>(3)? as u64,
                    visited: row.get::<_, i64>(4)? != 0,
                    dependencies: split_dependencies(&row.get::<_, String>(5)?),
                    hash: row.get(6)?,
                },
            ))
        })?;

        let mut files = FileMap::new();
        for row in rows {
            let (path, record) = row?;
            files.insert(PathBuf::from(path), record);
        }
        Ok(files)
    }

    fn commit(
        &self,
        outcome: &MergeOutcome,
        index: &IndexState,
        clocks: &ClockMap,
    ) -> Result<(), IndexerError> {
        // Lock order: the connection lock is released before the cache
        // lock is taken; point reads hold cache, then connection.
        write_all(&mut self.conn.lock(), outcome, index, clocks)?;
        debug!(path = ?self.path, changed = outcome.changed.len(),
               removed = outcome.removed.len(), "Committed build");

        let mut cache = self.cache.lock();
        cache.modules.clear();
        cache.mocks.clear();
        cache.index_cleared = false;
        cache.mocks_cleared = false;

        Ok(())
    }

    fn module_entry(&self, name: &str) -> Result<Option<PlatformMap>, IndexerError> {
        let mut cache = self.cache.lock();
        if cache.index_cleared {
            return Ok(None);
        }
        if let Some(entry) = cache.modules.get(name) {
            return Ok(entry.clone());
        }

        let entry = Self::query_module_entry(&self.conn.lock(), name)?;
        cache.modules.insert(name.to_string(), entry.clone());
        Ok(entry)
    }

    fn mock_path(&self, name: &str) -> Result<Option<PathBuf>, IndexerError> {
        let mut cache = self.cache.lock();
        if cache.mocks_cleared {
            return Ok(None);
        }
        if let Some(path) = cache.mocks.get(name) {
            return Ok(path.clone());
        }

        let conn = self.conn.lock();
        let path: Option<String> = conn
            .query_row(
                "SELECT path FROM mocks WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        drop(conn);

        let path = path.map(PathBuf::from);
        cache.mocks.insert(name.to_string(), path.clone());
        Ok(path)
    }

    fn clear_index(&self) -> Result<(), IndexerError> {
        {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM module_index", [])?;
            conn.execute("DELETE FROM duplicates", [])?;
        }
        let mut cache = self.cache.lock();
        cache.modules.clear();
        cache.index_cleared = true;
        Ok(())
    }

    fn clear_mocks(&self) -> Result<(), IndexerError> {
        {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM mocks", [])?;
        }
        let mut cache = self.cache.lock();
        cache.mocks.clear();
        cache.mocks_cleared = true;
        Ok(())
    }
}

/// Module resolution straight off the relational store.
///
/// Point lookups go through the persistence cache instead of loading
/// the whole index; duplicates are loaded once up front because every
/// lookup consults them.
pub struct SqlModuleIndex {
    root: PathBuf,
    persistence: Arc<SqlitePersistence>,
    duplicates: BTreeMap<String, BTreeMap<Platform, DuplicateSet>>,
}

impl SqlModuleIndex {
    pub fn new(
        root: impl Into<PathBuf>,
        persistence: Arc<SqlitePersistence>,
    ) -> Result<Self, IndexerError> {
        let duplicates = persistence.read_duplicates()?;
        Ok(Self {
            root: root.into(),
            persistence,
            duplicates,
        })
    }

    fn lookup(
        &self,
        name: &str,
        platform: Option<&str>,
        supports_native: bool,
        kind: ModuleKind,
    ) -> Result<Option<PathBuf>, IndexerError> {
        let entry = self.persistence.module_entry(name)?;
        let location = locate(
            entry.as_ref(),
            self.duplicates.get(name),
            &self.root,
            name,
            platform,
            supports_native,
        )?;
        Ok(location
            .filter(|loc| loc.kind == kind)
            .map(|loc| self.root.join(&loc.path)))
    }
}

impl ModuleResolver for SqlModuleIndex {
    fn resolve(
        &self,
        name: &str,
        platform: Option<&str>,
        supports_native: bool,
    ) -> Result<Option<PathBuf>, IndexerError> {
        self.lookup(name, platform, supports_native, ModuleKind::Module)
    }

    fn resolve_package(
        &self,
        name: &str,
        platform: Option<&str>,
    ) -> Result<Option<PathBuf>, IndexerError> {
        self.lookup(name, platform, false, ModuleKind::Package)
    }

    fn mock(&self, name: &str) -> Result<Option<PathBuf>, IndexerError> {
        let path = match self.persistence.mock_path(name)? {
            Some(path) => Some(path),
            None => self.persistence.mock_path(&format!("{name}/index"))?,
        };
        Ok(path.map(|p| self.root.join(p)))
    }
}

fn join_dependencies(dependencies: &[String]) -> String {
    dependencies.join(&DEPENDENCY_DELIM.to_string())
}

fn split_dependencies(joined: &str) -> Vec<String> {
    if joined.is_empty() {
        Vec::new()
    } else {
        joined.split(DEPENDENCY_DELIM).map(str::to_string).collect()
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
