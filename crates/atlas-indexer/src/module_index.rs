//! Logical module name index with platform variants and duplicate
//! tracking.
//!
//! Resolution walks the platform tiers requested platform → native →
//! generic. Before each tier the duplicates side-index is consulted; a
//! hit fails the lookup with every conflicting candidate enumerated
//! rather than silently picking one. A (name, platform) pair is live in
//! exactly one of the live map and the duplicates index at any time.

use crate::IndexerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Platform tier of a module variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Platform {
    /// No filename suffix; the final resolution fallback
    Generic,
    /// The `native` suffix, matched when the caller supports native variants
    Native,
    /// A declared platform tag such as `ios` or `android`
    Tag(String),
}

impl Platform {
    /// Stable string form used by the persistence layer.
    pub fn as_label(&self) -> &str {
        match self {
            Platform::Generic => "g",
            Platform::Native => "native",
            Platform::Tag(tag) => tag,
        }
    }

    /// Inverse of [`Platform::as_label`].
    pub fn from_label(label: &str) -> Self {
        match label {
            "g" => Platform::Generic,
            "native" => Platform::Native,
            tag => Platform::Tag(tag.to_string()),
        }
    }

    /// The tier a resolution request for `platform` starts at.
    pub fn from_request(platform: &str) -> Self {
        match platform {
            "native" => Platform::Native,
            tag => Platform::Tag(tag.to_string()),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Generic => write!(f, "generic (no suffix)"),
            other => write!(f, "{}", other.as_label()),
        }
    }
}

/// Whether a module entry points at a source file or a package manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModuleKind {
    Module,
    Package,
}

impl ModuleKind {
    pub fn as_u8(self) -> u8 {
        match self {
            ModuleKind::Module => 0,
            ModuleKind::Package => 1,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ModuleKind::Package,
            _ => ModuleKind::Module,
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Module => write!(f, "module"),
            ModuleKind::Package => write!(f, "package"),
        }
    }
}

/// Where one module variant lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleLocation {
    /// Root-relative path
    pub path: PathBuf,
    pub kind: ModuleKind,
}

/// Variants of one module name, by platform tier.
pub type PlatformMap = BTreeMap<Platform, ModuleLocation>;

/// Conflicting candidates for one (name, platform) pair.
pub type DuplicateSet = BTreeMap<PathBuf, ModuleKind>;

/// The serializable contents of a module index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub map: BTreeMap<String, PlatformMap>,
    pub duplicates: BTreeMap<String, BTreeMap<Platform, DuplicateSet>>,
    pub mocks: BTreeMap<String, PathBuf>,
}

/// Raised by resolution when a name has several candidates on the
/// queried tier. Candidate paths are absolute and sorted.
#[derive(Debug, Clone, thiserror::Error)]
pub struct DuplicateCandidatesError {
    pub name: String,
    pub platform: Platform,
    pub supports_native: bool,
    pub candidates: DuplicateSet,
}

impl fmt::Display for DuplicateCandidatesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "The name `{}` resolves to several different files for platform `{}`. \
             Delete or exclude files until only one of these remains:",
            self.name, self.platform
        )?;
        for (path, kind) in &self.candidates {
            writeln!(f, "  * `{}` ({})", path.display(), kind)?;
        }
        Ok(())
    }
}

/// Outcome of inserting a module candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The name collided on this platform; all candidates (old and new)
    /// now sit in the duplicates index
    Collision(DuplicateSet),
}

/// Resolution interface shared by the in-memory index and the
/// relational-store-backed one.
///
/// A duplicated name fails with [`IndexerError::ModuleCollision`]; an
/// unknown name is `Ok(None)`, not an error.
pub trait ModuleResolver {
    /// Resolve a module name to an absolute path, or `None` if unknown.
    fn resolve(
        &self,
        name: &str,
        platform: Option<&str>,
        supports_native: bool,
    ) -> Result<Option<PathBuf>, IndexerError>;

    /// Same resolution constrained to package entries.
    fn resolve_package(
        &self,
        name: &str,
        platform: Option<&str>,
    ) -> Result<Option<PathBuf>, IndexerError>;

    /// Look up a mock implementation, trying `name + "/index"` as an
    /// alias when the plain name is unknown.
    fn mock(&self, name: &str) -> Result<Option<PathBuf>, IndexerError>;
}

/// In-memory module index.
#[derive(Debug, Clone, Default)]
pub struct ModuleIndex {
    root: PathBuf,
    state: IndexState,
}

impl ModuleIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: IndexState::default(),
        }
    }

    pub fn from_state(root: impl Into<PathBuf>, state: IndexState) -> Self {
        Self {
            root: root.into(),
            state,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> &IndexState {
        &self.state
    }

    pub fn into_state(self) -> IndexState {
        self.state
    }

    /// Insert a candidate for (name, platform).
    ///
    /// A second candidate for an occupied slot moves both files into the
    /// duplicates index and clears the live entry; later candidates for
    /// a duplicated slot accumulate there.
    pub fn insert(
        &mut self,
        name: &str,
        platform: Platform,
        location: ModuleLocation,
    ) -> InsertOutcome {
        if let Some(set) = self
            .state
            .duplicates
            .get_mut(name)
            .and_then(|by_platform| by_platform.get_mut(&platform))
        {
            set.insert(location.path, location.kind);
            return InsertOutcome::Collision(set.clone());
        }

        let slot = self
            .state
            .map
            .entry(name.to_string())
            .or_default()
            .entry(platform.clone());

        match slot {
            std::collections::btree_map::Entry::Vacant(vacant) => {
                vacant.insert(location);
                InsertOutcome::Inserted
            }
            std::collections::btree_map::Entry::Occupied(occupied) => {
                if occupied.get().path == location.path {
                    // Same file seen again; keep the slot live.
                    occupied.into_mut().kind = location.kind;
                    return InsertOutcome::Inserted;
                }

                let existing = occupied.remove();
                let mut set = DuplicateSet::new();
                set.insert(existing.path, existing.kind);
                set.insert(location.path, location.kind);

                if self.state.map.get(name).is_some_and(BTreeMap::is_empty) {
                    self.state.map.remove(name);
                }

                self.state
                    .duplicates
                    .entry(name.to_string())
                    .or_default()
                    .insert(platform, set.clone());

                InsertOutcome::Collision(set)
            }
        }
    }

    /// Remove the candidate at `path` for (name, platform).
    ///
    /// When a removal leaves a duplicated slot with a single surviving
    /// candidate, that candidate is promoted back into the live map and
    /// the duplicates entry deleted. Candidate sets iterate in path
    /// order, so recovery is deterministic: the lexicographically
    /// smallest survivor wins.
    pub fn remove(&mut self, name: &str, platform: &Platform, path: &Path) {
        if let Some(by_platform) = self.state.duplicates.get_mut(name) {
            if let Some(set) = by_platform.get_mut(platform) {
                set.remove(path);
                if set.len() == 1 {
                    if let Some((survivor, kind)) =
                        set.iter().next().map(|(p, k)| (p.clone(), *k))
                    {
                        by_platform.remove(platform);
                        self.state.map.entry(name.to_string()).or_default().insert(
                            platform.clone(),
                            ModuleLocation {
                                path: survivor,
                                kind,
                            },
                        );
                    }
                } else if set.is_empty() {
                    by_platform.remove(platform);
                }
                if by_platform.is_empty() {
                    self.state.duplicates.remove(name);
                }
                return;
            }
        }

        if let Some(by_platform) = self.state.map.get_mut(name) {
            if by_platform
                .get(platform)
                .is_some_and(|loc| loc.path == path)
            {
                by_platform.remove(platform);
            }
            if by_platform.is_empty() {
                self.state.map.remove(name);
            }
        }
    }

    pub fn set_mock(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.state.mocks.insert(name.into(), path.into());
    }

    /// Remove a mock only if it still points at `path`.
    pub fn remove_mock(&mut self, name: &str, path: &Path) {
        if self.state.mocks.get(name).is_some_and(|p| p == path) {
            self.state.mocks.remove(name);
        }
    }

    fn lookup(
        &self,
        name: &str,
        platform: Option<&str>,
        supports_native: bool,
        kind: ModuleKind,
    ) -> Result<Option<PathBuf>, IndexerError> {
        let location = locate(
            self.state.map.get(name),
            self.state.duplicates.get(name),
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

impl ModuleResolver for ModuleIndex {
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
        let path = self
            .state
            .mocks
            .get(name)
            .or_else(|| self.state.mocks.get(&format!("{name}/index")));
        Ok(path.map(|p| self.root.join(p)))
    }
}

/// Walk the platform tiers for one name against arbitrary live and
/// duplicate views. Shared by both resolver implementations.
pub(crate) fn locate(
    entry: Option<&PlatformMap>,
    duplicates: Option<&BTreeMap<Platform, DuplicateSet>>,
    root: &Path,
    name: &str,
    platform: Option<&str>,
    supports_native: bool,
) -> Result<Option<ModuleLocation>, DuplicateCandidatesError> {
    let mut tiers = Vec::with_capacity(3);
    if let Some(requested) = platform {
        tiers.push(Platform::from_request(requested));
    }
    if supports_native && !tiers.contains(&Platform::Native) {
        tiers.push(Platform::Native);
    }
    tiers.push(Platform::Generic);

    for tier in tiers {
        if let Some(set) = duplicates.and_then(|d| d.get(&tier)) {
            // Metadata existing in both the live map and the duplicates
            // index would be a bug; check the duplicates first to be sure.
            let candidates = set
                .iter()
                .map(|(path, kind)| (root.join(path), *kind))
                .collect();
            return Err(DuplicateCandidatesError {
                name: name.to_string(),
                platform: tier,
                supports_native,
                candidates,
            });
        }
        if let Some(location) = entry.and_then(|e| e.get(&tier)) {
            return Ok(Some(location.clone()));
        }
    }

    Ok(None)
}

/// Platform tier a file contributes to, from its filename suffix.
///
/// `Banana.ios.js` carries the `ios` tag when "ios" is declared;
/// `Banana.native.js` is the native tier; everything else is generic.
pub fn platform_for_path(path: &Path, declared: &[String]) -> Platform {
    let stem = match path.file_stem().and_then(|s| s.to_str()) {
        Some(stem) => stem,
        None => return Platform::Generic,
    };
    let suffix = match stem.rsplit_once('.') {
        Some((_, suffix)) => suffix,
        None => return Platform::Generic,
    };
    if suffix == "native" {
        Platform::Native
    } else if declared.iter().any(|tag| tag == suffix) {
        Platform::Tag(suffix.to_string())
    } else {
        Platform::Generic
    }
}
