//! Path-addressable fact persistence over the filesystem.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use amlflow_shared::{AmlFlowError, EnrichmentResult, EntityKey, Person, Result, TransactionId};

use crate::io::{is_hidden, write_atomic, write_json_atomic};
use crate::layout::{Category, LogicalPath, PhysicalLayout, RootFact, resolve};
use crate::skeleton::{self, LEGACY_MARKERS, METADATA_FILE, VERSIONED_MARKERS};

/// Directory under the store root where new namespaces are assembled.
const STAGING_DIR: &str = ".staging";

/// Lock file guarding in-place skeleton completion of an existing namespace.
const SKELETON_LOCK: &str = ".skeleton.lock";

/// A lock older than this is assumed abandoned by a crashed writer.
const STALE_LOCK_AFTER: Duration = Duration::from_secs(30);

/// How long a concurrent caller waits for another writer's skeleton.
const SKELETON_WAIT: Duration = Duration::from_secs(5);
const SKELETON_POLL: Duration = Duration::from_millis(10);

/// Handle to a namespace whose skeleton is known to be complete.
#[derive(Debug, Clone)]
pub struct NamespaceHandle {
    pub transaction_id: TransactionId,
    pub path: PathBuf,
    /// True only for the caller that created the skeleton.
    pub created: bool,
}

/// One enrichment result found by [`FactStore::scan_category`].
#[derive(Debug, Clone)]
pub struct ScannedResult {
    pub provider: String,
    pub entity_key: EntityKey,
    pub layout: PhysicalLayout,
    pub result: EnrichmentResult,
}

/// Transaction fact store rooted at a results directory.
///
/// Each transaction owns one namespace directory. Writes always target the
/// versioned layout; reads fall back to the legacy layout.
#[derive(Debug, Clone)]
pub struct FactStore {
    pub(crate) root: PathBuf,
}

impl FactStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| AmlFlowError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn namespace_dir(&self, txn: &TransactionId) -> PathBuf {
        self.root.join(txn.as_str())
    }

    /// Whether any namespace directory exists for `txn`.
    pub fn exists(&self, txn: &TransactionId) -> bool {
        self.namespace_dir(txn).is_dir()
    }

    // -----------------------------------------------------------------------
    // Skeleton
    // -----------------------------------------------------------------------

    /// Idempotently create the category skeleton for `txn`.
    ///
    /// New namespaces are assembled in a staging directory and renamed into
    /// place, so no partial skeleton is ever visible. A pre-existing namespace
    /// without a marker (legacy layout) is completed in place under a lock
    /// file; the marker is written last.
    #[instrument(skip_all, fields(transaction_id = %txn))]
    pub fn ensure_namespace(&self, txn: &TransactionId) -> Result<NamespaceHandle> {
        let ns = self.namespace_dir(txn);
        let handle = |created| NamespaceHandle {
            transaction_id: txn.clone(),
            path: ns.clone(),
            created,
        };

        if ns.join(METADATA_FILE).is_file() {
            return Ok(handle(false));
        }

        if !ns.exists() && self.create_staged(txn, &ns)? {
            info!(path = %ns.display(), "namespace created");
            return Ok(handle(true));
        }

        let created = self.complete_in_place(txn, &ns)?;
        Ok(handle(created))
    }

    /// Returns `Ok(false)` when another writer claimed the namespace first.
    fn create_staged(&self, txn: &TransactionId, ns: &Path) -> Result<bool> {
        let staging = self
            .root
            .join(STAGING_DIR)
            .join(format!("{txn}-{}", Uuid::now_v7().simple()));
        std::fs::create_dir_all(&staging).map_err(|e| AmlFlowError::io(&staging, e))?;

        let built = skeleton::create_categories(&staging).and_then(|_| skeleton::write_marker(&staging, txn));
        if let Err(e) = built {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        match std::fs::rename(&staging, ns) {
            Ok(()) => Ok(true),
            Err(e) => {
                let _ = std::fs::remove_dir_all(&staging);
                if ns.exists() {
                    debug!(error = %e, "lost namespace creation race");
                    Ok(false)
                } else {
                    Err(AmlFlowError::io(ns, e))
                }
            }
        }
    }

    /// Returns `Ok(true)` if this caller wrote the marker.
    fn complete_in_place(&self, txn: &TransactionId, ns: &Path) -> Result<bool> {
        let lock_path = ns.join(SKELETON_LOCK);
        let deadline = SystemTime::now() + SKELETON_WAIT;

        loop {
            if ns.join(METADATA_FILE).is_file() {
                return Ok(false);
            }

            match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(_) => {
                    let _guard = LockGuard(&lock_path);
                    if ns.join(METADATA_FILE).is_file() {
                        return Ok(false);
                    }
                    skeleton::create_categories(ns)?;
                    skeleton::write_marker(ns, txn)?;
                    info!(path = %ns.display(), "skeleton completed for existing namespace");
                    return Ok(true);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&lock_path) {
                        warn!(path = %lock_path.display(), "removing stale skeleton lock");
                        let _ = std::fs::remove_file(&lock_path);
                        continue;
                    }
                    if SystemTime::now() >= deadline {
                        return Err(AmlFlowError::Storage(format!(
                            "timed out waiting for namespace skeleton of {txn}"
                        )));
                    }
                    std::thread::sleep(SKELETON_POLL);
                }
                Err(e) => return Err(AmlFlowError::io(&lock_path, e)),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Put / get
    // -----------------------------------------------------------------------

    /// Write `document` at the versioned location of `path`.
    ///
    /// Text facts (the raw transaction) must be given as a JSON string.
    /// Overwrites are allowed; the last writer wins.
    pub fn put(&self, txn: &TransactionId, path: &LogicalPath, document: &serde_json::Value) -> Result<PathBuf> {
        let ns = self.ensure_namespace(txn)?.path;
        let target = ns.join(resolve(path, PhysicalLayout::Versioned));

        if path.is_text() {
            let text = document.as_str().ok_or_else(|| {
                AmlFlowError::validation(format!("fact {path} must be a string"))
            })?;
            write_atomic(&target, text.as_bytes())?;
        } else {
            write_json_atomic(&target, document)?;
        }

        debug!(transaction_id = %txn, logical = %path, file = %target.display(), "fact written");
        Ok(target)
    }

    /// Serialize `document` and [`put`](Self::put) it.
    pub fn put_json<T: Serialize>(&self, txn: &TransactionId, path: &LogicalPath, document: &T) -> Result<PathBuf> {
        let value = serde_json::to_value(document)
            .map_err(|e| AmlFlowError::validation(format!("JSON serialization failed: {e}")))?;
        self.put(txn, path, &value)
    }

    pub fn put_text(&self, txn: &TransactionId, fact: RootFact, text: &str) -> Result<PathBuf> {
        self.put(txn, &LogicalPath::Root(fact), &serde_json::Value::String(text.to_string()))
    }

    /// Read the fact at `path`, trying the versioned layout, then legacy.
    ///
    /// A missing fact is `Ok(None)`. A file that exists but cannot be parsed
    /// is an error.
    pub fn get(&self, txn: &TransactionId, path: &LogicalPath) -> Result<Option<serde_json::Value>> {
        let ns = self.namespace_dir(txn);
        if !ns.is_dir() {
            return Ok(None);
        }
        for layout in PhysicalLayout::READ_ORDER {
            if let Some(file) = locate(&ns, path, layout) {
                return read_fact(&file, path.is_text()).map(Some);
            }
        }
        Ok(None)
    }

    pub fn get_json<T: DeserializeOwned>(&self, txn: &TransactionId, path: &LogicalPath) -> Result<Option<T>> {
        match self.get(txn, path)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| AmlFlowError::parse(format!("fact {path} of {txn}: {e}"))),
            None => Ok(None),
        }
    }

    pub fn get_text(&self, txn: &TransactionId, fact: RootFact) -> Result<Option<String>> {
        Ok(self
            .get(txn, &LogicalPath::Root(fact))?
            .and_then(|v| v.as_str().map(String::from)))
    }

    /// Which layout currently holds `path`, if any.
    pub fn layout_of(&self, txn: &TransactionId, path: &LogicalPath) -> Option<PhysicalLayout> {
        let ns = self.namespace_dir(txn);
        PhysicalLayout::READ_ORDER
            .into_iter()
            .find(|layout| locate(&ns, path, *layout).is_some())
    }

    // -----------------------------------------------------------------------
    // Enumeration
    // -----------------------------------------------------------------------

    /// Every namespace under the root that holds facts in either layout.
    ///
    /// A directory qualifies if it has versioned category markers, legacy
    /// result directories, or at least one JSON document at its root.
    pub fn list(&self) -> Result<Vec<TransactionId>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AmlFlowError::io(&self.root, e)),
        };

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if is_hidden(&name) || !path.is_dir() {
                continue;
            }
            let Ok(txn) = name.parse::<TransactionId>() else {
                continue;
            };
            if is_namespace(&path) {
                ids.push(txn);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Every enrichment result stored under `category`, from both layouts.
    ///
    /// Where both layouts hold a result for the same provider and entity, the
    /// versioned copy wins. Legacy files that hold bare provider payloads are
    /// wrapped as successful results.
    pub fn scan_category(&self, txn: &TransactionId, category: Category) -> Result<Vec<ScannedResult>> {
        let ns = self.namespace_dir(txn);
        let mut seen: HashSet<(String, EntityKey)> = HashSet::new();
        let mut results = Vec::new();

        for layout in PhysicalLayout::READ_ORDER {
            let dir = ns.join(category.dir(layout));
            for (provider, provider_dir) in visible_dirs(&dir) {
                let mut files: Vec<(PathBuf, EntityKey)> = json_files(&provider_dir)
                    .into_iter()
                    .filter_map(|file| key_from_file(&file).map(|key| (file, key)))
                    .collect();
                // The canonical file name wins over older spellings of the same key.
                files.sort_by_key(|(file, key)| !is_canonical(file, key));
                for (file, key) in files {
                    if !seen.insert((provider.clone(), key.clone())) {
                        continue;
                    }
                    match read_fact(&file, false) {
                        Ok(value) => results.push(ScannedResult {
                            provider: provider.clone(),
                            entity_key: key,
                            layout,
                            result: as_enrichment_result(value),
                        }),
                        Err(e) => warn!(file = %file.display(), error = %e, "skipping unreadable result"),
                    }
                }
            }
        }

        results.sort_by(|a, b| (&a.provider, &a.entity_key).cmp(&(&b.provider, &b.entity_key)));
        Ok(results)
    }
}

/// Removes the lock file when the holder finishes (or fails).
struct LockGuard<'a>(&'a Path);

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.0);
    }
}

fn lock_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .is_some_and(|age| age > STALE_LOCK_AFTER)
}

pub(crate) fn is_namespace(path: &Path) -> bool {
    if path.join(METADATA_FILE).is_file() {
        return true;
    }
    if VERSIONED_MARKERS
        .iter()
        .chain(LEGACY_MARKERS)
        .any(|m| path.join(m).is_dir())
    {
        return true;
    }
    !json_files(path).is_empty()
}

/// Physical file holding `path` under `layout`, if present.
fn locate(ns: &Path, path: &LogicalPath, layout: PhysicalLayout) -> Option<PathBuf> {
    let candidate = ns.join(resolve(path, layout));
    if candidate.is_file() {
        return Some(candidate);
    }
    let LogicalPath::Enrichment { entity, .. } = path else {
        return None;
    };
    find_by_key(candidate.parent()?, entity)
}

/// A result file in `dir` whose name encodes `key`, canonical name first.
pub(crate) fn find_by_key(dir: &Path, key: &EntityKey) -> Option<PathBuf> {
    let canonical = dir.join(format!("{}.json", key.file_stem()));
    if canonical.is_file() {
        return Some(canonical);
    }
    json_files(dir)
        .into_iter()
        .find(|file| key_from_file(file).as_ref() == Some(key))
}

fn is_canonical(file: &Path, key: &EntityKey) -> bool {
    file.file_stem()
        .is_some_and(|stem| stem.to_string_lossy() == key.file_stem())
}

fn read_fact(file: &Path, is_text: bool) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(file).map_err(|e| AmlFlowError::io(file, e))?;
    if is_text {
        return Ok(serde_json::Value::String(content));
    }
    serde_json::from_str(&content)
        .map_err(|e| AmlFlowError::parse(format!("{}: {e}", file.display())))
}

/// Entity key encoded in a result file name (`acme_shell_ltd.json`, or the
/// older `Acme_Shell_Ltd.json`).
pub(crate) fn key_from_file(file: &Path) -> Option<EntityKey> {
    let stem = file.file_stem()?.to_string_lossy();
    let key = EntityKey::from_file_stem(&stem);
    (!key.is_empty()).then_some(key)
}

pub(crate) fn as_enrichment_result(value: serde_json::Value) -> EnrichmentResult {
    if let Ok(result) = serde_json::from_value::<EnrichmentResult>(value.clone()) {
        return result;
    }
    let discovered: Vec<Person> = value
        .get("associated_people")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    EnrichmentResult::success(value).with_discovered(discovered)
}

/// Non-hidden subdirectories of `dir` as `(name, path)`, sorted by name.
pub(crate) fn visible_dirs(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<(String, PathBuf)> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| (e.file_name().to_string_lossy().into_owned(), e.path()))
        .filter(|(name, _)| !is_hidden(name))
        .collect();
    dirs.sort();
    dirs
}

/// Non-hidden `*.json` files directly inside `dir`, sorted by name.
pub(crate) fn json_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .map(|n| !is_hidden(&n.to_string_lossy()))
                .unwrap_or(false)
        })
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}
