//! Legacy → versioned layout migration.
//!
//! Each legacy document is copied to its versioned location through a temp
//! file, verified by hash, renamed into place, and only then deleted from its
//! legacy location. At every instant a document exists in at least one
//! layout, so re-running after any failure completes the job without loss.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use amlflow_shared::{AmlFlowError, Result, TransactionId};

use crate::io::{is_hidden, sha256_file, temp_path_for};
use crate::layout::{CATEGORY_TABLE, FACT_TABLE, legacy_to_versioned};
use crate::store::{FactStore, find_by_key, key_from_file};

/// Outcome of one migration pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    /// Documents copied to the versioned layout and removed from legacy.
    pub moved: Vec<String>,
    /// Legacy documents dropped because the versioned copy already existed.
    pub superseded: Vec<String>,
    /// Legacy documents left in place, with the reason.
    pub failed: Vec<(String, String)>,
}

impl MigrationReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Nothing was left to migrate.
    pub fn is_noop(&self) -> bool {
        self.moved.is_empty() && self.superseded.is_empty() && self.failed.is_empty()
    }
}

impl FactStore {
    /// Migrate `txn` to the versioned layout. Returns `false` if the
    /// namespace does not exist or any document could not be moved.
    pub fn migrate(&self, txn: &TransactionId) -> bool {
        match self.try_migrate(txn) {
            Ok(report) => report.is_success(),
            Err(e) => {
                warn!(transaction_id = %txn, error = %e, "migration failed");
                false
            }
        }
    }

    /// Migrate `txn` and report what happened to each legacy document.
    #[instrument(skip_all, fields(transaction_id = %txn))]
    pub fn try_migrate(&self, txn: &TransactionId) -> Result<MigrationReport> {
        let ns = self.namespace_dir(txn);
        if !ns.is_dir() {
            return Err(AmlFlowError::NotFound(format!("namespace {txn}")));
        }

        self.ensure_namespace(txn)?;

        let mut report = MigrationReport::default();
        for relative in legacy_documents(&ns) {
            let Some(target_rel) = legacy_to_versioned(&relative) else {
                continue;
            };
            let source = ns.join(&relative);
            let target = ns.join(&target_rel);
            let existing = versioned_copy(&relative, &target);
            match move_document(&source, &target, existing.as_deref()) {
                Ok(Moved::Copied) => report.moved.push(relative),
                Ok(Moved::Superseded) => report.superseded.push(relative),
                Err(e) => {
                    warn!(file = %relative, error = %e, "document not migrated");
                    report.failed.push((relative, e.to_string()));
                }
            }
        }

        for entry in CATEGORY_TABLE {
            remove_empty_dirs(&ns.join(entry.legacy));
        }

        info!(
            moved = report.moved.len(),
            superseded = report.superseded.len(),
            failed = report.failed.len(),
            "migration pass complete"
        );
        Ok(report)
    }
}

enum Moved {
    Copied,
    Superseded,
}

/// Legacy-layout documents present in `ns`, as `/`-separated relative paths.
fn legacy_documents(ns: &Path) -> Vec<String> {
    let mut docs: Vec<String> = FACT_TABLE
        .iter()
        .filter(|e| e.legacy != e.versioned && ns.join(e.legacy).is_file())
        .map(|e| e.legacy.to_string())
        .collect();

    for entry in CATEGORY_TABLE {
        let mut files = Vec::new();
        collect_files(&ns.join(entry.legacy), &mut files);
        docs.extend(files.into_iter().filter_map(|f| {
            f.strip_prefix(ns)
                .ok()
                .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        }));
    }
    docs
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| !is_hidden(&e.file_name().to_string_lossy()))
        .map(|e| e.path())
        .collect();
    paths.sort();
    for path in paths {
        if path.is_dir() {
            collect_files(&path, out);
        } else if path.is_file() {
            out.push(path);
        }
    }
}

/// The versioned document that already stands for `relative`, if any.
///
/// An enrichment result is matched by entity key, so a copy written under
/// any spelling of the entity's name counts.
fn versioned_copy(relative: &str, target: &Path) -> Option<PathBuf> {
    let is_result = CATEGORY_TABLE.iter().any(|entry| {
        relative
            .strip_prefix(entry.legacy)
            .is_some_and(|rest| rest.starts_with('/'))
    });
    if is_result && target.extension().is_some_and(|ext| ext == "json") {
        let key = key_from_file(target)?;
        return find_by_key(target.parent()?, &key);
    }
    target.is_file().then(|| target.to_path_buf())
}

fn move_document(source: &Path, target: &Path, existing: Option<&Path>) -> Result<Moved> {
    if let Some(existing) = existing {
        // A versioned copy is always at least as new as the legacy one.
        std::fs::remove_file(source).map_err(|e| AmlFlowError::io(source, e))?;
        debug!(source = %source.display(), superseded_by = %existing.display(), "legacy copy superseded");
        return Ok(Moved::Superseded);
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| AmlFlowError::io(parent, e))?;
    }

    let temp = temp_path_for(target);
    let copied = copy_verified(source, &temp).and_then(|_| {
        std::fs::rename(&temp, target).map_err(|e| AmlFlowError::io(target, e))
    });
    if let Err(e) = copied {
        let _ = std::fs::remove_file(&temp);
        return Err(e);
    }

    std::fs::remove_file(source).map_err(|e| AmlFlowError::io(source, e))?;
    debug!(source = %source.display(), target = %target.display(), "document migrated");
    Ok(Moved::Copied)
}

fn copy_verified(source: &Path, temp: &Path) -> Result<()> {
    std::fs::copy(source, temp).map_err(|e| AmlFlowError::io(temp, e))?;
    let expected = sha256_file(source)?;
    let actual = sha256_file(temp)?;
    if expected != actual {
        return Err(AmlFlowError::Storage(format!(
            "checksum mismatch copying {}",
            source.display()
        )));
    }
    Ok(())
}

/// Remove `dir` and any subdirectories left empty after migration.
fn remove_empty_dirs(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.path().is_dir() {
            remove_empty_dirs(&entry.path());
        }
    }
    // Fails harmlessly while anything is left inside.
    let _ = std::fs::remove_dir(dir);
}
