//! Atomic file writes and content hashing.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use amlflow_shared::{AmlFlowError, Result};

/// Suffix shared by every in-flight temp file, so scans can skip them.
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

/// Sibling temp path unique to this write.
pub(crate) fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.{}{TEMP_SUFFIX}", Uuid::now_v7().simple()))
}

/// Write bytes to a temp file, then rename over `target`.
///
/// Readers observe either the previous content or the new content, never a
/// partial file.
pub(crate) fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| AmlFlowError::io(parent, e))?;
    }
    let temp = temp_path_for(target);
    std::fs::write(&temp, bytes).map_err(|e| AmlFlowError::io(&temp, e))?;
    if let Err(e) = std::fs::rename(&temp, target) {
        let _ = std::fs::remove_file(&temp);
        return Err(AmlFlowError::io(target, e));
    }
    Ok(())
}

/// Pretty-print `data` and write it atomically.
pub(crate) fn write_json_atomic<T: serde::Serialize>(target: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| AmlFlowError::validation(format!("JSON serialization failed: {e}")))?;
    write_atomic(target, json.as_bytes())
}

pub(crate) fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| AmlFlowError::io(path, e))?;
    Ok(sha256_bytes(&bytes))
}

/// Hidden entries (metadata, temp files, locks) are never facts.
pub(crate) fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_paths_are_hidden_and_unique() {
        let target = Path::new("/tmp/ns/entities.json");
        let a = temp_path_for(target);
        let b = temp_path_for(target);
        assert_ne!(a, b);
        let name = a.file_name().expect("name").to_string_lossy().into_owned();
        assert!(is_hidden(&name));
        assert!(name.ends_with(TEMP_SUFFIX));
        assert_eq!(a.parent(), target.parent());
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
