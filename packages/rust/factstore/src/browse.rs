//! Read-only browsing of a namespace for audit inspection.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use amlflow_shared::{AmlFlowError, EntityKey, Result, TransactionId};

use crate::io::is_hidden;
use crate::skeleton::{DirMetadata, METADATA_FILE, label_for_dir};
use crate::store::FactStore;

/// Files above this size are offered for download only.
pub const MAX_INLINE_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Directory,
    File,
}

/// One node of a namespace tree.
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub name: String,
    /// `/`-separated path relative to the namespace root (empty for the root).
    pub path: String,
    pub label: String,
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

/// Inline rendering of a file, when it can be inlined at all.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum FileContent {
    Json(serde_json::Value),
    Text(String),
    /// Not UTF-8; download only.
    Binary,
    /// Larger than [`MAX_INLINE_BYTES`]; download only.
    TooLarge,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileView {
    pub path: String,
    pub name: String,
    pub size: u64,
    #[serde(flatten)]
    pub content: FileContent,
}

impl FactStore {
    /// Navigable tree of `txn`'s namespace with human-readable labels.
    pub fn tree(&self, txn: &TransactionId) -> Result<TreeNode> {
        let ns = self.namespace_dir(txn);
        if !ns.is_dir() {
            return Err(AmlFlowError::NotFound(format!("namespace {txn}")));
        }
        let label = read_dir_label(&ns).unwrap_or_else(|| format!("Transaction {txn}"));
        Ok(TreeNode {
            name: txn.to_string(),
            path: String::new(),
            label,
            kind: NodeKind::Directory,
            size: None,
            children: children_of(&ns, ""),
        })
    }

    /// Absolute path of a file inside `txn`'s namespace, for download.
    ///
    /// Rejects absolute paths, `..` components and hidden entries.
    pub fn file_path(&self, txn: &TransactionId, relative: &str) -> Result<PathBuf> {
        let ns = self.namespace_dir(txn);
        let rel = Path::new(relative);
        for component in rel.components() {
            match component {
                Component::Normal(part) if !is_hidden(&part.to_string_lossy()) => {}
                _ => {
                    return Err(AmlFlowError::validation(format!(
                        "invalid file path: {relative:?}"
                    )));
                }
            }
        }
        let path = ns.join(rel);
        if !path.is_file() {
            return Err(AmlFlowError::NotFound(format!("{txn}/{relative}")));
        }
        Ok(path)
    }

    /// Inline view of a file; binary or oversized content is not inlined.
    pub fn read_file(&self, txn: &TransactionId, relative: &str) -> Result<FileView> {
        let path = self.file_path(txn, relative)?;
        let size = std::fs::metadata(&path)
            .map_err(|e| AmlFlowError::io(&path, e))?
            .len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let content = if size > MAX_INLINE_BYTES {
            FileContent::TooLarge
        } else {
            let bytes = std::fs::read(&path).map_err(|e| AmlFlowError::io(&path, e))?;
            match String::from_utf8(bytes) {
                Err(_) => FileContent::Binary,
                Ok(text) if name.ends_with(".json") => serde_json::from_str(&text)
                    .map(FileContent::Json)
                    .unwrap_or(FileContent::Text(text)),
                Ok(text) => FileContent::Text(text),
            }
        };

        Ok(FileView {
            path: relative.to_string(),
            name,
            size,
            content,
        })
    }
}

fn children_of(dir: &Path, prefix: &str) -> Vec<TreeNode> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut nodes: Vec<TreeNode> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_hidden(&name) {
                return None;
            }
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            let fs_path = entry.path();
            if fs_path.is_dir() {
                let label = read_dir_label(&fs_path)
                    .or_else(|| label_for_dir(&path).map(String::from))
                    .unwrap_or_else(|| title_case(&name));
                Some(TreeNode {
                    children: children_of(&fs_path, &path),
                    name,
                    path,
                    label,
                    kind: NodeKind::Directory,
                    size: None,
                })
            } else {
                let stem = Path::new(&name)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| name.clone());
                Some(TreeNode {
                    label: title_case(EntityKey::from_file_stem(&stem).as_str()),
                    size: entry.metadata().ok().map(|m| m.len()),
                    name,
                    path,
                    kind: NodeKind::File,
                    children: Vec::new(),
                })
            }
        })
        .collect();

    nodes.sort_by(|a, b| {
        let a_file = a.kind == NodeKind::File;
        let b_file = b.kind == NodeKind::File;
        a_file.cmp(&b_file).then_with(|| a.name.cmp(&b.name))
    });
    nodes
}

fn read_dir_label(dir: &Path) -> Option<String> {
    let content = std::fs::read_to_string(dir.join(METADATA_FILE)).ok()?;
    let meta: DirMetadata = serde_json::from_str(&content).ok()?;
    (!meta.display_name.is_empty()).then_some(meta.display_name)
}

/// `risk_assessment` → `Risk Assessment`.
fn title_case(s: &str) -> String {
    s.split(['_', '-', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{LogicalPath, RootFact};
    use crate::store::tests::{temp_store, txn};
    use serde_json::json;

    fn find<'a>(node: &'a TreeNode, path: &str) -> Option<&'a TreeNode> {
        if node.path == path {
            return Some(node);
        }
        node.children.iter().find_map(|c| find(c, path))
    }

    #[test]
    fn tree_uses_human_readable_labels() {
        let (store, dir) = temp_store();
        let t = txn("txn_tree");
        store
            .put(&t, &LogicalPath::Root(RootFact::RiskAssessment), &json!({"risk_score": 0.2}))
            .expect("put");

        let tree = store.tree(&t).expect("tree");
        assert_eq!(tree.label, "Transaction txn_tree");
        assert_eq!(
            find(&tree, "entity_data/organization_results/wikidata").expect("node").label,
            "Entity Network"
        );
        assert_eq!(
            find(&tree, "entity_data/people_results/pep").expect("node").label,
            "Politically Exposed Persons"
        );
        let file = find(&tree, "risk_assessments/risk_assessment.json").expect("file");
        assert_eq!(file.kind, NodeKind::File);
        assert_eq!(file.label, "Risk Assessment");
        assert!(find(&tree, ".metadata.json").is_none());

        // Directories sort before files at every level.
        let first_file = tree.children.iter().position(|c| c.kind == NodeKind::File);
        let last_dir = tree.children.iter().rposition(|c| c.kind == NodeKind::Directory);
        if let (Some(f), Some(d)) = (first_file, last_dir) {
            assert!(d < f);
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn read_file_inlines_json_and_text() {
        let (store, dir) = temp_store();
        let t = txn("txn_view");
        store.put(&t, &LogicalPath::Root(RootFact::Entities), &json!({"people": []})).expect("put");
        store.put_text(&t, RootFact::Transaction, "plain text").expect("put");

        let view = store.read_file(&t, "entity_data/entities.json").expect("view");
        assert!(matches!(view.content, FileContent::Json(ref v) if v["people"].is_array()));

        let view = store.read_file(&t, "entity_data/transaction.txt").expect("view");
        assert!(matches!(view.content, FileContent::Text(ref s) if s == "plain text"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn read_file_does_not_inline_binary_or_large_content() {
        let (store, dir) = temp_store();
        let t = txn("txn_blob");
        let ns = store.ensure_namespace(&t).expect("ensure").path;
        std::fs::write(ns.join("analysis_reports/blob.bin"), [0xff, 0xfe, 0x00, 0x80]).expect("write");
        let big = vec![b'a'; (MAX_INLINE_BYTES + 1) as usize];
        std::fs::write(ns.join("analysis_reports/big.txt"), big).expect("write");

        let view = store.read_file(&t, "analysis_reports/blob.bin").expect("view");
        assert!(matches!(view.content, FileContent::Binary));

        let view = store.read_file(&t, "analysis_reports/big.txt").expect("view");
        assert!(matches!(view.content, FileContent::TooLarge));
        assert_eq!(view.size, MAX_INLINE_BYTES + 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_paths_cannot_escape_namespace() {
        let (store, dir) = temp_store();
        let t = txn("txn_escape");
        store.ensure_namespace(&t).expect("ensure");

        for bad in ["../other/secret.json", "/etc/passwd", ".metadata.json", "entity_data/../../x"] {
            let err = store.read_file(&t, bad).unwrap_err();
            assert!(err.is_client_error(), "{bad} accepted");
        }
        assert!(matches!(
            store.read_file(&t, "entity_data/missing.json").unwrap_err(),
            AmlFlowError::NotFound(_)
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn title_case_splits_separators() {
        assert_eq!(title_case("raw_assessment_data"), "Raw Assessment Data");
        assert_eq!(title_case("Acme_Shell_Ltd"), "Acme Shell Ltd");
    }
}
