//! Category skeleton of a versioned namespace.
//!
//! Every namespace gets the same directory tree, each directory carrying a
//! hidden `.metadata.json` with a display name. The namespace root carries
//! the namespace marker, which is written last: a namespace without it has
//! no complete skeleton yet.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use amlflow_shared::{AmlFlowError, CURRENT_LAYOUT_VERSION, Result, TransactionId};

use crate::io::write_json_atomic;

/// Hidden metadata file present in the namespace root and every category.
pub const METADATA_FILE: &str = ".metadata.json";

/// One directory in the skeleton.
#[derive(Debug, Clone, Copy)]
pub struct SkeletonDir {
    pub path: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
}

/// Parents precede children.
pub const SKELETON: &[SkeletonDir] = &[
    SkeletonDir {
        path: "entity_data",
        display_name: "Entity Information",
        description: "Detailed information about entities involved in the transaction",
    },
    SkeletonDir {
        path: "entity_data/organization_results",
        display_name: "Organizations",
        description: "Enrichment results for organizations",
    },
    SkeletonDir {
        path: "entity_data/organization_results/opencorporates",
        display_name: "Corporate Registry",
        description: "Company registry records",
    },
    SkeletonDir {
        path: "entity_data/organization_results/sanctions",
        display_name: "Sanctions Screening",
        description: "Sanctions screening results from global sanctions lists",
    },
    SkeletonDir {
        path: "entity_data/organization_results/wikidata",
        display_name: "Entity Network",
        description: "Knowledge-graph facts and associated people",
    },
    SkeletonDir {
        path: "entity_data/organization_results/news",
        display_name: "Adverse Media",
        description: "Negative news coverage",
    },
    SkeletonDir {
        path: "entity_data/people_results",
        display_name: "People",
        description: "Enrichment results for people",
    },
    SkeletonDir {
        path: "entity_data/people_results/pep",
        display_name: "Politically Exposed Persons",
        description: "Matches against the PEP list",
    },
    SkeletonDir {
        path: "entity_data/people_results/sanctions",
        display_name: "Sanctions Screening",
        description: "Sanctions screening results from global sanctions lists",
    },
    SkeletonDir {
        path: "entity_data/people_results/news",
        display_name: "Adverse Media",
        description: "Negative news coverage",
    },
    SkeletonDir {
        path: "analysis_reports",
        display_name: "Analysis Reports",
        description: "Audit documents, history lookups and run reports",
    },
    SkeletonDir {
        path: "risk_assessments",
        display_name: "Risk Assessments",
        description: "Final risk verdicts",
    },
];

/// Top-level directories whose presence marks a versioned namespace.
pub const VERSIONED_MARKERS: &[&str] = &["entity_data", "risk_assessments"];

/// Directory names the legacy layout used for per-entity results.
pub const LEGACY_MARKERS: &[&str] = &["organization_results", "people_results"];

/// Contents of a category directory's `.metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirMetadata {
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_at: String,
}

/// Contents of the namespace root `.metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceMarker {
    pub transaction_id: String,
    pub display_name: String,
    pub description: String,
    pub created_at: String,
    #[serde(default)]
    pub layout_version: u32,
    #[serde(default)]
    pub folder_structure: serde_json::Map<String, serde_json::Value>,
}

impl NamespaceMarker {
    pub fn new(txn: &TransactionId) -> Self {
        let folder_structure = SKELETON
            .iter()
            .filter(|d| !d.path.contains('/'))
            .map(|d| {
                (
                    d.path.to_string(),
                    serde_json::json!({
                        "display_name": d.display_name,
                        "description": d.description,
                    }),
                )
            })
            .collect();
        Self {
            transaction_id: txn.to_string(),
            display_name: format!("Transaction {txn}"),
            description: "AML Risk Assessment results and supporting data".into(),
            created_at: Utc::now().to_rfc3339(),
            layout_version: CURRENT_LAYOUT_VERSION,
            folder_structure,
        }
    }
}

/// Static display label for a directory name, if it is part of the skeleton.
pub fn label_for_dir(relative: &str) -> Option<&'static str> {
    SKELETON
        .iter()
        .find(|d| d.path == relative)
        .map(|d| d.display_name)
}

/// Create every skeleton directory (and its metadata) under `base`.
///
/// Existing directories and metadata files are left untouched.
pub(crate) fn create_categories(base: &Path) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    for dir in SKELETON {
        let path = base.join(dir.path);
        std::fs::create_dir_all(&path).map_err(|e| AmlFlowError::io(&path, e))?;
        let meta_path = path.join(METADATA_FILE);
        if !meta_path.exists() {
            let meta = DirMetadata {
                display_name: dir.display_name.into(),
                description: dir.description.into(),
                created_at: now.clone(),
            };
            write_json_atomic(&meta_path, &meta)?;
        }
    }
    debug!(base = %base.display(), dirs = SKELETON.len(), "category skeleton created");
    Ok(())
}

/// Write the namespace marker. Must be the last step of skeleton creation.
pub(crate) fn write_marker(base: &Path, txn: &TransactionId) -> Result<()> {
    write_json_atomic(&base.join(METADATA_FILE), &NamespaceMarker::new(txn))
}

/// Whether every skeleton directory exists under `base`.
pub(crate) fn is_complete(base: &Path) -> bool {
    base.join(METADATA_FILE).is_file() && SKELETON.iter().all(|d| base.join(d.path).is_dir())
}
