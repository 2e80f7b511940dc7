//! Logical paths and their physical realization under each layout.
//!
//! A fact is addressed by a [`LogicalPath`] that never changes. Where the
//! file actually lives depends on the [`PhysicalLayout`]: the flat legacy
//! convention or the categorized versioned convention. [`resolve`] is a pure
//! function over the static [`FACT_TABLE`] and [`CATEGORY_TABLE`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use amlflow_shared::{AmlFlowError, EntityKey, EntityKind, Result};

/// Physical path convention for realizing logical paths on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysicalLayout {
    /// Flat files at the namespace root, results under `organization_results/`.
    Legacy,
    /// Categorized knowledge-base layout (`entity_data/`, `analysis_reports/`, ...).
    Versioned,
}

impl PhysicalLayout {
    /// Read order: current layout first, then the fallback.
    pub const READ_ORDER: [PhysicalLayout; 2] = [PhysicalLayout::Versioned, PhysicalLayout::Legacy];
}

// ---------------------------------------------------------------------------
// Root facts
// ---------------------------------------------------------------------------

/// Facts stored once per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootFact {
    /// Raw submitted text (stored as plain text).
    Transaction,
    Entities,
    RiskAssessment,
    /// The assembled audit document passed to the reasoning service.
    AssessmentData,
    EntityHistory,
    DiscoveredPeople,
    /// Last known external run identifiers.
    Metadata,
    Error,
    /// Per-stage outcome of the most recent pipeline run.
    PipelineRun,
}

/// One row of the static logical-path table.
#[derive(Debug, Clone, Copy)]
pub struct FactEntry {
    pub fact: RootFact,
    pub logical: &'static str,
    pub legacy: &'static str,
    pub versioned: &'static str,
}

pub const FACT_TABLE: &[FactEntry] = &[
    FactEntry {
        fact: RootFact::Transaction,
        logical: "transaction",
        legacy: "transaction.txt",
        versioned: "entity_data/transaction.txt",
    },
    FactEntry {
        fact: RootFact::Entities,
        logical: "entities",
        legacy: "entities.json",
        versioned: "entity_data/entities.json",
    },
    FactEntry {
        fact: RootFact::RiskAssessment,
        logical: "risk_assessment",
        legacy: "risk_assessment.json",
        versioned: "risk_assessments/risk_assessment.json",
    },
    FactEntry {
        fact: RootFact::AssessmentData,
        logical: "assessment_data",
        legacy: "raw_assessment_data.json",
        versioned: "analysis_reports/raw_assessment_data.json",
    },
    FactEntry {
        fact: RootFact::EntityHistory,
        logical: "entity_history",
        legacy: "entity_history.json",
        versioned: "analysis_reports/entity_history.json",
    },
    FactEntry {
        fact: RootFact::DiscoveredPeople,
        logical: "discovered_people",
        legacy: "wikidata_discovered_people.json",
        versioned: "entity_data/wikidata_discovered_people.json",
    },
    FactEntry {
        fact: RootFact::Metadata,
        logical: "metadata",
        legacy: "metadata.json",
        versioned: "metadata.json",
    },
    FactEntry {
        fact: RootFact::Error,
        logical: "error",
        legacy: "error.json",
        versioned: "error.json",
    },
    FactEntry {
        fact: RootFact::PipelineRun,
        logical: "pipeline_run",
        legacy: "pipeline_run.json",
        versioned: "analysis_reports/pipeline_run.json",
    },
];

impl RootFact {
    pub fn entry(self) -> &'static FactEntry {
        // FACT_TABLE has exactly one row per variant, in declaration order.
        &FACT_TABLE[self as usize]
    }

    pub fn logical_name(self) -> &'static str {
        self.entry().logical
    }

    /// Stored verbatim as UTF-8 text rather than JSON.
    pub fn is_text(self) -> bool {
        matches!(self, Self::Transaction)
    }
}

// ---------------------------------------------------------------------------
// Result categories
// ---------------------------------------------------------------------------

/// Per-entity enrichment result families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    OrganizationResults,
    PeopleResults,
}

/// One row of the static category table.
#[derive(Debug, Clone, Copy)]
pub struct CategoryEntry {
    pub category: Category,
    pub logical: &'static str,
    pub legacy: &'static str,
    pub versioned: &'static str,
    /// Providers whose directories the skeleton pre-creates.
    pub providers: &'static [&'static str],
}

pub const CATEGORY_TABLE: &[CategoryEntry] = &[
    CategoryEntry {
        category: Category::OrganizationResults,
        logical: "organization_results",
        legacy: "organization_results",
        versioned: "entity_data/organization_results",
        providers: &["opencorporates", "sanctions", "wikidata", "news"],
    },
    CategoryEntry {
        category: Category::PeopleResults,
        logical: "people_results",
        legacy: "people_results",
        versioned: "entity_data/people_results",
        providers: &["pep", "sanctions", "news"],
    },
];

impl Category {
    pub const ALL: [Category; 2] = [Category::OrganizationResults, Category::PeopleResults];

    pub fn entry(self) -> &'static CategoryEntry {
        &CATEGORY_TABLE[self as usize]
    }

    /// Result category for lookups about an entity of `kind`.
    pub fn for_kind(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Organization => Category::OrganizationResults,
            EntityKind::Person => Category::PeopleResults,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.entry().logical
    }

    /// Category directory relative to the namespace root.
    pub fn dir(self, layout: PhysicalLayout) -> PathBuf {
        let entry = self.entry();
        match layout {
            PhysicalLayout::Legacy => PathBuf::from(entry.legacy),
            PhysicalLayout::Versioned => PathBuf::from(entry.versioned),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = AmlFlowError;

    fn from_str(s: &str) -> Result<Self> {
        CATEGORY_TABLE
            .iter()
            .find(|e| e.logical == s)
            .map(|e| e.category)
            .ok_or_else(|| AmlFlowError::parse(format!("unknown result category: {s}")))
    }
}

// ---------------------------------------------------------------------------
// LogicalPath
// ---------------------------------------------------------------------------

/// Stable, layout-independent address of a fact within a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogicalPath {
    Root(RootFact),
    /// `{category}/{provider}/{entityKey}`
    Enrichment {
        category: Category,
        provider: String,
        entity: EntityKey,
    },
}

impl LogicalPath {
    pub fn enrichment(category: Category, provider: &str, entity: &EntityKey) -> Self {
        Self::Enrichment {
            category,
            provider: provider.to_string(),
            entity: entity.clone(),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Root(f) if f.is_text())
    }
}

impl From<RootFact> for LogicalPath {
    fn from(fact: RootFact) -> Self {
        Self::Root(fact)
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root(fact) => f.write_str(fact.logical_name()),
            Self::Enrichment {
                category,
                provider,
                entity,
            } => write!(f, "{category}/{provider}/{entity}"),
        }
    }
}

impl FromStr for LogicalPath {
    type Err = AmlFlowError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(entry) = FACT_TABLE.iter().find(|e| e.logical == s) {
            return Ok(Self::Root(entry.fact));
        }

        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(category), Some(provider), Some(entity)) => {
                let category: Category = category.parse()?;
                if !is_safe_segment(provider) {
                    return Err(AmlFlowError::parse(format!("invalid provider name: {provider:?}")));
                }
                let entity = EntityKey::from_name(entity);
                if entity.is_empty() {
                    return Err(AmlFlowError::parse(format!("empty entity key in {s:?}")));
                }
                Ok(Self::Enrichment {
                    category,
                    provider: provider.to_string(),
                    entity,
                })
            }
            _ => Err(AmlFlowError::parse(format!("unknown logical path: {s}"))),
        }
    }
}

/// Provider names become directory names.
pub(crate) fn is_safe_segment(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('.')
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Physical location of `path` under `layout`, relative to the namespace root.
///
/// For enrichment facts this is the canonical file name; readers also accept
/// files whose stem normalizes to the same entity key (legacy writers kept the
/// original capitalization).
pub fn resolve(path: &LogicalPath, layout: PhysicalLayout) -> PathBuf {
    match path {
        LogicalPath::Root(fact) => {
            let entry = fact.entry();
            match layout {
                PhysicalLayout::Legacy => PathBuf::from(entry.legacy),
                PhysicalLayout::Versioned => PathBuf::from(entry.versioned),
            }
        }
        LogicalPath::Enrichment {
            category,
            provider,
            entity,
        } => category
            .dir(layout)
            .join(provider)
            .join(format!("{}.json", entity.file_stem())),
    }
}

/// Map a legacy-relative file path to its versioned location, if it has one.
///
/// Enrichment results land on the canonical file name for their entity key,
/// the same file [`resolve`] gives for the versioned layout. Returns `None`
/// for files that stay where they are (`metadata.json`, unknown root files).
pub fn legacy_to_versioned(relative: &str) -> Option<PathBuf> {
    if let Some(entry) = FACT_TABLE.iter().find(|e| e.legacy == relative) {
        return (entry.legacy != entry.versioned).then(|| PathBuf::from(entry.versioned));
    }
    CATEGORY_TABLE.iter().find_map(|entry| {
        let rest = relative
            .strip_prefix(entry.legacy)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())?;
        match legacy_result_path(entry.category, rest) {
            Some(path) => Some(resolve(&path, PhysicalLayout::Versioned)),
            None => Some(PathBuf::from(entry.versioned).join(rest)),
        }
    })
}

/// `{provider}/{Entity_Name}.json` under a legacy category directory.
fn legacy_result_path(category: Category, rest: &str) -> Option<LogicalPath> {
    let (provider, file) = rest.split_once('/')?;
    let stem = file.strip_suffix(".json")?;
    if !is_safe_segment(provider) || stem.contains('/') {
        return None;
    }
    let entity = EntityKey::from_file_stem(stem);
    (!entity.is_empty()).then(|| LogicalPath::enrichment(category, provider, &entity))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_rows_match_variant_order() {
        for (i, entry) in FACT_TABLE.iter().enumerate() {
            assert_eq!(entry.fact as usize, i, "row {} out of order", entry.logical);
        }
        for (i, entry) in CATEGORY_TABLE.iter().enumerate() {
            assert_eq!(entry.category as usize, i);
        }
    }

    #[test]
    fn root_facts_resolve_per_layout() {
        let ra = LogicalPath::Root(RootFact::RiskAssessment);
        assert_eq!(
            resolve(&ra, PhysicalLayout::Versioned),
            PathBuf::from("risk_assessments/risk_assessment.json")
        );
        assert_eq!(
            resolve(&ra, PhysicalLayout::Legacy),
            PathBuf::from("risk_assessment.json")
        );

        let meta = LogicalPath::Root(RootFact::Metadata);
        assert_eq!(
            resolve(&meta, PhysicalLayout::Versioned),
            resolve(&meta, PhysicalLayout::Legacy)
        );
    }

    #[test]
    fn enrichment_paths_resolve_per_layout() {
        let path: LogicalPath = "organization_results/sanctions/Acme Shell Ltd"
            .parse()
            .expect("parse");
        assert_eq!(
            resolve(&path, PhysicalLayout::Versioned),
            PathBuf::from("entity_data/organization_results/sanctions/acme_shell_ltd.json")
        );
        assert_eq!(
            resolve(&path, PhysicalLayout::Legacy),
            PathBuf::from("organization_results/sanctions/acme_shell_ltd.json")
        );
    }

    #[test]
    fn logical_paths_display_and_parse() {
        let path = LogicalPath::enrichment(
            Category::PeopleResults,
            "pep",
            &EntityKey::from_name("Jane  PEP"),
        );
        assert_eq!(path.to_string(), "people_results/pep/jane pep");
        let reparsed: LogicalPath = path.to_string().parse().expect("parse");
        assert_eq!(path, reparsed);

        let entities: LogicalPath = "entities".parse().expect("parse");
        assert_eq!(entities, LogicalPath::Root(RootFact::Entities));
        assert!("transaction".parse::<LogicalPath>().expect("parse").is_text());
    }

    #[test]
    fn malformed_logical_paths_are_rejected() {
        assert!("nonsense".parse::<LogicalPath>().is_err());
        assert!("unknown_results/x/y".parse::<LogicalPath>().is_err());
        assert!("organization_results/../x".parse::<LogicalPath>().is_err());
        assert!("organization_results/sanctions/   ".parse::<LogicalPath>().is_err());
    }

    #[test]
    fn legacy_paths_map_to_versioned() {
        assert_eq!(
            legacy_to_versioned("entities.json"),
            Some(PathBuf::from("entity_data/entities.json"))
        );
        assert_eq!(
            legacy_to_versioned("people_results/pep/Jane_PEP.json"),
            Some(PathBuf::from("entity_data/people_results/pep/jane_pep.json"))
        );
        assert_eq!(
            legacy_to_versioned("people_results/pep/Jane_O'Neil.json"),
            Some(PathBuf::from("entity_data/people_results/pep/jane_o%27neil.json"))
        );
        assert_eq!(
            legacy_to_versioned("organization_results/news/archive/notes.txt"),
            Some(PathBuf::from("entity_data/organization_results/news/archive/notes.txt"))
        );
        assert_eq!(legacy_to_versioned("metadata.json"), None);
        assert_eq!(legacy_to_versioned("notes.json"), None);
        assert_eq!(legacy_to_versioned("organization_results_backup/x.json"), None);
    }
}
