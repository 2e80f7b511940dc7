//! Core domain types for amlflow transactions.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AmlFlowError, Result};

/// Version stamped into every namespace marker written by the current layout.
pub const CURRENT_LAYOUT_VERSION: u32 = 2;

/// Risk score assigned when the reasoning service could not produce a verdict.
pub const DEGRADED_RISK_SCORE: f64 = 0.5;

// ---------------------------------------------------------------------------
// TransactionId
// ---------------------------------------------------------------------------

/// Opaque transaction identifier. Doubles as the fact store namespace name,
/// so it is restricted to characters that are safe as a single path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransactionId(String);

impl TransactionId {
    /// Generate a new id of the form `txn_{YYYYmmddHHMMSS}_{hex8}`.
    pub fn generate() -> Self {
        Self(format!("txn_{}_{}", timestamp_slug(), short_hex()))
    }

    /// Generate an id for item `index` of a bulk submission.
    pub fn generate_bulk(index: usize) -> Self {
        Self(format!("bulk_{}_{index}_{}", timestamp_slug(), short_hex()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn timestamp_slug() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

fn short_hex() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[..8].to_string()
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TransactionId {
    type Err = AmlFlowError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmlFlowError::validation("transaction id is empty"));
        }
        if s.starts_with('.') {
            return Err(AmlFlowError::validation(format!(
                "transaction id {s:?} must not start with '.'"
            )));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(AmlFlowError::validation(format!(
                "transaction id {s:?} contains unsupported characters"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for TransactionId {
    type Error = AmlFlowError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TransactionId> for String {
    fn from(id: TransactionId) -> Self {
        id.0
    }
}

impl AsRef<str> for TransactionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// TransactionState
// ---------------------------------------------------------------------------

/// Lifecycle state of a transaction as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    #[serde(alias = "queued")]
    Submitted,
    #[serde(alias = "processing")]
    Running,
    #[serde(alias = "success")]
    Completed,
    #[serde(alias = "error")]
    Failed,
    TimedOut,
}

impl TransactionState {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Which half of the entity model a subject belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Organization,
    Person,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::Person => "person",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized, case-insensitive join key derived from an entity name.
///
/// `"  ACME   Shell Ltd "` and `"acme shell ltd"` produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn from_name(name: &str) -> Self {
        let normalized = name
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// File name stem used by the versioned layout (`acme_shell_ltd`).
    ///
    /// Spaces become `_`; anything other than alphanumerics and `-` is
    /// percent-encoded, so [`EntityKey::from_file_stem`] recovers the key.
    pub fn file_stem(&self) -> String {
        let mut stem = String::with_capacity(self.0.len());
        for c in self.0.chars() {
            match c {
                ' ' => stem.push('_'),
                c if c.is_alphanumeric() || c == '-' => stem.push(c),
                c => {
                    let mut buf = [0u8; 4];
                    for byte in c.encode_utf8(&mut buf).bytes() {
                        stem.push_str(&format!("%{byte:02X}"));
                    }
                }
            }
        }
        stem
    }

    /// Key encoded in a result file stem.
    ///
    /// Also reads stems written by older tools, which only replaced spaces
    /// with `_` and kept capitalization and punctuation as-is.
    pub fn from_file_stem(stem: &str) -> Self {
        let bytes = stem.as_bytes();
        let mut decoded = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'_' => {
                    decoded.push(b' ');
                    i += 1;
                }
                b'%' => match percent_byte(stem.get(i + 1..i + 3)) {
                    Some(byte) => {
                        decoded.push(byte);
                        i += 3;
                    }
                    None => {
                        decoded.push(b'%');
                        i += 1;
                    }
                },
                byte => {
                    decoded.push(byte);
                    i += 1;
                }
            }
        }
        Self::from_name(&String::from_utf8_lossy(&decoded))
    }
}

fn percent_byte(hex: Option<&str>) -> Option<u8> {
    hex.filter(|h| h.bytes().all(|b| b.is_ascii_hexdigit()))
        .and_then(|h| u8::from_str_radix(h, 16).ok())
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An organization named in (or discovered for) a transaction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
    /// sender, recipient, or intermediary.
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<String>,
    /// corporation, shell_company, non_profit, government_agency, financial_institution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

/// A person named in (or discovered for) a transaction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Provider that surfaced this person, when discovered rather than extracted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Organization the person was discovered through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_connection: Option<String>,
}

/// Either half of the entity model, as handed to enrichment adapters.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Organization(Organization),
    Person(Person),
}

impl Entity {
    pub fn name(&self) -> &str {
        match self {
            Self::Organization(o) => &o.name,
            Self::Person(p) => &p.name,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Organization(_) => EntityKind::Organization,
            Self::Person(_) => EntityKind::Person,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::from_name(self.name())
    }
}

/// Output of the extraction stage, persisted as the `entities` fact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntities {
    #[serde(default)]
    pub organizations: Vec<Organization>,
    #[serde(default)]
    pub people: Vec<Person>,
    /// Amount, currency, purpose and date as reported by the extractor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<serde_json::Value>,
    #[serde(default)]
    pub jurisdictions: Vec<String>,
}

impl ExtractedEntities {
    pub fn is_empty(&self) -> bool {
        self.organizations.is_empty() && self.people.is_empty()
    }

    /// Names of every extracted entity, organizations first.
    pub fn names(&self) -> Vec<String> {
        self.organizations
            .iter()
            .map(|o| o.name.clone())
            .chain(self.people.iter().map(|p| p.name.clone()))
            .collect()
    }

    /// Entity keys of every extracted entity.
    pub fn keys(&self) -> Vec<EntityKey> {
        self.names().iter().map(|n| EntityKey::from_name(n)).collect()
    }
}

// ---------------------------------------------------------------------------
// EnrichmentResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Success,
    NoResults,
    Failed,
}

/// One provider's answer for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub status: EnrichmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Only populated by providers that can surface new entities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discovered_entities: Vec<Person>,
}

impl EnrichmentResult {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            status: EnrichmentStatus::Success,
            reason: None,
            data,
            discovered_entities: Vec::new(),
        }
    }

    pub fn no_results(reason: impl Into<String>) -> Self {
        Self {
            status: EnrichmentStatus::NoResults,
            reason: Some(reason.into()),
            data: serde_json::Value::Null,
            discovered_entities: Vec::new(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: EnrichmentStatus::Failed,
            reason: Some(reason.into()),
            data: serde_json::Value::Null,
            discovered_entities: Vec::new(),
        }
    }

    pub fn with_discovered(mut self, people: Vec<Person>) -> Self {
        self.discovered_entities = people;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == EnrichmentStatus::Success
    }
}

// ---------------------------------------------------------------------------
// RiskAssessment
// ---------------------------------------------------------------------------

/// Terminal verdict of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub transaction_id: String,
    pub risk_score: f64,
    pub confidence_score: f64,
    #[serde(default)]
    pub extracted_entities: Vec<String>,
    #[serde(default)]
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub supporting_evidence: Vec<String>,
    #[serde(default)]
    pub reason: String,
    pub timestamp: String,
    /// Set only on the synthesized fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RiskAssessment {
    /// Fallback verdict written when the reasoning service fails.
    pub fn degraded(transaction_id: &TransactionId, entities: &ExtractedEntities, cause: &str) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            risk_score: DEGRADED_RISK_SCORE,
            confidence_score: 0.0,
            extracted_entities: entities.names(),
            entity_types: entity_types(entities),
            supporting_evidence: vec!["Error during risk assessment".into()],
            reason: format!("Could not complete risk assessment due to error: {cause}"),
            timestamp: Utc::now().to_rfc3339(),
            error: Some(cause.to_string()),
        }
    }

    /// Zero confidence marks a synthesized verdict.
    pub fn is_degraded(&self) -> bool {
        self.confidence_score == 0.0
    }

    /// Clamp both scores into `[0, 1]`; NaN becomes 0.
    pub fn clamp_scores(&mut self) {
        self.risk_score = clamp_unit(self.risk_score);
        self.confidence_score = clamp_unit(self.confidence_score);
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// Distinct entity types in extraction order (organization types, then "person").
pub fn entity_types(entities: &ExtractedEntities) -> Vec<String> {
    let mut types: Vec<String> = Vec::new();
    let candidates = entities
        .organizations
        .iter()
        .map(|o| o.entity_type.clone().unwrap_or_else(|| "organization".into()))
        .chain(entities.people.iter().map(|_| "person".to_string()));
    for t in candidates {
        if !types.contains(&t) {
            types.push(t);
        }
    }
    types
}

// ---------------------------------------------------------------------------
// RunMetadata
// ---------------------------------------------------------------------------

/// The `metadata` fact: last known external run for a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub transaction_id: String,
    pub pipeline_id: String,
    pub run_id: String,
    pub status: TransactionState,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
}

impl RunMetadata {
    pub fn new(
        transaction_id: &TransactionId,
        pipeline_id: impl Into<String>,
        run_id: impl Into<String>,
        status: TransactionState,
    ) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            pipeline_id: pipeline_id.into(),
            run_id: run_id.into(),
            status,
            timestamp: Utc::now().to_rfc3339(),
            result_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_path_safe() {
        let id = TransactionId::generate();
        assert!(id.as_str().starts_with("txn_"));
        let reparsed: TransactionId = id.as_str().parse().expect("parse");
        assert_eq!(id, reparsed);

        let bulk = TransactionId::generate_bulk(2);
        assert!(bulk.as_str().starts_with("bulk_"));
        assert!(bulk.as_str().contains("_2_"));
    }

    #[test]
    fn transaction_id_rejects_traversal() {
        assert!("".parse::<TransactionId>().is_err());
        assert!("../etc".parse::<TransactionId>().is_err());
        assert!("a/b".parse::<TransactionId>().is_err());
        assert!(".staging".parse::<TransactionId>().is_err());
        assert!("txn_20240101_abcdef12".parse::<TransactionId>().is_ok());
    }

    #[test]
    fn entity_key_normalizes_case_and_whitespace() {
        let a = EntityKey::from_name("  ACME   Shell\tLtd ");
        let b = EntityKey::from_name("acme shell ltd");
        assert_eq!(a, b);
        assert_eq!(a.file_stem(), "acme_shell_ltd");
        assert_eq!(EntityKey::from_name("A/B Corp").file_stem(), "a%2Fb_corp");
    }

    #[test]
    fn file_stems_decode_to_the_same_key() {
        for name in ["Jane O'Neil", "Acme, Inc.", "Acme Ltd", "snake_case Holdings", "Zürich Trust AG", "100% Owned"] {
            let key = EntityKey::from_name(name);
            assert_eq!(EntityKey::from_file_stem(&key.file_stem()), key, "{name}");
        }
        assert_ne!(
            EntityKey::from_name("Acme, Ltd").file_stem(),
            EntityKey::from_name("Acme Ltd").file_stem()
        );
    }

    #[test]
    fn older_file_stems_still_decode() {
        assert_eq!(EntityKey::from_file_stem("Acme_Shell_Ltd"), EntityKey::from_name("acme shell ltd"));
        assert_eq!(EntityKey::from_file_stem("Jane_O'Neil"), EntityKey::from_name("jane o'neil"));
        assert_eq!(EntityKey::from_file_stem("50%_Stake"), EntityKey::from_name("50% stake"));
    }

    #[test]
    fn state_accepts_engine_vocabulary() {
        let s: TransactionState = serde_json::from_str("\"success\"").expect("parse");
        assert_eq!(s, TransactionState::Completed);
        let s: TransactionState = serde_json::from_str("\"error\"").expect("parse");
        assert_eq!(s, TransactionState::Failed);
        assert!(TransactionState::Completed.is_terminal());
        assert!(!TransactionState::Running.is_terminal());
    }

    #[test]
    fn enrichment_result_omits_empty_discoveries() {
        let json = serde_json::to_value(EnrichmentResult::no_results("nothing")).expect("serialize");
        assert_eq!(json["status"], "no_results");
        assert!(json.get("discovered_entities").is_none());

        let with = EnrichmentResult::success(serde_json::json!({"id": 1})).with_discovered(vec![
            Person {
                name: "Jane Doe".into(),
                ..Default::default()
            },
        ]);
        let json = serde_json::to_value(with).expect("serialize");
        assert_eq!(json["discovered_entities"][0]["name"], "Jane Doe");
    }

    #[test]
    fn degraded_assessment_has_zero_confidence() {
        let entities = ExtractedEntities {
            organizations: vec![Organization {
                name: "Acme Shell Ltd".into(),
                entity_type: Some("shell_company".into()),
                ..Default::default()
            }],
            people: vec![Person {
                name: "Jane PEP".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let id: TransactionId = "txn_test".parse().expect("id");
        let ra = RiskAssessment::degraded(&id, &entities, "service unavailable");
        assert!(ra.is_degraded());
        assert_eq!(ra.risk_score, DEGRADED_RISK_SCORE);
        assert_eq!(ra.extracted_entities, vec!["Acme Shell Ltd", "Jane PEP"]);
        assert_eq!(ra.entity_types, vec!["shell_company", "person"]);
        assert!(ra.reason.contains("service unavailable"));
    }

    #[test]
    fn scores_are_clamped() {
        let mut ra = RiskAssessment {
            transaction_id: "t".into(),
            risk_score: 1.7,
            confidence_score: f64::NAN,
            extracted_entities: vec![],
            entity_types: vec![],
            supporting_evidence: vec![],
            reason: String::new(),
            timestamp: String::new(),
            error: None,
        };
        ra.clamp_scores();
        assert_eq!(ra.risk_score, 1.0);
        assert_eq!(ra.confidence_score, 0.0);
    }
}
