//! Politically exposed persons screening against a local CSV list.
//!
//! The file has a header row with at least `name` and `aliases`
//! (`;`-separated) columns; every column of a matching row is returned.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use amlflow_shared::{EnrichmentResult, EntityKind, ProvidersConfig, expand_home};

use crate::adapter::{EnrichmentAdapter, Subject, TransactionContext};

/// Name tokens this short are too common to match on.
const MIN_TOKEN_LEN: usize = 3;

static PUNCTUATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s]").expect("valid regex"));

/// One row of the PEP list, keyed by column header.
pub type PepRecord = BTreeMap<String, String>;

pub struct PepAdapter {
    data_file: PathBuf,
}

impl PepAdapter {
    pub fn new(config: &ProvidersConfig) -> Self {
        Self {
            data_file: expand_home(&config.pep_data_file),
        }
    }

    pub fn with_data_file(path: impl Into<PathBuf>) -> Self {
        Self { data_file: path.into() }
    }
}

fn simplify(s: &str) -> String {
    PUNCTUATION.replace_all(&s.to_lowercase(), "").into_owned()
}

/// Significant tokens of a person's name.
fn name_tokens(name: &str) -> Vec<String> {
    simplify(name)
        .split_whitespace()
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
        .map(str::to_string)
        .collect()
}

/// True when any significant token appears as a word of the listed name or of one alias.
fn matches_record(tokens: &[String], record: &PepRecord) -> bool {
    let name = record.get("name").map(String::as_str).unwrap_or_default();
    let aliases = record.get("aliases").map(String::as_str).unwrap_or_default();
    std::iter::once(name)
        .chain(aliases.split(';'))
        .map(simplify)
        .any(|candidate| {
            let words: Vec<&str> = candidate.split_whitespace().collect();
            tokens.iter().any(|t| words.contains(&t.as_str()))
        })
}

fn scan(path: &Path, person: &str) -> Result<Vec<PepRecord>, String> {
    let tokens = name_tokens(person);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| format!("Error reading PEP data: {e}"))?;

    let mut matches = Vec::new();
    for record in reader.deserialize::<PepRecord>() {
        let record = record.map_err(|e| format!("Error reading PEP data: {e}"))?;
        if matches_record(&tokens, &record) {
            matches.push(record);
        }
    }
    Ok(matches)
}

#[async_trait]
impl EnrichmentAdapter for PepAdapter {
    fn provider(&self) -> &str {
        "pep"
    }

    fn supports(&self, kind: EntityKind) -> bool {
        kind == EntityKind::Person
    }

    async fn lookup(&self, subject: &Subject, _ctx: &TransactionContext) -> EnrichmentResult {
        if subject.name.trim().is_empty() {
            return EnrichmentResult::failed("No person name provided");
        }
        if !self.data_file.is_file() {
            warn!(file = %self.data_file.display(), "PEP data file not found");
            return EnrichmentResult::failed(format!(
                "PEP data file {} not found",
                self.data_file.display()
            ));
        }

        let path = self.data_file.clone();
        let name = subject.name.clone();
        let scanned = tokio::task::spawn_blocking(move || scan(&path, &name))
            .await
            .unwrap_or_else(|e| Err(format!("PEP scan aborted: {e}")));

        match scanned.and_then(|m| serde_json::to_value(&m).map_err(|e| e.to_string())) {
            Ok(data) => {
                debug!(matches = data.as_array().map_or(0, Vec::len), "PEP list scanned");
                EnrichmentResult::success(data)
            }
            Err(reason) => EnrichmentResult::failed(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::ctx;
    use amlflow_shared::EnrichmentStatus;
    use uuid::Uuid;

    fn write_list(content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("amlflow-pep-{}.csv", Uuid::now_v7()));
        std::fs::write(&path, content).expect("write csv");
        path
    }

    const LIST: &str = "name,aliases,country,position\n\
        Jane Pepperton,J. Pep;Janie PEP,GB,Minister of Finance\n\
        Al Bo,,US,Senator\n\
        Robert Stone,Bob Stone,FR,Mayor\n";

    #[test]
    fn short_tokens_are_ignored() {
        assert_eq!(name_tokens("Al O'Brien-Bo Jr."), vec!["obrienbo".to_string()]);
    }

    #[tokio::test]
    async fn matches_names_and_aliases() {
        let path = write_list(LIST);
        let adapter = PepAdapter::with_data_file(&path);

        let result = adapter.lookup(&Subject::person("Jane PEP", None), &ctx("txn_pep")).await;
        assert!(result.is_success());
        let rows = result.data.as_array().expect("array");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["position"], "Minister of Finance");

        // "bob" only appears as an alias word.
        let result = adapter.lookup(&Subject::person("Bob", None), &ctx("txn_pep")).await;
        assert_eq!(result.data.as_array().map(Vec::len), Some(1));

        // "Al" and "Bo" are too short to match.
        let result = adapter.lookup(&Subject::person("Al Bo", None), &ctx("txn_pep")).await;
        assert_eq!(result.data, serde_json::json!([]));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_list_is_failed_result() {
        let adapter = PepAdapter::with_data_file("/nonexistent/amlflow/pep.csv");
        let result = adapter.lookup(&Subject::person("Jane PEP", None), &ctx("txn_pep")).await;
        assert_eq!(result.status, EnrichmentStatus::Failed);
        assert!(result.reason.as_deref().unwrap_or("").contains("not found"));
    }
}
