//! Flat result files written by the legacy pipeline at the store root.
//!
//! Named `result_{run}.json`; the run name usually embeds the transaction id.
//! Content is either a bare risk assessment or an object with a
//! `risk_assessment` field.

use std::path::PathBuf;
use std::time::SystemTime;

use amlflow_shared::{AmlFlowError, Result, RiskAssessment, TransactionId};
use tracing::debug;

use crate::store::FactStore;

const RESULT_PREFIX: &str = "result_";

/// One legacy result file.
#[derive(Debug, Clone)]
pub struct LegacyResult {
    pub path: PathBuf,
    /// File stem without the `result_` prefix.
    pub run_name: String,
    pub modified: SystemTime,
    pub assessment: Option<RiskAssessment>,
}

impl LegacyResult {
    /// Transaction id from the content, if it names one.
    pub fn transaction_id(&self) -> Option<&str> {
        self.assessment
            .as_ref()
            .map(|a| a.transaction_id.as_str())
            .filter(|id| !id.is_empty())
    }

    fn matches(&self, txn: &TransactionId) -> bool {
        self.transaction_id() == Some(txn.as_str()) || self.run_name.contains(txn.as_str())
    }
}

impl FactStore {
    /// Every legacy result file, newest first.
    pub fn legacy_results(&self) -> Result<Vec<LegacyResult>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AmlFlowError::io(&self.root, e)),
        };

        let mut results: Vec<LegacyResult> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let run_name = name.strip_prefix(RESULT_PREFIX)?.strip_suffix(".json")?.to_string();
                let path = entry.path();
                if !path.is_file() {
                    return None;
                }
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                let assessment = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
                    .and_then(parse_assessment);
                Some(LegacyResult {
                    path,
                    run_name,
                    modified,
                    assessment,
                })
            })
            .collect();

        results.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.run_name.cmp(&a.run_name)));
        Ok(results)
    }

    /// Newest legacy result file that belongs to `txn`.
    pub fn legacy_result_for(&self, txn: &TransactionId) -> Result<Option<LegacyResult>> {
        let found = self.legacy_results()?.into_iter().find(|r| r.matches(txn));
        if let Some(r) = &found {
            debug!(transaction_id = %txn, file = %r.path.display(), "legacy result file matched");
        }
        Ok(found)
    }
}

/// Accept a bare assessment or one nested under `risk_assessment`.
pub fn parse_assessment(value: serde_json::Value) -> Option<RiskAssessment> {
    let inner = value.get("risk_assessment").cloned();
    inner
        .and_then(|v| serde_json::from_value::<RiskAssessment>(v).ok())
        .or_else(|| serde_json::from_value::<RiskAssessment>(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{temp_store, txn};

    fn assessment_json(id: &str, score: f64) -> String {
        serde_json::json!({
            "transaction_id": id,
            "risk_score": score,
            "confidence_score": 0.8,
            "reason": "test",
            "timestamp": "2024-01-01T00:00:00Z",
        })
        .to_string()
    }

    #[test]
    fn legacy_results_parse_both_shapes() {
        let (store, dir) = temp_store();
        std::fs::write(dir.join("result_run_a.json"), assessment_json("txn_a", 0.3)).expect("write");
        std::fs::write(
            dir.join("result_run_b.json"),
            format!(r#"{{"dag_run_id": "run_b", "risk_assessment": {}}}"#, assessment_json("txn_b", 0.9)),
        )
        .expect("write");
        std::fs::write(dir.join("result_garbage.json"), "not json").expect("write");
        std::fs::write(dir.join("other.json"), "{}").expect("write");

        let results = store.legacy_results().expect("scan");
        assert_eq!(results.len(), 3);
        let b = results.iter().find(|r| r.run_name == "run_b").expect("run_b");
        assert_eq!(b.transaction_id(), Some("txn_b"));
        assert_eq!(b.assessment.as_ref().map(|a| a.risk_score), Some(0.9));
        assert!(results.iter().any(|r| r.run_name == "garbage" && r.assessment.is_none()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn legacy_result_matches_by_content_or_name() {
        let (store, dir) = temp_store();
        std::fs::write(dir.join("result_aml_run_txn_named.json"), "{}").expect("write");
        std::fs::write(dir.join("result_other.json"), assessment_json("txn_content", 0.5)).expect("write");

        assert!(store.legacy_result_for(&txn("txn_named")).expect("scan").is_some());
        let by_content = store.legacy_result_for(&txn("txn_content")).expect("scan").expect("found");
        assert_eq!(by_content.run_name, "other");
        assert!(store.legacy_result_for(&txn("txn_missing")).expect("scan").is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
