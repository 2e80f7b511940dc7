//! In-memory run registry populated at submission time.
//!
//! A read-through cache in front of the fact store and the engine; losing it
//! (process restart) only makes status queries slower.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::Utc;
use serde::Serialize;

use amlflow_shared::{TransactionId, TransactionState};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryEntry {
    pub status: TransactionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
}

impl RegistryEntry {
    pub fn new(status: TransactionState) -> Self {
        Self {
            status,
            pipeline_id: None,
            run_id: None,
            timestamp: Utc::now().to_rfc3339(),
            result_path: None,
        }
    }

    pub fn with_run(mut self, pipeline_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_result_path(mut self, path: Option<String>) -> Self {
        self.result_path = path;
        self
    }
}

#[derive(Debug, Default)]
pub struct RunRegistry {
    entries: RwLock<HashMap<TransactionId, RegistryEntry>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update the entry for `txn`.
    ///
    /// A `completed` entry is never moved back to a non-terminal status, and
    /// run identifiers already known are kept when the update carries none.
    pub fn record(&self, txn: &TransactionId, entry: RegistryEntry) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(txn) {
            Some(existing) => {
                if existing.status == TransactionState::Completed && entry.status != TransactionState::Completed {
                    return;
                }
                existing.status = entry.status;
                existing.timestamp = entry.timestamp;
                if entry.pipeline_id.is_some() {
                    existing.pipeline_id = entry.pipeline_id;
                }
                if entry.run_id.is_some() {
                    existing.run_id = entry.run_id;
                }
                if entry.result_path.is_some() {
                    existing.result_path = entry.result_path;
                }
            }
            None => {
                entries.insert(txn.clone(), entry);
            }
        }
    }

    pub fn get(&self, txn: &TransactionId) -> Option<RegistryEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(txn)
            .cloned()
    }

    pub fn entries(&self) -> Vec<(TransactionId, RegistryEntry)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn() -> TransactionId {
        "txn_registry".parse().expect("id")
    }

    #[test]
    fn completed_is_sticky() {
        let registry = RunRegistry::new();
        registry.record(&txn(), RegistryEntry::new(TransactionState::Submitted).with_run("p", "r"));
        registry.record(&txn(), RegistryEntry::new(TransactionState::Completed));
        registry.record(&txn(), RegistryEntry::new(TransactionState::Running));

        let entry = registry.get(&txn()).expect("entry");
        assert_eq!(entry.status, TransactionState::Completed);
        assert_eq!(entry.run_id.as_deref(), Some("r"));
    }

    #[test]
    fn failed_can_be_superseded() {
        let registry = RunRegistry::new();
        registry.record(&txn(), RegistryEntry::new(TransactionState::Failed));
        registry.record(
            &txn(),
            RegistryEntry::new(TransactionState::Completed).with_result_path(Some("/tmp/ra.json".into())),
        );
        let entry = registry.get(&txn()).expect("entry");
        assert_eq!(entry.status, TransactionState::Completed);
        assert_eq!(entry.result_path.as_deref(), Some("/tmp/ra.json"));
        assert_eq!(registry.len(), 1);
    }
}
