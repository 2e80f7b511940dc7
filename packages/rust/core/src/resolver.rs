//! Canonical status of a transaction from several possibly-stale views.
//!
//! Lookup order: risk assessment fact, run metadata (asking the engine),
//! in-memory registry, legacy result files, then the engine directly with the
//! transaction id as run id. Engine errors fall through to the next tier.
//! Answers found after the first tier are written back into the registry
//! and, where the namespace exists, the metadata fact.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use amlflow_factstore::{FactStore, RootFact};
use amlflow_shared::{AmlFlowError, Result, RiskAssessment, RunMetadata, TransactionId, TransactionState};

use crate::engine::{RunState, WorkflowEngine};
use crate::pipeline::PIPELINE_ID;
use crate::registry::{RegistryEntry, RunRegistry};

/// Which view produced the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    FactStore,
    Metadata,
    Registry,
    LegacyResult,
    Engine,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedStatus {
    pub transaction_id: String,
    pub status: TransactionState,
    pub source: StatusSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<RiskAssessment>,
}

impl ResolvedStatus {
    fn new(txn: &TransactionId, status: TransactionState, source: StatusSource) -> Self {
        Self {
            transaction_id: txn.to_string(),
            status,
            source,
            risk_assessment: None,
        }
    }

    fn with_assessment(mut self, assessment: Option<RiskAssessment>) -> Self {
        self.risk_assessment = assessment;
        self
    }
}

pub struct StatusResolver {
    store: FactStore,
    registry: Arc<RunRegistry>,
    engine: Arc<dyn WorkflowEngine>,
}

impl StatusResolver {
    pub fn new(store: FactStore, registry: Arc<RunRegistry>, engine: Arc<dyn WorkflowEngine>) -> Self {
        Self { store, registry, engine }
    }

    /// Resolve the status of `txn`. `NotFound` when no view knows it.
    #[instrument(skip_all, fields(transaction_id = %txn))]
    pub async fn resolve(&self, txn: &TransactionId) -> Result<ResolvedStatus> {
        let resolved = self.check_tiers(txn).await?;
        debug!(status = %resolved.status, source = ?resolved.source, "status resolved");

        // Completed is terminal: a later, staler view never wins.
        let pinned = self
            .registry
            .get(txn)
            .is_some_and(|e| e.status == TransactionState::Completed);
        if pinned && resolved.status != TransactionState::Completed {
            return Ok(ResolvedStatus::new(txn, TransactionState::Completed, StatusSource::Registry)
                .with_assessment(self.stored_assessment(txn).or_else(|| self.legacy_assessment(txn))));
        }
        Ok(resolved)
    }

    async fn check_tiers(&self, txn: &TransactionId) -> Result<ResolvedStatus> {
        // 1. Risk assessment fact.
        if let Some(assessment) = self.stored_assessment(txn) {
            self.backfill_registry(txn, TransactionState::Completed, None);
            return Ok(ResolvedStatus::new(txn, TransactionState::Completed, StatusSource::FactStore)
                .with_assessment(Some(assessment)));
        }

        // 2. Run metadata, confirmed with the engine.
        if let Some(meta) = self.metadata(txn) {
            let state = self.query_engine(&meta.pipeline_id, &meta.run_id).await;
            let status = match state {
                Some(state) => Some(state.transaction_state()),
                None if meta.status.is_terminal() => Some(meta.status),
                None => None,
            };
            if let Some(status) = status {
                let resolved = self.settle(txn, status, StatusSource::Metadata);
                self.backfill_registry(txn, resolved.status, Some((&meta.pipeline_id, &meta.run_id)));
                return Ok(resolved);
            }
        }

        // 3. In-memory registry.
        if let Some(entry) = self.registry.get(txn) {
            let state = match (&entry.pipeline_id, &entry.run_id) {
                (Some(pipeline_id), Some(run_id)) => self.query_engine(pipeline_id, run_id).await,
                _ => None,
            };
            let status = state.map_or(entry.status, RunState::transaction_state);
            let resolved = self.settle(txn, status, StatusSource::Registry);
            self.backfill_registry(txn, resolved.status, None);
            if let (Some(pipeline_id), Some(run_id)) = (&entry.pipeline_id, &entry.run_id) {
                self.backfill_metadata(txn, pipeline_id, run_id, resolved.status);
            }
            return Ok(resolved);
        }

        // 4. Legacy result file.
        if let Some(assessment) = self.legacy_assessment(txn) {
            self.backfill_registry(txn, TransactionState::Completed, None);
            return Ok(ResolvedStatus::new(txn, TransactionState::Completed, StatusSource::LegacyResult)
                .with_assessment(Some(assessment)));
        }

        // 5. Ask the engine with the transaction id as run id.
        if let Some(state) = self.query_engine(PIPELINE_ID, txn.as_str()).await {
            let resolved = self.settle(txn, state.transaction_state(), StatusSource::Engine);
            self.backfill_registry(txn, resolved.status, Some((PIPELINE_ID, txn.as_str())));
            self.backfill_metadata(txn, PIPELINE_ID, txn.as_str(), resolved.status);
            return Ok(resolved);
        }

        Err(AmlFlowError::NotFound(format!("transaction {txn}")))
    }

    /// Attach the verdict to a completed status, re-reading the fact store
    /// first and the legacy files second.
    fn settle(&self, txn: &TransactionId, status: TransactionState, source: StatusSource) -> ResolvedStatus {
        let resolved = ResolvedStatus::new(txn, status, source);
        if status != TransactionState::Completed {
            return resolved;
        }
        resolved.with_assessment(self.stored_assessment(txn).or_else(|| self.legacy_assessment(txn)))
    }

    fn stored_assessment(&self, txn: &TransactionId) -> Option<RiskAssessment> {
        match self.store.get_json(txn, &RootFact::RiskAssessment.into()) {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "unreadable risk assessment fact");
                None
            }
        }
    }

    fn metadata(&self, txn: &TransactionId) -> Option<RunMetadata> {
        match self.store.get_json(txn, &RootFact::Metadata.into()) {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "unreadable metadata fact");
                None
            }
        }
    }

    fn legacy_assessment(&self, txn: &TransactionId) -> Option<RiskAssessment> {
        match self.store.legacy_result_for(txn) {
            Ok(found) => found.and_then(|r| r.assessment),
            Err(e) => {
                warn!(error = %e, "failed to scan legacy result files");
                None
            }
        }
    }

    async fn query_engine(&self, pipeline_id: &str, run_id: &str) -> Option<RunState> {
        match self.engine.run_state(pipeline_id, run_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(pipeline_id, run_id, error = %e, "engine status query failed");
                None
            }
        }
    }

    fn backfill_registry(&self, txn: &TransactionId, status: TransactionState, run: Option<(&str, &str)>) {
        let mut entry = RegistryEntry::new(status);
        if let Some((pipeline_id, run_id)) = run {
            entry = entry.with_run(pipeline_id, run_id);
        }
        self.registry.record(txn, entry);
    }

    fn backfill_metadata(&self, txn: &TransactionId, pipeline_id: &str, run_id: &str, status: TransactionState) {
        if !self.store.exists(txn) {
            return;
        }
        let meta = RunMetadata::new(txn, pipeline_id, run_id, status);
        if let Err(e) = self.store.put_json(txn, &RootFact::Metadata.into(), &meta) {
            warn!(error = %e, "failed to backfill run metadata");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::tests::temp_store;
    use crate::pipeline::RunRequest;
    use crate::engine::RunHandle;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers every query with the same state and records the questions.
    struct FixedEngine {
        state: std::result::Result<Option<RunState>, String>,
        queries: Mutex<Vec<(String, String)>>,
    }

    impl FixedEngine {
        fn new(state: std::result::Result<Option<RunState>, String>) -> Arc<Self> {
            Arc::new(Self {
                state,
                queries: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl WorkflowEngine for FixedEngine {
        async fn trigger(&self, request: RunRequest) -> Result<RunHandle> {
            Ok(RunHandle {
                pipeline_id: request.pipeline_id,
                run_id: request.run_id,
            })
        }

        async fn run_state(&self, pipeline_id: &str, run_id: &str) -> Result<Option<RunState>> {
            self.queries
                .lock()
                .expect("lock")
                .push((pipeline_id.to_string(), run_id.to_string()));
            self.state.clone().map_err(AmlFlowError::Engine)
        }
    }

    fn assessment(id: &str) -> RiskAssessment {
        RiskAssessment {
            transaction_id: id.into(),
            risk_score: 0.75,
            confidence_score: 0.9,
            extracted_entities: vec!["Acme Shell Ltd".into()],
            entity_types: vec!["shell_company".into()],
            supporting_evidence: vec!["sanctions match".into()],
            reason: "Sanctioned".into(),
            timestamp: "2025-03-01T10:00:00+00:00".into(),
            error: None,
        }
    }

    fn txn(id: &str) -> TransactionId {
        id.parse().expect("id")
    }

    #[tokio::test]
    async fn assessment_fact_wins_without_engine() {
        let (store, dir) = temp_store();
        let id = txn("txn_resolve_fact");
        store
            .put_json(&id, &RootFact::RiskAssessment.into(), &assessment(id.as_str()))
            .expect("put");
        let engine = FixedEngine::new(Err("unreachable".into()));
        let resolver = StatusResolver::new(store, Arc::new(RunRegistry::new()), engine.clone());

        let status = resolver.resolve(&id).await.expect("resolve");
        assert_eq!(status.status, TransactionState::Completed);
        assert_eq!(status.source, StatusSource::FactStore);
        assert_eq!(status.risk_assessment.map(|r| r.risk_score), Some(0.75));
        assert!(engine.queries.lock().expect("lock").is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn metadata_asks_engine_for_run() {
        let (store, dir) = temp_store();
        let id = txn("txn_resolve_meta");
        store.ensure_namespace(&id).expect("namespace");
        let meta = RunMetadata::new(&id, "aml_risk_assessment", "run-7", TransactionState::Submitted);
        store.put_json(&id, &RootFact::Metadata.into(), &meta).expect("put");

        let engine = FixedEngine::new(Ok(Some(RunState::Running)));
        let registry = Arc::new(RunRegistry::new());
        let resolver = StatusResolver::new(store, registry.clone(), engine.clone());

        let status = resolver.resolve(&id).await.expect("resolve");
        assert_eq!(status.status, TransactionState::Running);
        assert_eq!(status.source, StatusSource::Metadata);
        assert_eq!(
            engine.queries.lock().expect("lock")[0],
            ("aml_risk_assessment".to_string(), "run-7".to_string())
        );
        assert_eq!(registry.get(&id).and_then(|e| e.run_id), Some("run-7".to_string()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn engine_outage_falls_back_to_registry() {
        let (store, dir) = temp_store();
        let id = txn("txn_resolve_registry");
        let registry = Arc::new(RunRegistry::new());
        registry.record(
            &id,
            RegistryEntry::new(TransactionState::Submitted).with_run("aml_risk_assessment", id.as_str()),
        );
        let resolver = StatusResolver::new(store, registry, FixedEngine::new(Err("connection refused".into())));

        let status = resolver.resolve(&id).await.expect("resolve");
        assert_eq!(status.status, TransactionState::Submitted);
        assert_eq!(status.source, StatusSource::Registry);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn legacy_file_backfills_registry() {
        let (store, dir) = temp_store();
        let id = txn("txn_resolve_legacy");
        let file = store.root().join(format!("result_{id}.json"));
        std::fs::write(
            &file,
            serde_json::to_vec(&serde_json::json!({"risk_assessment": assessment(id.as_str())})).expect("json"),
        )
        .expect("write");
        let registry = Arc::new(RunRegistry::new());
        let resolver = StatusResolver::new(store, registry.clone(), FixedEngine::new(Ok(None)));

        let status = resolver.resolve(&id).await.expect("resolve");
        assert_eq!(status.source, StatusSource::LegacyResult);
        assert_eq!(status.status, TransactionState::Completed);
        assert_eq!(registry.get(&id).map(|e| e.status), Some(TransactionState::Completed));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn engine_is_last_resort() {
        let (store, dir) = temp_store();
        let id = txn("txn_resolve_engine");
        store.ensure_namespace(&id).expect("namespace");
        let engine = FixedEngine::new(Ok(Some(RunState::Failed)));
        let resolver = StatusResolver::new(store.clone(), Arc::new(RunRegistry::new()), engine);

        let status = resolver.resolve(&id).await.expect("resolve");
        assert_eq!(status.status, TransactionState::Failed);
        assert_eq!(status.source, StatusSource::Engine);

        let meta: RunMetadata = store
            .get_json(&id, &RootFact::Metadata.into())
            .expect("read")
            .expect("backfilled");
        assert_eq!(meta.run_id, id.as_str());
        assert_eq!(meta.status, TransactionState::Failed);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unknown_transaction_is_not_found() {
        let (store, dir) = temp_store();
        let resolver = StatusResolver::new(store, Arc::new(RunRegistry::new()), FixedEngine::new(Ok(None)));
        let err = resolver.resolve(&txn("txn_resolve_missing")).await.expect_err("missing");
        assert!(matches!(err, AmlFlowError::NotFound(_)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn completed_never_regresses() {
        let (store, dir) = temp_store();
        let id = txn("txn_resolve_sticky");
        store.ensure_namespace(&id).expect("namespace");
        let meta = RunMetadata::new(&id, "aml_risk_assessment", id.as_str(), TransactionState::Running);
        store.put_json(&id, &RootFact::Metadata.into(), &meta).expect("put");

        let registry = Arc::new(RunRegistry::new());
        registry.record(&id, RegistryEntry::new(TransactionState::Completed));
        // A stale engine still reports the run as running.
        let resolver = StatusResolver::new(store, registry, FixedEngine::new(Ok(Some(RunState::Running))));

        for _ in 0..2 {
            let status = resolver.resolve(&id).await.expect("resolve");
            assert_eq!(status.status, TransactionState::Completed);
        }

        let _ = std::fs::remove_dir_all(&dir);
    }
}
