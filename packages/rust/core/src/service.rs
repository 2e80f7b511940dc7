//! Service facade: submission, bulk submission, status, callbacks, dashboard,
//! listing, browsing, and graph queries.
//!
//! Front doors (the CLI, an HTTP layer) call into [`AmlService`] only.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use amlflow_enrichment::AdapterRegistry;
use amlflow_factstore::{FactStore, FileView, MigrationReport, RootFact, TreeNode};
use amlflow_shared::{
    AmlFlowError, AppConfig, EntityKind, ExtractedEntities, Result, RiskAssessment, RunMetadata, TransactionId,
    TransactionState,
};
use amlflow_storage::{EntityHistory, GraphStore, Network};

use crate::assembler;
use crate::assessment::RiskAssessor;
use crate::bulk::{self, BulkFormat, BulkSummary};
use crate::engine::{LocalEngine, WorkflowEngine};
use crate::graph::EntityGraph;
use crate::notify::HttpNotifier;
use crate::pipeline::{Coordinator, PIPELINE_ID, PipelineObserver, RunRequest};
use crate::reasoning::{ChatCompletionsClient, KeyScheduler, ReasoningService};
use crate::registry::{RegistryEntry, RunRegistry};
use crate::reporting::{self, Dashboard, ListQuery, TransactionPage, TransactionSummary};
use crate::resolver::{ResolvedStatus, StatusResolver};

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Block until the run reaches a terminal state (bounded by the poll timeout).
    pub wait: bool,
    pub callback_url: Option<String>,
}

/// A triggered (or, in waiting mode, finished) run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunDescriptor {
    pub transaction_id: String,
    pub pipeline_id: String,
    pub run_id: String,
    pub status: TransactionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub enum Submission {
    Triggered(RunDescriptor),
    Completed(RiskAssessment),
}

/// Completion report posted by a workflow engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CallbackPayload {
    pub transaction_id: String,
    #[serde(default = "default_pipeline_id", alias = "dag_id")]
    pub pipeline_id: String,
    #[serde(alias = "dag_run_id")]
    pub run_id: String,
    pub status: TransactionState,
    #[serde(default)]
    pub result_path: Option<String>,
}

/// `null` or `{}`: what the history stage stores when the graph had nothing.
fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn default_pipeline_id() -> String {
    PIPELINE_ID.to_string()
}

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(600);

pub struct AmlService {
    store: FactStore,
    engine: Arc<dyn WorkflowEngine>,
    registry: Arc<RunRegistry>,
    resolver: StatusResolver,
    assessor: RiskAssessor,
    graph: Option<Arc<dyn EntityGraph>>,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl AmlService {
    pub fn new(
        store: FactStore,
        engine: Arc<dyn WorkflowEngine>,
        assessor: RiskAssessor,
        graph: Option<Arc<dyn EntityGraph>>,
    ) -> Self {
        let registry = Arc::new(RunRegistry::new());
        let resolver = StatusResolver::new(store.clone(), registry.clone(), engine.clone());
        Self {
            store,
            engine,
            registry,
            resolver,
            assessor,
            graph,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_timeout = timeout;
        self
    }

    /// Wire the full stack from configuration.
    ///
    /// The graph store is optional: if it cannot be opened the service runs
    /// without entity history and the graph persistence stage is skipped.
    pub async fn from_config(
        config: &AppConfig,
        observer: Arc<dyn PipelineObserver>,
    ) -> Result<(Self, Arc<LocalEngine>)> {
        let store = FactStore::open(config.results_dir())?;
        let keys = Arc::new(KeyScheduler::from_config(&config.reasoning));
        let reasoning: Arc<dyn ReasoningService> = Arc::new(ChatCompletionsClient::new(&config.reasoning, keys)?);
        let adapters = Arc::new(AdapterRegistry::with_builtin(&config.providers)?);

        let graph: Option<Arc<dyn EntityGraph>> = match GraphStore::open(&config.graph_db_path()).await {
            Ok(graph) => Some(Arc::new(graph)),
            Err(e) => {
                warn!(error = %e, "graph store unavailable, continuing without entity history");
                None
            }
        };

        let mut coordinator = Coordinator::new(store.clone(), adapters, reasoning.clone())
            .with_fanout_concurrency(config.defaults.fanout_concurrency)
            .with_notifier(Arc::new(HttpNotifier::new(&config.notify)?))
            .with_observer(observer);
        if let Some(graph) = &graph {
            coordinator = coordinator.with_graph(graph.clone());
        }

        let engine = Arc::new(LocalEngine::new(Arc::new(coordinator)));
        let service = Self::new(store, engine.clone(), RiskAssessor::new(reasoning), graph).with_polling(
            Duration::from_millis(config.defaults.poll_interval_ms),
            Duration::from_secs(config.defaults.poll_timeout_secs),
        );
        Ok((service, engine))
    }

    pub fn store(&self) -> &FactStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Store the text under a fresh transaction id and trigger a run.
    #[instrument(skip_all, fields(wait = options.wait))]
    pub async fn submit(&self, text: &str, options: SubmitOptions) -> Result<Submission> {
        let txn = TransactionId::generate();
        let descriptor = self.submit_as(txn.clone(), text, options.callback_url).await?;
        if !options.wait {
            return Ok(Submission::Triggered(descriptor));
        }
        self.wait_for(&txn).await.map(Submission::Completed)
    }

    async fn submit_as(&self, txn: TransactionId, text: &str, callback_url: Option<String>) -> Result<RunDescriptor> {
        if text.trim().is_empty() {
            return Err(AmlFlowError::validation("transaction text is empty"));
        }

        self.store.ensure_namespace(&txn)?;
        self.store.put_text(&txn, RootFact::Transaction, text)?;

        let request = RunRequest::for_transaction(txn.clone()).with_callback(callback_url);
        let handle = self.engine.trigger(request).await?;

        self.registry.record(
            &txn,
            RegistryEntry::new(TransactionState::Submitted).with_run(&handle.pipeline_id, &handle.run_id),
        );
        let meta = RunMetadata::new(&txn, &handle.pipeline_id, &handle.run_id, TransactionState::Submitted);
        if let Err(e) = self.store.put_json(&txn, &RootFact::Metadata.into(), &meta) {
            warn!(transaction_id = %txn, error = %e, "failed to write run metadata");
        }

        info!(transaction_id = %txn, run_id = %handle.run_id, "transaction submitted");
        Ok(RunDescriptor {
            transaction_id: txn.to_string(),
            pipeline_id: handle.pipeline_id,
            run_id: handle.run_id,
            status: TransactionState::Submitted,
            risk_score: None,
        })
    }

    /// Poll the status resolver until the run is terminal or the poll timeout
    /// expires. The run itself keeps going after a timeout.
    pub async fn wait_for(&self, txn: &TransactionId) -> Result<RiskAssessment> {
        let deadline = Instant::now() + self.poll_timeout;
        loop {
            match self.resolver.resolve(txn).await {
                Ok(ResolvedStatus {
                    status: TransactionState::Completed,
                    risk_assessment: Some(assessment),
                    ..
                }) => return Ok(assessment),
                Ok(ResolvedStatus {
                    status: TransactionState::Failed,
                    ..
                }) => {
                    return Err(AmlFlowError::Engine(format!("pipeline run for {txn} failed")));
                }
                Ok(_) | Err(AmlFlowError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(AmlFlowError::Timeout(format!(
                    "transaction {txn} not finished after {}s",
                    self.poll_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Submit every item of a batch. One item failing never aborts the rest.
    ///
    /// With `options.wait`, every triggered item is then polled to a terminal
    /// state; a failed or timed-out run is recorded against its index.
    #[instrument(skip_all, fields(format = %format, wait = options.wait))]
    pub async fn bulk(&self, content: &str, format: BulkFormat, options: SubmitOptions) -> Result<BulkSummary> {
        let items = bulk::parse_batch(content, format)?;
        let mut summary = BulkSummary {
            total: items.len(),
            ..Default::default()
        };

        let mut triggered = Vec::new();
        for (index, text) in items.iter().enumerate() {
            let txn = TransactionId::generate_bulk(index);
            match self.submit_as(txn.clone(), text, options.callback_url.clone()).await {
                Ok(descriptor) => triggered.push((index, txn, descriptor)),
                Err(e) => {
                    warn!(index, error = %e, "bulk item failed");
                    summary.push_err(index, Some(&txn), &e);
                }
            }
        }

        for (index, txn, mut descriptor) in triggered {
            if !options.wait {
                summary.push_ok(descriptor);
                continue;
            }
            match self.wait_for(&txn).await {
                Ok(assessment) => {
                    descriptor.status = TransactionState::Completed;
                    descriptor.risk_score = Some(assessment.risk_score);
                    summary.push_ok(descriptor);
                }
                Err(e) => {
                    warn!(index, transaction_id = %txn, error = %e, "bulk item did not complete");
                    summary.push_err(index, Some(&txn), &e);
                }
            }
        }

        summary.failures.sort_by_key(|f| f.index);
        info!(total = summary.total, processed = summary.processed, failed = summary.failed, "bulk submission done");
        Ok(summary)
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub async fn status(&self, txn: &TransactionId) -> Result<ResolvedStatus> {
        self.resolver.resolve(txn).await
    }

    /// Record a completion report from the engine for `path_id`.
    #[instrument(skip_all, fields(transaction_id = path_id, status = %payload.status))]
    pub fn receive_callback(&self, path_id: &str, payload: CallbackPayload) -> Result<()> {
        let txn: TransactionId = path_id.parse()?;
        if payload.transaction_id != txn.as_str() {
            return Err(AmlFlowError::validation(format!(
                "callback transaction id {:?} does not match {txn}",
                payload.transaction_id
            )));
        }

        self.registry.record(
            &txn,
            RegistryEntry::new(payload.status)
                .with_run(&payload.pipeline_id, &payload.run_id)
                .with_result_path(payload.result_path.clone()),
        );
        if self.store.exists(&txn) {
            let mut meta = RunMetadata::new(&txn, payload.pipeline_id, payload.run_id, payload.status);
            meta.result_path = payload.result_path;
            self.store.put_json(&txn, &RootFact::Metadata.into(), &meta)?;
        } else {
            warn!("callback for a transaction without a namespace");
        }
        info!("callback recorded");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    /// Risk buckets over every stored and legacy assessment.
    pub fn dashboard(&self) -> Result<Dashboard> {
        let mut seen = HashSet::new();
        let mut assessments = Vec::new();
        for txn in self.store.list()? {
            if let Some(ra) = self.stored_assessment(&txn) {
                seen.insert(txn.to_string());
                assessments.push(ra);
            }
        }
        for legacy in self.store.legacy_results()? {
            let Some(ra) = legacy.assessment else { continue };
            let id = if ra.transaction_id.is_empty() {
                legacy.run_name.clone()
            } else {
                ra.transaction_id.clone()
            };
            if seen.insert(id) {
                assessments.push(ra);
            }
        }
        Ok(reporting::build_dashboard(&assessments))
    }

    pub fn list_transactions(&self, query: &ListQuery) -> Result<TransactionPage> {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for txn in self.store.list()? {
            seen.insert(txn.to_string());
            items.push(self.summarize(&txn));
        }
        for legacy in self.store.legacy_results()? {
            let Some(ra) = legacy.assessment else { continue };
            let id = if ra.transaction_id.is_empty() {
                legacy.run_name
            } else {
                ra.transaction_id.clone()
            };
            if seen.insert(id.clone()) {
                items.push(TransactionSummary {
                    transaction_id: id,
                    status: TransactionState::Completed,
                    timestamp: Some(ra.timestamp),
                    risk_score: Some(ra.risk_score),
                });
            }
        }
        reporting::paginate(items, query)
    }

    /// Status from local views only; never queries the engine.
    fn summarize(&self, txn: &TransactionId) -> TransactionSummary {
        if let Some(ra) = self.stored_assessment(txn) {
            return TransactionSummary {
                transaction_id: txn.to_string(),
                status: TransactionState::Completed,
                timestamp: Some(ra.timestamp),
                risk_score: Some(ra.risk_score),
            };
        }
        let meta: Option<RunMetadata> = self
            .store
            .get_json(txn, &RootFact::Metadata.into())
            .unwrap_or_else(|e| {
                warn!(transaction_id = %txn, error = %e, "unreadable metadata fact");
                None
            });
        let registry = self.registry.get(txn);
        let status = registry
            .as_ref()
            .map(|e| e.status)
            .or(meta.as_ref().map(|m| m.status))
            .unwrap_or(TransactionState::Submitted);
        TransactionSummary {
            transaction_id: txn.to_string(),
            status,
            timestamp: meta.map(|m| m.timestamp).or(registry.map(|e| e.timestamp)),
            risk_score: None,
        }
    }

    fn stored_assessment(&self, txn: &TransactionId) -> Option<RiskAssessment> {
        self.store
            .get_json(txn, &RootFact::RiskAssessment.into())
            .unwrap_or_else(|e| {
                warn!(transaction_id = %txn, error = %e, "unreadable risk assessment fact");
                None
            })
    }

    // -----------------------------------------------------------------------
    // Browse
    // -----------------------------------------------------------------------

    pub fn tree(&self, txn: &TransactionId) -> Result<TreeNode> {
        self.store.tree(txn)
    }

    pub fn file(&self, txn: &TransactionId, relative: &str) -> Result<FileView> {
        self.store.read_file(txn, relative)
    }

    pub fn migrate(&self, txn: &TransactionId) -> Result<MigrationReport> {
        self.store.try_migrate(txn)
    }

    // -----------------------------------------------------------------------
    // Graph
    // -----------------------------------------------------------------------

    fn graph(&self) -> Result<&Arc<dyn EntityGraph>> {
        self.graph
            .as_ref()
            .ok_or_else(|| AmlFlowError::Storage("graph store unavailable".into()))
    }

    pub async fn entity_history(&self, name: &str, kind: Option<EntityKind>) -> Result<Option<EntityHistory>> {
        self.graph()?.entity_history(name, kind).await
    }

    /// History of every extracted entity of `txn`.
    ///
    /// Served from the `entity_history` fact when it holds anything;
    /// otherwise the graph store is queried and the answer stored.
    #[instrument(skip_all, fields(transaction_id = %txn))]
    pub async fn transaction_history(&self, txn: &TransactionId) -> Result<serde_json::Value> {
        let entities: ExtractedEntities = self
            .store
            .get_json(txn, &RootFact::Entities.into())?
            .ok_or_else(|| AmlFlowError::NotFound(format!("no entities found for transaction {txn}")))?;

        if let Some(stored) = self
            .store
            .get(txn, &RootFact::EntityHistory.into())?
            .filter(|h| !is_blank(h))
        {
            debug!("entity history served from store");
            return Ok(stored);
        }

        let found = self.graph()?.entities_history(&entities).await?;
        let history = serde_json::to_value(&found)
            .map_err(|e| AmlFlowError::parse(format!("entity history of {txn}: {e}")))?;
        self.store.put(txn, &RootFact::EntityHistory.into(), &history)?;
        info!(entities = found.len(), "entity history stored");
        Ok(history)
    }

    pub async fn network(&self, txn: &TransactionId, depth: u32) -> Result<Network> {
        self.graph()?.network(txn.as_str(), depth).await
    }

    /// Rebuild the assessment document from stored facts and assess again.
    #[instrument(skip_all, fields(transaction_id = %txn))]
    pub async fn reassess(&self, txn: &TransactionId) -> Result<RiskAssessment> {
        let doc = assembler::from_store(&self.store, txn)?;
        let (assessment, cause) = self.assessor.assess_or_degrade(txn, &doc).await;
        if cause.is_some() {
            warn!("re-assessment degraded");
        }
        self.store.put_json(txn, &RootFact::AssessmentData.into(), &doc)?;
        self.store.put_json(txn, &RootFact::RiskAssessment.into(), &assessment)?;
        self.registry.record(txn, RegistryEntry::new(TransactionState::Completed));
        Ok(assessment)
    }
}
