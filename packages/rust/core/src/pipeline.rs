//! Pipeline coordinator: extraction → fan-out → discovery → join → assess →
//! persist → notify.
//!
//! Stage ordering and join policies live in [`crate::dag`]; this module holds
//! the stage bodies. Every fact a stage produces is written to the fact store
//! as it is produced, so a run can be inspected (or re-assessed) mid-flight.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use amlflow_enrichment::{AdapterRegistry, EntityEnrichment, Subject, TransactionContext};
use amlflow_factstore::{FactStore, PhysicalLayout, RootFact, resolve};
use amlflow_shared::{Person, Result, RiskAssessment, TransactionId, TransactionState};

use crate::assembler::{self, AssessmentDocument, FlowResults};
use crate::assessment::RiskAssessor;
use crate::dag::{self, PIPELINE, Stage, StageOutcome, StageResult, StageRunner};
use crate::dedup::Deduplicator;
use crate::extraction::EntityExtractor;
use crate::graph::EntityGraph;
use crate::notify::{CompletionNotice, Notifier};
use crate::reasoning::ReasoningService;

/// Pipeline identifier reported to the engine and in run metadata.
pub const PIPELINE_ID: &str = "aml_risk_assessment";

const DEFAULT_FANOUT_CONCURRENCY: usize = 4;

/// One requested run of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub transaction_id: TransactionId,
    pub pipeline_id: String,
    pub run_id: String,
    pub callback_url: Option<String>,
}

impl RunRequest {
    /// A run of the assessment pipeline whose run id is the transaction id.
    pub fn for_transaction(transaction_id: TransactionId) -> Self {
        Self {
            run_id: transaction_id.to_string(),
            transaction_id,
            pipeline_id: PIPELINE_ID.to_string(),
            callback_url: None,
        }
    }

    pub fn with_callback(mut self, url: Option<String>) -> Self {
        self.callback_url = url;
        self
    }
}

/// The `pipeline_run` fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub transaction_id: String,
    pub pipeline_id: String,
    pub run_id: String,
    /// `completed` when a risk assessment was produced, `failed` otherwise.
    pub status: TransactionState,
    pub started_at: String,
    pub finished_at: String,
    pub stages: Vec<StageOutcome>,
}

impl RunReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages.iter().find(|o| o.stage == stage)
    }

    pub fn is_success(&self) -> bool {
        self.status == TransactionState::Completed
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for pipeline runs.
pub trait PipelineObserver: Send + Sync {
    /// Called when a stage body starts.
    fn stage_started(&self, txn: &TransactionId, stage: Stage);
    /// Called once per stage, including skipped ones.
    fn stage_finished(&self, txn: &TransactionId, outcome: &StageOutcome);
    /// Called when the run report has been written.
    fn run_finished(&self, report: &RunReport);
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl PipelineObserver for SilentObserver {
    fn stage_started(&self, _txn: &TransactionId, _stage: Stage) {}
    fn stage_finished(&self, _txn: &TransactionId, _outcome: &StageOutcome) {}
    fn run_finished(&self, _report: &RunReport) {}
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    store: FactStore,
    adapters: Arc<AdapterRegistry>,
    extractor: EntityExtractor,
    assessor: RiskAssessor,
    graph: Option<Arc<dyn EntityGraph>>,
    notifier: Option<Arc<dyn Notifier>>,
    fanout_concurrency: usize,
    observer: Arc<dyn PipelineObserver>,
}

impl Coordinator {
    pub fn new(store: FactStore, adapters: Arc<AdapterRegistry>, reasoning: Arc<dyn ReasoningService>) -> Self {
        Self {
            store,
            adapters,
            extractor: EntityExtractor::new(reasoning.clone()),
            assessor: RiskAssessor::new(reasoning),
            graph: None,
            notifier: None,
            fanout_concurrency: DEFAULT_FANOUT_CONCURRENCY,
            observer: Arc::new(SilentObserver),
        }
    }

    pub fn with_graph(mut self, graph: Arc<dyn EntityGraph>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Entities enriched at once within a fan-out stage (minimum 1).
    pub fn with_fanout_concurrency(mut self, n: usize) -> Self {
        self.fanout_concurrency = n.max(1);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn store(&self) -> &FactStore {
        &self.store
    }

    pub fn assessor(&self) -> &RiskAssessor {
        &self.assessor
    }

    /// Run every stage for `request.transaction_id` and write the run report.
    ///
    /// Only fails if the namespace cannot be created. Stage failures are
    /// recorded in the report; a failed extraction yields a `failed` report.
    #[instrument(skip_all, fields(transaction_id = %request.transaction_id, run_id = %request.run_id))]
    pub async fn run(&self, request: &RunRequest) -> Result<RunReport> {
        let txn = &request.transaction_id;
        let started_at = Utc::now().to_rfc3339();
        let start = Instant::now();
        self.store.ensure_namespace(txn)?;

        info!("starting pipeline run");

        let run = RunContext {
            coordinator: self,
            request,
            ctx: TransactionContext::new(txn.clone()),
            state: Mutex::new(FlowState::default()),
        };
        let stages = dag::execute(PIPELINE, &run).await;
        let assessed = run.state.lock().await.assessment.is_some();

        let report = RunReport {
            transaction_id: txn.to_string(),
            pipeline_id: request.pipeline_id.clone(),
            run_id: request.run_id.clone(),
            status: if assessed {
                TransactionState::Completed
            } else {
                TransactionState::Failed
            },
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            stages,
        };

        if let Err(e) = self.store.put_json(txn, &RootFact::PipelineRun.into(), &report) {
            warn!(error = %e, "failed to write run report");
        }
        info!(
            status = %report.status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "pipeline run finished"
        );
        self.observer.run_finished(&report);
        Ok(report)
    }

    /// Enrich `subjects` in batches of `fanout_concurrency`.
    async fn enrich_all(&self, subjects: &[Subject], ctx: &TransactionContext) -> Vec<EntityEnrichment> {
        let mut out = Vec::with_capacity(subjects.len());
        for batch in subjects.chunks(self.fanout_concurrency) {
            let lookups = batch.iter().map(|s| self.adapters.enrich(&self.store, s, ctx));
            out.extend(join_all(lookups).await);
        }
        out
    }
}

/// Branch outputs accumulated over a run.
#[derive(Default)]
struct FlowState {
    flow: FlowResults,
    extracted: bool,
    document: Option<AssessmentDocument>,
    assessment: Option<RiskAssessment>,
}

struct RunContext<'a> {
    coordinator: &'a Coordinator,
    request: &'a RunRequest,
    ctx: TransactionContext,
    state: Mutex<FlowState>,
}

#[async_trait]
impl StageRunner for RunContext<'_> {
    async fn run_stage(&self, stage: Stage) -> StageResult {
        match stage {
            Stage::Extract => self.extract().await,
            Stage::HistoryLookup => self.history_lookup().await,
            Stage::OrgFanOut => self.org_fan_out().await,
            Stage::PersonFanOut => self.person_fan_out().await,
            Stage::DiscoveryFanOut => self.discovery_fan_out().await,
            Stage::Join => self.join().await,
            Stage::Assess => self.assess().await,
            Stage::PersistKnowledgeBase => self.persist_knowledge_base(),
            Stage::PersistGraph => self.persist_graph().await,
            Stage::Notify => self.notify().await,
        }
    }

    fn stage_started(&self, stage: Stage) {
        info!(%stage, "stage started");
        self.coordinator.observer.stage_started(self.txn(), stage);
    }

    fn stage_finished(&self, outcome: &StageOutcome) {
        self.coordinator.observer.stage_finished(self.txn(), outcome);
    }
}

impl RunContext<'_> {
    fn txn(&self) -> &TransactionId {
        &self.request.transaction_id
    }

    fn store(&self) -> &FactStore {
        &self.coordinator.store
    }

    fn write_error(&self, stage: Stage, cause: &str) {
        let doc = json!({
            "transaction_id": self.txn().as_str(),
            "stage": stage.as_str(),
            "error": cause,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.store().put(self.txn(), &RootFact::Error.into(), &doc) {
            warn!(error = %e, "failed to write error fact");
        }
    }

    // --- Stage 1: extraction (fatal) ---

    async fn extract(&self) -> StageResult {
        let text = match self.store().get_text(self.txn(), RootFact::Transaction) {
            Ok(Some(text)) if !text.trim().is_empty() => text,
            Ok(_) => return StageResult::failed("transaction text not found"),
            Err(e) => return StageResult::failed(e.to_string()),
        };

        let entities = match self.coordinator.extractor.extract(self.txn(), &text).await {
            Ok(entities) => entities,
            Err(e) => {
                let cause = e.to_string();
                self.write_error(Stage::Extract, &cause);
                return StageResult::failed(cause);
            }
        };

        if let Err(e) = self.store().put_json(self.txn(), &RootFact::Entities.into(), &entities) {
            let cause = format!("failed to persist entities: {e}");
            self.write_error(Stage::Extract, &cause);
            return StageResult::failed(cause);
        }

        let detail = format!(
            "{} organizations, {} people",
            entities.organizations.len(),
            entities.people.len()
        );
        let mut state = self.state.lock().await;
        state.flow.transaction_text = text;
        state.flow.entities = entities;
        state.extracted = true;
        StageResult::succeeded().with_detail(detail)
    }

    // --- Stage 2: history (best-effort) ---

    async fn history_lookup(&self) -> StageResult {
        let entities = self.state.lock().await.flow.entities.clone();

        let (history, result) = match &self.coordinator.graph {
            None => (json!({}), StageResult::degraded("graph store unavailable")),
            Some(graph) => match graph.entities_history(&entities).await {
                Ok(found) => {
                    let detail = format!("{} entities seen before", found.len());
                    match serde_json::to_value(&found) {
                        Ok(value) => (value, StageResult::succeeded().with_detail(detail)),
                        Err(e) => (json!({}), StageResult::degraded(e.to_string())),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "entity history lookup failed");
                    (json!({}), StageResult::degraded(e.to_string()))
                }
            },
        };

        if let Err(e) = self.store().put(self.txn(), &RootFact::EntityHistory.into(), &history) {
            warn!(error = %e, "failed to write entity history");
        }
        self.state.lock().await.flow.entity_history = history;
        result
    }

    // --- Stage 3: per-entity fan-out ---

    async fn org_fan_out(&self) -> StageResult {
        let subjects: Vec<Subject> = {
            let state = self.state.lock().await;
            state
                .flow
                .entities
                .organizations
                .iter()
                .map(|o| Subject::organization(&o.name, o.jurisdiction.clone()))
                .collect()
        };
        let results = self.coordinator.enrich_all(&subjects, &self.ctx).await;
        let result = fan_out_result(&results);
        self.state.lock().await.flow.organizations = results;
        result
    }

    async fn person_fan_out(&self) -> StageResult {
        let subjects: Vec<Subject> = {
            let state = self.state.lock().await;
            state
                .flow
                .entities
                .people
                .iter()
                .map(|p| Subject::person(&p.name, p.country.clone()))
                .collect()
        };
        let results = self.coordinator.enrich_all(&subjects, &self.ctx).await;
        let result = fan_out_result(&results);
        self.state.lock().await.flow.people = results;
        result
    }

    // --- Stage 4: discovery round ---

    async fn discovery_fan_out(&self) -> StageResult {
        let delta: Vec<Person> = {
            let state = self.state.lock().await;
            let surfaced: Vec<Person> = state
                .flow
                .organizations
                .iter()
                .flat_map(EntityEnrichment::discovered)
                .collect();
            Deduplicator::from_extraction(&state.flow.entities).next_round(&surfaced)
        };

        if let Err(e) = self.store().put_json(self.txn(), &RootFact::DiscoveredPeople.into(), &delta) {
            warn!(error = %e, "failed to write discovered people");
        }
        info!(discovered = delta.len(), "discovery round computed");

        if delta.is_empty() {
            return StageResult::succeeded().with_detail("no new people discovered");
        }

        let subjects: Vec<Subject> = delta
            .iter()
            .map(|p| Subject::person(&p.name, p.country.clone()))
            .collect();
        let results = self.coordinator.enrich_all(&subjects, &self.ctx).await;
        let result = fan_out_result(&results);

        let mut state = self.state.lock().await;
        state.flow.discovered_people = delta;
        state.flow.discovered = results;
        result
    }

    // --- Stage 5: tolerant join ---

    async fn join(&self) -> StageResult {
        let mut state = self.state.lock().await;
        let doc = assembler::from_flow(self.txn(), &state.flow);

        if let Err(e) = self.store().put_json(self.txn(), &RootFact::AssessmentData.into(), &doc) {
            warn!(error = %e, "failed to write assessment document");
        }
        let result = if state.extracted {
            StageResult::succeeded().with_detail(format!("{} provider results", doc.result_count()))
        } else {
            StageResult::degraded("no extracted entities")
        };
        state.document = Some(doc);
        result
    }

    // --- Stage 6: assessment (degrades, never fails outwardly) ---

    async fn assess(&self) -> StageResult {
        let doc = {
            let state = self.state.lock().await;
            state
                .document
                .clone()
                .unwrap_or_else(|| assembler::from_flow(self.txn(), &state.flow))
        };

        let (assessment, cause) = self.coordinator.assessor.assess_or_degrade(self.txn(), &doc).await;
        if let Some(cause) = &cause {
            self.write_error(Stage::Assess, cause);
        }

        let written = self
            .store()
            .put_json(self.txn(), &RootFact::RiskAssessment.into(), &assessment);
        let score = assessment.risk_score;
        self.state.lock().await.assessment = Some(assessment);

        match (written, cause) {
            (Err(e), _) => StageResult::failed(format!("failed to persist risk assessment: {e}")),
            (Ok(_), Some(cause)) => StageResult::degraded(cause),
            (Ok(_), None) => StageResult::succeeded().with_detail(format!("risk score {score:.2}")),
        }
    }

    // --- Stage 7: persistence (independent, non-fatal) ---

    fn persist_knowledge_base(&self) -> StageResult {
        match self.store().try_migrate(self.txn()) {
            Ok(report) if report.is_success() => StageResult::succeeded().with_detail(format!(
                "{} moved, {} superseded",
                report.moved.len(),
                report.superseded.len()
            )),
            Ok(report) => StageResult::failed(format!("{} documents not migrated", report.failed.len())),
            Err(e) => StageResult::failed(e.to_string()),
        }
    }

    async fn persist_graph(&self) -> StageResult {
        let Some(graph) = &self.coordinator.graph else {
            return StageResult::skipped("no graph store configured");
        };
        let (assessment, entities, discovered) = {
            let state = self.state.lock().await;
            let Some(assessment) = state.assessment.clone() else {
                return StageResult::skipped("no risk assessment to record");
            };
            (assessment, state.flow.entities.clone(), state.flow.discovered_people.clone())
        };

        match graph.record(&assessment, &entities, &discovered).await {
            Ok(()) => StageResult::succeeded(),
            Err(e) => {
                warn!(error = %e, "graph store write failed");
                StageResult::failed(e.to_string())
            }
        }
    }

    // --- Stage 8: notification (runs regardless) ---

    async fn notify(&self) -> StageResult {
        let Some(url) = self.request.callback_url.as_deref() else {
            info!("no callback address supplied");
            return StageResult::succeeded().with_detail("no callback address");
        };
        let Some(notifier) = &self.coordinator.notifier else {
            return StageResult::skipped("no notifier configured");
        };

        let assessment = self.state.lock().await.assessment.clone();
        let result_path = assessment.as_ref().map(|_| {
            self.store()
                .namespace_dir(self.txn())
                .join(resolve(&RootFact::RiskAssessment.into(), PhysicalLayout::Versioned))
                .display()
                .to_string()
        });
        let notice = CompletionNotice {
            transaction_id: self.txn().to_string(),
            pipeline_id: self.request.pipeline_id.clone(),
            run_id: self.request.run_id.clone(),
            status: if assessment.is_some() {
                TransactionState::Completed
            } else {
                TransactionState::Failed
            },
            result_path,
            risk_assessment: assessment,
        };

        match notifier.notify(url, &notice).await {
            Ok(()) => StageResult::succeeded(),
            Err(e) => {
                warn!(error = %e, "callback delivery failed");
                StageResult::failed(e.to_string())
            }
        }
    }
}

fn fan_out_result(results: &[EntityEnrichment]) -> StageResult {
    let lookups: usize = results.iter().map(|e| e.results.len()).sum();
    let failed: usize = results.iter().map(|e| e.failed_providers().len()).sum();
    if failed == 0 {
        StageResult::succeeded().with_detail(format!("{} entities, {lookups} lookups", results.len()))
    } else {
        StageResult::degraded(format!(
            "{failed} of {lookups} lookups failed across {} entities",
            results.len()
        ))
    }
}
