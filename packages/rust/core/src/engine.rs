//! Workflow engine seam and the in-process engine that runs the coordinator
//! on the tokio runtime.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use amlflow_factstore::RootFact;
use amlflow_shared::{AmlFlowError, Result, TransactionId, TransactionState};

use crate::pipeline::{Coordinator, RunReport, RunRequest};

/// Run state as reported by a workflow engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Success,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    pub fn transaction_state(self) -> TransactionState {
        match self {
            Self::Queued => TransactionState::Submitted,
            Self::Running => TransactionState::Running,
            Self::Success => TransactionState::Completed,
            Self::Failed => TransactionState::Failed,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one triggered run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub pipeline_id: String,
    pub run_id: String,
}

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Start a run. Fails if a run with the same identifiers is still active.
    async fn trigger(&self, request: RunRequest) -> Result<RunHandle>;

    /// `Ok(None)` when the engine has never heard of the run.
    async fn run_state(&self, pipeline_id: &str, run_id: &str) -> Result<Option<RunState>>;
}

type RunKey = (String, String);

/// Engine that spawns each run as a tokio task.
pub struct LocalEngine {
    coordinator: Arc<Coordinator>,
    runs: Arc<RwLock<HashMap<RunKey, RunState>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalEngine {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            runs: Arc::new(RwLock::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Wait for every run triggered so far to finish.
    pub async fn wait_idle(&self) {
        let pending: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        for task in pending {
            if let Err(e) = task.await {
                error!(error = %e, "pipeline task panicked");
            }
        }
    }

    fn set_state(runs: &RwLock<HashMap<RunKey, RunState>>, key: &RunKey, state: RunState) {
        runs.write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), state);
    }

    /// State recovered from the `pipeline_run` fact of a previous process.
    fn persisted_state(&self, pipeline_id: &str, run_id: &str) -> Result<Option<RunState>> {
        let Ok(txn) = run_id.parse::<TransactionId>() else {
            return Ok(None);
        };
        let report: Option<RunReport> = self
            .coordinator
            .store()
            .get_json(&txn, &RootFact::PipelineRun.into())?;
        Ok(report
            .filter(|r| r.pipeline_id == pipeline_id && r.run_id == run_id)
            .map(|r| if r.is_success() { RunState::Success } else { RunState::Failed }))
    }
}

#[async_trait]
impl WorkflowEngine for LocalEngine {
    #[instrument(skip_all, fields(pipeline_id = %request.pipeline_id, run_id = %request.run_id))]
    async fn trigger(&self, request: RunRequest) -> Result<RunHandle> {
        let key: RunKey = (request.pipeline_id.clone(), request.run_id.clone());
        {
            let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
            if runs.get(&key).is_some_and(|s| s.is_active()) {
                return Err(AmlFlowError::Engine(format!(
                    "run {} of {} is already active",
                    request.run_id, request.pipeline_id
                )));
            }
            runs.insert(key.clone(), RunState::Queued);
        }

        let handle = RunHandle {
            pipeline_id: request.pipeline_id.clone(),
            run_id: request.run_id.clone(),
        };
        let coordinator = self.coordinator.clone();
        let runs = self.runs.clone();
        let transaction_id = request.transaction_id.clone();
        let task = tokio::spawn(async move {
            Self::set_state(&runs, &key, RunState::Running);
            // The run gets its own task so a panic surfaces as a JoinError here.
            let run = tokio::spawn(async move { coordinator.run(&request).await });
            let state = match run.await {
                Ok(Ok(report)) if report.is_success() => RunState::Success,
                Ok(Ok(_)) => RunState::Failed,
                Ok(Err(e)) => {
                    error!(transaction_id = %transaction_id, error = %e, "pipeline run failed to start");
                    RunState::Failed
                }
                Err(e) => {
                    error!(transaction_id = %transaction_id, error = %e, "pipeline run panicked");
                    RunState::Failed
                }
            };
            Self::set_state(&runs, &key, state);
        });
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }

        info!("run triggered");
        Ok(handle)
    }

    async fn run_state(&self, pipeline_id: &str, run_id: &str) -> Result<Option<RunState>> {
        let known = self
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(pipeline_id.to_string(), run_id.to_string()))
            .copied();
        match known {
            Some(state) => Ok(Some(state)),
            None => self.persisted_state(pipeline_id, run_id),
        }
    }
}
