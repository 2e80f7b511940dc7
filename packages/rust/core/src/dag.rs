//! Stage graph and the in-process scheduler that walks it.
//!
//! Every stage declares its dependencies and a [`JoinPolicy`]. The scheduler
//! runs all ready stages of a wave concurrently, skips stages whose
//! dependencies did not succeed (unless their policy says to run anyway),
//! and aborts the remainder of the run when a fatal stage fails.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Stage model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    HistoryLookup,
    OrgFanOut,
    PersonFanOut,
    DiscoveryFanOut,
    Join,
    Assess,
    PersistKnowledgeBase,
    PersistGraph,
    Notify,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::HistoryLookup => "history_lookup",
            Self::OrgFanOut => "org_fan_out",
            Self::PersonFanOut => "person_fan_out",
            Self::DiscoveryFanOut => "discovery_fan_out",
            Self::Join => "join",
            Self::Assess => "assess",
            Self::PersistKnowledgeBase => "persist_knowledge_base",
            Self::PersistGraph => "persist_graph",
            Self::Notify => "notify",
        }
    }

    /// Human-readable label for progress output.
    pub fn label(self) -> &'static str {
        match self {
            Self::Extract => "Extracting entities",
            Self::HistoryLookup => "Looking up entity history",
            Self::OrgFanOut => "Enriching organizations",
            Self::PersonFanOut => "Enriching people",
            Self::DiscoveryFanOut => "Enriching discovered people",
            Self::Join => "Assembling assessment document",
            Self::Assess => "Assessing risk",
            Self::PersistKnowledgeBase => "Organizing knowledge base",
            Self::PersistGraph => "Recording in graph store",
            Self::Notify => "Sending notification",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a stage may run relative to its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPolicy {
    /// Every dependency must have succeeded (degraded counts as success).
    RequireAllSuccess,
    /// Run once every dependency has finished, whatever the outcome.
    RunRegardless,
}

/// Final status of one stage in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    /// Finished, but with a fallback substituted for some of its output.
    Degraded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Satisfies a [`JoinPolicy::RequireAllSuccess`] dependency.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Succeeded | Self::Degraded)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StageSpec {
    pub stage: Stage,
    pub depends_on: &'static [Stage],
    pub policy: JoinPolicy,
    /// A failure aborts every stage that has not started yet.
    pub fatal: bool,
}

/// The assessment pipeline, in dependency order.
pub const PIPELINE: &[StageSpec] = &[
    StageSpec {
        stage: Stage::Extract,
        depends_on: &[],
        policy: JoinPolicy::RequireAllSuccess,
        fatal: true,
    },
    StageSpec {
        stage: Stage::HistoryLookup,
        depends_on: &[Stage::Extract],
        policy: JoinPolicy::RequireAllSuccess,
        fatal: false,
    },
    StageSpec {
        stage: Stage::OrgFanOut,
        depends_on: &[Stage::Extract, Stage::HistoryLookup],
        policy: JoinPolicy::RequireAllSuccess,
        fatal: false,
    },
    StageSpec {
        stage: Stage::PersonFanOut,
        depends_on: &[Stage::Extract, Stage::HistoryLookup],
        policy: JoinPolicy::RequireAllSuccess,
        fatal: false,
    },
    StageSpec {
        stage: Stage::DiscoveryFanOut,
        depends_on: &[Stage::OrgFanOut],
        policy: JoinPolicy::RequireAllSuccess,
        fatal: false,
    },
    StageSpec {
        stage: Stage::Join,
        depends_on: &[
            Stage::HistoryLookup,
            Stage::OrgFanOut,
            Stage::PersonFanOut,
            Stage::DiscoveryFanOut,
        ],
        policy: JoinPolicy::RunRegardless,
        fatal: false,
    },
    StageSpec {
        stage: Stage::Assess,
        depends_on: &[Stage::Join],
        policy: JoinPolicy::RequireAllSuccess,
        fatal: false,
    },
    StageSpec {
        stage: Stage::PersistKnowledgeBase,
        depends_on: &[Stage::Assess],
        policy: JoinPolicy::RequireAllSuccess,
        fatal: false,
    },
    StageSpec {
        stage: Stage::PersistGraph,
        depends_on: &[Stage::Assess],
        policy: JoinPolicy::RequireAllSuccess,
        fatal: false,
    },
    StageSpec {
        stage: Stage::Notify,
        depends_on: &[Stage::PersistKnowledgeBase, Stage::PersistGraph],
        policy: JoinPolicy::RunRegardless,
        fatal: false,
    },
];

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Some dependency has not finished.
    Waiting,
    Run,
    /// Dependencies finished but the policy is not satisfied.
    Skip,
}

/// Whether `spec` can run given the statuses of finished stages.
pub fn readiness(spec: &StageSpec, finished: &BTreeMap<Stage, StageStatus>) -> Readiness {
    let mut deps = Vec::with_capacity(spec.depends_on.len());
    for dep in spec.depends_on {
        match finished.get(dep) {
            Some(status) => deps.push(*status),
            None => return Readiness::Waiting,
        }
    }
    match spec.policy {
        JoinPolicy::RunRegardless => Readiness::Run,
        JoinPolicy::RequireAllSuccess if deps.iter().all(|s| s.is_ok()) => Readiness::Run,
        JoinPolicy::RequireAllSuccess => Readiness::Skip,
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// What a stage body reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub status: StageStatus,
    pub detail: Option<String>,
}

impl StageResult {
    pub fn succeeded() -> Self {
        Self {
            status: StageStatus::Succeeded,
            detail: None,
        }
    }

    pub fn degraded(detail: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Degraded,
            detail: Some(detail.into()),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failed,
            detail: Some(detail.into()),
        }
    }

    pub fn skipped(detail: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Skipped,
            detail: Some(detail.into()),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Recorded outcome of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: Stage,
    pub status: StageStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Executes stage bodies on behalf of the scheduler.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run_stage(&self, stage: Stage) -> StageResult;

    /// Called before a stage body starts.
    fn stage_started(&self, _stage: Stage) {}

    /// Called once per stage, including skipped ones.
    fn stage_finished(&self, _outcome: &StageOutcome) {}
}

/// Walk `specs` to completion. Outcomes are returned in `specs` order.
pub async fn execute(specs: &[StageSpec], runner: &dyn StageRunner) -> Vec<StageOutcome> {
    let mut finished: BTreeMap<Stage, StageStatus> = BTreeMap::new();
    let mut outcomes: BTreeMap<Stage, StageOutcome> = BTreeMap::new();
    let mut aborted: Option<Stage> = None;

    loop {
        let mut ready: Vec<&StageSpec> = Vec::new();
        let mut progressed = false;

        let pending: Vec<&StageSpec> = specs
            .iter()
            .filter(|s| !finished.contains_key(&s.stage))
            .collect();
        for spec in pending {
            let skip = match (aborted, readiness(spec, &finished)) {
                (Some(cause), _) => Some(format!("aborted after {cause} failed")),
                (None, Readiness::Skip) => Some("upstream stage did not succeed".to_string()),
                (None, Readiness::Run) => {
                    ready.push(spec);
                    None
                }
                (None, Readiness::Waiting) => None,
            };
            if let Some(reason) = skip {
                let result = StageResult::skipped(reason);
                record(&mut finished, &mut outcomes, runner, spec.stage, result, Duration::ZERO);
                progressed = true;
            }
        }

        if ready.is_empty() {
            if progressed {
                continue;
            }
            break;
        }

        let wave = ready.iter().map(|spec| async move {
            runner.stage_started(spec.stage);
            let start = Instant::now();
            let result = runner.run_stage(spec.stage).await;
            (*spec, result, start.elapsed())
        });
        for (spec, result, elapsed) in join_all(wave).await {
            if spec.fatal && result.status == StageStatus::Failed {
                warn!(stage = %spec.stage, detail = ?result.detail, "fatal stage failed, aborting run");
                aborted = Some(spec.stage);
            }
            record(&mut finished, &mut outcomes, runner, spec.stage, result, elapsed);
        }
    }

    // A stage whose dependencies can never finish (unknown dependency) is reported as skipped.
    let stranded: Vec<Stage> = specs
        .iter()
        .map(|s| s.stage)
        .filter(|stage| !finished.contains_key(stage))
        .collect();
    for stage in stranded {
        let result = StageResult::skipped("unsatisfiable dependency");
        record(&mut finished, &mut outcomes, runner, stage, result, Duration::ZERO);
    }

    specs
        .iter()
        .filter_map(|s| outcomes.remove(&s.stage))
        .collect()
}

fn record(
    finished: &mut BTreeMap<Stage, StageStatus>,
    outcomes: &mut BTreeMap<Stage, StageOutcome>,
    runner: &dyn StageRunner,
    stage: Stage,
    result: StageResult,
    elapsed: Duration,
) {
    debug!(%stage, status = ?result.status, "stage finished");
    let outcome = StageOutcome {
        stage,
        status: result.status,
        duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        detail: result.detail,
    };
    runner.stage_finished(&outcome);
    finished.insert(stage, outcome.status);
    outcomes.insert(stage, outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Returns scripted results (success by default) and records start order.
    #[derive(Default)]
    struct Scripted {
        results: HashMap<Stage, StageResult>,
        started: Mutex<Vec<Stage>>,
    }

    impl Scripted {
        fn with(mut self, stage: Stage, result: StageResult) -> Self {
            self.results.insert(stage, result);
            self
        }

        fn started(&self) -> Vec<Stage> {
            self.started.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl StageRunner for Scripted {
        async fn run_stage(&self, stage: Stage) -> StageResult {
            self.results.get(&stage).cloned().unwrap_or_else(StageResult::succeeded)
        }

        fn stage_started(&self, stage: Stage) {
            self.started.lock().expect("lock").push(stage);
        }
    }

    fn status_of(outcomes: &[StageOutcome], stage: Stage) -> StageStatus {
        outcomes
            .iter()
            .find(|o| o.stage == stage)
            .map(|o| o.status)
            .expect("stage outcome present")
    }

    #[test]
    fn pipeline_is_topologically_ordered() {
        for (i, spec) in PIPELINE.iter().enumerate() {
            for dep in spec.depends_on {
                let pos = PIPELINE.iter().position(|s| s.stage == *dep).expect("dependency declared");
                assert!(pos < i, "{} depends on later stage {}", spec.stage, dep);
            }
        }
    }

    #[test]
    fn readiness_follows_policy() {
        let join = PIPELINE.iter().find(|s| s.stage == Stage::Join).expect("join");
        let assess = PIPELINE.iter().find(|s| s.stage == Stage::Assess).expect("assess");

        let mut finished = BTreeMap::new();
        finished.insert(Stage::HistoryLookup, StageStatus::Degraded);
        finished.insert(Stage::OrgFanOut, StageStatus::Failed);
        finished.insert(Stage::PersonFanOut, StageStatus::Succeeded);
        assert_eq!(readiness(join, &finished), Readiness::Waiting);

        finished.insert(Stage::DiscoveryFanOut, StageStatus::Skipped);
        assert_eq!(readiness(join, &finished), Readiness::Run);

        finished.insert(Stage::Join, StageStatus::Failed);
        assert_eq!(readiness(assess, &finished), Readiness::Skip);
        finished.insert(Stage::Join, StageStatus::Degraded);
        assert_eq!(readiness(assess, &finished), Readiness::Run);
    }

    #[tokio::test]
    async fn happy_path_runs_every_stage() {
        let runner = Scripted::default();
        let outcomes = execute(PIPELINE, &runner).await;

        assert_eq!(outcomes.len(), PIPELINE.len());
        assert!(outcomes.iter().all(|o| o.status == StageStatus::Succeeded));
        let started = runner.started();
        assert_eq!(started.first(), Some(&Stage::Extract));
        assert_eq!(started.last(), Some(&Stage::Notify));
    }

    #[tokio::test]
    async fn tolerant_join_runs_after_branch_failure() {
        let runner = Scripted::default().with(Stage::OrgFanOut, StageResult::failed("boom"));
        let outcomes = execute(PIPELINE, &runner).await;

        assert_eq!(status_of(&outcomes, Stage::DiscoveryFanOut), StageStatus::Skipped);
        assert_eq!(status_of(&outcomes, Stage::Join), StageStatus::Succeeded);
        assert_eq!(status_of(&outcomes, Stage::Assess), StageStatus::Succeeded);
        assert_eq!(status_of(&outcomes, Stage::Notify), StageStatus::Succeeded);
    }

    #[tokio::test]
    async fn notify_runs_when_persistence_fails() {
        let runner = Scripted::default()
            .with(Stage::PersistGraph, StageResult::failed("db locked"))
            .with(Stage::PersistKnowledgeBase, StageResult::failed("disk full"));
        let outcomes = execute(PIPELINE, &runner).await;
        assert_eq!(status_of(&outcomes, Stage::Notify), StageStatus::Succeeded);
    }

    #[tokio::test]
    async fn fatal_failure_aborts_everything_else() {
        let runner = Scripted::default().with(Stage::Extract, StageResult::failed("no text"));
        let outcomes = execute(PIPELINE, &runner).await;

        assert_eq!(runner.started(), vec![Stage::Extract]);
        assert_eq!(status_of(&outcomes, Stage::Extract), StageStatus::Failed);
        for o in outcomes.iter().filter(|o| o.stage != Stage::Extract) {
            assert_eq!(o.status, StageStatus::Skipped, "{}", o.stage);
        }
        let join = outcomes.iter().find(|o| o.stage == Stage::Join).expect("join");
        assert!(join.detail.as_deref().unwrap_or("").contains("extract"));
    }

    #[tokio::test]
    async fn unknown_dependency_is_skipped_not_hung() {
        const ORPHAN: &[StageSpec] = &[StageSpec {
            stage: Stage::Notify,
            depends_on: &[Stage::Assess],
            policy: JoinPolicy::RunRegardless,
            fatal: false,
        }];
        let outcomes = execute(ORPHAN, &Scripted::default()).await;
        assert_eq!(outcomes[0].status, StageStatus::Skipped);
    }
}
