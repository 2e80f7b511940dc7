//! Pipeline coordination and service logic for amlflow.
//!
//! This crate ties together extraction, enrichment fan-out, discovery,
//! assessment, and persistence into one run per transaction, and exposes the
//! submission/status/reporting surface through [`AmlService`].

pub mod assembler;
pub mod assessment;
pub mod bulk;
pub mod dag;
pub mod dedup;
pub mod engine;
pub mod extraction;
pub mod graph;
pub mod notify;
pub mod pipeline;
pub mod reasoning;
pub mod registry;
pub mod reporting;
pub mod resolver;
pub mod service;

pub use assembler::{AssessmentDocument, EntityFacts, FlowResults};
pub use assessment::RiskAssessor;
pub use bulk::{BulkFailure, BulkFailureKind, BulkFormat, BulkSummary};
pub use dag::{JoinPolicy, PIPELINE, Stage, StageOutcome, StageStatus};
pub use dedup::Deduplicator;
pub use engine::{LocalEngine, RunHandle, RunState, WorkflowEngine};
pub use extraction::EntityExtractor;
pub use graph::EntityGraph;
pub use notify::{CompletionNotice, HttpNotifier, Notifier};
pub use pipeline::{Coordinator, PIPELINE_ID, PipelineObserver, RunReport, RunRequest, SilentObserver};
pub use reasoning::{ChatCompletionsClient, KeyScheduler, ReasoningRequest, ReasoningService};
pub use registry::{RegistryEntry, RunRegistry};
pub use reporting::{Dashboard, ListQuery, RecentTransaction, RiskLevel, TransactionPage, TransactionSummary};
pub use resolver::{ResolvedStatus, StatusResolver, StatusSource};
pub use service::{AmlService, CallbackPayload, RunDescriptor, SubmitOptions, Submission};
