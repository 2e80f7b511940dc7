//! Enrichment adapters for amlflow.
//!
//! Every provider implements [`EnrichmentAdapter`]. The [`AdapterRegistry`]
//! runs all adapters for an entity concurrently, isolates their failures, and
//! files each result in the fact store under `{category}/{provider}/{entityKey}`.

pub mod adapter;
pub mod providers;
pub mod registry;

pub use adapter::{EnrichmentAdapter, Subject, TransactionContext};
pub use providers::{
    CorporateRegistryAdapter, KnowledgeGraphAdapter, NewsAdapter, PepAdapter, PepRecord,
    SanctionsAdapter, http_client,
};
pub use registry::{AdapterRegistry, EntityEnrichment, ProviderResult};
