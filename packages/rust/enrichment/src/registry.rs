//! Adapter registry: runs every adapter for an entity and files the results.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use amlflow_factstore::{Category, FactStore, LogicalPath};
use amlflow_shared::{EnrichmentResult, EntityKey, EntityKind, Person, ProvidersConfig, Result};

use crate::adapter::{EnrichmentAdapter, Subject, TransactionContext};
use crate::providers::{
    CorporateRegistryAdapter, KnowledgeGraphAdapter, NewsAdapter, PepAdapter, SanctionsAdapter,
    http_client,
};

/// Outer bound on a single lookup, on top of the HTTP timeout.
const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(60);

/// One provider's answer about one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderResult {
    pub provider: String,
    pub result: EnrichmentResult,
}

/// Every provider's answer about one entity, in registration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityEnrichment {
    pub name: String,
    pub kind: EntityKind,
    pub key: EntityKey,
    pub results: Vec<ProviderResult>,
}

impl EntityEnrichment {
    /// People surfaced by any provider, in provider order then discovery order.
    pub fn discovered(&self) -> Vec<Person> {
        self.results
            .iter()
            .flat_map(|r| r.result.discovered_entities.iter().cloned())
            .collect()
    }

    pub fn failed_providers(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.result.status == amlflow_shared::EnrichmentStatus::Failed)
            .map(|r| r.provider.as_str())
            .collect()
    }
}

/// Holds registered adapters in invocation order.
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn EnrichmentAdapter>>,
    lookup_timeout: Duration,
}

impl AdapterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    /// Registry with the five built-in providers configured from `config`.
    pub fn with_builtin(config: &ProvidersConfig) -> Result<Self> {
        let client = http_client(config.timeout_secs)?;
        let mut registry = Self::new();
        registry.register(CorporateRegistryAdapter::new(client.clone(), config));
        registry.register(SanctionsAdapter::new(client.clone(), config));
        registry.register(KnowledgeGraphAdapter::new(client.clone(), config));
        registry.register(NewsAdapter::new(client, config));
        registry.register(PepAdapter::new(config));
        // Lookups include several sequential requests for the knowledge graph.
        registry.lookup_timeout = Duration::from_secs(config.timeout_secs.saturating_mul(4).max(1));
        Ok(registry)
    }

    pub fn register(&mut self, adapter: impl EnrichmentAdapter + 'static) {
        self.adapters.push(Arc::new(adapter));
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Providers that handle `kind`, in invocation order.
    pub fn providers_for(&self, kind: EntityKind) -> Vec<&str> {
        self.adapters
            .iter()
            .filter(|a| a.supports(kind))
            .map(|a| a.provider())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Run every adapter supporting `subject.kind` concurrently and write each
    /// result to `{category}/{provider}/{entityKey}`.
    ///
    /// Never fails: a lookup that times out or panics becomes a `failed`
    /// result, and a store write error is logged while the result is still
    /// returned.
    #[instrument(skip_all, fields(
        transaction_id = %ctx.transaction_id,
        entity_key = %subject.key,
        kind = %subject.kind,
    ))]
    pub async fn enrich(
        &self,
        store: &FactStore,
        subject: &Subject,
        ctx: &TransactionContext,
    ) -> EntityEnrichment {
        let adapters: Vec<&Arc<dyn EnrichmentAdapter>> =
            self.adapters.iter().filter(|a| a.supports(subject.kind)).collect();

        let lookups = adapters.iter().map(|adapter| async move {
            let lookup = tokio::time::timeout(self.lookup_timeout, adapter.lookup(subject, ctx));
            let result = match AssertUnwindSafe(lookup).catch_unwind().await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => EnrichmentResult::failed(format!(
                    "lookup timed out after {}s",
                    self.lookup_timeout.as_secs()
                )),
                Err(panic) => {
                    let cause = panic_message(panic.as_ref());
                    warn!(provider = %adapter.provider(), cause = %cause, "adapter panicked");
                    EnrichmentResult::failed(format!("lookup panicked: {cause}"))
                }
            };
            ProviderResult {
                provider: adapter.provider().to_string(),
                result,
            }
        });
        let results = join_all(lookups).await;

        let category = Category::for_kind(subject.kind);
        for r in &results {
            let path = LogicalPath::enrichment(category, &r.provider, &subject.key);
            if let Err(e) = store.put_json(&ctx.transaction_id, &path, &r.result) {
                warn!(provider = %r.provider, error = %e, "failed to store enrichment result");
            }
            debug!(provider = %r.provider, status = ?r.result.status, "enrichment result");
        }

        EntityEnrichment {
            name: subject.name.clone(),
            kind: subject.kind,
            key: subject.key.clone(),
            results,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use amlflow_shared::{EnrichmentStatus, TransactionId};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use uuid::Uuid;

    pub(crate) fn temp_store() -> (FactStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("amlflow-enrichment-test-{}", Uuid::now_v7()));
        (FactStore::open(&dir).expect("open store"), dir)
    }

    pub(crate) fn ctx(id: &str) -> TransactionContext {
        TransactionContext::new(id.parse::<TransactionId>().expect("valid id"))
    }

    struct Fixed {
        name: &'static str,
        kind: EntityKind,
        result: EnrichmentResult,
    }

    #[async_trait]
    impl EnrichmentAdapter for Fixed {
        fn provider(&self) -> &str {
            self.name
        }
        fn supports(&self, kind: EntityKind) -> bool {
            kind == self.kind
        }
        async fn lookup(&self, _: &Subject, _: &TransactionContext) -> EnrichmentResult {
            self.result.clone()
        }
    }

    struct Stuck;

    #[async_trait]
    impl EnrichmentAdapter for Stuck {
        fn provider(&self) -> &str {
            "stuck"
        }
        fn supports(&self, _: EntityKind) -> bool {
            true
        }
        async fn lookup(&self, _: &Subject, _: &TransactionContext) -> EnrichmentResult {
            tokio::time::sleep(Duration::from_secs(30)).await;
            EnrichmentResult::success(serde_json::json!({}))
        }
    }

    struct Broken;

    #[async_trait]
    impl EnrichmentAdapter for Broken {
        fn provider(&self) -> &str {
            "broken"
        }
        fn supports(&self, _: EntityKind) -> bool {
            true
        }
        async fn lookup(&self, _: &Subject, _: &TransactionContext) -> EnrichmentResult {
            panic!("malformed registry payload")
        }
    }

    fn person(name: &str) -> Person {
        Person {
            name: name.into(),
            role: "founder".into(),
            source: Some("wikidata".into()),
            entity_connection: Some("Acme Shell Ltd".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn failures_are_isolated_per_adapter() {
        let (store, dir) = temp_store();
        let mut registry = AdapterRegistry::new();
        registry.register(Fixed {
            name: "sanctions",
            kind: EntityKind::Organization,
            result: EnrichmentResult::success(serde_json::json!([{"id": "NK-1"}])),
        });
        registry.register(Fixed {
            name: "wikidata",
            kind: EntityKind::Organization,
            result: EnrichmentResult::failed("endpoint unreachable"),
        });
        registry.register(Fixed {
            name: "pep",
            kind: EntityKind::Person,
            result: EnrichmentResult::no_results("none"),
        });

        let ctx = ctx("txn_isolated");
        let subject = Subject::organization("Acme Shell Ltd", None);
        let out = registry.enrich(&store, &subject, &ctx).await;

        assert_eq!(out.results.len(), 2, "person-only adapter skipped");
        assert_eq!(out.results[0].provider, "sanctions");
        assert_eq!(out.failed_providers(), vec!["wikidata"]);

        // Both outcomes are filed, including the failure.
        let failed: EnrichmentResult = store
            .get_json(
                &ctx.transaction_id,
                &LogicalPath::enrichment(Category::OrganizationResults, "wikidata", &subject.key),
            )
            .expect("read")
            .expect("stored");
        assert_eq!(failed.status, EnrichmentStatus::Failed);
        assert_eq!(failed.reason.as_deref(), Some("endpoint unreachable"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn discovered_people_keep_provider_order() {
        let (store, dir) = temp_store();
        let mut registry = AdapterRegistry::new();
        registry.register(Fixed {
            name: "first",
            kind: EntityKind::Organization,
            result: EnrichmentResult::success(serde_json::json!({}))
                .with_discovered(vec![person("Ann"), person("Bob")]),
        });
        registry.register(Fixed {
            name: "second",
            kind: EntityKind::Organization,
            result: EnrichmentResult::success(serde_json::json!({})).with_discovered(vec![person("Cid")]),
        });

        let out = registry
            .enrich(&store, &Subject::organization("Acme Shell Ltd", None), &ctx("txn_order"))
            .await;
        let names: Vec<String> = out.discovered().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["Ann", "Bob", "Cid"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn slow_adapter_times_out_into_failed_result() {
        let (store, dir) = temp_store();
        let mut registry = AdapterRegistry::new().with_lookup_timeout(Duration::from_millis(50));
        registry.register(Stuck);

        let out = registry
            .enrich(&store, &Subject::person("Jane PEP", None), &ctx("txn_stuck"))
            .await;
        assert_eq!(out.results[0].result.status, EnrichmentStatus::Failed);
        assert!(out.results[0].result.reason.as_deref().unwrap_or("").contains("timed out"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn panicking_adapter_becomes_failed_result() {
        let (store, dir) = temp_store();
        let mut registry = AdapterRegistry::new();
        registry.register(Broken);
        registry.register(Fixed {
            name: "pep",
            kind: EntityKind::Person,
            result: EnrichmentResult::no_results("none"),
        });

        let out = registry
            .enrich(&store, &Subject::person("Jane PEP", None), &ctx("txn_broken"))
            .await;
        assert_eq!(out.results.len(), 2);
        assert_eq!(out.failed_providers(), vec!["broken"]);
        assert!(
            out.results[0]
                .result
                .reason
                .as_deref()
                .unwrap_or("")
                .contains("malformed registry payload")
        );
        assert_eq!(out.results[1].result.status, EnrichmentStatus::NoResults);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn builtin_registry_matches_category_table() {
        let registry = AdapterRegistry::with_builtin(&ProvidersConfig::default()).expect("registry");
        assert_eq!(
            registry.providers_for(EntityKind::Organization),
            Category::OrganizationResults.entry().providers.to_vec()
        );
        let mut people = registry.providers_for(EntityKind::Person);
        people.sort();
        let mut expected = Category::PeopleResults.entry().providers.to_vec();
        expected.sort();
        assert_eq!(people, expected);
    }
}
