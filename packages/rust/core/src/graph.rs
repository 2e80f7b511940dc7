//! Cross-transaction entity graph seam.

use std::collections::BTreeMap;

use async_trait::async_trait;

use amlflow_shared::{EntityKind, ExtractedEntities, Person, Result, RiskAssessment};
use amlflow_storage::{EntityHistory, GraphStore, Network};

/// Entity history and network queries plus the per-run write.
#[async_trait]
pub trait EntityGraph: Send + Sync {
    async fn entities_history(&self, entities: &ExtractedEntities) -> Result<BTreeMap<String, EntityHistory>>;

    async fn record(
        &self,
        assessment: &RiskAssessment,
        entities: &ExtractedEntities,
        discovered: &[Person],
    ) -> Result<()>;

    async fn entity_history(&self, name: &str, kind: Option<EntityKind>) -> Result<Option<EntityHistory>>;

    async fn network(&self, transaction_id: &str, depth: u32) -> Result<Network>;
}

#[async_trait]
impl EntityGraph for GraphStore {
    async fn entities_history(&self, entities: &ExtractedEntities) -> Result<BTreeMap<String, EntityHistory>> {
        GraphStore::entities_history(self, entities).await
    }

    async fn record(
        &self,
        assessment: &RiskAssessment,
        entities: &ExtractedEntities,
        discovered: &[Person],
    ) -> Result<()> {
        self.record_transaction(assessment, entities, discovered).await
    }

    async fn entity_history(&self, name: &str, kind: Option<EntityKind>) -> Result<Option<EntityHistory>> {
        GraphStore::entity_history(self, name, kind).await
    }

    async fn network(&self, transaction_id: &str, depth: u32) -> Result<Network> {
        GraphStore::network(self, transaction_id, depth).await
    }
}
