//! The contract every enrichment provider satisfies.

use async_trait::async_trait;

use amlflow_shared::{Entity, EntityKey, EntityKind, EnrichmentResult, TransactionId};

/// The entity an adapter is asked about.
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub kind: EntityKind,
    pub name: String,
    pub key: EntityKey,
    /// Jurisdiction for organizations, country for people.
    pub region: Option<String>,
}

impl Subject {
    pub fn organization(name: impl Into<String>, jurisdiction: Option<String>) -> Self {
        let name = name.into();
        Self {
            kind: EntityKind::Organization,
            key: EntityKey::from_name(&name),
            name,
            region: jurisdiction,
        }
    }

    pub fn person(name: impl Into<String>, country: Option<String>) -> Self {
        let name = name.into();
        Self {
            kind: EntityKind::Person,
            key: EntityKey::from_name(&name),
            name,
            region: country,
        }
    }
}

impl From<&Entity> for Subject {
    fn from(entity: &Entity) -> Self {
        match entity {
            Entity::Organization(org) => Subject::organization(&org.name, org.jurisdiction.clone()),
            Entity::Person(person) => Subject::person(&person.name, person.country.clone()),
        }
    }
}

/// What an adapter may know about the transaction it works for.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    pub transaction_id: TransactionId,
}

impl TransactionContext {
    pub fn new(transaction_id: TransactionId) -> Self {
        Self { transaction_id }
    }
}

/// One enrichment provider.
///
/// Adapters report every failure in-result (`status = failed` with a reason)
/// and never return an error, so one provider cannot abort its siblings.
#[async_trait]
pub trait EnrichmentAdapter: Send + Sync {
    /// Provider name, used as the fact store path segment.
    fn provider(&self) -> &str;

    /// Whether this adapter handles entities of `kind`.
    fn supports(&self, kind: EntityKind) -> bool;

    async fn lookup(&self, subject: &Subject, ctx: &TransactionContext) -> EnrichmentResult;
}
