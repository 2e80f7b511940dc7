//! Assessment document assembly.
//!
//! The document handed to the reasoning service gathers every fact of a run.
//! It can be built from the results passed along the pipeline or rebuilt
//! from the fact store after a restart; both paths produce the same document
//! for the same facts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use amlflow_enrichment::EntityEnrichment;
use amlflow_factstore::{Category, FactStore, RootFact, ScannedResult};
use amlflow_shared::{
    AmlFlowError, EnrichmentResult, EntityKey, ExtractedEntities, Person, Result, TransactionId,
};

/// Enrichment results for one entity, keyed by provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityFacts {
    pub name: String,
    /// Organization a discovered person was found through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_connection: Option<String>,
    #[serde(default)]
    pub results: BTreeMap<String, EnrichmentResult>,
}

/// Everything the reasoning service sees about one transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssessmentDocument {
    pub transaction_id: String,
    pub transaction_text: String,
    pub extracted_entities: ExtractedEntities,
    /// Prior appearances of extracted entities, keyed by name.
    #[serde(default)]
    pub entity_history: serde_json::Value,
    /// Keyed by entity key.
    #[serde(default)]
    pub organizations: BTreeMap<String, EntityFacts>,
    #[serde(default)]
    pub people: BTreeMap<String, EntityFacts>,
    #[serde(default)]
    pub discovered_people: BTreeMap<String, EntityFacts>,
}

impl AssessmentDocument {
    /// Total number of provider results in the document.
    pub fn result_count(&self) -> usize {
        [&self.organizations, &self.people, &self.discovered_people]
            .iter()
            .flat_map(|m| m.values())
            .map(|f| f.results.len())
            .sum()
    }

    /// `(entity name, provider)` of every failed lookup.
    pub fn failed_lookups(&self) -> Vec<(String, String)> {
        [&self.organizations, &self.people, &self.discovered_people]
            .iter()
            .flat_map(|m| m.values())
            .flat_map(|f| {
                f.results
                    .iter()
                    .filter(|(_, r)| r.status == amlflow_shared::EnrichmentStatus::Failed)
                    .map(|(provider, _)| (f.name.clone(), provider.clone()))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// From pipeline results
// ---------------------------------------------------------------------------

/// Branch outputs available at the join. Missing branches stay empty.
#[derive(Debug, Clone, Default)]
pub struct FlowResults {
    pub transaction_text: String,
    pub entities: ExtractedEntities,
    pub entity_history: serde_json::Value,
    pub organizations: Vec<EntityEnrichment>,
    pub people: Vec<EntityEnrichment>,
    /// People selected for the discovery round.
    pub discovered_people: Vec<Person>,
    pub discovered: Vec<EntityEnrichment>,
}

/// Build the document from results handed along the pipeline.
pub fn from_flow(txn: &TransactionId, flow: &FlowResults) -> AssessmentDocument {
    let connections = connections(&flow.discovered_people);
    let discovered = flow
        .discovered
        .iter()
        .map(|e| {
            let mut facts = facts_of(e);
            facts.entity_connection = connections.get(&e.key).cloned().flatten();
            (e.key.to_string(), facts)
        })
        .collect();

    AssessmentDocument {
        transaction_id: txn.to_string(),
        transaction_text: flow.transaction_text.clone(),
        extracted_entities: flow.entities.clone(),
        entity_history: normalize_history(flow.entity_history.clone()),
        organizations: flow.organizations.iter().map(|e| (e.key.to_string(), facts_of(e))).collect(),
        people: flow.people.iter().map(|e| (e.key.to_string(), facts_of(e))).collect(),
        discovered_people: discovered,
    }
}

fn facts_of(enrichment: &EntityEnrichment) -> EntityFacts {
    EntityFacts {
        name: enrichment.name.clone(),
        entity_connection: None,
        results: enrichment
            .results
            .iter()
            .map(|r| (r.provider.clone(), r.result.clone()))
            .collect(),
    }
}

fn connections(people: &[Person]) -> BTreeMap<EntityKey, Option<String>> {
    people
        .iter()
        .map(|p| (EntityKey::from_name(&p.name), p.entity_connection.clone()))
        .collect()
}

fn normalize_history(history: serde_json::Value) -> serde_json::Value {
    if history.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        history
    }
}

// ---------------------------------------------------------------------------
// From the fact store
// ---------------------------------------------------------------------------

/// Rebuild the document purely from persisted facts.
///
/// Requires the `entities` fact; everything else may be absent.
#[instrument(skip_all, fields(transaction_id = %txn))]
pub fn from_store(store: &FactStore, txn: &TransactionId) -> Result<AssessmentDocument> {
    let entities: ExtractedEntities = store
        .get_json(txn, &RootFact::Entities.into())?
        .ok_or_else(|| AmlFlowError::NotFound(format!("no extracted entities for {txn}")))?;
    let transaction_text = store.get_text(txn, RootFact::Transaction)?.unwrap_or_default();
    let entity_history = store
        .get(txn, &RootFact::EntityHistory.into())?
        .unwrap_or(serde_json::Value::Null);
    let discovered_people: Vec<Person> = store
        .get_json(txn, &RootFact::DiscoveredPeople.into())?
        .unwrap_or_default();

    let org_names: BTreeMap<EntityKey, String> = entities
        .organizations
        .iter()
        .map(|o| (EntityKey::from_name(&o.name), o.name.clone()))
        .collect();
    let person_names: BTreeMap<EntityKey, String> = entities
        .people
        .iter()
        .map(|p| (EntityKey::from_name(&p.name), p.name.clone()))
        .collect();
    let discovered_names: BTreeMap<EntityKey, &Person> = discovered_people
        .iter()
        .map(|p| (EntityKey::from_name(&p.name), p))
        .collect();

    let mut doc = AssessmentDocument {
        transaction_id: txn.to_string(),
        transaction_text,
        extracted_entities: entities.clone(),
        entity_history: normalize_history(entity_history),
        ..Default::default()
    };

    for scanned in store.scan_category(txn, Category::OrganizationResults)? {
        let name = org_names.get(&scanned.entity_key).cloned();
        insert(&mut doc.organizations, scanned, name, None);
    }
    for scanned in store.scan_category(txn, Category::PeopleResults)? {
        if let Some(name) = person_names.get(&scanned.entity_key) {
            let name = Some(name.clone());
            insert(&mut doc.people, scanned, name, None);
        } else {
            let person = discovered_names.get(&scanned.entity_key);
            let name = person.map(|p| p.name.clone());
            let connection = person.and_then(|p| p.entity_connection.clone());
            insert(&mut doc.discovered_people, scanned, name, connection);
        }
    }

    debug!(results = doc.result_count(), "assessment document rebuilt from store");
    Ok(doc)
}

fn insert(
    map: &mut BTreeMap<String, EntityFacts>,
    scanned: ScannedResult,
    name: Option<String>,
    connection: Option<String>,
) {
    let facts = map
        .entry(scanned.entity_key.to_string())
        .or_insert_with(|| EntityFacts {
            name: name.unwrap_or_else(|| scanned.entity_key.to_string()),
            entity_connection: connection,
            results: BTreeMap::new(),
        });
    facts.results.insert(scanned.provider, scanned.result);
}
