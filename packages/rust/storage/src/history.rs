//! Entity history: every transaction an entity took part in, with risk aggregates.

use std::collections::BTreeMap;

use libsql::params;
use serde::Serialize;
use tracing::debug;

use amlflow_shared::{EntityKey, EntityKind, ExtractedEntities, Result};

use crate::{GraphStore, storage_err};

/// One transaction an entity was involved in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRef {
    pub transaction_id: String,
    pub role: String,
    pub risk_score: f64,
    pub confidence_score: f64,
    pub recorded_at: String,
}

/// A person ↔ organization association seen from either side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Relation {
    pub name: String,
    pub kind: EntityKind,
    pub role: String,
    pub since: String,
}

/// History of one entity node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    pub name: String,
    pub kind: EntityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub first_seen: String,
    pub last_seen: String,
    pub transactions: Vec<TransactionRef>,
    pub transaction_count: usize,
    pub avg_risk_score: Option<f64>,
    pub max_risk_score: Option<f64>,
    /// Lowest non-zero risk score.
    pub min_risk_score: Option<f64>,
    pub related: Vec<Relation>,
}

/// Organization and person records sharing one normalized name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityHistory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<EntityRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person: Option<EntityRecord>,
}

impl EntityHistory {
    pub fn is_empty(&self) -> bool {
        self.organization.is_none() && self.person.is_none()
    }

    /// Total transactions across both records.
    pub fn transaction_count(&self) -> usize {
        self.organization.as_ref().map_or(0, |r| r.transaction_count)
            + self.person.as_ref().map_or(0, |r| r.transaction_count)
    }
}

impl GraphStore {
    /// History of the entity named `name`. With `kind` unset, both the
    /// organization and the person of that name are looked up.
    pub async fn entity_history(
        &self,
        name: &str,
        kind: Option<EntityKind>,
    ) -> Result<Option<EntityHistory>> {
        let key = EntityKey::from_name(name);
        if key.is_empty() {
            return Ok(None);
        }

        let mut history = EntityHistory::default();
        if kind != Some(EntityKind::Person) {
            history.organization = self.entity_record(EntityKind::Organization, &key).await?;
        }
        if kind != Some(EntityKind::Organization) {
            history.person = self.entity_record(EntityKind::Person, &key).await?;
        }

        Ok((!history.is_empty()).then_some(history))
    }

    /// Histories for every extracted entity that has been seen before, keyed
    /// by the name as extracted.
    pub async fn entities_history(
        &self,
        entities: &ExtractedEntities,
    ) -> Result<BTreeMap<String, EntityHistory>> {
        let mut out: BTreeMap<String, EntityHistory> = BTreeMap::new();

        for org in &entities.organizations {
            if let Some(h) = self.entity_history(&org.name, Some(EntityKind::Organization)).await? {
                out.entry(org.name.clone()).or_default().organization = h.organization;
            }
        }
        for person in &entities.people {
            if let Some(h) = self.entity_history(&person.name, Some(EntityKind::Person)).await? {
                out.entry(person.name.clone()).or_default().person = h.person;
            }
        }

        debug!(
            requested = entities.organizations.len() + entities.people.len(),
            known = out.len(),
            "entity histories loaded"
        );
        Ok(out)
    }

    async fn entity_record(&self, kind: EntityKind, key: &EntityKey) -> Result<Option<EntityRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT name, entity_type, region, first_seen, last_seen
                 FROM entities WHERE kind = ?1 AND key = ?2",
                params![kind.as_str(), key.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let Some(row) = rows.next().await.map_err(storage_err)? else {
            return Ok(None);
        };

        let name: String = row.get(0).map_err(storage_err)?;
        let entity_type: Option<String> = row.get(1).ok();
        let region: Option<String> = row.get(2).ok();
        let first_seen: String = row.get(3).map_err(storage_err)?;
        let last_seen: String = row.get(4).map_err(storage_err)?;

        let transactions = self.transactions_of(kind, key).await?;
        let related = self.relations_of(kind, key).await?;

        let scores: Vec<f64> = transactions.iter().map(|t| t.risk_score).collect();
        let avg_risk_score =
            (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64);
        let max_risk_score = scores.iter().copied().reduce(f64::max);
        let min_risk_score = scores.iter().copied().filter(|s| *s > 0.0).reduce(f64::min);

        Ok(Some(EntityRecord {
            name,
            kind,
            entity_type,
            region,
            first_seen,
            last_seen,
            transaction_count: transactions.len(),
            transactions,
            avg_risk_score,
            max_risk_score,
            min_risk_score,
            related,
        }))
    }

    async fn transactions_of(&self, kind: EntityKind, key: &EntityKey) -> Result<Vec<TransactionRef>> {
        // One row per transaction; multiple roles collapse into a comma list.
        let mut rows = self
            .conn
            .query(
                "SELECT t.id, GROUP_CONCAT(i.role, ','), t.risk_score, t.confidence_score, t.recorded_at
                 FROM involvements i JOIN transactions t ON t.id = i.transaction_id
                 WHERE i.kind = ?1 AND i.key = ?2
                 GROUP BY t.id
                 ORDER BY t.recorded_at DESC, t.id",
                params![kind.as_str(), key.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            out.push(TransactionRef {
                transaction_id: row.get(0).map_err(storage_err)?,
                role: row.get::<String>(1).unwrap_or_default(),
                risk_score: row.get(2).map_err(storage_err)?,
                confidence_score: row.get(3).map_err(storage_err)?,
                recorded_at: row.get(4).map_err(storage_err)?,
            });
        }
        Ok(out)
    }

    async fn relations_of(&self, kind: EntityKind, key: &EntityKey) -> Result<Vec<Relation>> {
        let (sql, other_kind) = match kind {
            EntityKind::Person => (
                "SELECT e.name, a.role, a.since
                 FROM associations a JOIN entities e ON e.kind = 'organization' AND e.key = a.org_key
                 WHERE a.person_key = ?1
                 ORDER BY e.name",
                EntityKind::Organization,
            ),
            EntityKind::Organization => (
                "SELECT e.name, a.role, a.since
                 FROM associations a JOIN entities e ON e.kind = 'person' AND e.key = a.person_key
                 WHERE a.org_key = ?1
                 ORDER BY e.name",
                EntityKind::Person,
            ),
        };

        let mut rows = self
            .conn
            .query(sql, params![key.as_str()])
            .await
            .map_err(storage_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            out.push(Relation {
                name: row.get(0).map_err(storage_err)?,
                kind: other_kind,
                role: row.get(1).map_err(storage_err)?,
                since: row.get(2).map_err(storage_err)?,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::tests::{assessment, entities, test_store};
    use amlflow_shared::{EntityKind, Person};

    #[tokio::test]
    async fn history_aggregates_across_transactions() {
        let store = test_store().await;
        let ents = entities(&[("Acme Shell Ltd", "sender")], &[]);
        store.record_transaction(&assessment("txn_a", 0.2), &ents, &[]).await.expect("a");
        store.record_transaction(&assessment("txn_b", 0.8), &ents, &[]).await.expect("b");
        store.record_transaction(&assessment("txn_c", 0.0), &ents, &[]).await.expect("c");

        let history = store
            .entity_history("ACME  shell ltd", None)
            .await
            .expect("query")
            .expect("known");
        assert!(history.person.is_none());
        let org = history.organization.expect("org");
        assert_eq!(org.name, "Acme Shell Ltd");
        assert_eq!(org.transaction_count, 3);
        assert_eq!(org.max_risk_score, Some(0.8));
        assert_eq!(org.min_risk_score, Some(0.2), "zero scores are ignored for the minimum");
        let avg = org.avg_risk_score.expect("avg");
        assert!((avg - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(org.region.as_deref(), Some("Cayman Islands"));
        assert_eq!(org.entity_type.as_deref(), Some("shell_company"));
    }

    #[tokio::test]
    async fn unknown_entity_has_no_history() {
        let store = test_store().await;
        assert!(store.entity_history("Nobody Inc", None).await.expect("query").is_none());
        assert!(store.entity_history("   ", None).await.expect("query").is_none());
    }

    #[tokio::test]
    async fn discovered_people_become_related_entities() {
        let store = test_store().await;
        let ents = entities(&[("Acme Shell Ltd", "sender")], &[]);
        let discovered = vec![Person {
            name: "John Founder".into(),
            role: "founder".into(),
            source: Some("wikidata".into()),
            entity_connection: Some("Acme Shell Ltd".into()),
            ..Default::default()
        }];
        store
            .record_transaction(&assessment("txn_d", 0.6), &ents, &discovered)
            .await
            .expect("record");

        let org = store
            .entity_history("acme shell ltd", Some(EntityKind::Organization))
            .await
            .expect("query")
            .and_then(|h| h.organization)
            .expect("org");
        assert_eq!(org.related.len(), 1);
        assert_eq!(org.related[0].name, "John Founder");
        assert_eq!(org.related[0].role, "founder");

        // The discovered person exists as a node without transactions of its own.
        let person = store
            .entity_history("john founder", Some(EntityKind::Person))
            .await
            .expect("query")
            .and_then(|h| h.person)
            .expect("person");
        assert_eq!(person.transaction_count, 0);
        assert_eq!(person.related[0].name, "Acme Shell Ltd");
    }

    #[tokio::test]
    async fn entities_history_is_keyed_by_extracted_name() {
        let store = test_store().await;
        let first = entities(&[("Acme Shell Ltd", "sender")], &[("Jane Doe", "beneficiary")]);
        store.record_transaction(&assessment("txn_e", 0.5), &first, &[]).await.expect("record");

        let next = entities(&[("ACME Shell Ltd", "recipient"), ("Fresh Corp", "sender")], &[("Jane Doe", "sender")]);
        let map = store.entities_history(&next).await.expect("histories");
        assert_eq!(map.len(), 2);
        assert!(map["ACME Shell Ltd"].organization.is_some());
        assert!(map["Jane Doe"].person.is_some());
        assert!(!map.contains_key("Fresh Corp"));
        assert_eq!(map["Jane Doe"].transaction_count(), 1);
    }
}
