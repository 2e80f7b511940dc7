//! Embedded libSQL entity graph (offline mode).
//!
//! The [`GraphStore`] records every assessed transaction together with the
//! organizations and people involved in it, so later transactions can look up
//! an entity's history and a transaction's neighborhood.
//!
//! Nodes are transactions and entities (merged by normalized [`EntityKey`]);
//! edges are `INVOLVED_IN` (entity → transaction, labelled with the role) and
//! `ASSOCIATED_WITH` (person → organization, from discovery).

mod history;
mod migrations;
mod network;

use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use amlflow_shared::{
    AmlFlowError, EntityKey, EntityKind, ExtractedEntities, Person, Result, RiskAssessment,
};

pub use history::{EntityHistory, EntityRecord, Relation, TransactionRef};
pub use network::{MAX_NETWORK_DEPTH, Network, NetworkLink, NetworkNode, node_type_counts};

/// Primary graph handle wrapping a libSQL database.
pub struct GraphStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    /// Serializes multi-statement writes on the shared connection.
    write_lock: Mutex<()>,
}

impl GraphStore {
    /// Open or create a database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AmlFlowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| AmlFlowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| AmlFlowError::Storage(e.to_string()))?;

        let store = Self {
            db,
            conn,
            write_lock: Mutex::new(()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        AmlFlowError::Storage(format!("migration v{} failed: {e}", migration.version))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Record an assessed transaction with its entities and discovered associations.
    ///
    /// Re-recording the same transaction updates its scores and adds any new
    /// edges; existing edges are kept.
    #[instrument(skip_all, fields(transaction_id = %assessment.transaction_id))]
    pub async fn record_transaction(
        &self,
        assessment: &RiskAssessment,
        entities: &ExtractedEntities,
        discovered: &[Person],
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let txn_id = assessment.transaction_id.as_str();

        let tx = self.conn.transaction().await.map_err(storage_err)?;

        tx.execute(
            "INSERT INTO transactions (id, recorded_at, risk_score, confidence_score, reason)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
               recorded_at = excluded.recorded_at,
               risk_score = excluded.risk_score,
               confidence_score = excluded.confidence_score,
               reason = excluded.reason",
            params![
                txn_id,
                now.as_str(),
                assessment.risk_score,
                assessment.confidence_score,
                assessment.reason.as_str()
            ],
        )
        .await
        .map_err(storage_err)?;

        for org in entities.organizations.iter().filter(|o| !o.name.trim().is_empty()) {
            let key = EntityKey::from_name(&org.name);
            upsert_entity(
                &tx,
                EntityKind::Organization,
                &key,
                &org.name,
                org.entity_type.as_deref(),
                org.jurisdiction.as_deref(),
                &now,
            )
            .await?;
            insert_involvement(&tx, txn_id, EntityKind::Organization, &key, role_or_unknown(&org.role)).await?;
        }

        for person in entities.people.iter().filter(|p| !p.name.trim().is_empty()) {
            let key = EntityKey::from_name(&person.name);
            upsert_entity(&tx, EntityKind::Person, &key, &person.name, None, person.country.as_deref(), &now)
                .await?;
            insert_involvement(&tx, txn_id, EntityKind::Person, &key, role_or_unknown(&person.role)).await?;
        }

        let mut associations = 0usize;
        for person in discovered.iter().filter(|p| !p.name.trim().is_empty()) {
            let Some(org_name) = person.entity_connection.as_deref() else {
                continue;
            };
            let person_key = EntityKey::from_name(&person.name);
            let org_key = EntityKey::from_name(org_name);
            upsert_entity(&tx, EntityKind::Person, &person_key, &person.name, None, person.country.as_deref(), &now)
                .await?;
            upsert_entity(&tx, EntityKind::Organization, &org_key, org_name, None, None, &now).await?;
            let role = if person.role.is_empty() { "associated" } else { person.role.as_str() };
            tx.execute(
                "INSERT OR IGNORE INTO associations (person_key, org_key, role, since)
                 VALUES (?1, ?2, ?3, ?4)",
                params![person_key.as_str(), org_key.as_str(), role, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
            associations += 1;
        }

        tx.commit().await.map_err(storage_err)?;

        debug!(
            organizations = entities.organizations.len(),
            people = entities.people.len(),
            associations,
            "transaction recorded in graph"
        );
        Ok(())
    }

    /// Whether `transaction_id` has been recorded.
    pub async fn has_transaction(&self, transaction_id: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM transactions WHERE id = ?1", params![transaction_id])
            .await
            .map_err(storage_err)?;
        Ok(matches!(rows.next().await, Ok(Some(_))))
    }
}

fn role_or_unknown(role: &str) -> &str {
    if role.trim().is_empty() { "unknown" } else { role }
}

/// Merge an entity node: create with `first_seen`, refresh `last_seen` and
/// fill in attributes that were previously unknown.
async fn upsert_entity(
    conn: &Connection,
    kind: EntityKind,
    key: &EntityKey,
    name: &str,
    entity_type: Option<&str>,
    region: Option<&str>,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO entities (kind, key, name, entity_type, region, first_seen, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(kind, key) DO UPDATE SET
           last_seen = excluded.last_seen,
           entity_type = COALESCE(excluded.entity_type, entities.entity_type),
           region = COALESCE(NULLIF(excluded.region, ''), entities.region)",
        params![kind.as_str(), key.as_str(), name, entity_type, region, now],
    )
    .await
    .map_err(storage_err)?;
    Ok(())
}

async fn insert_involvement(
    conn: &Connection,
    transaction_id: &str,
    kind: EntityKind,
    key: &EntityKey,
    role: &str,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO involvements (transaction_id, kind, key, role)
         VALUES (?1, ?2, ?3, ?4)",
        params![transaction_id, kind.as_str(), key.as_str(), role],
    )
    .await
    .map_err(storage_err)?;
    Ok(())
}

pub(crate) fn storage_err(e: libsql::Error) -> AmlFlowError {
    AmlFlowError::Storage(e.to_string())
}

pub(crate) fn parse_kind(s: &str) -> Option<EntityKind> {
    match s {
        "organization" => Some(EntityKind::Organization),
        "person" => Some(EntityKind::Person),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use amlflow_shared::Organization;
    use uuid::Uuid;

    /// Create a temp file graph store for testing.
    pub(crate) async fn test_store() -> GraphStore {
        let tmp = std::env::temp_dir().join(format!("amlflow_graph_test_{}.db", Uuid::now_v7()));
        GraphStore::open(&tmp).await.expect("open test db")
    }

    pub(crate) fn assessment(id: &str, risk: f64) -> RiskAssessment {
        RiskAssessment {
            transaction_id: id.into(),
            risk_score: risk,
            confidence_score: 0.8,
            extracted_entities: vec![],
            entity_types: vec![],
            supporting_evidence: vec![],
            reason: "test".into(),
            timestamp: Utc::now().to_rfc3339(),
            error: None,
        }
    }

    pub(crate) fn entities(orgs: &[(&str, &str)], people: &[(&str, &str)]) -> ExtractedEntities {
        ExtractedEntities {
            organizations: orgs
                .iter()
                .map(|(name, role)| Organization {
                    name: (*name).into(),
                    role: (*role).into(),
                    jurisdiction: Some("Cayman Islands".into()),
                    entity_type: Some("shell_company".into()),
                })
                .collect(),
            people: people
                .iter()
                .map(|(name, role)| Person {
                    name: (*name).into(),
                    role: (*role).into(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let store = test_store().await;
        assert_eq!(store.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("amlflow_graph_test_{}.db", Uuid::now_v7()));
        let first = GraphStore::open(&tmp).await.expect("first open");
        drop(first);
        let second = GraphStore::open(&tmp).await.expect("second open");
        assert_eq!(second.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn record_is_repeatable() {
        let store = test_store().await;
        let ents = entities(&[("Acme Shell Ltd", "sender")], &[("Jane PEP", "beneficiary")]);

        store
            .record_transaction(&assessment("txn_1", 0.4), &ents, &[])
            .await
            .expect("first record");
        store
            .record_transaction(&assessment("txn_1", 0.9), &ents, &[])
            .await
            .expect("second record");

        assert!(store.has_transaction("txn_1").await.expect("query"));
        assert!(!store.has_transaction("txn_2").await.expect("query"));

        let history = store
            .entity_history("acme shell ltd", Some(EntityKind::Organization))
            .await
            .expect("history")
            .expect("found");
        let org = history.organization.expect("organization");
        assert_eq!(org.transaction_count, 1);
        assert_eq!(org.max_risk_score, Some(0.9));
    }
}
