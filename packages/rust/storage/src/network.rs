//! Neighborhood of a transaction, shaped for graph visualizations.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use libsql::params;
use serde::Serialize;

use amlflow_shared::{EntityKind, Result};

use crate::{GraphStore, parse_kind, storage_err};

/// Requested depths are clamped to `1..=MAX_NETWORK_DEPTH`.
pub const MAX_NETWORK_DEPTH: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkNode {
    pub id: String,
    pub label: String,
    /// `transaction`, `organization` or `person`.
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct NetworkLink {
    pub source: String,
    pub target: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Network {
    pub nodes: Vec<NetworkNode>,
    pub links: Vec<NetworkLink>,
}

impl Network {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum NodeRef {
    Transaction(String),
    Entity(EntityKind, String),
}

impl NodeRef {
    fn id(&self) -> String {
        match self {
            NodeRef::Transaction(id) => id.clone(),
            NodeRef::Entity(kind, key) => format!("{kind}:{key}"),
        }
    }
}

impl GraphStore {
    /// Everything within `depth` hops of `transaction_id`. An unknown
    /// transaction yields an empty network.
    pub async fn network(&self, transaction_id: &str, depth: u32) -> Result<Network> {
        let depth = depth.clamp(1, MAX_NETWORK_DEPTH);
        if !self.has_transaction(transaction_id).await? {
            return Ok(Network::default());
        }

        let start = NodeRef::Transaction(transaction_id.to_string());
        let mut seen: BTreeSet<NodeRef> = BTreeSet::from([start.clone()]);
        let mut links: BTreeSet<NetworkLink> = BTreeSet::new();
        let mut queue: VecDeque<(NodeRef, u32)> = VecDeque::from([(start, 0)]);

        while let Some((node, hops)) = queue.pop_front() {
            if hops >= depth {
                continue;
            }
            for (neighbor, link) in self.neighbors(&node).await? {
                links.insert(link);
                if seen.insert(neighbor.clone()) {
                    queue.push_back((neighbor, hops + 1));
                }
            }
        }

        let mut nodes = Vec::with_capacity(seen.len());
        for node in &seen {
            nodes.push(self.describe(node).await?);
        }
        // Links may reach one hop past the frontier; keep only those between visible nodes.
        let ids: BTreeSet<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let links = links
            .into_iter()
            .filter(|l| ids.contains(&l.source) && ids.contains(&l.target))
            .collect();

        Ok(Network { nodes, links })
    }

    async fn neighbors(&self, node: &NodeRef) -> Result<Vec<(NodeRef, NetworkLink)>> {
        let mut out = Vec::new();
        match node {
            NodeRef::Transaction(id) => {
                let mut rows = self
                    .conn
                    .query(
                        "SELECT kind, key, role FROM involvements WHERE transaction_id = ?1",
                        params![id.as_str()],
                    )
                    .await
                    .map_err(storage_err)?;
                while let Some(row) = rows.next().await.map_err(storage_err)? {
                    let kind: String = row.get(0).map_err(storage_err)?;
                    let Some(kind) = parse_kind(&kind) else { continue };
                    let entity = NodeRef::Entity(kind, row.get(1).map_err(storage_err)?);
                    let link = NetworkLink {
                        source: entity.id(),
                        target: id.clone(),
                        label: row.get(2).map_err(storage_err)?,
                    };
                    out.push((entity, link));
                }
            }
            NodeRef::Entity(kind, key) => {
                let mut rows = self
                    .conn
                    .query(
                        "SELECT transaction_id, role FROM involvements WHERE kind = ?1 AND key = ?2",
                        params![kind.as_str(), key.as_str()],
                    )
                    .await
                    .map_err(storage_err)?;
                while let Some(row) = rows.next().await.map_err(storage_err)? {
                    let txn: String = row.get(0).map_err(storage_err)?;
                    let link = NetworkLink {
                        source: node.id(),
                        target: txn.clone(),
                        label: row.get(1).map_err(storage_err)?,
                    };
                    out.push((NodeRef::Transaction(txn), link));
                }

                let (sql, other) = match kind {
                    EntityKind::Organization => (
                        "SELECT person_key, role FROM associations WHERE org_key = ?1",
                        EntityKind::Person,
                    ),
                    EntityKind::Person => (
                        "SELECT org_key, role FROM associations WHERE person_key = ?1",
                        EntityKind::Organization,
                    ),
                };
                let mut rows = self
                    .conn
                    .query(sql, params![key.as_str()])
                    .await
                    .map_err(storage_err)?;
                while let Some(row) = rows.next().await.map_err(storage_err)? {
                    let neighbor = NodeRef::Entity(other, row.get(0).map_err(storage_err)?);
                    // Associations always point person -> organization.
                    let (source, target) = match kind {
                        EntityKind::Organization => (neighbor.id(), node.id()),
                        EntityKind::Person => (node.id(), neighbor.id()),
                    };
                    let link = NetworkLink {
                        source,
                        target,
                        label: row.get(1).map_err(storage_err)?,
                    };
                    out.push((neighbor, link));
                }
            }
        }
        Ok(out)
    }

    async fn describe(&self, node: &NodeRef) -> Result<NetworkNode> {
        match node {
            NodeRef::Transaction(id) => {
                let mut rows = self
                    .conn
                    .query("SELECT risk_score FROM transactions WHERE id = ?1", params![id.as_str()])
                    .await
                    .map_err(storage_err)?;
                let risk = match rows.next().await.map_err(storage_err)? {
                    Some(row) => row.get::<f64>(0).ok(),
                    None => None,
                };
                Ok(NetworkNode {
                    id: id.clone(),
                    label: id.clone(),
                    node_type: "transaction".into(),
                    risk,
                })
            }
            NodeRef::Entity(kind, key) => {
                let mut rows = self
                    .conn
                    .query(
                        "SELECT name FROM entities WHERE kind = ?1 AND key = ?2",
                        params![kind.as_str(), key.as_str()],
                    )
                    .await
                    .map_err(storage_err)?;
                let label = match rows.next().await.map_err(storage_err)? {
                    Some(row) => row.get::<String>(0).unwrap_or_else(|_| key.clone()),
                    None => key.clone(),
                };
                Ok(NetworkNode {
                    id: node.id(),
                    label,
                    node_type: kind.as_str().to_string(),
                    risk: None,
                })
            }
        }
    }
}

/// Count of nodes per type, for summaries.
pub fn node_type_counts(network: &Network) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for node in &network.nodes {
        *counts.entry(node.node_type.clone()).or_insert(0) += 1;
    }
    counts
}
