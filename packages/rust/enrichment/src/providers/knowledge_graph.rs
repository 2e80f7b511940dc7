//! Knowledge-graph lookup over a Wikidata SPARQL endpoint.
//!
//! Three queries per organization: resolve the entity id, fetch a few key
//! properties, then list the people linked as CEO, founder or director.
//! Those people are returned as discovered entities.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use amlflow_shared::{EnrichmentResult, EntityKind, Person, ProvidersConfig};

use super::fetch_json;
use crate::adapter::{EnrichmentAdapter, Subject, TransactionContext};

/// Country, legal form, founded by, CEO, inception, official website.
const KEY_PROPERTIES: &[&str] = &["P17", "P1454", "P112", "P169", "P571", "P856"];

/// CEO, founded by, board member.
const PEOPLE_PROPERTIES: &[&str] = &["P169", "P112", "P3320"];

pub struct KnowledgeGraphAdapter {
    client: Client,
    endpoint: String,
    people_limit: u32,
}

impl KnowledgeGraphAdapter {
    pub fn new(client: Client, config: &ProvidersConfig) -> Self {
        Self {
            client,
            endpoint: config.wikidata_sparql_url.clone(),
            people_limit: config.knowledge_graph_people_limit,
        }
    }

    async fn select(&self, query: &str) -> Result<Vec<Value>, String> {
        let request = self
            .client
            .get(&self.endpoint)
            .query(&[("query", query), ("format", "json")])
            .header(reqwest::header::ACCEPT, "application/sparql-results+json");
        let body = fetch_json(request).await?;
        body.pointer("/results/bindings")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| "malformed SPARQL response: missing results.bindings".to_string())
    }

    async fn resolve_entity(&self, name: &str) -> Result<Option<String>, String> {
        let query = format!(
            r#"SELECT ?company ?companyLabel WHERE {{
  SERVICE wikibase:mwapi {{
    bd:serviceParam wikibase:endpoint "www.wikidata.org";
                    wikibase:api "EntitySearch";
                    mwapi:search "{}";
                    mwapi:language "en".
    ?company wikibase:apiOutputItem mwapi:item.
  }}
  SERVICE wikibase:label {{ bd:serviceParam wikibase:language "en". }}
}}
LIMIT 1"#,
            escape_literal(name)
        );
        let bindings = self.select(&query).await?;
        Ok(bindings
            .first()
            .and_then(|b| binding(b, "company"))
            .and_then(|uri| uri.rsplit('/').next().map(str::to_string))
            .filter(|id| !id.is_empty()))
    }

    async fn properties(&self, entity_id: &str) -> Result<BTreeMap<String, String>, String> {
        let filter = KEY_PROPERTIES
            .iter()
            .map(|p| format!("?prop = wdt:{p}"))
            .collect::<Vec<_>>()
            .join(" || ");
        let query = format!(
            r#"SELECT ?prop ?propLabel ?value ?valueLabel WHERE {{
  wd:{entity_id} ?p ?value .
  ?prop wikibase:directClaim ?p .
  SERVICE wikibase:label {{ bd:serviceParam wikibase:language "en". }}
  FILTER({filter})
}}"#
        );
        let mut out = BTreeMap::new();
        for b in self.select(&query).await? {
            if let Some(label) = binding(&b, "propLabel") {
                let value = binding(&b, "valueLabel").unwrap_or("Unknown");
                out.insert(label.to_string(), value.to_string());
            }
        }
        Ok(out)
    }

    async fn people(&self, entity_id: &str, organization: &str) -> Result<Vec<Person>, String> {
        let roles = PEOPLE_PROPERTIES
            .iter()
            .map(|p| format!("wdt:{p}"))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            r#"SELECT DISTINCT ?person ?personLabel ?roleLabel WHERE {{
  wd:{entity_id} ?rel ?person .
  ?role wikibase:directClaim ?rel .
  FILTER(?role IN ({roles}))
  ?person wdt:P31 wd:Q5 .
  SERVICE wikibase:label {{ bd:serviceParam wikibase:language "en". }}
}}
LIMIT {}"#,
            self.people_limit
        );
        Ok(self
            .select(&query)
            .await?
            .iter()
            .filter_map(|b| {
                let name = binding(b, "personLabel")?;
                Some(Person {
                    name: name.to_string(),
                    role: binding(b, "roleLabel").unwrap_or("associated person").to_string(),
                    country: None,
                    source: Some("wikidata".into()),
                    entity_connection: Some(organization.to_string()),
                })
            })
            .collect())
    }
}

/// `value` of one variable in a SPARQL JSON result binding.
fn binding<'a>(row: &'a Value, var: &str) -> Option<&'a str> {
    row.get(var)?.get("value")?.as_str()
}

/// Escape a string for use inside a double-quoted SPARQL literal.
fn escape_literal(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace(['\n', '\r'], " ")
}

#[async_trait]
impl EnrichmentAdapter for KnowledgeGraphAdapter {
    fn provider(&self) -> &str {
        "wikidata"
    }

    fn supports(&self, kind: EntityKind) -> bool {
        kind == EntityKind::Organization
    }

    async fn lookup(&self, subject: &Subject, _ctx: &TransactionContext) -> EnrichmentResult {
        let name = subject.name.as_str();
        let outcome = async {
            let Some(entity_id) = self.resolve_entity(name).await? else {
                return Ok(None);
            };
            let properties = self.properties(&entity_id).await?;
            let people = self.people(&entity_id, name).await?;
            Ok::<_, String>(Some((entity_id, properties, people)))
        }
        .await;

        match outcome {
            Ok(Some((entity_id, properties, people))) => {
                debug!(entity_id, people = people.len(), "knowledge graph entity resolved");
                EnrichmentResult::success(json!({
                    "entity_id": entity_id,
                    "entity_name": name,
                    "properties": properties,
                }))
                .with_discovered(people)
            }
            Ok(None) => EnrichmentResult::no_results(format!("No Wikidata entity found for {name}")),
            Err(reason) => {
                warn!(provider = "wikidata", %reason, "knowledge graph lookup failed");
                EnrichmentResult::failed(format!("Error querying Wikidata: {reason}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::ctx;
    use amlflow_shared::EnrichmentStatus;
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn adapter(server: &MockServer) -> KnowledgeGraphAdapter {
        let config = ProvidersConfig {
            wikidata_sparql_url: format!("{}/sparql", server.uri()),
            ..Default::default()
        };
        KnowledgeGraphAdapter::new(Client::new(), &config)
    }

    /// Matches SPARQL requests whose `query` parameter contains `needle`.
    fn query_contains(needle: &'static str) -> impl Fn(&Request) -> bool + Send + Sync + 'static {
        move |req: &Request| {
            req.url
                .query_pairs()
                .any(|(k, v)| k == "query" && v.contains(needle))
        }
    }

    fn bindings(rows: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"results": {"bindings": rows}}))
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(escape_literal(r#"Acme "Shell" \ Ltd"#), r#"Acme \"Shell\" \\ Ltd"#);
    }

    #[tokio::test]
    async fn resolves_entity_and_discovers_people() {
        let server = MockServer::start().await;
        Mock::given(query_contains("EntitySearch"))
            .respond_with(bindings(json!([
                {"company": {"value": "http://www.wikidata.org/entity/Q42"}}
            ])))
            .mount(&server)
            .await;
        Mock::given(query_contains("directClaim ?p"))
            .respond_with(bindings(json!([
                {"propLabel": {"value": "country"}, "valueLabel": {"value": "Cayman Islands"}},
                {"propLabel": {"value": "inception"}}
            ])))
            .mount(&server)
            .await;
        Mock::given(query_contains("wd:Q5"))
            .respond_with(bindings(json!([
                {"personLabel": {"value": "John Founder"}, "roleLabel": {"value": "founded by"}},
                {"personLabel": {"value": "Mary CEO"}},
                {"roleLabel": {"value": "orphan role"}}
            ])))
            .mount(&server)
            .await;

        let result = adapter(&server)
            .lookup(&Subject::organization("Acme Shell Ltd", None), &ctx("txn_kg"))
            .await;
        assert!(result.is_success());
        assert_eq!(result.data["entity_id"], "Q42");
        assert_eq!(result.data["properties"]["country"], "Cayman Islands");
        assert_eq!(result.data["properties"]["inception"], "Unknown");

        let people = &result.discovered_entities;
        assert_eq!(people.len(), 2);
        assert_eq!(people[0].name, "John Founder");
        assert_eq!(people[0].role, "founded by");
        assert_eq!(people[0].entity_connection.as_deref(), Some("Acme Shell Ltd"));
        assert_eq!(people[1].role, "associated person");
    }

    #[tokio::test]
    async fn unknown_entity_is_no_results() {
        let server = MockServer::start().await;
        Mock::given(query_contains("EntitySearch"))
            .respond_with(bindings(json!([])))
            .mount(&server)
            .await;

        let result = adapter(&server)
            .lookup(&Subject::organization("Nobody Inc", None), &ctx("txn_kg"))
            .await;
        assert_eq!(result.status, EnrichmentStatus::NoResults);
        assert!(result.discovered_entities.is_empty());
    }

    #[tokio::test]
    async fn endpoint_failure_is_failed_result() {
        let server = MockServer::start().await;
        Mock::given(query_contains("EntitySearch"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = adapter(&server)
            .lookup(&Subject::organization("Acme", None), &ctx("txn_kg"))
            .await;
        assert_eq!(result.status, EnrichmentStatus::Failed);
        assert!(result.reason.as_deref().unwrap_or("").starts_with("Error querying Wikidata"));
    }
}
