//! Sanctions screening (OpenSanctions match API).

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use amlflow_shared::{EnrichmentResult, EntityKind, ProvidersConfig};

use super::{api_key_from_env, fetch_json};
use crate::adapter::{EnrichmentAdapter, Subject, TransactionContext};

pub struct SanctionsAdapter {
    client: Client,
    base_url: String,
    key_env: String,
    threshold: f64,
}

impl SanctionsAdapter {
    pub fn new(client: Client, config: &ProvidersConfig) -> Self {
        Self {
            client,
            base_url: config.opensanctions_url.trim_end_matches('/').to_string(),
            key_env: config.opensanctions_key_env.clone(),
            threshold: config.sanctions_match_threshold,
        }
    }
}

fn schema_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Organization => "Company",
        EntityKind::Person => "Person",
    }
}

#[async_trait]
impl EnrichmentAdapter for SanctionsAdapter {
    fn provider(&self) -> &str {
        "sanctions"
    }

    fn supports(&self, _kind: EntityKind) -> bool {
        true
    }

    async fn lookup(&self, subject: &Subject, _ctx: &TransactionContext) -> EnrichmentResult {
        if subject.name.trim().is_empty() {
            return EnrichmentResult::failed("No entity name provided");
        }

        let batch = json!({
            "queries": {
                "q1": {
                    "schema": schema_for(subject.kind),
                    "properties": {"name": [subject.name]}
                }
            }
        });

        let url = format!("{}/match/sanctions", self.base_url);
        let mut request = self
            .client
            .post(&url)
            .query(&[("algorithm", "best")])
            .json(&batch);
        if let Some(key) = api_key_from_env(&self.key_env) {
            request = request.header(reqwest::header::AUTHORIZATION, format!("ApiKey {key}"));
        }

        let body = match fetch_json(request).await {
            Ok(body) => body,
            Err(reason) => {
                warn!(provider = "sanctions", %reason, "sanctions lookup failed");
                return EnrichmentResult::failed(reason);
            }
        };

        let candidates = body
            .pointer("/responses/q1/results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = candidates.len();
        let matches: Vec<Value> = candidates
            .into_iter()
            .filter(|r| r.get("score").and_then(Value::as_f64).unwrap_or(0.0) > self.threshold)
            .collect();

        debug!(total, kept = matches.len(), threshold = self.threshold, "sanctions candidates filtered");
        EnrichmentResult::success(Value::Array(matches))
    }
}
