//! Adverse media search (GDELT DOC API).

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use amlflow_shared::{EnrichmentResult, EntityKind, ProvidersConfig};

use super::fetch_json;
use crate::adapter::{EnrichmentAdapter, Subject, TransactionContext};

/// Terms appended to the entity name to bias the search toward adverse coverage.
const ADVERSE_TERMS: &str = "fraud scam scandal sanctions corruption lawsuit investigation";

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Article {
    title: String,
    url: String,
    source: String,
    date: String,
    tone: f64,
    themes: Value,
}

impl Article {
    fn from_gdelt(raw: &Value) -> Self {
        let text = |k: &str| raw.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
        Self {
            title: text("title"),
            url: text("url"),
            source: text("domain"),
            date: text("seendate"),
            tone: raw.get("tone").and_then(Value::as_f64).unwrap_or(0.0),
            themes: raw.get("themes").cloned().unwrap_or_else(|| Value::Array(Vec::new())),
        }
    }
}

pub struct NewsAdapter {
    client: Client,
    endpoint: String,
    tone_threshold: f64,
}

impl NewsAdapter {
    pub fn new(client: Client, config: &ProvidersConfig) -> Self {
        Self {
            client,
            endpoint: config.gdelt_url.clone(),
            tone_threshold: config.news_tone_threshold,
        }
    }
}

#[async_trait]
impl EnrichmentAdapter for NewsAdapter {
    fn provider(&self) -> &str {
        "news"
    }

    fn supports(&self, _kind: EntityKind) -> bool {
        true
    }

    async fn lookup(&self, subject: &Subject, _ctx: &TransactionContext) -> EnrichmentResult {
        if subject.name.trim().is_empty() {
            return EnrichmentResult::failed("No entity name provided");
        }

        let query = format!("{} {ADVERSE_TERMS}", subject.name);
        let request = self.client.get(&self.endpoint).query(&[
            ("query", query.as_str()),
            ("mode", "artlist"),
            ("format", "json"),
        ]);
        let body = match fetch_json(request).await {
            Ok(body) => body,
            Err(reason) => {
                warn!(provider = "news", %reason, "news lookup failed");
                return EnrichmentResult::failed(format!("GDELT {reason}"));
            }
        };

        let articles: Vec<Article> = body
            .get("articles")
            .and_then(Value::as_array)
            .map(|a| a.iter().map(Article::from_gdelt).collect())
            .unwrap_or_default();
        let total = articles.len();
        let adverse: Vec<Article> = articles
            .into_iter()
            .filter(|a| a.tone < self.tone_threshold)
            .collect();

        debug!(total, adverse = adverse.len(), "news articles filtered by tone");
        match serde_json::to_value(&adverse) {
            Ok(data) => EnrichmentResult::success(data),
            Err(e) => EnrichmentResult::failed(format!("failed to encode articles: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::ctx;
    use amlflow_shared::EnrichmentStatus;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> NewsAdapter {
        let config = ProvidersConfig {
            gdelt_url: format!("{}/api/v2/doc/doc", server.uri()),
            ..Default::default()
        };
        NewsAdapter::new(Client::new(), &config)
    }

    #[tokio::test]
    async fn keeps_negative_tone_articles() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/doc/doc"))
            .and(query_param("mode", "artlist"))
            .and(query_param("query", format!("Jane PEP {ADVERSE_TERMS}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "articles": [
                    {"title": "Inquiry opened", "url": "https://a.example", "domain": "a.example",
                     "seendate": "20240101T000000Z", "tone": -5.5},
                    {"title": "Charity gala", "url": "https://b.example", "domain": "b.example", "tone": 3.1},
                    {"title": "Borderline", "tone": -2.0}
                ]
            })))
            .mount(&server)
            .await;

        let result = adapter(&server)
            .lookup(&Subject::person("Jane PEP", None), &ctx("txn_news"))
            .await;
        assert!(result.is_success());
        let articles = result.data.as_array().expect("array");
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0]["source"], "a.example");
        assert_eq!(articles[0]["date"], "20240101T000000Z");
    }

    #[tokio::test]
    async fn non_json_reply_is_failed_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Timespan is too short."))
            .mount(&server)
            .await;

        let result = adapter(&server)
            .lookup(&Subject::organization("Acme", None), &ctx("txn_news"))
            .await;
        assert_eq!(result.status, EnrichmentStatus::Failed);
    }
}
