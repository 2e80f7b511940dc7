//! Corporate registry search (OpenCorporates-compatible API).

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use amlflow_shared::{EnrichmentResult, EntityKind, ProvidersConfig};

use super::{api_key_from_env, fetch_json};
use crate::adapter::{EnrichmentAdapter, Subject, TransactionContext};

/// Country names as commonly written in transactions, with their ISO 3166 alpha-2 codes.
const COUNTRY_CODES: &[(&str, &str)] = &[
    ("united states", "us"),
    ("united states of america", "us"),
    ("usa", "us"),
    ("united kingdom", "gb"),
    ("uk", "gb"),
    ("great britain", "gb"),
    ("cayman islands", "ky"),
    ("british virgin islands", "vg"),
    ("virgin islands, british", "vg"),
    ("bermuda", "bm"),
    ("panama", "pa"),
    ("switzerland", "ch"),
    ("luxembourg", "lu"),
    ("cyprus", "cy"),
    ("malta", "mt"),
    ("ireland", "ie"),
    ("netherlands", "nl"),
    ("germany", "de"),
    ("france", "fr"),
    ("spain", "es"),
    ("italy", "it"),
    ("russia", "ru"),
    ("russian federation", "ru"),
    ("china", "cn"),
    ("hong kong", "hk"),
    ("singapore", "sg"),
    ("japan", "jp"),
    ("india", "in"),
    ("united arab emirates", "ae"),
    ("uae", "ae"),
    ("canada", "ca"),
    ("australia", "au"),
    ("new zealand", "nz"),
    ("bahamas", "bs"),
    ("seychelles", "sc"),
    ("belize", "bz"),
    ("liechtenstein", "li"),
    ("monaco", "mc"),
    ("jersey", "je"),
    ("guernsey", "gg"),
    ("isle of man", "im"),
    ("iran", "ir"),
    ("north korea", "kp"),
    ("syria", "sy"),
    ("venezuela", "ve"),
    ("nigeria", "ng"),
    ("south africa", "za"),
    ("brazil", "br"),
    ("mexico", "mx"),
];

/// Lowercase ISO alpha-2 code for a jurisdiction name or code.
pub(crate) fn country_code(jurisdiction: &str) -> Option<&'static str> {
    let needle = jurisdiction.trim().to_lowercase();
    COUNTRY_CODES
        .iter()
        .find(|(name, code)| *name == needle || *code == needle)
        .map(|(_, code)| *code)
}

pub struct CorporateRegistryAdapter {
    client: Client,
    base_url: String,
    key_env: String,
}

impl CorporateRegistryAdapter {
    pub fn new(client: Client, config: &ProvidersConfig) -> Self {
        Self {
            client,
            base_url: config.opencorporates_url.trim_end_matches('/').to_string(),
            key_env: config.opencorporates_key_env.clone(),
        }
    }
}

#[async_trait]
impl EnrichmentAdapter for CorporateRegistryAdapter {
    fn provider(&self) -> &str {
        "opencorporates"
    }

    fn supports(&self, kind: EntityKind) -> bool {
        kind == EntityKind::Organization
    }

    async fn lookup(&self, subject: &Subject, _ctx: &TransactionContext) -> EnrichmentResult {
        if subject.name.trim().is_empty() {
            return EnrichmentResult::failed("No organization name provided");
        }

        let mut query: Vec<(&str, String)> = vec![("q", subject.name.clone())];
        if let Some(key) = api_key_from_env(&self.key_env) {
            query.push(("api_token", key));
        }
        if let Some(jurisdiction) = subject.region.as_deref() {
            match country_code(jurisdiction) {
                Some(code) => query.push(("country_code", code.to_string())),
                None => debug!(jurisdiction, "no country code for jurisdiction"),
            }
        }

        let url = format!("{}/companies/search", self.base_url);
        let body = match fetch_json(self.client.get(&url).query(&query)).await {
            Ok(body) => body,
            Err(reason) => {
                warn!(provider = "opencorporates", %reason, "registry lookup failed");
                return EnrichmentResult::failed(reason);
            }
        };

        match body.pointer("/results/companies/0/company") {
            Some(company) => EnrichmentResult::success(company.clone()),
            None => EnrichmentResult::no_results(format!("No results found for {}", subject.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::ctx;
    use amlflow_shared::EnrichmentStatus;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> CorporateRegistryAdapter {
        let config = ProvidersConfig {
            opencorporates_url: server.uri(),
            opencorporates_key_env: "AMLFLOW_TEST_UNSET_OPENCORPORATES_KEY".into(),
            ..Default::default()
        };
        CorporateRegistryAdapter::new(Client::new(), &config)
    }

    #[test]
    fn country_codes_accept_names_and_codes() {
        assert_eq!(country_code("Cayman Islands"), Some("ky"));
        assert_eq!(country_code(" GB "), Some("gb"));
        assert_eq!(country_code("Atlantis"), None);
    }

    #[tokio::test]
    async fn first_company_is_returned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/companies/search"))
            .and(query_param("q", "Acme Shell Ltd"))
            .and(query_param("country_code", "ky"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": {"companies": [
                    {"company": {"name": "ACME SHELL LTD", "company_number": "123"}},
                    {"company": {"name": "ACME SHELL HOLDINGS"}}
                ]}
            })))
            .mount(&server)
            .await;

        let subject = Subject::organization("Acme Shell Ltd", Some("Cayman Islands".into()));
        let result = adapter(&server).lookup(&subject, &ctx("txn_oc")).await;
        assert!(result.is_success());
        assert_eq!(result.data["company_number"], "123");
    }

    #[tokio::test]
    async fn empty_search_is_no_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/companies/search"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"results": {"companies": []}})),
            )
            .mount(&server)
            .await;

        let result = adapter(&server)
            .lookup(&Subject::organization("Nobody Inc", None), &ctx("txn_oc"))
            .await;
        assert_eq!(result.status, EnrichmentStatus::NoResults);
    }

    #[tokio::test]
    async fn http_error_is_failed_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = adapter(&server)
            .lookup(&Subject::organization("Acme", None), &ctx("txn_oc"))
            .await;
        assert_eq!(result.status, EnrichmentStatus::Failed);
        assert!(result.reason.as_deref().unwrap_or("").contains("503"));
    }
}
