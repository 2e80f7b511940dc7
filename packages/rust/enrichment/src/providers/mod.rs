//! Built-in enrichment providers.
//!
//! Each is a thin wrapper over one external source. Transport and decoding
//! errors are turned into `failed` results here, never propagated.

mod corporate_registry;
mod knowledge_graph;
mod news;
mod pep;
mod sanctions;

use std::time::Duration;

use reqwest::Client;

use amlflow_shared::{AmlFlowError, Result};

pub use corporate_registry::CorporateRegistryAdapter;
pub use knowledge_graph::KnowledgeGraphAdapter;
pub use news::NewsAdapter;
pub use pep::{PepAdapter, PepRecord};
pub use sanctions::SanctionsAdapter;

/// User-Agent string for provider requests.
const USER_AGENT: &str = concat!("amlflow/", env!("CARGO_PKG_VERSION"));

/// Shared HTTP client for the built-in providers.
pub fn http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| AmlFlowError::Network(format!("failed to build HTTP client: {e}")))
}

/// Read an API key from the environment variable named in config; empty counts as unset.
pub(crate) fn api_key_from_env(var: &str) -> Option<String> {
    std::env::var(var).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Send a request and decode a JSON body, describing any failure as a reason string.
pub(crate) async fn fetch_json(request: reqwest::RequestBuilder) -> std::result::Result<serde_json::Value, String> {
    let response = request.send().await.map_err(|e| format!("API request failed: {e}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("API request failed: HTTP {status}"));
    }
    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| format!("invalid response body: {e}"))
}
