//! Completion notifications to the submitter's callback address.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use amlflow_shared::{AmlFlowError, NotifyConfig, Result, RiskAssessment, TransactionState};

/// Body posted to the callback address when a run finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionNotice {
    pub transaction_id: String,
    pub pipeline_id: String,
    pub run_id: String,
    pub status: TransactionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<RiskAssessment>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, callback_url: &str, notice: &CompletionNotice) -> Result<()>;
}

/// POSTs the notice as JSON.
pub struct HttpNotifier {
    client: Client,
}

impl HttpNotifier {
    pub fn new(config: &NotifyConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("amlflow/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.callback_timeout_secs))
            .build()
            .map_err(|e| AmlFlowError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    #[instrument(skip_all, fields(transaction_id = %notice.transaction_id, url = callback_url))]
    async fn notify(&self, callback_url: &str, notice: &CompletionNotice) -> Result<()> {
        let url = reqwest::Url::parse(callback_url)
            .map_err(|e| AmlFlowError::validation(format!("invalid callback url {callback_url:?}: {e}")))?;
        let response = self
            .client
            .post(url)
            .json(notice)
            .send()
            .await
            .map_err(|e| AmlFlowError::Network(format!("callback failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AmlFlowError::Network(format!("callback returned HTTP {status}")));
        }
        info!(%status, "callback delivered");
        Ok(())
    }
}
