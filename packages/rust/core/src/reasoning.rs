//! Reasoning service client.
//!
//! Entity extraction and risk assessment both go through one contract:
//! a prompt plus a JSON schema in, a JSON document out. The HTTP client
//! speaks the OpenAI-compatible chat-completions protocol and draws its API
//! keys from an injected [`KeyScheduler`].

use std::collections::HashSet;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use amlflow_shared::{AmlFlowError, ReasoningConfig, Result, reasoning_api_keys};

/// Uses added to a key's count when a call with it fails.
pub const FAILURE_PENALTY: u64 = 10;

const USER_AGENT: &str = concat!("amlflow/", env!("CARGO_PKG_VERSION"));

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid regex"));

/// One structured-generation request.
#[derive(Debug, Clone)]
pub struct ReasoningRequest {
    pub system: String,
    pub prompt: String,
    /// Name of the schema, as the service reports it back.
    pub schema_name: &'static str,
    pub schema: Value,
}

/// `prompt + schema -> JSON document`.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn generate(&self, request: &ReasoningRequest) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// Key scheduler
// ---------------------------------------------------------------------------

/// A key handed out by [`KeyScheduler::select`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySlot {
    pub index: usize,
    pub key: String,
}

/// Explicitly owned API key pool with usage counts.
///
/// `select` returns the least-used key (ties go to the earlier key) and
/// counts the use. `mark_failed` pushes a key to the back of the queue.
#[derive(Debug, Default)]
pub struct KeyScheduler {
    keys: Vec<String>,
    usage: Mutex<Vec<u64>>,
}

impl KeyScheduler {
    pub fn new(keys: Vec<String>) -> Self {
        let usage = Mutex::new(vec![0; keys.len()]);
        Self { keys, usage }
    }

    pub fn from_config(config: &ReasoningConfig) -> Self {
        Self::new(reasoning_api_keys(config))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn select(&self) -> Option<KeySlot> {
        self.select_excluding(&HashSet::new())
    }

    /// Least-used key whose index is not in `tried`.
    pub fn select_excluding(&self, tried: &HashSet<usize>) -> Option<KeySlot> {
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        let index = usage
            .iter()
            .enumerate()
            .filter(|(i, _)| !tried.contains(i))
            .min_by_key(|(i, count)| (**count, *i))
            .map(|(i, _)| i)?;
        usage[index] += 1;
        Some(KeySlot {
            index,
            key: self.keys[index].clone(),
        })
    }

    pub fn mark_failed(&self, index: usize) {
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = usage.get_mut(index) {
            *count += FAILURE_PENALTY;
        }
    }

    /// Current usage counts, in pool order.
    pub fn usage(&self) -> Vec<u64> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

/// OpenAI-compatible chat-completions client.
pub struct ChatCompletionsClient {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    max_attempts: u32,
    keys: Arc<KeyScheduler>,
}

impl ChatCompletionsClient {
    pub fn new(config: &ReasoningConfig, keys: Arc<KeyScheduler>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AmlFlowError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            max_attempts: config.max_attempts.max(1),
            keys,
        })
    }

    async fn call(&self, key: &str, request: &ReasoningRequest) -> Result<Value> {
        let body = json!({
            "model": &self.model,
            "messages": [
                {"role": "system", "content": &request.system},
                {"role": "user", "content": &request.prompt}
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_output_tokens,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "schema": &request.schema,
                }
            }
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AmlFlowError::Network(format!("reasoning request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AmlFlowError::Reasoning(format!(
                "reasoning service returned HTTP {status}: {}",
                text.chars().take(500).collect::<String>()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AmlFlowError::Reasoning(format!("invalid chat response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AmlFlowError::Reasoning("reasoning service returned no content".into()))?;

        debug!(chars = content.len(), "reasoning reply received");
        parse_json_document(&content)
    }
}

#[async_trait]
impl ReasoningService for ChatCompletionsClient {
    #[instrument(skip_all, fields(schema = request.schema_name, model = %self.model))]
    async fn generate(&self, request: &ReasoningRequest) -> Result<Value> {
        if self.keys.is_empty() {
            return Err(AmlFlowError::config("no reasoning API keys configured"));
        }

        let mut tried: HashSet<usize> = HashSet::new();
        let mut attempts = 0;
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            // Once every key has failed, start another pass over the pool.
            if tried.len() >= self.keys.len() {
                tried.clear();
            }
            let Some(slot) = self.keys.select_excluding(&tried) else {
                break;
            };
            attempts = attempt;
            match self.call(&slot.key, request).await {
                Ok(document) => {
                    info!(attempt, key_index = slot.index, "reasoning call succeeded");
                    return Ok(document);
                }
                Err(e) => {
                    warn!(attempt, key_index = slot.index, error = %e, "reasoning call failed");
                    self.keys.mark_failed(slot.index);
                    tried.insert(slot.index);
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => AmlFlowError::Reasoning(format!(
                "all {attempts} attempts failed, last error: {e}"
            )),
            None => AmlFlowError::Reasoning("no reasoning API key available".into()),
        })
    }
}

/// Parse a reply that should be a JSON object.
///
/// Accepts a bare object, a fenced ```json block, or free text containing
/// an object (the first complete one wins).
pub fn parse_json_document(reply: &str) -> Result<Value> {
    let trimmed = reply.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    let fenced = FENCED_JSON
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok());
    if let Some(value @ Value::Object(_)) = fenced {
        return Ok(value);
    }
    for (start, _) in trimmed.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&trimmed[start..]).into_iter::<Value>();
        if let Some(Ok(value @ Value::Object(_))) = stream.next() {
            return Ok(value);
        }
    }
    Err(AmlFlowError::parse(format!(
        "no JSON object in reasoning reply: {}",
        trimmed.chars().take(200).collect::<String>()
    )))
}
