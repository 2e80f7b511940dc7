//! Application configuration for amlflow.
//!
//! User config lives at `~/.amlflow/amlflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AmlFlowError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "amlflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".amlflow";

// ---------------------------------------------------------------------------
// Config structs (matching amlflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Reasoning service (entity extraction + risk assessment).
    #[serde(default)]
    pub reasoning: ReasoningConfig,

    /// Enrichment provider endpoints and thresholds.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Cross-transaction graph database.
    #[serde(default)]
    pub graph: GraphConfig,

    /// Completion callbacks.
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Fact store root; one namespace directory per transaction.
    #[serde(default = "default_results_dir")]
    pub results_dir: String,

    /// Interval between status checks while waiting for a run.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on a synchronous wait.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// Entities enriched concurrently per fan-out stage.
    #[serde(default = "default_fanout_concurrency")]
    pub fanout_concurrency: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_secs: default_poll_timeout_secs(),
            fanout_concurrency: default_fanout_concurrency(),
        }
    }
}

fn default_results_dir() -> String {
    "var/results".into()
}
fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_poll_timeout_secs() -> u64 {
    600
}
fn default_fanout_concurrency() -> usize {
    4
}

/// `[reasoning]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Env var holding a comma-separated key pool (never store keys themselves).
    #[serde(default = "default_api_keys_env")]
    pub api_keys_env: String,

    /// Env var holding a single key, used when the pool is empty.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// OpenAI-compatible API root (`/chat/completions` is appended).
    #[serde(default = "default_reasoning_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Attempts per call, each with a freshly selected key.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_reasoning_timeout")]
    pub timeout_secs: u64,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            api_keys_env: default_api_keys_env(),
            api_key_env: default_api_key_env(),
            base_url: default_reasoning_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            max_attempts: default_max_attempts(),
            timeout_secs: default_reasoning_timeout(),
        }
    }
}

fn default_api_keys_env() -> String {
    "AMLFLOW_LLM_API_KEYS".into()
}
fn default_api_key_env() -> String {
    "AMLFLOW_LLM_API_KEY".into()
}
fn default_reasoning_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "google/gemini-2.5-pro".into()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_output_tokens() -> u32 {
    8192
}
fn default_max_attempts() -> u32 {
    3
}
fn default_reasoning_timeout() -> u64 {
    120
}

/// `[providers]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_opencorporates_url")]
    pub opencorporates_url: String,

    #[serde(default = "default_opencorporates_key_env")]
    pub opencorporates_key_env: String,

    #[serde(default = "default_opensanctions_url")]
    pub opensanctions_url: String,

    #[serde(default = "default_opensanctions_key_env")]
    pub opensanctions_key_env: String,

    /// Sanctions matches must score strictly above this.
    #[serde(default = "default_sanctions_threshold")]
    pub sanctions_match_threshold: f64,

    #[serde(default = "default_wikidata_url")]
    pub wikidata_sparql_url: String,

    /// Maximum associated people returned per organization.
    #[serde(default = "default_people_limit")]
    pub knowledge_graph_people_limit: u32,

    #[serde(default = "default_gdelt_url")]
    pub gdelt_url: String,

    /// Articles must have a tone strictly below this to count as adverse.
    #[serde(default = "default_news_tone_threshold")]
    pub news_tone_threshold: f64,

    /// CSV with `name` and `aliases` columns.
    #[serde(default = "default_pep_data_file")]
    pub pep_data_file: String,

    /// Per-request timeout for every provider.
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            opencorporates_url: default_opencorporates_url(),
            opencorporates_key_env: default_opencorporates_key_env(),
            opensanctions_url: default_opensanctions_url(),
            opensanctions_key_env: default_opensanctions_key_env(),
            sanctions_match_threshold: default_sanctions_threshold(),
            wikidata_sparql_url: default_wikidata_url(),
            knowledge_graph_people_limit: default_people_limit(),
            gdelt_url: default_gdelt_url(),
            news_tone_threshold: default_news_tone_threshold(),
            pep_data_file: default_pep_data_file(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

fn default_opencorporates_url() -> String {
    "https://api.opencorporates.com/v0.4".into()
}
fn default_opencorporates_key_env() -> String {
    "OPENCORPORATES_API_KEY".into()
}
fn default_opensanctions_url() -> String {
    "https://api.opensanctions.org".into()
}
fn default_opensanctions_key_env() -> String {
    "OPENSANCTIONS_API_KEY".into()
}
fn default_sanctions_threshold() -> f64 {
    0.70
}
fn default_wikidata_url() -> String {
    "https://query.wikidata.org/sparql".into()
}
fn default_people_limit() -> u32 {
    10
}
fn default_gdelt_url() -> String {
    "https://api.gdeltproject.org/api/v2/doc/doc".into()
}
fn default_news_tone_threshold() -> f64 {
    -2.0
}
fn default_pep_data_file() -> String {
    "var/pep/pep_data.csv".into()
}
fn default_provider_timeout() -> u64 {
    30
}

/// `[graph]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphConfig {
    /// libSQL database file. Defaults to `<results_dir>/.graph/amlflow.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

/// `[notify]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            callback_timeout_secs: default_callback_timeout(),
        }
    }
}

fn default_callback_timeout() -> u64 {
    30
}

impl AppConfig {
    /// Fact store root as a path, with a leading `~/` expanded.
    pub fn results_dir(&self) -> PathBuf {
        expand_home(&self.defaults.results_dir)
    }

    /// Graph database path, falling back to a hidden directory under the results root.
    pub fn graph_db_path(&self) -> PathBuf {
        match &self.graph.db_path {
            Some(p) => expand_home(p),
            None => self.results_dir().join(".graph").join("amlflow.db"),
        }
    }
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.amlflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| AmlFlowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.amlflow/amlflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| AmlFlowError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| AmlFlowError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| AmlFlowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| AmlFlowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| AmlFlowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the reasoning key pool from the environment.
///
/// The comma-separated pool wins; the single-key variable is the fallback.
pub fn reasoning_api_keys(config: &ReasoningConfig) -> Vec<String> {
    let pool: Vec<String> = std::env::var(&config.api_keys_env)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect();
    if !pool.is_empty() {
        return pool;
    }
    match std::env::var(&config.api_key_env) {
        Ok(key) if !key.trim().is_empty() => vec![key.trim().to_string()],
        _ => Vec::new(),
    }
}

/// Check that at least one reasoning API key is available.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    if reasoning_api_keys(&config.reasoning).is_empty() {
        return Err(AmlFlowError::config(format!(
            "reasoning API key not found. Set {} (comma-separated) or {}.",
            config.reasoning.api_keys_env, config.reasoning.api_key_env
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("results_dir"));
        assert!(toml_str.contains("AMLFLOW_LLM_API_KEYS"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.poll_timeout_secs, 600);
        assert_eq!(parsed.providers.sanctions_match_threshold, 0.70);
        assert_eq!(parsed.providers.news_tone_threshold, -2.0);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let toml_str = r#"
[defaults]
results_dir = "/tmp/aml"

[graph]
db_path = "/tmp/graph.db"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.results_dir(), PathBuf::from("/tmp/aml"));
        assert_eq!(config.graph_db_path(), PathBuf::from("/tmp/graph.db"));
        assert_eq!(config.defaults.fanout_concurrency, 4);
        assert_eq!(config.reasoning.max_attempts, 3);
    }

    #[test]
    fn graph_db_defaults_under_results_dir() {
        let mut config = AppConfig::default();
        config.defaults.results_dir = "/data/results".into();
        assert_eq!(
            config.graph_db_path(),
            PathBuf::from("/data/results/.graph/amlflow.db")
        );
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Unique env var names so other tests are unaffected
        config.reasoning.api_keys_env = "AMLFLOW_TEST_NONEXISTENT_POOL_12345".into();
        config.reasoning.api_key_env = "AMLFLOW_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
