//! Application configuration for Linetag.
//!
//! User config lives at `~/.linetag/linetag.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LinetagError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "linetag.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".linetag";

// ---------------------------------------------------------------------------
// Config structs (matching linetag.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Chunking, concurrency and retry settings.
    #[serde(default)]
    pub batch: BatchSection,

    /// Classification backend.
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Per-pass instruction text.
    #[serde(default)]
    pub passes: PassesConfig,

    /// Upstream record source.
    #[serde(default)]
    pub source: SourceConfig,

    /// Downstream publish target.
    #[serde(default)]
    pub publish: PublishConfig,

    /// Stage notifications.
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root of the run-date-partitioned artifact tree.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Reference taxonomy file used by the item pass.
    #[serde(default = "default_taxonomy_file")]
    pub taxonomy_file: String,

    /// Stop before the item pass when the line pass had failed chunks.
    #[serde(default)]
    pub halt_on_partial_failure: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            taxonomy_file: default_taxonomy_file(),
            halt_on_partial_failure: false,
        }
    }
}

fn default_data_dir() -> String {
    "~/linetag-data".into()
}
fn default_taxonomy_file() -> String {
    "~/.linetag/taxonomy.json".into()
}

/// `[batch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSection {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Maximum chunks in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retries for retryable backend errors (timeouts included).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Retries for malformed responses.
    #[serde(default = "default_format_retries")]
    pub format_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Upper bound on a single classification call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            format_retries: default_format_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_chunk_size() -> usize {
    5
}
fn default_concurrency() -> usize {
    1
}
fn default_max_retries() -> u32 {
    3
}
fn default_format_retries() -> u32 {
    1
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_call_timeout_secs() -> u64 {
    300
}

/// `[classifier]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Base URL of an OpenAI-compatible API (no trailing `/chat/completions`).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// HTTP client timeout, independent of the per-call dispatcher timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_request_timeout_secs() -> u64 {
    240
}

/// `[passes]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassesConfig {
    #[serde(default = "default_line_instructions")]
    pub line_instructions: String,

    #[serde(default = "default_item_instructions")]
    pub item_instructions: String,
}

impl Default for PassesConfig {
    fn default() -> Self {
        Self {
            line_instructions: default_line_instructions(),
            item_instructions: default_item_instructions(),
        }
    }
}

fn default_line_instructions() -> String {
    "Classify each search keyword into a product Line. If the keyword clearly names a \
     specific Item, include it as well. Use null when there is no match."
        .into()
}
fn default_item_instructions() -> String {
    "Assign each search keyword a Line and an Item using only the reference taxonomy \
     below. The Item must belong to the chosen Line. Use null when there is no match."
        .into()
}

/// `[source]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// URL returning the week's keyword records as JSON.
    #[serde(default)]
    pub url: Option<String>,
}

/// `[publish]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Rows per PUT request.
    #[serde(default = "default_publish_batch_size")]
    pub batch_size: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            batch_size: default_publish_batch_size(),
        }
    }
}

fn default_publish_batch_size() -> usize {
    500
}

/// `[notify]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Name of the env var holding the webhook URL.
    #[serde(default = "default_webhook_url_env")]
    pub webhook_url_env: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url_env: default_webhook_url_env(),
        }
    }
}

fn default_webhook_url_env() -> String {
    "LINETAG_WEBHOOK_URL".into()
}

// ---------------------------------------------------------------------------
// Batch config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime batch configuration, merged from config file + CLI flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub chunk_size: usize,
    pub concurrency: usize,
    pub max_retries: u32,
    pub format_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub call_timeout: Duration,
}

impl BatchConfig {
    /// Reject settings the dispatcher cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(LinetagError::validation("chunk_size must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(LinetagError::validation("concurrency must be at least 1"));
        }
        if self.call_timeout.is_zero() {
            return Err(LinetagError::validation("call_timeout_secs must be at least 1"));
        }
        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for BatchConfig {
    fn from(config: &AppConfig) -> Self {
        let batch = &config.batch;
        Self {
            chunk_size: batch.chunk_size,
            concurrency: batch.concurrency,
            max_retries: batch.max_retries,
            format_retries: batch.format_retries,
            backoff_base: Duration::from_millis(batch.backoff_base_ms),
            backoff_max: Duration::from_millis(batch.backoff_max_ms),
            call_timeout: Duration::from_secs(batch.call_timeout_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.linetag/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| LinetagError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.linetag/linetag.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| LinetagError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| LinetagError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LinetagError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LinetagError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LinetagError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Read the classification API key from the env var named in config.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.classifier.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(LinetagError::config(format!(
            "classification API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Webhook URL from the env var named in config, if set.
pub fn webhook_url(config: &AppConfig) -> Option<String> {
    std::env::var(&config.notify.webhook_url_env)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("chunk_size"));
        assert!(toml_str.contains("OPENAI_API_KEY"));
        assert!(toml_str.contains("LINETAG_WEBHOOK_URL"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.batch.chunk_size, 5);
        assert_eq!(parsed.batch.concurrency, 1);
        assert_eq!(parsed.publish.batch_size, 500);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let toml_str = r#"
[batch]
chunk_size = 50
concurrency = 4

[publish]
endpoint = "https://records.example.com/keywords"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.batch.chunk_size, 50);
        assert_eq!(config.batch.max_retries, 3);
        assert_eq!(config.batch.format_retries, 1);
        assert_eq!(
            config.publish.endpoint.as_deref(),
            Some("https://records.example.com/keywords")
        );
        assert_eq!(config.publish.batch_size, 500);
        assert!(!config.defaults.halt_on_partial_failure);
    }

    #[test]
    fn batch_config_from_app_config() {
        let batch = BatchConfig::from(&AppConfig::default());
        assert_eq!(batch.chunk_size, 5);
        assert_eq!(batch.backoff_base, Duration::from_millis(1000));
        assert_eq!(batch.backoff_max, Duration::from_secs(30));
        assert_eq!(batch.call_timeout, Duration::from_secs(300));
        assert!(batch.validate().is_ok());
    }

    #[test]
    fn batch_config_rejects_zero_sizes() {
        let mut batch = BatchConfig::default();
        batch.chunk_size = 0;
        assert!(batch.validate().is_err());

        let mut batch = BatchConfig::default();
        batch.concurrency = 0;
        assert!(batch.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let path = std::env::temp_dir().join(format!("lt_config_{}.toml", uuid::Uuid::now_v7()));
        std::fs::write(&path, "[defaults]\ndata_dir = \"/srv/linetag\"\n").unwrap();
        let config = load_config_from(&path).expect("load");
        assert_eq!(config.defaults.data_dir, "/srv/linetag");
        std::fs::write(&path, "[batch\nchunk_size = ").unwrap();
        assert!(load_config_from(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/tmp/data"), PathBuf::from("/tmp/data"));
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.classifier.api_key_env = "LT_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
