use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Wall-clock budget for the buffered phase of a turn (routing,
    /// drafting, verification) before any stream bytes are written.
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
}

fn default_turn_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Secret used to sign and verify bearer tokens.
    pub token_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible chat completions endpoint.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            temperature: default_temperature(),
            max_retries: default_llm_max_retries(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}
fn default_llm_model() -> String {
    "qwen2.5:14b-instruct".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_llm_max_retries() -> u32 {
    3
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Base URL of an OpenAI-compatible embeddings endpoint.
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Vector dimensionality shared between ingestion-time and query-time
    /// embedding. A mismatch at either point is a configuration error.
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_embedding_base_url(),
            model: default_embedding_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Result count when a search request does not specify one.
    #[serde(default = "default_search_limit")]
    pub default_search_limit: i64,
    /// Upper bound for any single search; out-of-range requests are clamped.
    #[serde(default = "default_max_search_limit")]
    pub max_search_limit: i64,
    /// Evidence count retrieved per claim during verification.
    #[serde(default = "default_verify_search_limit")]
    pub verify_search_limit: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_search_limit: default_search_limit(),
            max_search_limit: default_max_search_limit(),
            verify_search_limit: default_verify_search_limit(),
        }
    }
}

fn default_search_limit() -> i64 {
    6
}
fn default_max_search_limit() -> i64 {
    20
}
fn default_verify_search_limit() -> i64 {
    12
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Base URL of the external document-segmentation service.
    #[serde(default = "default_segmenter_base_url")]
    pub segmenter_base_url: String,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Delay between segmentation task polls.
    #[serde(default = "default_poll_delay_ms")]
    pub poll_delay_ms: u64,
    /// Poll attempts before the file is marked failed.
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    /// Target chunk size requested from the segmenter, in tokens.
    #[serde(default = "default_target_tokens")]
    pub target_tokens: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            segmenter_base_url: default_segmenter_base_url(),
            max_file_bytes: default_max_file_bytes(),
            poll_delay_ms: default_poll_delay_ms(),
            max_poll_attempts: default_max_poll_attempts(),
            target_tokens: default_target_tokens(),
        }
    }
}

fn default_segmenter_base_url() -> String {
    "https://api.chunkr.ai/api/v1".to_string()
}
fn default_max_file_bytes() -> u64 {
    5 * 1024 * 1024
}
fn default_poll_delay_ms() -> u64 {
    2000
}
fn default_max_poll_attempts() -> u32 {
    60
}
fn default_target_tokens() -> u32 {
    6000
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;

    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.server.bind.trim().is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }

    if config.auth.token_secret.trim().is_empty() {
        anyhow::bail!("auth.token_secret must not be empty");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }

    if config.retrieval.default_search_limit < 1 {
        anyhow::bail!("retrieval.default_search_limit must be >= 1");
    }

    if config.retrieval.max_search_limit < config.retrieval.default_search_limit {
        anyhow::bail!("retrieval.max_search_limit must be >= retrieval.default_search_limit");
    }

    if config.retrieval.verify_search_limit < 1
        || config.retrieval.verify_search_limit > config.retrieval.max_search_limit
    {
        anyhow::bail!("retrieval.verify_search_limit must be in [1, retrieval.max_search_limit]");
    }

    if config.ingest.max_poll_attempts == 0 {
        anyhow::bail!("ingest.max_poll_attempts must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> String {
        r#"
[db]
path = "/tmp/factweave.sqlite"

[server]
bind = "127.0.0.1:7332"

[auth]
token_secret = "test-secret"
"#
        .to_string()
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config: Config = toml::from_str(&minimal_toml()).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.embedding.dims, 1536);
        assert_eq!(config.retrieval.default_search_limit, 6);
        assert_eq!(config.retrieval.max_search_limit, 20);
        assert_eq!(config.retrieval.verify_search_limit, 12);
        assert_eq!(config.ingest.max_poll_attempts, 60);
        assert_eq!(config.server.turn_timeout_secs, 120);
    }

    #[test]
    fn test_rejects_zero_dims() {
        let toml_str = format!("{}\n[embedding]\ndims = 0\n", minimal_toml());
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_verify_limit_above_max() {
        let toml_str = format!(
            "{}\n[retrieval]\nmax_search_limit = 10\nverify_search_limit = 11\n",
            minimal_toml()
        );
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_empty_token_secret() {
        let toml_str = minimal_toml().replace("test-secret", " ");
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(validate(&config).is_err());
    }
}
