use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ContentConfig {
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            overlap_tokens: default_overlap_tokens(),
            min_tokens: default_min_tokens(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_target_tokens() -> usize {
    450
}
fn default_overlap_tokens() -> usize {
    60
}
fn default_min_tokens() -> usize {
    40
}
fn default_max_tokens() -> usize {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// API endpoint base. Overridable so tests can point at a mock server.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Backoff ceiling for rate-limit retries, seconds.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            base_url: default_base_url(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_backoff_secs() -> u64 {
    120
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_floor")]
    pub batch_floor: usize,
    #[serde(default = "default_batch_ceiling")]
    pub batch_ceiling: usize,
    #[serde(default = "default_initial_batch")]
    pub initial_batch: usize,
    /// Rolling per-item average above this shrinks the batch.
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,
    /// Rolling per-item average below this grows the batch.
    #[serde(default = "default_fast_threshold_ms")]
    pub fast_threshold_ms: u64,
    /// A document left with partial vectors longer than this is demoted
    /// to error status instead of waiting forever.
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_floor: default_batch_floor(),
            batch_ceiling: default_batch_ceiling(),
            initial_batch: default_initial_batch(),
            slow_threshold_ms: default_slow_threshold_ms(),
            fast_threshold_ms: default_fast_threshold_ms(),
            pending_timeout_secs: default_pending_timeout_secs(),
        }
    }
}

fn default_batch_floor() -> usize {
    5
}
fn default_batch_ceiling() -> usize {
    100
}
fn default_initial_batch() -> usize {
    20
}
fn default_slow_threshold_ms() -> u64 {
    2000
}
fn default_fast_threshold_ms() -> u64 {
    300
}
fn default_pending_timeout_secs() -> i64 {
    86_400
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
    /// Upper bound on candidates scored per search. When the filtered
    /// candidate set is larger, only this many are scanned (in stable id
    /// order) and total_scanned reports the truncation.
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            max_query_chars: default_max_query_chars(),
            scan_limit: default_scan_limit(),
        }
    }
}

fn default_top_k() -> usize {
    8
}
fn default_max_top_k() -> usize {
    50
}
fn default_max_query_chars() -> usize {
    2000
}
fn default_scan_limit() -> usize {
    20_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7433".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.target_tokens == 0 {
        anyhow::bail!("chunking.target_tokens must be > 0");
    }
    if config.chunking.max_tokens < config.chunking.target_tokens {
        anyhow::bail!("chunking.max_tokens must be >= chunking.target_tokens");
    }
    if config.chunking.overlap_tokens >= config.chunking.target_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.target_tokens");
    }

    if config.pipeline.batch_floor == 0 {
        anyhow::bail!("pipeline.batch_floor must be > 0");
    }
    if config.pipeline.batch_ceiling < config.pipeline.batch_floor {
        anyhow::bail!("pipeline.batch_ceiling must be >= pipeline.batch_floor");
    }

    if config.retrieval.max_top_k < 1 {
        anyhow::bail!("retrieval.max_top_k must be >= 1");
    }
    if config.retrieval.scan_limit == 0 {
        anyhow::bail!("retrieval.scan_limit must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("sdx.toml");
        std::fs::write(&path, content).unwrap();
        (tmp, path)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let (_tmp, path) = write_config("[db]\npath = \"/tmp/sdx.sqlite\"\n");
        let config = load_config(&path).unwrap();
        assert_eq!(config.chunking.target_tokens, 450);
        assert_eq!(config.chunking.overlap_tokens, 60);
        assert_eq!(config.retrieval.default_top_k, 8);
        assert_eq!(config.embedding.provider, "disabled");
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn rejects_overlap_over_target() {
        let (_tmp, path) = write_config(
            "[db]\npath = \"/tmp/sdx.sqlite\"\n[chunking]\ntarget_tokens = 100\noverlap_tokens = 100\n",
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn rejects_enabled_provider_without_model() {
        let (_tmp, path) = write_config(
            "[db]\npath = \"/tmp/sdx.sqlite\"\n[embedding]\nprovider = \"openai\"\ndims = 1536\n",
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn rejects_unknown_provider() {
        let (_tmp, path) = write_config(
            "[db]\npath = \"/tmp/sdx.sqlite\"\n[embedding]\nprovider = \"acme\"\nmodel = \"m\"\ndims = 8\n",
        );
        assert!(load_config(&path).is_err());
    }
}
