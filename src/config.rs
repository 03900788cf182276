//! TOML configuration parsing and validation.
//!
//! Every section carries serde defaults, so a minimal file only needs the
//! `[db]` paths and a `[source]`. See [`load_config`] for validation rules.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::chunk::ChunkStrategy;
use crate::store::DistanceMetric;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// Vector index database (chunks, vectors, document metadata).
    pub path: PathBuf,
    /// Small key-value store of `document_id -> content_hash`.
    /// Defaults to `state.sqlite` next to the index database.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

impl DbConfig {
    pub fn state_path(&self) -> PathBuf {
        match &self.state_path {
            Some(p) => p.clone(),
            None => self
                .path
                .parent()
                .map(|p| p.join("state.sqlite"))
                .unwrap_or_else(|| PathBuf::from("state.sqlite")),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Http,
    Filesystem,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Base URL of the vault content API (`http` kind).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Bearer token; falls back to `VAULT_API_TOKEN`.
    #[serde(default)]
    pub token: Option<String>,
    /// Vault root directory (`filesystem` kind).
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
}

impl SourceConfig {
    pub fn resolved_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var("VAULT_API_TOKEN").ok())
            .filter(|t| !t.is_empty())
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_retry_cap_ms() -> u64 {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default)]
    pub strategy: ChunkStrategy,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
    #[serde(default = "default_min_chunk_tokens")]
    pub min_chunk_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::default(),
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
            min_chunk_tokens: default_min_chunk_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    512
}
fn default_overlap() -> usize {
    50
}
fn default_min_chunk_tokens() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_embed_concurrency")]
    pub concurrency: usize,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embed_timeout_secs(),
            concurrency: default_embed_concurrency(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "hashing".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    2
}
fn default_embed_timeout_secs() -> u64 {
    10
}
fn default_embed_concurrency() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_cache_capacity() -> usize {
    10_000
}
fn default_cache_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_tag_weight")]
    pub tag_weight: f64,
    /// Semantic candidates fetched per requested result (`k * multiplier`).
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_final_limit")]
    pub default_k: usize,
    #[serde(default = "default_passages_per_document")]
    pub passages_per_document: usize,
    #[serde(default)]
    pub metric: DistanceMetric,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            semantic_weight: default_semantic_weight(),
            keyword_weight: default_keyword_weight(),
            tag_weight: default_tag_weight(),
            candidate_multiplier: default_candidate_multiplier(),
            default_k: default_final_limit(),
            passages_per_document: default_passages_per_document(),
            metric: DistanceMetric::default(),
        }
    }
}

fn default_semantic_weight() -> f64 {
    0.6
}
fn default_keyword_weight() -> f64 {
    0.3
}
fn default_tag_weight() -> f64 {
    0.1
}
fn default_candidate_multiplier() -> usize {
    3
}
fn default_final_limit() -> usize {
    10
}
fn default_passages_per_document() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    #[serde(default = "default_indexer_batch")]
    pub batch_size: usize,
    /// Documents fetched and processed concurrently within a batch.
    #[serde(default = "default_indexer_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_indexer_batch(),
            concurrency: default_indexer_concurrency(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_indexer_batch() -> usize {
    100
}
fn default_indexer_concurrency() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_llm_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: default_llm_base_url(),
            model: None,
            api_key_env: default_llm_key_env(),
            max_context_tokens: default_max_context_tokens(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "disabled".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_max_context_tokens() -> usize {
    3000
}
fn default_llm_timeout_secs() -> u64 {
    60
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
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.source.kind {
        SourceKind::Http if config.source.base_url.is_none() => {
            bail!("source.base_url is required when source.kind = \"http\"")
        }
        SourceKind::Filesystem if config.source.root.is_none() => {
            bail!("source.root is required when source.kind = \"filesystem\"")
        }
        _ => {}
    }
    if config.source.retry_attempts == 0 {
        bail!("source.retry_attempts must be >= 1");
    }

    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
    }

    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "hashing" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hashing, openai, ollama, or local.",
            other
        ),
    }
    if matches!(config.embedding.provider.as_str(), "openai" | "ollama") {
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    if config.cache.capacity == 0 {
        bail!("cache.capacity must be > 0");
    }

    let r = &config.retrieval;
    for (name, w) in [
        ("semantic_weight", r.semantic_weight),
        ("keyword_weight", r.keyword_weight),
        ("tag_weight", r.tag_weight),
    ] {
        if !(0.0..=1.0).contains(&w) {
            bail!("retrieval.{} must be in [0.0, 1.0]", name);
        }
    }
    if r.semantic_weight + r.keyword_weight + r.tag_weight <= 0.0 {
        bail!("retrieval weights must not all be zero");
    }
    if r.default_k == 0 || r.candidate_multiplier == 0 || r.passages_per_document == 0 {
        bail!("retrieval.default_k, candidate_multiplier and passages_per_document must be >= 1");
    }

    if config.indexer.batch_size == 0 || config.indexer.concurrency == 0 {
        bail!("indexer.batch_size and indexer.concurrency must be >= 1");
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.llm.provider == "openai" && config.llm.model.is_none() {
        bail!("llm.model must be specified when llm.provider is 'openai'");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "/tmp/vs/index.sqlite"

[source]
kind = "filesystem"
root = "/tmp/vault"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.chunking.max_tokens, 512);
        assert_eq!(config.chunking.overlap_tokens, 50);
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.cache.capacity, 10_000);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert_eq!(config.indexer.batch_size, 100);
        assert_eq!(config.source.retry_attempts, 3);
        assert_eq!(config.source.retry_base_ms, 500);
        assert_eq!(config.source.retry_cap_ms, 4000);
        assert!((config.retrieval.semantic_weight - 0.6).abs() < 1e-9);
        assert!((config.retrieval.keyword_weight - 0.3).abs() < 1e-9);
        assert!((config.retrieval.tag_weight - 0.1).abs() < 1e-9);
        assert_eq!(
            config.db.state_path(),
            PathBuf::from("/tmp/vs/state.sqlite")
        );
    }

    #[test]
    fn test_http_source_requires_base_url() {
        let text = r#"
[db]
path = "/tmp/index.sqlite"

[source]
kind = "http"
"#;
        let err = parse_config(text).unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_window() {
        let text = format!("{}\n[chunking]\nmax_tokens = 50\noverlap_tokens = 50\n", MINIMAL);
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn test_unknown_embedding_provider() {
        let text = format!("{}\n[embedding]\nprovider = \"magic\"\n", MINIMAL);
        let err = parse_config(&text).unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_weights_out_of_range() {
        let text = format!("{}\n[retrieval]\nsemantic_weight = 1.5\n", MINIMAL);
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn test_strategy_and_metric_parse() {
        let text = format!(
            "{}\n[chunking]\nstrategy = \"sentence\"\n\n[retrieval]\nmetric = \"dot\"\n",
            MINIMAL
        );
        let config = parse_config(&text).unwrap();
        assert_eq!(config.chunking.strategy, ChunkStrategy::Sentence);
        assert_eq!(config.retrieval.metric, DistanceMetric::Dot);
    }
}
