//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to defaults, so
//! a minimal config is a database path plus one `[[collections]]` entry.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use qmd_core::chunk::ChunkParams;
use qmd_core::fusion::FusionParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub expansion: ExpansionConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub collections: Vec<CollectionConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    /// Nothing persists past the process; useful for tests and one-shot runs.
    Memory,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    #[serde(default = "default_lookback_chars")]
    pub lookback_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
            lookback_chars: default_lookback_chars(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> Result<ChunkParams> {
        Ok(ChunkParams::from_tokens(
            self.max_tokens,
            self.overlap_tokens,
            self.lookback_chars,
        )?)
    }
}

fn default_max_tokens() -> usize {
    800
}
fn default_overlap_tokens() -> usize {
    120
}
fn default_lookback_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_original_weight")]
    pub original_weight: f64,
    #[serde(default = "default_variant_weight")]
    pub variant_weight: f64,
    #[serde(default = "default_max_variants")]
    pub max_variants: usize,
    #[serde(default = "default_branch_timeout_ms")]
    pub branch_timeout_ms: u64,
    #[serde(default)]
    pub min_score: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            candidate_k: default_candidate_k(),
            final_limit: default_final_limit(),
            original_weight: default_original_weight(),
            variant_weight: default_variant_weight(),
            max_variants: default_max_variants(),
            branch_timeout_ms: default_branch_timeout_ms(),
            min_score: 0.0,
        }
    }
}

impl RetrievalConfig {
    pub fn fusion(&self) -> FusionParams {
        FusionParams {
            k: self.rrf_k,
            original_weight: self.original_weight,
            variant_weight: self.variant_weight,
        }
    }
}

fn default_rrf_k() -> f64 {
    60.0
}
fn default_candidate_k() -> usize {
    40
}
fn default_final_limit() -> usize {
    10
}
fn default_original_weight() -> f64 {
    2.0
}
fn default_variant_weight() -> f64 {
    1.0
}
fn default_max_variants() -> usize {
    5
}
fn default_branch_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for Ollama or an OpenAI-compatible endpoint.
    #[serde(default)]
    pub url: Option<String>,
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
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_rerank_top_k")]
    pub top_k: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            top_k: default_rerank_top_k(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RerankConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExpansionConfig {
    #[serde(default = "default_expansion_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            provider: default_expansion_provider(),
            model: None,
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CleanupConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

/// Memoization of expansion and rerank responses in the store.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Entry lifetime; 0 keeps entries until the database is deleted.
    #[serde(default = "default_cache_ttl_days")]
    pub ttl_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            ttl_days: default_cache_ttl_days(),
        }
    }
}

impl CacheConfig {
    /// Entry lifetime in seconds, `None` for no expiry.
    pub fn ttl_secs(&self) -> Option<i64> {
        (self.ttl_days > 0).then(|| i64::from(self.ttl_days) * 86_400)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectionConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_expansion_provider() -> String {
    "synonyms".to_string()
}
fn default_batch_size() -> usize {
    10
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_rerank_top_k() -> usize {
    30
}
fn default_retention_days() -> u32 {
    30
}
fn default_true() -> bool {
    true
}
fn default_cache_ttl_days() -> u32 {
    7
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}

impl Config {
    pub fn collection(&self, name: &str) -> Option<&CollectionConfig> {
        self.collections.iter().find(|c| c.name == name)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    config
        .chunking
        .params()
        .context("invalid [chunking] section")?;

    if config.retrieval.final_limit < 1 {
        bail!("retrieval.final_limit must be >= 1");
    }
    if config.retrieval.candidate_k < 1 {
        bail!("retrieval.candidate_k must be >= 1");
    }
    if config.retrieval.rrf_k < 0.0 {
        bail!("retrieval.rrf_k must be >= 0");
    }
    if config.retrieval.max_variants < 1 {
        bail!("retrieval.max_variants must be >= 1");
    }
    if config.embedding.batch_size < 1 {
        bail!("embedding.batch_size must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if matches!(config.embedding.provider.as_str(), "openai" | "ollama")
        && config.embedding.model.is_none()
    {
        bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    match config.rerank.provider.as_str() {
        "disabled" | "local" | "remote" => {}
        other => bail!(
            "Unknown rerank provider: '{}'. Must be disabled, local, or remote.",
            other
        ),
    }
    if config.rerank.provider == "remote" && config.rerank.url.is_none() {
        bail!("rerank.url must be specified when provider is 'remote'");
    }

    match config.expansion.provider.as_str() {
        "disabled" | "synonyms" | "llm" => {}
        other => bail!(
            "Unknown expansion provider: '{}'. Must be disabled, synonyms, or llm.",
            other
        ),
    }

    let mut names = std::collections::HashSet::new();
    for c in &config.collections {
        if c.name.trim().is_empty() {
            bail!("collection name must not be empty");
        }
        if c.name.contains('/') {
            bail!("collection name '{}' must not contain '/'", c.name);
        }
        if !names.insert(c.name.as_str()) {
            bail!("duplicate collection name: '{}'", c.name);
        }
    }

    Ok(())
}
