//! TOML configuration.
//!
//! Loaded once per process by [`load_config`], which applies defaults and
//! rejects settings the pipeline could not run with. See
//! `config/sts.example.toml` for a documented example.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use standards_search_core::chunk::ChunkParams;
use standards_search_core::embedding::EmbedderOptions;
use standards_search_core::index::Metric;
use standards_search_core::retrieve::RetrievalOptions;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Second generation being backfilled during a model migration.
    #[serde(default)]
    pub embedding_next: Option<EmbeddingConfig>,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub target_tokens: usize,
    #[serde(default)]
    pub overlap_tokens: usize,
    #[serde(default)]
    pub boundary_tolerance: usize,
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams::new(self.target_tokens, self.overlap_tokens)
            .with_boundary_tolerance(self.boundary_tolerance)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IndexConfig {
    #[serde(default)]
    pub metric: Metric,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for OpenAI-compatible or Ollama endpoints.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_input_tokens: Option<usize>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            timeout_secs: default_timeout_secs(),
            max_input_tokens: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    32_000
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn embedder_options(&self) -> EmbedderOptions {
        EmbedderOptions {
            batch_size: self.batch_size,
            max_concurrency: self.max_concurrency,
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    fn validate(&self, section: &str) -> Result<()> {
        match self.provider.as_str() {
            "disabled" | "openai" | "ollama" | "hashing" | "local" => {}
            other => bail!(
                "Unknown {}.provider: '{}'. Must be disabled, openai, ollama, hashing, or local.",
                section,
                other
            ),
        }
        if !self.is_enabled() {
            return Ok(());
        }
        if matches!(self.provider.as_str(), "openai" | "ollama") {
            if self.dims.is_none() || self.dims == Some(0) {
                bail!(
                    "{}.dims must be > 0 when provider is '{}'",
                    section,
                    self.provider
                );
            }
            if self.model.is_none() {
                bail!(
                    "{}.model must be specified when provider is '{}'",
                    section,
                    self.provider
                );
            }
        }
        if self.dims == Some(0) {
            bail!("{}.dims must be > 0", section);
        }
        if self.batch_size == 0 {
            bail!("{}.batch_size must be >= 1", section);
        }
        if self.max_concurrency == 0 {
            bail!("{}.max_concurrency must be >= 1", section);
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            bail!(
                "{}.initial_backoff_ms must not exceed max_backoff_ms",
                section
            );
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,
    #[serde(default = "default_adjacency_window")]
    pub adjacency_window: usize,
    #[serde(default)]
    pub min_score: Option<f32>,
    #[serde(default = "default_query_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_context_tokens: default_max_context_tokens(),
            overfetch_factor: default_overfetch_factor(),
            adjacency_window: default_adjacency_window(),
            min_score: None,
            timeout_secs: default_query_timeout_secs(),
        }
    }
}

impl RetrievalConfig {
    pub fn options(&self) -> RetrievalOptions {
        RetrievalOptions {
            overfetch_factor: self.overfetch_factor,
            adjacency_window: self.adjacency_window,
            min_score: self.min_score,
        }
    }
}

fn default_k() -> usize {
    8
}
fn default_max_context_tokens() -> usize {
    3000
}
fn default_overfetch_factor() -> usize {
    3
}
fn default_adjacency_window() -> usize {
    1
}
fn default_query_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_parallel_documents")]
    pub max_parallel_documents: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_parallel_documents: default_max_parallel_documents(),
        }
    }
}

fn default_max_parallel_documents() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_generation_timeout_secs() -> u64 {
    60
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
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

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.target_tokens == 0 {
        bail!("chunking.target_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.target_tokens {
        bail!("chunking.overlap_tokens must be smaller than chunking.target_tokens");
    }
    if config.chunking.boundary_tolerance
        >= config.chunking.target_tokens - config.chunking.overlap_tokens
    {
        bail!("chunking.boundary_tolerance must be smaller than target_tokens - overlap_tokens");
    }

    // Retrieval
    if config.retrieval.default_k == 0 {
        bail!("retrieval.default_k must be >= 1");
    }
    if config.retrieval.overfetch_factor == 0 {
        bail!("retrieval.overfetch_factor must be >= 1");
    }
    if config.retrieval.max_context_tokens == 0 {
        bail!("retrieval.max_context_tokens must be > 0");
    }
    if config.retrieval.min_score.is_some_and(|s| !s.is_finite()) {
        bail!("retrieval.min_score must be a finite number");
    }

    // Embedding
    config.embedding.validate("embedding")?;
    if let Some(next) = &config.embedding_next {
        next.validate("embedding_next")?;
        if !next.is_enabled() {
            bail!("embedding_next.provider must not be 'disabled'");
        }
    }

    if config.ingest.max_parallel_documents == 0 {
        bail!("ingest.max_parallel_documents must be >= 1");
    }

    match config.generation.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.generation.model.is_none() {
                bail!("generation.model must be specified when provider is 'openai'");
            }
        }
        other => bail!(
            "Unknown generation.provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let content = format!(
            r#"
[db]
path = "./data/sts.sqlite"

[chunking]
target_tokens = 500
overlap_tokens = 50
{}
"#,
            extra
        );
        let config: Config = toml::from_str(&content)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.index.metric, Metric::Cosine);
        assert!(!config.embedding.is_enabled());
        assert!(!config.generation.is_enabled());
        assert_eq!(config.retrieval.default_k, 8);
        assert_eq!(config.retrieval.overfetch_factor, 3);
        assert_eq!(config.chunking.params(), ChunkParams::new(500, 50));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_overlap_must_be_below_target() {
        let content = r#"
[db]
path = "x.sqlite"

[chunking]
target_tokens = 50
overlap_tokens = 50
"#;
        let config: Config = toml::from_str(content).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_metric_parsed() {
        let config = parse("[index]\nmetric = \"dot\"").unwrap();
        assert_eq!(config.index.metric, Metric::Dot);
        assert!(parse("[index]\nmetric = \"l2\"").is_err());
    }

    #[test]
    fn test_remote_provider_requires_model_and_dims() {
        assert!(parse("[embedding]\nprovider = \"openai\"\nmodel = \"m\"").is_err());
        assert!(parse("[embedding]\nprovider = \"ollama\"\ndims = 768").is_err());
        assert!(parse("[embedding]\nprovider = \"openai\"\nmodel = \"m\"\ndims = 1536").is_ok());
    }

    #[test]
    fn test_hashing_provider_needs_nothing_else() {
        let config = parse("[embedding]\nprovider = \"hashing\"").unwrap();
        assert!(config.embedding.is_enabled());
    }

    #[test]
    fn test_unknown_providers_rejected() {
        assert!(parse("[embedding]\nprovider = \"magic\"").is_err());
        assert!(parse("[generation]\nprovider = \"magic\"").is_err());
        assert!(parse("[generation]\nprovider = \"openai\"").is_err());
    }

    #[test]
    fn test_embedder_options() {
        let config = parse(
            "[embedding]\nprovider = \"hashing\"\ninitial_backoff_ms = 10\nmax_backoff_ms = 80",
        )
        .unwrap();
        let options = config.embedding.embedder_options();
        assert_eq!(options.initial_backoff, Duration::from_millis(10));
        assert_eq!(options.max_backoff, Duration::from_millis(80));
        assert!(parse(
            "[embedding]\nprovider = \"hashing\"\ninitial_backoff_ms = 100\nmax_backoff_ms = 10"
        )
        .is_err());
    }
}
