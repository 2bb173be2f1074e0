//! TOML configuration.
//!
//! Every section except `[db]` has defaults, so a minimal file is:
//!
//! ```toml
//! [db]
//! path = "./data/retrieval.sqlite"
//! ```
//!
//! [`load_config`] parses and validates a file; [`Config::validate`] runs
//! the same checks on a config built in code.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub repair: RepairConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Defaults everywhere, with the database at `path`.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: path.into(),
                max_connections: default_max_connections(),
            },
            retrieval: RetrievalConfig::default(),
            quality: QualityConfig::default(),
            ingest: IngestConfig::default(),
            repair: RepairConfig::default(),
            embedding: EmbeddingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.db.max_connections == 0 {
            bail!("db.max_connections must be >= 1");
        }

        let r = &self.retrieval;
        if r.k_const == 0 {
            bail!("retrieval.k_const must be > 0");
        }
        if r.max_results < 1 {
            bail!("retrieval.max_results must be >= 1");
        }
        if r.vector_k < 1 || r.keyword_k < 1 {
            bail!("retrieval.vector_k and retrieval.keyword_k must be >= 1");
        }
        if !(-1.0..=1.0).contains(&r.similarity_threshold) {
            bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
        }

        let q = &self.quality;
        if !(0.0..=1.0).contains(&q.threshold) {
            bail!("quality.threshold must be in [0.0, 1.0]");
        }
        if q.top_n < 1 {
            bail!("quality.top_n must be >= 1");
        }
        if q.fallback_k_multiplier < 1 {
            bail!("quality.fallback_k_multiplier must be >= 1");
        }
        if q.fallback_threshold_delta < 0.0 {
            bail!("quality.fallback_threshold_delta must be >= 0.0");
        }
        if !(-1.0..=1.0).contains(&q.min_similarity_threshold) {
            bail!("quality.min_similarity_threshold must be in [-1.0, 1.0]");
        }

        if self.repair.batch_size < 1 {
            bail!("repair.batch_size must be >= 1");
        }
        if self.repair.interval_secs == Some(0) {
            bail!("repair.interval_secs must be > 0 when set");
        }

        let e = &self.embedding;
        match e.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }
        if e.is_enabled() {
            if e.dims.is_none() || e.dims == Some(0) {
                bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
            }
            if e.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    e.provider
                );
            }
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k_const")]
    pub k_const: u32,
    #[serde(default = "default_candidate_k")]
    pub vector_k: usize,
    #[serde(default = "default_candidate_k")]
    pub keyword_k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Extra ids requested per read-through batch to absorb stale entries.
    #[serde(default = "default_overfetch")]
    pub overfetch: usize,
    #[serde(default = "default_query_timeout_ms")]
    pub vector_timeout_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub keyword_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_const: default_k_const(),
            vector_k: default_candidate_k(),
            keyword_k: default_candidate_k(),
            similarity_threshold: default_similarity_threshold(),
            max_results: default_max_results(),
            overfetch: default_overfetch(),
            vector_timeout_ms: default_query_timeout_ms(),
            keyword_timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl RetrievalConfig {
    pub fn vector_timeout(&self) -> Duration {
        Duration::from_millis(self.vector_timeout_ms)
    }

    pub fn keyword_timeout(&self) -> Duration {
        Duration::from_millis(self.keyword_timeout_ms)
    }
}

fn default_k_const() -> u32 {
    retrieval_core::fusion::DEFAULT_K_CONST
}
fn default_candidate_k() -> usize {
    40
}
fn default_similarity_threshold() -> f64 {
    0.2
}
fn default_max_results() -> usize {
    8
}
fn default_overfetch() -> usize {
    8
}
fn default_query_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct QualityConfig {
    /// Minimum aggregate score, on the normalized `[0, 1]` scale.
    #[serde(default = "default_quality_threshold")]
    pub threshold: f64,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_fallback_k_multiplier")]
    pub fallback_k_multiplier: usize,
    #[serde(default = "default_fallback_threshold_delta")]
    pub fallback_threshold_delta: f64,
    /// Floor for the lowered similarity threshold of a fallback attempt.
    #[serde(default)]
    pub min_similarity_threshold: f64,
    #[serde(default = "default_true")]
    pub expand_terms: bool,
    #[serde(default)]
    pub synonyms: HashMap<String, Vec<String>>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            threshold: default_quality_threshold(),
            top_n: default_top_n(),
            fallback_k_multiplier: default_fallback_k_multiplier(),
            fallback_threshold_delta: default_fallback_threshold_delta(),
            min_similarity_threshold: 0.0,
            expand_terms: true,
            synonyms: HashMap::new(),
        }
    }
}

fn default_quality_threshold() -> f64 {
    0.35
}
fn default_top_n() -> usize {
    3
}
fn default_fallback_k_multiplier() -> usize {
    3
}
fn default_fallback_threshold_delta() -> f64 {
    0.15
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_timeout_ms")]
    pub vector_timeout_ms: u64,
    #[serde(default = "default_ingest_timeout_ms")]
    pub keyword_timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            vector_timeout_ms: default_ingest_timeout_ms(),
            keyword_timeout_ms: default_ingest_timeout_ms(),
        }
    }
}

fn default_ingest_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepairConfig {
    #[serde(default = "default_repair_batch_size")]
    pub batch_size: usize,
    /// Period of the background repair task. No task runs when unset.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            batch_size: default_repair_batch_size(),
            interval_secs: None,
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_repair_batch_size() -> usize {
    256
}
fn default_max_attempts() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama default `http://localhost:11434`,
    /// OpenAI default `https://api.openai.com`).
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
            provider: default_provider(),
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

fn default_provider() -> String {
    "disabled".to_string()
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
    config.validate()?;

    Ok(config)
}
