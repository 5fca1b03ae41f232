//! Configuration parsing and validation.
//!
//! Configuration is loaded from a TOML file (default `config/bridge.toml`).
//! Every section is optional; a bridge started without a config file runs
//! on [`Config::minimal`].
//!
//! # Example Configuration
//!
//! ```toml
//! [storage]
//! banks_dir = "./memory-banks"
//! recover_on_start = true
//!
//! [chunking]
//! max_tokens = 128
//! overlap_tokens = 0
//!
//! [retrieval]
//! default_top_k = 5
//! max_top_k = 50
//!
//! [embedding]
//! provider = "ollama"          # "hash" | "ollama" | "openai" | "local"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [sources]
//! default_extensions = ["txt", "md", "py", "js", "ts", "json"]
//! exclude_globs = ["**/*.lock"]
//!
//! [logging]
//! level = "info"
//! ```
//!
//! # Validation Rules
//!
//! - `chunking.max_tokens` must be > 0 and greater than `overlap_tokens`
//! - `retrieval.default_top_k` must be ≥ 1 and ≤ `retrieval.max_top_k`
//! - `retrieval.min_score` must be in `[-1.0, 1.0]`
//! - `embedding.provider` must be one of `hash`, `ollama`, `openai`, `local`
//! - `embedding.dims` must be > 0 when set; network providers require `model`
//! - every `sources.exclude_globs` entry must be a valid glob

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable that overrides `storage.banks_dir`.
pub const BANKS_DIR_ENV: &str = "MEMORY_BANKS_DIR";

/// Config path used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "config/bridge.toml";

/// Characters per token when converting configured token limits.
pub const CHARS_PER_TOKEN: usize = 4;

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Base directory for relative artifact paths.
    #[serde(default = "default_banks_dir")]
    pub banks_dir: PathBuf,
    /// Resolve half-applied updates under `banks_dir` when `serve` starts.
    #[serde(default = "default_true")]
    pub recover_on_start: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            banks_dir: default_banks_dir(),
            recover_on_start: true,
        }
    }
}

fn default_banks_dir() -> PathBuf {
    PathBuf::from("./memory-banks")
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: 0,
        }
    }
}

fn default_max_tokens() -> usize {
    128
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    #[serde(default)]
    pub min_score: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            min_score: 0.0,
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_max_top_k() -> usize {
    50
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
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Endpoint override for network providers.
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
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
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

impl EmbeddingConfig {
    /// Whether the provider talks to a remote service.
    pub fn is_remote(&self) -> bool {
        matches!(self.provider.as_str(), "ollama" | "openai")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourcesConfig {
    /// Extensions accepted by `directory` sources without explicit filters.
    #[serde(default = "default_extensions")]
    pub default_extensions: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_url_timeout_secs")]
    pub url_timeout_secs: u64,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            default_extensions: default_extensions(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_file_bytes: default_max_file_bytes(),
            url_timeout_secs: default_url_timeout_secs(),
        }
    }
}

fn default_extensions() -> Vec<String> {
    ["txt", "md", "py", "js", "ts", "json"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_url_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Defaults for every section, with the banks directory env override.
    pub fn minimal() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(BANKS_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.storage.banks_dir = PathBuf::from(dir);
            }
        }
    }
}

/// Load and validate a config file.
///
/// When `path` is `None` the default location is tried and a missing file
/// yields [`Config::minimal`]. An explicitly named file must exist.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };

    if !explicit && !path.exists() {
        return Ok(Config::minimal());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let mut config = parse_config(&content)?;
    config.apply_env();
    Ok(config)
}

/// Parse and validate TOML text without touching the environment.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    // Validate retrieval
    if config.retrieval.default_top_k < 1 {
        bail!("retrieval.default_top_k must be >= 1");
    }
    if config.retrieval.default_top_k > config.retrieval.max_top_k {
        bail!("retrieval.default_top_k must be <= retrieval.max_top_k");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_score) {
        bail!("retrieval.min_score must be in [-1.0, 1.0]");
    }

    // Validate embedding
    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "hash" | "ollama" | "openai" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash, ollama, openai, or local.",
            other
        ),
    }
    if embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    if embedding.is_remote() && embedding.model.is_none() {
        bail!(
            "embedding.model must be specified when provider is '{}'",
            embedding.provider
        );
    }
    if embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    // Validate sources
    for pattern in &config.sources.exclude_globs {
        globset::Glob::new(pattern)
            .with_context(|| format!("Invalid sources.exclude_globs entry: {}", pattern))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.storage.banks_dir, PathBuf::from("./memory-banks"));
        assert!(config.storage.recover_on_start);
        assert_eq!(config.chunking.max_tokens, 128);
        assert_eq!(config.retrieval.default_top_k, 5);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.sources.default_extensions.len(), 6);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = parse_config(
            r#"
[storage]
banks_dir = "/tmp/banks"
recover_on_start = false

[chunking]
max_tokens = 64
overlap_tokens = 8

[embedding]
provider = "ollama"
model = "nomic-embed-text"
dims = 768
"#,
        )
        .unwrap();
        assert_eq!(config.storage.banks_dir, PathBuf::from("/tmp/banks"));
        assert!(!config.storage.recover_on_start);
        assert_eq!(config.chunking.overlap_tokens, 8);
        assert!(config.embedding.is_remote());
    }

    #[test]
    fn test_rejects_zero_max_tokens() {
        let err = parse_config("[chunking]\nmax_tokens = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_tokens"));
    }

    #[test]
    fn test_rejects_overlap_not_below_max() {
        assert!(parse_config("[chunking]\nmax_tokens = 10\noverlap_tokens = 10\n").is_err());
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = parse_config("[embedding]\nprovider = \"carrier-pigeon\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_remote_provider_requires_model() {
        assert!(parse_config("[embedding]\nprovider = \"openai\"\n").is_err());
    }

    #[test]
    fn test_rejects_bad_exclude_glob() {
        assert!(parse_config("[sources]\nexclude_globs = [\"a[\"]\n").is_err());
    }

    #[test]
    fn test_top_k_bounds() {
        assert!(parse_config("[retrieval]\ndefault_top_k = 0\n").is_err());
        assert!(parse_config("[retrieval]\ndefault_top_k = 60\nmax_top_k = 50\n").is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(load_config(Some(&tmp.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_explicit_file_is_loaded() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("bridge.toml");
        std::fs::write(&path, "[retrieval]\ndefault_top_k = 3\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.retrieval.default_top_k, 3);
    }
}
