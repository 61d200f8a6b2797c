/// Configuration for the indexing and retrieval engine
///
/// Collaborators (HTTP layer, CLI, supervisors) load and merge their own
/// sources; the engine only consumes the resulting value object. Loading
/// from TOML and environment overrides are provided for convenience with
/// priority: environment > config file > defaults.
use crate::error::{ConfigError, EngineError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Indexer and watcher configuration
    #[serde(default)]
    pub indexer: IndexerConfig,

    /// Chunking budgets (all byte counts)
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Per-language extension mapping and strategy selection
    #[serde(default = "default_languages")]
    pub languages: HashMap<String, LanguageConfig>,

    /// Embedding endpoint configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Query planner configuration
    #[serde(default)]
    pub query: QueryConfig,
}

/// Indexer and watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Seconds between fallback scans when native events are unavailable
    #[serde(default = "default_polling_interval")]
    pub polling_interval: f64,

    /// Size of the pipeline worker pool
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Hash function identifier for the hash cache
    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: String,

    /// Gitignore-syntax patterns applied on top of the engine defaults
    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    /// File extensions that are always ignored (binary, image, data)
    #[serde(default = "default_binary_extensions")]
    pub binary_extensions: Vec<String>,

    /// Capacity of each per-project task queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Milliseconds to coalesce repeated events for the same path
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Maximum file size to index, in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
}

/// Chunking budgets, applied to sliding windows and oversized AST nodes
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,

    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,

    /// Overlap between consecutive windows, in bytes
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

/// Per-language configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    /// File extensions (without dot) mapped to this language
    pub extensions: Vec<String>,

    /// One of: ast | sliding_window | json_object | yaml_document | markdown_section
    #[serde(default = "default_strategy_name")]
    pub chunking_strategy: String,
}

/// Embedding endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Base URL of the embedding service
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,

    /// Model identifier sent with every request and recorded per collection
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Number of texts per request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Process-wide bound on in-flight batches
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Retry policy for transient embedding failures
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Base delay before the first retry, in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

/// Query planner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Default number of results when the caller does not specify k
    #[serde(default = "default_k")]
    pub default_k: usize,

    /// Default minimum similarity score
    #[serde(default = "default_min_score")]
    pub min_score: f32,

    /// Byte budget for the concatenated context string
    #[serde(default = "default_context_budget")]
    pub context_budget: usize,
}

// Default value functions

fn default_polling_interval() -> f64 {
    30.0
}

fn default_max_workers() -> usize {
    4
}

fn default_hash_algorithm() -> String {
    "sha256".to_string()
}

fn default_binary_extensions() -> Vec<String> {
    [
        "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "pdf", "zip", "tar", "gz", "bz2", "xz",
        "7z", "exe", "dll", "so", "dylib", "a", "o", "class", "pyc", "wasm", "db", "sqlite",
        "parquet", "bin", "dat", "ttf", "otf", "woff", "woff2", "mp3", "mp4", "avi", "mov",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_max_file_size() -> usize {
    1_048_576 // 1 MB
}

fn default_max_chunk_size() -> usize {
    1024
}

fn default_min_chunk_size() -> usize {
    64
}

fn default_chunk_overlap() -> usize {
    128
}

fn default_strategy_name() -> String {
    "sliding_window".to_string()
}

fn default_embedding_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_batch_size() -> usize {
    16
}

fn default_max_in_flight() -> usize {
    4
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_attempts() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_k() -> usize {
    10
}

fn default_min_score() -> f32 {
    0.0
}

fn default_context_budget() -> usize {
    16_384
}

fn lang(extensions: &[&str], strategy: &str) -> LanguageConfig {
    LanguageConfig {
        extensions: extensions.iter().map(|s| s.to_string()).collect(),
        chunking_strategy: strategy.to_string(),
    }
}

fn default_languages() -> HashMap<String, LanguageConfig> {
    let mut languages = HashMap::new();
    languages.insert("rust".to_string(), lang(&["rs"], "ast"));
    languages.insert("python".to_string(), lang(&["py"], "ast"));
    languages.insert(
        "javascript".to_string(),
        lang(&["js", "jsx", "mjs", "cjs"], "ast"),
    );
    languages.insert("typescript".to_string(), lang(&["ts", "tsx"], "ast"));
    languages.insert("go".to_string(), lang(&["go"], "ast"));
    languages.insert("java".to_string(), lang(&["java"], "ast"));
    languages.insert("c".to_string(), lang(&["c", "h"], "ast"));
    languages.insert(
        "cpp".to_string(),
        lang(&["cpp", "cc", "cxx", "hpp", "hxx", "hh"], "ast"),
    );
    languages.insert("json".to_string(), lang(&["json"], "json_object"));
    languages.insert("yaml".to_string(), lang(&["yaml", "yml"], "yaml_document"));
    languages.insert(
        "markdown".to_string(),
        lang(&["md", "markdown"], "markdown_section"),
    );
    languages.insert("html".to_string(), lang(&["html", "htm"], "sliding_window"));
    languages.insert(
        "css".to_string(),
        lang(&["css", "scss", "sass", "less"], "sliding_window"),
    );
    languages.insert("text".to_string(), lang(&["txt"], "sliding_window"));
    languages
}

impl Default for Config {
    fn default() -> Self {
        Self {
            indexer: IndexerConfig::default(),
            chunking: ChunkingConfig::default(),
            languages: default_languages(),
            embedding: EmbeddingConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            polling_interval: default_polling_interval(),
            max_workers: default_max_workers(),
            hash_algorithm: default_hash_algorithm(),
            ignore_patterns: Vec::new(),
            binary_extensions: default_binary_extensions(),
            queue_capacity: default_queue_capacity(),
            debounce_ms: default_debounce_ms(),
            max_file_size: default_max_file_size(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_embedding_base_url(),
            model: default_embedding_model(),
            batch_size: default_batch_size(),
            max_in_flight: default_max_in_flight(),
            request_timeout: default_request_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            min_score: default_min_score(),
            context_budget: default_context_budget(),
        }
    }
}

const VALID_STRATEGIES: &[&str] = &[
    "ast",
    "sliding_window",
    "json_object",
    "yaml_document",
    "markdown_section",
];

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadFailed(format!("{}: {}", path.display(), e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseFailed(format!("Invalid TOML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides (CODERAG_*)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("CODERAG_EMBEDDING_URL") {
            self.embedding.base_url = url;
        }
        if let Ok(model) = std::env::var("CODERAG_EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
        if let Ok(v) = std::env::var("CODERAG_BATCH_SIZE")
            && let Ok(size) = v.parse()
        {
            self.embedding.batch_size = size;
        }
        if let Ok(v) = std::env::var("CODERAG_MAX_WORKERS")
            && let Ok(workers) = v.parse()
        {
            self.indexer.max_workers = workers;
        }
        if let Ok(v) = std::env::var("CODERAG_MIN_SCORE")
            && let Ok(score) = v.parse()
        {
            self.query.min_score = score;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.indexer.max_workers == 0 {
            return Err(invalid("indexer.max_workers", "must be greater than 0"));
        }
        if self.indexer.hash_algorithm != "sha256" {
            return Err(invalid(
                "indexer.hash_algorithm",
                &format!("unsupported algorithm '{}'", self.indexer.hash_algorithm),
            ));
        }
        if self.chunking.max_chunk_size == 0 {
            return Err(invalid("chunking.max_chunk_size", "must be greater than 0"));
        }
        if self.chunking.min_chunk_size > self.chunking.max_chunk_size {
            return Err(invalid(
                "chunking.min_chunk_size",
                "must not exceed chunking.max_chunk_size",
            ));
        }
        if self.chunking.chunk_overlap >= self.chunking.max_chunk_size {
            return Err(invalid(
                "chunking.chunk_overlap",
                "must be smaller than chunking.max_chunk_size",
            ));
        }
        if self.embedding.batch_size == 0 {
            return Err(invalid("embedding.batch_size", "must be greater than 0"));
        }
        if self.embedding.max_in_flight == 0 {
            return Err(invalid("embedding.max_in_flight", "must be greater than 0"));
        }
        if self.embedding.retry.max_attempts == 0 {
            return Err(invalid(
                "embedding.retry.max_attempts",
                "must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.query.min_score) {
            return Err(invalid(
                "query.min_score",
                &format!("must be between 0.0 and 1.0, got {}", self.query.min_score),
            ));
        }
        for (name, lang) in &self.languages {
            if !VALID_STRATEGIES.contains(&lang.chunking_strategy.as_str()) {
                return Err(invalid(
                    &format!("languages.{}.chunking_strategy", name),
                    &format!("unknown strategy '{}'", lang.chunking_strategy),
                ));
            }
            if lang.extensions.is_empty() {
                return Err(invalid(
                    &format!("languages.{}.extensions", name),
                    "must list at least one extension",
                ));
            }
        }
        Ok(())
    }

    /// Look up the language tag for a file extension
    pub fn language_for_extension(&self, extension: &str) -> Option<&str> {
        let ext = extension.to_lowercase();
        self.languages
            .iter()
            .find(|(_, lang)| lang.extensions.iter().any(|e| *e == ext))
            .map(|(name, _)| name.as_str())
    }

    /// Look up the configured chunking strategy for a language tag
    pub fn strategy_for_language(&self, language: &str) -> Option<&str> {
        self.languages
            .get(language)
            .map(|l| l.chunking_strategy.as_str())
    }
}

fn invalid(key: &str, reason: &str) -> EngineError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
    .into()
}
