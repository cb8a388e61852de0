use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct LibhubConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub context: ContextConfig,
    pub generation: GenerationConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Where the book catalog is read from: `postgres` or `json`.
#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    pub source: String,
    /// Path of the JSON catalog when `source = "json"`.
    pub path: String,
    /// Copies assumed per book when the catalog carries no copy data.
    pub default_copies: u32,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            source: "postgres".to_string(),
            path: "data/books.json".to_string(),
            default_copies: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `ollama`, `onnx` or `hashing`.
    pub backend: String,
    pub dimensions: u32,
    pub max_input_tokens: u32,
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default = "default_embedding_model")]
    pub ollama_model: String,
    #[serde(default)]
    pub onnx_model_path: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_embedding_model() -> String {
    "all-minilm".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `memory` or `pgvector`.
    pub backend: String,
    /// Minutes between catalog re-index runs; 0 disables the worker.
    pub reindex_interval_minutes: u64,
    /// Embedding requests per minute during indexing; 0 means unthrottled.
    pub rate_limit_rpm: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            reindex_interval_minutes: 0,
            rate_limit_rpm: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    pub default_k: usize,
    pub max_k: usize,
    pub min_score: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: 5,
            max_k: 20,
            min_score: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    pub max_context_tokens: usize,
    pub synopsis_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 1500,
            synopsis_chars: 300,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Ask the model to turn the query into structured search filters first.
    #[serde(default)]
    pub extract_filters: bool,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_channel_capacity() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    pub max_turns: usize,
    /// `discard` or `mark_incomplete`.
    pub partial_replies: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: 40,
            partial_replies: "discard".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl LibhubConfig {
    /// Load from a TOML file, then apply `LIBHUB__SECTION__KEY` environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("LIBHUB").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    /// Parse a TOML document directly (tests and embedded defaults).
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        s.try_deserialize()
    }
}
