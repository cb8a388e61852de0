//! Embeddings module for Library Hub: multi-backend embedding support
//!
//! Provides an `EmbeddingBackend` trait with implementations for:
//! - **Ollama**: embeddings served by a local Ollama daemon (`/api/embed`)
//! - **ONNX**: in-process `all-MiniLM-L6-v2` (384-dim), see `onnx_embedder`
//! - **Hashing**: deterministic feature-hashing bag-of-words, no model needed
//!
//! Every backend rejects empty input and input above its token budget before
//! doing any work, so callers see the same `EmbeddingError` regardless of backend.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::tokens::{count_tokens, truncate_tokens};

/// Output size of `all-MiniLM-L6-v2`, the catalog's reference model.
pub const MINILM_DIMENSIONS: usize = 384;

/// Token budget of `all-MiniLM-L6-v2` (max sequence length).
pub const MINILM_MAX_TOKENS: usize = 256;

// ============================================================================
// EmbeddingBackend trait
// ============================================================================

/// Abstraction over embedding providers.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed a document text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed a search query. Defaults to `embed()`; backends with
    /// query-specific prompting can override it.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed(text).await
    }

    /// Returns the embedding dimension (e.g., 384).
    fn dimensions(&self) -> usize;

    /// Largest accepted input, in tokens.
    fn max_input_tokens(&self) -> usize;

    /// Cut a document down to what `embed` accepts. Defaults to the first
    /// `max_input_tokens()` whitespace words; backends that count subword
    /// tokens override it with their own tokenizer.
    fn truncate_for_embedding(&self, text: &str) -> Result<String, EmbeddingError> {
        Ok(truncate_tokens(text, self.max_input_tokens()))
    }

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

/// Embedding generation errors
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Input text is empty")]
    EmptyInput,

    #[error("Input has {tokens} tokens, budget is {max}")]
    InputTooLong { tokens: usize, max: usize },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid response: expected {expected} dimensions, got {actual}")]
    InvalidDimensions { expected: usize, actual: usize },

    #[error("Missing embedding in response")]
    MissingEmbedding,

    #[error("All {attempts} attempts failed, last error: {last_error}")]
    RetryExhausted { attempts: usize, last_error: String },

    #[error("ONNX model not found at {path}")]
    ModelNotFound { path: String },

    #[error("ONNX inference error: {0}")]
    OnnxInference(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Unknown embedding backend '{0}'")]
    UnknownBackend(String),
}

impl EmbeddingError {
    /// Errors worth retrying: transport failures, rate limiting, server faults.
    pub fn is_transient(&self) -> bool {
        match self {
            EmbeddingError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            EmbeddingError::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

/// Reject empty input and input above `max_tokens`. Returns the trimmed text.
pub fn validate_input(text: &str, max_tokens: usize) -> Result<&str, EmbeddingError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(EmbeddingError::EmptyInput);
    }
    let tokens = count_tokens(trimmed);
    if tokens > max_tokens {
        return Err(EmbeddingError::InputTooLong {
            tokens,
            max: max_tokens,
        });
    }
    Ok(trimmed)
}

// ============================================================================
// Config types
// ============================================================================

/// Ollama embedding client configuration
#[derive(Debug, Clone)]
pub struct OllamaEmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
    pub max_input_tokens: usize,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

/// ONNX backend configuration
#[derive(Debug, Clone)]
pub struct OnnxConfig {
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub dimensions: usize,
    pub max_input_tokens: usize,
}

/// Configuration union for the backend factory.
pub enum BackendConfig {
    Ollama(OllamaEmbeddingConfig),
    Onnx(OnnxConfig),
    Hashing {
        dimensions: usize,
        max_input_tokens: usize,
    },
}

impl BackendConfig {
    /// Select a backend from the `[embedding]` config section.
    pub fn from_settings(settings: &crate::config::EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let dimensions = settings.dimensions as usize;
        let max_input_tokens = settings.max_input_tokens as usize;

        match settings.backend.as_str() {
            "ollama" => Ok(BackendConfig::Ollama(OllamaEmbeddingConfig {
                base_url: settings.ollama_url.clone(),
                model: settings.ollama_model.clone(),
                dimensions,
                max_input_tokens,
                max_retries: settings.max_retries as usize,
                retry_delay_ms: settings.retry_delay_ms,
            })),
            "onnx" => {
                let (model_path, tokenizer_path) =
                    crate::onnx_embedder::resolve_onnx_paths(&settings.onnx_model_path);
                Ok(BackendConfig::Onnx(OnnxConfig {
                    model_path,
                    tokenizer_path,
                    dimensions,
                    max_input_tokens,
                }))
            }
            "hashing" => Ok(BackendConfig::Hashing {
                dimensions,
                max_input_tokens,
            }),
            other => Err(EmbeddingError::UnknownBackend(other.to_string())),
        }
    }
}

/// Create the appropriate backend from configuration.
pub fn create_backend(config: BackendConfig) -> Result<Box<dyn EmbeddingBackend>, EmbeddingError> {
    match config {
        BackendConfig::Ollama(c) => Ok(Box::new(OllamaEmbeddingClient::new(c)?)),
        BackendConfig::Onnx(c) => {
            Ok(Box::new(crate::onnx_embedder::OnnxEmbeddingClient::new(c)?))
        }
        BackendConfig::Hashing {
            dimensions,
            max_input_tokens,
        } => Ok(Box::new(HashingEmbedder::new(dimensions, max_input_tokens))),
    }
}

// ============================================================================
// Ollama API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct OllamaErrorResponse {
    error: String,
}

// ============================================================================
// OllamaEmbeddingClient
// ============================================================================

/// Calls the Ollama embeddings endpoint.
#[derive(Debug, Clone)]
pub struct OllamaEmbeddingClient {
    client: Client,
    config: OllamaEmbeddingConfig,
}

impl OllamaEmbeddingClient {
    pub fn new(config: OllamaEmbeddingConfig) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { client, config })
    }

    /// Embed with bounded retry on transient failures.
    pub async fn embed_raw(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = validate_input(text, self.config.max_input_tokens)?;

        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let result = RetryIf::spawn(
            retry_strategy,
            || self.embed_once(text),
            |e: &EmbeddingError| e.is_transient(),
        )
        .await;

        match result {
            Ok(vec) => Ok(vec),
            Err(e) if e.is_transient() => {
                let attempts = self.config.max_retries + 1;
                tracing::error!(
                    attempts = attempts,
                    error = %e,
                    "All embedding attempts failed"
                );
                Err(EmbeddingError::RetryExhausted {
                    attempts,
                    last_error: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/api/embed", self.config.base_url.trim_end_matches('/'));
        let request = OllamaEmbedRequest {
            model: &self.config.model,
            input: text,
        };

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<OllamaErrorResponse>(&error_body)
                .map(|e| e.error)
                .unwrap_or(error_body);

            tracing::warn!(code = status.as_u16(), message = %message, "Ollama embedding API error");

            return Err(EmbeddingError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let body: OllamaEmbedResponse = response.json().await?;
        let values = body
            .embeddings
            .into_iter()
            .next()
            .ok_or(EmbeddingError::MissingEmbedding)?;

        if values.len() != self.config.dimensions {
            return Err(EmbeddingError::InvalidDimensions {
                expected: self.config.dimensions,
                actual: values.len(),
            });
        }

        Ok(values)
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_raw(text).await
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn max_input_tokens(&self) -> usize {
        self.config.max_input_tokens
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

// ============================================================================
// HashingEmbedder
// ============================================================================

/// Words that carry no topical signal in catalog queries.
const STOP_WORDS: &[&str] = &[
    "a", "about", "an", "and", "any", "anything", "are", "as", "at", "be", "book", "books", "by",
    "can", "do", "for", "from", "have", "i", "in", "is", "it", "me", "my", "of", "on", "or",
    "some", "something", "that", "the", "this", "to", "was", "what", "with", "you",
];

/// Deterministic bag-of-words embedder.
///
/// Each lower-cased alphanumeric term outside `STOP_WORDS` is hashed (FNV-1a)
/// into one of `dimensions` buckets with a hash-derived sign; the result is
/// L2-normalised. Texts sharing terms get positive cosine similarity, which is
/// enough for offline use and for tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
    max_input_tokens: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize, max_input_tokens: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            max_input_tokens,
        }
    }

    pub fn embed_sync(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = validate_input(text, self.max_input_tokens)?;

        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        if words.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut terms: Vec<&str> = words
            .iter()
            .copied()
            .filter(|w| !STOP_WORDS.contains(w))
            .collect();
        // A text made only of stop words still gets a stable, non-zero vector.
        if terms.is_empty() {
            terms = words;
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for term in terms {
            let hash = fnv1a(term.as_bytes());
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if (hash >> 63) & 1 == 1 { -1.0 } else { 1.0 };
            vector[bucket] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }

        Ok(vector)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

#[async_trait]
impl EmbeddingBackend for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_sync(text)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_input_tokens(&self) -> usize {
        self.max_input_tokens
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

// ============================================================================
// TESTS
// ============================================================================
