//! Streaming text generation against an Ollama-compatible model server.
//!
//! `generate()` sends the prompt, waits for the response headers (retrying
//! once on transient failures) and hands back a `TokenStream`. A spawned
//! reader task decodes NDJSON lines and forwards text chunks over a bounded
//! channel. Dropping or cancelling the stream stops the reader and drops
//! the HTTP response, releasing the connection.

use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::retriever::SearchFilters;

/// Upper bound on one NDJSON line.
const MAX_LINE_BYTES: usize = 1 << 20;

const FILTER_PARSER_PROMPT: &str = r#"You are a search query parser for a library catalog. Extract filters from the user's query.
Return ONLY a JSON object with these keys (use null if not mentioned):
- search_query: the topical search terms, with the filter words removed
- max_pages: int (pages < X)
- min_pages: int (pages > X)
- genre: str (substring match)
- year_start: int (published after X)
- year_end: int (published before X)
- language: str (e.g. English, French)

Example: "sci-fi books under 300 pages from 2020"
Output: {"search_query": "sci-fi", "max_pages": 300, "min_pages": null, "genre": "sci-fi", "year_start": 2020, "year_end": null, "language": null}"#;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Model server unavailable: {0}")]
    Unavailable(String),

    #[error("Model server returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Model reported an error: {0}")]
    Model(String),

    #[error("No data from model server for {0:?}")]
    Timeout(Duration),

    #[error("Stream ended before the model finished")]
    Incomplete,

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl GenerationError {
    fn is_transient(&self) -> bool {
        match self {
            GenerationError::Unavailable(_) | GenerationError::Timeout(_) => true,
            GenerationError::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Map a transport failure that happened before any response arrived.
fn classify_transport(e: reqwest::Error, timeout: Duration) -> GenerationError {
    if e.is_connect() {
        GenerationError::Unavailable(e.to_string())
    } else if e.is_timeout() {
        GenerationError::Timeout(timeout)
    } else {
        GenerationError::Http(e)
    }
}

pub type Chunk = Result<String, GenerationError>;

// ============================================================================
// TokenStream
// ============================================================================

/// Lazy, finite, non-restartable sequence of generated text chunks.
///
/// An `Err` item is terminal: nothing follows it.
pub struct TokenStream {
    rx: mpsc::Receiver<Chunk>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

/// Producer half handed to the reader task.
#[derive(Clone)]
pub struct ChunkSender {
    tx: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
}

impl TokenStream {
    pub fn channel(capacity: usize) -> (ChunkSender, TokenStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let sender = ChunkSender {
            tx,
            cancel: cancel.clone(),
        };
        let stream = TokenStream {
            rx,
            _guard: cancel.clone().drop_guard(),
            cancel,
        };
        (sender, stream)
    }

    /// A stream that yields `chunks` and then finishes normally.
    pub fn from_chunks<I, S>(chunks: I) -> TokenStream
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chunks: Vec<String> = chunks.into_iter().map(Into::into).collect();
        let (tx, stream) = TokenStream::channel(chunks.len().max(1));
        tokio::spawn(async move {
            for chunk in chunks {
                if !tx.send(Ok(chunk)).await {
                    break;
                }
            }
        });
        stream
    }

    /// Stop the producer. Already buffered chunks are discarded.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn next_chunk(&mut self) -> Option<Chunk> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.rx.recv().await
    }
}

impl Stream for TokenStream {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl ChunkSender {
    /// Forward one chunk. Returns false once the consumer is gone or cancelled.
    pub async fn send(&self, chunk: Chunk) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(chunk) => sent.is_ok(),
        }
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ============================================================================
// GenerationBackend trait
// ============================================================================

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Start generating a reply for `prompt`.
    ///
    /// Errors returned here happened before any chunk was produced.
    async fn generate(&self, prompt: &str) -> Result<TokenStream, GenerationError>;

    /// Turn a request into structured search filters. The default only
    /// carries the raw query.
    async fn extract_filters(&self, query: &str) -> Result<SearchFilters, GenerationError> {
        Ok(SearchFilters {
            search_query: Some(query.to_string()),
            ..Default::default()
        })
    }

    fn name(&self) -> &str;
}

// ============================================================================
// Ollama
// ============================================================================

#[derive(Debug, Clone)]
pub struct OllamaGenerationConfig {
    pub base_url: String,
    pub model: String,
    pub retry_delay_ms: u64,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub channel_capacity: usize,
}

impl OllamaGenerationConfig {
    pub fn from_settings(settings: &crate::config::GenerationConfig) -> Self {
        Self {
            base_url: settings.base_url.clone(),
            model: settings.model.clone(),
            retry_delay_ms: settings.retry_delay_ms,
            connect_timeout: Duration::from_secs(settings.connect_timeout_seconds),
            idle_timeout: Duration::from_secs(settings.idle_timeout_seconds),
            channel_capacity: settings.channel_capacity,
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OllamaGenerationClient {
    client: Client,
    config: OllamaGenerationConfig,
}

impl OllamaGenerationClient {
    pub fn new(config: OllamaGenerationConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!("{}/api/generate", self.config.base_url.trim_end_matches('/'))
    }

    async fn open_stream(&self, prompt: &str) -> Result<reqwest::Response, GenerationError> {
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: true,
            system: None,
            format: None,
        };

        let pending = self.client.post(self.url()).json(&request).send();
        let response = tokio::time::timeout(self.config.idle_timeout, pending)
            .await
            .map_err(|_| GenerationError::Timeout(self.config.idle_timeout))?
            .map_err(|e| classify_transport(e, self.config.connect_timeout))?;

        let status = response.status();
        if !status.is_success() {
            let message = upstream_message(response).await;
            tracing::warn!(status = status.as_u16(), message = %message, "Generation request rejected");
            return Err(GenerationError::Upstream {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

async fn upstream_message(response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();
    serde_json::from_str::<GenerateChunk>(&body)
        .ok()
        .and_then(|c| c.error)
        .unwrap_or(body)
}

/// Decode NDJSON lines from `response` into `tx` until done, error or cancel.
async fn pump_ndjson(response: reqwest::Response, tx: ChunkSender, idle_timeout: Duration) {
    let body = response.bytes_stream().map_err(std::io::Error::other);
    let mut lines = FramedRead::new(
        StreamReader::new(body),
        LinesCodec::new_with_max_length(MAX_LINE_BYTES),
    );
    let mut forwarded = 0usize;

    loop {
        let next = tokio::select! {
            _ = tx.cancelled() => {
                tracing::debug!(chunks = forwarded, "Generation cancelled by consumer");
                return;
            }
            next = tokio::time::timeout(idle_timeout, lines.next()) => next,
        };

        let line = match next {
            Err(_) => {
                tracing::warn!(chunks = forwarded, "Generation stream went idle");
                tx.send(Err(GenerationError::Timeout(idle_timeout))).await;
                return;
            }
            Ok(None) => {
                tracing::warn!(chunks = forwarded, "Generation stream closed before done");
                tx.send(Err(GenerationError::Incomplete)).await;
                return;
            }
            Ok(Some(Err(e))) => {
                tx.send(Err(GenerationError::Malformed(e.to_string()))).await;
                return;
            }
            Ok(Some(Ok(line))) => line,
        };

        if line.trim().is_empty() {
            continue;
        }

        let chunk: GenerateChunk = match serde_json::from_str(&line) {
            Ok(c) => c,
            Err(e) => {
                tx.send(Err(GenerationError::Malformed(e.to_string()))).await;
                return;
            }
        };

        if let Some(error) = chunk.error {
            tx.send(Err(GenerationError::Model(error))).await;
            return;
        }
        if !chunk.response.is_empty() {
            if !tx.send(Ok(chunk.response)).await {
                return;
            }
            forwarded += 1;
        }
        if chunk.done {
            tracing::debug!(chunks = forwarded, "Generation finished");
            return;
        }
    }
}

#[async_trait]
impl GenerationBackend for OllamaGenerationClient {
    async fn generate(&self, prompt: &str) -> Result<TokenStream, GenerationError> {
        // One retry at most, and only while no chunk has been produced.
        let strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(1);

        let response = RetryIf::spawn(
            strategy,
            || self.open_stream(prompt),
            |e: &GenerationError| {
                let retry = e.is_transient();
                if retry {
                    tracing::warn!(error = %e, "Generation request failed, retrying once");
                }
                retry
            },
        )
        .await?;

        let (tx, stream) = TokenStream::channel(self.config.channel_capacity);
        tokio::spawn(pump_ndjson(response, tx, self.config.idle_timeout));
        Ok(stream)
    }

    async fn extract_filters(&self, query: &str) -> Result<SearchFilters, GenerationError> {
        let prompt = format!("Query: {query}\nJSON:");
        let request = GenerateRequest {
            model: &self.config.model,
            prompt: &prompt,
            stream: false,
            system: Some(FILTER_PARSER_PROMPT),
            format: Some("json"),
        };

        let response = self
            .client
            .post(self.url())
            .timeout(self.config.idle_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport(e, self.config.idle_timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError::Upstream {
                status: status.as_u16(),
                message: upstream_message(response).await,
            });
        }

        let body: GenerateChunk = response.json().await?;
        let mut filters: SearchFilters = serde_json::from_str(&body.response)
            .map_err(|e| GenerationError::Malformed(format!("filter JSON: {e}")))?;

        if filters
            .search_query
            .as_deref()
            .map_or(true, |q| q.trim().is_empty())
        {
            filters.search_query = Some(query.to_string());
        }
        Ok(filters)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

// ============================================================================
// TESTS
// ============================================================================
