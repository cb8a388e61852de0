//! In-process `all-MiniLM-L6-v2` embeddings through ONNX Runtime.
//!
//! Tokenization uses the model's own `tokenizer.json`; the sentence vector is
//! the attention-masked mean of the last hidden state, L2-normalised.

use async_trait::async_trait;
use ort::session::Session;
use ort::value::Tensor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::embeddings::{validate_input, EmbeddingBackend, EmbeddingError, OnnxConfig};

pub struct OnnxEmbeddingClient {
    session: Arc<Mutex<Session>>,
    tokenizer: Arc<tokenizers::Tokenizer>,
    dimensions: usize,
    max_input_tokens: usize,
}

impl std::fmt::Debug for OnnxEmbeddingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxEmbeddingClient")
            .field("dimensions", &self.dimensions)
            .field("max_input_tokens", &self.max_input_tokens)
            .finish_non_exhaustive()
    }
}

impl OnnxEmbeddingClient {
    /// Load model and tokenizer. Missing files yield `ModelNotFound`.
    pub fn new(config: OnnxConfig) -> Result<Self, EmbeddingError> {
        for path in [&config.model_path, &config.tokenizer_path] {
            if !path.exists() {
                return Err(EmbeddingError::ModelNotFound {
                    path: path.display().to_string(),
                });
            }
        }

        let session = Session::builder()
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.commit_from_file(&config.model_path))
            .map_err(|e| EmbeddingError::OnnxInference(e.to_string()))?;

        let tokenizer = tokenizers::Tokenizer::from_file(&config.tokenizer_path)
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;

        tracing::info!(
            model = %config.model_path.display(),
            dimensions = config.dimensions,
            "Loaded ONNX embedding model"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
            dimensions: config.dimensions,
            max_input_tokens: config.max_input_tokens,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OnnxEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = validate_input(text, self.max_input_tokens)?.to_string();

        // CPU-bound; keep it off the async workers.
        let session = Arc::clone(&self.session);
        let tokenizer = Arc::clone(&self.tokenizer);
        let dimensions = self.dimensions;
        let max_tokens = self.max_input_tokens;

        tokio::task::spawn_blocking(move || {
            let mut session_guard = session
                .lock()
                .map_err(|e| EmbeddingError::OnnxInference(format!("session lock poisoned: {e}")))?;
            run_inference(&mut session_guard, &tokenizer, &text, dimensions, max_tokens)
        })
        .await
        .map_err(|e| EmbeddingError::OnnxInference(format!("spawn_blocking join error: {e}")))?
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_input_tokens(&self) -> usize {
        self.max_input_tokens
    }

    fn truncate_for_embedding(&self, text: &str) -> Result<String, EmbeddingError> {
        truncate_to_window(&self.tokenizer, text, self.max_input_tokens)
    }

    fn name(&self) -> &str {
        "onnx"
    }
}

/// Longest prefix of `text` that encodes to at most `max_tokens` ids, special
/// tokens included. The cut falls on a word start so that every kept word
/// re-encodes to the same pieces.
pub fn truncate_to_window(
    tokenizer: &tokenizers::Tokenizer,
    text: &str,
    max_tokens: usize,
) -> Result<String, EmbeddingError> {
    let encoding = tokenizer
        .encode(text, true)
        .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;
    if encoding.get_ids().len() <= max_tokens {
        return Ok(text.to_string());
    }

    let special = encoding.get_special_tokens_mask();
    let words = encoding.get_word_ids();
    let offsets = encoding.get_offsets();

    let content: Vec<usize> = (0..special.len()).filter(|&i| special[i] == 0).collect();
    let budget = max_tokens.saturating_sub(special.len() - content.len());
    let Some(&first_dropped) = content.get(budget) else {
        return Ok(text.to_string());
    };

    // Step back over pieces of the word the cut would split.
    let mut first = budget;
    while first > 0
        && words[content[first - 1]].is_some()
        && words[content[first - 1]] == words[first_dropped]
    {
        first -= 1;
    }

    let cut = offsets[content[first]].0;
    Ok(text.get(..cut).unwrap_or_default().trim_end().to_string())
}

fn run_inference(
    session: &mut Session,
    tokenizer: &tokenizers::Tokenizer,
    text: &str,
    expected_dims: usize,
    max_tokens: usize,
) -> Result<Vec<f32>, EmbeddingError> {
    let encoding = tokenizer
        .encode(text, true)
        .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;

    // Subword count can exceed the word count; the model window is what matters.
    let seq_len = encoding.get_ids().len();
    if seq_len > max_tokens {
        return Err(EmbeddingError::InputTooLong {
            tokens: seq_len,
            max: max_tokens,
        });
    }

    let to_i64 = |values: &[u32]| values.iter().map(|&v| v as i64).collect::<Vec<i64>>();
    let input_ids = to_i64(encoding.get_ids());
    let attention_mask = to_i64(encoding.get_attention_mask());
    let token_type_ids = to_i64(encoding.get_type_ids());

    let shape = vec![1i64, seq_len as i64];
    let tensor = |data: Vec<i64>| {
        Tensor::from_array((shape.clone(), data))
            .map_err(|e| EmbeddingError::OnnxInference(e.to_string()))
    };

    let inputs = ort::inputs! {
        "input_ids" => tensor(input_ids)?,
        "attention_mask" => tensor(attention_mask.clone())?,
        "token_type_ids" => tensor(token_type_ids)?,
    };

    let outputs = session
        .run(inputs)
        .map_err(|e| EmbeddingError::OnnxInference(e.to_string()))?;

    let (out_shape, data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| EmbeddingError::OnnxInference(e.to_string()))?;

    // [1, seq_len, hidden]
    if out_shape.len() != 3 {
        return Err(EmbeddingError::OnnxInference(format!(
            "Expected 3D output, got {}D",
            out_shape.len()
        )));
    }
    let out_seq_len = out_shape[1] as usize;
    let hidden_dim = out_shape[2] as usize;

    let pooled = mean_pool(data, &attention_mask, out_seq_len, hidden_dim);

    if pooled.len() != expected_dims {
        return Err(EmbeddingError::InvalidDimensions {
            expected: expected_dims,
            actual: pooled.len(),
        });
    }

    Ok(pooled)
}

/// Attention-masked mean over the sequence axis, then L2 normalisation.
fn mean_pool(data: &[f32], mask: &[i64], seq_len: usize, hidden_dim: usize) -> Vec<f32> {
    let mut pooled = vec![0.0f32; hidden_dim];
    let mut mask_sum = 0.0f32;

    for tok_idx in 0..seq_len {
        let weight = mask.get(tok_idx).copied().unwrap_or(0) as f32;
        if weight <= 0.0 {
            continue;
        }
        mask_sum += weight;
        let row = &data[tok_idx * hidden_dim..(tok_idx + 1) * hidden_dim];
        for (acc, value) in pooled.iter_mut().zip(row) {
            *acc += value * weight;
        }
    }
    if mask_sum > 0.0 {
        pooled.iter_mut().for_each(|v| *v /= mask_sum);
    }

    let norm: f32 = pooled.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        pooled.iter_mut().for_each(|v| *v /= norm);
    }
    pooled
}

/// `$XDG_DATA_HOME/libhub/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    let data_home = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".local/share")
        });
    data_home.join("libhub/models")
}

/// Model and tokenizer paths. An empty setting means the default model dir;
/// otherwise the tokenizer sits next to the model as `<stem>-tokenizer.json`.
pub fn resolve_onnx_paths(onnx_model_path: &str) -> (PathBuf, PathBuf) {
    if onnx_model_path.is_empty() {
        let dir = default_model_dir();
        return (
            dir.join("all-MiniLM-L6-v2.onnx"),
            dir.join("all-MiniLM-L6-v2-tokenizer.json"),
        );
    }

    let model = PathBuf::from(onnx_model_path);
    let stem = model
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let tokenizer = model.with_file_name(format!("{stem}-tokenizer.json"));
    (model, tokenizer)
}
