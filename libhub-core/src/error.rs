use thiserror::Error;

use crate::context::ContextError;
use crate::embeddings::EmbeddingError;
use crate::generation::GenerationError;
use crate::index::IndexError;
use crate::retriever::RetrievalError;

#[derive(Error, Debug)]
pub enum LibhubError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Other error: {0}")]
    Other(String),
}
