pub mod config;
pub mod context;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod generation;
pub mod index;
pub mod models;
pub mod onnx_embedder;
pub mod pgvector_index;
pub mod retriever;
pub mod session;
pub mod tokens;

pub use config::LibhubConfig;
pub use context::{ContextAssembler, ContextError};
pub use embeddings::{
    create_backend, BackendConfig, EmbeddingBackend, EmbeddingError, HashingEmbedder,
    OllamaEmbeddingClient, OllamaEmbeddingConfig, OnnxConfig, MINILM_DIMENSIONS,
    MINILM_MAX_TOKENS,
};
pub use error::LibhubError;
pub use generation::{
    GenerationBackend, GenerationError, OllamaGenerationClient, OllamaGenerationConfig,
    TokenStream,
};
pub use index::{InMemoryVectorIndex, IndexError, VectorIndex};
pub use onnx_embedder::OnnxEmbeddingClient;
pub use pgvector_index::PgVectorIndex;
pub use retriever::{RetrievalError, Retriever, SearchFilters};
pub use session::{ConversationSession, PartialReplyPolicy, ReplyDisposition, SessionState};
