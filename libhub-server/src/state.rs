//! Shared application state and its construction from config.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use libhub_core::embeddings::{create_backend, BackendConfig, EmbeddingBackend};
use libhub_core::generation::{GenerationBackend, OllamaGenerationClient, OllamaGenerationConfig};
use libhub_core::index::{InMemoryVectorIndex, VectorIndex};
use libhub_core::{ContextAssembler, LibhubConfig, LibhubError, PgVectorIndex, Retriever};
use sqlx::PgPool;

use crate::subsystems::catalog::{BookCatalog, InMemoryCatalog, PgBookCatalog};
use crate::subsystems::chat::{ChatService, ChatSettings};

/// Handles shared by every HTTP handler and background task.
#[derive(Clone)]
pub struct AppState {
    pub config: LibhubConfig,
    pub pool: Option<PgPool>,
    pub catalog: Arc<dyn BookCatalog>,
    pub backend: Arc<dyn EmbeddingBackend>,
    pub index: Arc<dyn VectorIndex>,
    pub retriever: Arc<Retriever>,
    pub chat: Arc<ChatService>,
}

impl AppState {
    /// Wire the components from already-built parts.
    pub fn new(
        config: LibhubConfig,
        pool: Option<PgPool>,
        catalog: Arc<dyn BookCatalog>,
        backend: Arc<dyn EmbeddingBackend>,
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn GenerationBackend>,
    ) -> Self {
        let retriever = Arc::new(
            Retriever::new(backend.clone(), index.clone())
                .with_min_score(config.retrieval.min_score),
        );
        let chat = Arc::new(ChatService::new(
            retriever.clone(),
            generator,
            catalog.clone(),
            ContextAssembler::new(config.context.synopsis_chars),
            ChatSettings::from_config(&config),
        ));

        Self {
            config,
            pool,
            catalog,
            backend,
            index,
            retriever,
            chat,
        }
    }

    /// Build every component the config asks for.
    ///
    /// A database pool is only required when the catalog or the index lives
    /// in Postgres.
    pub async fn from_config(config: LibhubConfig, pool: Option<PgPool>) -> Result<Self> {
        let backend: Arc<dyn EmbeddingBackend> = Arc::from(
            create_backend(BackendConfig::from_settings(&config.embedding)?)
                .context("Failed to create embedding backend")?,
        );
        if backend.dimensions() != config.embedding.dimensions as usize {
            bail!(
                "Embedding backend '{}' produces {} dimensions, config says {}",
                backend.name(),
                backend.dimensions(),
                config.embedding.dimensions
            );
        }

        let catalog = build_catalog(&config, pool.as_ref()).await?;
        let index = build_index(&config, pool.as_ref(), backend.dimensions()).await?;
        let generator: Arc<dyn GenerationBackend> = Arc::new(OllamaGenerationClient::new(
            OllamaGenerationConfig::from_settings(&config.generation),
        )?);

        tracing::info!(
            catalog = catalog.name(),
            embedder = backend.name(),
            index = index.name(),
            dimensions = index.dimensions(),
            generator = generator.name(),
            "Components ready"
        );

        Ok(Self::new(config, pool, catalog, backend, index, generator))
    }
}

async fn build_catalog(config: &LibhubConfig, pool: Option<&PgPool>) -> Result<Arc<dyn BookCatalog>> {
    match config.catalog.source.as_str() {
        "postgres" => {
            let pool = pool.context("catalog.source = \"postgres\" needs a database connection")?;
            Ok(Arc::new(PgBookCatalog::new(pool.clone())))
        }
        "json" => {
            let catalog =
                InMemoryCatalog::load(&config.catalog.path, config.catalog.default_copies).await?;
            tracing::info!(path = %config.catalog.path, books = catalog.len(), "Loaded JSON catalog");
            Ok(Arc::new(catalog))
        }
        other => bail!("Unknown catalog source '{other}' (expected postgres or json)"),
    }
}

async fn build_index(
    config: &LibhubConfig,
    pool: Option<&PgPool>,
    dimensions: usize,
) -> Result<Arc<dyn VectorIndex>, LibhubError> {
    match config.index.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryVectorIndex::new(dimensions))),
        "pgvector" => {
            let pool = pool.ok_or_else(|| {
                LibhubError::Other("index.backend = \"pgvector\" needs a database connection".into())
            })?;
            Ok(Arc::new(PgVectorIndex::new(pool.clone(), dimensions).await?))
        }
        other => Err(LibhubError::Other(format!(
            "Unknown index backend '{other}' (expected memory or pgvector)"
        ))),
    }
}

/// Whether the config needs a Postgres connection at all.
pub fn needs_database(config: &LibhubConfig) -> bool {
    config.catalog.source == "postgres" || config.index.backend == "pgvector"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(catalog: &str, index: &str) -> LibhubConfig {
        LibhubConfig::from_toml_str(&format!(
            r#"
            [database]
            url = "postgresql://localhost/library"
            max_connections = 1

            [catalog]
            source = "{catalog}"
            path = "does-not-exist.json"
            default_copies = 5

            [embedding]
            backend = "hashing"
            dimensions = 64
            max_input_tokens = 256

            [index]
            backend = "{index}"
            reindex_interval_minutes = 0
            rate_limit_rpm = 0

            [generation]
            base_url = "http://localhost:11434"
            model = "test"
            "#
        ))
        .unwrap()
    }

    #[test]
    fn test_needs_database() {
        assert!(needs_database(&config("postgres", "memory")));
        assert!(needs_database(&config("json", "pgvector")));
        assert!(!needs_database(&config("json", "memory")));
    }

    #[tokio::test]
    async fn test_postgres_catalog_without_pool_fails() {
        let result = AppState::from_config(config("postgres", "memory"), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_pgvector_index_without_pool_fails() {
        let result = build_index(&config("json", "pgvector"), None, 64).await;
        assert!(matches!(result, Err(LibhubError::Other(_))));
    }

    #[tokio::test]
    async fn test_unknown_index_backend_rejected() {
        let result = build_index(&config("json", "faiss"), None, 64).await;
        assert!(result.is_err());
    }
}
