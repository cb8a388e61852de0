//! Query → embedding → index search → ranked `RetrievalResult`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

use crate::embeddings::{EmbeddingBackend, EmbeddingError};
use crate::index::{IndexError, VectorIndex};
use crate::models::{BookMetadata, RetrievalResult};

/// Hard ceiling on results per request.
pub const MAX_LIMIT: usize = 20;

/// Results per request when the query does not ask for a number.
pub const DEFAULT_LIMIT: usize = 5;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Failed to embed query: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index search failed: {0}")]
    Index(#[from] IndexError),
}

/// Structured constraints pulled out of a free-text request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Rewritten query text to embed instead of the raw request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_pages: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_start: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_end: Option<i32>,
}

impl SearchFilters {
    /// True when no field constrains the result set.
    pub fn is_unconstrained(&self) -> bool {
        self.max_pages.is_none()
            && self.min_pages.is_none()
            && self.genre.is_none()
            && self.language.is_none()
            && self.year_start.is_none()
            && self.year_end.is_none()
    }

    /// A book lacking a filtered field does not match.
    pub fn matches(&self, meta: &BookMetadata) -> bool {
        if let Some(max) = self.max_pages {
            if !meta.pages.is_some_and(|p| p <= max) {
                return false;
            }
        }
        if let Some(min) = self.min_pages {
            if !meta.pages.is_some_and(|p| p >= min) {
                return false;
            }
        }
        if let Some(genre) = &self.genre {
            if !contains_ci(meta.genres.as_deref(), genre) {
                return false;
            }
        }
        if let Some(language) = &self.language {
            if !contains_ci(meta.language.as_deref(), language) {
                return false;
            }
        }
        if let Some(start) = self.year_start {
            if !meta.year.is_some_and(|y| y >= start) {
                return false;
            }
        }
        if let Some(end) = self.year_end {
            if !meta.year.is_some_and(|y| y <= end) {
                return false;
            }
        }
        true
    }
}

fn contains_ci(field: Option<&str>, needle: &str) -> bool {
    field.is_some_and(|f| f.to_lowercase().contains(&needle.to_lowercase()))
}

/// "N book(s)" in the request, clamped to `1..=max`; `default` otherwise.
pub fn requested_limit(query: &str, default: usize, max: usize) -> usize {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"(?i)(\d+)\s*books?").ok());

    pattern
        .as_ref()
        .and_then(|p| p.captures(query))
        .and_then(|caps| caps[1].parse::<usize>().ok())
        .map(|n| n.clamp(1, max.max(1)))
        .unwrap_or(default)
}

pub struct Retriever {
    backend: Arc<dyn EmbeddingBackend>,
    index: Arc<dyn VectorIndex>,
    min_score: f32,
}

impl Retriever {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            backend,
            index,
            min_score: 0.0,
        }
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn backend(&self) -> &Arc<dyn EmbeddingBackend> {
        &self.backend
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Top `k` documents for `query` scoring at least `min_score`.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<RetrievalResult, RetrievalError> {
        let vector = self.backend.embed_query(query).await?;
        let mut hits = self.index.search(&vector, k).await?;
        hits.retain(|d| d.score >= self.min_score);

        tracing::debug!(k = k, returned = hits.len(), "Retrieved documents");
        Ok(RetrievalResult::new(hits))
    }

    /// Like `retrieve`, narrowed by `filters`.
    ///
    /// The index applies the filters while searching, so up to `k` matching
    /// books come back however far down the unfiltered ranking they sit.
    pub async fn retrieve_filtered(
        &self,
        query: &str,
        k: usize,
        filters: &SearchFilters,
    ) -> Result<RetrievalResult, RetrievalError> {
        let text = filters
            .search_query
            .as_deref()
            .filter(|q| !q.trim().is_empty())
            .unwrap_or(query);

        if filters.is_unconstrained() {
            return self.retrieve(text, k).await;
        }

        let vector = self.backend.embed_query(text).await?;
        let mut hits = self.index.search_filtered(&vector, k, filters).await?;
        hits.retain(|d| d.score >= self.min_score);

        tracing::debug!(k = k, returned = hits.len(), "Retrieved filtered documents");
        Ok(RetrievalResult::new(hits))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use crate::index::InMemoryVectorIndex;

    const DIMS: usize = 1024;

    async fn indexed(docs: &[(i64, &str, BookMetadata)]) -> Retriever {
        let embedder = Arc::new(HashingEmbedder::new(DIMS, 256));
        let index = Arc::new(InMemoryVectorIndex::new(DIMS));
        for (id, text, meta) in docs {
            let vector = embedder.embed(text).await.unwrap();
            index.upsert(*id, vector, meta.clone()).await.unwrap();
        }
        Retriever::new(embedder, index)
    }

    fn titled(title: &str) -> BookMetadata {
        BookMetadata {
            title: title.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_memory_query_ranks_memory_book_first() {
        let retriever = indexed(&[
            (1, "a story about memory and loss", titled("Memory")),
            (2, "a thriller about a heist", titled("Heist")),
        ])
        .await;

        let result = retriever.retrieve("something about memory", 5).await.unwrap();
        assert_eq!(result.documents[0].id, 1);
        if let Some(heist) = result.get(2) {
            assert!(heist.score < result.documents[0].score);
        }
    }

    #[tokio::test]
    async fn test_empty_query_is_an_embedding_error() {
        let retriever = indexed(&[(1, "anything at all here", titled("x"))]).await;
        let result = retriever.retrieve("", 5).await;
        assert!(matches!(
            result,
            Err(RetrievalError::Embedding(EmbeddingError::EmptyInput))
        ));
    }

    #[tokio::test]
    async fn test_empty_index_gives_empty_result() {
        let retriever = indexed(&[]).await;
        let result = retriever.retrieve("dragons", 5).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_min_score_drops_weak_matches() {
        let retriever = indexed(&[
            (1, "dragons and wizards", titled("Dragons")),
            (2, "tax accounting handbook", titled("Tax")),
        ])
        .await
        .with_min_score(0.3);

        let result = retriever.retrieve("dragons", 5).await.unwrap();
        assert_eq!(result.ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_filters_narrow_results() {
        let short = BookMetadata {
            title: "Short".into(),
            pages: Some(150),
            genres: Some("Fantasy".into()),
            ..Default::default()
        };
        let long = BookMetadata {
            title: "Long".into(),
            pages: Some(900),
            genres: Some("Fantasy".into()),
            ..Default::default()
        };
        let retriever = indexed(&[
            (1, "dragons dragons dragons", long),
            (2, "dragons and a quest", short),
        ])
        .await;

        let filters = SearchFilters {
            max_pages: Some(300),
            genre: Some("fantasy".into()),
            ..Default::default()
        };
        let result = retriever
            .retrieve_filtered("short fantasy books", 1, &filters)
            .await
            .unwrap();
        assert_eq!(result.ids(), vec![2]);
    }

    /// Embeds every query as `[1, 0]` so index geometry can be laid out by hand.
    struct AxisQueryBackend;

    #[async_trait::async_trait]
    impl EmbeddingBackend for AxisQueryBackend {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0, 0.0])
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn max_input_tokens(&self) -> usize {
            256
        }

        fn name(&self) -> &str {
            "axis"
        }
    }

    #[tokio::test]
    async fn test_selective_filter_finds_low_ranked_match() {
        let index = Arc::new(InMemoryVectorIndex::new(2));
        for i in 0..25 {
            let english = BookMetadata {
                language: Some("English".into()),
                ..titled("English")
            };
            index.upsert(i, vec![1.0, 0.01 * i as f32], english).await.unwrap();
        }
        let french = BookMetadata {
            language: Some("French".into()),
            ..titled("French")
        };
        index.upsert(99, vec![0.5, 1.0], french).await.unwrap();
        let retriever = Retriever::new(Arc::new(AxisQueryBackend), index);

        let filters = SearchFilters {
            language: Some("french".into()),
            ..Default::default()
        };
        let result = retriever
            .retrieve_filtered("french novels", 5, &filters)
            .await
            .unwrap();
        assert_eq!(result.ids(), vec![99]);

        let unfiltered = retriever.retrieve("french novels", 5).await.unwrap();
        assert_eq!(unfiltered.ids(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_filter_search_query_replaces_raw_text() {
        let retriever = indexed(&[
            (1, "ocean voyages", titled("Sea")),
            (2, "desert caravans", titled("Sand")),
        ])
        .await;
        let filters = SearchFilters {
            search_query: Some("desert".into()),
            ..Default::default()
        };
        let result = retriever
            .retrieve_filtered("recommend me something", 1, &filters)
            .await
            .unwrap();
        assert_eq!(result.ids(), vec![2]);
    }

    #[test]
    fn test_filters_exclude_books_missing_field() {
        let filters = SearchFilters {
            year_start: Some(2000),
            ..Default::default()
        };
        assert!(!filters.matches(&BookMetadata::default()));
        assert!(filters.matches(&BookMetadata {
            year: Some(2010),
            ..Default::default()
        }));
    }

    #[test]
    fn test_filters_deserialize_from_partial_json() {
        let filters: SearchFilters =
            serde_json::from_value(serde_json::json!({"search_query": "space", "year_end": 1990}))
                .unwrap();
        assert_eq!(filters.search_query.as_deref(), Some("space"));
        assert_eq!(filters.year_end, Some(1990));
        assert!(!filters.is_unconstrained());
    }

    #[test]
    fn test_requested_limit() {
        assert_eq!(requested_limit("recommend 3 books about cats", 5, 20), 3);
        assert_eq!(requested_limit("give me 1 book", 5, 20), 1);
        assert_eq!(requested_limit("show me 50 Books", 5, 20), 20);
        assert_eq!(requested_limit("0 books please", 5, 20), 1);
        assert_eq!(requested_limit("books about cats", 5, 20), 5);
    }
}
