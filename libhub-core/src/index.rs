//! Vector index: `(book id, vector, metadata)` with exact nearest-neighbour search.
//!
//! Scores are cosine similarity. Results are ordered highest score first,
//! ties broken by the lower id, and never contain an id twice.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::{BookId, BookMetadata, ScoredDocument};
use crate::retriever::SearchFilters;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Vector has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Vector component {position} is not finite")]
    MalformedVector { position: usize },

    #[error("Index storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the entry for `id`.
    async fn upsert(&self, id: BookId, vector: Vec<f32>, metadata: BookMetadata)
        -> Result<(), IndexError>;

    /// Up to `k` nearest entries. `k == 0` or an empty index gives an empty vec.
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredDocument>, IndexError>;

    /// Up to `k` nearest entries among those whose metadata passes `filters`.
    ///
    /// Filtering happens before the cut to `k`, so a match ranked far below
    /// the unfiltered top `k` is still found.
    async fn search_filtered(
        &self,
        vector: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredDocument>, IndexError>;

    /// Remove `id`. Removing an absent id is not an error.
    async fn delete(&self, id: BookId) -> Result<(), IndexError>;

    async fn len(&self) -> Result<usize, IndexError>;

    async fn ids(&self) -> Result<Vec<BookId>, IndexError>;

    fn dimensions(&self) -> usize;

    fn name(&self) -> &str;
}

/// Reject vectors of the wrong length or with NaN/infinite components.
pub fn check_vector(vector: &[f32], expected: usize) -> Result<(), IndexError> {
    if vector.len() != expected {
        return Err(IndexError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    match vector.iter().position(|v| !v.is_finite()) {
        Some(position) => Err(IndexError::MalformedVector { position }),
        None => Ok(()),
    }
}

/// Cosine similarity; 0.0 when either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Score order used by every backend.
pub(crate) fn rank(hits: &mut [ScoredDocument]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
}

#[derive(Debug, Clone)]
struct Entry {
    vector: Vec<f32>,
    metadata: BookMetadata,
}

type Snapshot = Arc<BTreeMap<BookId, Entry>>;

/// Exact-scan index held in memory.
///
/// Writers clone-on-write the map behind the lock; searches grab the current
/// `Arc` and scan it without holding the lock.
#[derive(Debug)]
pub struct InMemoryVectorIndex {
    dimensions: usize,
    entries: RwLock<Snapshot>,
}

impl InMemoryVectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            entries: RwLock::new(Arc::new(BTreeMap::new())),
        }
    }

    async fn snapshot(&self) -> Snapshot {
        Arc::clone(&*self.entries.read().await)
    }

    async fn scan(
        &self,
        vector: &[f32],
        k: usize,
        keep: impl Fn(&BookMetadata) -> bool,
    ) -> Result<Vec<ScoredDocument>, IndexError> {
        check_vector(vector, self.dimensions)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let snapshot = self.snapshot().await;
        let mut hits: Vec<ScoredDocument> = snapshot
            .iter()
            .filter(|(_, entry)| keep(&entry.metadata))
            .map(|(id, entry)| ScoredDocument {
                id: *id,
                score: cosine_similarity(&entry.vector, vector),
                metadata: entry.metadata.clone(),
            })
            .collect();

        rank(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(
        &self,
        id: BookId,
        vector: Vec<f32>,
        metadata: BookMetadata,
    ) -> Result<(), IndexError> {
        check_vector(&vector, self.dimensions)?;
        let mut guard = self.entries.write().await;
        Arc::make_mut(&mut guard).insert(id, Entry { vector, metadata });
        Ok(())
    }

    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredDocument>, IndexError> {
        self.scan(vector, k, |_| true).await
    }

    async fn search_filtered(
        &self,
        vector: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredDocument>, IndexError> {
        self.scan(vector, k, |meta| filters.matches(meta)).await
    }

    async fn delete(&self, id: BookId) -> Result<(), IndexError> {
        let mut guard = self.entries.write().await;
        if guard.contains_key(&id) {
            Arc::make_mut(&mut guard).remove(&id);
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize, IndexError> {
        Ok(self.entries.read().await.len())
    }

    async fn ids(&self) -> Result<Vec<BookId>, IndexError> {
        Ok(self.snapshot().await.keys().copied().collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(title: &str) -> BookMetadata {
        BookMetadata {
            title: title.to_string(),
            ..Default::default()
        }
    }

    async fn seeded() -> InMemoryVectorIndex {
        let index = InMemoryVectorIndex::new(3);
        index.upsert(1, vec![1.0, 0.0, 0.0], meta("x")).await.unwrap();
        index.upsert(2, vec![0.0, 1.0, 0.0], meta("y")).await.unwrap();
        index.upsert(3, vec![0.7, 0.7, 0.0], meta("xy")).await.unwrap();
        index.upsert(4, vec![0.0, 0.0, 1.0], meta("z")).await.unwrap();
        index
    }

    #[tokio::test]
    async fn test_self_match_scores_one() {
        let index = seeded().await;
        let hits = index.search(&[0.7, 0.7, 0.0], 1).await.unwrap();
        assert_eq!(hits[0].id, 3);
        assert!((hits[0].score - 1.0).abs() < 1e-5);
        assert_eq!(hits[0].metadata.title, "xy");
    }

    #[tokio::test]
    async fn test_search_returns_at_most_k_unique_ids() {
        let index = seeded().await;
        for k in 0..6 {
            let hits = index.search(&[1.0, 0.2, 0.1], k).await.unwrap();
            assert!(hits.len() <= k);
            let mut ids: Vec<_> = hits.iter().map(|h| h.id).collect();
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), hits.len());
        }
        assert_eq!(index.search(&[1.0, 0.2, 0.1], 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_results_sorted_by_score() {
        let index = seeded().await;
        let hits = index.search(&[1.0, 0.2, 0.0], 4).await.unwrap();
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(hits[0].id, 1);
    }

    #[tokio::test]
    async fn test_ties_broken_by_lower_id() {
        let index = InMemoryVectorIndex::new(2);
        index.upsert(9, vec![1.0, 0.0], meta("b")).await.unwrap();
        index.upsert(5, vec![1.0, 0.0], meta("a")).await.unwrap();
        let hits = index.search(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![5, 9]);
    }

    #[tokio::test]
    async fn test_empty_index_returns_empty() {
        let index = InMemoryVectorIndex::new(3);
        assert!(index.search(&[1.0, 0.0, 0.0], 5).await.unwrap().is_empty());
        assert_eq!(index.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deleted_id_never_returned() {
        let index = seeded().await;
        index.delete(3).await.unwrap();
        index.delete(3).await.unwrap();
        let hits = index.search(&[0.7, 0.7, 0.0], 10).await.unwrap();
        assert!(hits.iter().all(|h| h.id != 3));
        assert_eq!(index.ids().await.unwrap(), vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_entry() {
        let index = seeded().await;
        index.upsert(1, vec![0.0, 0.0, 1.0], meta("moved")).await.unwrap();
        assert_eq!(index.len().await.unwrap(), 4);
        let hits = index.search(&[0.0, 0.0, 1.0], 2).await.unwrap();
        assert_eq!(hits[0].id, 1);
        assert_eq!(hits[0].metadata.title, "moved");
    }

    #[tokio::test]
    async fn test_malformed_vectors_rejected() {
        let index = InMemoryVectorIndex::new(3);
        assert!(matches!(
            index.upsert(1, vec![1.0, 0.0], meta("short")).await,
            Err(IndexError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert!(matches!(
            index.upsert(1, vec![1.0, f32::NAN, 0.0], meta("nan")).await,
            Err(IndexError::MalformedVector { position: 1 })
        ));
        assert!(matches!(
            index.search(&[1.0, 0.0, 0.0, 0.0], 1).await,
            Err(IndexError::DimensionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_snapshot_unaffected_by_later_writes() {
        let index = seeded().await;
        let before = index.snapshot().await;
        index.delete(1).await.unwrap();
        assert!(before.contains_key(&1));
        assert!(!index.snapshot().await.contains_key(&1));
    }

    #[tokio::test]
    async fn test_filtered_search_reaches_past_unfiltered_top_k() {
        let index = InMemoryVectorIndex::new(2);
        for i in 0..25 {
            let english = BookMetadata {
                language: Some("English".to_string()),
                ..meta("english")
            };
            index.upsert(i, vec![1.0, 0.01 * i as f32], english).await.unwrap();
        }
        let french = BookMetadata {
            language: Some("French".to_string()),
            ..meta("french")
        };
        index.upsert(99, vec![0.5, 1.0], french).await.unwrap();

        let filters = SearchFilters {
            language: Some("french".to_string()),
            ..Default::default()
        };
        let hits = index.search_filtered(&[1.0, 0.0], 5, &filters).await.unwrap();
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![99]);

        let unfiltered = index
            .search_filtered(&[1.0, 0.0], 5, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(unfiltered, index.search(&[1.0, 0.0], 5).await.unwrap());
        assert!(unfiltered.iter().all(|h| h.id != 99));
    }

    #[test]
    fn test_cosine_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
