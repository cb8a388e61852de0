//! Catalog indexer
//!
//! Embeds catalog books and upserts them into the vector index, then removes
//! vectors whose book left the catalog. A full run re-embeds every book; the
//! periodic worker only fills in books that have no vector yet.

use anyhow::Result;
use libhub_core::config::IndexConfig;
use libhub_core::embeddings::EmbeddingBackend;
use libhub_core::index::VectorIndex;
use libhub_core::models::BookId;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};

use super::catalog::BookCatalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// Re-embed every catalog book.
    Full,
    /// Embed only books the index does not hold yet.
    Missing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub embedded: usize,
    pub skipped: usize,
    pub removed: usize,
}

/// One indexing pass over the catalog.
pub async fn index_catalog(
    catalog: &dyn BookCatalog,
    backend: &dyn EmbeddingBackend,
    index: &dyn VectorIndex,
    mode: IndexMode,
    rate_limit_rpm: u32,
) -> Result<IndexReport> {
    let books = catalog.all_books().await?;
    let indexed: HashSet<BookId> = index.ids().await?.into_iter().collect();
    let mut report = IndexReport::default();

    for book in &books {
        if mode == IndexMode::Missing && indexed.contains(&book.id) {
            continue;
        }

        let embedded = match backend.truncate_for_embedding(&book.embedding_text()) {
            Ok(text) => backend.embed(&text).await,
            Err(e) => Err(e),
        };
        match embedded {
            Ok(vector) => {
                index.upsert(book.id, vector, book.metadata()).await?;
                report.embedded += 1;
                apply_rate_limit(rate_limit_rpm).await;
            }
            Err(e) => {
                tracing::warn!(id = book.id, title = %book.title, error = %e, "Failed to embed book, skipping");
                report.skipped += 1;
            }
        }
    }

    let current: HashSet<BookId> = books.iter().map(|b| b.id).collect();
    for id in indexed.difference(&current) {
        index.delete(*id).await?;
        report.removed += 1;
    }

    tracing::info!(
        embedded = report.embedded,
        skipped = report.skipped,
        removed = report.removed,
        index = index.name(),
        "Indexing pass complete"
    );
    Ok(report)
}

/// Periodically index books that are missing from the index.
///
/// Returns immediately when `reindex_interval_minutes` is 0.
pub async fn run_reindex_worker(
    catalog: Arc<dyn BookCatalog>,
    backend: Arc<dyn EmbeddingBackend>,
    index: Arc<dyn VectorIndex>,
    config: IndexConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    if config.reindex_interval_minutes == 0 {
        tracing::info!("Re-index worker disabled via config");
        return;
    }

    let mut ticker = interval(Duration::from_secs(config.reindex_interval_minutes * 60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        interval_min = config.reindex_interval_minutes,
        rate_limit_rpm = config.rate_limit_rpm,
        "Re-index worker started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => {
                tracing::info!("Re-index worker shutting down...");
                return;
            }
        }

        if let Err(e) = index_catalog(
            catalog.as_ref(),
            backend.as_ref(),
            index.as_ref(),
            IndexMode::Missing,
            config.rate_limit_rpm,
        )
        .await
        {
            tracing::warn!(error = %e, "Re-index tick failed");
        }
    }
}

/// Inter-request delay to respect `rate_limit_rpm`.
async fn apply_rate_limit(rate_limit_rpm: u32) {
    if rate_limit_rpm > 0 {
        let delay_ms = 60_000 / rate_limit_rpm as u64;
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

// ============================================================================
// TESTS
// ============================================================================
