//! Catalog ingest: read a JSON book list, normalise it, and load it into Postgres.
//!
//! Input is a JSON array of objects. `title` and `author` are required; every
//! other `Book` field is optional. A book may carry its own `copies` list
//! (`{"status": "available"}` or `{"status": "issued", "due_date": "2025-01-31"}`);
//! otherwise the importer creates `default_copies` available copies.

use chrono::NaiveDate;
use libhub_core::db::ensure_catalog_schema;
use libhub_core::models::{Book, BookId};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid catalog JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Entry {index}: {reason}")]
    Invalid { index: usize, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Physical copy status as stored in `book_copies.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyStatus {
    Available,
    Issued,
}

impl CopyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStatus::Available => "available",
            CopyStatus::Issued => "issued",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopySpec {
    pub status: CopyStatus,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
}

/// One catalog entry after normalisation.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub book: Book,
    pub copies: Vec<CopySpec>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    id: Option<BookId>,
    #[serde(flatten)]
    book: Book,
    #[serde(default)]
    copies: Vec<CopySpec>,
}

/// Counts reported by `import_catalog`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub inserted: usize,
    pub updated: usize,
    pub copies_created: usize,
}

/// Load and normalise a catalog file.
pub async fn load_catalog(path: impl AsRef<Path>) -> Result<Vec<CatalogEntry>, IngestError> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| IngestError::Io {
            path: path.display().to_string(),
            source,
        })?;
    let entries = parse_catalog(&raw)?;
    tracing::info!(path = %path.display(), books = entries.len(), "Loaded catalog file");
    Ok(entries)
}

/// Parse and normalise catalog JSON.
///
/// Entries without an `id` get one above the largest explicit id, in file order.
pub fn parse_catalog(json: &str) -> Result<Vec<CatalogEntry>, IngestError> {
    let raw: Vec<RawEntry> = serde_json::from_str(json)?;

    // None once the id space above the largest explicit id is used up.
    let mut next_id = raw
        .iter()
        .filter_map(|r| r.id)
        .max()
        .unwrap_or(0)
        .checked_add(1);
    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(raw.len());

    for (index, entry) in raw.into_iter().enumerate() {
        let id = match entry.id {
            Some(id) => id,
            None => {
                let id = next_id.ok_or_else(|| IngestError::Invalid {
                    index,
                    reason: format!("no id left above {} to assign", BookId::MAX),
                })?;
                next_id = id.checked_add(1);
                id
            }
        };
        if !seen.insert(id) {
            return Err(IngestError::Invalid {
                index,
                reason: format!("duplicate id {id}"),
            });
        }

        let mut book = normalise(entry.book);
        book.id = id;
        if book.title.is_empty() || book.author.is_empty() {
            return Err(IngestError::Invalid {
                index,
                reason: "title and author must not be empty".to_string(),
            });
        }
        if book.pages.is_some_and(|p| p <= 0) {
            book.pages = None;
        }

        entries.push(CatalogEntry {
            book,
            copies: entry.copies,
        });
    }

    Ok(entries)
}

fn normalise(mut book: Book) -> Book {
    book.title = clean_text(&book.title);
    book.author = clean_text(&book.author);
    for field in [
        &mut book.genres,
        &mut book.subjects,
        &mut book.description,
        &mut book.synopsis,
        &mut book.language,
        &mut book.date_published,
        &mut book.cover_image_url,
        &mut book.pacing,
        &mut book.tone,
    ] {
        *field = field.as_deref().map(clean_text).filter(|s| !s.is_empty());
    }
    book.themes = clean_list(book.themes);
    book.mood_tags = clean_list(book.mood_tags);
    book
}

fn clean_list(values: Vec<String>) -> Vec<String> {
    values
        .iter()
        .map(|v| clean_text(v))
        .filter(|v| !v.is_empty())
        .collect()
}

/// Strip HTML tags and collapse runs of whitespace.
pub fn clean_text(text: &str) -> String {
    static TAGS: OnceLock<Option<Regex>> = OnceLock::new();
    let stripped = match TAGS.get_or_init(|| Regex::new(r"<[^>]*>").ok()) {
        Some(re) => re.replace_all(text, " "),
        None => text.into(),
    };
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Upsert every entry into `books` and create copies for books that have none.
pub async fn import_catalog(
    pool: &PgPool,
    entries: &[CatalogEntry],
    default_copies: u32,
) -> Result<ImportReport, IngestError> {
    ensure_catalog_schema(pool).await?;

    let mut report = ImportReport::default();
    let mut tx = pool.begin().await?;

    for entry in entries {
        let book = &entry.book;
        let (inserted,): (bool,) = sqlx::query_as(
            r#"
            INSERT INTO books (
                id, title, author, genres, subjects, description, synopsis, language,
                pages, date_published, cover_image_url, pacing, tone, themes, mood_tags
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                author = EXCLUDED.author,
                genres = EXCLUDED.genres,
                subjects = EXCLUDED.subjects,
                description = EXCLUDED.description,
                synopsis = EXCLUDED.synopsis,
                language = EXCLUDED.language,
                pages = EXCLUDED.pages,
                date_published = EXCLUDED.date_published,
                cover_image_url = EXCLUDED.cover_image_url,
                pacing = EXCLUDED.pacing,
                tone = EXCLUDED.tone,
                themes = EXCLUDED.themes,
                mood_tags = EXCLUDED.mood_tags
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(book.id)
        .bind(&book.title)
        .bind(&book.author)
        .bind(&book.genres)
        .bind(&book.subjects)
        .bind(&book.description)
        .bind(&book.synopsis)
        .bind(&book.language)
        .bind(book.pages)
        .bind(&book.date_published)
        .bind(&book.cover_image_url)
        .bind(&book.pacing)
        .bind(&book.tone)
        .bind(sqlx::types::Json(&book.themes))
        .bind(sqlx::types::Json(&book.mood_tags))
        .fetch_one(&mut *tx)
        .await?;

        if inserted {
            report.inserted += 1;
        } else {
            report.updated += 1;
        }

        let (existing,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM book_copies WHERE book_id = $1")
                .bind(book.id)
                .fetch_one(&mut *tx)
                .await?;
        if existing > 0 {
            continue;
        }

        for copy in copies_for(entry, default_copies) {
            sqlx::query("INSERT INTO book_copies (book_id, status, due_date) VALUES ($1, $2, $3)")
                .bind(book.id)
                .bind(copy.status.as_str())
                .bind(copy.due_date)
                .execute(&mut *tx)
                .await?;
            report.copies_created += 1;
        }
    }

    tx.commit().await?;

    tracing::info!(
        inserted = report.inserted,
        updated = report.updated,
        copies = report.copies_created,
        "Catalog import complete"
    );
    Ok(report)
}

/// Copies listed in the entry, or `default_copies` available ones.
pub fn copies_for(entry: &CatalogEntry, default_copies: u32) -> Vec<CopySpec> {
    if !entry.copies.is_empty() {
        return entry.copies.clone();
    }
    (0..default_copies)
        .map(|_| CopySpec {
            status: CopyStatus::Available,
            due_date: None,
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
