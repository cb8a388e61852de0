//! Book catalog: the document source for indexing and book cards.

use async_trait::async_trait;
use libhub_core::models::{Book, BookAvailability, BookId};
use libhub_ingest::{copies_for, CatalogEntry, CopyStatus, IngestError};
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Catalog file error: {0}")]
    Ingest(#[from] IngestError),
}

#[async_trait]
pub trait BookCatalog: Send + Sync {
    /// Every book, ordered by id.
    async fn all_books(&self) -> Result<Vec<Book>, CatalogError>;

    /// Books with the given ids, in the order requested. Unknown ids are skipped.
    async fn get_books(&self, ids: &[BookId]) -> Result<Vec<Book>, CatalogError>;

    /// Copy counts; an unknown book has no copies.
    async fn availability(&self, id: BookId) -> Result<BookAvailability, CatalogError>;

    /// Short status line for health reporting.
    async fn status(&self) -> Result<String, CatalogError>;

    fn name(&self) -> &str;
}

// ============================================================================
// Postgres
// ============================================================================

#[derive(Debug, Clone)]
pub struct PgBookCatalog {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct BookRow {
    id: BookId,
    title: String,
    author: String,
    genres: Option<String>,
    subjects: Option<String>,
    description: Option<String>,
    synopsis: Option<String>,
    language: Option<String>,
    pages: Option<i32>,
    date_published: Option<String>,
    cover_image_url: Option<String>,
    pacing: Option<String>,
    tone: Option<String>,
    themes: Option<Json<Vec<String>>>,
    mood_tags: Option<Json<Vec<String>>>,
}

impl From<BookRow> for Book {
    fn from(row: BookRow) -> Self {
        Book {
            id: row.id,
            title: row.title,
            author: row.author,
            genres: row.genres,
            subjects: row.subjects,
            description: row.description,
            synopsis: row.synopsis,
            language: row.language,
            pages: row.pages,
            date_published: row.date_published,
            cover_image_url: row.cover_image_url,
            pacing: row.pacing,
            tone: row.tone,
            themes: row.themes.map(|j| j.0).unwrap_or_default(),
            mood_tags: row.mood_tags.map(|j| j.0).unwrap_or_default(),
        }
    }
}

const BOOK_COLUMNS: &str = "id, title, author, genres, subjects, description, synopsis, language, \
     pages, date_published, cover_image_url, pacing, tone, themes, mood_tags";

impl PgBookCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookCatalog for PgBookCatalog {
    async fn all_books(&self) -> Result<Vec<Book>, CatalogError> {
        let rows: Vec<BookRow> =
            sqlx::query_as(&format!("SELECT {BOOK_COLUMNS} FROM books ORDER BY id"))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Book::from).collect())
    }

    async fn get_books(&self, ids: &[BookId]) -> Result<Vec<Book>, CatalogError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<BookRow> =
            sqlx::query_as(&format!("SELECT {BOOK_COLUMNS} FROM books WHERE id = ANY($1)"))
                .bind(ids.to_vec())
                .fetch_all(&self.pool)
                .await?;

        let mut by_id: HashMap<BookId, Book> =
            rows.into_iter().map(|r| (r.id, Book::from(r))).collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn availability(&self, id: BookId) -> Result<BookAvailability, CatalogError> {
        let (total, available): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COUNT(*) FILTER (WHERE status = 'available')
            FROM book_copies
            WHERE book_id = $1
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(BookAvailability {
            book_id: id,
            total_copies: total,
            available_copies: available,
        })
    }

    async fn status(&self) -> Result<String, CatalogError> {
        Ok(libhub_core::db::health_check(&self.pool).await?)
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

// ============================================================================
// In-memory (JSON catalog file)
// ============================================================================

#[derive(Debug, Default, Clone)]
pub struct InMemoryCatalog {
    books: BTreeMap<BookId, Book>,
    copies: HashMap<BookId, BookAvailability>,
}

impl InMemoryCatalog {
    pub fn from_entries(entries: Vec<CatalogEntry>, default_copies: u32) -> Self {
        let mut catalog = Self::default();
        for entry in entries {
            let copies = copies_for(&entry, default_copies);
            let id = entry.book.id;
            catalog.copies.insert(
                id,
                BookAvailability {
                    book_id: id,
                    total_copies: copies.len() as i64,
                    available_copies: copies
                        .iter()
                        .filter(|c| c.status == CopyStatus::Available)
                        .count() as i64,
                },
            );
            catalog.books.insert(id, entry.book);
        }
        catalog
    }

    pub fn from_books(books: Vec<Book>, default_copies: u32) -> Self {
        let entries = books
            .into_iter()
            .map(|book| CatalogEntry {
                book,
                copies: Vec::new(),
            })
            .collect();
        Self::from_entries(entries, default_copies)
    }

    pub async fn load(path: impl AsRef<Path>, default_copies: u32) -> Result<Self, CatalogError> {
        let entries = libhub_ingest::load_catalog(path).await?;
        Ok(Self::from_entries(entries, default_copies))
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

#[async_trait]
impl BookCatalog for InMemoryCatalog {
    async fn all_books(&self) -> Result<Vec<Book>, CatalogError> {
        Ok(self.books.values().cloned().collect())
    }

    async fn get_books(&self, ids: &[BookId]) -> Result<Vec<Book>, CatalogError> {
        Ok(ids.iter().filter_map(|id| self.books.get(id).cloned()).collect())
    }

    async fn availability(&self, id: BookId) -> Result<BookAvailability, CatalogError> {
        Ok(self.copies.get(&id).copied().unwrap_or(BookAvailability {
            book_id: id,
            total_copies: 0,
            available_copies: 0,
        }))
    }

    async fn status(&self) -> Result<String, CatalogError> {
        Ok(format!("{} books", self.books.len()))
    }

    fn name(&self) -> &str {
        "json"
    }
}
