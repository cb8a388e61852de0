pub mod book;
pub mod document;
pub mod turn;

/// Catalog identifier of a book; also the document id in the vector index.
pub type BookId = i64;

pub use book::{Book, BookAvailability, BookCard, BookMetadata};
pub use document::{Document, RetrievalResult, ScoredDocument};
pub use turn::{ConversationTurn, Role};
