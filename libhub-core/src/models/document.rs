use serde::{Deserialize, Serialize};

use super::{BookId, BookMetadata};

/// A book prepared for indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: BookId,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: BookMetadata,
}

/// One search hit: the document's metadata and its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub id: BookId,
    pub score: f32,
    pub metadata: BookMetadata,
}

/// Ranked documents, highest score first (ties by lower id). May be empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub documents: Vec<ScoredDocument>,
}

impl RetrievalResult {
    pub fn new(documents: Vec<ScoredDocument>) -> Self {
        Self { documents }
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn ids(&self) -> Vec<BookId> {
        self.documents.iter().map(|d| d.id).collect()
    }

    pub fn get(&self, id: BookId) -> Option<&ScoredDocument> {
        self.documents.iter().find(|d| d.id == id)
    }
}
