use serde::{Deserialize, Serialize};

use super::BookId;

/// A catalog book as supplied by the document source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Book {
    #[serde(default)]
    pub id: BookId,
    pub title: String,
    pub author: String,
    pub genres: Option<String>,
    pub subjects: Option<String>,
    pub description: Option<String>,
    pub synopsis: Option<String>,
    pub language: Option<String>,
    pub pages: Option<i32>,
    /// `YYYY-MM-DD` or a bare year; kept as text like the catalog stores it.
    pub date_published: Option<String>,
    pub cover_image_url: Option<String>,
    pub pacing: Option<String>,
    pub tone: Option<String>,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub mood_tags: Vec<String>,
}

impl Book {
    /// Text fed to the embedder: bibliographic fields first, then the enriched
    /// pacing/tone/themes/moods so vector search can match on them too.
    pub fn embedding_text(&self) -> String {
        let summary = non_empty(&self.synopsis).or_else(|| non_empty(&self.description));

        let mut parts: Vec<String> = [
            Some(self.title.as_str()),
            Some(self.author.as_str()),
            summary,
            non_empty(&self.subjects),
            non_empty(&self.genres),
        ]
        .into_iter()
        .flatten()
        .filter(|p| !p.trim().is_empty())
        .map(str::to_string)
        .collect();

        if let Some(pacing) = non_empty(&self.pacing) {
            parts.push(format!("Pacing: {pacing}"));
        }
        if let Some(tone) = non_empty(&self.tone) {
            parts.push(format!("Tone: {tone}"));
        }
        if !self.themes.is_empty() {
            parts.push(format!("Themes: {}", self.themes.join(", ")));
        }
        if !self.mood_tags.is_empty() {
            parts.push(format!("Moods: {}", self.mood_tags.join(", ")));
        }

        parts.join(" ")
    }

    /// Leading four-digit year of `date_published`.
    pub fn year(&self) -> Option<i32> {
        parse_year(self.date_published.as_deref()?)
    }

    pub fn metadata(&self) -> BookMetadata {
        BookMetadata {
            title: self.title.clone(),
            author: self.author.clone(),
            genres: self.genres.clone(),
            subjects: self.subjects.clone(),
            language: self.language.clone(),
            pages: self.pages,
            year: self.year(),
            cover_url: self.cover_image_url.clone(),
            synopsis: non_empty(&self.synopsis)
                .or_else(|| non_empty(&self.description))
                .map(str::to_string),
            pacing: self.pacing.clone(),
            tone: self.tone.clone(),
        }
    }
}

/// Display fields stored alongside a vector in the index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookMetadata {
    pub title: String,
    pub author: String,
    pub genres: Option<String>,
    pub subjects: Option<String>,
    pub language: Option<String>,
    pub pages: Option<i32>,
    pub year: Option<i32>,
    pub cover_url: Option<String>,
    pub synopsis: Option<String>,
    pub pacing: Option<String>,
    pub tone: Option<String>,
}

/// Copy counts for one book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookAvailability {
    pub book_id: BookId,
    pub total_copies: i64,
    pub available_copies: i64,
}

impl BookAvailability {
    pub fn label(&self) -> String {
        format!("{}/{} available", self.available_copies, self.total_copies)
    }
}

/// Compact card attached to the end of a chat reply for each cited book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookCard {
    pub id: BookId,
    pub title: String,
    pub author: String,
    pub cover: String,
    pub availability: String,
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.trim().is_empty())
}

pub(crate) fn parse_year(date: &str) -> Option<i32> {
    let head = date.trim().get(..4)?;
    if head.chars().all(|c| c.is_ascii_digit()) {
        head.parse().ok()
    } else {
        None
    }
}
