//! Token accounting shared by the embedder budget check and the prompt assembler.
//!
//! A token is a whitespace-separated word. The count is deterministic and
//! additive: two pieces joined by a newline count as the sum of their parts.

/// Number of tokens in `text`.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Truncate to at most `max_chars` characters, cutting at the last word
/// boundary when one exists. Appends `...` when anything was removed.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let Some((cut, _)) = text.char_indices().nth(max_chars) else {
        return text.to_string();
    };

    let head = &text[..cut];
    let head = head
        .rfind(char::is_whitespace)
        .map(|idx| head[..idx].trim_end())
        .filter(|h| !h.is_empty())
        .unwrap_or(head);

    format!("{head}...")
}

/// Keep the first `max_tokens` tokens, joined by single spaces.
pub fn truncate_tokens(text: &str, max_tokens: usize) -> String {
    text.split_whitespace()
        .take(max_tokens)
        .collect::<Vec<_>>()
        .join(" ")
}
