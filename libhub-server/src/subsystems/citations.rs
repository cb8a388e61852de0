//! Strip `BID[id]` citation markers from streamed model output.
//!
//! Markers can be split across chunks, so a trailing fragment that could still
//! grow into a marker is held back until the next chunk (or `finish`).

use libhub_core::models::BookId;

const OPEN: &str = "BID[";

/// Longest digit run accepted inside a marker (fits an i64).
const MAX_ID_DIGITS: usize = 18;

#[derive(Debug, Default)]
pub struct CitationFilter {
    pending: String,
    cited: Vec<BookId>,
}

impl CitationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the text that is safe to forward now.
    pub fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        let buffer = std::mem::take(&mut self.pending);

        let mut out = String::with_capacity(buffer.len());
        let mut rest = buffer.as_str();

        while let Some(start) = rest.find(OPEN) {
            out.push_str(&rest[..start]);
            let after = &rest[start + OPEN.len()..];
            let digits = after.bytes().take_while(u8::is_ascii_digit).count();

            match after[digits..].chars().next() {
                Some(']') if digits > 0 && digits <= MAX_ID_DIGITS => {
                    if let Ok(id) = after[..digits].parse::<BookId>() {
                        if !self.cited.contains(&id) {
                            self.cited.push(id);
                        }
                    }
                    rest = &after[digits + 1..];
                }
                None if digits <= MAX_ID_DIGITS => {
                    // Marker still open at the end of the buffer.
                    self.pending = rest[start..].to_string();
                    return out;
                }
                _ => {
                    // Not a marker after all; emit the literal prefix and move on.
                    out.push_str(OPEN);
                    rest = after;
                }
            }
        }

        let keep = partial_open_len(rest);
        out.push_str(&rest[..rest.len() - keep]);
        self.pending = rest[rest.len() - keep..].to_string();
        out
    }

    /// Flush whatever was held back. An unterminated marker is emitted as text.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    /// Cited ids in order of first appearance.
    pub fn cited(&self) -> &[BookId] {
        &self.cited
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `BID[`.
fn partial_open_len(text: &str) -> usize {
    (1..OPEN.len())
        .rev()
        .find(|&n| text.ends_with(&OPEN[..n]))
        .unwrap_or(0)
}
