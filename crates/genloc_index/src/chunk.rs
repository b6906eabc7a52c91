use std::sync::Arc;

use crate::tokens::TokenCounter;

/// Separators tried in order; the empty separator splits into characters.
const SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

/// Token-bounded recursive splitter.
///
/// Text is cut on the coarsest separator present, separators stay attached to
/// the piece that follows them, and adjacent pieces are merged back together
/// until the next one would overflow the limit. Pieces that are still too
/// large are split again with the next separator. Chunks never overlap.
#[derive(Clone)]
pub struct Chunker {
    counter: Arc<dyn TokenCounter>,
    chunk_size_tokens: usize,
}

impl Chunker {
    pub fn new(counter: Arc<dyn TokenCounter>, chunk_size_tokens: usize) -> Self {
        Self {
            counter,
            chunk_size_tokens: chunk_size_tokens.max(1),
        }
    }

    pub fn chunk_size_tokens(&self) -> usize {
        self.chunk_size_tokens
    }

    pub fn counter(&self) -> &Arc<dyn TokenCounter> {
        &self.counter
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, SEPARATORS)
    }

    fn split_with(&self, text: &str, separators: &'static [&'static str]) -> Vec<String> {
        let (separator, remaining) = pick_separator(text, separators);
        let mut chunks = Vec::new();
        let mut pending: Vec<&str> = Vec::new();

        for piece in split_keeping_separator(text, separator) {
            if self.counter.count(piece) < self.chunk_size_tokens {
                pending.push(piece);
                continue;
            }

            if !pending.is_empty() {
                chunks.extend(self.merge(&pending));
                pending.clear();
            }

            if remaining.is_empty() {
                chunks.push(piece.to_string());
            } else {
                chunks.extend(self.split_with(piece, remaining));
            }
        }

        if !pending.is_empty() {
            chunks.extend(self.merge(&pending));
        }

        chunks
    }

    fn merge(&self, pieces: &[&str]) -> Vec<String> {
        let mut merged = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut total = 0usize;

        for piece in pieces {
            let length = self.counter.count(piece);
            if total + length > self.chunk_size_tokens && !current.is_empty() {
                push_joined(&current, &mut merged);
                current.clear();
                total = 0;
            }
            current.push(piece);
            total += length;
        }

        push_joined(&current, &mut merged);
        merged
    }
}

fn push_joined(pieces: &[&str], out: &mut Vec<String>) {
    let joined: String = pieces.concat();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

fn pick_separator(
    text: &str,
    separators: &'static [&'static str],
) -> (&'static str, &'static [&'static str]) {
    for (index, separator) in separators.iter().enumerate() {
        if separator.is_empty() {
            return ("", &[]);
        }
        if text.contains(separator) {
            return (separator, &separators[index + 1..]);
        }
    }
    ("", &[])
}

fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(index, ch)| &text[index..index + ch.len_utf8()])
            .collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0usize;
    for (index, _) in text.match_indices(separator) {
        if index > start {
            pieces.push(&text[start..index]);
        }
        start = index;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}
