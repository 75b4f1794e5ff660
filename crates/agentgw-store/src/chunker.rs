//! Text chunking for ingestion.
//!
//! Documents are split into ~1 KiB chunks with a small overlap so that a
//! statement falling on a boundary is still retrievable from either side.
//! Boundaries prefer paragraph breaks, then sentence ends, then whitespace,
//! and only hard-cut as a last resort.

/// Target chunk size in bytes.
pub const CHUNK_SIZE: usize = 1024;

/// Overlap carried from the end of one chunk into the next, in bytes.
pub const CHUNK_OVERLAP: usize = 128;

/// Split `text` into chunks of roughly [`CHUNK_SIZE`] bytes.
pub fn chunk_text(text: &str) -> Vec<String> {
    chunk_text_with(text, CHUNK_SIZE, CHUNK_OVERLAP)
}

/// Split `text` into chunks of roughly `target` bytes with `overlap` bytes
/// carried between consecutive chunks.
pub fn chunk_text_with(text: &str, target: usize, overlap: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= target {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let hard_end = floor_char_boundary(text, (start + target).min(text.len()));

        let end = if hard_end == text.len() {
            hard_end
        } else {
            // Look for a natural boundary in the back half of the window.
            let window_floor = floor_char_boundary(text, start + target / 2);
            best_boundary(&text[window_floor..hard_end])
                .map(|rel| window_floor + rel)
                .unwrap_or(hard_end)
        };

        let piece = text[start..end].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }

        if end == text.len() {
            break;
        }

        // Step back by the overlap, but always make forward progress.
        let next = floor_char_boundary(text, end.saturating_sub(overlap).max(start + 1));
        start = if next > start { next } else { end };
    }

    chunks
}

/// Find the best split point inside `window`, returned as a byte offset
/// *after* the boundary. Paragraph breaks win over sentence ends, sentence
/// ends over plain whitespace.
fn best_boundary(window: &str) -> Option<usize> {
    if let Some(pos) = window.rfind("\n\n") {
        return Some(pos + 2);
    }
    for pat in [". ", ".\n", "! ", "? "] {
        if let Some(pos) = window.rfind(pat) {
            return Some(pos + pat.len());
        }
    }
    window
        .rfind(|c: char| c.is_whitespace())
        .map(|pos| pos + window[pos..].chars().next().map_or(1, char::len_utf8))
}

/// Largest index `<= i` that lies on a char boundary.
fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
