//! Sliding-window text chunker.
//!
//! Splits text into windows of at most `chunk_size` characters, with
//! consecutive windows sharing `chunk_overlap` characters. A window that
//! would cut mid-word backs off to the nearest line break or whitespace in
//! its second half. Sizes are counted in `char`s, so multi-byte text is
//! never split inside a code point.
//!
//! Each chunk carries a SHA-256 hash of its text, which the memory engine
//! uses as the chunk's identity in the persisted artifact.

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub hash: String,
}

/// Split `text` into overlapping windows. Empty or whitespace-only input
/// yields no chunks.
pub fn chunk_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<Chunk> {
    let size = chunk_size.max(1);
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let n = chars.len();
    let byte_at = |i: usize| chars.get(i).map(|(b, _)| *b).unwrap_or(text.len());

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < n {
        let mut end = (start + size).min(n);

        if end < n {
            // Back off to a boundary, but never below half a window
            let floor = start + size / 2;
            let boundary = (floor..end)
                .rev()
                .find(|&i| chars[i].1 == '\n')
                .or_else(|| (floor..end).rev().find(|&i| chars[i].1.is_whitespace()));
            if let Some(pos) = boundary {
                end = pos + 1;
            }
        }

        let piece = text[byte_at(start)..byte_at(end)].trim();
        if !piece.is_empty() {
            chunks.push(make_chunk(chunks.len(), piece));
        }

        if end >= n {
            break;
        }
        start = end.saturating_sub(chunk_overlap).max(start + 1);
    }

    chunks
}

fn make_chunk(index: usize, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    Chunk {
        index,
        text: text.to_string(),
        hash: format!("{:x}", hasher.finalize()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 512, 64);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_text("", 512, 64).is_empty());
        assert!(chunk_text("  \n\n ", 512, 64).is_empty());
    }

    #[test]
    fn test_windows_respect_size() {
        let text = (0..200)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text(&text, 128, 16);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.chars().count() <= 128);
        }
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }

    #[test]
    fn test_overlap_repeats_tail() {
        let text = (0..100)
            .map(|i| format!("t{:03}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text(&text, 128, 32);
        assert!(chunks.len() >= 2);
        // The last token of the first window reappears in the second
        let last_word = chunks[0].text.split_whitespace().last().unwrap();
        assert!(chunks[1].text.contains(last_word));
    }

    #[test]
    fn test_multibyte_safe() {
        let text = "héllo wörld ".repeat(100);
        let chunks = chunk_text(&text, 130, 10);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.chars().count() <= 130);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta ".repeat(40);
        let c1 = chunk_text(&text, 128, 8);
        let c2 = chunk_text(&text, 128, 8);
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_overlap_larger_than_window_still_advances() {
        let text = "x".repeat(1000);
        let chunks = chunk_text(&text, 128, 512);
        assert!(!chunks.is_empty());
        assert!(chunks.len() <= 1000);
    }
}
