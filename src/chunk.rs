//! Token-window text chunker.
//!
//! Splits text into contiguous pieces of at most `max_tokens` tokens as
//! counted by the `cl100k_base` BPE, the encoding the embedding models use.
//! Every chunk is an exact slice of the source and chunks never overlap.
//! Whitespace-only windows are dropped.

use std::sync::LazyLock;
use tiktoken_rs::{cl100k_base, CoreBPE};

static BPE: LazyLock<CoreBPE> =
    LazyLock::new(|| cl100k_base().expect("bundled cl100k_base ranks"));

/// A chunk of text and the byte offset where it starts in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub start: usize,
    pub text: String,
}

/// Number of `cl100k_base` tokens in `text`.
pub fn count_tokens(text: &str) -> usize {
    BPE.encode_ordinary(text).len()
}

/// Split text into token-bounded chunks. Whitespace-only input yields none.
pub fn chunk(text: &str, max_tokens: usize) -> Vec<String> {
    chunk_with_offsets(text, max_tokens)
        .into_iter()
        .map(|c| c.text)
        .collect()
}

/// Like [`chunk`], keeping each chunk's starting byte offset.
pub fn chunk_with_offsets(text: &str, max_tokens: usize) -> Vec<TextChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let window = max_tokens.max(1);
    let tokens = BPE.encode_ordinary(text);

    let mut chunks = Vec::new();
    let mut offset = 0;
    let mut next = 0;
    while next < tokens.len() {
        let (end, piece) = decode_window(&tokens, next, window, &text[offset..]);
        let len = piece.len();
        if !piece.trim().is_empty() {
            chunks.push(TextChunk {
                start: offset,
                text: piece,
            });
        }
        offset += len;
        next = end;
    }
    chunks
}

/// Decode up to `window` tokens from `start`.
///
/// A token can hold part of a multi-byte character. The window shrinks until
/// it ends on a character boundary, and grows past `window` only when one
/// character spans more tokens than the window allows.
fn decode_window(tokens: &[u32], start: usize, window: usize, rest: &str) -> (usize, String) {
    let limit = start.saturating_add(window).min(tokens.len());
    let ends = (start + 1..=limit).rev().chain(limit + 1..=tokens.len());
    for end in ends {
        if let Ok(piece) = BPE.decode(tokens[start..end].to_vec()) {
            return (end, piece);
        }
    }
    (tokens.len(), rest.to_string())
}

/// 1-based line number of a byte offset.
pub fn line_at(text: &str, offset: usize) -> usize {
    let offset = offset.min(text.len());
    text.as_bytes()[..offset].iter().filter(|&&b| b == b'\n').count() + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn without_whitespace(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    #[test]
    fn test_whitespace_only_yields_nothing() {
        assert!(chunk("", 10).is_empty());
        assert!(chunk("  \n\t \n", 10).is_empty());
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn test_exactly_max_tokens_is_one_chunk() {
        let text = "one two three four five";
        assert_eq!(count_tokens(text), 5);
        let chunks = chunk(text, 5);
        assert_eq!(chunks, vec![text.to_string()]);
    }

    #[test]
    fn test_one_over_max_tokens_is_two_chunks() {
        let text = "one two three four five six";
        assert_eq!(count_tokens(text), 6);
        let chunks = chunk(text, 5);
        assert_eq!(chunks, vec!["one two three four five", " six"]);
    }

    #[test]
    fn test_chunks_are_exact_slices() {
        let text = "Passwords are rotated every 90 days.\n\nBackups run nightly and are kept offsite.\nVisitors sign in at reception.";
        let chunks = chunk_with_offsets(text, 4);
        assert!(chunks.len() > 1);
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(without_whitespace(&joined), without_whitespace(text));
        for c in &chunks {
            assert_eq!(&text[c.start..c.start + c.text.len()], c.text);
        }
    }

    #[test]
    fn test_multibyte_text_splits_on_char_boundaries() {
        let text = "Überprüfung der Zugänge: 日本語のテキスト 🔐 naïve café";
        let chunks = chunk_with_offsets(text, 1);
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(without_whitespace(&joined), without_whitespace(text));
        for c in &chunks {
            assert_eq!(&text[c.start..c.start + c.text.len()], c.text);
        }
    }

    #[test]
    fn test_unbounded_window_is_one_chunk() {
        let text = "Passwords are rotated every 90 days.";
        assert_eq!(chunk(text, usize::MAX), vec![text.to_string()]);
    }

    #[test]
    fn test_line_at() {
        let text = "first\nsecond\n\nfourth";
        assert_eq!(line_at(text, 0), 1);
        assert_eq!(line_at(text, 6), 2);
        assert_eq!(line_at(text, text.find("fourth").unwrap()), 4);
        assert_eq!(line_at(text, 999), 4);
    }

    #[test]
    fn test_zero_max_tokens_treated_as_one() {
        assert_eq!(chunk("one two", 0), vec!["one", " two"]);
    }

    #[test]
    fn test_deterministic() {
        let text = "Paragraph one.\n\nParagraph two has more words in it.";
        assert_eq!(chunk(text, 4), chunk(text, 4));
    }
}
