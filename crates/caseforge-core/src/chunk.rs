//! Paragraph-boundary text chunker with overlap.
//!
//! Splits a [`Document`] body into [`Chunk`]s of at most `chunk_size`
//! bytes. Paragraphs (`\n\n`) are packed together while they fit; an
//! oversized paragraph is hard-split at the nearest newline or space.
//! Every chunk after the first is prefixed with up to `chunk_overlap`
//! bytes from the tail of the previous chunk's body, so context that
//! straddles a boundary is retrievable from either side.
//!
//! Each chunk carries a SHA-256 hash of its final text (the dedup key in
//! the index) and an id derived from the document id, index, and hash.
//!
//! # Example
//!
//! ```rust
//! use caseforge_core::chunk::chunk_text;
//! use caseforge_core::models::Document;
//!
//! let doc = Document::new("login.md", "Users sign in.\n\nPasswords are masked.");
//! let chunks = chunk_text(&doc, 1000, 200);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].text, "Users sign in.\n\nPasswords are masked.");
//! ```

use sha2::{Digest, Sha256};

use crate::models::{uuid_from_digest, Chunk, Document};

/// Split a document into overlapping chunks.
///
/// # Guarantees
///
/// - Whitespace-only bodies produce no chunks.
/// - Indices run `0..N` without gaps.
/// - The output is a pure function of the document and the two sizes.
/// - A chunk never exceeds `chunk_size` bytes while
///   `chunk_size > chunk_overlap + 1`, except where a single character is
///   wider than the remaining budget.
pub fn chunk_text(document: &Document, chunk_size: usize, chunk_overlap: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let overlap = chunk_overlap.min(chunk_size - 1);
    let separator = usize::from(overlap > 0);
    let body_max = chunk_size.saturating_sub(overlap + separator).max(1);

    let pieces = split_pieces(&document.body, body_max);

    let mut chunks = Vec::with_capacity(pieces.len());
    let mut previous: Option<&str> = None;
    for (index, piece) in pieces.iter().enumerate() {
        let text = match previous {
            Some(prev) if overlap > 0 => {
                let tail = overlap_tail(prev, overlap);
                if tail.is_empty() {
                    piece.clone()
                } else {
                    format!("{}\n{}", tail, piece)
                }
            }
            _ => piece.clone(),
        };
        chunks.push(make_chunk(document, index as i64, &text));
        previous = Some(piece);
    }
    chunks
}

/// Pack paragraphs into bodies of at most `max` bytes.
fn split_pieces(text: &str, max: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if buf.is_empty() {
            trimmed.len()
        } else {
            buf.len() + 2 + trimmed.len()
        };

        if would_be > max && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if trimmed.len() > max {
            pieces.extend(hard_split(trimmed, max).into_iter().map(str::to_string));
        } else {
            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(trimmed);
        }
    }

    if !buf.is_empty() {
        pieces.push(buf);
    }
    pieces
}

/// Split an oversized paragraph at newline/space boundaries.
fn hard_split(para: &str, max: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut remaining = para;
    while !remaining.is_empty() {
        let limit = snap_back(remaining, remaining.len().min(max));
        let split_at = if limit < remaining.len() {
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        let split_at = if split_at == 0 {
            first_char_len(remaining)
        } else {
            split_at
        };
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece);
        }
        remaining = &remaining[split_at..];
    }
    out
}

/// The last `n` bytes of `s`, advanced to a word start when possible.
fn overlap_tail(s: &str, n: usize) -> &str {
    if s.len() <= n {
        return s.trim();
    }
    let mut start = s.len() - n;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    let at_word_start = s[..start].ends_with(char::is_whitespace);
    if !at_word_start {
        if let Some(pos) = s[start..].find(char::is_whitespace) {
            start += pos;
        }
    }
    s[start..].trim()
}

fn snap_back(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn first_char_len(s: &str) -> usize {
    s.chars().next().map(char::len_utf8).unwrap_or(s.len())
}

/// Hex SHA-256 of a chunk's text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(document: &Document, index: i64, text: &str) -> Chunk {
    let hash = content_hash(text);

    let mut hasher = Sha256::new();
    hasher.update(document.id.as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(hash.as_bytes());

    Chunk {
        id: uuid_from_digest(&hasher.finalize()),
        document_id: document.id.clone(),
        chunk_index: index,
        source_id: document.source_id.clone(),
        text: text.to_string(),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(body: &str) -> Document {
        Document::new("requirements/login.md", body)
    }

    #[test]
    fn test_short_requirement_is_one_chunk() {
        let chunks = chunk_text(&doc("Users sign in with email."), 1000, 200);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Users sign in with email.");
        assert_eq!(chunks[0].source_id, "requirements/login.md");
    }

    #[test]
    fn test_whitespace_only_yields_nothing() {
        assert!(chunk_text(&doc(""), 1000, 200).is_empty());
        assert!(chunk_text(&doc("  \n\n \t "), 1000, 200).is_empty());
    }

    #[test]
    fn test_paragraphs_packed_together() {
        let text = "REQ-1 Login form.\n\nREQ-2 Password reset.\n\nREQ-3 Lockout after five failures.";
        let chunks = chunk_text(&doc(text), 1000, 200);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.starts_with("REQ-1"));
        assert!(chunks[0].text.contains("\n\nREQ-3"));
    }

    #[test]
    fn test_indices_are_contiguous() {
        let text: String = (1..=40)
            .map(|n| format!("REQ-{n}: the system records event {n}."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text(&doc(&text), 80, 16);
        assert!(chunks.len() > 5);
        let indices: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, (0..chunks.len() as i64).collect::<Vec<_>>());
    }

    #[test]
    fn test_chunks_respect_size() {
        let text = "click ".repeat(300);
        let chunks = chunk_text(&doc(&text), 100, 20);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.text.len() <= 100));
    }

    #[test]
    fn test_overlap_carries_previous_tail() {
        let text = "alpha beta gamma delta\n\nepsilon zeta eta theta";
        let chunks = chunk_text(&doc(text), 40, 8);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].text.starts_with("delta\n"));
        assert!(chunks[1].text.ends_with("epsilon zeta eta theta"));
    }

    #[test]
    fn test_zero_overlap_has_no_prefix() {
        let text = "alpha beta gamma delta\n\nepsilon zeta eta theta";
        let chunks = chunk_text(&doc(text), 25, 0);
        assert_eq!(chunks[1].text, "epsilon zeta eta theta");
    }

    #[test]
    fn test_split_never_breaks_a_char() {
        let text = "Überprüfung der Anmeldung für Benutzer: Passwörter müssen maskiert sein.";
        let chunks = chunk_text(&doc(text), 10, 3);
        assert!(chunks.len() > 1);
        // Slicing mid-character would have panicked; every piece is non-empty.
        assert!(chunks.iter().all(|c| !c.text.is_empty()));
    }

    #[test]
    fn test_same_input_same_chunks() {
        let text = "Login\n\nLogout\n\nSession timeout\n\nRemember me";
        assert_eq!(chunk_text(&doc(text), 16, 4), chunk_text(&doc(text), 16, 4));
    }

    #[test]
    fn test_hash_matches_text() {
        let chunks = chunk_text(&doc("Login requires username and password fields"), 1000, 200);
        assert_eq!(chunks[0].hash, content_hash(&chunks[0].text));
    }

    #[test]
    fn test_ids_differ_per_document() {
        let a = chunk_text(&Document::new("a.md", "Same text"), 100, 0);
        let b = chunk_text(&Document::new("b.md", "Same text"), 100, 0);
        assert_eq!(a[0].hash, b[0].hash);
        assert_ne!(a[0].id, b[0].id);
    }
}
