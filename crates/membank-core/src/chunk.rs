//! Paragraph-boundary chunker with optional overlap.
//!
//! Units of text (one per encoded document or appended note) are split into
//! [`Chunk`]s no longer than `max_chars`, breaking on blank lines (`\n\n`)
//! where possible. A paragraph that alone exceeds the limit is hard-split at
//! the last whitespace before the limit.
//!
//! With a non-zero `overlap_chars`, every chunk after the first in a unit
//! carries the tail of its predecessor in [`Chunk::overlap`]. The overlap is
//! stored apart from the chunk body, so [`reassemble_unit`] can rebuild the
//! unit text without repeating it.
//!
//! Section headers written by the bridge (`=== label ===`) are tracked so
//! each chunk knows which named source it came from.
//!
//! ```rust
//! use membank_core::chunk::chunk_units;
//! use membank_core::models::EncodeOptions;
//!
//! let opts = EncodeOptions { max_chars: 40, overlap_chars: 0 };
//! let chunks = chunk_units(&["Alpha paragraph.\n\nBeta paragraph.\n\nGamma.".to_string()], &opts);
//! assert_eq!(chunks.len(), 2);
//! assert_eq!(chunks[1].frame, 1);
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Chunk, EncodeOptions};

/// Split every unit and number the resulting chunks as contiguous frames.
///
/// Whitespace-only units produce no chunks.
pub fn chunk_units(units: &[String], opts: &EncodeOptions) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    for (unit, text) in units.iter().enumerate() {
        let pieces = split_paragraphs(text, opts.max_chars.max(1));
        let mut current_source: Option<String> = None;
        let mut previous: Option<&str> = None;

        for piece in &pieces {
            let source = leading_header(piece).or_else(|| current_source.clone());
            if let Some(last) = last_header(piece) {
                current_source = Some(last);
            }
            let overlap = match previous {
                Some(prev) if opts.overlap_chars > 0 => tail(prev, opts.overlap_chars).to_string(),
                _ => String::new(),
            };
            chunks.push(make_chunk(unit, chunks.len(), overlap, piece, source));
            previous = Some(piece.as_str());
        }
    }
    chunks
}

/// Rejoin the bodies of one unit's chunks (in frame order) into unit text.
pub fn reassemble_unit<'a>(bodies: impl IntoIterator<Item = &'a str>) -> String {
    bodies.into_iter().collect::<Vec<_>>().join("\n\n")
}

/// Greedy paragraph packing. Never returns empty pieces. Lengths are
/// counted in chars, not bytes.
fn split_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut buf = String::new();
    let mut buf_chars = 0;

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let para_chars = para.chars().count();
        if para_chars > max_chars {
            if !buf.is_empty() {
                pieces.push(std::mem::take(&mut buf));
                buf_chars = 0;
            }
            pieces.extend(hard_split(para, max_chars));
            continue;
        }

        let needed = if buf.is_empty() {
            para_chars
        } else {
            buf_chars + 2 + para_chars
        };
        if needed > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
            buf_chars = 0;
        }
        if !buf.is_empty() {
            buf.push_str("\n\n");
            buf_chars += 2;
        }
        buf.push_str(para);
        buf_chars += para_chars;
    }

    if !buf.is_empty() {
        pieces.push(buf);
    }
    pieces
}

/// Split an oversized paragraph at whitespace, falling back to a char
/// boundary when a single word is longer than the limit.
fn hard_split(para: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut remaining = para;

    while !remaining.is_empty() {
        let limit = byte_offset_of_char(remaining, max_chars);
        if limit == remaining.len() {
            out.push(remaining.to_string());
            break;
        }
        let cut = remaining[..limit]
            .rfind(char::is_whitespace)
            .filter(|&pos| pos > 0)
            .unwrap_or(limit);

        let piece = remaining[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = remaining[cut..].trim_start();
    }
    out
}

/// The last `n` chars of `s`, moved forward to a word start when possible.
fn tail(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    let window = &s[byte_offset_of_char(s, count - n)..];
    match window.find(char::is_whitespace) {
        Some(ws) if ws + 1 < window.len() => window[ws..].trim_start(),
        _ => window,
    }
}

/// Byte offset where the `n`th char of `s` starts, or `s.len()`.
fn byte_offset_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

fn header_label(line: &str) -> Option<String> {
    let line = line.trim();
    let inner = line.strip_prefix("=== ")?.strip_suffix(" ===")?;
    (!inner.is_empty()).then(|| inner.to_string())
}

fn leading_header(piece: &str) -> Option<String> {
    piece.lines().next().and_then(header_label)
}

fn last_header(piece: &str) -> Option<String> {
    piece.lines().filter_map(header_label).last()
}

fn make_chunk(
    unit: usize,
    frame: usize,
    overlap: String,
    text: &str,
    source: Option<String>,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());

    Chunk {
        id: Uuid::new_v4().to_string(),
        unit,
        frame,
        overlap,
        text: text.to_string(),
        hash: format!("{:x}", hasher.finalize()),
        source,
    }
}
