//! Sentence-aware sliding-window chunker.
//!
//! Splits a content body into overlapping [`Chunk`]s. The output is a pure
//! function of `(text, chunk_size, overlap, lookback)`, so chunks (and the
//! embeddings keyed by `(hash, seq)`) stay valid across reindexing.
//!
//! # Algorithm
//!
//! 1. Text no longer than `chunk_size` bytes becomes one chunk at `pos = 0`.
//! 2. Otherwise take a window of `chunk_size` bytes starting at `pos`,
//!    snapped back to a UTF-8 boundary.
//! 3. If the window does not reach the end of the text, scan back up to
//!    `lookback` bytes for `.`, `!` or `?` followed by whitespace and cut
//!    just after the terminator.
//! 4. The next window starts `overlap` bytes before the cut, so an uncut
//!    window advances by `chunk_size - overlap`.
//!
//! # Example
//!
//! ```rust
//! use qmd_core::chunk::{chunk_text, ChunkParams};
//!
//! let chunks = chunk_text("3f2a9c", "Hello world.", &ChunkParams::default());
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].pos, 0);
//! ```

use crate::error::{QmdError, Result};
use crate::models::Chunk;

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

pub const DEFAULT_CHUNK_SIZE: usize = 800 * CHARS_PER_TOKEN;
pub const DEFAULT_OVERLAP: usize = 120 * CHARS_PER_TOKEN;
pub const DEFAULT_LOOKBACK: usize = 200;

/// Chunker parameters, all measured in bytes of UTF-8 text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub chunk_size: usize,
    pub overlap: usize,
    pub lookback: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_OVERLAP,
            lookback: DEFAULT_LOOKBACK,
        }
    }
}

impl ChunkParams {
    pub fn new(chunk_size: usize, overlap: usize, lookback: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(QmdError::InvalidInput("chunk size must be > 0".into()));
        }
        if overlap >= chunk_size {
            return Err(QmdError::InvalidInput(format!(
                "chunk overlap ({overlap}) must be smaller than chunk size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
            lookback,
        })
    }

    /// Build parameters from token budgets using [`CHARS_PER_TOKEN`].
    pub fn from_tokens(max_tokens: usize, overlap_tokens: usize, lookback: usize) -> Result<Self> {
        Self::new(
            max_tokens * CHARS_PER_TOKEN,
            overlap_tokens * CHARS_PER_TOKEN,
            lookback,
        )
    }
}

/// Split `text` into chunks belonging to the content identified by `hash`.
///
/// # Guarantees
///
/// - At least one chunk is returned, even for empty text.
/// - `seq` is contiguous from 0 and `pos` strictly increases.
/// - Every byte of `text` lies inside some chunk.
/// - No chunk boundary splits a multi-byte code point.
pub fn chunk_text(hash: &str, text: &str, params: &ChunkParams) -> Vec<Chunk> {
    let size = params.chunk_size.max(1);

    if text.len() <= size {
        return vec![make_chunk(hash, 0, 0, text)];
    }

    let mut chunks = Vec::new();
    let mut pos = 0;

    loop {
        let mut end = snap_to_char_boundary(text, pos + size);
        if end <= pos {
            end = next_char_boundary(text, pos);
        }
        if end < text.len() {
            if let Some(cut) = sentence_break(text, pos, end, params.lookback) {
                end = cut;
            }
        }

        chunks.push(make_chunk(hash, chunks.len(), pos, &text[pos..end]));

        if end >= text.len() {
            break;
        }

        let next = snap_to_char_boundary(text, end.saturating_sub(params.overlap));
        // Overlap swallowed the whole step: resume at the cut instead.
        pos = if next > pos { next } else { end };
    }

    chunks
}

/// Find the last cut point in `(pos, end]` within `lookback` bytes of `end`
/// that sits right after a sentence terminator followed by whitespace.
fn sentence_break(text: &str, pos: usize, end: usize, lookback: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let floor = end.saturating_sub(lookback).max(pos + 1);

    let mut cut = end;
    while cut > floor {
        let terminator = matches!(bytes[cut - 1], b'.' | b'!' | b'?');
        let followed_by_space = bytes.get(cut).is_some_and(|b| b.is_ascii_whitespace());
        if terminator && followed_by_space {
            return Some(cut);
        }
        cut -= 1;
    }
    None
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// First char boundary strictly after `index`.
fn next_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index + 1;
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i.min(s.len())
}

fn make_chunk(hash: &str, seq: usize, pos: usize, text: &str) -> Chunk {
    Chunk {
        hash: hash.to_string(),
        seq,
        pos,
        text: text.to_string(),
    }
}
