//! Markdown-aware text chunker.
//!
//! Splits page markdown into [`Chunk`]s of at most `target_chars`
//! characters. Inside each window the split point is chosen, in order of
//! preference, at the last heading line, the last blank-line paragraph
//! break, the last sentence end, or a hard cut at the window edge. A split
//! point is only accepted if it leaves at least `min_chars` characters in
//! the chunk, and heading/paragraph/sentence candidates inside fenced code
//! blocks are ignored.
//!
//! Chunks do not overlap. Whitespace at chunk edges is trimmed and
//! whitespace-only pieces are dropped, so indices are dense from 0. The
//! same input always yields the same chunks.

use sha2::{Digest, Sha256};

/// One chunk of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: i64,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

/// Split markdown into ordered chunks.
pub fn chunk_markdown(text: &str, target_chars: usize, min_chars: usize) -> Vec<Chunk> {
    let target_chars = target_chars.max(1);
    let min_chars = min_chars.min(target_chars.saturating_sub(1));
    let fences = fenced_ranges(text);

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let rest = &text[start..];

        let window_end = match byte_offset_of_char(rest, target_chars) {
            Some(end) => end,
            None => {
                push_chunk(&mut chunks, rest);
                break;
            }
        };
        let window = &rest[..window_end];
        let min_byte = byte_offset_of_char(window, min_chars).unwrap_or(window.len());
        let in_fence = |pos: usize| fences.iter().any(|&(s, e)| start + pos > s && start + pos < e);

        let cut = heading_boundary(window, min_byte, &in_fence)
            .or_else(|| paragraph_boundary(window, min_byte, &in_fence))
            .or_else(|| sentence_boundary(window, min_byte, &in_fence))
            .unwrap_or(window_end);

        push_chunk(&mut chunks, &rest[..cut]);
        start += cut;
    }

    chunks
}

fn push_chunk(chunks: &mut Vec<Chunk>, piece: &str) {
    let trimmed = piece.trim();
    if trimmed.is_empty() {
        return;
    }
    let index = chunks.len() as i64;
    chunks.push(make_chunk(index, trimmed));
}

fn make_chunk(index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        index,
        text: text.to_string(),
        hash,
    }
}

/// Byte offset of the `n`-th character, or `None` if `s` has `n` or fewer characters.
fn byte_offset_of_char(s: &str, n: usize) -> Option<usize> {
    s.char_indices().nth(n).map(|(i, _)| i)
}

/// Start of the last heading line after `min_byte`.
fn heading_boundary(window: &str, min_byte: usize, in_fence: &dyn Fn(usize) -> bool) -> Option<usize> {
    let mut best = None;
    let mut offset = 0usize;
    for line in window.split_inclusive('\n') {
        if offset > min_byte && is_heading(line) && !in_fence(offset) {
            best = Some(offset);
        }
        offset += line.len();
    }
    best
}

fn is_heading(line: &str) -> bool {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    (1..=6).contains(&hashes)
        && line[hashes..]
            .chars()
            .next()
            .map(|c| c == ' ' || c == '\t')
            .unwrap_or(false)
}

/// Position of the last blank-line break after `min_byte`.
fn paragraph_boundary(window: &str, min_byte: usize, in_fence: &dyn Fn(usize) -> bool) -> Option<usize> {
    window
        .match_indices("\n\n")
        .map(|(i, _)| i)
        .filter(|&i| i > min_byte && !in_fence(i))
        .last()
}

/// Position just past the last sentence terminator after `min_byte`.
fn sentence_boundary(window: &str, min_byte: usize, in_fence: &dyn Fn(usize) -> bool) -> Option<usize> {
    let mut best = None;
    let mut chars = window.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(_, next)) = chars.peek() {
                let cut = i + c.len_utf8();
                if next.is_whitespace() && cut > min_byte && !in_fence(cut) {
                    best = Some(cut);
                }
            }
        }
    }
    best
}

/// Byte ranges covered by triple-backtick fences, opening line to closing line.
pub(crate) fn fenced_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut open: Option<usize> = None;
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        if line.trim_start().starts_with("```") {
            match open.take() {
                Some(s) => ranges.push((s, offset + line.len())),
                None => open = Some(offset),
            }
        }
        offset += line.len();
    }
    if let Some(s) = open {
        ranges.push((s, text.len()));
    }
    ranges
}

/// Heading list and size statistics for a chunk's metadata.
pub fn section_info(chunk: &str) -> serde_json::Value {
    let headers: Vec<&str> = chunk
        .lines()
        .filter(|l| is_heading(l))
        .map(|l| l.trim_end())
        .collect();

    serde_json::json!({
        "headers": headers.join("; "),
        "char_count": chunk.chars().count(),
        "word_count": crate::models::word_count(chunk),
    })
}
