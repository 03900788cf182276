//! Markdown chunker with three interchangeable strategies.
//!
//! - **Heading** (default): one chunk per heading section; each chunk carries
//!   the heading path it sits under. Sections over the size ceiling are split
//!   with the fixed-size window, tiny sections are merged forward, and notes
//!   with no headings fall back to fixed-size windows.
//! - **FixedSize**: sliding window of `max_tokens` with `overlap_tokens`.
//! - **Sentence**: groups whole sentences up to `max_tokens`; the fallback for
//!   long unstructured prose.
//!
//! Chunks are exact slices of the input (`text == body[char_span]`), so
//! [`stitch`] reconstructs the body. Chunk IDs are UUIDv5 of
//! `document_id#position`, so re-chunking unchanged content is idempotent.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ops::Range;
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::models::Chunk;

/// Approximate chars-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    #[default]
    Heading,
    FixedSize,
    Sentence,
}

#[derive(Debug, Clone)]
pub struct ChunkingOptions {
    pub strategy: ChunkStrategy,
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub min_chunk_tokens: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self::from(&ChunkingConfig::default())
    }
}

impl From<&ChunkingConfig> for ChunkingOptions {
    fn from(c: &ChunkingConfig) -> Self {
        Self {
            strategy: c.strategy,
            max_tokens: c.max_tokens,
            overlap_tokens: c.overlap_tokens,
            min_chunk_tokens: c.min_chunk_tokens,
        }
    }
}

struct Piece {
    span: Range<usize>,
    heading_path: Vec<String>,
}

/// Split a note body into ordered chunks.
///
/// Empty (or whitespace-only) bodies produce no chunks. Bodies shorter than
/// the minimum chunk size produce exactly one.
pub fn chunk_document(document_id: &str, text: &str, opts: &ChunkingOptions) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let max_chars = opts.max_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = opts.overlap_tokens * CHARS_PER_TOKEN;
    let min_chars = opts.min_chunk_tokens * CHARS_PER_TOKEN;

    let pieces = if text.trim().len() < min_chars {
        vec![Piece {
            span: 0..text.len(),
            heading_path: Vec::new(),
        }]
    } else {
        match opts.strategy {
            ChunkStrategy::Heading => heading_pieces(text, max_chars, overlap_chars, min_chars),
            ChunkStrategy::FixedSize => fixed_windows(text, 0..text.len(), max_chars, overlap_chars)
                .into_iter()
                .map(|span| Piece {
                    span,
                    heading_path: Vec::new(),
                })
                .collect(),
            ChunkStrategy::Sentence => sentence_groups(text, 0..text.len(), max_chars)
                .into_iter()
                .map(|span| Piece {
                    span,
                    heading_path: Vec::new(),
                })
                .collect(),
        }
    };

    pieces
        .into_iter()
        .enumerate()
        .map(|(position, piece)| make_chunk(document_id, position, text, piece))
        .collect()
}

/// Chunk a whole note whose body starts at `body_start`.
///
/// The body is chunked as in [`chunk_document`] and the frontmatter block
/// is folded into the first chunk, so spans are relative to `content` and
/// [`stitch`] rebuilds the full note. A note with frontmatter but no body
/// becomes a single chunk.
pub fn chunk_note(
    document_id: &str,
    content: &str,
    body_start: usize,
    opts: &ChunkingOptions,
) -> Vec<Chunk> {
    if content.trim().is_empty() {
        return Vec::new();
    }
    let body_start = snap_to_char_boundary(content, body_start);
    let mut chunks = chunk_document(document_id, &content[body_start..], opts);
    if body_start == 0 {
        return chunks;
    }

    for chunk in &mut chunks {
        chunk.char_span = chunk.char_span.start + body_start..chunk.char_span.end + body_start;
    }
    match chunks.first_mut() {
        Some(first) => {
            first.char_span.start = 0;
            first.text = content[first.char_span.clone()].to_string();
            first.hash = text_hash(&first.text);
        }
        None => chunks.push(make_chunk(
            document_id,
            0,
            content,
            Piece {
                span: 0..content.len(),
                heading_path: Vec::new(),
            },
        )),
    }
    chunks
}

/// Rebuild the original body from chunks ordered by position, dropping the
/// overlapping prefix of each chunk.
pub fn stitch(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    let mut covered = 0usize;
    for c in chunks {
        let skip = covered.saturating_sub(c.char_span.start);
        if skip < c.text.len() {
            out.push_str(&c.text[skip..]);
        }
        covered = covered.max(c.char_span.end);
    }
    out
}

/// Deterministic chunk id for a position within a document.
pub fn chunk_id(document_id: &str, position: usize) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}#{}", document_id, position).as_bytes(),
    )
    .to_string()
}

fn heading_pieces(text: &str, max_chars: usize, overlap_chars: usize, min_chars: usize) -> Vec<Piece> {
    let sections = split_sections(text);
    if sections.len() == 1 && sections[0].heading_path.is_empty() {
        return fixed_windows(text, 0..text.len(), max_chars, overlap_chars)
            .into_iter()
            .map(|span| Piece {
                span,
                heading_path: Vec::new(),
            })
            .collect();
    }

    // Merge tiny sections (e.g. a heading immediately followed by a
    // sub-heading) into the next one; a tiny last section joins the previous.
    let mut merged: Vec<Piece> = Vec::new();
    let mut pending_start: Option<usize> = None;
    let last = sections.len() - 1;
    for (i, sec) in sections.into_iter().enumerate() {
        let body = &text[sec.span.clone()];
        let tiny = body.trim().is_empty() || body.trim().len() < min_chars;
        if tiny && i < last {
            pending_start.get_or_insert(sec.span.start);
            continue;
        }
        if tiny && i == last {
            if let Some(prev) = merged.last_mut() {
                prev.span.end = sec.span.end;
                continue;
            }
        }
        let start = pending_start.take().unwrap_or(sec.span.start);
        merged.push(Piece {
            span: start..sec.span.end,
            heading_path: sec.heading_path,
        });
    }

    let mut pieces = Vec::new();
    for sec in merged {
        if sec.span.len() <= max_chars {
            pieces.push(sec);
        } else {
            for span in fixed_windows(text, sec.span.clone(), max_chars, overlap_chars) {
                pieces.push(Piece {
                    span,
                    heading_path: sec.heading_path.clone(),
                });
            }
        }
    }
    pieces
}

/// Split at markdown ATX headings (outside code fences). The preamble before
/// the first heading, if any, is its own section with an empty path.
fn split_sections(text: &str) -> Vec<Piece> {
    let mut sections = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut current_start = 0usize;
    let mut current_path: Vec<String> = Vec::new();
    let mut in_fence = false;
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let Some((level, title)) = parse_heading(line) else {
            continue;
        };

        if line_start > current_start {
            sections.push(Piece {
                span: current_start..line_start,
                heading_path: current_path.clone(),
            });
        }
        while stack.last().is_some_and(|(l, _)| *l >= level) {
            stack.pop();
        }
        stack.push((level, title));
        current_path = stack.iter().map(|(_, t)| t.clone()).collect();
        current_start = line_start;
    }

    if current_start < text.len() {
        sections.push(Piece {
            span: current_start..text.len(),
            heading_path: current_path,
        });
    }
    sections
}

fn parse_heading(line: &str) -> Option<(usize, String)> {
    let line = line.trim_end();
    let level = line.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.starts_with(' ') {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim();
    if title.is_empty() {
        return None;
    }
    Some((level, title.to_string()))
}

/// Sliding windows over `range`, preferring to cut at whitespace in the back
/// half of each window. Consecutive windows share up to `overlap_chars`.
fn fixed_windows(
    text: &str,
    range: Range<usize>,
    max_chars: usize,
    overlap_chars: usize,
) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let end = range.end;
    let mut start = range.start;

    while start < end {
        if end - start <= max_chars {
            spans.push(start..end);
            break;
        }

        let hard = snap_to_char_boundary(text, start + max_chars);
        let mut cut = hard;
        if let Some(pos) = text[start..hard].rfind([' ', '\n']) {
            if pos + 1 > (hard - start) / 2 {
                cut = start + pos + 1;
            }
        }
        if cut <= start {
            cut = next_char_boundary(text, start);
        }
        spans.push(start..cut);

        let next = snap_to_char_boundary(text, cut.saturating_sub(overlap_chars));
        start = if next > start { next } else { cut };
    }

    spans
}

/// Group whole sentences into spans of at most `max_chars`. A single sentence
/// over the limit is hard-split without overlap.
fn sentence_groups(text: &str, range: Range<usize>, max_chars: usize) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut group_start = range.start;
    let mut group_end = range.start;

    for sentence in split_sentences(text, range) {
        if sentence.end - group_start <= max_chars {
            group_end = sentence.end;
            continue;
        }
        if group_end > group_start {
            spans.push(group_start..group_end);
        }
        if sentence.len() > max_chars {
            spans.extend(fixed_windows(text, sentence.clone(), max_chars, 0));
            group_start = sentence.end;
            group_end = sentence.end;
        } else {
            group_start = sentence.start;
            group_end = sentence.end;
        }
    }
    if group_end > group_start {
        spans.push(group_start..group_end);
    }
    spans
}

/// Contiguous sentence spans; trailing whitespace stays with its sentence.
fn split_sentences(text: &str, range: Range<usize>) -> Vec<Range<usize>> {
    let slice = &text[range.clone()];
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut chars = slice.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let is_terminal = matches!(c, '.' | '!' | '?')
            && chars.peek().is_some_and(|(_, n)| n.is_whitespace());
        let is_paragraph = c == '\n' && chars.peek().is_some_and(|(_, n)| *n == '\n');
        if !(is_terminal || is_paragraph) {
            continue;
        }
        let mut end = i + c.len_utf8();
        while let Some(&(j, n)) = chars.peek() {
            if !n.is_whitespace() {
                break;
            }
            end = j + n.len_utf8();
            chars.next();
        }
        spans.push(range.start + start..range.start + end);
        start = end;
    }
    if start < slice.len() {
        spans.push(range.start + start..range.end);
    }
    spans
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

fn next_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index + 1;
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i.min(s.len())
}

fn make_chunk(document_id: &str, position: usize, text: &str, piece: Piece) -> Chunk {
    let slice = &text[piece.span.clone()];
    let hash = text_hash(slice);

    Chunk {
        id: chunk_id(document_id, position),
        document_id: document_id.to_string(),
        text: slice.to_string(),
        heading_path: piece.heading_path,
        position,
        char_span: piece.span,
        hash,
    }
}

fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
