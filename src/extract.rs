//! Note metadata extraction.
//!
//! Pulls a title and tag set out of a markdown note before it is chunked:
//!
//! - **Frontmatter**: a leading `---` block with `title:` and `tags:`
//!   (inline list `[a, b]`, comma list, or dash list).
//! - **Source metadata**: `title` / `tags` attached by the content source.
//! - **Inline tags**: `#topic` tokens outside code fences.
//!
//! Title resolution order: frontmatter, source metadata, first `# ` heading,
//! file stem. Tags are lower-cased and deduplicated in first-seen order.

use std::path::Path;

use crate::error::PipelineError;

/// Metadata extracted from a note.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NoteMetadata {
    pub title: String,
    pub tags: Vec<String>,
    /// Byte offset where the body starts (after any frontmatter block).
    pub body_start: usize,
}

/// Parse a note's frontmatter, title, and tags.
///
/// Returns [`PipelineError::MalformedContent`] when a frontmatter block is
/// opened but never closed.
pub fn parse_note(
    path: &str,
    content: &str,
    source_metadata: &serde_json::Value,
) -> Result<NoteMetadata, PipelineError> {
    let (frontmatter, body_start) = split_frontmatter(path, content)?;

    let mut tags = Vec::new();
    let mut fm_title = None;
    if let Some(fm) = frontmatter {
        let parsed = parse_frontmatter(fm);
        fm_title = parsed.0;
        tags.extend(parsed.1);
    }

    let meta_title = source_metadata
        .get("title")
        .and_then(|t| t.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(arr) = source_metadata.get("tags").and_then(|t| t.as_array()) {
        tags.extend(arr.iter().filter_map(|t| t.as_str()).map(str::to_string));
    }

    let body = &content[body_start..];
    tags.extend(extract_inline_tags(body));

    let title = fm_title
        .or(meta_title)
        .or_else(|| first_heading(body))
        .unwrap_or_else(|| file_stem(path));

    Ok(NoteMetadata {
        title,
        tags: normalize_tags(tags),
        body_start,
    })
}

/// Collect `#tag` tokens from free text, skipping fenced code blocks.
///
/// A tag starts at `#` preceded by whitespace (or start of line), continues
/// over `[A-Za-z0-9_/-]`, and must contain at least one non-digit.
pub fn extract_inline_tags(text: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut in_fence = false;

    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        let mut prev_is_space = true;
        let mut chars = line.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '#' && prev_is_space {
                let rest = &line[i + 1..];
                let len = rest
                    .find(|ch: char| !(ch.is_alphanumeric() || ch == '_' || ch == '-' || ch == '/'))
                    .unwrap_or(rest.len());
                let tag = &rest[..len];
                if !tag.is_empty() && tag.chars().any(|ch| !ch.is_ascii_digit()) {
                    tags.push(tag.to_string());
                }
                for _ in 0..tag.chars().count() {
                    chars.next();
                }
                prev_is_space = false;
                continue;
            }
            prev_is_space = c.is_whitespace();
        }
    }

    tags
}

/// Lower-case, strip leading `#`, and dedupe while keeping first-seen order.
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let t = tag.trim().trim_start_matches('#').to_lowercase();
        if !t.is_empty() && !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

fn split_frontmatter<'a>(
    path: &str,
    content: &'a str,
) -> Result<(Option<&'a str>, usize), PipelineError> {
    let first_line_end = content.find('\n').unwrap_or(content.len());
    if content[..first_line_end].trim_end() != "---" {
        return Ok((None, 0));
    }

    let mut offset = (first_line_end + 1).min(content.len());
    let fm_start = offset;
    while offset < content.len() {
        let line_end = content[offset..]
            .find('\n')
            .map(|i| offset + i)
            .unwrap_or(content.len());
        let line = content[offset..line_end].trim_end();
        if line == "---" || line == "..." {
            let body_start = (line_end + 1).min(content.len());
            return Ok((Some(&content[fm_start..offset]), body_start));
        }
        offset = line_end + 1;
    }

    Err(PipelineError::MalformedContent {
        path: path.to_string(),
        reason: "frontmatter block is not terminated".to_string(),
    })
}

fn parse_frontmatter(fm: &str) -> (Option<String>, Vec<String>) {
    let mut title = None;
    let mut tags = Vec::new();
    let mut in_tag_list = false;

    for line in fm.lines() {
        let trimmed = line.trim();
        if in_tag_list {
            if let Some(item) = trimmed.strip_prefix("- ") {
                tags.push(unquote(item).to_string());
                continue;
            }
            in_tag_list = false;
        }

        if let Some(value) = trimmed.strip_prefix("title:") {
            let v = unquote(value.trim());
            if !v.is_empty() {
                title = Some(v.to_string());
            }
        } else if let Some(value) = trimmed.strip_prefix("tags:") {
            let value = value.trim();
            if value.is_empty() {
                in_tag_list = true;
            } else {
                let inner = value.trim_start_matches('[').trim_end_matches(']');
                tags.extend(
                    inner
                        .split(',')
                        .map(|t| unquote(t.trim()).to_string())
                        .filter(|t| !t.is_empty()),
                );
            }
        }
    }

    (title, tags)
}

fn unquote(s: &str) -> &str {
    s.trim_matches(|c| c == '"' || c == '\'')
}

fn first_heading(body: &str) -> Option<String> {
    body.lines()
        .find_map(|l| l.strip_prefix("# "))
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

fn file_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}
