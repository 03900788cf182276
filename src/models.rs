//! Core data models used throughout vault-search.
//!
//! These types represent the notes, chunks, vectors, and search results that
//! flow through the indexing and retrieval pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ErrorKind;

/// One entry of the vault listing.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DocumentListing {
    pub path: String,
    pub modified_at: DateTime<Utc>,
}

/// Raw note body and whatever metadata the source attached to it.
#[derive(Debug, Clone, Default)]
pub struct FetchedDocument {
    pub content: String,
    pub metadata: serde_json::Value,
}

/// An ingested note. Replaced wholesale when its content hash changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub source_path: String,
    pub title: String,
    pub raw_content_hash: String,
    pub tags: Vec<String>,
    pub last_modified: DateTime<Utc>,
}

impl Document {
    /// Stable id for a vault path, identical across runs and machines.
    pub fn id_for_path(path: &str) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("vault:{}", path).as_bytes()).to_string()
    }
}

/// SHA-256 hex digest of raw note content.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A retrieval-sized passage of a document.
///
/// `text` is always the exact slice `content[char_span]` of the note body,
/// so chunks can be stitched back into the original.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub text: String,
    pub heading_path: Vec<String>,
    pub position: usize,
    pub char_span: Range<usize>,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// A vector for one chunk under one model version.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub model_version: String,
}

/// What the vector index persists per chunk.
///
/// `embedding` is `None` only when embeddings are disabled; such chunks are
/// reachable through keyword and tag lookups only.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub embedding: Option<Embedding>,
}

/// Which retrieval channel contributed to a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchedVia {
    Semantic,
    Keyword,
    Tag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Semantic,
    Keyword,
    Tag,
    #[default]
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(SearchMode::Semantic),
            "keyword" => Ok(SearchMode::Keyword),
            "tag" => Ok(SearchMode::Tag),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => anyhow::bail!(
                "Unknown search mode: {}. Use semantic, keyword, tag, or hybrid.",
                other
            ),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchMode::Semantic => "semantic",
            SearchMode::Keyword => "keyword",
            SearchMode::Tag => "tag",
            SearchMode::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

/// Per-channel normalized scores behind a fused result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub semantic: f64,
    pub keyword: f64,
    pub tag: f64,
}

/// A ranked passage produced per query. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub document_id: String,
    pub source_path: String,
    pub title: String,
    pub score: f64,
    pub matched_via: Vec<MatchedVia>,
    pub snippet: String,
    pub heading_path: Vec<String>,
    pub last_modified: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<ScoreBreakdown>,
    /// Full chunk text, used for context assembly.
    #[serde(skip)]
    pub text: String,
}

/// A document that could not be indexed this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentFailure {
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one indexing cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexSummary {
    /// Documents present in the source listing.
    pub total: usize,
    /// New or changed documents that were (re)indexed.
    pub processed: usize,
    /// Unchanged documents left untouched.
    pub skipped: usize,
    /// Documents that failed and will be retried next cycle.
    pub failed: usize,
    /// Documents removed because they vanished from the source.
    pub deleted: usize,
    /// Chunks excluded because their embedding could not be computed.
    pub chunks_failed: usize,
    /// Texts actually sent to the embedding backend.
    pub embedded: usize,
    pub cancelled: bool,
    pub failures: Vec<DocumentFailure>,
}
