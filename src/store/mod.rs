//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the persistence seam of the pipeline: the
//! indexer writes through it and the hybrid search engine reads through it.
//! Two backends ship with the crate:
//!
//! - [`SqliteIndex`]: on-disk index (chunks, vectors as BLOBs, FTS5 keyword
//!   table, tag table). Vector queries are brute-force over the rows that
//!   pass the SQL-level filter.
//! - [`MemoryIndex`]: `RwLock`-guarded maps for tests and ephemeral runs.
//!
//! # Consistency
//!
//! [`replace_document`](VectorIndex::replace_document) swaps a document and
//! all of its chunks in one step. Readers observe either the old or the new
//! chunk set, never a mix. Vectors are keyed by `(chunk_id, model_version)`
//! and a model version's dimensionality is fixed once its first vector is
//! written.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryIndex;
pub use sqlite::SqliteIndex;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{Chunk, Document, IndexEntry};

/// How vectors are compared. Every metric is reported as a distance where
/// lower means closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Dot,
    Euclidean,
}

impl DistanceMetric {
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        if a.len() != b.len() || a.is_empty() {
            return f64::INFINITY;
        }
        match self {
            DistanceMetric::Cosine => 1.0 - cosine(a, b),
            DistanceMetric::Dot => -dot(a, b),
            DistanceMetric::Euclidean => a
                .iter()
                .zip(b)
                .map(|(x, y)| {
                    let d = f64::from(*x) - f64::from(*y);
                    d * d
                })
                .sum::<f64>()
                .sqrt(),
        }
    }

    /// Map a distance back to a similarity where higher means closer.
    pub fn similarity(&self, distance: f64) -> f64 {
        match self {
            DistanceMetric::Cosine => 1.0 - distance,
            DistanceMetric::Dot => -distance,
            DistanceMetric::Euclidean => 1.0 / (1.0 + distance),
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Dot => "dot",
            DistanceMetric::Euclidean => "euclidean",
        })
    }
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum()
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let mag_a = dot(a, a).sqrt();
    let mag_b = dot(b, b).sqrt();
    if mag_a < f64::EPSILON || mag_b < f64::EPSILON {
        0.0
    } else {
        dot(a, b) / (mag_a * mag_b)
    }
}

/// Restricts a vector query before any distance is computed.
#[derive(Debug, Clone, Default)]
pub struct IndexFilter {
    /// Only vectors written under this model version.
    pub model_version: Option<String>,
    /// Only chunks whose document carries this tag.
    pub tag: Option<String>,
    /// Only chunks of this document.
    pub document_id: Option<String>,
}

impl IndexFilter {
    pub fn for_model(model_version: &str) -> Self {
        Self {
            model_version: Some(model_version.to_string()),
            ..Self::default()
        }
    }
}

/// A chunk joined with its owning document, as read back for ranking.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub chunk: Chunk,
    pub document: Document,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    /// Number of stored chunks (the index size).
    pub count: usize,
    /// Chunks that carry a vector.
    pub vectors: usize,
    /// Dimensionality of the dominant model version, if any vectors exist.
    pub dimensions: Option<usize>,
    pub model_version: Option<String>,
}

/// Persistent store of chunk vectors plus document metadata.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace one chunk and its vector. Idempotent on `chunk_id`.
    /// The owning document row is upserted alongside.
    async fn upsert(&self, document: &Document, entry: &IndexEntry) -> Result<()>;

    /// Remove one chunk and every vector stored for it.
    async fn delete(&self, chunk_id: &str) -> Result<()>;

    /// Remove a document and all of its chunks. Returns the chunk count removed.
    async fn delete_document(&self, document_id: &str) -> Result<usize>;

    /// Atomically purge a document's chunks and write the new set.
    async fn replace_document(&self, document: &Document, entries: &[IndexEntry]) -> Result<()>;

    /// Nearest chunks to `vector`, ascending by distance.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<(String, f64)>>;

    /// Chunk ids whose text contains any of `terms`, best matches first.
    async fn keyword_lookup(&self, terms: &[String], limit: usize) -> Result<Vec<String>>;

    /// Chunk ids whose document carries any of `tags`.
    async fn tag_lookup(&self, tags: &[String], limit: usize) -> Result<Vec<String>>;

    /// Load chunks with document metadata. Unknown ids are skipped.
    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<StoredChunk>>;

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>>;

    async fn stats(&self) -> Result<IndexStats>;

    /// Cheap liveness check. An error means the storage layer is unreachable.
    async fn ping(&self) -> Result<()>;

    async fn close(&self);

    fn metric(&self) -> DistanceMetric;
}

/// Split free text into lower-cased alphanumeric tokens, keeping repeats.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Distinct search terms of a query, in first-seen order.
pub fn query_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for t in tokenize(text) {
        if !terms.contains(&t) {
            terms.push(t);
        }
    }
    terms
}
