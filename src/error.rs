//! Pipeline error taxonomy.
//!
//! Per-document and per-chunk failures are classified into a
//! [`PipelineError`] so the indexer can isolate them and report them in the
//! cycle summary. Only [`PipelineError::CycleAborted`] ends a cycle early.

use serde::Serialize;
use thiserror::Error;

use crate::models::IndexSummary;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Vault fetch failed after retries; the document is retried next cycle.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The note could not be parsed; it is skipped without blocking others.
    #[error("malformed content in {path}: {reason}")]
    MalformedContent { path: String, reason: String },

    /// The embedding backend failed even after the smaller-batch retry.
    #[error("embedding failed: {0}")]
    EmbeddingFailure(String),

    /// The storage layer rejected a document update; prior state is kept.
    #[error("index write failed: {0}")]
    IndexWriteFailure(String),

    /// The answering model could not be reached.
    #[error("llm unavailable: {0}")]
    LlmUnavailable(String),

    /// A systemic failure stopped the cycle. Progress so far is preserved.
    #[error("indexing cycle aborted: {reason}")]
    CycleAborted {
        reason: String,
        summary: Box<IndexSummary>,
    },
}

impl PipelineError {
    /// Stable machine-readable kind, used in cycle summaries and HTTP errors.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            PipelineError::MalformedContent { .. } => ErrorKind::MalformedContent,
            PipelineError::EmbeddingFailure(_) => ErrorKind::EmbeddingFailure,
            PipelineError::IndexWriteFailure(_) => ErrorKind::IndexWriteFailure,
            PipelineError::LlmUnavailable(_) => ErrorKind::LlmUnavailable,
            PipelineError::CycleAborted { .. } => ErrorKind::CycleAborted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnavailable,
    MalformedContent,
    EmbeddingFailure,
    IndexWriteFailure,
    LlmUnavailable,
    CycleAborted,
}
