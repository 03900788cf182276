//! Incremental indexing cycle.
//!
//! Each cycle lists the vault, hashes every listed note, and compares the
//! hash against the persisted [`StateStore`]:
//!
//! | State | Action |
//! |-------|--------|
//! | unchanged | skipped, nothing is re-embedded |
//! | changed / new | re-chunked, re-embedded, atomically replaced in the index |
//! | deleted | all chunks purged, state entry removed |
//!
//! Documents are processed in batches (default 100). Inside a batch, up to
//! `indexer.concurrency` documents are fetched and processed at once.
//! Failures are isolated per document and reported in the
//! [`IndexSummary`]. Only a storage layer that stops answering aborts the
//! cycle, as [`PipelineError::CycleAborted`] carrying the partial summary.
//!
//! Work on a single document is serialized by a per-document lock, so two
//! overlapping updates of the same note never interleave their delete and
//! insert steps. Cancellation is checked between batches.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::chunk::{chunk_note, ChunkingOptions};
use crate::config::Config;
use crate::embedder::EmbeddingGenerator;
use crate::error::PipelineError;
use crate::extract::parse_note;
use crate::models::{
    content_hash, Document, DocumentFailure, DocumentListing, Embedding, IndexEntry, IndexSummary,
};
use crate::source::ContentSource;
use crate::state::{DocumentState, StateStore};
use crate::store::VectorIndex;

/// Cooperative cancellation flag, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct IndexerOptions {
    pub batch_size: usize,
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub chunking: ChunkingOptions,
    /// When false, chunks are stored without vectors.
    pub embeddings_enabled: bool,
}

impl IndexerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.indexer.batch_size.max(1),
            concurrency: config.indexer.concurrency.max(1),
            fetch_timeout: Duration::from_secs(config.indexer.fetch_timeout_secs.max(1)),
            chunking: ChunkingOptions::from(&config.chunking),
            embeddings_enabled: config.embedding.is_enabled(),
        }
    }
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 8,
            fetch_timeout: Duration::from_secs(30),
            chunking: ChunkingOptions::default(),
            embeddings_enabled: true,
        }
    }
}

/// Per-document async locks, created on first use.
#[derive(Default)]
struct DocumentLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DocumentLocks {
    fn get(&self, document_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop lock entries nobody is holding or waiting on.
    fn prune(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, l| Arc::strong_count(l) > 1);
    }
}

enum Outcome {
    Skipped,
    Processed { chunks_failed: usize, embedded: usize },
    Failed(DocumentFailure),
}

pub struct Indexer {
    source: Arc<dyn ContentSource>,
    index: Arc<dyn VectorIndex>,
    state: Arc<dyn StateStore>,
    embedder: Arc<EmbeddingGenerator>,
    options: IndexerOptions,
    locks: DocumentLocks,
}

impl Indexer {
    pub fn new(
        source: Arc<dyn ContentSource>,
        index: Arc<dyn VectorIndex>,
        state: Arc<dyn StateStore>,
        embedder: Arc<EmbeddingGenerator>,
        options: IndexerOptions,
    ) -> Self {
        Self {
            source,
            index,
            state,
            embedder,
            options,
            locks: DocumentLocks::default(),
        }
    }

    /// Run one indexing cycle. With `force`, every listed document is
    /// treated as changed.
    pub async fn run_cycle(
        &self,
        force: bool,
        cancel: &CancelFlag,
    ) -> Result<IndexSummary, PipelineError> {
        let started = Instant::now();
        let mut summary = IndexSummary::default();

        if let Err(e) = self.index.ping().await {
            return Err(abort(format!("index unreachable: {:#}", e), summary));
        }

        let mut listings = match self.source.list_documents().await {
            Ok(l) => l,
            Err(e) => return Err(abort(format!("listing failed: {}", e), summary)),
        };
        let mut seen_paths = HashSet::new();
        listings.retain(|l| seen_paths.insert(l.path.clone()));
        summary.total = listings.len();

        let previous: HashMap<String, DocumentState> = match self.state.all().await {
            Ok(all) => all.into_iter().map(|s| (s.document_id.clone(), s)).collect(),
            Err(e) => return Err(abort(format!("state store unreachable: {:#}", e), summary)),
        };

        info!(
            source = self.source.name(),
            listed = listings.len(),
            known = previous.len(),
            force,
            "indexing cycle started"
        );

        let batch_count = listings.len().div_ceil(self.options.batch_size);
        for (n, batch) in listings.chunks(self.options.batch_size).enumerate() {
            if cancel.is_cancelled() {
                info!(batch = n, "indexing cycle cancelled");
                summary.cancelled = true;
                break;
            }

            let pending: Vec<BoxFuture<'_, Outcome>> = batch
                .iter()
                .map(|listing| {
                    let prev = previous.get(&Document::id_for_path(&listing.path));
                    self.process_document(listing, prev, force).boxed()
                })
                .collect();
            let outcomes: Vec<Outcome> = stream::iter(pending)
                .buffer_unordered(self.options.concurrency)
                .collect()
                .await;

            let mut write_failures = 0;
            for outcome in outcomes {
                match outcome {
                    Outcome::Skipped => summary.skipped += 1,
                    Outcome::Processed {
                        chunks_failed,
                        embedded,
                    } => {
                        summary.processed += 1;
                        summary.chunks_failed += chunks_failed;
                        summary.embedded += embedded;
                    }
                    Outcome::Failed(f) => {
                        if f.kind == crate::error::ErrorKind::IndexWriteFailure {
                            write_failures += 1;
                        }
                        summary.failed += 1;
                        summary.failures.push(f);
                    }
                }
            }
            self.locks.prune();

            debug!(
                batch = n + 1,
                of = batch_count,
                processed = summary.processed,
                skipped = summary.skipped,
                failed = summary.failed,
                "batch done"
            );

            if write_failures > 0 {
                if let Err(e) = self.index.ping().await {
                    return Err(abort(format!("index unreachable: {:#}", e), summary));
                }
            }
        }

        if !summary.cancelled {
            let listed: HashSet<String> = listings
                .iter()
                .map(|l| Document::id_for_path(&l.path))
                .collect();
            for (id, prev) in &previous {
                if listed.contains(id) {
                    continue;
                }
                match self.remove_document(prev).await {
                    Ok(()) => summary.deleted += 1,
                    Err(e) => {
                        warn!(path = %prev.source_path, error = %e, "failed to remove deleted document");
                        summary.failed += 1;
                        summary.failures.push(DocumentFailure {
                            path: prev.source_path.clone(),
                            kind: e.kind(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        info!(
            total = summary.total,
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            deleted = summary.deleted,
            embedded = summary.embedded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "indexing cycle finished"
        );

        Ok(summary)
    }

    async fn process_document(
        &self,
        listing: &DocumentListing,
        prev: Option<&DocumentState>,
        force: bool,
    ) -> Outcome {
        match self.update_document(listing, prev, force).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(path = %listing.path, error = %e, "document failed");
                Outcome::Failed(DocumentFailure {
                    path: listing.path.clone(),
                    kind: e.kind(),
                    message: e.to_string(),
                })
            }
        }
    }

    async fn update_document(
        &self,
        listing: &DocumentListing,
        prev: Option<&DocumentState>,
        force: bool,
    ) -> Result<Outcome, PipelineError> {
        let path = listing.path.as_str();
        let document_id = Document::id_for_path(path);
        let lock = self.locks.get(&document_id);
        let _guard = lock.lock().await;

        let fetched = tokio::time::timeout(self.options.fetch_timeout, self.source.get_document(path))
            .await
            .map_err(|_| {
                PipelineError::SourceUnavailable(format!(
                    "{} timed out after {}ms",
                    path,
                    self.options.fetch_timeout.as_millis()
                ))
            })??;

        let hash = content_hash(&fetched.content);
        if !force && prev.is_some_and(|p| p.content_hash == hash) {
            return Ok(Outcome::Skipped);
        }

        let meta = parse_note(path, &fetched.content, &fetched.metadata)?;
        let chunks = chunk_note(
            &document_id,
            &fetched.content,
            meta.body_start,
            &self.options.chunking,
        );

        let (entries, chunks_failed, embedded) = if self.options.embeddings_enabled {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let (vectors, embedded) = self.embedder.embed_counted(&texts).await;
            let model = self.embedder.model_version().to_string();

            let mut failed = 0;
            let mut entries = Vec::with_capacity(chunks.len());
            for (chunk, vector) in chunks.into_iter().zip(vectors) {
                match vector {
                    Some(vector) => entries.push(IndexEntry {
                        embedding: Some(Embedding {
                            chunk_id: chunk.id.clone(),
                            vector,
                            model_version: model.clone(),
                        }),
                        chunk,
                    }),
                    None => failed += 1,
                }
            }
            if failed > 0 {
                warn!(path, failed, "chunks excluded after embedding failure");
            }
            (entries, failed, embedded)
        } else {
            let entries = chunks
                .into_iter()
                .map(|chunk| IndexEntry {
                    chunk,
                    embedding: None,
                })
                .collect();
            (entries, 0, 0)
        };

        let document = Document {
            id: document_id.clone(),
            source_path: path.to_string(),
            title: meta.title,
            raw_content_hash: hash.clone(),
            tags: meta.tags,
            last_modified: listing.modified_at,
        };

        self.index
            .replace_document(&document, &entries)
            .await
            .map_err(|e| PipelineError::IndexWriteFailure(format!("{}: {:#}", path, e)))?;

        // A partially embedded document keeps its old hash so the missing
        // chunks are retried next cycle.
        if chunks_failed == 0 {
            self.state
                .put(&DocumentState {
                    document_id,
                    source_path: path.to_string(),
                    content_hash: hash,
                })
                .await
                .map_err(|e| PipelineError::IndexWriteFailure(format!("{}: {:#}", path, e)))?;
        }

        debug!(path, chunks = entries.len(), embedded, "document indexed");
        Ok(Outcome::Processed {
            chunks_failed,
            embedded,
        })
    }

    async fn remove_document(&self, prev: &DocumentState) -> Result<(), PipelineError> {
        let lock = self.locks.get(&prev.document_id);
        let _guard = lock.lock().await;

        let removed = self
            .index
            .delete_document(&prev.document_id)
            .await
            .map_err(|e| PipelineError::IndexWriteFailure(format!("{:#}", e)))?;
        self.state
            .remove(&prev.document_id)
            .await
            .map_err(|e| PipelineError::IndexWriteFailure(format!("{:#}", e)))?;

        info!(path = %prev.source_path, chunks = removed, "removed deleted document");
        Ok(())
    }
}

fn abort(reason: String, summary: IndexSummary) -> PipelineError {
    warn!(reason = %reason, "indexing cycle aborted");
    PipelineError::CycleAborted {
        reason,
        summary: Box::new(summary),
    }
}
