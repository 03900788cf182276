//! In-memory [`VectorIndex`] for tests and ephemeral runs.
//!
//! All state sits behind one `std::sync::RwLock`, so a document replace is
//! a single critical section. Vector queries are brute-force; keyword
//! lookups score chunks by how many query terms their text contains.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::{query_terms, DistanceMetric, IndexFilter, IndexStats, StoredChunk, VectorIndex};
use crate::models::{Chunk, Document, IndexEntry};

#[derive(Default)]
struct Inner {
    docs: HashMap<String, Document>,
    chunks: HashMap<String, Chunk>,
    /// `(chunk_id, model_version) -> vector`
    vectors: HashMap<(String, String), Vec<f32>>,
}

impl Inner {
    fn purge_chunk(&mut self, chunk_id: &str) -> bool {
        self.vectors.retain(|(id, _), _| id != chunk_id);
        self.chunks.remove(chunk_id).is_some()
    }

    fn purge_document_chunks(&mut self, document_id: &str) -> usize {
        let ids: Vec<String> = self
            .chunks
            .values()
            .filter(|c| c.document_id == document_id)
            .map(|c| c.id.clone())
            .collect();
        for id in &ids {
            self.purge_chunk(id);
        }
        ids.len()
    }

    /// Dimensionality of `model` among the stored vectors, ignoring those
    /// owned by `except_document`.
    fn model_dims(&self, model: &str, except_document: Option<&str>) -> Option<usize> {
        self.vectors
            .iter()
            .find(|((chunk_id, m), _)| {
                m == model
                    && except_document.map_or(true, |doc| {
                        self.chunks
                            .get(chunk_id)
                            .map_or(true, |c| c.document_id != doc)
                    })
            })
            .map(|(_, v)| v.len())
    }

    fn check_dims(&self, entries: &[IndexEntry], except_document: Option<&str>) -> Result<()> {
        let mut batch: HashMap<&str, usize> = HashMap::new();
        for e in entries.iter().filter_map(|e| e.embedding.as_ref()) {
            let expected = batch
                .get(e.model_version.as_str())
                .copied()
                .or_else(|| self.model_dims(&e.model_version, except_document));
            if let Some(dims) = expected {
                if dims != e.vector.len() {
                    bail!(
                        "dimension mismatch for model {}: index has {}, got {}",
                        e.model_version,
                        dims,
                        e.vector.len()
                    );
                }
            }
            batch.entry(e.model_version.as_str()).or_insert(e.vector.len());
        }
        Ok(())
    }

    fn write_entry(&mut self, entry: &IndexEntry) {
        self.chunks
            .insert(entry.chunk.id.clone(), entry.chunk.clone());
        if let Some(e) = &entry.embedding {
            self.vectors.insert(
                (entry.chunk.id.clone(), e.model_version.clone()),
                e.vector.clone(),
            );
        }
    }
}

pub struct MemoryIndex {
    inner: RwLock<Inner>,
    metric: DistanceMetric,
}

impl MemoryIndex {
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            metric,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new(DistanceMetric::default())
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(&self, document: &Document, entry: &IndexEntry) -> Result<()> {
        let mut inner = self.write();
        inner.check_dims(std::slice::from_ref(entry), None)?;
        inner.docs.insert(document.id.clone(), document.clone());
        inner.purge_chunk(&entry.chunk.id);
        inner.write_entry(entry);
        Ok(())
    }

    async fn delete(&self, chunk_id: &str) -> Result<()> {
        self.write().purge_chunk(chunk_id);
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let mut inner = self.write();
        let removed = inner.purge_document_chunks(document_id);
        inner.docs.remove(document_id);
        Ok(removed)
    }

    async fn replace_document(&self, document: &Document, entries: &[IndexEntry]) -> Result<()> {
        let mut inner = self.write();
        inner.check_dims(entries, Some(&document.id))?;
        inner.docs.insert(document.id.clone(), document.clone());
        inner.purge_document_chunks(&document.id);
        for entry in entries {
            inner.write_entry(entry);
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<(String, f64)>> {
        let inner = self.read();
        let tag = filter.tag.as_ref().map(|t| t.to_lowercase());

        let mut hits: Vec<(String, f64)> = inner
            .vectors
            .iter()
            .filter(|((_, model), v)| {
                v.len() == vector.len()
                    && filter.model_version.as_ref().map_or(true, |m| m == model)
            })
            .filter_map(|((chunk_id, _), v)| {
                let chunk = inner.chunks.get(chunk_id)?;
                if let Some(doc_id) = &filter.document_id {
                    if &chunk.document_id != doc_id {
                        return None;
                    }
                }
                if let Some(tag) = &tag {
                    let doc = inner.docs.get(&chunk.document_id)?;
                    if !doc.tags.contains(tag) {
                        return None;
                    }
                }
                Some((chunk_id.clone(), self.metric.distance(vector, v)))
            })
            .collect();

        hits.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn keyword_lookup(&self, terms: &[String], limit: usize) -> Result<Vec<String>> {
        let terms: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.read();

        let mut scored: Vec<(usize, &Chunk)> = inner
            .chunks
            .values()
            .filter_map(|c| {
                let tokens = query_terms(&c.text);
                let matches = terms.iter().filter(|t| tokens.contains(t)).count();
                (matches > 0).then_some((matches, c))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        scored.truncate(limit);
        Ok(scored.into_iter().map(|(_, c)| c.id.clone()).collect())
    }

    async fn tag_lookup(&self, tags: &[String], limit: usize) -> Result<Vec<String>> {
        let tags: Vec<String> = tags.iter().map(|t| t.to_lowercase()).collect();
        let inner = self.read();

        let mut scored: Vec<(usize, &Chunk)> = inner
            .chunks
            .values()
            .filter_map(|c| {
                let doc = inner.docs.get(&c.document_id)?;
                let matches = tags.iter().filter(|t| doc.tags.contains(t)).count();
                (matches > 0).then_some((matches, c))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| a.1.document_id.cmp(&b.1.document_id))
                .then_with(|| a.1.position.cmp(&b.1.position))
        });
        scored.truncate(limit);
        Ok(scored.into_iter().map(|(_, c)| c.id.clone()).collect())
    }

    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<StoredChunk>> {
        let inner = self.read();
        Ok(chunk_ids
            .iter()
            .filter_map(|id| {
                let chunk = inner.chunks.get(id)?;
                let document = inner.docs.get(&chunk.document_id)?;
                Some(StoredChunk {
                    chunk: chunk.clone(),
                    document: document.clone(),
                })
            })
            .collect())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        Ok(self.read().docs.get(document_id).cloned())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let inner = self.read();
        let mut per_model: HashMap<&str, usize> = HashMap::new();
        for (_, model) in inner.vectors.keys() {
            *per_model.entry(model.as_str()).or_default() += 1;
        }
        let dominant = per_model
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(m, _)| m.to_string());

        Ok(IndexStats {
            documents: inner.docs.len(),
            count: inner.chunks.len(),
            vectors: inner.vectors.len(),
            dimensions: dominant.as_deref().and_then(|m| inner.model_dims(m, None)),
            model_version: dominant,
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}

    fn metric(&self) -> DistanceMetric {
        self.metric
    }
}
