//! Cached, batched embedding generation.
//!
//! [`EmbeddingGenerator`] sits between the pipeline and an
//! [`EmbeddingProvider`]. For every call it:
//!
//! 1. Consults the [`EmbeddingCache`] keyed by `hash(text) + model_version`.
//! 2. Groups the misses into batches of `embedding.batch_size`.
//! 3. Sends batches to the provider with bounded concurrency and a
//!    per-batch timeout.
//! 4. On a failed batch, splits it in halves and retries each half once.
//!    Texts that still fail come back as `None` and are logged.
//!
//! A failed text never fails the whole call.

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheStats, EmbeddingCache};
use crate::config::{CacheConfig, EmbeddingConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::PipelineError;

pub struct EmbeddingGenerator {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Mutex<EmbeddingCache>,
    batch_size: usize,
    concurrency: usize,
    batch_timeout: Duration,
    embedded: AtomicU64,
    failed: AtomicU64,
}

impl EmbeddingGenerator {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        embedding: &EmbeddingConfig,
        cache: &CacheConfig,
    ) -> Self {
        Self {
            provider,
            cache: Mutex::new(EmbeddingCache::new(
                cache.capacity,
                Duration::from_secs(cache.ttl_secs),
            )),
            batch_size: embedding.batch_size.max(1),
            concurrency: embedding.concurrency.max(1),
            batch_timeout: Duration::from_secs(embedding.timeout_secs.max(1)),
            embedded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn model_version(&self) -> &str {
        self.provider.model_name()
    }

    /// Texts actually sent to the provider since startup.
    pub fn embedded_count(&self) -> u64 {
        self.embedded.load(Ordering::Relaxed)
    }

    /// Texts that could not be embedded since startup.
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.lock_cache().stats()
    }

    pub fn cache_hit_rate(&self) -> f64 {
        self.cache_stats().hit_rate()
    }

    /// Embed `texts`, returning one slot per input in input order.
    ///
    /// `None` marks a text whose embedding failed after the split retry.
    pub async fn embed(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        self.embed_counted(texts).await.0
    }

    /// Like [`embed`](Self::embed), also returning how many distinct texts
    /// missed the cache and went to the provider.
    pub async fn embed_counted(&self, texts: &[String]) -> (Vec<Option<Vec<f32>>>, usize) {
        let model = self.model_version().to_string();
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        // Unique missing texts, each mapped to every position it occupies.
        let mut pending: Vec<String> = Vec::new();
        let mut positions: HashMap<String, Vec<usize>> = HashMap::new();
        {
            let mut cache = self.lock_cache();
            for (i, text) in texts.iter().enumerate() {
                if let Some(slots) = positions.get_mut(text) {
                    slots.push(i);
                    continue;
                }
                match cache.get(&CacheKey::new(text, &model)) {
                    Some(v) => results[i] = Some(v),
                    None => {
                        positions.insert(text.clone(), vec![i]);
                        pending.push(text.clone());
                    }
                }
            }
        }

        if pending.is_empty() {
            return (results, 0);
        }
        let computed = pending.len();

        let batches: Vec<Vec<String>> = pending
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect();
        debug!(
            texts = pending.len(),
            batches = batches.len(),
            model = %model,
            "embedding cache misses"
        );

        let outcomes: Vec<Vec<(String, Option<Vec<f32>>)>> = stream::iter(batches)
            .map(|batch| self.embed_with_split(batch))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut cache = self.lock_cache();
        for (text, vector) in outcomes.into_iter().flatten() {
            let Some(slots) = positions.get(&text) else {
                continue;
            };
            match vector {
                Some(v) => {
                    cache.insert(CacheKey::new(&text, &model), v.clone());
                    for &i in slots {
                        results[i] = Some(v.clone());
                    }
                }
                None => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        (results, computed)
    }

    /// Embed a single query string.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        let mut out = self.embed(&[text.to_string()]).await;
        out.pop()
            .flatten()
            .ok_or_else(|| PipelineError::EmbeddingFailure("query embedding failed".to_string()))
    }

    async fn embed_with_split(&self, batch: Vec<String>) -> Vec<(String, Option<Vec<f32>>)> {
        match self.call(&batch).await {
            Ok(vectors) => return batch.into_iter().zip(vectors.into_iter().map(Some)).collect(),
            Err(e) => warn!(
                size = batch.len(),
                error = %e,
                "embedding batch failed, retrying in smaller batches"
            ),
        }

        let mid = batch.len().div_ceil(2);
        let halves: Vec<Vec<String>> = if batch.len() > 1 {
            vec![batch[..mid].to_vec(), batch[mid..].to_vec()]
        } else {
            vec![batch]
        };

        let mut out = Vec::new();
        for half in halves {
            match self.call(&half).await {
                Ok(vectors) => out.extend(half.into_iter().zip(vectors.into_iter().map(Some))),
                Err(e) => {
                    warn!(size = half.len(), error = %e, "embedding retry failed, excluding texts");
                    out.extend(half.into_iter().map(|t| (t, None)));
                }
            }
        }
        out
    }

    async fn call(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        self.embedded.fetch_add(batch.len() as u64, Ordering::Relaxed);

        let vectors = tokio::time::timeout(self.batch_timeout, self.provider.embed(batch))
            .await
            .map_err(|_| {
                PipelineError::EmbeddingFailure(format!(
                    "batch timed out after {}s",
                    self.batch_timeout.as_secs()
                ))
            })?
            .map_err(|e| PipelineError::EmbeddingFailure(e.to_string()))?;

        if vectors.len() != batch.len() {
            return Err(PipelineError::EmbeddingFailure(format!(
                "expected {} vectors, got {}",
                batch.len(),
                vectors.len()
            )));
        }
        let dims = self.provider.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(PipelineError::EmbeddingFailure(format!(
                "dimension mismatch: expected {}, got {}",
                dims,
                bad.len()
            )));
        }
        Ok(vectors)
    }

    fn lock_cache(&self) -> MutexGuard<'_, EmbeddingCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
