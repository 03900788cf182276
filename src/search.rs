//! Hybrid search: semantic, keyword, and tag channels fused into one ranking.
//!
//! # Pipeline (`hybrid` mode)
//!
//! 1. Embed the query and pull the `k * candidate_multiplier` nearest chunks.
//!    If the query carries `#tags`, a tag-filtered vector query runs too.
//! 2. Add chunks from the keyword index (FTS lookup) so exact identifiers the
//!    embedding misses still reach the pool, then BM25-score every pooled
//!    chunk against the query terms.
//! 3. Add chunks whose document carries a `#tag` from the query, scored by the
//!    fraction of query tags matched.
//! 4. Min-max normalize each channel to `[0, 1]` over the pool and combine
//!    with the configured weights (default 0.6 / 0.3 / 0.1).
//! 5. Sort by score, then more recent `last_modified`, then chunk id.
//! 6. Keep at most `passages_per_document` chunks per document, truncate to `k`.
//!
//! If the query embedding fails in `hybrid` mode, the search degrades to the
//! keyword and tag channels and logs a warning. In `semantic` mode the
//! failure is returned as [`crate::error::PipelineError::EmbeddingFailure`].

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedder::EmbeddingGenerator;
use crate::extract::{extract_inline_tags, normalize_tags};
use crate::models::{MatchedVia, ScoreBreakdown, SearchMode, SearchResult};
use crate::store::{query_terms, tokenize, IndexFilter, StoredChunk, VectorIndex};

const SNIPPET_CHARS: usize = 240;
const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// Per-channel fusion weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub semantic: f64,
    pub keyword: f64,
    pub tag: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            semantic: 0.6,
            keyword: 0.3,
            tag: 0.1,
        }
    }
}

impl FusionWeights {
    /// Weights actually applied for a mode. Single-channel modes use that
    /// channel alone.
    fn for_mode(&self, mode: SearchMode) -> Self {
        match mode {
            SearchMode::Hybrid => *self,
            SearchMode::Semantic => Self {
                semantic: 1.0,
                keyword: 0.0,
                tag: 0.0,
            },
            SearchMode::Keyword => Self {
                semantic: 0.0,
                keyword: 1.0,
                tag: 0.0,
            },
            SearchMode::Tag => Self {
                semantic: 0.0,
                keyword: 0.0,
                tag: 1.0,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub k: usize,
    pub mode: SearchMode,
    pub passages_per_document: usize,
    pub explain: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            k: 10,
            mode: SearchMode::Hybrid,
            passages_per_document: 1,
            explain: false,
        }
    }
}

/// Raw, un-normalized channel scores for one pooled chunk.
#[derive(Debug, Clone, Default)]
struct Candidate {
    semantic: Option<f64>,
    keyword: Option<f64>,
    tag: Option<f64>,
}

pub struct HybridSearchEngine {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<EmbeddingGenerator>,
    weights: FusionWeights,
    candidate_multiplier: usize,
}

impl HybridSearchEngine {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<EmbeddingGenerator>,
        retrieval: &RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            weights: FusionWeights {
                semantic: retrieval.semantic_weight,
                keyword: retrieval.keyword_weight,
                tag: retrieval.tag_weight,
            },
            candidate_multiplier: retrieval.candidate_multiplier.max(1),
        }
    }

    /// Rank chunks for `query`. Read-only against the index.
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() || opts.k == 0 {
            return Ok(Vec::new());
        }

        let pool_size = opts.k.saturating_mul(self.candidate_multiplier);
        let terms = query_terms(query);
        let mut tags = normalize_tags(extract_inline_tags(query));
        if opts.mode == SearchMode::Tag && tags.is_empty() {
            tags = terms.clone();
        }

        let use_semantic = matches!(opts.mode, SearchMode::Semantic | SearchMode::Hybrid);
        let use_keyword = matches!(opts.mode, SearchMode::Keyword | SearchMode::Hybrid);
        let use_tag = matches!(opts.mode, SearchMode::Tag | SearchMode::Hybrid) && !tags.is_empty();

        let mut pool: HashMap<String, Candidate> = HashMap::new();

        // 1. Semantic channel
        if use_semantic {
            match self.embedder.embed_query(query).await {
                Ok(vector) => {
                    self.semantic_candidates(&vector, pool_size, &tags, &mut pool)
                        .await?;
                }
                Err(e) if opts.mode == SearchMode::Hybrid => {
                    warn!(error = %e, "query embedding failed, falling back to keyword and tag search");
                }
                Err(e) => return Err(e.into()),
            }
        }

        // 2. Keyword lookup for terms the vectors may miss
        if use_keyword {
            for id in self.index.keyword_lookup(&terms, pool_size).await? {
                pool.entry(id).or_default();
            }
        }

        // 3. Tag lookup
        if use_tag {
            for id in self.index.tag_lookup(&tags, pool_size).await? {
                pool.entry(id).or_default();
            }
        }

        if pool.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = pool.keys().cloned().collect();
        let stored = self.index.get_chunks(&ids).await?;

        if use_keyword {
            for (id, score) in bm25_scores(&terms, &stored) {
                if let Some(c) = pool.get_mut(&id) {
                    c.keyword = Some(score);
                }
            }
        }
        if use_tag {
            for sc in &stored {
                let matched = tags.iter().filter(|t| sc.document.tags.contains(t)).count();
                if matched > 0 {
                    if let Some(c) = pool.get_mut(&sc.chunk.id) {
                        c.tag = Some(matched as f64 / tags.len() as f64);
                    }
                }
            }
        }

        let results = fuse(
            &pool,
            stored,
            self.weights.for_mode(opts.mode),
            opts,
        );
        debug!(
            query = %query,
            mode = %opts.mode,
            pool = pool.len(),
            results = results.len(),
            "search complete"
        );
        Ok(results)
    }

    async fn semantic_candidates(
        &self,
        vector: &[f32],
        limit: usize,
        tags: &[String],
        pool: &mut HashMap<String, Candidate>,
    ) -> Result<()> {
        let metric = self.index.metric();
        let model = self.embedder.model_version();

        let mut filters = vec![IndexFilter::for_model(model)];
        for tag in tags {
            filters.push(IndexFilter {
                tag: Some(tag.clone()),
                ..IndexFilter::for_model(model)
            });
        }

        for filter in &filters {
            for (id, distance) in self.index.query(vector, limit, filter).await? {
                let similarity = metric.similarity(distance);
                // Orthogonal or opposed vectors are not a semantic match.
                if similarity <= 0.0 {
                    continue;
                }
                pool.entry(id).or_default().semantic = Some(similarity);
            }
        }
        Ok(())
    }
}

/// Okapi BM25 over the candidate pool. The pool serves as the corpus for
/// document frequencies. Only chunks with a positive score are returned.
fn bm25_scores(terms: &[String], chunks: &[StoredChunk]) -> Vec<(String, f64)> {
    if terms.is_empty() || chunks.is_empty() {
        return Vec::new();
    }

    let docs: Vec<(&str, Vec<String>)> = chunks
        .iter()
        .map(|sc| {
            let mut tokens = tokenize(&sc.document.title);
            tokens.extend(tokenize(&sc.chunk.text));
            (sc.chunk.id.as_str(), tokens)
        })
        .collect();

    let n = docs.len() as f64;
    let avg_len = docs.iter().map(|(_, t)| t.len()).sum::<usize>() as f64 / n;
    let avg_len = avg_len.max(1.0);

    let idf: HashMap<&str, f64> = terms
        .iter()
        .map(|term| {
            let df = docs.iter().filter(|(_, t)| t.contains(term)).count() as f64;
            (term.as_str(), (1.0 + (n - df + 0.5) / (df + 0.5)).ln())
        })
        .collect();

    docs.iter()
        .filter_map(|(id, tokens)| {
            let len = tokens.len() as f64;
            let score: f64 = terms
                .iter()
                .map(|term| {
                    let tf = tokens.iter().filter(|t| *t == term).count() as f64;
                    if tf == 0.0 {
                        return 0.0;
                    }
                    let norm = tf * (BM25_K1 + 1.0)
                        / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg_len));
                    idf[term.as_str()] * norm
                })
                .sum();
            (score > 0.0).then(|| (id.to_string(), score))
        })
        .collect()
}

/// Min-max normalize scores to [0, 1]. A single score, or all-equal scores,
/// normalize to 1.0.
fn normalize_scores(scores: &[(String, f64)]) -> HashMap<String, f64> {
    if scores.is_empty() {
        return HashMap::new();
    }

    let s_min = scores.iter().map(|s| s.1).fold(f64::INFINITY, f64::min);
    let s_max = scores.iter().map(|s| s.1).fold(f64::NEG_INFINITY, f64::max);

    scores
        .iter()
        .map(|(id, raw)| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (raw - s_min) / (s_max - s_min)
            };
            (id.clone(), norm)
        })
        .collect()
}

fn fuse(
    pool: &HashMap<String, Candidate>,
    stored: Vec<StoredChunk>,
    weights: FusionWeights,
    opts: &SearchOptions,
) -> Vec<SearchResult> {
    let channel = |pick: fn(&Candidate) -> Option<f64>| -> HashMap<String, f64> {
        let raw: Vec<(String, f64)> = pool
            .iter()
            .filter_map(|(id, c)| pick(c).map(|s| (id.clone(), s)))
            .collect();
        normalize_scores(&raw)
    };
    let semantic = channel(|c| c.semantic);
    let keyword = channel(|c| c.keyword);
    let tag = channel(|c| c.tag);

    let mut results: Vec<SearchResult> = stored
        .into_iter()
        .filter_map(|sc| {
            let id = sc.chunk.id.as_str();
            let breakdown = ScoreBreakdown {
                semantic: semantic.get(id).copied().unwrap_or(0.0),
                keyword: keyword.get(id).copied().unwrap_or(0.0),
                tag: tag.get(id).copied().unwrap_or(0.0),
            };

            let mut matched_via = Vec::new();
            if weights.semantic > 0.0 && semantic.contains_key(id) {
                matched_via.push(MatchedVia::Semantic);
            }
            if weights.keyword > 0.0 && keyword.contains_key(id) {
                matched_via.push(MatchedVia::Keyword);
            }
            if weights.tag > 0.0 && tag.contains_key(id) {
                matched_via.push(MatchedVia::Tag);
            }
            if matched_via.is_empty() {
                return None;
            }

            let score = weights.semantic * breakdown.semantic
                + weights.keyword * breakdown.keyword
                + weights.tag * breakdown.tag;

            Some(SearchResult {
                chunk_id: sc.chunk.id.clone(),
                document_id: sc.document.id.clone(),
                source_path: sc.document.source_path.clone(),
                title: sc.document.title.clone(),
                score,
                matched_via,
                snippet: make_snippet(&sc.chunk.text),
                heading_path: sc.chunk.heading_path.clone(),
                last_modified: sc.document.last_modified,
                explain: opts.explain.then_some(breakdown),
                text: sc.chunk.text,
            })
        })
        .collect();

    // Sort: score desc, last_modified desc, chunk_id asc (deterministic)
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.last_modified.cmp(&a.last_modified))
            .then(a.chunk_id.cmp(&b.chunk_id))
    });

    let per_doc = opts.passages_per_document.max(1);
    let mut kept_per_doc: HashMap<String, usize> = HashMap::new();
    results.retain(|r| {
        let kept = kept_per_doc.entry(r.document_id.clone()).or_default();
        *kept += 1;
        *kept <= per_doc
    });

    results.truncate(opts.k);
    results
}

fn make_snippet(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= SNIPPET_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(SNIPPET_CHARS).collect();
        format!("{}...", cut.trim_end())
    }
}

// ============ Score normalization tests ============

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, Document};
    use chrono::{TimeZone, Utc};

    fn scores(items: &[(&str, f64)]) -> Vec<(String, f64)> {
        items.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    fn stored(id: &str, doc: &str, text: &str, ts: i64) -> StoredChunk {
        StoredChunk {
            chunk: Chunk {
                id: id.to_string(),
                document_id: doc.to_string(),
                text: text.to_string(),
                heading_path: Vec::new(),
                position: 0,
                char_span: 0..text.len(),
                hash: String::new(),
            },
            document: Document {
                id: doc.to_string(),
                source_path: format!("{}.md", doc),
                title: String::new(),
                raw_content_hash: String::new(),
                tags: Vec::new(),
                last_modified: Utc.timestamp_opt(ts, 0).unwrap(),
            },
        }
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_single() {
        let result = normalize_scores(&scores(&[("c1", 5.0)]));
        assert!((result["c1"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_range() {
        let result = normalize_scores(&scores(&[("c1", 10.0), ("c2", 5.0), ("c3", 0.0)]));
        assert!((result["c1"] - 1.0).abs() < 1e-9);
        assert!((result["c2"] - 0.5).abs() < 1e-9);
        assert!(result["c3"].abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        let result = normalize_scores(&scores(&[("c1", 3.0), ("c2", 3.0)]));
        for score in result.values() {
            assert!((*score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_scores_always_in_unit() {
        let result = normalize_scores(&scores(&[("c1", -5.0), ("c2", 100.0), ("c3", 42.0)]));
        for score in result.values() {
            assert!(
                *score >= 0.0 && *score <= 1.0,
                "Score out of range: {}",
                score
            );
        }
    }

    #[test]
    fn test_bm25_prefers_rarer_and_denser_matches() {
        let chunks = vec![
            stored("a", "d1", "tokio runtime tokio spawn", 0),
            stored("b", "d2", "the runtime of the garden", 0),
            stored("c", "d3", "unrelated words only", 0),
        ];
        let terms = vec!["tokio".to_string(), "runtime".to_string()];
        let scored: HashMap<String, f64> = bm25_scores(&terms, &chunks).into_iter().collect();
        assert!(scored["a"] > scored["b"]);
        assert!(!scored.contains_key("c"));
    }

    #[test]
    fn test_fuse_weights_ties_and_dedup() {
        let mut pool = HashMap::new();
        pool.insert(
            "a1".to_string(),
            Candidate {
                semantic: Some(0.9),
                keyword: Some(2.0),
                tag: None,
            },
        );
        pool.insert(
            "a2".to_string(),
            Candidate {
                semantic: Some(0.8),
                ..Candidate::default()
            },
        );
        pool.insert(
            "b1".to_string(),
            Candidate {
                semantic: Some(0.9),
                keyword: Some(2.0),
                tag: None,
            },
        );
        let stored = vec![
            stored("a1", "A", "x", 100),
            stored("a2", "A", "y", 100),
            stored("b1", "B", "z", 200),
        ];
        let opts = SearchOptions {
            k: 10,
            explain: true,
            ..SearchOptions::default()
        };

        let results = fuse(&pool, stored, FusionWeights::default(), &opts);
        // a1 and b1 tie on score; B is more recent. a2 is deduplicated away.
        let ids: Vec<&str> = results.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "a1"]);
        assert_eq!(
            results[0].matched_via,
            vec![MatchedVia::Semantic, MatchedVia::Keyword]
        );
        assert!((results[0].score - 0.9).abs() < 1e-9);
        assert!(results[0].explain.is_some());
    }

    #[test]
    fn test_fuse_keeps_multiple_passages_when_asked() {
        let mut pool = HashMap::new();
        pool.insert(
            "a1".to_string(),
            Candidate {
                keyword: Some(3.0),
                ..Candidate::default()
            },
        );
        pool.insert(
            "a2".to_string(),
            Candidate {
                keyword: Some(1.0),
                ..Candidate::default()
            },
        );
        let stored = vec![stored("a1", "A", "x", 0), stored("a2", "A", "y", 0)];
        let opts = SearchOptions {
            k: 10,
            mode: SearchMode::Keyword,
            passages_per_document: 2,
            explain: false,
        };
        let results = fuse(
            &pool,
            stored,
            FusionWeights::default().for_mode(SearchMode::Keyword),
            &opts,
        );
        assert_eq!(results.len(), 2);
        assert!(results[0].explain.is_none());
    }

    #[test]
    fn test_snippet_flattens_and_truncates() {
        assert_eq!(make_snippet("a\n\nb  c"), "a b c");
        let long = "word ".repeat(100);
        let s = make_snippet(&long);
        assert!(s.ends_with("..."));
        assert!(s.chars().count() <= SNIPPET_CHARS + 3);
    }
}
