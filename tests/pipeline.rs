//! End-to-end pipeline scenarios against the SQLite backends.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tempfile::TempDir;

use vault_search::chunk::{chunk_id, stitch};
use vault_search::config::{parse_config, Config};
use vault_search::embedding::{EmbeddingProvider, HashingProvider};
use vault_search::error::PipelineError;
use vault_search::llm::DisabledLlm;
use vault_search::models::{Document, DocumentListing, FetchedDocument, MatchedVia, SearchMode};
use vault_search::service::{RetrievalService, ServiceError};
use vault_search::source::ContentSource;
use vault_search::state::SqliteStateStore;
use vault_search::store::{SqliteIndex, VectorIndex};

#[derive(Default)]
struct MemoryVault {
    notes: RwLock<BTreeMap<String, String>>,
}

impl MemoryVault {
    fn with(notes: &[(&str, &str)]) -> Arc<Self> {
        let vault = Self::default();
        for (path, content) in notes {
            vault.put(path, content);
        }
        Arc::new(vault)
    }

    fn put(&self, path: &str, content: &str) {
        self.notes
            .write()
            .unwrap()
            .insert(path.to_string(), content.to_string());
    }

    fn remove(&self, path: &str) {
        self.notes.write().unwrap().remove(path);
    }
}

#[async_trait]
impl ContentSource for MemoryVault {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_documents(&self) -> Result<Vec<DocumentListing>, PipelineError> {
        Ok(self
            .notes
            .read()
            .unwrap()
            .keys()
            .map(|path| DocumentListing {
                path: path.clone(),
                modified_at: Utc::now(),
            })
            .collect())
    }

    async fn get_document(&self, path: &str) -> Result<FetchedDocument, PipelineError> {
        let content = self
            .notes
            .read()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| PipelineError::SourceUnavailable(format!("{} not found", path)))?;
        Ok(FetchedDocument {
            content,
            metadata: serde_json::Value::Null,
        })
    }
}

/// Hashing embedder that can be switched off mid-test.
struct SwitchableProvider {
    inner: HashingProvider,
    down: AtomicBool,
}

#[async_trait]
impl EmbeddingProvider for SwitchableProvider {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.down.load(Ordering::SeqCst) {
            bail!("embedding backend offline");
        }
        self.inner.embed(texts).await
    }
}

fn test_config(dir: &Path) -> Config {
    parse_config(&format!(
        r#"
[db]
path = "{}/index.sqlite"

[source]
kind = "filesystem"
root = "{}"

[embedding]
provider = "hashing"
dims = 256
"#,
        dir.display(),
        dir.display()
    ))
    .unwrap()
}

async fn open_service(
    config: &Config,
    vault: Arc<MemoryVault>,
    provider: Arc<dyn EmbeddingProvider>,
) -> RetrievalService {
    let index = SqliteIndex::open(&config.db.path, config.retrieval.metric)
        .await
        .unwrap();
    let state = SqliteStateStore::open(&config.db.state_path()).await.unwrap();
    RetrievalService::from_parts(
        config,
        vault,
        Arc::new(index),
        Arc::new(state),
        provider,
        Arc::new(DisabledLlm),
    )
}

fn hashing() -> Arc<dyn EmbeddingProvider> {
    Arc::new(HashingProvider::new(256))
}

#[tokio::test]
async fn unchanged_vault_is_not_reembedded_across_restarts() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let vault = MemoryVault::with(&[
        ("a.md", "# Alpha\n\nThe first note."),
        ("b.md", "# Beta\n\nThe second note."),
    ]);

    let svc = open_service(&config, vault.clone(), hashing()).await;
    let first = svc.run_index(false).await.unwrap();
    assert_eq!((first.processed, first.skipped), (2, 0));
    assert!(first.embedded > 0);
    svc.close().await;

    // Fresh process: empty embedding cache, persisted hash state.
    let svc = open_service(&config, vault, hashing()).await;
    let second = svc.run_index(false).await.unwrap();
    assert_eq!((second.processed, second.skipped, second.failed), (0, 2, 0));
    assert_eq!(second.embedded, 0);
    svc.close().await;
}

#[tokio::test]
async fn edited_unchanged_and_deleted_documents() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let vault = MemoryVault::with(&[
        ("a.md", "# Apples\n\nOrchard notes about apples."),
        ("b.md", "# Bridges\n\nSuspension bridge cables."),
        ("c.md", "# Comets\n\nHalley returns every seventy six years."),
    ]);
    let svc = open_service(&config, vault.clone(), hashing()).await;
    svc.run_index(false).await.unwrap();

    vault.put("b.md", "# Bridges\n\nArch bridges carry load in compression.");
    vault.remove("c.md");
    let summary = svc.run_index(false).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.deleted, 1);

    let c_id = Document::id_for_path("c.md");
    for mode in [SearchMode::Hybrid, SearchMode::Keyword, SearchMode::Semantic] {
        let results = svc
            .search("Halley comets seventy six years", Some(10), mode, false)
            .await
            .unwrap();
        assert!(
            results.iter().all(|r| r.document_id != c_id),
            "deleted note returned in {} mode",
            mode
        );
    }

    let results = svc
        .search("compression", Some(5), SearchMode::Keyword, false)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].source_path, "b.md");
    svc.close().await;
}

#[tokio::test]
async fn exact_chunk_text_ranks_first_in_hybrid() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let vault = MemoryVault::with(&[
        ("security.md", "Rotate the API keys every ninety days."),
        ("ops.md", "Rotate the on-call schedule every week and review the keys."),
        ("misc.md", "Remember to water the plants every few days."),
    ]);
    let svc = open_service(&config, vault, hashing()).await;
    svc.run_index(false).await.unwrap();

    let results = svc
        .search(
            "Rotate the API keys every ninety days.",
            Some(3),
            SearchMode::Hybrid,
            true,
        )
        .await
        .unwrap();
    assert_eq!(results[0].source_path, "security.md");
    assert!(results[0].matched_via.contains(&MatchedVia::Semantic));
    assert!(results[0].matched_via.contains(&MatchedVia::Keyword));
    assert!(results[0].explain.is_some());
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    svc.close().await;
}

#[tokio::test]
async fn machine_learning_basics_scenario() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let vault = MemoryVault::with(&[
        (
            "ml.md",
            "# Machine Learning Basics\n\nMachine learning basics: models learn patterns from labelled examples.",
        ),
        ("bread.md", "# Sourdough\n\nFeed the starter flour and water daily."),
        ("trip.md", "# Lisbon\n\nTrams, tiles and custard tarts."),
    ]);
    let svc = open_service(&config, vault, hashing()).await;
    svc.run_index(false).await.unwrap();

    let results = svc
        .search("machine learning basics", None, SearchMode::Hybrid, false)
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].document_id, Document::id_for_path("ml.md"));
    assert_eq!(results[0].title, "Machine Learning Basics");
    assert!(results[0].matched_via.contains(&MatchedVia::Semantic));
    svc.close().await;
}

#[tokio::test]
async fn hybrid_degrades_when_embeddings_fail() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let vault = MemoryVault::with(&[
        ("k8s.md", "# Cluster\n\nKubernetes pods restart on failure."),
        ("garden.md", "# Garden\n\nTomatoes need sun."),
    ]);
    let provider = Arc::new(SwitchableProvider {
        inner: HashingProvider::new(256),
        down: AtomicBool::new(false),
    });
    let svc = open_service(&config, vault, provider.clone()).await;
    svc.run_index(false).await.unwrap();

    provider.down.store(true, Ordering::SeqCst);

    let results = svc
        .search("kubernetes pods", Some(5), SearchMode::Hybrid, false)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].source_path, "k8s.md");
    assert!(!results[0].matched_via.contains(&MatchedVia::Semantic));

    let err = svc
        .search("kubernetes pods", Some(5), SearchMode::Semantic, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Pipeline(PipelineError::EmbeddingFailure(_))
    ));
    svc.close().await;
}

#[tokio::test]
async fn failed_embeddings_are_retried_next_cycle() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let vault = MemoryVault::with(&[("a.md", "# Alpha\n\nSome alpha content.")]);
    let provider = Arc::new(SwitchableProvider {
        inner: HashingProvider::new(256),
        down: AtomicBool::new(true),
    });
    let svc = open_service(&config, vault, provider.clone()).await;

    let summary = svc.run_index(false).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.chunks_failed, 1);

    provider.down.store(false, Ordering::SeqCst);
    let summary = svc.run_index(false).await.unwrap();
    assert_eq!(summary.processed, 1, "hash was not recorded, so it reprocesses");
    assert_eq!(summary.chunks_failed, 0);

    let stats = svc.index().stats().await.unwrap();
    assert_eq!(stats.vectors, 1);
    svc.close().await;
}

#[tokio::test]
async fn indexed_chunks_rebuild_notes_with_frontmatter() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.chunking.max_tokens = 24;
    config.chunking.overlap_tokens = 4;
    let body: String = (0..30)
        .map(|i| format!("Step {} of the plan keeps the garden watered.", i))
        .collect::<Vec<_>>()
        .join(" ");
    let note = format!(
        "---\ntitle: Plan\nstatus: draft\ntags: [a]\n---\n# Plan\n\n{}\n",
        body
    );
    let vault = MemoryVault::with(&[("plan.md", note.as_str())]);
    let svc = open_service(&config, vault, hashing()).await;
    svc.run_index(false).await.unwrap();

    let document_id = Document::id_for_path("plan.md");
    let ids: Vec<String> = (0..200).map(|p| chunk_id(&document_id, p)).collect();
    let mut chunks: Vec<_> = svc
        .index()
        .get_chunks(&ids)
        .await
        .unwrap()
        .into_iter()
        .map(|stored| stored.chunk)
        .collect();
    chunks.sort_by_key(|c| c.position);

    assert!(chunks.len() > 1);
    assert!(chunks[0].text.starts_with("---\ntitle: Plan"));
    assert_eq!(stitch(&chunks), note);
    svc.close().await;
}
