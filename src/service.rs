//! Retrieval service: the injectable object behind the CLI and HTTP API.
//!
//! A [`RetrievalService`] owns the vector index, the hash state store, the
//! embedding generator and the answering model. It is opened once with
//! [`RetrievalService::open`] and closed explicitly with
//! [`RetrievalService::close`]. Tests build one from doubles with
//! [`RetrievalService::from_parts`].
//!
//! Searches run concurrently with each other and with indexing. Only one
//! indexing cycle runs at a time; a second caller gets
//! [`ServiceError::CycleInProgress`]. [`RetrievalService::shutdown`] stops a
//! running cycle at the next batch boundary.

use anyhow::Context;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::answer::{assemble_context, query_llm, AnswerOutcome};
use crate::config::Config;
use crate::embedder::EmbeddingGenerator;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::PipelineError;
use crate::indexer::{CancelFlag, Indexer, IndexerOptions};
use crate::llm::{create_llm, LlmClient};
use crate::models::{IndexSummary, SearchMode, SearchResult};
use crate::search::{HybridSearchEngine, SearchOptions};
use crate::source::{create_source, ContentSource};
use crate::state::{SqliteStateStore, StateStore};
use crate::store::{SqliteIndex, VectorIndex};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("an indexing cycle is already running")]
    CycleInProgress,

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Keep pipeline errors typed when they travel inside `anyhow`.
    fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(p) => ServiceError::Pipeline(p),
            Err(e) => ServiceError::Internal(e),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `ok`, or `degraded` when the index does not answer.
    pub status: String,
    /// Number of stored chunks.
    pub index_size: usize,
    pub cache_hit_rate: f64,
    pub documents: usize,
    pub dimensions: Option<usize>,
    pub version: String,
}

pub struct RetrievalService {
    index: Arc<dyn VectorIndex>,
    state: Arc<dyn StateStore>,
    embedder: Arc<EmbeddingGenerator>,
    llm: Arc<dyn LlmClient>,
    indexer: Indexer,
    engine: HybridSearchEngine,
    cycle: tokio::sync::Mutex<()>,
    shutdown: CancelFlag,
    default_k: usize,
    passages_per_document: usize,
    max_context_tokens: usize,
}

impl RetrievalService {
    /// Open the on-disk index and state store and build every collaborator
    /// named in `config`.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let index = SqliteIndex::open(&config.db.path, config.retrieval.metric)
            .await
            .context("Failed to open vector index")?;
        let state = SqliteStateStore::open(&config.db.state_path())
            .await
            .context("Failed to open state store")?;
        let source = create_source(config)?;
        let provider: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
        let llm: Arc<dyn LlmClient> = Arc::from(create_llm(&config.llm)?);

        info!(
            db = %config.db.path.display(),
            source = source.name(),
            model = provider.model_name(),
            "retrieval service opened"
        );

        Ok(Self::from_parts(
            config,
            source,
            Arc::new(index),
            Arc::new(state),
            provider,
            llm,
        ))
    }

    pub fn from_parts(
        config: &Config,
        source: Arc<dyn ContentSource>,
        index: Arc<dyn VectorIndex>,
        state: Arc<dyn StateStore>,
        provider: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let embedder = Arc::new(EmbeddingGenerator::new(
            provider,
            &config.embedding,
            &config.cache,
        ));
        let indexer = Indexer::new(
            source,
            index.clone(),
            state.clone(),
            embedder.clone(),
            IndexerOptions::from_config(config),
        );
        let engine = HybridSearchEngine::new(index.clone(), embedder.clone(), &config.retrieval);

        Self {
            index,
            state,
            embedder,
            llm,
            indexer,
            engine,
            cycle: tokio::sync::Mutex::new(()),
            shutdown: CancelFlag::new(),
            default_k: config.retrieval.default_k,
            passages_per_document: config.retrieval.passages_per_document,
            max_context_tokens: config.llm.max_context_tokens,
        }
    }

    pub fn default_k(&self) -> usize {
        self.default_k
    }

    pub fn embedder(&self) -> &EmbeddingGenerator {
        &self.embedder
    }

    pub fn index(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }

    /// Run one indexing cycle unless another is already running.
    pub async fn run_index(&self, force: bool) -> Result<IndexSummary, ServiceError> {
        let _running = self
            .cycle
            .try_lock()
            .map_err(|_| ServiceError::CycleInProgress)?;
        Ok(self.indexer.run_cycle(force, &self.shutdown).await?)
    }

    /// Cancel the running cycle, if any, and every later one.
    pub fn shutdown(&self) {
        info!("shutdown requested, cancelling indexing");
        self.shutdown.cancel();
    }

    pub async fn search(
        &self,
        query: &str,
        k: Option<usize>,
        mode: SearchMode,
        explain: bool,
    ) -> Result<Vec<SearchResult>, ServiceError> {
        if query.trim().is_empty() {
            return Err(ServiceError::BadRequest("query must not be empty".to_string()));
        }
        let opts = SearchOptions {
            k: k.unwrap_or(self.default_k),
            mode,
            passages_per_document: self.passages_per_document,
            explain,
        };
        self.engine
            .search(query, &opts)
            .await
            .map_err(ServiceError::from_anyhow)
    }

    /// Retrieve, pack and answer. `Ok(NoRelevantContent)` means the search
    /// found nothing and the model was not called.
    pub async fn query(&self, query: &str, k: Option<usize>) -> Result<AnswerOutcome, ServiceError> {
        let results = self.search(query, k, SearchMode::Hybrid, false).await?;
        let context = assemble_context(&results, self.max_context_tokens);
        Ok(query_llm(self.llm.as_ref(), query, &context).await?)
    }

    pub async fn health(&self) -> Result<HealthReport, ServiceError> {
        let status = match self.index.ping().await {
            Ok(()) => "ok",
            Err(_) => "degraded",
        };
        let stats = self.index.stats().await.unwrap_or_default();
        Ok(HealthReport {
            status: status.to_string(),
            index_size: stats.count,
            cache_hit_rate: self.embedder.cache_hit_rate(),
            documents: stats.documents,
            dimensions: stats.dimensions,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Wait for a running cycle to finish, then release both stores.
    pub async fn close(&self) {
        let _running = self.cycle.lock().await;
        self.index.close().await;
        self.state.close().await;
        info!("retrieval service closed");
    }
}
