//! Content sources: where notes come from.
//!
//! The [`ContentSource`] trait has two operations, listing and fetching.
//! Two implementations ship:
//!
//! - [`HttpVaultSource`]: the remote vault content API (`GET /list`,
//!   `GET /content/{path}`) with bearer auth, per-request timeouts, and
//!   bounded exponential-backoff retry.
//! - [`FsVaultSource`]: a local vault directory walked with `walkdir` and
//!   filtered with `globset` include/exclude patterns.
//!
//! Errors are classified as [`PipelineError`]s so the indexer can isolate a
//! failing document and retry it next cycle.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{Config, SourceConfig, SourceKind};
use crate::error::PipelineError;
use crate::models::{DocumentListing, FetchedDocument};

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Short label for logs (`http`, `filesystem`).
    fn name(&self) -> &str;

    async fn list_documents(&self) -> Result<Vec<DocumentListing>, PipelineError>;

    async fn get_document(&self, path: &str) -> Result<FetchedDocument, PipelineError>;
}

/// Build the content source named in the config.
pub fn create_source(config: &Config) -> Result<Arc<dyn ContentSource>> {
    match config.source.kind {
        SourceKind::Http => Ok(Arc::new(HttpVaultSource::new(&config.source)?)),
        SourceKind::Filesystem => Ok(Arc::new(FsVaultSource::new(&config.source)?)),
    }
}

// ============ Retry policy ============

/// Exponential backoff: `min(base * 2^retry, cap)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            base: Duration::from_millis(config.retry_base_ms),
            cap: Duration::from_millis(config.retry_cap_ms),
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

// ============ HTTP vault ============

pub struct HttpVaultSource {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListResponse {
    Bare(Vec<DocumentListing>),
    Wrapped { documents: Vec<DocumentListing> },
}

#[derive(Deserialize)]
struct ContentResponse {
    content: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

impl HttpVaultSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let Some(base) = config.base_url.as_deref() else {
            bail!("source.base_url is required for the http source");
        };
        // Url::join drops the last segment unless it ends with '/'.
        let base = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{}/", base)
        };
        let base_url =
            Url::parse(&base).with_context(|| format!("Invalid source.base_url: {}", base))?;
        if base_url.cannot_be_a_base() {
            bail!("source.base_url cannot be used as a base: {}", base);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            client,
            base_url,
            token: config.resolved_token(),
            retry: RetryPolicy::from_config(config),
        })
    }

    fn list_url(&self) -> Result<Url, PipelineError> {
        self.base_url
            .join("list")
            .map_err(|e| PipelineError::SourceUnavailable(e.to_string()))
    }

    fn content_url(&self, path: &str) -> Result<Url, PipelineError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                PipelineError::SourceUnavailable("base url cannot carry a path".to_string())
            })?;
            segments.pop_if_empty().push("content");
            for part in path.split('/').filter(|p| !p.is_empty()) {
                segments.push(part);
            }
        }
        Ok(url)
    }

    /// GET with retry on network errors, 429, and 5xx. Other statuses are
    /// returned to the caller on the first attempt.
    async fn get_with_retry(&self, url: Url) -> Result<reqwest::Response, PipelineError> {
        let mut last_err = String::new();

        for attempt in 0..self.retry.attempts {
            if attempt > 0 {
                let delay = self.retry.delay(attempt - 1);
                debug!(url = %url, attempt, delay_ms = delay.as_millis() as u64, "retrying vault request");
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.get(url.clone());
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                        last_err = format!("{} returned {}", url, status);
                        warn!(url = %url, status = %status, attempt = attempt + 1, "vault request failed");
                        continue;
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    last_err = format!("{}: {}", url, e);
                    warn!(url = %url, error = %e, attempt = attempt + 1, "vault request failed");
                }
            }
        }

        Err(PipelineError::SourceUnavailable(format!(
            "{} (after {} attempts)",
            last_err, self.retry.attempts
        )))
    }
}

#[async_trait]
impl ContentSource for HttpVaultSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn list_documents(&self) -> Result<Vec<DocumentListing>, PipelineError> {
        let url = self.list_url()?;
        let resp = self.get_with_retry(url.clone()).await?;
        if !resp.status().is_success() {
            return Err(PipelineError::SourceUnavailable(format!(
                "{} returned {}",
                url,
                resp.status()
            )));
        }

        let body: ListResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::SourceUnavailable(format!("invalid listing: {}", e)))?;

        Ok(match body {
            ListResponse::Bare(list) => list,
            ListResponse::Wrapped { documents } => documents,
        })
    }

    async fn get_document(&self, path: &str) -> Result<FetchedDocument, PipelineError> {
        let url = self.content_url(path)?;
        let resp = self.get_with_retry(url).await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(PipelineError::SourceUnavailable(format!("{} not found", path)));
        }
        if !status.is_success() {
            return Err(PipelineError::SourceUnavailable(format!(
                "{} returned {}",
                path, status
            )));
        }

        let is_json = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));

        if is_json {
            let body: ContentResponse =
                resp.json()
                    .await
                    .map_err(|e| PipelineError::MalformedContent {
                        path: path.to_string(),
                        reason: e.to_string(),
                    })?;
            Ok(FetchedDocument {
                content: body.content,
                metadata: body.metadata,
            })
        } else {
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| PipelineError::SourceUnavailable(e.to_string()))?;
            let content =
                String::from_utf8(bytes.to_vec()).map_err(|_| PipelineError::MalformedContent {
                    path: path.to_string(),
                    reason: "content is not valid UTF-8".to_string(),
                })?;
            Ok(FetchedDocument {
                content,
                metadata: serde_json::Value::Null,
            })
        }
    }
}

// ============ Filesystem vault ============

pub struct FsVaultSource {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl FsVaultSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let Some(root) = config.root.clone() else {
            bail!("source.root is required for the filesystem source");
        };

        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/.obsidian/**".to_string(),
            "**/.trash/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.iter().cloned());

        Ok(Self {
            root,
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
        })
    }

    /// Resolve a vault-relative path, refusing anything that escapes the root.
    fn resolve(&self, path: &str) -> Result<PathBuf, PipelineError> {
        let rel = Path::new(path);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(PipelineError::SourceUnavailable(format!(
                "path escapes vault root: {}",
                path
            )));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ContentSource for FsVaultSource {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn list_documents(&self) -> Result<Vec<DocumentListing>, PipelineError> {
        if !self.root.is_dir() {
            return Err(PipelineError::SourceUnavailable(format!(
                "vault root does not exist: {}",
                self.root.display()
            )));
        }

        let mut listings = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable vault entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from)
                .unwrap_or_default();

            listings.push(DocumentListing {
                path: rel_str,
                modified_at: modified,
            });
        }

        // Sort for deterministic ordering
        listings.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(listings)
    }

    async fn get_document(&self, path: &str) -> Result<FetchedDocument, PipelineError> {
        let full = self.resolve(path)?;
        let bytes = tokio::fs::read(&full)
            .await
            .map_err(|e| PipelineError::SourceUnavailable(format!("{}: {}", path, e)))?;
        let content = String::from_utf8(bytes).map_err(|_| PipelineError::MalformedContent {
            path: path.to_string(),
            reason: "content is not valid UTF-8".to_string(),
        })?;
        Ok(FetchedDocument {
            content,
            metadata: serde_json::Value::Null,
        })
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
