//! HTTP service API exercised with reqwest against an ephemeral port.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;

use vault_search::config::{parse_config, Config};
use vault_search::embedding::HashingProvider;
use vault_search::error::PipelineError;
use vault_search::llm::{DisabledLlm, LlmClient};
use vault_search::models::{DocumentListing, FetchedDocument};
use vault_search::server::serve;
use vault_search::service::RetrievalService;
use vault_search::source::ContentSource;
use vault_search::state::MemoryStateStore;
use vault_search::store::{DistanceMetric, MemoryIndex, SqliteIndex, VectorIndex};

struct StaticVault {
    notes: Vec<(&'static str, &'static str)>,
    /// When set, listing waits for a release signal.
    gate: Option<(Notify, Notify)>,
}

#[async_trait]
impl ContentSource for StaticVault {
    fn name(&self) -> &str {
        "static"
    }

    async fn list_documents(&self) -> Result<Vec<DocumentListing>, PipelineError> {
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        Ok(self
            .notes
            .iter()
            .map(|(path, _)| DocumentListing {
                path: path.to_string(),
                modified_at: Utc::now(),
            })
            .collect())
    }

    async fn get_document(&self, path: &str) -> Result<FetchedDocument, PipelineError> {
        self.notes
            .iter()
            .find(|(p, _)| *p == path)
            .map(|(_, content)| FetchedDocument {
                content: content.to_string(),
                metadata: Value::Null,
            })
            .ok_or_else(|| PipelineError::SourceUnavailable(format!("{} not found", path)))
    }
}

struct CannedLlm;

#[async_trait]
impl LlmClient for CannedLlm {
    fn name(&self) -> &str {
        "canned"
    }
    async fn complete(&self, prompt: &str) -> Result<String> {
        assert!(prompt.contains("[1] source: "));
        Ok("Water the sourdough starter daily [1].".to_string())
    }
}

const NOTES: &[(&str, &str)] = &[
    (
        "kitchen/sourdough.md",
        "---\ntags: [baking]\n---\n# Sourdough\n\nFeed the starter flour and water daily.",
    ),
    ("travel/lisbon.md", "# Lisbon\n\nTrams, tiles and custard tarts."),
];

fn config() -> Config {
    parse_config(
        r#"
[db]
path = "/tmp/unused/index.sqlite"

[source]
kind = "filesystem"
root = "/tmp/unused"
"#,
    )
    .unwrap()
}

async fn spawn(vault: StaticVault, llm: Arc<dyn LlmClient>) -> String {
    let service = Arc::new(RetrievalService::from_parts(
        &config(),
        Arc::new(vault),
        Arc::new(MemoryIndex::default()),
        Arc::new(MemoryStateStore::new()),
        Arc::new(HashingProvider::new(128)),
        llm,
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        serve(listener, service).await.unwrap();
    });
    base
}

fn vault() -> StaticVault {
    StaticVault {
        notes: NOTES.to_vec(),
        gate: None,
    }
}

async fn post(base: &str, path: &str, body: Value) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(format!("{}{}", base, path))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

#[tokio::test]
async fn index_search_and_health() {
    let base = spawn(vault(), Arc::new(DisabledLlm)).await;

    let (status, summary) = post(&base, "/index", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(summary["total"], 2);
    assert_eq!(summary["processed"], 2);
    assert_eq!(summary["skipped"], 0);
    assert_eq!(summary["failed"], 0);

    let (_, summary) = post(&base, "/index", json!({ "force_reindex": false })).await;
    assert_eq!(summary["skipped"], 2);

    let (status, results) = post(&base, "/search", json!({ "query": "sourdough starter", "k": 1 })).await;
    assert_eq!(status, 200);
    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["source_path"], "kitchen/sourdough.md");
    assert!(results[0]["matched_via"]
        .as_array()
        .unwrap()
        .contains(&json!("keyword")));
    assert!(results[0].get("explain").is_none());
    assert!(results[0].get("text").is_none());

    let (_, results) = post(&base, "/search", json!({ "query": "#baking", "mode": "tag" })).await;
    assert_eq!(results[0]["source_path"], "kitchen/sourdough.md");

    let health: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["index_size"], 2);
    assert_eq!(health["documents"], 2);
    assert_eq!(health["dimensions"], 128);
    assert!(health["cache_hit_rate"].as_f64().unwrap() >= 0.0);
    assert!(health["version"].is_string());
}

#[tokio::test]
async fn index_accepts_empty_body() {
    let base = spawn(vault(), Arc::new(DisabledLlm)).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/index", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let summary: Value = resp.json().await.unwrap();
    assert_eq!(summary["processed"], 2);
}

#[tokio::test]
async fn bad_requests_use_error_contract() {
    let base = spawn(vault(), Arc::new(DisabledLlm)).await;

    let (status, body) = post(&base, "/search", json!({ "query": "x", "mode": "fuzzy" })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = post(&base, "/search", json!({ "query": "   " })).await;
    assert_eq!(status, 400);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("must not be empty"));

    let (status, _) = post(&base, "/query", json!({ "query": "x", "k": 0 })).await;
    assert_eq!(status, 400);

    for path in ["/search", "/query"] {
        let (status, body) = post(&base, path, json!({ "k": 3 })).await;
        assert_eq!(status, 400, "{}", path);
        assert_eq!(body["error"]["code"], "bad_request");
        assert!(body["error"]["message"].as_str().unwrap().contains("query"));
    }

    let resp = reqwest::Client::new()
        .post(format!("{}/search", base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn aborted_cycle_reports_partial_summary() {
    let tmp = TempDir::new().unwrap();
    let index = SqliteIndex::open(&tmp.path().join("index.sqlite"), DistanceMetric::Cosine)
        .await
        .unwrap();
    index.close().await;

    let service = Arc::new(RetrievalService::from_parts(
        &config(),
        Arc::new(vault()),
        Arc::new(index),
        Arc::new(MemoryStateStore::new()),
        Arc::new(HashingProvider::new(128)),
        Arc::new(DisabledLlm),
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(serve(listener, service));

    let (status, body) = post(&base, "/index", json!({})).await;
    assert_eq!(status, 503);
    assert_eq!(body["error"]["code"], "cycle_aborted");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("index unreachable"));
    let summary = &body["error"]["summary"];
    assert_eq!(summary["processed"], 0);
    assert_eq!(summary["skipped"], 0);
    assert_eq!(summary["failed"], 0);
}

#[tokio::test]
async fn query_separates_no_content_from_llm_unavailable() {
    let base = spawn(vault(), Arc::new(DisabledLlm)).await;

    let (status, body) = post(&base, "/query", json!({ "query": "sourdough" })).await;
    assert_eq!(status, 200);
    assert!(body["answer"].is_null());
    assert_eq!(body["sources"], json!([]));

    post(&base, "/index", json!({})).await;
    let (status, body) = post(&base, "/query", json!({ "query": "sourdough" })).await;
    assert_eq!(status, 503);
    assert_eq!(body["error"]["code"], "llm_unavailable");
}

#[tokio::test]
async fn query_returns_answer_with_sources() {
    let base = spawn(vault(), Arc::new(CannedLlm)).await;
    post(&base, "/index", json!({})).await;

    let (status, body) = post(&base, "/query", json!({ "query": "how often to feed the sourdough starter?", "k": 3 })).await;
    assert_eq!(status, 200);
    assert_eq!(body["answer"], "Water the sourdough starter daily [1].");
    let sources = body["sources"].as_array().unwrap();
    assert_eq!(sources[0]["path"], "kitchen/sourdough.md");
    assert!(sources[0]["score"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn concurrent_index_gets_conflict() {
    let vault = Arc::new(StaticVault {
        notes: NOTES.to_vec(),
        gate: Some((Notify::new(), Notify::new())),
    });
    let service = Arc::new(RetrievalService::from_parts(
        &config(),
        vault.clone(),
        Arc::new(MemoryIndex::default()),
        Arc::new(MemoryStateStore::new()),
        Arc::new(HashingProvider::new(128)),
        Arc::new(DisabledLlm),
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(serve(listener, service));

    let first = {
        let base = base.clone();
        tokio::spawn(async move { post(&base, "/index", json!({})).await })
    };

    let (entered, release) = vault.gate.as_ref().unwrap();
    entered.notified().await;
    let (status, body) = post(&base, "/index", json!({})).await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["code"], "conflict");

    release.notify_one();
    let (status, summary) = first.await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(summary["processed"], 2);
}
