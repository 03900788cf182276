//! Persisted indexing state: `document_id -> content_hash`.
//!
//! Kept in its own small SQLite file so it survives restarts independently
//! of the vector index. The indexer compares listed documents against this
//! table to classify them as unchanged, changed, or deleted.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use crate::db;
use crate::migrate;

/// Last successfully indexed version of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentState {
    pub document_id: String,
    pub source_path: String,
    pub content_hash: String,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, document_id: &str) -> Result<Option<DocumentState>>;
    async fn all(&self) -> Result<Vec<DocumentState>>;
    async fn put(&self, state: &DocumentState) -> Result<()>;
    async fn remove(&self, document_id: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn close(&self);
}

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::migrate_state(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, document_id: &str) -> Result<Option<DocumentState>> {
        let row = sqlx::query(
            "SELECT document_id, source_path, content_hash FROM document_state WHERE document_id = ?",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| DocumentState {
            document_id: r.get("document_id"),
            source_path: r.get("source_path"),
            content_hash: r.get("content_hash"),
        }))
    }

    async fn all(&self) -> Result<Vec<DocumentState>> {
        let rows = sqlx::query(
            "SELECT document_id, source_path, content_hash FROM document_state ORDER BY source_path",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| DocumentState {
                document_id: r.get("document_id"),
                source_path: r.get("source_path"),
                content_hash: r.get("content_hash"),
            })
            .collect())
    }

    async fn put(&self, state: &DocumentState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO document_state (document_id, source_path, content_hash, indexed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                source_path = excluded.source_path,
                content_hash = excluded.content_hash,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&state.document_id)
        .bind(&state.source_path)
        .bind(&state.content_hash)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM document_state WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM document_state")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Non-persistent state store for tests.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, DocumentState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, document_id: &str) -> Result<Option<DocumentState>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(document_id).cloned())
    }

    async fn all(&self) -> Result<Vec<DocumentState>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<DocumentState> = entries.values().cloned().collect();
        all.sort_by(|a, b| a.source_path.cmp(&b.source_path));
        Ok(all)
    }

    async fn put(&self, state: &DocumentState) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(state.document_id.clone(), state.clone());
        Ok(())
    }

    async fn remove(&self, document_id: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(document_id);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state(id: &str, hash: &str) -> DocumentState {
        DocumentState {
            document_id: id.to_string(),
            source_path: format!("{}.md", id),
            content_hash: hash.to_string(),
        }
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.sqlite");

        let store = SqliteStateStore::open(&path).await.unwrap();
        store.put(&state("a", "h1")).await.unwrap();
        store.put(&state("a", "h2")).await.unwrap();
        store.put(&state("b", "h3")).await.unwrap();
        store.close().await;

        let store = SqliteStateStore::open(&path).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().content_hash, "h2");
        assert_eq!(store.all().await.unwrap().len(), 2);

        store.remove("b").await.unwrap();
        assert!(store.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_state_store() {
        let store = MemoryStateStore::new();
        store.put(&state("x", "h")).await.unwrap();
        assert_eq!(store.all().await.unwrap(), vec![state("x", "h")]);
        store.clear().await.unwrap();
        assert!(store.get("x").await.unwrap().is_none());
    }
}
