//! SQLite-backed [`VectorIndex`].
//!
//! Vectors are little-endian `f32` BLOBs in `chunk_vectors`, keyed by
//! `(chunk_id, model_version)`. Keyword lookups go through the `chunks_fts`
//! FTS5 table and tag lookups through `document_tags`. Every document
//! replacement runs in a single transaction.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::path::Path;

use super::{DistanceMetric, IndexFilter, IndexStats, StoredChunk, VectorIndex};
use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::migrate;
use crate::models::{Chunk, Document, IndexEntry};

/// Separator used when aggregating tags with `group_concat`.
const TAG_SEP: char = '\u{1f}';

pub struct SqliteIndex {
    pool: SqlitePool,
    metric: DistanceMetric,
}

impl SqliteIndex {
    /// Open the index database, creating the schema if needed.
    pub async fn open(path: &Path, metric: DistanceMetric) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::migrate_index(&pool).await?;
        Ok(Self { pool, metric })
    }
}

fn to_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn split_tags(joined: Option<String>) -> Vec<String> {
    let mut tags: Vec<String> = joined
        .unwrap_or_default()
        .split(TAG_SEP)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    tags.sort();
    tags
}

fn document_from_row(row: &SqliteRow) -> Document {
    Document {
        id: row.get("doc_id"),
        source_path: row.get("source_path"),
        title: row.get("title"),
        raw_content_hash: row.get("content_hash"),
        tags: split_tags(row.get("tags")),
        last_modified: from_millis(row.get("last_modified")),
    }
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    let heading_json: String = row.get("heading_path");
    let position: i64 = row.get("position");
    let start: i64 = row.get("span_start");
    let end: i64 = row.get("span_end");
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        text: row.get("text"),
        heading_path: serde_json::from_str(&heading_json).unwrap_or_default(),
        position: position as usize,
        char_span: start as usize..end as usize,
        hash: row.get("hash"),
    }
}

const DOCUMENT_COLUMNS: &str = r#"
    d.id AS doc_id, d.source_path, d.title, d.content_hash, d.last_modified,
    (SELECT group_concat(tag, char(31)) FROM document_tags t WHERE t.document_id = d.id) AS tags
"#;

async fn write_document(conn: &mut SqliteConnection, doc: &Document) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, source_path, title, content_hash, last_modified)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            source_path = excluded.source_path,
            title = excluded.title,
            content_hash = excluded.content_hash,
            last_modified = excluded.last_modified
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.source_path)
    .bind(&doc.title)
    .bind(&doc.raw_content_hash)
    .bind(to_millis(&doc.last_modified))
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM document_tags WHERE document_id = ?")
        .bind(&doc.id)
        .execute(&mut *conn)
        .await?;
    for tag in &doc.tags {
        sqlx::query("INSERT OR IGNORE INTO document_tags (document_id, tag) VALUES (?, ?)")
            .bind(&doc.id)
            .bind(tag)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn purge_chunks(conn: &mut SqliteConnection, document_id: &str) -> Result<usize> {
    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *conn)
        .await?;
    let removed = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(removed as usize)
}

async fn purge_chunk(conn: &mut SqliteConnection, chunk_id: &str) -> Result<u64> {
    sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
        .bind(chunk_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
        .bind(chunk_id)
        .execute(&mut *conn)
        .await?;
    let removed = sqlx::query("DELETE FROM chunks WHERE id = ?")
        .bind(chunk_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(removed)
}

async fn write_entry(conn: &mut SqliteConnection, entry: &IndexEntry) -> Result<()> {
    let chunk = &entry.chunk;
    let heading_json = serde_json::to_string(&chunk.heading_path)?;

    sqlx::query(
        r#"
        INSERT INTO chunks (id, document_id, position, text, heading_path, span_start, span_end, hash)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.document_id)
    .bind(chunk.position as i64)
    .bind(&chunk.text)
    .bind(&heading_json)
    .bind(chunk.char_span.start as i64)
    .bind(chunk.char_span.end as i64)
    .bind(&chunk.hash)
    .execute(&mut *conn)
    .await?;

    sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(&chunk.text)
        .execute(&mut *conn)
        .await?;

    let Some(embedding) = &entry.embedding else {
        return Ok(());
    };

    let existing_dims: Option<i64> =
        sqlx::query_scalar("SELECT dims FROM chunk_vectors WHERE model_version = ? LIMIT 1")
            .bind(&embedding.model_version)
            .fetch_optional(&mut *conn)
            .await?;
    if let Some(dims) = existing_dims {
        if dims as usize != embedding.vector.len() {
            bail!(
                "dimension mismatch for model {}: index has {}, got {}",
                embedding.model_version,
                dims,
                embedding.vector.len()
            );
        }
    }

    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, model_version, document_id, dims, embedding)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id, model_version) DO UPDATE SET
            document_id = excluded.document_id,
            dims = excluded.dims,
            embedding = excluded.embedding
        "#,
    )
    .bind(&chunk.id)
    .bind(&embedding.model_version)
    .bind(&chunk.document_id)
    .bind(embedding.vector.len() as i64)
    .bind(vec_to_blob(&embedding.vector))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Quote each term so FTS5 treats it as a phrase rather than syntax.
fn fts_query(terms: &[String]) -> Option<String> {
    let quoted: Vec<String> = terms
        .iter()
        .map(|t| t.replace('"', ""))
        .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
        .map(|t| format!("\"{}\"", t))
        .collect();
    if quoted.is_empty() {
        None
    } else {
        Some(quoted.join(" OR "))
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert(&self, document: &Document, entry: &IndexEntry) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_document(&mut tx, document).await?;
        purge_chunk(&mut tx, &entry.chunk.id).await?;
        write_entry(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, chunk_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        purge_chunk(&mut tx, chunk_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let removed = purge_chunks(&mut tx, document_id).await?;
        sqlx::query("DELETE FROM document_tags WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn replace_document(&self, document: &Document, entries: &[IndexEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_document(&mut tx, document).await?;
        purge_chunks(&mut tx, &document.id).await?;
        for entry in entries {
            write_entry(&mut tx, entry).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<(String, f64)>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT cv.chunk_id, cv.embedding FROM chunk_vectors cv");
        if let Some(tag) = &filter.tag {
            qb.push(" JOIN document_tags t ON t.document_id = cv.document_id AND t.tag = ");
            qb.push_bind(tag.to_lowercase());
        }
        qb.push(" WHERE cv.dims = ");
        qb.push_bind(vector.len() as i64);
        if let Some(model) = &filter.model_version {
            qb.push(" AND cv.model_version = ");
            qb.push_bind(model.clone());
        }
        if let Some(doc_id) = &filter.document_id {
            qb.push(" AND cv.document_id = ");
            qb.push_bind(doc_id.clone());
        }

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut hits: Vec<(String, f64)> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let distance = self.metric.distance(vector, &blob_to_vec(&blob));
                (row.get("chunk_id"), distance)
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
        let Some(query) = fts_query(terms) else {
            return Ok(Vec::new());
        };

        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT chunk_id
            FROM chunks_fts
            WHERE chunks_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn tag_lookup(&self, tags: &[String], limit: usize) -> Result<Vec<String>> {
        if tags.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT c.id FROM chunks c JOIN document_tags t ON t.document_id = c.document_id WHERE t.tag IN (",
        );
        {
            let mut list = qb.separated(", ");
            for tag in tags {
                list.push_bind(tag.to_lowercase());
            }
        }
        qb.push(") GROUP BY c.id ORDER BY COUNT(*) DESC, c.document_id, c.position LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<StoredChunk>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT c.id, c.document_id, c.position, c.text, c.heading_path, c.span_start, c.span_end, c.hash, {} \
             FROM chunks c JOIN documents d ON d.id = c.document_id WHERE c.id IN (",
            DOCUMENT_COLUMNS
        ));
        {
            let mut list = qb.separated(", ");
            for id in chunk_ids {
                list.push_bind(id.clone());
            }
        }
        qb.push(")");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut by_id: HashMap<String, StoredChunk> = rows
            .iter()
            .map(|row| {
                let chunk = chunk_from_row(row);
                (
                    chunk.id.clone(),
                    StoredChunk {
                        chunk,
                        document: document_from_row(row),
                    },
                )
            })
            .collect();

        Ok(chunk_ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents d WHERE d.id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(document_from_row))
    }

    async fn stats(&self) -> Result<IndexStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?;
        let dominant = sqlx::query(
            r#"
            SELECT model_version, dims
            FROM chunk_vectors
            GROUP BY model_version, dims
            ORDER BY COUNT(*) DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let (model_version, dimensions) = match dominant {
            Some(row) => {
                let dims: i64 = row.get("dims");
                (Some(row.get("model_version")), Some(dims as usize))
            }
            None => (None, None),
        };

        Ok(IndexStats {
            documents: documents as usize,
            count: count as usize,
            vectors: vectors as usize,
            dimensions,
            model_version,
        })
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn metric(&self) -> DistanceMetric {
        self.metric
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Embedding;
    use tempfile::TempDir;

    fn doc(id: &str, tags: &[&str]) -> Document {
        Document {
            id: id.to_string(),
            source_path: format!("{}.md", id),
            title: id.to_uppercase(),
            raw_content_hash: "h".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            last_modified: from_millis(1_700_000_000_000),
        }
    }

    fn entry(doc_id: &str, pos: usize, text: &str, vector: Vec<f32>) -> IndexEntry {
        let id = crate::chunk::chunk_id(doc_id, pos);
        IndexEntry {
            chunk: Chunk {
                id: id.clone(),
                document_id: doc_id.to_string(),
                text: text.to_string(),
                heading_path: vec!["Top".to_string()],
                position: pos,
                char_span: 0..text.len(),
                hash: "x".to_string(),
            },
            embedding: Some(Embedding {
                chunk_id: id,
                vector,
                model_version: "m".to_string(),
            }),
        }
    }

    async fn open() -> (TempDir, SqliteIndex) {
        let tmp = TempDir::new().unwrap();
        let index = SqliteIndex::open(&tmp.path().join("index.sqlite"), DistanceMetric::Cosine)
            .await
            .unwrap();
        (tmp, index)
    }

    #[tokio::test]
    async fn test_replace_and_query() {
        let (_tmp, index) = open().await;
        let d = doc("a", &["rust"]);
        index
            .replace_document(
                &d,
                &[
                    entry("a", 0, "first chunk", vec![1.0, 0.0]),
                    entry("a", 1, "second chunk", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let hits = index
            .query(&[1.0, 0.0], 5, &IndexFilter::for_model("m"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, crate::chunk::chunk_id("a", 0));
        assert!(hits[0].1 < hits[1].1);

        let stats = index.stats().await.unwrap();
        assert_eq!((stats.documents, stats.count, stats.vectors), (1, 2, 2));
        assert_eq!(stats.dimensions, Some(2));

        let chunks = index.get_chunks(&[hits[0].0.clone()]).await.unwrap();
        assert_eq!(chunks[0].chunk.heading_path, vec!["Top"]);
        assert_eq!(chunks[0].document.tags, vec!["rust"]);
    }

    #[tokio::test]
    async fn test_replace_purges_stale_chunks() {
        let (_tmp, index) = open().await;
        let d = doc("a", &[]);
        index
            .replace_document(
                &d,
                &[
                    entry("a", 0, "one", vec![1.0, 0.0]),
                    entry("a", 1, "two", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();
        index
            .replace_document(&d, &[entry("a", 0, "only", vec![1.0, 0.0])])
            .await
            .unwrap();

        assert_eq!(index.stats().await.unwrap().count, 1);
        assert!(index
            .keyword_lookup(&["two".to_string()], 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let (_tmp, index) = open().await;
        let d = doc("a", &[]);
        let e = entry("a", 0, "text", vec![1.0, 0.0]);
        index.upsert(&d, &e).await.unwrap();
        index.upsert(&d, &e).await.unwrap();
        assert_eq!(index.stats().await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_tag_filter_and_lookup() {
        let (_tmp, index) = open().await;
        index
            .replace_document(&doc("a", &["ml"]), &[entry("a", 0, "alpha", vec![1.0, 0.0])])
            .await
            .unwrap();
        index
            .replace_document(&doc("b", &["cooking"]), &[entry("b", 0, "beta", vec![1.0, 0.0])])
            .await
            .unwrap();

        let filter = IndexFilter {
            tag: Some("ML".to_string()),
            ..IndexFilter::default()
        };
        let hits = index.query(&[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, crate::chunk::chunk_id("a", 0));

        let ids = index.tag_lookup(&["cooking".to_string()], 10).await.unwrap();
        assert_eq!(ids, vec![crate::chunk::chunk_id("b", 0)]);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rolls_back() {
        let (_tmp, index) = open().await;
        index
            .replace_document(&doc("a", &[]), &[entry("a", 0, "alpha", vec![1.0, 0.0])])
            .await
            .unwrap();
        index
            .replace_document(&doc("b", &[]), &[entry("b", 0, "beta", vec![0.0, 1.0])])
            .await
            .unwrap();
        let err = index
            .replace_document(&doc("a", &[]), &[entry("a", 0, "changed", vec![1.0, 0.0, 0.0])])
            .await;
        assert!(err.is_err());

        // Prior state survives the failed replace.
        let ids = index.keyword_lookup(&["alpha".to_string()], 10).await.unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_document() {
        let (_tmp, index) = open().await;
        index
            .replace_document(&doc("a", &["x"]), &[entry("a", 0, "alpha", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(index.delete_document("a").await.unwrap(), 1);
        assert!(index.get_document("a").await.unwrap().is_none());
        assert_eq!(index.stats().await.unwrap(), IndexStats::default());
    }

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(
            fts_query(&["foo".to_string(), "a\"b".to_string(), "--".to_string()]),
            Some("\"foo\" OR \"ab\"".to_string())
        );
        assert_eq!(fts_query(&[]), None);
    }
}
