//! SQLite-backed [`ChunkIndex`].
//!
//! One database holds any number of named collections; an index instance
//! is bound to one of them. Commits run in a single transaction behind a
//! per-instance writer mutex, and `UNIQUE(collection, hash)` backs the
//! dedup check against writers in other processes. Queries read through
//! WAL snapshots and score vectors by brute-force cosine similarity.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use caseforge_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use caseforge_core::models::{Chunk, Document, ScoredChunk};
use caseforge_core::store::{rank, ChunkIndex, CollectionSummary, CommitReport};

pub struct SqliteIndex {
    pool: SqlitePool,
    collection: String,
    model: String,
    write_lock: Mutex<()>,
}

impl SqliteIndex {
    /// `model` is recorded alongside every stored vector.
    pub fn new(pool: SqlitePool, collection: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            pool,
            collection: collection.into(),
            model: model.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        source_id: row.get("source_id"),
        text: row.get("text"),
        hash: row.get("hash"),
    }
}

#[async_trait]
impl ChunkIndex for SqliteIndex {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn contains_hash(&self, hash: &str) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM chunks WHERE collection = ? AND hash = ?",
        )
        .bind(&self.collection)
        .bind(hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn commit(
        &self,
        document: &Document,
        entries: Vec<(Chunk, Vec<f32>)>,
    ) -> Result<CommitReport> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO documents (id, collection, source_id, title, content_type, body, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&document.id)
        .bind(&self.collection)
        .bind(&document.source_id)
        .bind(&document.title)
        .bind(&document.content_type)
        .bind(&document.body)
        .bind(document.ingested_at.timestamp())
        .execute(&mut *tx)
        .await?;

        let mut report = CommitReport::default();
        for (chunk, vector) in &entries {
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO chunks (id, collection, document_id, chunk_index, source_id, text, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&self.collection)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.source_id)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted == 0 {
                report.deduplicated += 1;
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (chunk_id, collection, model, dims, embedding)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&self.collection)
            .bind(&self.model)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
            report.inserted += 1;
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn upsert(&self, chunk: Chunk, vector: Vec<f32>) -> Result<bool> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO chunks (id, collection, document_id, chunk_index, source_id, text, hash)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&self.collection)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.source_id)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted > 0 {
            sqlx::query(
                "INSERT INTO chunk_vectors (chunk_id, collection, model, dims, embedding) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&self.collection)
            .bind(&self.model)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(&vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(inserted > 0)
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.chunk_index, c.source_id, c.text, c.hash, v.embedding
            FROM chunk_vectors v
            JOIN chunks c ON c.collection = v.collection AND c.id = v.chunk_id
            WHERE v.collection = ?
            "#,
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await?;

        let candidates = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                ScoredChunk {
                    score: cosine_similarity(vector, &blob_to_vec(&blob)),
                    chunk: row_to_chunk(row),
                }
            })
            .collect();

        Ok(rank(candidates, k))
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query(
            "SELECT id, document_id, chunk_index, source_id, text, hash FROM chunks WHERE collection = ? AND id = ?",
        )
        .bind(&self.collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_chunk))
    }

    async fn chunk_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE collection = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

/// All collections in the database with their document and chunk counts.
pub async fn list_collections(pool: &SqlitePool) -> Result<Vec<CollectionSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT name,
               (SELECT COUNT(*) FROM documents d WHERE d.collection = name) AS documents,
               (SELECT COUNT(*) FROM chunks c WHERE c.collection = name) AS chunks
        FROM (
            SELECT collection AS name FROM documents
            UNION
            SELECT collection AS name FROM chunks
        )
        ORDER BY name
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| CollectionSummary {
            name: row.get("name"),
            documents: row.get("documents"),
            chunks: row.get("chunks"),
        })
        .collect())
}

/// Delete a collection. Returns the number of chunks removed.
pub async fn drop_collection(pool: &SqlitePool, name: &str) -> Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunk_vectors WHERE collection = ?")
        .bind(name)
        .execute(&mut *tx)
        .await?;
    let removed = sqlx::query("DELETE FROM chunks WHERE collection = ?")
        .bind(name)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM documents WHERE collection = ?")
        .bind(name)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(removed)
}
