//! SQLite-backed [`ChunkStore`] and [`ReconciliationBacklog`].
//!
//! The authoritative tables are `doc` and `doc_chunk`, with
//! `ON DELETE CASCADE` from document to chunks to index confirmations.
//! `reconcile_backlog` lives in the same database so queued repairs
//! survive restarts.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use retrieval_core::models::{
    chunk_id_for, BacklogEntry, BacklogKey, Chunk, Document, IndexKind, IndexableChunk,
    InsertOutcome, NewChunk, NewDocument,
};
use retrieval_core::store::{ChunkStore, ReconciliationBacklog};
use retrieval_core::Error;

/// Upper bound on bound parameters per `IN (...)` batch.
const ID_BATCH: usize = 500;

pub struct SqliteChunkStore {
    pool: SqlitePool,
}

impl SqliteChunkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    Chunk {
        chunk_id: row.get("chunk_id"),
        doc_id: row.get("doc_id"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        page: row.get("page"),
        start_char: row.get("start_char"),
        end_char: row.get("end_char"),
        created_at: row.get("created_at"),
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn create_document(&self, doc: &NewDocument) -> Result<Document> {
        let doc_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        // One statement, so the version read and the insert share a write lock.
        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO doc (doc_id, project_id, filename, version, checksum, created_at)
            SELECT ?, ?, ?, COALESCE(MAX(version), 0) + 1, ?, ?
            FROM doc WHERE project_id = ? AND filename = ?
            RETURNING version
            "#,
        )
        .bind(&doc_id)
        .bind(&doc.project_id)
        .bind(&doc.filename)
        .bind(&doc.checksum)
        .bind(now)
        .bind(&doc.project_id)
        .bind(&doc.filename)
        .fetch_one(&self.pool)
        .await?;

        Ok(Document {
            doc_id,
            project_id: doc.project_id.clone(),
            filename: doc.filename.clone(),
            version,
            checksum: doc.checksum.clone(),
            created_at: now,
        })
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT doc_id, project_id, filename, version, checksum, created_at FROM doc WHERE doc_id = ?",
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Document {
            doc_id: row.get("doc_id"),
            project_id: row.get("project_id"),
            filename: row.get("filename"),
            version: row.get("version"),
            checksum: row.get("checksum"),
            created_at: row.get("created_at"),
        }))
    }

    async fn insert_chunk(&self, chunk: &NewChunk) -> Result<InsertOutcome> {
        let chunk_id = chunk_id_for(&chunk.doc_id, chunk.chunk_index);
        let now = chrono::Utc::now().timestamp();

        // Selecting from `doc` ties the insert to the owning row: no
        // document, no chunk. A concurrent duplicate is a no-op.
        let inserted = sqlx::query(
            r#"
            INSERT INTO doc_chunk (chunk_id, doc_id, chunk_index, text, page, start_char, end_char, created_at)
            SELECT ?, doc_id, ?, ?, ?, ?, ?, ?
            FROM doc WHERE doc_id = ?
            ON CONFLICT DO NOTHING
            RETURNING chunk_id, doc_id, chunk_index, text, page, start_char, end_char, created_at
            "#,
        )
        .bind(&chunk_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(chunk.page)
        .bind(chunk.start_char)
        .bind(chunk.end_char)
        .bind(now)
        .bind(&chunk.doc_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome {
                chunk: row_to_chunk(&row),
                created: true,
            });
        }

        let existing = sqlx::query(
            "SELECT chunk_id, doc_id, chunk_index, text, page, start_char, end_char, created_at \
             FROM doc_chunk WHERE doc_id = ? AND chunk_index = ?",
        )
        .bind(&chunk.doc_id)
        .bind(chunk.chunk_index)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some(row) => Ok(InsertOutcome {
                chunk: row_to_chunk(&row),
                created: false,
            }),
            None => Err(Error::not_found(&chunk.doc_id).into()),
        }
    }

    async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let mut found: HashMap<String, Chunk> = HashMap::with_capacity(ids.len());

        for batch in ids.chunks(ID_BATCH) {
            let sql = format!(
                "SELECT chunk_id, doc_id, chunk_index, text, page, start_char, end_char, created_at \
                 FROM doc_chunk WHERE chunk_id IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                let chunk = row_to_chunk(&row);
                found.insert(chunk.chunk_id.clone(), chunk);
            }
        }

        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    async fn chunk_ids_for_document(&self, doc_id: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT chunk_id FROM doc_chunk WHERE doc_id = ? ORDER BY chunk_index ASC",
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn delete_document(&self, doc_id: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the write lock from the start.
        let chunks = sqlx::query("DELETE FROM doc_chunk WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let docs = sqlx::query("DELETE FROM doc WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if docs == 0 {
            tx.rollback().await?;
            return Err(Error::not_found(doc_id).into());
        }

        tx.commit().await?;
        Ok(chunks as usize)
    }

    async fn mark_indexed(
        &self,
        chunk_id: &str,
        index: IndexKind,
        model_version: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chunk_index_state (chunk_id, index_kind, model_version, confirmed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chunk_id, index_kind) DO UPDATE SET
                model_version = excluded.model_version,
                confirmed_at = excluded.confirmed_at
            "#,
        )
        .bind(chunk_id)
        .bind(index.as_str())
        .bind(model_version)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unconfirmed_chunks(
        &self,
        index: IndexKind,
        model_version: Option<&str>,
        limit: usize,
    ) -> Result<Vec<IndexableChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.chunk_id, c.doc_id, c.chunk_index, c.text, c.page, c.start_char,
                   c.end_char, c.created_at, d.project_id
            FROM doc_chunk c
            JOIN doc d ON d.doc_id = c.doc_id
            LEFT JOIN chunk_index_state s
                ON s.chunk_id = c.chunk_id AND s.index_kind = ?
            WHERE (s.chunk_id IS NULL
                   OR (? IS NOT NULL AND s.model_version IS NOT ?))
              AND NOT EXISTS (
                  SELECT 1 FROM reconcile_backlog b
                  WHERE b.chunk_id = c.chunk_id AND b.index_kind = ? AND b.op = 'upsert'
              )
            ORDER BY c.doc_id, c.chunk_index
            LIMIT ?
            "#,
        )
        .bind(index.as_str())
        .bind(model_version)
        .bind(model_version)
        .bind(index.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| IndexableChunk {
                chunk: row_to_chunk(row),
                project_id: row.get("project_id"),
            })
            .collect())
    }
}

#[async_trait]
impl ReconciliationBacklog for SqliteChunkStore {
    async fn enqueue(&self, entries: &[BacklogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO reconcile_backlog
                    (chunk_id, index_kind, op, project_id, doc_id, reason, attempts, enqueued_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id, index_kind, op) DO UPDATE SET
                    project_id = excluded.project_id,
                    doc_id = excluded.doc_id,
                    reason = excluded.reason
                "#,
            )
            .bind(&entry.chunk_id)
            .bind(entry.index.as_str())
            .bind(entry.op.as_str())
            .bind(&entry.project_id)
            .bind(&entry.doc_id)
            .bind(&entry.reason)
            .bind(entry.attempts as i64)
            .bind(entry.enqueued_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn pending(&self, limit: usize, max_attempts: u32) -> Result<Vec<BacklogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, index_kind, op, project_id, doc_id, reason, attempts, enqueued_at
            FROM reconcile_backlog
            WHERE attempts < ?
            ORDER BY enqueued_at ASC, chunk_id ASC, index_kind ASC, op ASC
            LIMIT ?
            "#,
        )
        .bind(max_attempts as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let index: String = row.get("index_kind");
            let op: String = row.get("op");
            let attempts: i64 = row.get("attempts");
            entries.push(BacklogEntry {
                chunk_id: row.get("chunk_id"),
                index: index.parse()?,
                op: op.parse()?,
                project_id: row.get("project_id"),
                doc_id: row.get("doc_id"),
                reason: row.get("reason"),
                attempts: attempts.max(0) as u32,
                enqueued_at: row.get("enqueued_at"),
            });
        }
        Ok(entries)
    }

    async fn exhausted(&self, max_attempts: u32) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM reconcile_backlog WHERE attempts >= ?")
                .bind(max_attempts as i64)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    async fn resolve(&self, keys: &[BacklogKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for key in keys {
            sqlx::query(
                "DELETE FROM reconcile_backlog WHERE chunk_id = ? AND index_kind = ? AND op = ?",
            )
            .bind(&key.chunk_id)
            .bind(key.index.as_str())
            .bind(key.op.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_attempt(&self, key: &BacklogKey, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE reconcile_backlog SET attempts = attempts + 1, reason = ?
            WHERE chunk_id = ? AND index_kind = ? AND op = ?
            "#,
        )
        .bind(error)
        .bind(&key.chunk_id)
        .bind(key.index.as_str())
        .bind(key.op.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
