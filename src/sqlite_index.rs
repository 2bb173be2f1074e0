//! SQLite-backed secondary indexes.
//!
//! - [`SqliteVectorIndex`]: embeddings stored as little-endian f32 BLOBs in
//!   `chunk_vectors`, searched by brute-force cosine similarity in Rust.
//! - [`SqliteKeywordIndex`]: FTS5 `chunks_fts` table ranked by `bm25()`.
//!   This is full-text indexing colocated with the chunk store; it mirrors
//!   chunk text for matching only and is never read back as content.
//!
//! Both can live in the chunk store's database file or in a separate one.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use retrieval_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use retrieval_core::models::{HitSource, KeywordEntry, RetrievalHit, VectorEntry};
use retrieval_core::store::{assign_ranks, KeywordIndex, VectorIndex};
use retrieval_core::text::tokenize;

fn id_placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, entry: &VectorEntry) -> Result<()> {
        let blob = vec_to_blob(&entry.vector);
        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, doc_id, project_id, embedding, model_version, dims, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                doc_id = excluded.doc_id,
                project_id = excluded.project_id,
                embedding = excluded.embedding,
                model_version = excluded.model_version,
                dims = excluded.dims,
                created_at = excluded.created_at
            "#,
        )
        .bind(&entry.chunk_id)
        .bind(&entry.doc_id)
        .bind(&entry.project_id)
        .bind(&blob)
        .bind(&entry.model_version)
        .bind(entry.vector.len() as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, chunk_ids: &[String]) -> Result<()> {
        for batch in chunk_ids.chunks(500) {
            let sql = format!(
                "DELETE FROM chunk_vectors WHERE chunk_id IN ({})",
                id_placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            query.execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn search(
        &self,
        query_vec: &[f32],
        project_id: &str,
        k: usize,
        similarity_threshold: f64,
    ) -> Result<Vec<RetrievalHit>> {
        // Fetch the project's vectors and compute cosine similarity in Rust
        let rows = sqlx::query("SELECT chunk_id, embedding FROM chunk_vectors WHERE project_id = ?")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;

        let mut hits: Vec<RetrievalHit> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                (similarity >= similarity_threshold).then(|| RetrievalHit {
                    chunk_id: row.get("chunk_id"),
                    rank: 0,
                    raw_score: similarity,
                    source: HitSource::Vector,
                })
            })
            .collect();

        // Sort by similarity desc and take top K
        hits.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        assign_ranks(&mut hits);
        Ok(hits)
    }
}

pub struct SqliteKeywordIndex {
    pool: SqlitePool,
}

impl SqliteKeywordIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// FTS5 `MATCH` expression where any term may match. Terms are quoted, so
/// FTS5 operators in user input are taken literally.
pub fn fts_match_expr(query: &str) -> Option<String> {
    let mut seen = HashSet::new();
    let terms: Vec<String> = tokenize(query)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect();
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

#[async_trait]
impl KeywordIndex for SqliteKeywordIndex {
    async fn upsert(&self, entry: &KeywordEntry) -> Result<()> {
        // FTS5 has no upsert; replace the row
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(&entry.chunk_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO chunks_fts (chunk_id, doc_id, project_id, text) VALUES (?, ?, ?, ?)")
            .bind(&entry.chunk_id)
            .bind(&entry.doc_id)
            .bind(&entry.project_id)
            .bind(&entry.text)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn remove(&self, chunk_ids: &[String]) -> Result<()> {
        for batch in chunk_ids.chunks(500) {
            let sql = format!(
                "DELETE FROM chunks_fts WHERE chunk_id IN ({})",
                id_placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            query.execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn search(&self, query: &str, project_id: &str, k: usize) -> Result<Vec<RetrievalHit>> {
        let Some(expr) = fts_match_expr(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT chunk_id, bm25(chunks_fts) AS score
            FROM chunks_fts
            WHERE chunks_fts MATCH ? AND project_id = ?
            ORDER BY score ASC, chunk_id ASC
            LIMIT ?
            "#,
        )
        .bind(&expr)
        .bind(project_id)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<RetrievalHit> = rows
            .iter()
            .map(|row| {
                let score: f64 = row.get("score");
                RetrievalHit {
                    chunk_id: row.get("chunk_id"),
                    rank: 0,
                    raw_score: -score, // negate so higher = better
                    source: HitSource::Keyword,
                }
            })
            .collect();
        assign_ranks(&mut hits);
        Ok(hits)
    }
}
