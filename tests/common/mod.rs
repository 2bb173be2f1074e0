//! Shared fixtures for the integration tests: SQLite-backed engines and
//! index wrappers that record, delay, or fail calls on demand.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use hybrid_retrieval::cancel::CancellationToken;
use hybrid_retrieval::config::Config;
use hybrid_retrieval::engine::Backends;
use hybrid_retrieval::{db, migrate};
use retrieval_core::access::AccessPolicy;
use retrieval_core::embedding::EmbeddingFunction;
use retrieval_core::models::{KeywordEntry, NewChunk, NewDocument, RetrievalHit, VectorEntry};
use retrieval_core::store::{KeywordIndex, VectorIndex};
use sqlx::SqlitePool;

// ─── SQLite fixtures ────────────────────────────────────────────────

pub fn test_config(dir: &Path) -> Config {
    Config::with_db_path(dir.join("retrieval.sqlite"))
}

/// Connect and migrate the database named by `config`, and build the
/// SQLite backends over it.
pub async fn sqlite_backends(
    config: &Config,
    embedder: Arc<dyn EmbeddingFunction>,
    access: Arc<dyn AccessPolicy>,
) -> Result<(Backends, SqlitePool)> {
    let pool = db::connect(&config.db).await?;
    migrate::run_migrations(&pool).await?;
    Ok((Backends::sqlite(&pool, embedder, access), pool))
}

pub async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}

pub fn new_doc(project_id: &str, filename: &str) -> NewDocument {
    NewDocument {
        project_id: project_id.to_string(),
        filename: filename.to_string(),
        checksum: format!("sha256:{}", filename),
    }
}

pub fn new_chunk(doc_id: &str, chunk_index: i64, text: &str) -> NewChunk {
    NewChunk {
        doc_id: doc_id.to_string(),
        chunk_index,
        text: text.to_string(),
        page: 1,
        start_char: 0,
        end_char: text.len() as i64,
    }
}

// ─── Vector probe ───────────────────────────────────────────────────

/// Wraps a vector index, recording `(k, similarity_threshold)` per search.
pub struct VectorProbe {
    inner: Arc<dyn VectorIndex>,
    pub searches: Mutex<Vec<(usize, f64)>>,
    search_delay: Option<Duration>,
    pub fail_writes: AtomicBool,
}

impl VectorProbe {
    pub fn new(inner: Arc<dyn VectorIndex>) -> Self {
        Self {
            inner,
            searches: Mutex::new(Vec::new()),
            search_delay: None,
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn with_search_delay(mut self, delay: Duration) -> Self {
        self.search_delay = Some(delay);
        self
    }

    pub fn recorded(&self) -> Vec<(usize, f64)> {
        self.searches.lock().unwrap().clone()
    }
}

#[async_trait]
impl VectorIndex for VectorProbe {
    async fn upsert(&self, entry: &VectorEntry) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("vector index unavailable");
        }
        self.inner.upsert(entry).await
    }

    async fn remove(&self, chunk_ids: &[String]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("vector index unavailable");
        }
        self.inner.remove(chunk_ids).await
    }

    async fn search(
        &self,
        query_vec: &[f32],
        project_id: &str,
        k: usize,
        similarity_threshold: f64,
    ) -> Result<Vec<RetrievalHit>> {
        self.searches.lock().unwrap().push((k, similarity_threshold));
        if let Some(delay) = self.search_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner
            .search(query_vec, project_id, k, similarity_threshold)
            .await
    }
}

// ─── Keyword probe ──────────────────────────────────────────────────

/// Wraps a keyword index, recording `(query, k)` per search.
pub struct KeywordProbe {
    inner: Arc<dyn KeywordIndex>,
    pub searches: Mutex<Vec<(String, usize)>>,
    pub fail_writes: AtomicBool,
    write_delay: Option<Duration>,
    cancel_on_search: Option<CancellationToken>,
}

impl KeywordProbe {
    pub fn new(inner: Arc<dyn KeywordIndex>) -> Self {
        Self {
            inner,
            searches: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            write_delay: None,
            cancel_on_search: None,
        }
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Cancel `token` from inside every search.
    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_on_search = Some(token);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    pub fn recorded(&self) -> Vec<(String, usize)> {
        self.searches.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeywordIndex for KeywordProbe {
    async fn upsert(&self, entry: &KeywordEntry) -> Result<()> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("keyword index unavailable");
        }
        self.inner.upsert(entry).await
    }

    async fn remove(&self, chunk_ids: &[String]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("keyword index unavailable");
        }
        self.inner.remove(chunk_ids).await
    }

    async fn search(&self, query: &str, project_id: &str, k: usize) -> Result<Vec<RetrievalHit>> {
        self.searches.lock().unwrap().push((query.to_string(), k));
        if let Some(token) = &self.cancel_on_search {
            token.cancel();
        }
        self.inner.search(query, project_id, k).await
    }
}
