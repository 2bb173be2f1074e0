//! Vector and keyword retrievers, and the hybrid fan-out over both.
//!
//! [`HybridRetriever::retrieve`] runs both searches concurrently, each
//! under its own deadline. A backend that errors or misses its deadline
//! contributes an empty list and the query proceeds on the other one; its
//! [`BackendStatus`] records what happened. Cancelling the caller's token
//! drops both in-flight searches.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use retrieval_core::embedding::{embed_one, EmbeddingFunction};
use retrieval_core::models::{HitSource, RetrievalHit};
use retrieval_core::store::{KeywordIndex, VectorIndex};
use retrieval_core::Error;

use crate::cancel::CancellationToken;

/// How a backend fared during one retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Ok,
    TimedOut,
    Failed,
}

/// Embeds the query and searches the vector index.
pub struct VectorRetriever {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingFunction>,
}

impl VectorRetriever {
    pub fn new(index: Arc<dyn VectorIndex>, embedder: Arc<dyn EmbeddingFunction>) -> Self {
        Self { index, embedder }
    }

    pub async fn search(
        &self,
        query_text: &str,
        project_id: &str,
        k: usize,
        similarity_threshold: f64,
    ) -> anyhow::Result<Vec<RetrievalHit>> {
        let query_vec = embed_one(self.embedder.as_ref(), query_text).await?;
        self.index
            .search(&query_vec, project_id, k, similarity_threshold)
            .await
    }
}

pub struct KeywordRetriever {
    index: Arc<dyn KeywordIndex>,
}

impl KeywordRetriever {
    pub fn new(index: Arc<dyn KeywordIndex>) -> Self {
        Self { index }
    }

    pub async fn search(
        &self,
        query_text: &str,
        project_id: &str,
        k: usize,
    ) -> anyhow::Result<Vec<RetrievalHit>> {
        self.index.search(query_text, project_id, k).await
    }
}

/// Parameters of one retrieval attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub vector_query: String,
    pub keyword_query: String,
    pub vector_k: usize,
    pub keyword_k: usize,
    pub similarity_threshold: f64,
}

/// Both ranked lists of one attempt.
#[derive(Debug, Clone)]
pub struct RetrievalSet {
    pub vector_hits: Vec<RetrievalHit>,
    pub keyword_hits: Vec<RetrievalHit>,
    pub vector_status: BackendStatus,
    pub keyword_status: BackendStatus,
}

pub struct HybridRetriever {
    vector: VectorRetriever,
    keyword: KeywordRetriever,
    vector_timeout: Duration,
    keyword_timeout: Duration,
}

impl HybridRetriever {
    pub fn new(
        vector: VectorRetriever,
        keyword: KeywordRetriever,
        vector_timeout: Duration,
        keyword_timeout: Duration,
    ) -> Self {
        Self {
            vector,
            keyword,
            vector_timeout,
            keyword_timeout,
        }
    }

    /// Fails only with [`Error::Cancelled`].
    pub async fn retrieve(
        &self,
        project_id: &str,
        params: &SearchParams,
        cancel: &CancellationToken,
    ) -> Result<RetrievalSet, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let vector = bounded(
            HitSource::Vector,
            self.vector_timeout,
            self.vector.search(
                &params.vector_query,
                project_id,
                params.vector_k,
                params.similarity_threshold,
            ),
        );
        let keyword = bounded(
            HitSource::Keyword,
            self.keyword_timeout,
            self.keyword
                .search(&params.keyword_query, project_id, params.keyword_k),
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(project_id, "retrieval cancelled");
                Err(Error::Cancelled)
            }
            ((vector_hits, vector_status), (keyword_hits, keyword_status)) =
                async { tokio::join!(vector, keyword) } => {
                Ok(RetrievalSet {
                    vector_hits,
                    keyword_hits,
                    vector_status,
                    keyword_status,
                })
            }
        }
    }
}

async fn bounded<F>(
    source: HitSource,
    timeout: Duration,
    search: F,
) -> (Vec<RetrievalHit>, BackendStatus)
where
    F: Future<Output = anyhow::Result<Vec<RetrievalHit>>>,
{
    let started = Instant::now();
    match tokio::time::timeout(timeout, search).await {
        Ok(Ok(hits)) => {
            debug!(
                source = ?source,
                hits = hits.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "retrieval backend returned"
            );
            (hits, BackendStatus::Ok)
        }
        Ok(Err(e)) => {
            warn!(source = ?source, error = %format!("{:#}", e), "retrieval backend failed; treating as empty");
            (Vec::new(), BackendStatus::Failed)
        }
        Err(_) => {
            warn!(
                source = ?source,
                timeout_ms = timeout.as_millis() as u64,
                "retrieval backend timed out; treating as empty"
            );
            (Vec::new(), BackendStatus::TimedOut)
        }
    }
}
