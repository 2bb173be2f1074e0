//! The retrieval engine facade.
//!
//! [`RetrievalEngine`] wires the chunk store, both indexes, the embedder,
//! and an access policy into the public operations:
//!
//! | Operation | Purpose |
//! |-----------|---------|
//! | [`create_document`](RetrievalEngine::create_document) | Register a new document version |
//! | [`ingest`](RetrievalEngine::ingest) | Dual-write one chunk |
//! | [`query`](RetrievalEngine::query) | Hybrid retrieval with quality gate and one fallback |
//! | [`get_chunks`](RetrievalEngine::get_chunks) | Read chunks by id |
//! | [`delete_document`](RetrievalEngine::delete_document) | Cascade delete plus index removal |
//! | [`repair`](RetrievalEngine::repair) | Reconcile the indexes with the chunk store |
//!
//! Every operation checks the [`AccessPolicy`] before touching a store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use retrieval_core::access::AccessPolicy;
use retrieval_core::embedding::EmbeddingFunction;
use retrieval_core::error::Result;
use retrieval_core::expansion::TermExpander;
use retrieval_core::fusion::fuse;
use retrieval_core::models::{Chunk, Document, HitSource, NewChunk, NewDocument};
use retrieval_core::quality::{QualityGate, QualityVerdict, QueryState, QueryTrace};
use retrieval_core::resolve::ReadThroughResolver;
use retrieval_core::store::memory::{
    InMemoryChunkStore, InMemoryKeywordIndex, InMemoryVectorIndex,
};
use retrieval_core::store::{ChunkStore, KeywordIndex, ReconciliationBacklog, VectorIndex};
use retrieval_core::Error;

use crate::cancel::CancellationToken;
use crate::config::{Config, QualityConfig, RetrievalConfig};
use crate::coordinator::{DualWriteCoordinator, IngestReceipt, RepairReport, WriteSettings};
use crate::retriever::{
    BackendStatus, HybridRetriever, KeywordRetriever, SearchParams, VectorRetriever,
};
use crate::sqlite_index::{SqliteKeywordIndex, SqliteVectorIndex};
use crate::sqlite_store::SqliteChunkStore;
use crate::{db, embedding, migrate};

/// The collaborators an engine is built from.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn ChunkStore>,
    pub backlog: Arc<dyn ReconciliationBacklog>,
    pub vectors: Arc<dyn VectorIndex>,
    pub keywords: Arc<dyn KeywordIndex>,
    pub embedder: Arc<dyn EmbeddingFunction>,
    pub access: Arc<dyn AccessPolicy>,
}

impl Backends {
    /// In-memory store, backlog, and indexes.
    pub fn in_memory(embedder: Arc<dyn EmbeddingFunction>, access: Arc<dyn AccessPolicy>) -> Self {
        let store = Arc::new(InMemoryChunkStore::new());
        Self {
            store: store.clone(),
            backlog: store,
            vectors: Arc::new(InMemoryVectorIndex::new()),
            keywords: Arc::new(InMemoryKeywordIndex::new()),
            embedder,
            access,
        }
    }

    /// Chunk store, backlog, and both indexes in one SQLite database.
    /// The schema must already exist.
    pub fn sqlite(
        pool: &SqlitePool,
        embedder: Arc<dyn EmbeddingFunction>,
        access: Arc<dyn AccessPolicy>,
    ) -> Self {
        let store = Arc::new(SqliteChunkStore::new(pool.clone()));
        Self {
            store: store.clone(),
            backlog: store,
            vectors: Arc::new(SqliteVectorIndex::new(pool.clone())),
            keywords: Arc::new(SqliteKeywordIndex::new(pool.clone())),
            embedder,
            access,
        }
    }
}

/// A retrieval request.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub principal: String,
    pub project_id: String,
    pub query_text: String,
    /// Defaults to `retrieval.max_results`.
    pub max_results: Option<usize>,
    /// Defaults to `retrieval.similarity_threshold`. Callers tune this per
    /// query intent: looser for broad questions, tighter for lookups.
    pub similarity_threshold: Option<f64>,
    pub cancel: CancellationToken,
}

impl QueryRequest {
    pub fn new(principal: &str, project_id: &str, query_text: &str) -> Self {
        Self {
            principal: principal.to_string(),
            project_id: project_id.to_string(),
            query_text: query_text.to_string(),
            max_results: None,
            similarity_threshold: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub fused_score: f64,
    /// 1-based.
    pub rank: usize,
    pub sources: Vec<HitSource>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub results: Vec<QueryResult>,
    pub low_confidence: bool,
    pub aggregate_score: f64,
    pub fallback_used: bool,
    pub vector_status: BackendStatus,
    pub keyword_status: BackendStatus,
    /// Stale index entries dropped while resolving.
    pub stale_dropped: usize,
    pub states: Vec<QueryState>,
}

struct Attempt {
    results: Vec<QueryResult>,
    verdict: QualityVerdict,
    vector_status: BackendStatus,
    keyword_status: BackendStatus,
    stale_dropped: usize,
}

pub struct RetrievalEngine {
    store: Arc<dyn ChunkStore>,
    access: Arc<dyn AccessPolicy>,
    retriever: HybridRetriever,
    coordinator: DualWriteCoordinator,
    gate: QualityGate,
    expander: TermExpander,
    retrieval: RetrievalConfig,
    quality: QualityConfig,
    repair_interval: Option<Duration>,
    pool: Option<SqlitePool>,
}

impl RetrievalEngine {
    pub fn new(backends: Backends, config: &Config) -> Self {
        let retriever = HybridRetriever::new(
            VectorRetriever::new(backends.vectors.clone(), backends.embedder.clone()),
            KeywordRetriever::new(backends.keywords.clone()),
            config.retrieval.vector_timeout(),
            config.retrieval.keyword_timeout(),
        );
        let coordinator = DualWriteCoordinator::new(
            backends.store.clone(),
            backends.backlog,
            backends.vectors,
            backends.keywords,
            backends.embedder,
            WriteSettings {
                vector_timeout: Duration::from_millis(config.ingest.vector_timeout_ms),
                keyword_timeout: Duration::from_millis(config.ingest.keyword_timeout_ms),
                repair_batch_size: config.repair.batch_size,
                max_attempts: config.repair.max_attempts,
            },
        );

        Self {
            store: backends.store,
            access: backends.access,
            retriever,
            coordinator,
            gate: QualityGate::for_rrf(config.quality.top_n, config.retrieval.k_const),
            expander: TermExpander::new(&config.quality.synonyms),
            retrieval: config.retrieval.clone(),
            quality: config.quality.clone(),
            repair_interval: config.repair.interval_secs.map(Duration::from_secs),
            pool: None,
        }
    }

    /// Open the SQLite deployment described by `config`: connect, migrate,
    /// and build the embedder.
    pub async fn open(config: &Config, access: Arc<dyn AccessPolicy>) -> anyhow::Result<Self> {
        config.validate()?;
        let pool = db::connect(&config.db)
            .await
            .with_context(|| format!("Failed to open database: {}", config.db.path.display()))?;
        migrate::run_migrations(&pool).await?;
        let embedder = embedding::create_embedder(&config.embedding)?;

        let backends = Backends::sqlite(&pool, embedder, access);

        info!(db = %config.db.path.display(), provider = %config.embedding.provider, "retrieval engine opened");
        let mut engine = Self::new(backends, config);
        engine.pool = Some(pool);
        Ok(engine)
    }

    /// The SQLite pool, when opened with [`RetrievalEngine::open`].
    pub fn pool(&self) -> Option<&SqlitePool> {
        self.pool.as_ref()
    }

    fn authorize(&self, project_id: &str, principal: &str) -> Result<()> {
        if self.access.allows(project_id, principal) {
            Ok(())
        } else {
            warn!(project_id, principal, "access denied");
            Err(Error::AccessDenied {
                project_id: project_id.to_string(),
                principal: principal.to_string(),
            })
        }
    }

    async fn owned_document(&self, principal: &str, doc_id: &str) -> Result<Document> {
        let doc = self
            .store
            .get_document(doc_id)
            .await
            .map_err(Error::from_backend)?
            .ok_or_else(|| Error::not_found(doc_id))?;
        self.authorize(&doc.project_id, principal)?;
        Ok(doc)
    }

    pub async fn create_document(&self, principal: &str, doc: &NewDocument) -> Result<Document> {
        if doc.project_id.trim().is_empty() || doc.filename.trim().is_empty() {
            return Err(Error::InvalidInput(
                "project_id and filename must not be empty".to_string(),
            ));
        }
        self.authorize(&doc.project_id, principal)?;
        self.store
            .create_document(doc)
            .await
            .map_err(Error::from_primary_write)
    }

    pub async fn ingest(&self, principal: &str, chunk: &NewChunk) -> Result<IngestReceipt> {
        if chunk.chunk_index < 0 {
            return Err(Error::InvalidInput("chunk_index must be >= 0".to_string()));
        }
        if chunk.start_char > chunk.end_char {
            return Err(Error::InvalidInput(
                "start_char must not exceed end_char".to_string(),
            ));
        }
        let doc = self.owned_document(principal, &chunk.doc_id).await?;
        self.coordinator.ingest(&doc.project_id, chunk).await
    }

    /// Returns the number of chunks deleted.
    pub async fn delete_document(&self, principal: &str, doc_id: &str) -> Result<usize> {
        let doc = self.owned_document(principal, doc_id).await?;
        self.coordinator
            .delete_document(&doc.project_id, doc_id)
            .await
    }

    /// Chunks of `project_id` among `ids`, in input order.
    pub async fn get_chunks(
        &self,
        principal: &str,
        project_id: &str,
        ids: &[String],
    ) -> Result<Vec<Chunk>> {
        self.authorize(project_id, principal)?;
        let chunks = self
            .store
            .get_chunks_by_ids(ids)
            .await
            .map_err(Error::from_backend)?;

        let doc_ids: HashSet<&str> = chunks.iter().map(|c| c.doc_id.as_str()).collect();
        let mut in_project: HashMap<&str, bool> = HashMap::new();
        for doc_id in doc_ids {
            let doc = self
                .store
                .get_document(doc_id)
                .await
                .map_err(Error::from_backend)?;
            in_project.insert(
                doc_id,
                doc.is_some_and(|d| d.project_id == project_id),
            );
        }

        let visible = chunks
            .iter()
            .filter(|c| in_project.get(c.doc_id.as_str()).copied().unwrap_or(false))
            .cloned()
            .collect();
        Ok(visible)
    }

    pub async fn repair(&self) -> Result<RepairReport> {
        self.coordinator.repair().await
    }

    /// Retrieve, fuse, resolve, and gate. Falls back at most once.
    ///
    /// Low quality is reported through `low_confidence`, never as an error.
    /// Fails with [`Error::Cancelled`] if the request's token is cancelled
    /// while retrieval is in flight or before the fallback starts.
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let query_text = request.query_text.trim();
        if query_text.is_empty() {
            return Err(Error::InvalidInput("query_text must not be empty".to_string()));
        }
        if request.max_results == Some(0) {
            return Err(Error::InvalidInput("max_results must be >= 1".to_string()));
        }
        self.authorize(&request.project_id, &request.principal)?;

        let limit = request.max_results.unwrap_or(self.retrieval.max_results);
        let similarity_threshold = request
            .similarity_threshold
            .unwrap_or(self.retrieval.similarity_threshold);

        let mut trace = QueryTrace::new();
        trace.advance(QueryState::Retrieving);
        let primary = SearchParams {
            vector_query: query_text.to_string(),
            keyword_query: query_text.to_string(),
            vector_k: self.retrieval.vector_k,
            keyword_k: self.retrieval.keyword_k,
            similarity_threshold,
        };
        let first = self
            .attempt(&request.project_id, &primary, limit, &request.cancel, &mut trace)
            .await?;

        if first.verdict.accepted {
            trace.advance(QueryState::Ready {
                low_confidence: false,
            });
            return Ok(respond(first, false, trace));
        }

        if request.cancel.is_cancelled() {
            debug!(project_id = %request.project_id, "cancelled before fallback");
            return Err(Error::Cancelled);
        }

        trace.advance(QueryState::FallbackRetrieving);
        let widened = self.widen(&primary);
        debug!(
            project_id = %request.project_id,
            aggregate = first.verdict.aggregate_score,
            vector_k = widened.vector_k,
            keyword_k = widened.keyword_k,
            similarity_threshold = widened.similarity_threshold,
            "quality below threshold; retrying with widened parameters"
        );
        let second = self
            .attempt(&request.project_id, &widened, limit, &request.cancel, &mut trace)
            .await?;

        let chosen = if second.verdict.accepted
            || second.verdict.aggregate_score >= first.verdict.aggregate_score
        {
            second
        } else {
            first
        };
        let low_confidence = !chosen.verdict.accepted;
        trace.advance(QueryState::Ready { low_confidence });
        Ok(respond(chosen, true, trace))
    }

    fn widen(&self, primary: &SearchParams) -> SearchParams {
        let multiplier = self.quality.fallback_k_multiplier.max(1);
        let lowered = (primary.similarity_threshold - self.quality.fallback_threshold_delta)
            .max(self.quality.min_similarity_threshold)
            .min(primary.similarity_threshold);
        let keyword_query = if self.quality.expand_terms {
            self.expander.expand(&primary.keyword_query)
        } else {
            primary.keyword_query.clone()
        };
        SearchParams {
            vector_query: primary.vector_query.clone(),
            keyword_query,
            vector_k: primary.vector_k.saturating_mul(multiplier),
            keyword_k: primary.keyword_k.saturating_mul(multiplier),
            similarity_threshold: lowered,
        }
    }

    async fn attempt(
        &self,
        project_id: &str,
        params: &SearchParams,
        limit: usize,
        cancel: &CancellationToken,
        trace: &mut QueryTrace,
    ) -> Result<Attempt> {
        let set = self.retriever.retrieve(project_id, params, cancel).await?;

        trace.advance(QueryState::Fusing);
        let fused = fuse(&set.vector_hits, &set.keyword_hits, self.retrieval.k_const);
        let outcome = ReadThroughResolver::new(self.store.as_ref(), self.retrieval.overfetch)
            .resolve(&fused, limit)
            .await
            .map_err(Error::from_backend)?;

        trace.advance(QueryState::QualityCheck);
        let verdict = self.gate.evaluate(&outcome.resolved, self.quality.threshold);
        debug!(
            project_id,
            vector_hits = set.vector_hits.len(),
            keyword_hits = set.keyword_hits.len(),
            resolved = outcome.resolved.len(),
            stale = outcome.stale.len(),
            aggregate = verdict.aggregate_score,
            accepted = verdict.accepted,
            "attempt evaluated"
        );

        let results = outcome
            .resolved
            .into_iter()
            .enumerate()
            .map(|(i, r)| QueryResult {
                chunk_id: r.chunk.chunk_id,
                doc_id: r.chunk.doc_id,
                text: r.chunk.text,
                fused_score: r.fused_score,
                rank: i + 1,
                sources: r.sources,
            })
            .collect();

        Ok(Attempt {
            results,
            verdict,
            vector_status: set.vector_status,
            keyword_status: set.keyword_status,
            stale_dropped: outcome.stale.len(),
        })
    }
}

fn respond(attempt: Attempt, fallback_used: bool, trace: QueryTrace) -> QueryResponse {
    QueryResponse {
        results: attempt.results,
        low_confidence: !attempt.verdict.accepted,
        aggregate_score: attempt.verdict.aggregate_score,
        fallback_used,
        vector_status: attempt.vector_status,
        keyword_status: attempt.keyword_status,
        stale_dropped: attempt.stale_dropped,
        states: trace.states().to_vec(),
    }
}

/// Run [`RetrievalEngine::repair`] every `interval` until `cancel` fires.
pub fn spawn_repair_loop(
    engine: Arc<RetrievalEngine>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = engine.repair().await {
                        warn!(error = %e, "background repair failed");
                    }
                }
            }
        }
        debug!("repair loop stopped");
    })
}

impl RetrievalEngine {
    /// Start the periodic repair task if `repair.interval_secs` is set.
    pub fn start_repair_loop(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        self.repair_interval
            .map(|interval| spawn_repair_loop(self.clone(), interval, cancel))
    }
}
