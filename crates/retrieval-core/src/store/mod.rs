//! Storage abstractions for the retrieval engine.
//!
//! Three heterogeneous stores sit behind narrow traits so deployments can
//! swap backends without the fusion or quality-gate logic knowing which is
//! active:
//!
//! | Trait | Role |
//! |-------|------|
//! | [`ChunkStore`] | Authoritative, transactional store of documents and chunks |
//! | [`VectorIndex`] | Nearest-neighbour index over chunk embeddings (ids only, no text) |
//! | [`KeywordIndex`] | Ranked lexical (BM25-class) search over chunk text |
//! | [`ReconciliationBacklog`] | Durable queue of index writes still owed |
//!
//! The chunk store is the only source of truth. Index contents are derived
//! and rebuildable from it; any id an index returns is re-resolved against
//! the chunk store before it reaches a caller.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    BacklogEntry, BacklogKey, Chunk, Document, IndexKind, IndexableChunk, InsertOutcome,
    KeywordEntry, NewChunk, NewDocument, RetrievalHit, VectorEntry,
};

/// Authoritative store of documents and chunks.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_document`](ChunkStore::create_document) | Insert a document, assigning the next version for its filename |
/// | [`insert_chunk`](ChunkStore::insert_chunk) | Transactional, idempotent chunk insert |
/// | [`get_chunks_by_ids`](ChunkStore::get_chunks_by_ids) | Batched fetch in input order |
/// | [`delete_document`](ChunkStore::delete_document) | Cascade delete of a document and its chunks |
/// | [`mark_indexed`](ChunkStore::mark_indexed) | Record that an index acknowledged a chunk |
/// | [`unconfirmed_chunks`](ChunkStore::unconfirmed_chunks) | Chunks an index has not acknowledged |
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Create a document. `version` is one more than the highest existing
    /// version for the same `(project_id, filename)`.
    async fn create_document(&self, doc: &NewDocument) -> Result<Document>;

    async fn get_document(&self, doc_id: &str) -> Result<Option<Document>>;

    /// Insert a chunk, atomically with respect to its owning document.
    ///
    /// Idempotent on `(doc_id, chunk_index)`: a repeated or concurrent
    /// insert returns the existing row with `created = false`. Fails with
    /// [`Error::NotFound`](crate::Error::NotFound) for an unknown `doc_id`.
    async fn insert_chunk(&self, chunk: &NewChunk) -> Result<InsertOutcome>;

    /// Fetch chunks by id, preserving input order. Missing ids are absent
    /// from the output; that is not an error.
    async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>>;

    async fn chunk_ids_for_document(&self, doc_id: &str) -> Result<Vec<String>>;

    /// Delete a document and, by cascade, its chunks and index
    /// confirmations. Returns the number of chunks removed. Fails with
    /// [`Error::NotFound`](crate::Error::NotFound) for an unknown `doc_id`.
    async fn delete_document(&self, doc_id: &str) -> Result<usize>;

    /// Record that `index` holds an up-to-date entry for `chunk_id`.
    /// Vector confirmations carry the embedding model version.
    async fn mark_indexed(
        &self,
        chunk_id: &str,
        index: IndexKind,
        model_version: Option<&str>,
    ) -> Result<()>;

    /// Chunks with no confirmation for `index`, or, when `model_version`
    /// is given, a confirmation produced by a different model version.
    /// Chunks with a queued upsert for `index` are left to the backlog.
    async fn unconfirmed_chunks(
        &self,
        index: IndexKind,
        model_version: Option<&str>,
        limit: usize,
    ) -> Result<Vec<IndexableChunk>>;
}

/// Nearest-neighbour index over chunk embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, entry: &VectorEntry) -> Result<()>;

    async fn remove(&self, chunk_ids: &[String]) -> Result<()>;

    /// Up to `k` hits within `project_id` whose cosine similarity is at
    /// least `similarity_threshold`, ranked by similarity descending.
    async fn search(
        &self,
        query_vec: &[f32],
        project_id: &str,
        k: usize,
        similarity_threshold: f64,
    ) -> Result<Vec<RetrievalHit>>;
}

/// Ranked lexical search.
///
/// May be a dedicated engine or full-text indexing colocated with the
/// chunk store; both satisfy this interface.
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    async fn upsert(&self, entry: &KeywordEntry) -> Result<()>;

    async fn remove(&self, chunk_ids: &[String]) -> Result<()>;

    /// Up to `k` hits within `project_id`, best match first. Any query
    /// term may match.
    async fn search(&self, query: &str, project_id: &str, k: usize) -> Result<Vec<RetrievalHit>>;
}

/// Durable queue of index writes that still have to happen.
///
/// At most one entry exists per [`BacklogKey`]; enqueueing an existing
/// key refreshes its reason and keeps its attempt count.
#[async_trait]
pub trait ReconciliationBacklog: Send + Sync {
    async fn enqueue(&self, entries: &[BacklogEntry]) -> Result<()>;

    /// Oldest entries first, leaving out those already tried
    /// `max_attempts` times.
    async fn pending(&self, limit: usize, max_attempts: u32) -> Result<Vec<BacklogEntry>>;

    /// Number of entries tried at least `max_attempts` times.
    async fn exhausted(&self, max_attempts: u32) -> Result<usize>;

    async fn resolve(&self, keys: &[BacklogKey]) -> Result<()>;

    async fn record_attempt(&self, key: &BacklogKey, error: &str) -> Result<()>;
}

/// Assign 1-based ranks in list order.
pub fn assign_ranks(hits: &mut [RetrievalHit]) {
    for (i, hit) in hits.iter_mut().enumerate() {
        hit.rank = i + 1;
    }
}
