//! Core data models used throughout the retrieval engine.
//!
//! Documents and chunks are owned by the [`ChunkStore`](crate::store::ChunkStore);
//! everything else here describes what flows between the indexes, the
//! fusion step, and the reconciliation backlog.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Namespace for deterministic chunk ids.
const CHUNK_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a7e_93d4_4b0a_8e55_0d3c_71a9_e2b4);

/// Derive the chunk id for a `(doc_id, chunk_index)` pair.
///
/// The id is a UUIDv5, so concurrent writers of the same pair compute the
/// same value and converge on one row without coordination.
pub fn chunk_id_for(doc_id: &str, chunk_index: i64) -> String {
    let name = format!("{}:{}", doc_id, chunk_index);
    Uuid::new_v5(&CHUNK_ID_NAMESPACE, name.as_bytes()).to_string()
}

/// Metadata for a document about to be created.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub project_id: String,
    pub filename: String,
    pub checksum: String,
}

/// A stored document. `version` increases monotonically per
/// `(project_id, filename)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub doc_id: String,
    pub project_id: String,
    pub filename: String,
    pub version: i64,
    pub checksum: String,
    pub created_at: i64,
}

/// A chunk about to be ingested.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub doc_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub page: i64,
    pub start_char: i64,
    pub end_char: i64,
}

/// An immutable chunk of document text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub page: i64,
    pub start_char: i64,
    pub end_char: i64,
    pub created_at: i64,
}

/// A chunk together with the project of its owning document, as needed
/// to build index entries.
#[derive(Debug, Clone)]
pub struct IndexableChunk {
    pub chunk: Chunk,
    pub project_id: String,
}

/// Result of [`ChunkStore::insert_chunk`](crate::store::ChunkStore::insert_chunk).
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    /// The stored row, which is the earlier one when the insert was a no-op.
    pub chunk: Chunk,
    /// `false` when the `(doc_id, chunk_index)` row already existed.
    pub created: bool,
}

/// Which ranked list a hit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitSource {
    Vector,
    Keyword,
}

/// One entry of a ranked list returned by an index.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalHit {
    pub chunk_id: String,
    /// 1-based position within its source list.
    pub rank: usize,
    /// Backend-native score (cosine similarity or negated BM25).
    pub raw_score: f64,
    pub source: HitSource,
}

/// A chunk id after Reciprocal Rank Fusion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedResult {
    pub chunk_id: String,
    pub fused_score: f64,
    pub contributing_sources: Vec<HitSource>,
    /// Best (lowest) rank across contributing sources.
    pub best_rank: usize,
}

/// A fused result resolved back to authoritative text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedChunk {
    pub chunk: Chunk,
    pub fused_score: f64,
    pub sources: Vec<HitSource>,
}

/// Whether every index acknowledged a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyStatus {
    Consistent,
    /// The primary write committed but at least one index write failed or
    /// timed out; the chunk is queued for repair.
    Degraded,
}

/// The derived indexes kept in step with the chunk store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Vector,
    Keyword,
}

impl IndexKind {
    pub const ALL: [IndexKind; 2] = [IndexKind::Vector, IndexKind::Keyword];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Vector => "vector",
            IndexKind::Keyword => "keyword",
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vector" => Ok(IndexKind::Vector),
            "keyword" => Ok(IndexKind::Keyword),
            other => Err(Error::InvalidInput(format!("unknown index kind: {}", other))),
        }
    }
}

/// What a backlog entry asks the repair pass to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BacklogOp {
    /// Re-issue a missing index write.
    Upsert,
    /// Remove an index entry whose chunk was deleted.
    Remove,
}

impl BacklogOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BacklogOp::Upsert => "upsert",
            BacklogOp::Remove => "remove",
        }
    }
}

impl FromStr for BacklogOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upsert" => Ok(BacklogOp::Upsert),
            "remove" => Ok(BacklogOp::Remove),
            other => Err(Error::InvalidInput(format!("unknown backlog op: {}", other))),
        }
    }
}

/// Identity of a backlog entry. At most one entry exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BacklogKey {
    pub chunk_id: String,
    pub index: IndexKind,
    pub op: BacklogOp,
}

/// A pending reconciliation task.
#[derive(Debug, Clone, PartialEq)]
pub struct BacklogEntry {
    pub chunk_id: String,
    pub index: IndexKind,
    pub op: BacklogOp,
    pub project_id: String,
    pub doc_id: String,
    pub reason: String,
    pub attempts: u32,
    pub enqueued_at: i64,
}

impl BacklogEntry {
    pub fn new(
        chunk_id: &str,
        index: IndexKind,
        op: BacklogOp,
        project_id: &str,
        doc_id: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            chunk_id: chunk_id.to_string(),
            index,
            op,
            project_id: project_id.to_string(),
            doc_id: doc_id.to_string(),
            reason: reason.into(),
            attempts: 0,
            enqueued_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn key(&self) -> BacklogKey {
        BacklogKey {
            chunk_id: self.chunk_id.clone(),
            index: self.index,
            op: self.op,
        }
    }
}

/// An embedding destined for the vector index. Never carries chunk text.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub chunk_id: String,
    pub doc_id: String,
    pub project_id: String,
    pub vector: Vec<f32>,
    pub model_version: String,
}

/// A lexical posting destined for the keyword index.
#[derive(Debug, Clone)]
pub struct KeywordEntry {
    pub chunk_id: String,
    pub doc_id: String,
    pub project_id: String,
    pub text: String,
}
