//! In-memory backends for testing and for hosts without SQLite.
//!
//! State lives behind `std::sync::RwLock`. The chunk store keeps documents,
//! chunks, and index confirmations under one lock so chunk inserts are
//! atomic with respect to their document. Vector search is brute-force
//! cosine similarity; keyword search is Okapi BM25 over [`tokenize`]d text.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::error::Error;
use crate::models::{
    chunk_id_for, BacklogEntry, BacklogKey, BacklogOp, Chunk, Document, HitSource, IndexKind,
    IndexableChunk, InsertOutcome, KeywordEntry, NewChunk, NewDocument, RetrievalHit, VectorEntry,
};
use crate::text::tokenize;

use super::{assign_ranks, ChunkStore, KeywordIndex, ReconciliationBacklog, VectorIndex};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Default)]
struct StoreState {
    docs: HashMap<String, Document>,
    /// Ordered by `(doc_id, chunk_index)`.
    chunks: BTreeMap<(String, i64), Chunk>,
    by_id: HashMap<String, (String, i64)>,
    confirmations: HashMap<(String, IndexKind), Option<String>>,
}

/// In-memory [`ChunkStore`] that also serves as the reconciliation backlog.
#[derive(Default)]
pub struct InMemoryChunkStore {
    state: RwLock<StoreState>,
    backlog: RwLock<HashMap<BacklogKey, BacklogEntry>>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a chunk row without touching any index. Simulates an index
    /// entry going stale.
    pub fn purge_chunk(&self, chunk_id: &str) -> Result<bool> {
        let mut state = write(&self.state)?;
        let Some(key) = state.by_id.remove(chunk_id) else {
            return Ok(false);
        };
        state.chunks.remove(&key);
        state
            .confirmations
            .retain(|(id, _), _| id.as_str() != chunk_id);
        Ok(true)
    }
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn create_document(&self, doc: &NewDocument) -> Result<Document> {
        let mut state = write(&self.state)?;
        let version = state
            .docs
            .values()
            .filter(|d| d.project_id == doc.project_id && d.filename == doc.filename)
            .map(|d| d.version)
            .max()
            .unwrap_or(0)
            + 1;
        let document = Document {
            doc_id: Uuid::new_v4().to_string(),
            project_id: doc.project_id.clone(),
            filename: doc.filename.clone(),
            version,
            checksum: doc.checksum.clone(),
            created_at: now(),
        };
        state
            .docs
            .insert(document.doc_id.clone(), document.clone());
        Ok(document)
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        Ok(read(&self.state)?.docs.get(doc_id).cloned())
    }

    async fn insert_chunk(&self, chunk: &NewChunk) -> Result<InsertOutcome> {
        let mut state = write(&self.state)?;
        if !state.docs.contains_key(&chunk.doc_id) {
            return Err(Error::not_found(&chunk.doc_id).into());
        }
        let key = (chunk.doc_id.clone(), chunk.chunk_index);
        if let Some(existing) = state.chunks.get(&key) {
            return Ok(InsertOutcome {
                chunk: existing.clone(),
                created: false,
            });
        }
        let stored = Chunk {
            chunk_id: chunk_id_for(&chunk.doc_id, chunk.chunk_index),
            doc_id: chunk.doc_id.clone(),
            chunk_index: chunk.chunk_index,
            text: chunk.text.clone(),
            page: chunk.page,
            start_char: chunk.start_char,
            end_char: chunk.end_char,
            created_at: now(),
        };
        state.by_id.insert(stored.chunk_id.clone(), key.clone());
        state.chunks.insert(key, stored.clone());
        Ok(InsertOutcome {
            chunk: stored,
            created: true,
        })
    }

    async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let state = read(&self.state)?;
        Ok(ids
            .iter()
            .filter_map(|id| state.by_id.get(id))
            .filter_map(|key| state.chunks.get(key))
            .cloned()
            .collect())
    }

    async fn chunk_ids_for_document(&self, doc_id: &str) -> Result<Vec<String>> {
        let state = read(&self.state)?;
        Ok(state
            .chunks
            .values()
            .filter(|c| c.doc_id == doc_id)
            .map(|c| c.chunk_id.clone())
            .collect())
    }

    async fn delete_document(&self, doc_id: &str) -> Result<usize> {
        let mut state = write(&self.state)?;
        if state.docs.remove(doc_id).is_none() {
            return Err(Error::not_found(doc_id).into());
        }
        let removed: Vec<(String, i64)> = state
            .chunks
            .keys()
            .filter(|(d, _)| d == doc_id)
            .cloned()
            .collect();
        let mut removed_ids = HashSet::new();
        for key in &removed {
            if let Some(chunk) = state.chunks.remove(key) {
                state.by_id.remove(&chunk.chunk_id);
                removed_ids.insert(chunk.chunk_id);
            }
        }
        state
            .confirmations
            .retain(|(id, _), _| !removed_ids.contains(id));
        Ok(removed.len())
    }

    async fn mark_indexed(
        &self,
        chunk_id: &str,
        index: IndexKind,
        model_version: Option<&str>,
    ) -> Result<()> {
        let mut state = write(&self.state)?;
        if !state.by_id.contains_key(chunk_id) {
            return Err(anyhow!("cannot confirm unknown chunk {}", chunk_id));
        }
        state.confirmations.insert(
            (chunk_id.to_string(), index),
            model_version.map(str::to_string),
        );
        Ok(())
    }

    async fn unconfirmed_chunks(
        &self,
        index: IndexKind,
        model_version: Option<&str>,
        limit: usize,
    ) -> Result<Vec<IndexableChunk>> {
        let queued: HashSet<String> = read(&self.backlog)?
            .keys()
            .filter(|key| key.index == index && key.op == BacklogOp::Upsert)
            .map(|key| key.chunk_id.clone())
            .collect();
        let state = read(&self.state)?;
        let mut out = Vec::new();
        for chunk in state.chunks.values() {
            if out.len() >= limit {
                break;
            }
            if queued.contains(&chunk.chunk_id) {
                continue;
            }
            let confirmed = match state.confirmations.get(&(chunk.chunk_id.clone(), index)) {
                None => false,
                Some(stored) => match model_version {
                    Some(current) => stored.as_deref() == Some(current),
                    None => true,
                },
            };
            if confirmed {
                continue;
            }
            let Some(doc) = state.docs.get(&chunk.doc_id) else {
                continue;
            };
            out.push(IndexableChunk {
                chunk: chunk.clone(),
                project_id: doc.project_id.clone(),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl ReconciliationBacklog for InMemoryChunkStore {
    async fn enqueue(&self, entries: &[BacklogEntry]) -> Result<()> {
        let mut backlog = write(&self.backlog)?;
        for entry in entries {
            backlog
                .entry(entry.key())
                .and_modify(|existing| {
                    existing.reason = entry.reason.clone();
                    existing.project_id = entry.project_id.clone();
                    existing.doc_id = entry.doc_id.clone();
                })
                .or_insert_with(|| entry.clone());
        }
        Ok(())
    }

    async fn pending(&self, limit: usize, max_attempts: u32) -> Result<Vec<BacklogEntry>> {
        let backlog = read(&self.backlog)?;
        let mut entries: Vec<BacklogEntry> = backlog
            .values()
            .filter(|e| e.attempts < max_attempts)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
                .then_with(|| a.index.as_str().cmp(b.index.as_str()))
                .then_with(|| a.op.as_str().cmp(b.op.as_str()))
        });
        entries.truncate(limit);
        Ok(entries)
    }

    async fn exhausted(&self, max_attempts: u32) -> Result<usize> {
        let backlog = read(&self.backlog)?;
        Ok(backlog.values().filter(|e| e.attempts >= max_attempts).count())
    }

    async fn resolve(&self, keys: &[BacklogKey]) -> Result<()> {
        let mut backlog = write(&self.backlog)?;
        for key in keys {
            backlog.remove(key);
        }
        Ok(())
    }

    async fn record_attempt(&self, key: &BacklogKey, error: &str) -> Result<()> {
        let mut backlog = write(&self.backlog)?;
        if let Some(entry) = backlog.get_mut(key) {
            entry.attempts += 1;
            entry.reason = error.to_string();
        }
        Ok(())
    }
}

/// Brute-force cosine [`VectorIndex`].
#[derive(Default)]
pub struct InMemoryVectorIndex {
    entries: RwLock<HashMap<String, VectorEntry>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        read(&self.entries)
            .map(|entries| entries.contains_key(chunk_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        read(&self.entries).map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Model version recorded for a chunk's vector, if present.
    pub fn model_version_of(&self, chunk_id: &str) -> Option<String> {
        read(&self.entries)
            .ok()
            .and_then(|entries| entries.get(chunk_id).map(|e| e.model_version.clone()))
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, entry: &VectorEntry) -> Result<()> {
        write(&self.entries)?.insert(entry.chunk_id.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, chunk_ids: &[String]) -> Result<()> {
        let mut entries = write(&self.entries)?;
        for id in chunk_ids {
            entries.remove(id);
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
        let entries = read(&self.entries)?;
        let mut hits: Vec<RetrievalHit> = entries
            .values()
            .filter(|e| e.project_id == project_id)
            .map(|e| RetrievalHit {
                chunk_id: e.chunk_id.clone(),
                rank: 0,
                raw_score: cosine_similarity(query_vec, &e.vector) as f64,
                source: HitSource::Vector,
            })
            .filter(|h| h.raw_score >= similarity_threshold)
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        assign_ranks(&mut hits);
        Ok(hits)
    }
}

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

struct Posting {
    project_id: String,
    term_freqs: HashMap<String, usize>,
    length: usize,
}

/// Okapi BM25 [`KeywordIndex`].
#[derive(Default)]
pub struct InMemoryKeywordIndex {
    postings: RwLock<HashMap<String, Posting>>,
}

impl InMemoryKeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        read(&self.postings)
            .map(|p| p.contains_key(chunk_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl KeywordIndex for InMemoryKeywordIndex {
    async fn upsert(&self, entry: &KeywordEntry) -> Result<()> {
        let tokens = tokenize(&entry.text);
        let mut term_freqs = HashMap::new();
        for token in &tokens {
            *term_freqs.entry(token.clone()).or_insert(0) += 1;
        }
        write(&self.postings)?.insert(
            entry.chunk_id.clone(),
            Posting {
                project_id: entry.project_id.clone(),
                term_freqs,
                length: tokens.len(),
            },
        );
        Ok(())
    }

    async fn remove(&self, chunk_ids: &[String]) -> Result<()> {
        let mut postings = write(&self.postings)?;
        for id in chunk_ids {
            postings.remove(id);
        }
        Ok(())
    }

    async fn search(&self, query: &str, project_id: &str, k: usize) -> Result<Vec<RetrievalHit>> {
        let mut terms = tokenize(query);
        terms.sort();
        terms.dedup();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let postings = read(&self.postings)?;
        let scoped: Vec<(&String, &Posting)> = postings
            .iter()
            .filter(|(_, p)| p.project_id == project_id)
            .collect();
        if scoped.is_empty() {
            return Ok(Vec::new());
        }

        let n = scoped.len() as f64;
        let avg_len = scoped.iter().map(|(_, p)| p.length).sum::<usize>() as f64 / n;
        let idf: HashMap<&str, f64> = terms
            .iter()
            .map(|t| {
                let df = scoped
                    .iter()
                    .filter(|(_, p)| p.term_freqs.contains_key(t))
                    .count() as f64;
                (t.as_str(), (1.0 + (n - df + 0.5) / (df + 0.5)).ln())
            })
            .collect();

        let mut hits: Vec<RetrievalHit> = scoped
            .iter()
            .filter_map(|(chunk_id, posting)| {
                let mut score = 0.0;
                let mut matched = false;
                for term in &terms {
                    if let Some(&tf) = posting.term_freqs.get(term) {
                        matched = true;
                        let tf = tf as f64;
                        let norm = 1.0 - BM25_B + BM25_B * posting.length as f64 / avg_len.max(1.0);
                        score += idf[term.as_str()] * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * norm);
                    }
                }
                matched.then(|| RetrievalHit {
                    chunk_id: (*chunk_id).clone(),
                    rank: 0,
                    raw_score: score,
                    source: HitSource::Keyword,
                })
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        assign_ranks(&mut hits);
        Ok(hits)
    }
}

fn sort_hits(hits: &mut [RetrievalHit]) {
    hits.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}
