//! Read-through resolution of fused ids back to authoritative text.
//!
//! Indexes only hold ids; the chunk store holds the text. The resolver
//! walks the fused ranking in windows, fetching each window with one
//! batched [`ChunkStore::get_chunks_by_ids`] call. Ids the chunk store no
//! longer knows are stale index entries: they are logged and dropped,
//! and the next window backfills the shortfall. Each window is at least
//! twice as wide as the last, so a long run of stale ids costs a
//! logarithmic number of fetches.

use std::collections::HashMap;

use anyhow::Result;
use tracing::warn;

use crate::models::{FusedResult, ResolvedChunk};
use crate::store::ChunkStore;

/// Outcome of one [`ReadThroughResolver::resolve`] call.
#[derive(Debug, Clone, Default)]
pub struct ResolveOutcome {
    /// Resolved chunks in fused order, at most `limit` of them.
    pub resolved: Vec<ResolvedChunk>,
    /// Ids the chunk store could not resolve.
    pub stale: Vec<String>,
    /// Number of batched fetches issued.
    pub fetches: usize,
}

pub struct ReadThroughResolver<'a> {
    store: &'a dyn ChunkStore,
    overfetch: usize,
}

impl<'a> ReadThroughResolver<'a> {
    /// `overfetch` extra ids are requested per window beyond what is still
    /// needed, so a few stale entries do not force another round trip.
    pub fn new(store: &'a dyn ChunkStore, overfetch: usize) -> Self {
        Self { store, overfetch }
    }

    pub async fn resolve(&self, fused: &[FusedResult], limit: usize) -> Result<ResolveOutcome> {
        let mut outcome = ResolveOutcome::default();
        let mut cursor = 0;
        let mut width = 0usize;

        while outcome.resolved.len() < limit && cursor < fused.len() {
            let remaining = limit - outcome.resolved.len();
            width = (remaining + self.overfetch).max(width.saturating_mul(2));
            let end = cursor.saturating_add(width).min(fused.len());
            let window = &fused[cursor..end];
            cursor = end;

            let ids: Vec<String> = window.iter().map(|f| f.chunk_id.clone()).collect();
            let chunks = self.store.get_chunks_by_ids(&ids).await?;
            outcome.fetches += 1;

            let mut by_id: HashMap<String, _> = chunks
                .into_iter()
                .map(|c| (c.chunk_id.clone(), c))
                .collect();

            for candidate in window {
                match by_id.remove(&candidate.chunk_id) {
                    Some(chunk) => {
                        if outcome.resolved.len() < limit {
                            outcome.resolved.push(ResolvedChunk {
                                chunk,
                                fused_score: candidate.fused_score,
                                sources: candidate.contributing_sources.clone(),
                            });
                        }
                    }
                    None => {
                        warn!(chunk_id = %candidate.chunk_id, "dropping stale index entry");
                        outcome.stale.push(candidate.chunk_id.clone());
                    }
                }
            }
        }

        Ok(outcome)
    }
}
