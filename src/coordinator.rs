//! Dual-write coordination between the chunk store and the two indexes.
//!
//! The chunk store write is the only one that can fail an ingest. Once it
//! commits, the vector and keyword writes run concurrently under their own
//! deadlines; a failure or timeout there marks the receipt
//! [`ConsistencyStatus::Degraded`] and queues the chunk in the durable
//! reconciliation backlog. The primary write is never rolled back.
//!
//! [`DualWriteCoordinator::repair`] drains the backlog and then scans the
//! chunk store's confirmation ledger for chunks an index has not
//! acknowledged (including vectors produced by an older embedding model).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use retrieval_core::embedding::{embed_one, EmbeddingFunction};
use retrieval_core::models::{
    BacklogEntry, BacklogKey, BacklogOp, Chunk, ConsistencyStatus, IndexKind, IndexableChunk,
    KeywordEntry, NewChunk, VectorEntry,
};
use retrieval_core::store::{ChunkStore, KeywordIndex, ReconciliationBacklog, VectorIndex};
use retrieval_core::Error;

/// Result of one [`DualWriteCoordinator::ingest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReceipt {
    pub chunk_id: String,
    /// `false` when the `(doc_id, chunk_index)` pair already existed.
    pub created: bool,
    pub consistency_status: ConsistencyStatus,
    pub degraded_indexes: Vec<IndexKind>,
}

/// Counters from one [`DualWriteCoordinator::repair`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// Secondary writes re-issued successfully.
    pub repaired_count: usize,
    /// Index entries of deleted chunks removed.
    pub removed_count: usize,
    pub failed_count: usize,
    /// Backlog entries already past `max_attempts` when the pass started,
    /// left for an operator.
    pub skipped_count: usize,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        *self == RepairReport::default()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteSettings {
    pub vector_timeout: Duration,
    pub keyword_timeout: Duration,
    pub repair_batch_size: usize,
    pub max_attempts: u32,
}

pub struct DualWriteCoordinator {
    store: Arc<dyn ChunkStore>,
    backlog: Arc<dyn ReconciliationBacklog>,
    vectors: Arc<dyn VectorIndex>,
    keywords: Arc<dyn KeywordIndex>,
    embedder: Arc<dyn EmbeddingFunction>,
    settings: WriteSettings,
}

impl DualWriteCoordinator {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        backlog: Arc<dyn ReconciliationBacklog>,
        vectors: Arc<dyn VectorIndex>,
        keywords: Arc<dyn KeywordIndex>,
        embedder: Arc<dyn EmbeddingFunction>,
        settings: WriteSettings,
    ) -> Self {
        Self {
            store,
            backlog,
            vectors,
            keywords,
            embedder,
            settings,
        }
    }

    /// Write a chunk to the chunk store, then to both indexes.
    ///
    /// Fails only if the chunk store write fails. A repeated ingest of the
    /// same `(doc_id, chunk_index)` re-indexes the stored chunk.
    pub async fn ingest(&self, project_id: &str, chunk: &NewChunk) -> Result<IngestReceipt, Error> {
        let outcome = self
            .store
            .insert_chunk(chunk)
            .await
            .map_err(Error::from_primary_write)?;

        let item = IndexableChunk {
            chunk: outcome.chunk,
            project_id: project_id.to_string(),
        };
        let failures = self.index_chunk(&item).await;

        let degraded_indexes: Vec<IndexKind> = failures.iter().map(|(kind, _)| *kind).collect();
        if !failures.is_empty() {
            let entries: Vec<BacklogEntry> = failures
                .iter()
                .map(|(kind, reason)| {
                    BacklogEntry::new(
                        &item.chunk.chunk_id,
                        *kind,
                        BacklogOp::Upsert,
                        project_id,
                        &item.chunk.doc_id,
                        reason.clone(),
                    )
                })
                .collect();
            // The confirmation ledger still lists the chunk as unindexed, so
            // repair finds it even if this enqueue is lost.
            if let Err(e) = self.backlog.enqueue(&entries).await {
                warn!(chunk_id = %item.chunk.chunk_id, error = %format!("{:#}", e), "failed to enqueue reconciliation entries");
            }
        }

        Ok(IngestReceipt {
            chunk_id: item.chunk.chunk_id,
            created: outcome.created,
            consistency_status: if degraded_indexes.is_empty() {
                ConsistencyStatus::Consistent
            } else {
                ConsistencyStatus::Degraded
            },
            degraded_indexes,
        })
    }

    /// Delete a document and remove its chunks from both indexes.
    ///
    /// `Remove` entries are made durable before the delete, so an index
    /// that misses the removal is cleaned up by a later repair.
    pub async fn delete_document(&self, project_id: &str, doc_id: &str) -> Result<usize, Error> {
        let chunk_ids = self
            .store
            .chunk_ids_for_document(doc_id)
            .await
            .map_err(Error::from_backend)?;

        let entries: Vec<BacklogEntry> = chunk_ids
            .iter()
            .flat_map(|chunk_id| {
                IndexKind::ALL.into_iter().map(move |kind| {
                    BacklogEntry::new(
                        chunk_id,
                        kind,
                        BacklogOp::Remove,
                        project_id,
                        doc_id,
                        "document deleted",
                    )
                })
            })
            .collect();
        self.backlog
            .enqueue(&entries)
            .await
            .map_err(Error::from_backend)?;

        let removed = self
            .store
            .delete_document(doc_id)
            .await
            .map_err(Error::from_primary_write)?;

        if chunk_ids.is_empty() {
            return Ok(removed);
        }

        let (vector, keyword) = tokio::join!(
            bounded(self.settings.vector_timeout, self.vectors.remove(&chunk_ids)),
            bounded(self.settings.keyword_timeout, self.keywords.remove(&chunk_ids)),
        );

        let mut resolved = Vec::new();
        for (kind, result) in [(IndexKind::Vector, vector), (IndexKind::Keyword, keyword)] {
            match result {
                Ok(()) => resolved.extend(chunk_ids.iter().map(|chunk_id| BacklogKey {
                    chunk_id: chunk_id.clone(),
                    index: kind,
                    op: BacklogOp::Remove,
                })),
                Err(reason) => {
                    warn!(doc_id, index = %kind, error = %reason, "index removal failed; left for repair")
                }
            }
        }
        if let Err(e) = self.backlog.resolve(&resolved).await {
            warn!(doc_id, error = %format!("{:#}", e), "failed to resolve removal entries");
        }

        Ok(removed)
    }

    /// Re-issue every secondary write still owed.
    pub async fn repair(&self) -> Result<RepairReport, Error> {
        let mut report = RepairReport {
            skipped_count: self
                .backlog
                .exhausted(self.settings.max_attempts)
                .await
                .map_err(Error::from_backend)?,
            ..RepairReport::default()
        };
        if report.skipped_count > 0 {
            warn!(
                entries = report.skipped_count,
                max_attempts = self.settings.max_attempts,
                "reconciliation entries exceeded max attempts; skipping"
            );
        }

        let pending = self
            .backlog
            .pending(self.settings.repair_batch_size, self.settings.max_attempts)
            .await
            .map_err(Error::from_backend)?;

        if !pending.is_empty() {
            let mut ids: Vec<String> = pending.iter().map(|e| e.chunk_id.clone()).collect();
            ids.sort();
            ids.dedup();
            let present: HashMap<String, Chunk> = self
                .store
                .get_chunks_by_ids(&ids)
                .await
                .map_err(Error::from_backend)?
                .into_iter()
                .map(|c| (c.chunk_id.clone(), c))
                .collect();

            let mut resolved = Vec::new();
            for entry in pending {
                let result = match (entry.op, present.get(&entry.chunk_id)) {
                    // Chunk still exists, so its index entry stays.
                    (BacklogOp::Remove, Some(_)) => None,
                    // Chunk deleted. An upsert that landed after the delete
                    // left an entry behind, so both ops clear the index.
                    (_, None) => {
                        let ids = std::slice::from_ref(&entry.chunk_id);
                        let result = match entry.index {
                            IndexKind::Vector => {
                                bounded(self.settings.vector_timeout, self.vectors.remove(ids)).await
                            }
                            IndexKind::Keyword => {
                                bounded(self.settings.keyword_timeout, self.keywords.remove(ids))
                                    .await
                            }
                        };
                        if result.is_ok() {
                            report.removed_count += 1;
                        }
                        Some(result)
                    }
                    (BacklogOp::Upsert, Some(chunk)) => {
                        let item = IndexableChunk {
                            chunk: chunk.clone(),
                            project_id: entry.project_id.clone(),
                        };
                        let result = self.write_index(entry.index, &item).await;
                        if result.is_ok() {
                            report.repaired_count += 1;
                        }
                        Some(result)
                    }
                };

                match result {
                    None | Some(Ok(())) => resolved.push(entry.key()),
                    Some(Err(reason)) => {
                        report.failed_count += 1;
                        warn!(chunk_id = %entry.chunk_id, index = %entry.index, error = %reason, "repair attempt failed");
                        self.backlog
                            .record_attempt(&entry.key(), &reason)
                            .await
                            .map_err(Error::from_backend)?;
                    }
                }
            }
            self.backlog
                .resolve(&resolved)
                .await
                .map_err(Error::from_backend)?;
        }

        for kind in IndexKind::ALL {
            let model_version = match kind {
                IndexKind::Vector => Some(self.embedder.model_version()),
                IndexKind::Keyword => None,
            };
            let unconfirmed = self
                .store
                .unconfirmed_chunks(kind, model_version, self.settings.repair_batch_size)
                .await
                .map_err(Error::from_backend)?;

            for item in unconfirmed {
                match self.write_index(kind, &item).await {
                    Ok(()) => report.repaired_count += 1,
                    Err(reason) => {
                        report.failed_count += 1;
                        warn!(chunk_id = %item.chunk.chunk_id, index = %kind, error = %reason, "repair attempt failed");
                        let entry = BacklogEntry::new(
                            &item.chunk.chunk_id,
                            kind,
                            BacklogOp::Upsert,
                            &item.project_id,
                            &item.chunk.doc_id,
                            reason,
                        );
                        self.backlog
                            .enqueue(std::slice::from_ref(&entry))
                            .await
                            .map_err(Error::from_backend)?;
                    }
                }
            }
        }

        if report.is_clean() {
            debug!("repair pass found nothing to do");
        } else {
            info!(
                repaired = report.repaired_count,
                removed = report.removed_count,
                failed = report.failed_count,
                skipped = report.skipped_count,
                "repair pass complete"
            );
        }
        Ok(report)
    }

    /// Write both indexes concurrently; returns the ones that failed.
    async fn index_chunk(&self, item: &IndexableChunk) -> Vec<(IndexKind, String)> {
        let (vector, keyword) = tokio::join!(
            self.write_index(IndexKind::Vector, item),
            self.write_index(IndexKind::Keyword, item),
        );

        let mut failures = Vec::new();
        for (kind, result) in [(IndexKind::Vector, vector), (IndexKind::Keyword, keyword)] {
            if let Err(reason) = result {
                warn!(
                    chunk_id = %item.chunk.chunk_id,
                    project_id = %item.project_id,
                    index = %kind,
                    error = %reason,
                    "secondary write failed; chunk queued for repair"
                );
                failures.push((kind, reason));
            }
        }
        failures
    }

    /// One bounded index write followed by its confirmation.
    async fn write_index(&self, kind: IndexKind, item: &IndexableChunk) -> Result<(), String> {
        match kind {
            IndexKind::Vector => {
                bounded(self.settings.vector_timeout, self.write_vector(item)).await
            }
            IndexKind::Keyword => {
                bounded(self.settings.keyword_timeout, self.write_keyword(item)).await
            }
        }
    }

    async fn write_vector(&self, item: &IndexableChunk) -> anyhow::Result<()> {
        let model_version = self.embedder.model_version();
        let vector = embed_one(self.embedder.as_ref(), &item.chunk.text).await?;
        self.vectors
            .upsert(&VectorEntry {
                chunk_id: item.chunk.chunk_id.clone(),
                doc_id: item.chunk.doc_id.clone(),
                project_id: item.project_id.clone(),
                vector,
                model_version: model_version.to_string(),
            })
            .await?;
        self.store
            .mark_indexed(&item.chunk.chunk_id, IndexKind::Vector, Some(model_version))
            .await
    }

    async fn write_keyword(&self, item: &IndexableChunk) -> anyhow::Result<()> {
        self.keywords
            .upsert(&KeywordEntry {
                chunk_id: item.chunk.chunk_id.clone(),
                doc_id: item.chunk.doc_id.clone(),
                project_id: item.project_id.clone(),
                text: item.chunk.text.clone(),
            })
            .await?;
        self.store
            .mark_indexed(&item.chunk.chunk_id, IndexKind::Keyword, None)
            .await
    }
}

async fn bounded<F>(timeout: Duration, write: F) -> Result<(), String>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match tokio::time::timeout(timeout, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
    }
}
