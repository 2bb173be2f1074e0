//! End-to-end tests of the engine over the SQLite deployment.
//!
//! Every test opens a fresh database in a temp directory and drives the
//! public [`RetrievalEngine`] operations: ingestion, versioning, hybrid
//! query, deletion, access control, and model-version re-embedding.

mod common;

use std::sync::Arc;

use common::{count, new_chunk, new_doc, sqlite_backends, test_config};
use hybrid_retrieval::engine::{QueryRequest, RetrievalEngine};
use hybrid_retrieval::sqlite_store::SqliteChunkStore;
use retrieval_core::access::{AllowAll, ProjectGrants};
use retrieval_core::embedding::HashingEmbedder;
use retrieval_core::models::{chunk_id_for, ConsistencyStatus, HitSource, IndexKind};
use retrieval_core::store::ChunkStore;
use retrieval_core::Error;
use tempfile::TempDir;

async fn engine(tmp: &TempDir) -> (RetrievalEngine, sqlx::SqlitePool) {
    let config = test_config(tmp.path());
    let (backends, pool) = sqlite_backends(
        &config,
        Arc::new(HashingEmbedder::new(1024)),
        Arc::new(AllowAll),
    )
    .await
    .unwrap();
    (RetrievalEngine::new(backends, &config), pool)
}

// ─── Ingest and query ───────────────────────────────────────────────

#[tokio::test]
async fn test_ingest_then_query_round_trip() {
    let tmp = TempDir::new().unwrap();
    let (engine, _pool) = engine(&tmp).await;

    let doc = engine
        .create_document("alice", &new_doc("handbook", "deploy.md"))
        .await
        .unwrap();
    let texts = [
        "Deployments roll out through the staging cluster first.",
        "Incident reviews are written within two business days.",
        "Expense reports need a manager signature.",
    ];
    for (i, text) in texts.iter().enumerate() {
        let receipt = engine
            .ingest("alice", &new_chunk(&doc.doc_id, i as i64, text))
            .await
            .unwrap();
        assert!(receipt.created);
        assert_eq!(receipt.consistency_status, ConsistencyStatus::Consistent);
        assert!(receipt.degraded_indexes.is_empty());
    }

    let response = engine
        .query(&QueryRequest::new("alice", "handbook", "staging cluster deployments"))
        .await
        .unwrap();

    let top = &response.results[0];
    assert_eq!(top.chunk_id, chunk_id_for(&doc.doc_id, 0));
    assert_eq!(top.text, texts[0]);
    assert_eq!(top.rank, 1);
    assert_eq!(top.sources, vec![HitSource::Vector, HitSource::Keyword]);
    assert!(!response.low_confidence);
    assert!(!response.fallback_used);
    assert_eq!(response.stale_dropped, 0);
}

#[tokio::test]
async fn test_query_is_deterministic() {
    let tmp = TempDir::new().unwrap();
    let (engine, _pool) = engine(&tmp).await;
    let doc = engine
        .create_document("alice", &new_doc("handbook", "notes.md"))
        .await
        .unwrap();
    for i in 0..6 {
        let text = format!("release note {} for the billing service", i);
        engine
            .ingest("alice", &new_chunk(&doc.doc_id, i, &text))
            .await
            .unwrap();
    }

    let request = QueryRequest::new("alice", "handbook", "billing release");
    let first = engine.query(&request).await.unwrap();
    let second = engine.query(&request).await.unwrap();

    let ids = |r: &hybrid_retrieval::engine::QueryResponse| {
        r.results.iter().map(|h| h.chunk_id.clone()).collect::<Vec<_>>()
    };
    assert!(!first.results.is_empty());
    assert_eq!(ids(&first), ids(&second));
}

#[tokio::test]
async fn test_query_rejects_empty_text() {
    let tmp = TempDir::new().unwrap();
    let (engine, _pool) = engine(&tmp).await;
    let err = engine
        .query(&QueryRequest::new("alice", "handbook", "   "))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_query_respects_max_results() {
    let tmp = TempDir::new().unwrap();
    let (engine, _pool) = engine(&tmp).await;
    let doc = engine
        .create_document("alice", &new_doc("handbook", "many.md"))
        .await
        .unwrap();
    for i in 0..10 {
        engine
            .ingest("alice", &new_chunk(&doc.doc_id, i, &format!("queue worker {}", i)))
            .await
            .unwrap();
    }

    let response = engine
        .query(&QueryRequest::new("alice", "handbook", "queue worker").with_max_results(3))
        .await
        .unwrap();
    assert_eq!(response.results.len(), 3);
    let ranks: Vec<usize> = response.results.iter().map(|r| r.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3]);
}

// ─── Documents ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_document_versions_increase_per_filename() {
    let tmp = TempDir::new().unwrap();
    let (engine, _pool) = engine(&tmp).await;

    let v1 = engine
        .create_document("alice", &new_doc("handbook", "deploy.md"))
        .await
        .unwrap();
    let v2 = engine
        .create_document("alice", &new_doc("handbook", "deploy.md"))
        .await
        .unwrap();
    let other = engine
        .create_document("alice", &new_doc("handbook", "oncall.md"))
        .await
        .unwrap();
    let elsewhere = engine
        .create_document("alice", &new_doc("wiki", "deploy.md"))
        .await
        .unwrap();

    assert_eq!(v1.version, 1);
    assert_eq!(v2.version, 2);
    assert_ne!(v1.doc_id, v2.doc_id);
    assert_eq!(other.version, 1);
    assert_eq!(elsewhere.version, 1);
}

#[tokio::test]
async fn test_ingest_into_unknown_document_fails() {
    let tmp = TempDir::new().unwrap();
    let (engine, pool) = engine(&tmp).await;

    let err = engine
        .ingest("alice", &new_chunk("no-such-doc", 0, "orphan"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM doc_chunk").await, 0);

    // The schema itself refuses orphans too
    let raw = sqlx::query(
        "INSERT INTO doc_chunk (chunk_id, doc_id, chunk_index, text, page, start_char, end_char, created_at)
         VALUES ('c', 'missing', 0, 'x', 1, 0, 1, 0)",
    )
    .execute(&pool)
    .await;
    assert!(raw.is_err());
}

#[tokio::test]
async fn test_ingest_rejects_inverted_char_range() {
    let tmp = TempDir::new().unwrap();
    let (engine, _pool) = engine(&tmp).await;
    let doc = engine
        .create_document("alice", &new_doc("handbook", "a.md"))
        .await
        .unwrap();
    let mut chunk = new_chunk(&doc.doc_id, 0, "text");
    chunk.start_char = 10;
    chunk.end_char = 2;
    assert!(matches!(
        engine.ingest("alice", &chunk).await,
        Err(Error::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_concurrent_ingest_of_same_chunk_converges() {
    let tmp = TempDir::new().unwrap();
    let (engine, pool) = engine(&tmp).await;
    let engine = Arc::new(engine);
    let doc = engine
        .create_document("alice", &new_doc("handbook", "race.md"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let chunk = new_chunk(&doc.doc_id, 3, "written by many writers at once");
        handles.push(tokio::spawn(async move { engine.ingest("alice", &chunk).await }));
    }

    let mut receipts = Vec::new();
    for handle in handles {
        receipts.push(handle.await.unwrap().unwrap());
    }

    let expected = chunk_id_for(&doc.doc_id, 3);
    assert!(receipts.iter().all(|r| r.chunk_id == expected));
    assert_eq!(receipts.iter().filter(|r| r.created).count(), 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM doc_chunk").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM chunks_fts").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM chunk_vectors").await, 1);
}

#[tokio::test]
async fn test_insert_returns_the_stored_row() {
    let tmp = TempDir::new().unwrap();
    let (engine, pool) = engine(&tmp).await;
    let doc = engine
        .create_document("alice", &new_doc("handbook", "rows.md"))
        .await
        .unwrap();
    let store = SqliteChunkStore::new(pool);

    let first = store
        .insert_chunk(&new_chunk(&doc.doc_id, 0, "original text"))
        .await
        .unwrap();
    let again = store
        .insert_chunk(&new_chunk(&doc.doc_id, 0, "rewritten text"))
        .await
        .unwrap();
    let stored = store
        .get_chunks_by_ids(&[first.chunk.chunk_id.clone()])
        .await
        .unwrap();

    assert!(first.created);
    assert!(!again.created);
    assert_eq!(stored, vec![first.chunk.clone()]);
    assert_eq!(again.chunk, first.chunk);
    assert_eq!(again.chunk.text, "original text");
}

#[tokio::test]
async fn test_delete_document_cascades_and_clears_indexes() {
    let tmp = TempDir::new().unwrap();
    let (engine, pool) = engine(&tmp).await;
    let keep = engine
        .create_document("alice", &new_doc("handbook", "keep.md"))
        .await
        .unwrap();
    let doomed = engine
        .create_document("alice", &new_doc("handbook", "doomed.md"))
        .await
        .unwrap();
    engine
        .ingest("alice", &new_chunk(&keep.doc_id, 0, "retention policy"))
        .await
        .unwrap();
    for i in 0..3 {
        engine
            .ingest("alice", &new_chunk(&doomed.doc_id, i, "retention schedule draft"))
            .await
            .unwrap();
    }

    let removed = engine.delete_document("alice", &doomed.doc_id).await.unwrap();
    assert_eq!(removed, 3);

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM doc_chunk").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM chunk_index_state").await, 2);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM chunk_vectors").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM chunks_fts").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM reconcile_backlog").await, 0);

    let response = engine
        .query(&QueryRequest::new("alice", "handbook", "retention"))
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].doc_id, keep.doc_id);

    assert!(matches!(
        engine.delete_document("alice", &doomed.doc_id).await,
        Err(Error::NotFound { .. })
    ));
}

// ─── Referential integrity ──────────────────────────────────────────

#[tokio::test]
async fn test_stale_index_entries_are_dropped() {
    let tmp = TempDir::new().unwrap();
    let (engine, pool) = engine(&tmp).await;
    let doc = engine
        .create_document("alice", &new_doc("handbook", "services.md"))
        .await
        .unwrap();
    let gone = engine
        .ingest("alice", &new_chunk(&doc.doc_id, 0, "release checklist for the payments service"))
        .await
        .unwrap();
    let kept = engine
        .ingest("alice", &new_chunk(&doc.doc_id, 1, "release checklist for the search service"))
        .await
        .unwrap();

    // Remove the row behind the indexes' back
    sqlx::query("DELETE FROM doc_chunk WHERE chunk_id = ?")
        .bind(&gone.chunk_id)
        .execute(&pool)
        .await
        .unwrap();

    let response = engine
        .query(&QueryRequest::new("alice", "handbook", "payments release checklist"))
        .await
        .unwrap();

    assert!(response.results.iter().all(|r| r.chunk_id != gone.chunk_id));
    assert_eq!(response.results[0].chunk_id, kept.chunk_id);
    assert_eq!(response.stale_dropped, 1);
}

// ─── Access control ─────────────────────────────────────────────────

#[tokio::test]
async fn test_access_is_checked_before_any_store() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let grants = Arc::new(ProjectGrants::new());
    grants.grant("alpha", "alice");
    let (backends, pool) =
        sqlite_backends(&config, Arc::new(HashingEmbedder::new(256)), grants.clone())
            .await
            .unwrap();
    let engine = RetrievalEngine::new(backends, &config);

    let doc = engine
        .create_document("alice", &new_doc("alpha", "secret.md"))
        .await
        .unwrap();
    let receipt = engine
        .ingest("alice", &new_chunk(&doc.doc_id, 0, "launch codes"))
        .await
        .unwrap();

    let denied = |r: &Error| matches!(r, Error::AccessDenied { principal, .. } if principal == "bob");

    let err = engine
        .create_document("bob", &new_doc("alpha", "mine.md"))
        .await
        .unwrap_err();
    assert!(denied(&err));
    let err = engine
        .ingest("bob", &new_chunk(&doc.doc_id, 1, "sneaky"))
        .await
        .unwrap_err();
    assert!(denied(&err));
    let err = engine
        .query(&QueryRequest::new("bob", "alpha", "launch codes"))
        .await
        .unwrap_err();
    assert!(denied(&err));
    let err = engine
        .get_chunks("bob", "alpha", &[receipt.chunk_id.clone()])
        .await
        .unwrap_err();
    assert!(denied(&err));
    let err = engine.delete_document("bob", &doc.doc_id).await.unwrap_err();
    assert!(denied(&err));

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM doc").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM doc_chunk").await, 1);

    grants.grant("alpha", "bob");
    assert!(engine
        .query(&QueryRequest::new("bob", "alpha", "launch codes"))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_get_chunks_is_scoped_to_project() {
    let tmp = TempDir::new().unwrap();
    let (engine, _pool) = engine(&tmp).await;
    let a = engine
        .create_document("alice", &new_doc("alpha", "a.md"))
        .await
        .unwrap();
    let b = engine
        .create_document("alice", &new_doc("beta", "b.md"))
        .await
        .unwrap();
    let in_a = engine
        .ingest("alice", &new_chunk(&a.doc_id, 0, "alpha text"))
        .await
        .unwrap();
    let in_b = engine
        .ingest("alice", &new_chunk(&b.doc_id, 0, "beta text"))
        .await
        .unwrap();

    let chunks = engine
        .get_chunks(
            "alice",
            "alpha",
            &[in_b.chunk_id.clone(), in_a.chunk_id.clone(), "missing".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].chunk_id, in_a.chunk_id);
    assert_eq!(chunks[0].text, "alpha text");
}

#[tokio::test]
async fn test_query_never_crosses_projects() {
    let tmp = TempDir::new().unwrap();
    let (engine, _pool) = engine(&tmp).await;
    let a = engine
        .create_document("alice", &new_doc("alpha", "a.md"))
        .await
        .unwrap();
    let b = engine
        .create_document("alice", &new_doc("beta", "b.md"))
        .await
        .unwrap();
    engine
        .ingest("alice", &new_chunk(&a.doc_id, 0, "quarterly revenue forecast"))
        .await
        .unwrap();
    engine
        .ingest("alice", &new_chunk(&b.doc_id, 0, "quarterly revenue forecast"))
        .await
        .unwrap();

    let response = engine
        .query(&QueryRequest::new("alice", "beta", "quarterly revenue"))
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].doc_id, b.doc_id);
}

// ─── Model versions ─────────────────────────────────────────────────

#[tokio::test]
async fn test_repair_reembeds_after_model_change() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    {
        let (backends, pool) = sqlite_backends(
            &config,
            Arc::new(HashingEmbedder::with_version(256, "hash-a")),
            Arc::new(AllowAll),
        )
        .await
        .unwrap();
        let engine = RetrievalEngine::new(backends, &config);
        let doc = engine
            .create_document("alice", &new_doc("handbook", "m.md"))
            .await
            .unwrap();
        for i in 0..2 {
            engine
                .ingest("alice", &new_chunk(&doc.doc_id, i, "vector model upgrade"))
                .await
                .unwrap();
        }
        assert!(engine.repair().await.unwrap().is_clean());
        pool.close().await;
    }

    let (backends, pool) = sqlite_backends(
        &config,
        Arc::new(HashingEmbedder::with_version(256, "hash-b")),
        Arc::new(AllowAll),
    )
    .await
    .unwrap();
    let engine = RetrievalEngine::new(backends, &config);

    let report = engine.repair().await.unwrap();
    assert_eq!(report.repaired_count, 2);
    assert_eq!(report.failed_count, 0);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM chunk_vectors WHERE model_version = 'hash-b'").await,
        2
    );
    assert!(engine.repair().await.unwrap().is_clean());
}

// ─── Opening from config ────────────────────────────────────────────

#[tokio::test]
async fn test_open_without_embedder_serves_keyword_results() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let engine = RetrievalEngine::open(&config, Arc::new(AllowAll))
        .await
        .unwrap();
    let pool = engine.pool().unwrap().clone();

    let doc = engine
        .create_document("alice", &new_doc("handbook", "k.md"))
        .await
        .unwrap();
    let receipt = engine
        .ingest("alice", &new_chunk(&doc.doc_id, 0, "keyword only deployment"))
        .await
        .unwrap();
    assert_eq!(receipt.consistency_status, ConsistencyStatus::Degraded);
    assert_eq!(receipt.degraded_indexes, vec![IndexKind::Vector]);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM reconcile_backlog").await, 1);

    let response = engine
        .query(&QueryRequest::new("alice", "handbook", "keyword deployment"))
        .await
        .unwrap();
    assert_eq!(response.results[0].chunk_id, receipt.chunk_id);
    assert_eq!(response.results[0].sources, vec![HitSource::Keyword]);
}
