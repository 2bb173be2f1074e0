//! Quality gate, fallback, deadline, and cancellation tests.
//!
//! These run over the in-memory backends with probes around both indexes,
//! so each test can see exactly which parameters every search used.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{new_chunk, new_doc, KeywordProbe, VectorProbe};
use hybrid_retrieval::cancel::CancellationToken;
use hybrid_retrieval::config::Config;
use hybrid_retrieval::engine::{Backends, QueryRequest, RetrievalEngine};
use hybrid_retrieval::retriever::BackendStatus;
use retrieval_core::access::AllowAll;
use retrieval_core::embedding::HashingEmbedder;
use retrieval_core::models::HitSource;
use retrieval_core::quality::QueryState;
use retrieval_core::store::memory::{
    InMemoryChunkStore, InMemoryKeywordIndex, InMemoryVectorIndex,
};
use retrieval_core::Error;

struct Harness {
    engine: RetrievalEngine,
    vectors: Arc<VectorProbe>,
    keywords: Arc<KeywordProbe>,
}

fn harness(
    config: &Config,
    vectors: impl FnOnce(VectorProbe) -> VectorProbe,
    keywords: impl FnOnce(KeywordProbe) -> KeywordProbe,
) -> Harness {
    let store = Arc::new(InMemoryChunkStore::new());
    let vectors = Arc::new(vectors(VectorProbe::new(Arc::new(InMemoryVectorIndex::new()))));
    let keywords = Arc::new(keywords(KeywordProbe::new(Arc::new(
        InMemoryKeywordIndex::new(),
    ))));
    let backends = Backends {
        store: store.clone(),
        backlog: store,
        vectors: vectors.clone(),
        keywords: keywords.clone(),
        embedder: Arc::new(HashingEmbedder::new(1024)),
        access: Arc::new(AllowAll),
    };
    Harness {
        engine: RetrievalEngine::new(backends, config),
        vectors,
        keywords,
    }
}

fn config() -> Config {
    Config::with_db_path("unused.sqlite")
}

async fn seed(engine: &RetrievalEngine, texts: &[&str]) -> Vec<String> {
    let doc = engine
        .create_document("alice", &new_doc("handbook", "seed.md"))
        .await
        .unwrap();
    let mut ids = Vec::new();
    for (i, text) in texts.iter().enumerate() {
        let receipt = engine
            .ingest("alice", &new_chunk(&doc.doc_id, i as i64, text))
            .await
            .unwrap();
        ids.push(receipt.chunk_id);
    }
    ids
}

fn fallback_count(states: &[QueryState]) -> usize {
    states
        .iter()
        .filter(|s| **s == QueryState::FallbackRetrieving)
        .count()
}

// ─── Quality gate ───────────────────────────────────────────────────

#[tokio::test]
async fn test_good_first_attempt_skips_fallback() {
    let h = harness(&config(), |v| v, |k| k);
    let ids = seed(&h.engine, &["blue green deployment strategy", "lunch menu"]).await;

    let response = h
        .engine
        .query(&QueryRequest::new("alice", "handbook", "blue green deployment"))
        .await
        .unwrap();

    assert_eq!(response.results[0].chunk_id, ids[0]);
    assert!(!response.fallback_used);
    assert!(!response.low_confidence);
    assert_eq!(fallback_count(&response.states), 0);
    assert_eq!(
        response.states.last(),
        Some(&QueryState::Ready {
            low_confidence: false
        })
    );
    assert_eq!(h.vectors.recorded().len(), 1);
    assert_eq!(h.keywords.recorded().len(), 1);
}

#[tokio::test]
async fn test_poor_quality_falls_back_once_with_widened_parameters() {
    let mut config = config();
    config.quality.threshold = 0.9;
    config.quality.min_similarity_threshold = 0.99;
    config.quality.synonyms =
        HashMap::from([("release".to_string(), vec!["launch".to_string(), "ship".to_string()])]);
    let h = harness(&config, |v| v, |k| k);
    seed(
        &h.engine,
        &[
            "alpha release checklist",
            "beta rollout notes",
            "gamma incident review",
        ],
    )
    .await;

    // Nothing but an identical text clears a 1.0 similarity bar, so only
    // the keyword side contributes and the aggregate stays near 0.5.
    let response = h
        .engine
        .query(
            &QueryRequest::new("alice", "handbook", "release").with_similarity_threshold(1.0),
        )
        .await
        .unwrap();

    assert!(response.fallback_used);
    assert!(response.low_confidence);
    assert!(response.aggregate_score < 0.9);
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].sources, vec![HitSource::Keyword]);
    assert_eq!(fallback_count(&response.states), 1);
    assert_eq!(
        response.states.last(),
        Some(&QueryState::Ready {
            low_confidence: true
        })
    );

    let defaults = &config.retrieval;
    assert_eq!(
        h.vectors.recorded(),
        vec![
            (defaults.vector_k, 1.0),
            (defaults.vector_k * 3, 0.99),
        ]
    );
    assert_eq!(
        h.keywords.recorded(),
        vec![
            ("release".to_string(), defaults.keyword_k),
            ("release launch ship".to_string(), defaults.keyword_k * 3),
        ]
    );
}

#[tokio::test]
async fn test_expanded_fallback_can_recover_confidence() {
    let mut config = config();
    config.quality.threshold = 0.4;
    config.quality.synonyms =
        HashMap::from([("rollout".to_string(), vec!["deployment".to_string()])]);
    let h = harness(&config, |v| v, |k| k);
    let ids = seed(&h.engine, &["blue green deployment strategy"]).await;

    let response = h
        .engine
        .query(&QueryRequest::new("alice", "handbook", "rollout"))
        .await
        .unwrap();

    assert!(response.fallback_used);
    assert!(!response.low_confidence);
    assert_eq!(response.results[0].chunk_id, ids[0]);
    assert!(response.results[0].sources.contains(&HitSource::Keyword));
    assert_eq!(fallback_count(&response.states), 1);
    assert_eq!(h.keywords.recorded()[1].0, "rollout deployment");
}

#[tokio::test]
async fn test_empty_corpus_is_low_confidence_not_error() {
    let h = harness(&config(), |v| v, |k| k);
    let response = h
        .engine
        .query(&QueryRequest::new("alice", "handbook", "anything at all"))
        .await
        .unwrap();
    assert!(response.results.is_empty());
    assert!(response.low_confidence);
    assert_eq!(response.aggregate_score, 0.0);
    assert_eq!(fallback_count(&response.states), 1);
}

// ─── Deadlines ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_slow_vector_backend_is_treated_as_empty() {
    let mut config = config();
    config.retrieval.vector_timeout_ms = 100;
    let h = harness(
        &config,
        |v| v.with_search_delay(Duration::from_secs(3)),
        |k| k,
    );
    let ids = seed(&h.engine, &["blue green deployment strategy"]).await;

    let started = Instant::now();
    let response = h
        .engine
        .query(&QueryRequest::new("alice", "handbook", "deployment strategy"))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(response.vector_status, BackendStatus::TimedOut);
    assert_eq!(response.keyword_status, BackendStatus::Ok);
    assert_eq!(response.results[0].chunk_id, ids[0]);
    assert_eq!(response.results[0].sources, vec![HitSource::Keyword]);
}

// ─── Cancellation ───────────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_during_retrieval() {
    let mut config = config();
    config.retrieval.vector_timeout_ms = 30_000;
    let h = harness(
        &config,
        |v| v.with_search_delay(Duration::from_secs(10)),
        |k| k,
    );
    seed(&h.engine, &["blue green deployment strategy"]).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = h
        .engine
        .query(&QueryRequest::new("alice", "handbook", "deployment").with_cancel(cancel))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cancel_before_fallback_stops_the_query() {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let h = harness(&config(), |v| v, move |k| k.cancelling(token));
    seed(&h.engine, &["lunch menu"]).await;

    let err = h
        .engine
        .query(
            &QueryRequest::new("alice", "handbook", "deployment strategy").with_cancel(cancel),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(h.keywords.recorded().len(), 1);
    assert_eq!(h.vectors.recorded().len(), 1);
}
