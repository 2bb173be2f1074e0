//! # Hybrid Retrieval
//!
//! A hybrid vector + keyword retrieval engine that keeps an authoritative
//! chunk store and two derived indexes consistent under concurrent writes,
//! and merges their rankings into one deterministic, quality-gated answer.
//!
//! ## Architecture
//!
//! ```text
//!              ingest                               query
//!                │                                    │
//!                ▼                                    ▼
//!     ┌─────────────────────┐             ┌──────────────────────┐
//!     │ DualWriteCoordinator│             │   HybridRetriever    │
//!     └──┬───────┬───────┬──┘             │  vector ∥ keyword    │
//!        │       │       │                └──────────┬───────────┘
//!        ▼       ▼       ▼                           ▼
//!   ┌────────┐ ┌──────┐ ┌───────┐          RRF fusion → read-through
//!   │ chunks │ │vector│ │ FTS5  │          resolve → quality gate
//!   │(SQLite)│ │index │ │ index │          (one widened fallback)
//!   └────────┘ └──────┘ └───────┘
//!        ▲
//!        └── repair: reconciliation backlog + confirmation ledger
//! ```
//!
//! Runtime-agnostic logic (fusion, resolver, gate, traits, in-memory
//! backends) lives in [`retrieval_core`]. This crate adds the SQLite
//! deployment, embedding providers, timeouts, and cancellation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn run() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use hybrid_retrieval::config::Config;
//! use hybrid_retrieval::engine::{QueryRequest, RetrievalEngine};
//! use retrieval_core::access::AllowAll;
//! use retrieval_core::models::{NewChunk, NewDocument};
//!
//! let config = Config::with_db_path("./data/retrieval.sqlite");
//! let engine = RetrievalEngine::open(&config, Arc::new(AllowAll)).await?;
//!
//! let doc = engine
//!     .create_document("alice", &NewDocument {
//!         project_id: "handbook".into(),
//!         filename: "deploy.md".into(),
//!         checksum: "sha256:…".into(),
//!     })
//!     .await?;
//! engine
//!     .ingest("alice", &NewChunk {
//!         doc_id: doc.doc_id.clone(),
//!         chunk_index: 0,
//!         text: "Deployments roll out through the staging cluster first.".into(),
//!         page: 1,
//!         start_char: 0,
//!         end_char: 56,
//!     })
//!     .await?;
//!
//! let response = engine
//!     .query(&QueryRequest::new("alice", "handbook", "how do deployments roll out"))
//!     .await?;
//! for hit in &response.results {
//!     println!("{} {:.4} {}", hit.rank, hit.fused_score, hit.text);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | Chunk store and durable reconciliation backlog |
//! | [`sqlite_index`] | Vector (BLOB + cosine) and keyword (FTS5) indexes |
//! | [`embedding`] | Embedding providers |
//! | [`cancel`] | Cooperative cancellation token |
//! | [`retriever`] | Concurrent vector + keyword retrieval with deadlines |
//! | [`coordinator`] | Dual writes, document deletion, repair |
//! | [`engine`] | Public operations and the query state machine |
//! | [`logging`] | Tracing subscriber setup |

pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod logging;
pub mod migrate;
pub mod retriever;
pub mod sqlite_index;
pub mod sqlite_store;

pub use retrieval_core;
