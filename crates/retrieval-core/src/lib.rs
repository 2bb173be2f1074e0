//! # Retrieval Core
//!
//! Runtime-agnostic logic for the hybrid retrieval engine: data model,
//! collaborator traits, rank fusion, read-through resolution, and the
//! context quality gate.
//!
//! This crate contains no tokio, sqlx, or network dependencies. The
//! SQLite deployment, timeouts, and the dual-write coordinator live in
//! the `hybrid-retrieval` crate and plug concrete backends into the
//! traits defined here.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Documents, chunks, hits, fused results, backlog entries |
//! | [`error`] | Typed engine errors |
//! | [`store`] | `ChunkStore`, `VectorIndex`, `KeywordIndex`, `ReconciliationBacklog` traits + in-memory backends |
//! | [`embedding`] | `EmbeddingFunction` trait, vector utilities, hashing embedder |
//! | [`access`] | Project access-control predicate |
//! | [`fusion`] | Reciprocal Rank Fusion |
//! | [`resolve`] | Read-through resolution of fused ids to authoritative text |
//! | [`quality`] | Quality gate and query state machine |
//! | [`expansion`] | Synonym term expansion for fallback queries |
//! | [`text`] | Tokenizer shared by lexical scoring and hashing embeddings |

pub mod access;
pub mod embedding;
pub mod error;
pub mod expansion;
pub mod fusion;
pub mod models;
pub mod quality;
pub mod resolve;
pub mod store;
pub mod text;

pub use error::Error;
