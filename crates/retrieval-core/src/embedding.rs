//! Embedding function trait and vector utilities.
//!
//! An [`EmbeddingFunction`] is an external collaborator: a deterministic,
//! versioned text→vector mapping. The engine records the
//! [`model_version`](EmbeddingFunction::model_version) that produced every
//! stored vector so a model upgrade can be detected and re-embedded by the
//! repair pass.
//!
//! Network-backed providers live in the `hybrid-retrieval` crate. The
//! [`HashingEmbedder`] here is a dependency-free feature-hashing model for
//! tests and offline use.

use anyhow::{anyhow, ensure, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::text::tokenize;

/// A versioned text embedding model.
#[async_trait]
pub trait EmbeddingFunction: Send + Sync {
    /// Identifier of the model and revision producing the vectors
    /// (e.g. `"text-embedding-3-small"`).
    fn model_version(&self) -> &str;

    /// Vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single text.
pub async fn embed_one(embedder: &dyn EmbeddingFunction, text: &str) -> Result<Vec<f32>> {
    embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Empty embedding response"))
}

/// Feature-hashing embedder.
///
/// Each token is hashed with SHA-256 into one of `dims` buckets with a
/// hash-derived sign, and the result is L2-normalized. Texts sharing
/// vocabulary therefore have positive cosine similarity, and the mapping
/// is fully deterministic for a given `(model_version, dims)`.
pub struct HashingEmbedder {
    model_version: String,
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self::with_version(dims, "hashing-v1")
    }

    pub fn with_version(dims: usize, model_version: &str) -> Self {
        Self {
            model_version: model_version.to_string(),
            dims,
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingFunction for HashingEmbedder {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        ensure!(self.dims > 0, "HashingEmbedder requires dims > 0");
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero-magnitude operand.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
