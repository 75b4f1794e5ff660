//! Embedding computation.
//!
//! The vector store is generic over an [`Embedder`]. Two implementations
//! ship with the daemon:
//!
//! - [`HashEmbedder`] -- deterministic local feature hashing over character
//!   trigrams. No network, no model weights, stable across runs. This is
//!   the default and what the test suite uses.
//! - [`OpenAiEmbedder`] -- calls the OpenAI `/v1/embeddings` endpoint.
//!
//! Embeddings are stored as little-endian `f32` blobs in SQLite.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Dimensionality of locally computed embeddings.
pub const LOCAL_EMBEDDING_DIM: usize = 256;

/// Computes a vector representation of a piece of text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// A short identifier for logs and `/health`.
    fn name(&self) -> &str;

    /// Embed `text` into a dense vector. Vectors from one embedder are
    /// comparable with each other only.
    async fn embed(&self, text: &str) -> StoreResult<Vec<f32>>;
}

// ═══════════════════════════════════════════════════════════════════════
//  Local feature-hashing embedder
// ═══════════════════════════════════════════════════════════════════════

/// Deterministic local embedder: hashed character trigrams, L2-normalized.
///
/// Not a semantic model (similarity is lexical), but it is stable across
/// processes and versions, which matters because embeddings persist.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self {
            dim: LOCAL_EMBEDDING_DIM,
        }
    }
}

impl HashEmbedder {
    /// Create an embedder producing vectors of `dim` components.
    pub fn with_dim(dim: usize) -> Self {
        Self { dim }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dim];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();

        for window in chars.windows(3) {
            if window.iter().all(|c| *c == ' ') {
                continue;
            }
            let mut buf = [0u8; 12];
            let mut len = 0;
            for c in window {
                len += c.encode_utf8(&mut buf[len..]).len();
            }
            let bucket = (fnv1a(&buf[..len]) as usize) % self.dim;
            vector[bucket] += 1.0;
        }

        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "local-hash"
    }

    async fn embed(&self, text: &str) -> StoreResult<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

/// FNV-1a, kept local because the embedding buckets must be stable across
/// compiler and std versions (`DefaultHasher` gives no such guarantee).
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  OpenAI embedder
// ═══════════════════════════════════════════════════════════════════════

/// Default OpenAI embeddings endpoint.
const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

/// Remote embedder backed by the OpenAI embeddings API.
pub struct OpenAiEmbedder {
    http: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
}

impl OpenAiEmbedder {
    /// Create a new embedder for `model` (e.g. `text-embedding-3-small`).
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            url: OPENAI_EMBEDDINGS_URL.to_owned(),
        }
    }

    /// Override the endpoint URL (OpenAI-compatible servers).
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn name(&self) -> &str {
        "openai"
    }

    async fn embed(&self, text: &str) -> StoreResult<Vec<f32>> {
        debug!(model = %self.model, "requesting embedding");

        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await
            .map_err(|e| StoreError::Embedding(e.to_string()))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| StoreError::Embedding(format!("invalid response body: {e}")))?;

        if !status.is_success() {
            return Err(StoreError::Embedding(format!(
                "API returned {status}: {body}"
            )));
        }

        let values = body["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| StoreError::Embedding("missing `data[0].embedding`".into()))?;

        values
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| StoreError::Embedding("non-numeric embedding value".into()))
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Vector helpers
// ═══════════════════════════════════════════════════════════════════════

/// Serialize a `Vec<f32>` into a little-endian byte blob for SQLite.
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Deserialize a byte blob back into a `Vec<f32>`.
pub fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().expect("chunk is exactly 4 bytes");
            f32::from_le_bytes(arr)
        })
        .collect()
}

/// Cosine similarity between two vectors. Mismatched lengths score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

// ── tests ────────────────────────────────────────────────────────────
