//! Storage layer for agentgw.
//!
//! Everything durable lives in one SQLite file behind [`Db`]:
//!
//! - [`MessageStore`] -- append-only sessions, messages, and per-message
//!   feedback.
//! - [`VectorStore`] -- chunked, embedded documents with skill/tag scoped
//!   retrieval.
//!
//! Embeddings are pluggable through the [`Embedder`] trait; the local
//! hashing embedder keeps the daemon self-contained, the OpenAI embedder
//! trades that for semantic quality.

pub mod chunker;
pub mod db;
pub mod embedding;
pub mod error;
pub mod messages;
pub mod migration;
pub mod vector;

pub use chunker::{CHUNK_OVERLAP, CHUNK_SIZE, chunk_text};
pub use db::{Db, MEMORY_DB};
pub use embedding::{Embedder, HashEmbedder, OpenAiEmbedder, cosine_similarity};
pub use error::{StoreError, StoreResult};
pub use messages::{MessageStore, StoredMessage, StoredSession};
pub use vector::{Chunk, ChunkPreview, DEFAULT_COLLECTION, ScoredChunk, VectorStore};
