//! Embedded vector index with metadata filtering.
//!
//! Chunks live in the `chunks` table with their embedding stored as a
//! little-endian f32 blob. Search is brute-force cosine over a collection:
//! at the index sizes a single-process daemon sees, a scan plus sort is
//! simpler than an ANN structure and fast enough.
//!
//! Access control is the skill filter: a chunk whose `skills` list is empty
//! is visible to every skill; otherwise it is visible to a skill iff the
//! skill appears in the list. Because that predicate is a disjunction over
//! the *query's* filter set, it is applied in post-processing: the
//! nearest-neighbour pass over-fetches (3·k) when a filter is active and the
//! first k survivors win.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::chunker::chunk_text;
use crate::db::Db;
use crate::embedding::{Embedder, blob_to_embedding, cosine_similarity, embedding_to_blob};
use crate::error::{StoreError, StoreResult};

/// Collection used when a caller does not name one.
pub const DEFAULT_COLLECTION: &str = "default";

/// Length of the text preview returned by [`VectorStore::list`].
const PREVIEW_CHARS: usize = 200;

/// Over-fetch factor applied to the nearest-neighbour pass when a
/// skills/tags filter is active.
const FILTER_CANDIDATE_FACTOR: usize = 3;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// A stored chunk with its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique id (UUID v7; time-ordered, so id order is insertion order).
    pub id: String,
    /// The collection this chunk belongs to.
    pub collection: String,
    /// Logical source document identifier.
    pub source: String,
    /// Position of this chunk within its source.
    pub chunk_index: u32,
    /// Number of chunks the source was split into.
    pub total_chunks: u32,
    /// The chunk text.
    pub text: String,
    /// Skills allowed to retrieve this chunk; empty = all skills.
    pub skills: Vec<String>,
    /// Free-form routing tags.
    pub tags: Vec<String>,
    /// Unix timestamp of ingestion.
    pub created_at: i64,
}

/// A chunk scored against a query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Cosine similarity against the query embedding.
    pub score: f32,
}

/// Lightweight listing entry: metadata plus a text preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPreview {
    pub id: String,
    pub source: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// First 200 characters of the chunk text.
    pub preview: String,
    pub skills: Vec<String>,
    pub tags: Vec<String>,
}

/// Row shape shared by search and list queries.
struct ChunkRow {
    id: String,
    collection: String,
    source: String,
    chunk_index: u32,
    total_chunks: u32,
    text: String,
    embedding: Vec<u8>,
    skills: String,
    tags: String,
    created_at: i64,
}

fn row_to_chunk_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRow> {
    Ok(ChunkRow {
        id: row.get(0)?,
        collection: row.get(1)?,
        source: row.get(2)?,
        chunk_index: row.get(3)?,
        total_chunks: row.get(4)?,
        text: row.get(5)?,
        embedding: row.get(6)?,
        skills: row.get(7)?,
        tags: row.get(8)?,
        created_at: row.get(9)?,
    })
}

impl ChunkRow {
    fn into_chunk(self) -> StoreResult<(Chunk, Vec<f32>)> {
        let embedding = blob_to_embedding(&self.embedding);
        let chunk = Chunk {
            id: self.id,
            collection: self.collection,
            source: self.source,
            chunk_index: self.chunk_index,
            total_chunks: self.total_chunks,
            text: self.text,
            skills: serde_json::from_str(&self.skills)?,
            tags: serde_json::from_str(&self.tags)?,
            created_at: self.created_at,
        };
        Ok((chunk, embedding))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Filters
// ═══════════════════════════════════════════════════════════════════════

/// Skill visibility rule: pass iff the filter is empty, the chunk is
/// unrestricted, or the two sets intersect.
fn passes_skill_filter(chunk_skills: &[String], filter: &[String]) -> bool {
    filter.is_empty()
        || chunk_skills.is_empty()
        || chunk_skills.iter().any(|s| filter.contains(s))
}

/// Tag rule: pass iff the filter is empty or the sets intersect.
fn passes_tag_filter(chunk_tags: &[String], filter: &[String]) -> bool {
    filter.is_empty() || chunk_tags.iter().any(|t| filter.contains(t))
}

// ═══════════════════════════════════════════════════════════════════════
//  VectorStore
// ═══════════════════════════════════════════════════════════════════════

/// SQLite-backed vector index over [`Chunk`]s.
///
/// Safe for concurrent search and ingest: every call is a single
/// serialized statement batch against the shared connection.
#[derive(Clone)]
pub struct VectorStore {
    db: Db,
    embedder: Arc<dyn Embedder>,
}

impl VectorStore {
    /// Create a vector store backed by `db`, embedding with `embedder`.
    pub fn new(db: Db, embedder: Arc<dyn Embedder>) -> Self {
        Self { db, embedder }
    }

    /// The name of the active embedder.
    pub fn embedder_name(&self) -> String {
        self.embedder.name().to_string()
    }

    /// Split `text` into chunks, embed each one, and insert them into
    /// `collection`. Returns the number of chunks inserted.
    ///
    /// Ingesting the same source twice produces distinct chunk ids; the old
    /// chunks are not replaced (use [`Self::delete_by_source`] first to
    /// re-ingest).
    #[instrument(skip(self, text), fields(source = %source, collection = %collection))]
    pub async fn ingest(
        &self,
        source: &str,
        text: &str,
        skills: &[String],
        tags: &[String],
        collection: &str,
    ) -> StoreResult<usize> {
        let pieces = chunk_text(text);
        if pieces.is_empty() {
            return Ok(0);
        }

        let total = pieces.len() as u32;
        let skills_json = serde_json::to_string(skills)?;
        let tags_json = serde_json::to_string(tags)?;
        let now = Utc::now().timestamp();

        let mut rows = Vec::with_capacity(pieces.len());
        for (index, piece) in pieces.into_iter().enumerate() {
            let embedding = self.embedder.embed(&piece).await?;
            rows.push((
                Uuid::now_v7().to_string(),
                index as u32,
                piece,
                embedding_to_blob(&embedding),
            ));
        }

        let source = source.to_string();
        let collection = collection.to_string();
        let inserted = rows.len();

        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "INSERT INTO chunks (id, collection, source, chunk_index, total_chunks, \
                     text, embedding, skills, tags, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )?;
                for (id, index, piece, blob) in rows {
                    stmt.execute(rusqlite::params![
                        id,
                        collection,
                        source,
                        index,
                        total,
                        piece,
                        blob,
                        skills_json,
                        tags_json,
                        now,
                    ])?;
                }
                Ok(())
            })
            .await?;

        debug!(chunks = inserted, "ingested document");
        Ok(inserted)
    }

    /// Search `collection` for the `k` chunks most similar to `query`,
    /// restricted by the skill and tag filters.
    ///
    /// Results are in descending similarity order; ties break toward the
    /// earlier-inserted chunk.
    #[instrument(skip(self, query), fields(collection = %collection, k = k))]
    pub async fn search(
        &self,
        query: &str,
        collection: &str,
        skills: &[String],
        tags: &[String],
        k: usize,
    ) -> StoreResult<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_embedding = self.embedder.embed(query).await?;
        let collection = collection.to_string();

        let rows = self
            .db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, collection, source, chunk_index, total_chunks, text, embedding, \
                     skills, tags, created_at FROM chunks WHERE collection = ?1",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![collection], row_to_chunk_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in rows {
            let (chunk, embedding) = row.into_chunk()?;
            let score = cosine_similarity(&query_embedding, &embedding);
            scored.push(ScoredChunk { chunk, score });
        }

        // Similarity order, ties toward earlier insertion (v7 ids sort by time).
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });

        // Post-filtering can drop results, so the candidate pool is wider
        // whenever a filter is active.
        let filtered = !skills.is_empty() || !tags.is_empty();
        let pool = if filtered {
            k.saturating_mul(FILTER_CANDIDATE_FACTOR)
        } else {
            k
        };
        scored.truncate(pool);

        let survivors: Vec<ScoredChunk> = scored
            .into_iter()
            .filter(|sc| {
                passes_skill_filter(&sc.chunk.skills, skills)
                    && passes_tag_filter(&sc.chunk.tags, tags)
            })
            .take(k)
            .collect();

        Ok(survivors)
    }

    /// List chunk previews from `collection`, unranked, in insertion order.
    #[instrument(skip(self))]
    pub async fn list(
        &self,
        collection: &str,
        skills: &[String],
        source_substring: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<ChunkPreview>> {
        let collection = collection.to_string();
        let source_like = source_substring.map(|s| format!("%{s}%"));

        let rows = self
            .db
            .with_conn(move |conn| {
                let rows = match &source_like {
                    Some(pattern) => {
                        let mut stmt = conn.prepare(
                            "SELECT id, collection, source, chunk_index, total_chunks, text, \
                             embedding, skills, tags, created_at FROM chunks \
                             WHERE collection = ?1 AND source LIKE ?2 ORDER BY id ASC",
                        )?;
                        stmt.query_map(rusqlite::params![collection, pattern], row_to_chunk_row)?
                            .collect::<Result<Vec<_>, _>>()?
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT id, collection, source, chunk_index, total_chunks, text, \
                             embedding, skills, tags, created_at FROM chunks \
                             WHERE collection = ?1 ORDER BY id ASC",
                        )?;
                        stmt.query_map(rusqlite::params![collection], row_to_chunk_row)?
                            .collect::<Result<Vec<_>, _>>()?
                    }
                };
                Ok(rows)
            })
            .await?;

        let mut previews = Vec::new();
        for row in rows {
            let (chunk, _) = row.into_chunk()?;
            if !passes_skill_filter(&chunk.skills, skills) {
                continue;
            }
            previews.push(ChunkPreview {
                id: chunk.id,
                source: chunk.source,
                chunk_index: chunk.chunk_index,
                total_chunks: chunk.total_chunks,
                preview: chunk.text.chars().take(PREVIEW_CHARS).collect(),
                skills: chunk.skills,
                tags: chunk.tags,
            });
            if previews.len() >= limit {
                break;
            }
        }

        Ok(previews)
    }

    /// Delete chunks by id. Returns how many rows were removed.
    #[instrument(skip(self, ids))]
    pub async fn delete(&self, ids: &[String]) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = ids.to_vec();
        self.db
            .with_conn(move |conn| {
                let mut deleted = 0usize;
                let mut stmt = conn.prepare("DELETE FROM chunks WHERE id = ?1")?;
                for id in &ids {
                    deleted += stmt.execute([id])?;
                }
                Ok(deleted)
            })
            .await
    }

    /// Delete every chunk whose `source` matches exactly. Returns the count.
    #[instrument(skip(self))]
    pub async fn delete_by_source(&self, source: &str) -> StoreResult<usize> {
        let source = source.to_string();
        self.db
            .with_conn(move |conn| {
                let deleted = conn.execute("DELETE FROM chunks WHERE source = ?1", [&source])?;
                Ok(deleted)
            })
            .await
    }

    /// Count chunks in a collection.
    pub async fn count(&self, collection: &str) -> StoreResult<i64> {
        let collection = collection.to_string();
        self.db
            .with_conn(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT count(*) FROM chunks WHERE collection = ?1",
                    [&collection],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
    }

    /// Distinct source identifiers present in a collection, for listings.
    pub async fn sources(&self, collection: &str) -> StoreResult<Vec<String>> {
        let collection = collection.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT source FROM chunks WHERE collection = ?1 ORDER BY source",
                )?;
                let rows = stmt
                    .query_map([&collection], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
