//! Chunk index abstraction.
//!
//! The [`ChunkIndex`] trait is the single owner of chunk storage. It
//! supports hash-deduplicated inserts and cosine nearest-neighbor lookup,
//! enabling pluggable backends (SQLite in the app crate, in-memory here).
//!
//! # Contract
//!
//! - Writes are serialized per index: two concurrent commits never both
//!   insert the same content hash.
//! - [`commit`](ChunkIndex::commit) is all-or-nothing for its batch.
//! - [`query`](ChunkIndex::query) orders by score descending, then chunk
//!   id ascending, so results are reproducible for a fixed index state.
//! - Querying an empty index returns an empty list.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::cmp::Ordering;

use crate::models::{Chunk, Document, ScoredChunk};

/// Outcome of a [`ChunkIndex::commit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub inserted: usize,
    pub deduplicated: usize,
}

/// Per-collection counts for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionSummary {
    pub name: String,
    pub documents: i64,
    pub chunks: i64,
}

#[async_trait]
pub trait ChunkIndex: Send + Sync {
    /// Name of the collection this index is bound to.
    fn collection(&self) -> &str;

    /// Whether a chunk with this content hash is already stored.
    async fn contains_hash(&self, hash: &str) -> Result<bool>;

    /// Atomically store a document and its embedded chunks.
    ///
    /// Chunks whose hash is already present (including earlier in the same
    /// batch) are skipped and counted as deduplicated.
    async fn commit(&self, document: &Document, entries: Vec<(Chunk, Vec<f32>)>)
        -> Result<CommitReport>;

    /// Store a single chunk. Returns `false` if its hash was already present.
    async fn upsert(&self, chunk: Chunk, vector: Vec<f32>) -> Result<bool>;

    /// Top-`k` chunks by cosine similarity to `vector`.
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>>;

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>>;

    async fn chunk_count(&self) -> Result<usize>;
}

/// Sort candidates by score descending with ascending chunk id as the
/// tie-break, then keep the first `k`.
pub fn rank(mut candidates: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    candidates.truncate(k);
    candidates
}
