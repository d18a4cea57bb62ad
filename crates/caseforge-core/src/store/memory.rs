//! In-memory [`ChunkIndex`] for tests and scratch use.
//!
//! All state sits behind one `std::sync::RwLock`. Commits take the write
//! lock for the whole batch, which serializes writers and makes the batch
//! atomic; queries score a read-locked snapshot by brute-force cosine.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, Document, ScoredChunk};

use super::{rank, ChunkIndex, CommitReport};

struct StoredChunk {
    chunk: Chunk,
    vector: Vec<f32>,
}

#[derive(Default)]
struct Inner {
    documents: HashMap<String, Document>,
    chunks: Vec<StoredChunk>,
    hashes: HashSet<String>,
}

impl Inner {
    fn insert(&mut self, chunk: Chunk, vector: Vec<f32>) -> bool {
        if !self.hashes.insert(chunk.hash.clone()) {
            return false;
        }
        self.chunks.push(StoredChunk { chunk, vector });
        true
    }
}

pub struct InMemoryIndex {
    collection: String,
    inner: RwLock<Inner>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::with_collection("default")
    }

    pub fn with_collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn document_count(&self) -> Result<usize> {
        Ok(self.read()?.documents.len())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| anyhow!("in-memory index lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| anyhow!("in-memory index lock poisoned"))
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChunkIndex for InMemoryIndex {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn contains_hash(&self, hash: &str) -> Result<bool> {
        Ok(self.read()?.hashes.contains(hash))
    }

    async fn commit(
        &self,
        document: &Document,
        entries: Vec<(Chunk, Vec<f32>)>,
    ) -> Result<CommitReport> {
        let mut inner = self.write()?;
        let mut report = CommitReport::default();
        for (chunk, vector) in entries {
            if inner.insert(chunk, vector) {
                report.inserted += 1;
            } else {
                report.deduplicated += 1;
            }
        }
        inner
            .documents
            .entry(document.id.clone())
            .or_insert_with(|| document.clone());
        Ok(report)
    }

    async fn upsert(&self, chunk: Chunk, vector: Vec<f32>) -> Result<bool> {
        Ok(self.write()?.insert(chunk, vector))
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let inner = self.read()?;
        let candidates = inner
            .chunks
            .iter()
            .map(|sc| ScoredChunk {
                chunk: sc.chunk.clone(),
                score: cosine_similarity(vector, &sc.vector),
            })
            .collect();
        Ok(rank(candidates, k))
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        Ok(self
            .read()?
            .chunks
            .iter()
            .find(|sc| sc.chunk.id == id)
            .map(|sc| sc.chunk.clone()))
    }

    async fn chunk_count(&self) -> Result<usize> {
        Ok(self.read()?.chunks.len())
    }
}
