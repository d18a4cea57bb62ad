//! Document ingestion.
//!
//! `document → chunks → hash dedup → embeddings → one atomic commit`.
//!
//! Every new chunk of a document is embedded before anything is written,
//! so an embedding failure leaves the index exactly as it was. The hash
//! check runs twice: once up front to avoid paying for embeddings of text
//! the index already holds, and again inside the index's writer critical
//! section, which is what makes concurrent ingestion of the same text safe.

use anyhow::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use caseforge_core::chunk::chunk_text;
use caseforge_core::embedding::EmbeddingProvider;
use caseforge_core::error::PipelineError;
use caseforge_core::models::{Chunk, Document, IngestionReport};
use caseforge_core::store::ChunkIndex;

use crate::app::App;
use crate::config::{ChunkingConfig, Config, IngestConfig};
use crate::loader;

#[derive(Clone)]
pub struct DocumentIngestor {
    index: Arc<dyn ChunkIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunk_size: usize,
    chunk_overlap: usize,
    batch_size: usize,
}

impl DocumentIngestor {
    pub fn new(
        index: Arc<dyn ChunkIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunking: &ChunkingConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            chunk_size: chunking.chunk_size,
            chunk_overlap: chunking.chunk_overlap,
            batch_size: 64,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn ingest(&self, document: &Document) -> Result<IngestionReport, PipelineError> {
        let chunks = chunk_text(document, self.chunk_size, self.chunk_overlap);
        if chunks.is_empty() {
            return Ok(IngestionReport::default());
        }

        let mut report = IngestionReport::default();
        let mut seen = HashSet::new();
        let mut fresh: Vec<Chunk> = Vec::new();
        for chunk in chunks {
            if !seen.insert(chunk.hash.clone()) || self.index_has(&chunk.hash).await? {
                report.chunks_deduplicated += 1;
                continue;
            }
            fresh.push(chunk);
        }

        if fresh.is_empty() {
            tracing::info!(
                source_id = %document.source_id,
                deduplicated = report.chunks_deduplicated,
                "nothing new to ingest"
            );
            return Ok(report);
        }

        let mut vectors = Vec::with_capacity(fresh.len());
        for batch in fresh.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embedded = self.embedder.embed(&texts).await.map_err(|e| {
                tracing::warn!(source_id = %document.source_id, error = %e, "embedding failed, document not committed");
                e
            })?;
            if embedded.len() != texts.len() {
                return Err(PipelineError::ProviderUnavailable(format!(
                    "embedder returned {} vectors for {} chunks",
                    embedded.len(),
                    texts.len()
                )));
            }
            vectors.extend(embedded);
        }

        let entries = fresh.into_iter().zip(vectors).collect();
        let commit = self
            .index
            .commit(document, entries)
            .await
            .map_err(|e| PipelineError::Index(format!("{:#}", e)))?;

        report.chunks_inserted += commit.inserted;
        report.chunks_deduplicated += commit.deduplicated;

        tracing::info!(
            source_id = %document.source_id,
            collection = self.index.collection(),
            inserted = report.chunks_inserted,
            deduplicated = report.chunks_deduplicated,
            "document ingested"
        );
        Ok(report)
    }

    /// Load and ingest every supported file under `path`.
    ///
    /// Files are ingested in source-id order; the first failure stops the
    /// run, leaving earlier documents committed.
    pub async fn ingest_path(
        &self,
        path: &Path,
        config: &IngestConfig,
    ) -> Result<Vec<(String, IngestionReport)>> {
        let docs = loader::load_path(path, config)?;
        let mut reports = Vec::with_capacity(docs.len());
        for doc in docs {
            let report = self.ingest(&doc).await?;
            reports.push((doc.source_id.clone(), report));
        }
        Ok(reports)
    }

    async fn index_has(&self, hash: &str) -> Result<bool, PipelineError> {
        self.index
            .contains_hash(hash)
            .await
            .map_err(|e| PipelineError::Index(format!("{:#}", e)))
    }
}

/// `forge ingest <paths...>`
pub async fn run_ingest(config: &Config, paths: &[PathBuf]) -> Result<()> {
    let app = App::open(config).await?;
    let ingestor = app.ingestor();

    for path in paths {
        let reports = ingestor.ingest_path(path, &config.ingest).await?;
        let inserted: usize = reports.iter().map(|(_, r)| r.chunks_inserted).sum();
        let deduplicated: usize = reports.iter().map(|(_, r)| r.chunks_deduplicated).sum();

        println!("ingest {}", path.display());
        println!("  documents: {}", reports.len());
        println!("  chunks inserted: {}", inserted);
        println!("  chunks deduplicated: {}", deduplicated);
    }
    println!("ok");

    app.pool.close().await;
    Ok(())
}
