//! Query-time retrieval: embed the query text, ask the index for the
//! top `k` chunks.

use anyhow::Result;
use std::sync::Arc;

use caseforge_core::embedding::EmbeddingProvider;
use caseforge_core::error::PipelineError;
use caseforge_core::models::{Chunk, ScoredChunk};
use caseforge_core::store::ChunkIndex;

use crate::app::App;
use crate::config::Config;

#[derive(Clone)]
pub struct Retriever {
    index: Arc<dyn ChunkIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl Retriever {
    pub fn new(index: Arc<dyn ChunkIndex>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { index, embedder }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
    ) -> std::result::Result<Vec<Chunk>, PipelineError> {
        Ok(self
            .retrieve_scored(query, k)
            .await?
            .into_iter()
            .map(|sc| sc.chunk)
            .collect())
    }

    /// Highest score first; equal scores by ascending chunk id.
    pub async fn retrieve_scored(
        &self,
        query: &str,
        k: usize,
    ) -> std::result::Result<Vec<ScoredChunk>, PipelineError> {
        let vector = self.embedder.embed_one(query).await?;
        let hits = self
            .index
            .query(&vector, k)
            .await
            .map_err(|e| PipelineError::Index(format!("{:#}", e)))?;
        tracing::debug!(k, hits = hits.len(), "retrieved context");
        Ok(hits)
    }
}

/// `forge retrieve <query>`
pub async fn run_retrieve(config: &Config, query: &str, k: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        anyhow::bail!("query must not be empty");
    }
    let app = App::open(config).await?;
    let hits = app
        .retriever()
        .retrieve_scored(query, k.unwrap_or(config.retrieval.top_k))
        .await?;

    if hits.is_empty() {
        println!("No results.");
    }
    for (i, hit) in hits.iter().enumerate() {
        let preview: String = hit.chunk.text.chars().take(160).collect();
        println!(
            "{}. [{:.4}] {} (chunk {})",
            i + 1,
            hit.score,
            hit.chunk.source_id,
            hit.chunk.chunk_index
        );
        println!("    id: {}", hit.chunk.id);
        println!("    {}", preview.replace('\n', " "));
    }

    app.pool.close().await;
    Ok(())
}
