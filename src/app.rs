//! Wiring from a [`Config`] to the live pipeline components.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;

use caseforge_core::embedding::EmbeddingProvider;

use crate::config::{config_error, Config};
use crate::db;
use crate::embedding::create_provider;
use crate::ingest::DocumentIngestor;
use crate::llm::create_client;
use crate::migrate;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::retrieve::Retriever;
use crate::sqlite_store::SqliteIndex;

pub struct App {
    pub config: Config,
    pub pool: SqlitePool,
    pub index: Arc<SqliteIndex>,
    pub embedder: Arc<dyn EmbeddingProvider>,
}

impl App {
    /// Open the database (creating the schema if needed) and build the
    /// configured embedding provider.
    pub async fn open(config: &Config) -> Result<Self> {
        let embedder = create_provider(&config.embedding)
            .map_err(config_error)
            .context("Failed to create embedding provider")?;
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let index = Arc::new(SqliteIndex::new(
            pool.clone(),
            config.db.collection.clone(),
            embedder.model_name(),
        ));
        Ok(Self {
            config: config.clone(),
            pool,
            index,
            embedder,
        })
    }

    pub fn ingestor(&self) -> DocumentIngestor {
        DocumentIngestor::new(self.index.clone(), self.embedder.clone(), &self.config.chunking)
            .with_batch_size(self.config.embedding.batch_size)
    }

    pub fn retriever(&self) -> Retriever {
        Retriever::new(self.index.clone(), self.embedder.clone())
    }

    /// Fails with a config error when the generation provider cannot be
    /// built, e.g. its API key variable is unset.
    pub fn orchestrator(&self) -> Result<Orchestrator> {
        let llm = create_client(&self.config.generation)
            .map_err(config_error)
            .context("Failed to create LLM client")?;
        Ok(Orchestrator::new(
            self.retriever(),
            Arc::new(llm),
            OrchestratorSettings::from_config(&self.config),
        ))
    }
}
