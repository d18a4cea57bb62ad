//! Embedding provider implementations.
//!
//! Concrete backends for [`EmbeddingProvider`]:
//! - **hash**: [`HashingEmbedder`], deterministic and offline.
//! - **openai**: [`OpenAIProvider`], `POST /v1/embeddings` with batching and backoff.
//! - **ollama**: [`OllamaProvider`], a local Ollama instance's `/api/embed`.
//! - **local**: `LocalProvider`, fastembed models run in-process
//!   (requires the `local-embeddings-fastembed` feature).
//! - **disabled**: [`DisabledProvider`], every call fails.
//!
//! # Retry Strategy
//!
//! The HTTP providers retry transient failures with exponential backoff:
//! - HTTP 429 and 5xx → retry
//! - other 4xx → fail immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Exhaustion surfaces as `ProviderUnavailable`, or `RateLimited` when the
//! last answer was a 429.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use caseforge_core::embedding::{EmbeddingProvider, HashingEmbedder};
use caseforge_core::error::PipelineError;

use crate::config::EmbeddingConfig;
use crate::llm::parse_retry_after;

/// Build the provider named by `embedding.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "hash" => Ok(Arc::new(HashingEmbedder::new(config.dims.unwrap_or(384)))),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled Provider ============

pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        Err(PipelineError::ProviderUnavailable(
            "embedding provider is disabled".into(),
        ))
    }
}

// ============ Shared HTTP retry loop ============

struct HttpEmbedTarget<'a> {
    label: &'a str,
    url: String,
    bearer: Option<&'a str>,
}

const MAX_RETRY_DELAY: Duration = Duration::from_secs(32);

/// Exponential backoff from one second; a `Retry-After` hint replaces it,
/// clamped to [`MAX_RETRY_DELAY`].
fn retry_delay(attempt: u32, last_err: Option<&PipelineError>) -> Duration {
    match last_err {
        Some(PipelineError::RateLimited {
            retry_after: Some(d),
        }) => (*d).min(MAX_RETRY_DELAY),
        _ => Duration::from_secs(1 << (attempt - 1).min(5)),
    }
}

async fn post_with_retry(
    client: &reqwest::Client,
    target: &HttpEmbedTarget<'_>,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value, PipelineError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = retry_delay(attempt, last_err.as_ref());
            tracing::debug!(provider = target.label, attempt, ?delay, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(&target.url).json(body);
        if let Some(key) = target.bearer {
            req = req.bearer_auth(key);
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json().await.map_err(|e| {
                        PipelineError::ProviderUnavailable(format!(
                            "{} returned an unreadable body: {}",
                            target.label, e
                        ))
                    });
                }

                if status.as_u16() == 429 {
                    last_err = Some(PipelineError::RateLimited {
                        retry_after: parse_retry_after(response.headers()),
                    });
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = PipelineError::ProviderUnavailable(format!(
                    "{} API error {}: {}",
                    target.label, status, body_text
                ));
                if status.is_server_error() {
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                last_err = Some(PipelineError::ProviderUnavailable(format!(
                    "{} connection error: {}",
                    target.label, e
                )));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        PipelineError::ProviderUnavailable(format!("{} embedding failed after retries", target.label))
    }))
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

fn parse_vectors(values: Option<&Vec<serde_json::Value>>, label: &str) -> Result<Vec<Vec<f32>>, PipelineError> {
    let values = values.ok_or_else(|| {
        PipelineError::ProviderUnavailable(format!("Invalid {} response: missing embeddings", label))
    })?;
    values
        .iter()
        .map(|v| {
            v.as_array()
                .map(|xs| xs.iter().map(|x| x.as_f64().unwrap_or(0.0) as f32).collect())
                .ok_or_else(|| {
                    PipelineError::ProviderUnavailable(format!(
                        "Invalid {} response: embedding is not an array",
                        label
                    ))
                })
        })
        .collect()
}

fn check_count(got: usize, want: usize, label: &str) -> Result<(), PipelineError> {
    if got != want {
        return Err(PipelineError::ProviderUnavailable(format!(
            "{} returned {} embeddings for {} inputs",
            label, got, want
        )));
    }
    Ok(())
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            api_key,
            model,
            dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let target = HttpEmbedTarget {
            label: "OpenAI",
            url: "https://api.openai.com/v1/embeddings".to_string(),
            bearer: Some(&self.api_key),
        };
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({ "model": self.model, "input": batch });
            let json = post_with_retry(&self.client, &target, &body, self.max_retries).await?;
            let items: Option<Vec<serde_json::Value>> = json
                .get("data")
                .and_then(|d| d.as_array())
                .map(|data| data.iter().filter_map(|item| item.get("embedding").cloned()).collect());
            let vectors = parse_vectors(items.as_ref(), "OpenAI")?;
            check_count(vectors.len(), batch.len(), "OpenAI")?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance
/// (default `http://localhost:11434`).
pub struct OllamaProvider {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    batch_size: usize,
    max_retries: u32,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let target = HttpEmbedTarget {
            label: "Ollama",
            url: format!("{}/api/embed", self.url),
            bearer: None,
        };
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({ "model": self.model, "input": batch });
            let json = post_with_retry(&self.client, &target, &body, self.max_retries).await?;
            let vectors = parse_vectors(json.get("embeddings").and_then(|e| e.as_array()), "Ollama")?;
            check_count(vectors.len(), batch.len(), "Ollama")?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

// ============ Local Provider (fastembed) ============

/// In-process embeddings via fastembed. The model is downloaded from
/// Hugging Face on first use and cached; later runs are fully offline.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    model_name: String,
    model: fastembed::EmbeddingModel,
    dims: usize,
    batch_size: usize,
    loaded: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let (model, default_dims) = match model_name.as_str() {
            "all-minilm-l6-v2" => (fastembed::EmbeddingModel::AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (fastembed::EmbeddingModel::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (fastembed::EmbeddingModel::BGEBaseENV15, 768),
            "nomic-embed-text-v1.5" => (fastembed::EmbeddingModel::NomicEmbedTextV15, 768),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5",
                other
            ),
        };
        Ok(Self {
            model_name,
            model,
            dims: config.dims.unwrap_or(default_dims),
            batch_size: config.batch_size.max(1),
            loaded: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let texts = texts.to_vec();
        let model = self.model.clone();
        let batch_size = self.batch_size;
        let loaded = self.loaded.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = loaded
                .lock()
                .map_err(|_| PipelineError::ProviderUnavailable("local model lock poisoned".into()))?;
            if guard.is_none() {
                let init = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model).with_show_download_progress(true),
                )
                .map_err(|e| {
                    PipelineError::ProviderUnavailable(format!(
                        "Failed to initialize local embedding model: {}",
                        e
                    ))
                })?;
                *guard = Some(init);
            }
            let embedder = guard
                .as_mut()
                .ok_or_else(|| PipelineError::ProviderUnavailable("local model not loaded".into()))?;
            embedder
                .embed(texts, Some(batch_size))
                .map_err(|e| PipelineError::ProviderUnavailable(format!("Local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| PipelineError::ProviderUnavailable(format!("embedding task failed: {}", e)))?
    }
}
