//! LLM client.
//!
//! [`ChatBackend`] performs exactly one chat-completion attempt and
//! classifies how it failed. [`LlmClient`] wraps a backend with:
//!
//! - a per-attempt timeout (timeouts count as transient failures),
//! - exponential backoff over transient and rate-limit failures,
//!   `base × 2^(attempt-1)` capped at `2^5 × base`, or the provider's
//!   `Retry-After` when it sends one,
//! - a semaphore bounding concurrent calls; callers past the bound queue.
//!
//! Permanent failures (4xx other than 429, malformed bodies) are not
//! retried. Exhaustion yields `RateLimited` if the last attempt was rate
//! limited, `ProviderUnavailable` otherwise.

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use caseforge_core::error::PipelineError;
use caseforge_core::prompt::LlmPrompt;

use crate::config::GenerationConfig;

/// Per-call generation options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: None,
        }
    }
}

/// How a single backend attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Network error, timeout or 5xx. Retried.
    Transient(String),
    /// HTTP 429. Retried, honouring `retry_after` when present.
    RateLimited { retry_after: Option<Duration> },
    /// Anything retrying will not fix.
    Permanent(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Transient(msg) => write!(f, "transient: {}", msg),
            BackendError::RateLimited { retry_after } => {
                write!(f, "rate limited (retry after {:?})", retry_after)
            }
            BackendError::Permanent(msg) => write!(f, "permanent: {}", msg),
        }
    }
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;

    /// One attempt. No retries, no timeout.
    async fn chat(
        &self,
        prompt: &LlmPrompt,
        options: &CompletionOptions,
    ) -> std::result::Result<String, BackendError>;
}

pub struct LlmClient {
    backend: Arc<dyn ChatBackend>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    transport_retries: u32,
    backoff_base: Duration,
}

impl LlmClient {
    pub fn new(backend: Arc<dyn ChatBackend>, max_concurrent_calls: usize) -> Self {
        Self {
            backend,
            permits: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
            timeout: Duration::from_secs(60),
            transport_retries: 3,
            backoff_base: Duration::from_millis(500),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_transport_retries(mut self, retries: u32) -> Self {
        self.transport_retries = retries;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn from_config(backend: Arc<dyn ChatBackend>, config: &GenerationConfig) -> Self {
        Self::new(backend, config.max_concurrent_llm_calls)
            .with_timeout(config.llm_timeout())
            .with_transport_retries(config.transport_retries)
            .with_backoff_base(config.backoff_base())
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Delay before retry number `attempt` (1-based).
    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * (1u32 << (attempt - 1).min(5))
    }

    /// A provider's `Retry-After` wins over the computed backoff but never
    /// exceeds the largest computed delay.
    fn retry_delay(&self, attempt: u32, last_err: Option<&BackendError>) -> Duration {
        match last_err {
            Some(BackendError::RateLimited {
                retry_after: Some(d),
            }) => (*d).min(self.backoff_base * (1u32 << 5)),
            _ => self.backoff(attempt),
        }
    }

    pub async fn complete(
        &self,
        prompt: &LlmPrompt,
        options: &CompletionOptions,
    ) -> std::result::Result<String, PipelineError> {
        let mut last_err: Option<BackendError> = None;

        for attempt in 0..=self.transport_retries {
            if attempt > 0 {
                let delay = self.retry_delay(attempt, last_err.as_ref());
                tracing::warn!(
                    backend = self.backend.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_err.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                    "retrying LLM call"
                );
                tokio::time::sleep(delay).await;
            }

            let result = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| PipelineError::ProviderUnavailable("LLM client closed".into()))?;
                tokio::time::timeout(self.timeout, self.backend.chat(prompt, options)).await
            };

            match result {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(BackendError::Permanent(msg))) => {
                    return Err(PipelineError::ProviderUnavailable(msg));
                }
                Ok(Err(err)) => last_err = Some(err),
                Err(_) => {
                    last_err = Some(BackendError::Transient(format!(
                        "timed out after {}s",
                        self.timeout.as_secs_f32()
                    )))
                }
            }
        }

        Err(match last_err {
            Some(BackendError::RateLimited { retry_after }) => {
                PipelineError::RateLimited { retry_after }
            }
            Some(err) => PipelineError::ProviderUnavailable(format!(
                "{} failed after {} attempts: {}",
                self.backend.name(),
                self.transport_retries + 1,
                err
            )),
            None => PipelineError::ProviderUnavailable("no attempts made".into()),
        })
    }
}

/// `Retry-After` as delay-seconds. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn classify_status(status: reqwest::StatusCode, headers: &HeaderMap, body: String) -> BackendError {
    if status.as_u16() == 429 {
        BackendError::RateLimited {
            retry_after: parse_retry_after(headers),
        }
    } else if status.is_server_error() {
        BackendError::Transient(format!("HTTP {}: {}", status, body))
    } else {
        BackendError::Permanent(format!("HTTP {}: {}", status, body))
    }
}

fn messages(prompt: &LlmPrompt) -> serde_json::Value {
    json!([
        { "role": "system", "content": prompt.system },
        { "role": "user", "content": prompt.user },
    ])
}

// ============ OpenAI-compatible backend ============

/// `POST {base_url}/chat/completions`. Works with OpenRouter, OpenAI and
/// other compatible gateways.
pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatBackend {
    pub fn new(base_url: &str, api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat(
        &self,
        prompt: &LlmPrompt,
        options: &CompletionOptions,
    ) -> std::result::Result<String, BackendError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages(prompt),
            "temperature": options.temperature,
        });
        if let Some(max) = options.max_tokens {
            body["max_tokens"] = json!(max);
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Transient(format!("connection error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::Permanent(format!("unreadable response: {}", e)))?;

        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BackendError::Permanent("response has no choices[0].message.content".into()))
    }
}

// ============ Ollama backend ============

pub struct OllamaChatBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaChatBackend {
    pub fn new(base_url: &str, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }
}

#[async_trait]
impl ChatBackend for OllamaChatBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn chat(
        &self,
        prompt: &LlmPrompt,
        options: &CompletionOptions,
    ) -> std::result::Result<String, BackendError> {
        let mut model_options = json!({ "temperature": options.temperature });
        if let Some(max) = options.max_tokens {
            model_options["num_predict"] = json!(max);
        }
        let body = json!({
            "model": self.model,
            "messages": messages(prompt),
            "stream": false,
            "options": model_options,
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Transient(format!("connection error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::Permanent(format!("unreadable response: {}", e)))?;

        json.pointer("/message/content")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BackendError::Permanent("response has no message.content".into()))
    }
}

// ============ Disabled backend ============

pub struct DisabledBackend;

#[async_trait]
impl ChatBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn chat(
        &self,
        _prompt: &LlmPrompt,
        _options: &CompletionOptions,
    ) -> std::result::Result<String, BackendError> {
        Err(BackendError::Permanent("generation provider is disabled".into()))
    }
}

/// Build the backend named by `generation.provider`.
///
/// For `openai` the API key is read from the variable named by
/// `generation.api_key_env`; a missing key is a configuration error.
pub fn create_backend(config: &GenerationConfig) -> Result<Arc<dyn ChatBackend>> {
    let model = config.model.clone().unwrap_or_default();
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledBackend)),
        "openai" => {
            let api_key = std::env::var(&config.api_key_env).map_err(|_| {
                anyhow::anyhow!("{} environment variable not set", config.api_key_env)
            })?;
            Ok(Arc::new(OpenAiCompatBackend::new(
                &config.base_url,
                api_key,
                model,
            )))
        }
        "ollama" => Ok(Arc::new(OllamaChatBackend::new(&config.base_url, model))),
        other => bail!("Unknown generation provider: {}", other),
    }
}

pub fn create_client(config: &GenerationConfig) -> Result<LlmClient> {
    Ok(LlmClient::from_config(create_backend(config)?, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<std::result::Result<String, BackendError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(replies: Vec<std::result::Result<String, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            })
        }
        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ChatBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn chat(
            &self,
            _prompt: &LlmPrompt,
            _options: &CompletionOptions,
        ) -> std::result::Result<String, BackendError> {
            *self.calls.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::Transient("script exhausted".into())))
        }
    }

    fn prompt() -> LlmPrompt {
        LlmPrompt {
            system: "sys".into(),
            user: "user".into(),
        }
    }

    fn client(backend: Arc<Scripted>) -> LlmClient {
        LlmClient::new(backend, 2)
            .with_transport_retries(2)
            .with_backoff_base(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let backend = Scripted::new(vec![
            Err(BackendError::Transient("reset".into())),
            Ok("done".into()),
        ]);
        let out = client(backend.clone())
            .complete(&prompt(), &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(out, "done");
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let backend = Scripted::new(vec![Err(BackendError::Permanent("401".into()))]);
        let err = client(backend.clone())
            .complete(&prompt(), &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ProviderUnavailable(_)));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_rate_limit_surfaces_as_rate_limited() {
        let limited = || {
            Err(BackendError::RateLimited {
                retry_after: Some(Duration::from_millis(1)),
            })
        };
        let backend = Scripted::new(vec![limited(), limited(), limited()]);
        let err = client(backend.clone())
            .complete(&prompt(), &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::RateLimited {
                retry_after: Some(_)
            }
        ));
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_transient_is_unavailable() {
        let backend = Scripted::new(vec![]);
        let err = client(backend.clone())
            .complete(&prompt(), &CompletionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "provider_unavailable");
        assert_eq!(backend.calls(), 3);
    }

    struct Slow;

    #[async_trait]
    impl ChatBackend for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        async fn chat(
            &self,
            _prompt: &LlmPrompt,
            _options: &CompletionOptions,
        ) -> std::result::Result<String, BackendError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let client = LlmClient::new(Arc::new(Slow), 1)
            .with_timeout(Duration::from_millis(10))
            .with_transport_retries(1)
            .with_backoff_base(Duration::from_millis(1));
        let err = client
            .complete(&prompt(), &CompletionOptions::default())
            .await
            .unwrap_err();
        match err {
            PipelineError::ProviderUnavailable(msg) => assert!(msg.contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let c = LlmClient::new(Arc::new(DisabledBackend), 1).with_backoff_base(Duration::from_millis(10));
        assert_eq!(c.backoff(1), Duration::from_millis(10));
        assert_eq!(c.backoff(3), Duration::from_millis(40));
        assert_eq!(c.backoff(9), Duration::from_millis(320));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_retry_after_is_capped() {
        let backend = Scripted::new(vec![
            Err(BackendError::RateLimited {
                retry_after: Some(Duration::from_secs(86_400)),
            }),
            Ok("done".into()),
        ]);
        let client = LlmClient::new(backend.clone(), 1)
            .with_timeout(Duration::from_secs(60))
            .with_transport_retries(1)
            .with_backoff_base(Duration::from_millis(500));

        let started = tokio::time::Instant::now();
        let out = client
            .complete(&prompt(), &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(out, "done");
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(16), "waited {:?}", waited);
        assert!(waited < Duration::from_secs(17), "waited {:?}", waited);
        assert_eq!(backend.calls(), 2);
    }

    #[test]
    fn test_short_retry_after_is_honoured() {
        let c = LlmClient::new(Arc::new(DisabledBackend), 1).with_backoff_base(Duration::from_secs(1));
        let limited = BackendError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(c.retry_delay(1, Some(&limited)), Duration::from_secs(3));
        assert_eq!(c.retry_delay(2, None), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_status_classification() {
        let h = HeaderMap::new();
        assert!(matches!(
            classify_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, &h, String::new()),
            BackendError::Transient(_)
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::UNAUTHORIZED, &h, String::new()),
            BackendError::Permanent(_)
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, &h, String::new()),
            BackendError::RateLimited { retry_after: None }
        ));
    }

    #[test]
    fn test_missing_api_key_is_error() {
        let config = GenerationConfig {
            api_key_env: "CASEFORGE_TEST_KEY_THAT_IS_NOT_SET".into(),
            ..GenerationConfig::default()
        };
        assert!(create_backend(&config).is_err());
    }
}
