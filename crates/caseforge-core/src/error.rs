//! Pipeline error types.
//!
//! [`PipelineError`] is the typed failure surface of every pipeline stage.
//! Transport retries and semantic retries are absorbed below this level;
//! what reaches a caller is either a provider failure, an exhausted retry
//! budget, a cancellation, or a configuration problem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::state::Stage;

/// Why an agent's raw output was rejected.
///
/// `record` is the zero-based index of the offending record or script
/// block; `field` names the missing or ill-typed field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub record: Option<usize>,
    pub field: Option<String>,
    pub reason: String,
}

impl ValidationFailure {
    pub fn body(reason: impl Into<String>) -> Self {
        Self {
            record: None,
            field: None,
            reason: reason.into(),
        }
    }

    pub fn record(index: usize, reason: impl Into<String>) -> Self {
        Self {
            record: Some(index),
            field: None,
            reason: reason.into(),
        }
    }

    pub fn field(index: usize, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            record: Some(index),
            field: Some(field.into()),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.record, &self.field) {
            (Some(i), Some(field)) => write!(f, "record {}: field '{}': {}", i, field, self.reason),
            (Some(i), None) => write!(f, "record {}: {}", i, self.reason),
            (None, Some(field)) => write!(f, "field '{}': {}", field, self.reason),
            (None, None) => f.write_str(&self.reason),
        }
    }
}

impl std::error::Error for ValidationFailure {}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    /// Embedding or generation provider failed after transport retries.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider signalled rate limiting on the final transport attempt.
    #[error("rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// One agent output failed validation. The orchestrator retries these
    /// and only reports [`PipelineError::RetryExhausted`]; this variant is
    /// for callers that run the validators directly and use `?`.
    #[error("validation failed: {0}")]
    Validation(ValidationFailure),

    #[error("retries exhausted at {stage} stage after {attempts} attempts: {last}")]
    RetryExhausted {
        stage: Stage,
        attempts: u32,
        last: ValidationFailure,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The chunk index failed to read or write.
    #[error("index error: {0}")]
    Index(String),
}

impl PipelineError {
    /// Machine-readable code used in status and HTTP responses.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::ProviderUnavailable(_) => "provider_unavailable",
            PipelineError::RateLimited { .. } => "rate_limited",
            PipelineError::Validation(_) => "validation_error",
            PipelineError::RetryExhausted { .. } => "retry_exhausted",
            PipelineError::Config(_) => "config_error",
            PipelineError::Cancelled => "cancelled",
            PipelineError::InvalidRequest(_) => "invalid_request",
            PipelineError::Index(_) => "index_error",
        }
    }

    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::ProviderUnavailable(_) | PipelineError::RateLimited { .. }
        )
    }
}

impl From<ValidationFailure> for PipelineError {
    fn from(failure: ValidationFailure) -> Self {
        PipelineError::Validation(failure)
    }
}
