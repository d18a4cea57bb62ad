//! Core data models.
//!
//! Documents and chunks flow through ingestion into the chunk index;
//! test cases and scripts are what a generation request produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A raw requirement or support document, immutable once ingested.
///
/// The `id` is derived from `source_id` and `body`, so ingesting the same
/// text under the same source always yields the same document id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub source_id: String,
    pub title: Option<String>,
    pub content_type: String,
    pub body: String,
    pub ingested_at: DateTime<Utc>,
}

impl Document {
    pub fn new(source_id: impl Into<String>, body: impl Into<String>) -> Self {
        let source_id = source_id.into();
        let body = body.into();
        Self {
            id: document_id(&source_id, &body),
            source_id,
            title: None,
            content_type: "text/plain".to_string(),
            body,
            ingested_at: Utc::now(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

/// Deterministic document id: the first 16 bytes of
/// `SHA-256(source_id || 0x00 || body)` formatted as a UUID.
pub fn document_id(source_id: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(body.as_bytes());
    uuid_from_digest(&hasher.finalize())
}

pub(crate) fn uuid_from_digest(digest: &[u8]) -> String {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

/// A bounded span of a document's text.
///
/// `hash` is the SHA-256 of `text` and is the dedup key inside a collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    /// Source id of the parent document, carried for prompt attribution.
    pub source_id: String,
    pub text: String,
    pub hash: String,
}

/// A chunk paired with its similarity to a query vector.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Counts returned by the document ingestor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestionReport {
    pub chunks_inserted: usize,
    pub chunks_deduplicated: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestStep {
    pub action: String,
    pub expected: String,
}

/// A validated test case.
///
/// `provenance` holds the ids of the chunks that supported generation.
/// `sources` holds the 1-based context numbers the model cited, if any;
/// the orchestrator resolves them into `provenance`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestCase {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub preconditions: Vec<String>,
    pub steps: Vec<TestStep>,
    pub expected_result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default)]
    pub provenance: Vec<String>,
    #[serde(default, skip_serializing)]
    pub sources: Vec<usize>,
}

/// An executable script bound to exactly one test case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestScript {
    pub id: String,
    pub test_case_id: String,
    pub framework: String,
    pub code: String,
}

/// The final output of a successful generation request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationOutput {
    pub test_cases: Vec<TestCase>,
    pub scripts: Vec<TestScript>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_is_deterministic() {
        let a = Document::new("login.md", "Login requires username and password fields");
        let b = Document::new("login.md", "Login requires username and password fields");
        assert_eq!(a.id, b.id);
        assert!(Uuid::parse_str(&a.id).is_ok());
    }

    #[test]
    fn test_document_id_depends_on_source() {
        assert_ne!(document_id("a.md", "same"), document_id("b.md", "same"));
    }

    #[test]
    fn test_sources_not_serialized() {
        let case = TestCase {
            id: "TC001".into(),
            title: "t".into(),
            description: None,
            preconditions: vec![],
            steps: vec![TestStep {
                action: "a".into(),
                expected: "e".into(),
            }],
            expected_result: "ok".into(),
            source_file: None,
            provenance: vec!["c1".into()],
            sources: vec![1],
        };
        let json = serde_json::to_value(&case).unwrap();
        assert!(json.get("sources").is_none());
        assert_eq!(json["provenance"][0], "c1");
    }
}
