//! End-to-end pipeline tests against an in-memory index, the hashing
//! embedder and a scripted chat backend.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Barrier, Notify, Semaphore};

use caseforge::config::ChunkingConfig;
use caseforge::ingest::DocumentIngestor;
use caseforge::llm::{BackendError, ChatBackend, CompletionOptions, LlmClient};
use caseforge::orchestrator::{Orchestrator, OrchestratorSettings};
use caseforge::retrieve::Retriever;
use caseforge_core::embedding::{EmbeddingProvider, HashingEmbedder};
use caseforge_core::error::PipelineError;
use caseforge_core::models::Document;
use caseforge_core::prompt::LlmPrompt;
use caseforge_core::state::{RequestState, Stage};
use caseforge_core::store::memory::InMemoryIndex;
use caseforge_core::store::ChunkIndex;

type Responder = Box<dyn Fn(&LlmPrompt) -> Result<String, BackendError> + Send + Sync>;

struct Scripted {
    respond: Responder,
    prompts: Mutex<Vec<LlmPrompt>>,
    gate: Option<Arc<Semaphore>>,
    entered: Notify,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Scripted {
    fn new(respond: impl Fn(&LlmPrompt) -> Result<String, BackendError> + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            prompts: Mutex::new(Vec::new()),
            gate: None,
            entered: Notify::new(),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn prompt(&self, i: usize) -> LlmPrompt {
        self.prompts.lock().unwrap()[i].clone()
    }
}

#[async_trait]
impl ChatBackend for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(
        &self,
        prompt: &LlmPrompt,
        _options: &CompletionOptions,
    ) -> Result<String, BackendError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        self.entered.notify_one();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            drop(gate.acquire().await.unwrap());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.respond)(prompt)
    }
}

fn is_script_prompt(prompt: &LlmPrompt) -> bool {
    prompt.user.contains("TARGET FRAMEWORK")
}

const LOGIN_CASES: &str = r#"```json
[
  {
    "id": "TC001",
    "title": "Login with valid credentials",
    "preconditions": ["A registered user account exists"],
    "steps": [
      {"action": "Enter a valid username in the username field", "expected": "Username is accepted"},
      {"action": "Enter the matching password in the password field and submit", "expected": "Login is submitted"}
    ],
    "expected_result": "The user lands on the dashboard",
    "sources": [1]
  }
]
```"#;

const TWO_CASES: &str = r#"[
  {"id": "TC001", "title": "Valid login", "steps": [{"action": "Submit valid username and password", "expected": "Dashboard shown"}], "expected_result": "Logged in"},
  {"id": "TC002", "title": "Wrong password", "steps": [{"action": "Submit a wrong password", "expected": "Error shown"}], "expected_result": "Still on login page"}
]"#;

fn python_script(case_id: &str) -> String {
    format!(
        "```python\ndef test_{}(driver):\n    driver.find_element(By.ID, \"username\").send_keys(\"alice\")\n    driver.find_element(By.ID, \"password\").send_keys(\"secret\")\n    assert \"Dashboard\" in driver.title\n```\n",
        case_id.to_lowercase()
    )
}

/// Valid test cases and one valid script per case.
fn happy(prompt: &LlmPrompt) -> Result<String, BackendError> {
    if is_script_prompt(prompt) {
        let ids: Vec<&str> = ["TC001", "TC002"]
            .into_iter()
            .filter(|id| prompt.user.contains(&format!("\"id\": \"{}\"", id)))
            .collect();
        Ok(ids.iter().map(|id| python_script(id)).collect::<Vec<_>>().join("\n"))
    } else {
        Ok(LOGIN_CASES.to_string())
    }
}

async fn login_index() -> (Arc<InMemoryIndex>, Arc<HashingEmbedder>) {
    let index = Arc::new(InMemoryIndex::new());
    let embedder = Arc::new(HashingEmbedder::new(256));
    DocumentIngestor::new(
        index.clone(),
        embedder.clone(),
        &ChunkingConfig {
            chunk_size: 1000,
            chunk_overlap: 200,
        },
    )
    .ingest(&Document::new(
        "login.md",
        "Login requires username and password fields",
    ))
    .await
    .unwrap();
    (index, embedder)
}

fn orchestrator(
    index: Arc<InMemoryIndex>,
    embedder: Arc<HashingEmbedder>,
    backend: Arc<Scripted>,
    max_retries: u32,
    max_concurrent: usize,
) -> Orchestrator {
    let llm = LlmClient::new(backend, max_concurrent)
        .with_transport_retries(1)
        .with_backoff_base(Duration::from_millis(1));
    Orchestrator::new(
        Retriever::new(index, embedder),
        Arc::new(llm),
        OrchestratorSettings {
            top_k: 6,
            max_retries,
            default_framework: "selenium-python".to_string(),
            completion: CompletionOptions::default(),
        },
    )
}

#[tokio::test]
async fn test_login_end_to_end() {
    let (index, embedder) = login_index().await;
    let chunk_ids: Vec<String> = index
        .query(&embedder.embed_text("login"), 10)
        .await
        .unwrap()
        .into_iter()
        .map(|sc| sc.chunk.id)
        .collect();
    let backend = Arc::new(Scripted::new(happy));
    let orch = orchestrator(index, embedder, backend.clone(), 2, 4);

    let output = orch
        .run("s1", "User logs in with valid credentials", None)
        .await
        .unwrap();

    assert_eq!(output.test_cases.len(), 1);
    let case = &output.test_cases[0];
    let steps: String = case
        .steps
        .iter()
        .map(|s| s.action.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    assert!(steps.contains("username"));
    assert!(steps.contains("password"));
    assert_eq!(case.provenance, chunk_ids);

    assert_eq!(output.scripts.len(), 1);
    assert_eq!(output.scripts[0].test_case_id, case.id);
    assert_eq!(output.scripts[0].framework, "selenium-python");
    assert!(output.scripts[0].code.contains("test_tc001"));

    assert_eq!(backend.calls(), 2);
    assert!(backend
        .prompt(0)
        .user
        .contains("Content: Login requires username and password fields"));
}

#[tokio::test]
async fn test_script_ids_match_case_ids() {
    let (index, embedder) = login_index().await;
    let backend = Arc::new(Scripted::new(|p: &LlmPrompt| {
        if is_script_prompt(p) {
            Ok(format!("{}\n{}", python_script("TC001"), python_script("TC002")))
        } else {
            Ok(TWO_CASES.to_string())
        }
    }));
    let orch = orchestrator(index, embedder, backend, 2, 4);

    let output = orch.run("s1", "Login behaviour", Some("pytest".into())).await.unwrap();

    let case_ids: Vec<&str> = output.test_cases.iter().map(|c| c.id.as_str()).collect();
    let script_refs: Vec<&str> = output.scripts.iter().map(|s| s.test_case_id.as_str()).collect();
    assert_eq!(case_ids, vec!["TC001", "TC002"]);
    assert_eq!(script_refs, case_ids);
    assert!(output.scripts.iter().all(|s| s.framework == "pytest"));
}

#[tokio::test]
async fn test_testcase_stage_exhausts_after_max_retries_plus_one() {
    let (index, embedder) = login_index().await;
    let backend = Arc::new(Scripted::new(|_: &LlmPrompt| {
        Ok("Sorry, I can only describe the tests in prose.".to_string())
    }));
    let orch = orchestrator(index, embedder, backend.clone(), 2, 4);

    let id = orch.submit("s1", "User logs in", None).unwrap();
    let status = orch.wait(&id).await.unwrap();

    assert_eq!(status.state, RequestState::Failed);
    assert_eq!(status.attempts.testcases, 3);
    assert_eq!(status.attempts.script, 0);
    let failure = status.failure.unwrap();
    assert_eq!(failure.code, "retry_exhausted");
    assert_eq!(failure.stage, Some(Stage::Testcases));
    assert!(status.result.is_none());
    assert_eq!(backend.calls(), 3);

    let record = orch.request(&id).unwrap();
    assert_eq!(record.audit.len(), 3);
    assert!(record.audit.iter().all(|a| !a.accepted && a.failure.is_some()));
}

#[tokio::test]
async fn test_script_stage_has_its_own_counter() {
    let (index, embedder) = login_index().await;
    let backend = Arc::new(Scripted::new(|p: &LlmPrompt| {
        if is_script_prompt(p) {
            Ok("```python\ndef test_broken(:\n```".to_string())
        } else {
            Ok(LOGIN_CASES.to_string())
        }
    }));
    let orch = orchestrator(index, embedder, backend.clone(), 1, 4);

    let err = orch.run("s1", "User logs in", None).await.unwrap_err();
    match err {
        PipelineError::RetryExhausted { stage, attempts, .. } => {
            assert_eq!(stage, Stage::Script);
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(backend.calls(), 1 + 2);
}

#[tokio::test]
async fn test_rejected_output_is_fed_back() {
    let (index, embedder) = login_index().await;
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let backend = Arc::new(Scripted::new(move |p: &LlmPrompt| {
        if is_script_prompt(p) {
            return Ok(python_script("TC001"));
        }
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(r#"[{"title": "Login", "steps": [{"action": "Log in", "expected": "ok"}]}]"#.to_string())
        } else {
            Ok(LOGIN_CASES.to_string())
        }
    }));
    let orch = orchestrator(index, embedder, backend.clone(), 2, 4);

    let id = orch.submit("s1", "User logs in", None).unwrap();
    let status = orch.wait(&id).await.unwrap();
    assert_eq!(status.state, RequestState::Done);
    assert_eq!(status.attempts.testcases, 2);
    assert_eq!(status.attempts.script, 1);

    let retry_prompt = backend.prompt(1);
    assert!(retry_prompt.user.contains("YOUR PREVIOUS OUTPUT WAS REJECTED"));
    assert!(retry_prompt.user.contains("expected_result"));

    let record = orch.request(&id).unwrap();
    assert_eq!(
        record.history,
        vec![
            RequestState::Idle,
            RequestState::Retrieving,
            RequestState::GeneratingTestcases,
            RequestState::ValidatingTestcases,
            RequestState::GeneratingTestcases,
            RequestState::ValidatingTestcases,
            RequestState::GeneratingScript,
            RequestState::ValidatingScript,
            RequestState::Done,
        ]
    );
}

#[tokio::test]
async fn test_provider_failure_is_not_semantically_retried() {
    let (index, embedder) = login_index().await;
    let backend = Arc::new(Scripted::new(|_: &LlmPrompt| {
        Err(BackendError::Transient("connection reset".into()))
    }));
    let orch = orchestrator(index, embedder, backend.clone(), 2, 4);

    let id = orch.submit("s1", "User logs in", None).unwrap();
    let status = orch.wait(&id).await.unwrap();
    assert_eq!(status.state, RequestState::Failed);
    assert_eq!(status.failure.unwrap().code, "provider_unavailable");
    assert_eq!(status.attempts.testcases, 1);
    // One call plus one transport retry.
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_rate_limit_surfaces() {
    let (index, embedder) = login_index().await;
    let backend = Arc::new(Scripted::new(|_: &LlmPrompt| {
        Err(BackendError::RateLimited {
            retry_after: Some(Duration::from_millis(1)),
        })
    }));
    let orch = orchestrator(index, embedder, backend, 2, 4);

    let err = orch.run("s1", "User logs in", None).await.unwrap_err();
    assert_eq!(err.code(), "rate_limited");
}

#[tokio::test]
async fn test_empty_index_gives_empty_provenance() {
    let index = Arc::new(InMemoryIndex::new());
    let embedder = Arc::new(HashingEmbedder::new(256));
    let backend = Arc::new(Scripted::new(happy));
    let orch = orchestrator(index, embedder, backend.clone(), 2, 4);

    let output = orch.run("s1", "User logs in", None).await.unwrap();
    assert!(output.test_cases[0].provenance.is_empty());
    assert!(backend.prompt(0).user.contains("no supporting documents"));
}

#[tokio::test]
async fn test_empty_requirement_rejected() {
    let (index, embedder) = login_index().await;
    let backend = Arc::new(Scripted::new(happy));
    let orch = orchestrator(index, embedder, backend.clone(), 2, 4);

    let err = orch.submit("s1", "  \n ", None).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_cancel_discards_in_flight_result() {
    let (index, embedder) = login_index().await;
    let chunks_before = index.chunk_count().await.unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(Scripted::new(happy).gated(gate.clone()));
    let orch = orchestrator(index.clone(), embedder, backend.clone(), 2, 4);

    let id = orch.submit("s1", "User logs in", None).unwrap();
    backend.entered.notified().await;
    assert!(orch.cancel(&id));
    gate.add_permits(1);

    let status = orch.wait(&id).await.unwrap();
    assert_eq!(status.state, RequestState::Failed);
    assert_eq!(status.failure.unwrap().code, "cancelled");
    assert!(status.result.is_none());
    assert_eq!(backend.calls(), 1);
    assert_eq!(index.chunk_count().await.unwrap(), chunks_before);

    assert!(!orch.cancel(&id), "terminal requests cannot be cancelled");
    assert!(!orch.cancel("no-such-request"));
}

#[tokio::test]
async fn test_new_request_supersedes_session() {
    let (index, embedder) = login_index().await;
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(Scripted::new(happy).gated(gate.clone()));
    let orch = orchestrator(index, embedder, backend.clone(), 2, 4);

    let first = orch.submit("s1", "User logs in", None).unwrap();
    backend.entered.notified().await;
    let other_session = orch.submit("s2", "User logs out", None).unwrap();
    let second = orch.submit("s1", "User logs in with valid credentials", None).unwrap();
    gate.add_permits(1);

    let first = orch.wait(&first).await.unwrap();
    assert_eq!(first.state, RequestState::Failed);
    assert_eq!(first.failure.unwrap().code, "cancelled");

    let second = orch.wait(&second).await.unwrap();
    assert_eq!(second.state, RequestState::Done);
    assert_eq!(orch.wait(&other_session).await.unwrap().state, RequestState::Done);
}

#[tokio::test]
async fn test_llm_calls_are_bounded() {
    let (index, embedder) = login_index().await;
    let backend = Arc::new(Scripted::new(happy).with_delay(Duration::from_millis(20)));
    let orch = orchestrator(index, embedder, backend.clone(), 2, 2);

    let ids: Vec<String> = (0..6)
        .map(|i| orch.submit(&format!("session-{i}"), "User logs in", None).unwrap())
        .collect();
    for id in &ids {
        assert_eq!(orch.wait(id).await.unwrap().state, RequestState::Done);
    }

    assert_eq!(backend.calls(), 12);
    assert!(backend.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_poll_unknown_request() {
    let (index, embedder) = login_index().await;
    let orch = orchestrator(index, embedder, Arc::new(Scripted::new(happy)), 2, 4);
    assert!(orch.poll("missing").is_none());
}

#[tokio::test]
async fn test_finished_request_is_archived_when_session_moves_on() {
    let (index, embedder) = login_index().await;
    let orch = orchestrator(index, embedder, Arc::new(Scripted::new(happy)), 2, 4);

    let first = orch.submit("s1", "User logs in", None).unwrap();
    assert_eq!(orch.wait(&first).await.unwrap().state, RequestState::Done);
    assert!(orch.poll(&first).is_some());

    let second = orch.submit("s1", "User logs out", None).unwrap();
    assert!(orch.poll(&first).is_none());
    assert_eq!(orch.wait(&second).await.unwrap().state, RequestState::Done);

    for i in 0..20 {
        let id = orch.submit("s1", &format!("Requirement {i}"), None).unwrap();
        orch.wait(&id).await.unwrap();
    }
    assert!(orch.poll(&second).is_none());
}

/// Holds every embedding call until both ingestions have passed their
/// duplicate pre-check.
struct Rendezvous {
    inner: HashingEmbedder,
    barrier: Barrier,
}

#[async_trait]
impl EmbeddingProvider for Rendezvous {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        self.barrier.wait().await;
        self.inner.embed(texts).await
    }
}

#[tokio::test]
async fn test_concurrent_ingestion_never_double_inserts() {
    let index = Arc::new(InMemoryIndex::new());
    let embedder = Arc::new(Rendezvous {
        inner: HashingEmbedder::new(64),
        barrier: Barrier::new(2),
    });
    let chunking = ChunkingConfig {
        chunk_size: 40,
        chunk_overlap: 0,
    };
    let a = DocumentIngestor::new(index.clone(), embedder.clone(), &chunking);
    let b = DocumentIngestor::new(index.clone(), embedder.clone(), &chunking);
    let doc = Document::new("login.md", "Login requires username.\n\nPasswords are masked.");

    let (ra, rb) = tokio::join!(a.ingest(&doc), b.ingest(&doc));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.chunks_inserted + rb.chunks_inserted, 2);
    assert_eq!(ra.chunks_deduplicated + rb.chunks_deduplicated, 2);
    assert!(ra.chunks_inserted == 0 || rb.chunks_inserted == 0);
    assert_eq!(index.chunk_count().await.unwrap(), 2);
}
