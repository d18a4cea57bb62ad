//! Request orchestration.
//!
//! Each [`GenerationRequest`] runs as one sequential tokio task:
//!
//! ```text
//! IDLE → RETRIEVING → GENERATING_TESTCASES ⇄ VALIDATING_TESTCASES
//!      → GENERATING_SCRIPT ⇄ VALIDATING_SCRIPT → DONE
//! ```
//!
//! A rejected agent output is fed back to the same agent together with
//! the validator's reason, up to `max_retries` more times per stage; the
//! two stages count attempts independently. Any provider error, an
//! exhausted stage, or a cancellation ends in `FAILED`.
//!
//! Cancellation is cooperative: the flag is checked before every
//! retriever, agent and validator call, so an LLM call already in flight
//! finishes but its output is thrown away. Submitting a new request for a
//! session cancels that session's previous request.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

use caseforge_core::error::{PipelineError, ValidationFailure};
use caseforge_core::models::{Chunk, GenerationOutput, TestCase};
use caseforge_core::prompt::Correction;
use caseforge_core::selectors::extract_selectors;
use caseforge_core::state::{RequestState, Stage};
use caseforge_core::validate::{validate_script, validate_testcases, ValidationResult};

use crate::agents::{ScriptAgent, TestCaseAgent};
use crate::config::Config;
use crate::llm::{CompletionOptions, LlmClient};
use crate::retrieve::Retriever;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub top_k: usize,
    /// Semantic retries per stage.
    pub max_retries: u32,
    pub default_framework: String,
    pub completion: CompletionOptions,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            max_retries: config.generation.max_retries,
            default_framework: config.generation.framework.clone(),
            completion: CompletionOptions {
                temperature: config.generation.temperature,
                max_tokens: config.generation.max_tokens,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageAttempts {
    pub testcases: u32,
    pub script: u32,
}

impl StageAttempts {
    fn bump(&mut self, stage: Stage) -> u32 {
        let counter = match stage {
            Stage::Testcases => &mut self.testcases,
            Stage::Script => &mut self.script,
        };
        *counter += 1;
        *counter
    }
}

/// One raw agent response and what the validator made of it.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub stage: Stage,
    pub attempt: u32,
    pub raw: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ValidationFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureInfo {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

impl From<&PipelineError> for FailureInfo {
    fn from(err: &PipelineError) -> Self {
        let stage = match err {
            PipelineError::RetryExhausted { stage, .. } => Some(*stage),
            _ => None,
        };
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            stage,
        }
    }
}

/// The full record of one generation request.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub id: String,
    pub session_id: String,
    pub requirement: String,
    pub framework: String,
    pub state: RequestState,
    pub history: Vec<RequestState>,
    pub attempts: StageAttempts,
    pub audit: Vec<AuditEntry>,
    pub result: Option<GenerationOutput>,
    pub failure: Option<FailureInfo>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl GenerationRequest {
    fn new(session_id: &str, requirement: &str, framework: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            requirement: requirement.to_string(),
            framework,
            state: RequestState::Idle,
            history: vec![RequestState::Idle],
            attempts: StageAttempts::default(),
            audit: Vec::new(),
            result: None,
            failure: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Apply a transition if the state machine allows it.
    fn transition(&mut self, next: RequestState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(request_id = %self.id, from = %self.state, to = %next, "illegal transition ignored");
            return false;
        }
        self.state = next;
        self.history.push(next);
        true
    }
}

/// Externally visible view of a request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestStatus {
    pub request_id: String,
    pub session_id: String,
    pub state: RequestState,
    pub attempts: StageAttempts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GenerationOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
}

impl From<&GenerationRequest> for RequestStatus {
    fn from(r: &GenerationRequest) -> Self {
        Self {
            request_id: r.id.clone(),
            session_id: r.session_id.clone(),
            state: r.state,
            attempts: r.attempts,
            result: r.result.clone(),
            failure: r.failure.clone(),
        }
    }
}

struct RequestHandle {
    id: String,
    cancelled: AtomicBool,
    record: Mutex<GenerationRequest>,
    state_tx: watch::Sender<RequestState>,
}

impl RequestHandle {
    fn new(record: GenerationRequest) -> Self {
        let (state_tx, _) = watch::channel(record.state);
        Self {
            id: record.id.clone(),
            cancelled: AtomicBool::new(false),
            record: Mutex::new(record),
            state_tx,
        }
    }

    fn record(&self) -> MutexGuard<'_, GenerationRequest> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    fn transition(&self, next: RequestState) {
        let moved = self.record().transition(next);
        if moved {
            tracing::debug!(state = %next, "state change");
            self.state_tx.send_replace(next);
        }
    }
}

/// Terminal requests kept for polling once their session has moved on.
const MAX_TERMINAL_REQUESTS: usize = 256;

#[derive(Default)]
struct Registry {
    requests: HashMap<String, Arc<RequestHandle>>,
    sessions: HashMap<String, String>,
}

impl Registry {
    /// Drop terminal requests that are no longer their session's latest,
    /// then the oldest finished ones beyond `max_terminal`.
    fn archive(&mut self, max_terminal: usize) {
        let sessions = &self.sessions;
        self.requests.retain(|id, handle| {
            let record = handle.record();
            !record.state.is_terminal() || sessions.get(&record.session_id) == Some(id)
        });

        let mut finished: Vec<(DateTime<Utc>, String)> = self
            .requests
            .values()
            .filter_map(|handle| {
                let record = handle.record();
                let finished_at = record.finished_at.unwrap_or(record.created_at);
                let terminal = record.state.is_terminal();
                terminal.then(|| (finished_at, handle.id.clone()))
            })
            .collect();
        if finished.len() <= max_terminal {
            return;
        }
        finished.sort();
        let excess = finished.len() - max_terminal;
        for (_, id) in finished.into_iter().take(excess) {
            self.requests.remove(&id);
        }
    }
}

struct Shared {
    retriever: Retriever,
    testcase_agent: TestCaseAgent,
    script_agent: ScriptAgent,
    settings: OrchestratorSettings,
    registry: Mutex<Registry>,
}

#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(retriever: Retriever, llm: Arc<LlmClient>, settings: OrchestratorSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                retriever,
                testcase_agent: TestCaseAgent::new(llm.clone(), settings.completion),
                script_agent: ScriptAgent::new(llm, settings.completion),
                settings,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn register(
        &self,
        session_id: &str,
        requirement: &str,
        framework: Option<String>,
    ) -> Result<Arc<RequestHandle>, PipelineError> {
        if requirement.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "requirement text must not be empty".into(),
            ));
        }
        let framework = framework
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| self.shared.settings.default_framework.clone());

        let handle = Arc::new(RequestHandle::new(GenerationRequest::new(
            session_id,
            requirement,
            framework,
        )));

        let mut registry = self.registry();
        if let Some(prev_id) = registry
            .sessions
            .insert(session_id.to_string(), handle.id.clone())
        {
            if let Some(prev) = registry.requests.get(&prev_id) {
                if !prev.record().state.is_terminal() {
                    tracing::info!(request_id = %prev_id, session_id, "superseded by new request");
                    prev.cancelled.store(true, Ordering::SeqCst);
                }
            }
        }
        registry.archive(MAX_TERMINAL_REQUESTS);
        registry.requests.insert(handle.id.clone(), handle.clone());
        Ok(handle)
    }

    /// Start a request in the background and return its id.
    pub fn submit(
        &self,
        session_id: &str,
        requirement: &str,
        framework: Option<String>,
    ) -> Result<String, PipelineError> {
        let handle = self.register(session_id, requirement, framework)?;
        let id = handle.id.clone();
        let this = self.clone();
        let span = tracing::info_span!("request", request_id = %id);
        tokio::spawn(
            async move {
                // The outcome is recorded on the handle for `poll`.
                let _ = this.drive(&handle).await;
            }
            .instrument(span),
        );
        Ok(id)
    }

    /// Run a request to completion on the current task.
    pub async fn run(
        &self,
        session_id: &str,
        requirement: &str,
        framework: Option<String>,
    ) -> Result<GenerationOutput, PipelineError> {
        let handle = self.register(session_id, requirement, framework)?;
        let span = tracing::info_span!("request", request_id = %handle.id);
        self.drive(&handle).instrument(span).await
    }

    pub fn poll(&self, request_id: &str) -> Option<RequestStatus> {
        let handle = self.registry().requests.get(request_id).cloned()?;
        let status = RequestStatus::from(&*handle.record());
        Some(status)
    }

    /// Full record including state history and the raw-response audit.
    pub fn request(&self, request_id: &str) -> Option<GenerationRequest> {
        let handle = self.registry().requests.get(request_id).cloned()?;
        let record = handle.record().clone();
        Some(record)
    }

    /// Flag a request for cancellation. Returns `false` if it is unknown
    /// or already terminal.
    pub fn cancel(&self, request_id: &str) -> bool {
        let Some(handle) = self.registry().requests.get(request_id).cloned() else {
            return false;
        };
        if handle.record().state.is_terminal() {
            return false;
        }
        handle.cancelled.store(true, Ordering::SeqCst);
        tracing::info!(request_id, "cancellation requested");
        true
    }

    /// Wait until the request reaches `DONE` or `FAILED`.
    pub async fn wait(&self, request_id: &str) -> Option<RequestStatus> {
        let handle = self.registry().requests.get(request_id).cloned()?;
        let mut rx = handle.state_tx.subscribe();
        // The sender lives in `handle`, so the channel cannot close here.
        let _ = rx.wait_for(|s| s.is_terminal()).await;
        let status = RequestStatus::from(&*handle.record());
        Some(status)
    }

    async fn drive(&self, handle: &RequestHandle) -> Result<GenerationOutput, PipelineError> {
        let outcome = match self.execute(handle).await {
            Ok(_) if handle.is_cancelled() => Err(PipelineError::Cancelled),
            other => other,
        };

        match &outcome {
            Ok(output) => {
                handle.record().result = Some(output.clone());
                handle.transition(RequestState::Done);
                tracing::info!(
                    test_cases = output.test_cases.len(),
                    scripts = output.scripts.len(),
                    "request done"
                );
            }
            Err(err) => {
                handle.record().failure = Some(FailureInfo::from(err));
                handle.transition(RequestState::Failed);
                tracing::warn!(code = err.code(), error = %err, "request failed");
            }
        }
        handle.record().finished_at = Some(Utc::now());
        outcome
    }

    async fn execute(&self, handle: &RequestHandle) -> Result<GenerationOutput, PipelineError> {
        let (requirement, framework) = {
            let record = handle.record();
            (record.requirement.clone(), record.framework.clone())
        };
        let shared = &*self.shared;

        handle.check_cancelled()?;
        handle.transition(RequestState::Retrieving);
        let context = shared
            .retriever
            .retrieve(&requirement, shared.settings.top_k)
            .await?;
        tracing::info!(chunks = context.len(), "context retrieved");

        let testcase_agent = &shared.testcase_agent;
        let context_ref = &context;
        let requirement_ref = requirement.as_str();
        let mut cases = self
            .run_stage(
                handle,
                Stage::Testcases,
                move |prev| async move {
                    let correction = prev.as_ref().map(|(out, failure)| Correction {
                        previous_output: out,
                        failure,
                    });
                    testcase_agent
                        .generate(requirement_ref, context_ref, correction)
                        .await
                },
                validate_testcases,
            )
            .await?;
        attach_provenance(&mut cases, &context);

        let selectors = selector_inventory(&context);
        let case_ids: Vec<String> = cases.iter().map(|c| c.id.clone()).collect();
        let script_agent = &shared.script_agent;
        let cases_ref = &cases;
        let framework_ref = framework.as_str();
        let selectors_ref = &selectors;
        let scripts = self
            .run_stage(
                handle,
                Stage::Script,
                move |prev| async move {
                    let correction = prev.as_ref().map(|(out, failure)| Correction {
                        previous_output: out,
                        failure,
                    });
                    script_agent
                        .generate(cases_ref, framework_ref, selectors_ref, correction)
                        .await
                },
                |raw| validate_script(raw, &case_ids, framework_ref),
            )
            .await?;

        handle.check_cancelled()?;
        Ok(GenerationOutput {
            test_cases: cases,
            scripts,
        })
    }

    /// Generate and validate until accepted or out of attempts.
    async fn run_stage<T, G, Fut, V>(
        &self,
        handle: &RequestHandle,
        stage: Stage,
        mut generate: G,
        validate: V,
    ) -> Result<T, PipelineError>
    where
        G: FnMut(Option<(String, ValidationFailure)>) -> Fut,
        Fut: Future<Output = Result<String, PipelineError>>,
        V: Fn(&str) -> ValidationResult<T>,
    {
        let (generating, validating) = match stage {
            Stage::Testcases => (
                RequestState::GeneratingTestcases,
                RequestState::ValidatingTestcases,
            ),
            Stage::Script => (
                RequestState::GeneratingScript,
                RequestState::ValidatingScript,
            ),
        };
        let max_attempts = self.shared.settings.max_retries + 1;
        let mut previous: Option<(String, ValidationFailure)> = None;

        loop {
            handle.check_cancelled()?;
            handle.transition(generating);
            let attempt = handle.record().attempts.bump(stage);
            tracing::info!(%stage, attempt, "generating");

            let raw = generate(previous.take()).await?;
            handle.record().audit.push(AuditEntry {
                stage,
                attempt,
                raw: raw.clone(),
                accepted: false,
                failure: None,
            });

            handle.check_cancelled()?;
            handle.transition(validating);
            let verdict = validate(&raw);

            let failure = {
                let mut record = handle.record();
                let entry = record.audit.last_mut();
                match verdict {
                    Ok(value) => {
                        if let Some(entry) = entry {
                            entry.accepted = true;
                        }
                        return Ok(value);
                    }
                    Err(failure) => {
                        if let Some(entry) = entry {
                            entry.failure = Some(failure.clone());
                        }
                        failure
                    }
                }
            };

            tracing::warn!(%stage, attempt, reason = %failure, "output rejected");
            if attempt >= max_attempts {
                return Err(PipelineError::RetryExhausted {
                    stage,
                    attempts: attempt,
                    last: failure,
                });
            }
            previous = Some((raw, failure));
        }
    }
}

/// Resolve each case's cited context numbers into chunk ids; a case that
/// cites nothing usable is attributed to the whole context.
fn attach_provenance(cases: &mut [TestCase], context: &[Chunk]) {
    let all: Vec<String> = context.iter().map(|c| c.id.clone()).collect();
    for case in cases.iter_mut() {
        let mut cited: Vec<String> = Vec::new();
        for n in &case.sources {
            if let Some(chunk) = n.checked_sub(1).and_then(|i| context.get(i)) {
                if !cited.contains(&chunk.id) {
                    cited.push(chunk.id.clone());
                }
            }
        }
        case.provenance = if cited.is_empty() { all.clone() } else { cited };
    }
}

fn selector_inventory(context: &[Chunk]) -> Vec<String> {
    let html: Vec<&str> = context
        .iter()
        .map(|c| c.text.as_str())
        .filter(|t| t.contains('<') && t.contains('>'))
        .collect();
    if html.is_empty() {
        return Vec::new();
    }
    extract_selectors(&html.join("\n"))
}
