//! The two generation agents.
//!
//! Both compose a prompt, make one [`LlmClient::complete`] call and hand
//! back the raw response untouched. Parsing and validation belong to the
//! orchestrator.

use std::sync::Arc;

use caseforge_core::error::PipelineError;
use caseforge_core::models::{Chunk, TestCase};
use caseforge_core::prompt::{script_prompt, testcase_prompt, Correction};

use crate::llm::{CompletionOptions, LlmClient};

#[derive(Clone)]
pub struct TestCaseAgent {
    llm: Arc<LlmClient>,
    options: CompletionOptions,
}

impl TestCaseAgent {
    pub fn new(llm: Arc<LlmClient>, options: CompletionOptions) -> Self {
        Self { llm, options }
    }

    pub async fn generate(
        &self,
        requirement: &str,
        context: &[Chunk],
        correction: Option<Correction<'_>>,
    ) -> Result<String, PipelineError> {
        let prompt = testcase_prompt(requirement, context, correction);
        self.llm.complete(&prompt, &self.options).await
    }
}

#[derive(Clone)]
pub struct ScriptAgent {
    llm: Arc<LlmClient>,
    options: CompletionOptions,
}

impl ScriptAgent {
    pub fn new(llm: Arc<LlmClient>, options: CompletionOptions) -> Self {
        Self { llm, options }
    }

    /// `selectors` may be empty when the context held no HTML.
    pub async fn generate(
        &self,
        test_cases: &[TestCase],
        framework: &str,
        selectors: &[String],
        correction: Option<Correction<'_>>,
    ) -> Result<String, PipelineError> {
        let prompt = script_prompt(test_cases, framework, selectors, correction);
        self.llm.complete(&prompt, &self.options).await
    }
}
