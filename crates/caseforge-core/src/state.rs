//! Request lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a generation request is in the pipeline.
///
/// ```text
/// IDLE → RETRIEVING → GENERATING_TESTCASES ⇄ VALIDATING_TESTCASES
///      → GENERATING_SCRIPT ⇄ VALIDATING_SCRIPT → DONE
///                         (any stage) → FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Idle,
    Retrieving,
    GeneratingTestcases,
    ValidatingTestcases,
    GeneratingScript,
    ValidatingScript,
    Done,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Done | RequestState::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) => true,
            (Idle, Retrieving) => true,
            (Retrieving, GeneratingTestcases) => true,
            (GeneratingTestcases, ValidatingTestcases) => true,
            (ValidatingTestcases, GeneratingTestcases) => true,
            (ValidatingTestcases, GeneratingScript) => true,
            (GeneratingScript, ValidatingScript) => true,
            (ValidatingScript, GeneratingScript) => true,
            (ValidatingScript, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestState::Idle => "IDLE",
            RequestState::Retrieving => "RETRIEVING",
            RequestState::GeneratingTestcases => "GENERATING_TESTCASES",
            RequestState::ValidatingTestcases => "VALIDATING_TESTCASES",
            RequestState::GeneratingScript => "GENERATING_SCRIPT",
            RequestState::ValidatingScript => "VALIDATING_SCRIPT",
            RequestState::Done => "DONE",
            RequestState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// A generation stage with its own attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Testcases,
    Script,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Testcases => f.write_str("testcases"),
            Stage::Script => f.write_str("script"),
        }
    }
}
