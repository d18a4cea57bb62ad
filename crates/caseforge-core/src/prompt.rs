//! Prompt composition for the two generation agents.

use crate::error::ValidationFailure;
use crate::framework::profile;
use crate::models::{Chunk, TestCase};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmPrompt {
    pub system: String,
    pub user: String,
}

/// The previous rejected output and why it was rejected.
#[derive(Debug, Clone, Copy)]
pub struct Correction<'a> {
    pub previous_output: &'a str,
    pub failure: &'a ValidationFailure,
}

const TESTCASE_SYSTEM: &str = "You are a senior QA lead. You write precise, executable \
manual test cases grounded only in the provided context. Respond with raw JSON only.";

const SCRIPT_SYSTEM: &str = "You are a senior test automation engineer. You turn validated \
test cases into runnable automated tests. Respond with code blocks only.";

/// Number context chunks `[1]..[n]` with their source for citation.
pub fn format_context(chunks: &[Chunk]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(i, c)| format!("[{}] Source: {}\nContent: {}", i + 1, c.source_id, c.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn testcase_prompt(
    requirement: &str,
    context: &[Chunk],
    correction: Option<Correction<'_>>,
) -> LlmPrompt {
    let context_block = if context.is_empty() {
        "(no supporting documents were found; rely on the requirement alone)".to_string()
    } else {
        format_context(context)
    };

    let mut user = format!(
        "CONTEXT:\n{context_block}\n\nREQUIREMENT:\n{requirement}\n\n\
INSTRUCTIONS:\n\
1. Generate only test cases that the requirement and context support.\n\
2. Output a raw JSON array. No Markdown, no explanation.\n\
3. Each object must contain:\n\
   - \"id\": string such as \"TC001\"\n\
   - \"title\": string\n\
   - \"description\": string\n\
   - \"preconditions\": array of strings\n\
   - \"steps\": array of objects, each {{\"action\": string, \"expected\": string}}\n\
   - \"expected_result\": string\n\
   - \"source_file\": string naming the main source used\n\
   - \"sources\": array of the context numbers you relied on, e.g. [1, 3]\n\
4. Every step needs both an action and its expected outcome.\n"
    );

    if let Some(c) = correction {
        user.push_str(&format!(
            "\nYOUR PREVIOUS OUTPUT WAS REJECTED.\nProblem: {}\nPrevious output:\n{}\n\
Return a corrected JSON array that fixes the problem.\n",
            c.failure, c.previous_output
        ));
    }

    LlmPrompt {
        system: TESTCASE_SYSTEM.to_string(),
        user,
    }
}

pub fn script_prompt(
    cases: &[TestCase],
    framework: &str,
    selectors: &[String],
    correction: Option<Correction<'_>>,
) -> LlmPrompt {
    let fence = profile(framework).fence;
    let cases_json = serde_json::to_string_pretty(cases).unwrap_or_default();

    let mut user = format!(
        "TARGET FRAMEWORK: {framework}\n\nTEST CASES (in order):\n{cases_json}\n\n\
INSTRUCTIONS:\n\
1. Write exactly {count} script{plural}, one per test case, in the same order.\n\
2. Put each script in its own fenced code block: ```{fence} ... ```.\n\
3. Each script must be complete and runnable on its own.\n\
4. Mention the test case id in a comment or test name.\n\
5. Output nothing outside the code blocks.\n",
        count = cases.len(),
        plural = if cases.len() == 1 { "" } else { "s" },
    );

    if !selectors.is_empty() {
        user.push_str("\nAVAILABLE SELECTORS (use only these to locate elements):\n");
        for s in selectors {
            user.push_str(s);
            user.push('\n');
        }
    }

    if let Some(c) = correction {
        user.push_str(&format!(
            "\nYOUR PREVIOUS OUTPUT WAS REJECTED.\nProblem: {}\nPrevious output:\n{}\n\
Return corrected code blocks that fix the problem.\n",
            c.failure, c.previous_output
        ));
    }

    LlmPrompt {
        system: SCRIPT_SYSTEM.to_string(),
        user,
    }
}
