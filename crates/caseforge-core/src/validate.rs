//! Agent output validation.
//!
//! Both agents return free text. This module turns that text into typed
//! values or a [`ValidationFailure`] precise enough to feed back to the
//! model as a correction.
//!
//! # Test cases
//!
//! [`validate_testcases`] locates a JSON array (tolerating Markdown fences
//! and surrounding prose), then checks every record:
//!
//! | Field | Rule |
//! |-------|------|
//! | `title` | required, non-empty string |
//! | `steps` | required, non-empty array of `{action, expected}` strings |
//! | `expected_result` | required, non-empty string |
//! | `id` | optional string or number; defaults to `TC001`, `TC002`, … |
//! | `preconditions` | optional string or array of strings |
//! | `description`, `source_file` | optional strings |
//! | `sources` | optional array of positive integers (cited context numbers) |
//!
//! # Scripts
//!
//! [`validate_script`] splits fenced code blocks, requires exactly one per
//! test case, and checks each for a non-empty body with balanced
//! `()[]{}` outside string literals and comments.

use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::error::ValidationFailure;
use crate::framework::{profile, FrameworkProfile};
use crate::models::{TestCase, TestScript, TestStep};

pub type ValidationResult<T> = Result<T, ValidationFailure>;

/// Parse and schema-check the test-case agent's raw output.
pub fn validate_testcases(raw: &str) -> ValidationResult<Vec<TestCase>> {
    let records = parse_records(raw)?;
    if records.is_empty() {
        return Err(ValidationFailure::body("no test cases in output"));
    }

    let mut cases = Vec::with_capacity(records.len());
    let mut seen_ids = HashSet::new();

    for (i, record) in records.iter().enumerate() {
        let obj = record
            .as_object()
            .ok_or_else(|| ValidationFailure::record(i, "record is not an object"))?;

        let case = parse_case(i, obj)?;
        if !seen_ids.insert(case.id.clone()) {
            return Err(ValidationFailure::field(
                i,
                "id",
                format!("duplicate id '{}'", case.id),
            ));
        }
        cases.push(case);
    }

    Ok(cases)
}

/// Double any backslash that does not start a valid JSON escape, so
/// selectors like `div\.item` and Windows paths survive parsing.
fn escape_stray_backslashes(json: &str) -> String {
    let mut out = String::with_capacity(json.len() + 8);
    let mut chars = json.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some(&next) if matches!(next, '\\' | '/' | '"' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
                out.push(c);
                out.push(next);
                chars.next();
            }
            _ => out.push_str("\\\\"),
        }
    }
    out
}

fn parse_records(raw: &str) -> ValidationResult<Vec<Value>> {
    let body = unfence(raw);
    let json = locate_json(body)
        .ok_or_else(|| ValidationFailure::body("no JSON array or object found in output"))?;
    let value: Value = match serde_json::from_str(json) {
        Ok(value) => value,
        Err(e) => serde_json::from_str(&escape_stray_backslashes(json))
            .map_err(|_| ValidationFailure::body(format!("unparseable JSON: {}", e)))?,
    };

    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => {
            for key in ["test_cases", "testcases", "cases"] {
                if let Some(inner) = obj.remove(key) {
                    return match inner {
                        Value::Array(items) => Ok(items),
                        _ => Err(ValidationFailure {
                            record: None,
                            field: Some(key.to_string()),
                            reason: "expected an array".into(),
                        }),
                    };
                }
            }
            Ok(vec![Value::Object(obj)])
        }
        _ => Err(ValidationFailure::body("expected a JSON array of test cases")),
    }
}

/// Contents of the first fenced block, or the whole text when unfenced.
fn unfence(raw: &str) -> &str {
    let Some(open) = raw.find("```") else {
        return raw;
    };
    let after = &raw[open + 3..];
    let body_start = after.find('\n').map(|p| p + 1).unwrap_or(after.len());
    let body = &after[body_start..];
    match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    }
}

/// Slice from the first `[` or `{` to its matching last closer.
fn locate_json(text: &str) -> Option<&str> {
    let start = text.find(|c: char| c == '[' || c == '{')?;
    let closer = if text[start..].starts_with('[') { ']' } else { '}' };
    let end = text.rfind(closer)?;
    (end > start).then(|| &text[start..=end])
}

fn parse_case(i: usize, obj: &Map<String, Value>) -> ValidationResult<TestCase> {
    let title = required_string(i, obj, "title")?;
    let steps = parse_steps(i, obj)?;
    let expected_result = required_string(i, obj, "expected_result")?;

    let id = match obj.get("id") {
        None | Some(Value::Null) => format!("TC{:03}", i + 1),
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(_) => return Err(ValidationFailure::field(i, "id", "expected a non-empty string")),
    };

    let preconditions = match obj.get("preconditions") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) if s.trim().is_empty() => Vec::new(),
        Some(Value::String(s)) => vec![s.trim().to_string()],
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(j, v)| {
                v.as_str().map(|s| s.trim().to_string()).ok_or_else(|| {
                    ValidationFailure::field(i, format!("preconditions[{}]", j), "expected a string")
                })
            })
            .collect::<ValidationResult<Vec<_>>>()?,
        Some(_) => {
            return Err(ValidationFailure::field(
                i,
                "preconditions",
                "expected a string or an array of strings",
            ))
        }
    };

    let sources = match obj.get("sources") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(j, v)| {
                v.as_u64()
                    .filter(|n| *n > 0)
                    .map(|n| n as usize)
                    .ok_or_else(|| {
                        ValidationFailure::field(
                            i,
                            format!("sources[{}]", j),
                            "expected a positive integer",
                        )
                    })
            })
            .collect::<ValidationResult<Vec<_>>>()?,
        Some(_) => return Err(ValidationFailure::field(i, "sources", "expected an array")),
    };

    Ok(TestCase {
        id,
        title,
        description: optional_string(i, obj, "description")?,
        preconditions,
        steps,
        expected_result,
        source_file: optional_string(i, obj, "source_file")?,
        provenance: Vec::new(),
        sources,
    })
}

fn parse_steps(i: usize, obj: &Map<String, Value>) -> ValidationResult<Vec<TestStep>> {
    let items = match obj.get("steps") {
        None | Some(Value::Null) => {
            return Err(ValidationFailure::field(i, "steps", "missing"));
        }
        Some(Value::Array(items)) => items,
        Some(_) => return Err(ValidationFailure::field(i, "steps", "expected an array")),
    };
    if items.is_empty() {
        return Err(ValidationFailure::field(i, "steps", "at least one step is required"));
    }

    items
        .iter()
        .enumerate()
        .map(|(j, step)| {
            let step_obj = step.as_object().ok_or_else(|| {
                ValidationFailure::field(
                    i,
                    format!("steps[{}]", j),
                    "expected an object with 'action' and 'expected'",
                )
            })?;
            Ok(TestStep {
                action: required_string(i, step_obj, "action")
                    .map_err(|f| nest(f, &format!("steps[{}]", j)))?,
                expected: required_string(i, step_obj, "expected")
                    .map_err(|f| nest(f, &format!("steps[{}]", j)))?,
            })
        })
        .collect()
}

fn nest(mut failure: ValidationFailure, prefix: &str) -> ValidationFailure {
    failure.field = failure.field.map(|f| format!("{}.{}", prefix, f));
    failure
}

fn required_string(i: usize, obj: &Map<String, Value>, field: &str) -> ValidationResult<String> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ValidationFailure::field(i, field, "missing")),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(ValidationFailure::field(i, field, "must not be empty"))
        }
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(other) => Err(ValidationFailure::field(
            i,
            field,
            format!("expected a string, found {}", type_name(other)),
        )),
    }
}

fn optional_string(
    i: usize,
    obj: &Map<String, Value>,
    field: &str,
) -> ValidationResult<Option<String>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(other) => Err(ValidationFailure::field(
            i,
            field,
            format!("expected a string, found {}", type_name(other)),
        )),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============ Scripts ============

/// Parse the script agent's raw output into one script per test case.
///
/// `test_case_ids` is the ordered list of validated test case ids; its
/// length is the expected block count and block `n` is bound to id `n`.
pub fn validate_script(
    raw: &str,
    test_case_ids: &[String],
    framework: &str,
) -> ValidationResult<Vec<TestScript>> {
    let expected_count = test_case_ids.len();
    let mut blocks = fenced_blocks(raw)?;
    if blocks.is_empty() && expected_count == 1 && !raw.trim().is_empty() {
        blocks.push(raw.trim().to_string());
    }

    if blocks.len() != expected_count {
        return Err(ValidationFailure::body(format!(
            "expected {} script block{}, found {}",
            expected_count,
            if expected_count == 1 { "" } else { "s" },
            blocks.len()
        )));
    }

    let lang = profile(framework);
    let mut scripts = Vec::with_capacity(blocks.len());
    for (i, (code, case_id)) in blocks.into_iter().zip(test_case_ids).enumerate() {
        if code.trim().is_empty() {
            return Err(ValidationFailure::field(i, "code", "empty script body"));
        }
        check_delimiters(&code, &lang)
            .map_err(|reason| ValidationFailure::field(i, "code", reason))?;
        scripts.push(TestScript {
            id: format!("{}-script", case_id),
            test_case_id: case_id.clone(),
            framework: framework.to_string(),
            code,
        });
    }
    Ok(scripts)
}

fn fenced_blocks(raw: &str) -> ValidationResult<Vec<String>> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in raw.lines() {
        let is_fence = line.trim_start().starts_with("```");
        match (&mut current, is_fence) {
            (None, true) => current = Some(Vec::new()),
            (None, false) => {}
            (Some(lines), false) => lines.push(line),
            (Some(_), true) => {
                if let Some(lines) = current.take() {
                    blocks.push(lines.join("\n"));
                }
            }
        }
    }

    if current.is_some() {
        return Err(ValidationFailure::body("unterminated code block"));
    }
    Ok(blocks)
}

/// Check `()[]{}` balance, skipping strings and comments.
fn check_delimiters(code: &str, lang: &FrameworkProfile) -> Result<(), String> {
    let chars: Vec<char> = code.chars().collect();
    let comment: Vec<char> = lang.line_comment.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\n' {
            line += 1;
            i += 1;
            continue;
        }

        if at(&chars, i, &comment) {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        if lang.block_comments && at(&chars, i, &['/', '*']) {
            i += 2;
            while i < chars.len() && !at(&chars, i, &['*', '/']) {
                if chars[i] == '\n' {
                    line += 1;
                }
                i += 1;
            }
            if i >= chars.len() {
                return Err(format!("unterminated block comment starting before line {}", line));
            }
            i += 2;
            continue;
        }

        if lang.triple_quotes && (at(&chars, i, &['"'; 3]) || at(&chars, i, &['\''; 3])) {
            let quote = [c; 3];
            let open_line = line;
            i += 3;
            while i < chars.len() && !at(&chars, i, &quote) {
                if chars[i] == '\\' {
                    i += 1;
                } else if chars[i] == '\n' {
                    line += 1;
                }
                i += 1;
            }
            if i >= chars.len() {
                return Err(format!("unterminated string starting at line {}", open_line));
            }
            i += 3;
            continue;
        }

        if c == '"' || c == '\'' || (lang.backtick_strings && c == '`') {
            let open_line = line;
            i += 1;
            while i < chars.len() && chars[i] != c {
                if chars[i] == '\\' {
                    i += 1;
                } else if chars[i] == '\n' {
                    if c != '`' {
                        return Err(format!("unterminated string at line {}", open_line));
                    }
                    line += 1;
                }
                i += 1;
            }
            if i >= chars.len() {
                return Err(format!("unterminated string at line {}", open_line));
            }
            i += 1;
            continue;
        }

        match c {
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let want = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == want => {}
                    Some((open, open_line)) => {
                        return Err(format!(
                            "mismatched '{}' at line {} (opened '{}' at line {})",
                            c, line, open, open_line
                        ))
                    }
                    None => return Err(format!("unexpected '{}' at line {}", c, line)),
                }
            }
            _ => {}
        }
        i += 1;
    }

    match stack.pop() {
        Some((open, open_line)) => Err(format!("unclosed '{}' opened at line {}", open, open_line)),
        None => Ok(()),
    }
}

fn at(chars: &[char], i: usize, pat: &[char]) -> bool {
    chars.len() >= i + pat.len() && chars[i..i + pat.len()] == *pat
}
