//! Selector inventory extraction from HTML context.
//!
//! The script agent is told to use only selectors that exist in the
//! retrieved markup. This module lists them in a fixed order: element ids,
//! classes, buttons, inputs, textareas. Entries are deduplicated in
//! first-seen order.

use regex::Regex;
use std::collections::HashSet;

/// Extract a selector inventory such as `ID: #username` or
/// `BUTTON: .primary button` from HTML text. Returns an empty list when
/// the text contains no matching markup.
pub fn extract_selectors(html: &str) -> Vec<String> {
    scan(html).unwrap_or_default()
}

fn scan(html: &str) -> Option<Vec<String>> {
    let id_attr = Regex::new(r#"\bid\s*=\s*["']([^"']+)["']"#).ok()?;
    let class_attr = Regex::new(r#"\bclass\s*=\s*["']([^"']+)["']"#).ok()?;
    let button = Regex::new(r"(?i)<button\b[^>]*>").ok()?;
    let input = Regex::new(r"(?i)<input\b[^>]*>").ok()?;
    let textarea = Regex::new(r"(?i)<textarea\b[^>]*>").ok()?;

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |entry: String| {
        if seen.insert(entry.clone()) {
            out.push(entry);
        }
    };

    for cap in id_attr.captures_iter(html) {
        push(format!("ID: #{}", &cap[1]));
    }
    for cap in class_attr.captures_iter(html) {
        for class in cap[1].split_whitespace() {
            push(format!("CLASS: .{}", class));
        }
    }
    for tag in button.find_iter(html) {
        let first_class = class_attr
            .captures(tag.as_str())
            .and_then(|c| c[1].split_whitespace().next().map(str::to_string));
        match first_class {
            Some(class) => push(format!("BUTTON: .{} button", class)),
            None => push("BUTTON: <button> (no class)".to_string()),
        }
    }
    for (re, label) in [(&input, "INPUT"), (&textarea, "TEXTAREA")] {
        for tag in re.find_iter(html) {
            if let Some(cap) = id_attr.captures(tag.as_str()) {
                push(format!("{}: #{}", label, &cap[1]));
            }
        }
    }

    Some(out)
}
