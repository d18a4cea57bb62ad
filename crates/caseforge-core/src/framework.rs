//! Target framework profiles.
//!
//! A framework tag is free-form configuration. Known tags map to the
//! fence language requested from the script agent and the line-comment
//! syntax the script validator skips when checking delimiter balance.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameworkProfile {
    /// Language tag placed on code fences (empty when unknown).
    pub fence: &'static str,
    /// Line-comment prefix of the target language.
    pub line_comment: &'static str,
    /// Whether `/* ... */` block comments exist in the target language.
    pub block_comments: bool,
    /// Whether `"""`/`'''` triple-quoted strings exist.
    pub triple_quotes: bool,
    /// Whether backtick template strings exist.
    pub backtick_strings: bool,
}

const PYTHON: FrameworkProfile = FrameworkProfile {
    fence: "python",
    line_comment: "#",
    block_comments: false,
    triple_quotes: true,
    backtick_strings: false,
};

const TYPESCRIPT: FrameworkProfile = FrameworkProfile {
    fence: "typescript",
    line_comment: "//",
    block_comments: true,
    triple_quotes: false,
    backtick_strings: true,
};

const JAVASCRIPT: FrameworkProfile = FrameworkProfile {
    fence: "javascript",
    ..TYPESCRIPT
};

const JAVA: FrameworkProfile = FrameworkProfile {
    fence: "java",
    line_comment: "//",
    block_comments: true,
    triple_quotes: false,
    backtick_strings: false,
};

const UNKNOWN: FrameworkProfile = FrameworkProfile {
    fence: "",
    ..PYTHON
};

/// Resolve a framework tag (case-insensitive) to its profile.
pub fn profile(tag: &str) -> FrameworkProfile {
    match tag.trim().to_ascii_lowercase().as_str() {
        "selenium-python" | "pytest" | "playwright-python" | "python" => PYTHON,
        "playwright-ts" | "playwright" | "typescript" => TYPESCRIPT,
        "cypress" | "jest" | "javascript" => JAVASCRIPT,
        "selenium-java" | "junit" | "java" => JAVA,
        _ => UNKNOWN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_tags() {
        assert_eq!(profile("selenium-python").fence, "python");
        assert_eq!(profile("Cypress").line_comment, "//");
        assert!(profile("playwright-ts").backtick_strings);
        assert_eq!(profile("junit").fence, "java");
    }

    #[test]
    fn test_unknown_defaults_to_hash_comments() {
        let p = profile("robot-framework");
        assert_eq!(p.fence, "");
        assert_eq!(p.line_comment, "#");
    }
}
