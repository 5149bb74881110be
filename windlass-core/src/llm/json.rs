//! Reading structured answers out of free-form model output.

use regex::Regex;
use std::sync::LazyLock;

static CODE_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```(?:json|JSON)?\s*\n?([\s\S]*?)\n?```").expect("fence pattern is valid")
});

/// Return the body of the first fenced code block, or the input unchanged
pub fn strip_code_fences(input: &str) -> &str {
    CODE_FENCE_RE
        .captures(input)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(input)
}

/// Find the first balanced JSON object or array in `input` and parse it.
///
/// Models tend to wrap answers in prose or code fences; both are skipped.
/// Returns `None` when nothing parseable is found.
pub fn extract_json(input: &str) -> Option<serde_json::Value> {
    let body = strip_code_fences(input);

    if let Ok(value) = serde_json::from_str(body.trim()) {
        return Some(value);
    }

    let start = body.find(['{', '['])?;
    let substring = &body[start..];
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in substring.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&substring[..=i]).ok();
                }
            }
            _ => {}
        }
    }

    None
}
