//! Pattern matching for route policies and routing rules.
//!
//! Patterns are deliberately tiny globs, not full regexes. A guard rejects
//! patterns with more than 5 wildcards or longer than 200 characters at
//! match time so hostile policy files cannot construct pathological regexes.

use regex_lite::Regex;

pub(crate) const MAX_PATTERN_LEN: usize = 200;
pub(crate) const MAX_WILDCARDS: usize = 5;

fn within_caps(pattern: &str) -> bool {
    pattern.len() <= MAX_PATTERN_LEN
        && pattern.bytes().filter(|&b| b == b'*').count() <= MAX_WILDCARDS
}

fn push_escaped(out: &mut String, ch: char) {
    if matches!(
        ch,
        '.' | '+' | '?' | '^' | '$' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\'
    ) {
        out.push('\\');
    }
    out.push(ch);
}

/// Compile a path glob: `*` matches within one path segment (`[^/]*`).
/// Returns `None` for patterns over the caps or that fail to compile.
#[must_use]
pub(crate) fn compile_path_pattern(pattern: &str) -> Option<Regex> {
    if !within_caps(pattern) {
        return None;
    }
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for ch in pattern.chars() {
        if ch == '*' {
            source.push_str("[^/]*");
        } else {
            push_escaped(&mut source, ch);
        }
    }
    source.push('$');
    Regex::new(&source).ok()
}

/// Compile a model glob: `*` becomes a lazy `.*?`, case-insensitive.
#[must_use]
pub(crate) fn compile_model_pattern(pattern: &str) -> Option<Regex> {
    if !within_caps(pattern) {
        return None;
    }
    let mut source = String::with_capacity(pattern.len() + 12);
    source.push_str("(?i)^");
    for ch in pattern.chars() {
        if ch == '*' {
            source.push_str(".*?");
        } else {
            push_escaped(&mut source, ch);
        }
    }
    source.push('$');
    Regex::new(&source).ok()
}

/// Match a path against a pattern: exact, prefix, or glob.
/// Over-cap patterns are treated as no-match.
#[must_use]
pub(crate) fn path_pattern_matches(pattern: &str, path: &str) -> bool {
    if !within_caps(pattern) {
        return false;
    }
    if !pattern.contains('*') {
        return path == pattern || path.starts_with(pattern);
    }
    compile_path_pattern(pattern).is_some_and(|regex| regex.is_match(path))
}

/// Match a model name against a pattern: exact, bare `*`, or glob.
#[must_use]
pub(crate) fn model_pattern_matches(pattern: &str, model: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !within_caps(pattern) {
        return false;
    }
    if !pattern.contains('*') {
        return pattern == model;
    }
    compile_model_pattern(pattern).is_some_and(|regex| regex.is_match(model))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_exact_and_prefix() {
        assert!(path_pattern_matches("/v1/messages", "/v1/messages"));
        assert!(path_pattern_matches("/v1/", "/v1/messages"));
        assert!(!path_pattern_matches("/v2/", "/v1/messages"));
    }

    #[test]
    fn test_path_glob_stays_within_segment() {
        assert!(path_pattern_matches("/v1/*", "/v1/messages"));
        assert!(!path_pattern_matches("/v1/*", "/v1/messages/123"));
        assert!(path_pattern_matches("/v1/*/payload", "/v1/abc/payload"));
    }

    #[test]
    fn test_model_glob_case_insensitive() {
        assert!(model_pattern_matches("claude-*", "claude-3-opus"));
        assert!(model_pattern_matches("CLAUDE-*", "claude-3-opus"));
        assert!(model_pattern_matches("*", "anything"));
        assert!(!model_pattern_matches("glm-*", "claude-3-opus"));
    }

    #[test]
    fn test_model_exact_is_case_sensitive() {
        assert!(model_pattern_matches("glm-4-air", "glm-4-air"));
        assert!(!model_pattern_matches("GLM-4-AIR", "glm-4-air"));
    }

    #[test]
    fn test_wildcard_cap_rejected() {
        let hostile = "*a*b*c*d*e*f";
        assert!(!path_pattern_matches(hostile, "aXbXcXdXeXf"));
        assert!(!model_pattern_matches(hostile, "aXbXcXdXeXf"));
    }

    #[test]
    fn test_length_cap_rejected() {
        let long = "a".repeat(201);
        assert!(!path_pattern_matches(&long, &long));
        let exact_cap = "a".repeat(200);
        assert!(path_pattern_matches(&exact_cap, &exact_cap));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        assert!(path_pattern_matches("/v1/a.b", "/v1/a.b"));
        assert!(!path_pattern_matches("/v1/a.b*", "/v1/aXb"));
        assert!(model_pattern_matches("model(1)*", "model(1)-fast"));
    }
}
