//! Glob matching for single path components and identifier validation.
//!
//! Components may contain `*` (zero or more characters), `?` (exactly one
//! character) and `+` (one or more characters). Paths are split on `.` by the
//! callers; no component ever contains a separator.

/// Returns true if `component` contains any wildcard character.
pub fn has_wildcards(component: &str) -> bool {
    component.contains(['*', '?', '+'])
}

/// Matches a concrete `name` against a glob `pattern`.
pub fn matches(pattern: &str, name: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = name.chars().collect();
    // dp[j] == pattern prefix matches txt[..j]
    let mut dp = vec![false; txt.len() + 1];
    dp[0] = true;
    for &p in &pat {
        let mut next = vec![false; txt.len() + 1];
        match p {
            '*' => {
                let mut seen = false;
                for j in 0..=txt.len() {
                    seen |= dp[j];
                    next[j] = seen;
                }
            }
            '+' => {
                let mut seen = false;
                for j in 1..=txt.len() {
                    seen |= dp[j - 1];
                    next[j] = seen;
                }
            }
            '?' => {
                for j in 1..=txt.len() {
                    next[j] = dp[j - 1];
                }
            }
            c => {
                for j in 1..=txt.len() {
                    next[j] = dp[j - 1] && txt[j - 1] == c;
                }
            }
        }
        dp = next;
    }
    dp[txt.len()]
}

/// Matches `name` against `pattern`, treating a pattern without wildcards as a
/// plain string comparison.
pub fn component_matches(pattern: &str, name: &str) -> bool {
    if has_wildcards(pattern) {
        matches(pattern, name)
    } else {
        pattern == name
    }
}

const RESERVED: &[&str] = &[
    "and", "as", "assert", "break", "class", "const", "continue", "def", "del", "delete",
    "do", "elif", "else", "enum", "except", "extern", "false", "finally", "fn", "for",
    "from", "global", "if", "impl", "import", "in", "is", "lambda", "let", "loop", "match",
    "mod", "new", "not", "or", "pass", "pub", "raise", "return", "self", "static", "struct",
    "switch", "this", "true", "try", "type", "union", "use", "while", "with", "yield",
];

/// Why a proposed identifier was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    Empty,
    BadCharacter(char),
    LeadingDigit,
    DoubleUnderscore,
    Reserved,
    TrailingDigit,
}

impl std::fmt::Display for IdentifierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentifierError::Empty => f.write_str("is empty"),
            IdentifierError::BadCharacter(c) => write!(f, "contains illegal character '{c}'"),
            IdentifierError::LeadingDigit => f.write_str("starts with a digit"),
            IdentifierError::DoubleUnderscore => f.write_str("contains '__'"),
            IdentifierError::Reserved => f.write_str("is a reserved keyword"),
            IdentifierError::TrailingDigit => f.write_str("ends in a digit"),
        }
    }
}

/// Validates a node name: `[A-Za-z_][A-Za-z0-9_]*`, no `__`, not reserved.
pub fn validate_name(name: &str) -> Result<(), IdentifierError> {
    let mut chars = name.chars();
    let first = chars.next().ok_or(IdentifierError::Empty)?;
    if first.is_ascii_digit() {
        return Err(IdentifierError::LeadingDigit);
    }
    if let Some(bad) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_')) {
        return Err(IdentifierError::BadCharacter(bad));
    }
    if name.contains("__") {
        return Err(IdentifierError::DoubleUnderscore);
    }
    if RESERVED.contains(&name) {
        return Err(IdentifierError::Reserved);
    }
    Ok(())
}

/// Validates a group name: a valid identifier that does not end in a digit.
pub fn validate_group(group: &str) -> Result<(), IdentifierError> {
    validate_name(group)?;
    if group.ends_with(|c: char| c.is_ascii_digit()) {
        return Err(IdentifierError::TrailingDigit);
    }
    Ok(())
}

/// Splits a dotted path, rejecting empty components.
pub fn split_path(path: &str) -> Option<Vec<&str>> {
    if path.is_empty() {
        return None;
    }
    let parts: Vec<&str> = path.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        None
    } else {
        Some(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_empty_and_longer_runs() {
        assert!(matches("core*", "core"));
        assert!(matches("core*", "core12"));
        assert!(matches("*", ""));
        assert!(!matches("core*", "cor"));
    }

    #[test]
    fn plus_requires_at_least_one_character() {
        assert!(!matches("core+", "core"));
        assert!(matches("core+", "core0"));
        assert!(matches("+_unit", "alu_unit"));
    }

    #[test]
    fn question_mark_is_exactly_one() {
        assert!(matches("core?", "core1"));
        assert!(!matches("core?", "core10"));
        assert!(matches("?l?", "alu"));
    }

    #[test]
    fn identifiers_follow_naming_rules() {
        assert!(validate_name("alu_0").is_ok());
        assert!(validate_name("_hidden").is_ok());
        assert_eq!(validate_name("0alu"), Err(IdentifierError::LeadingDigit));
        assert_eq!(validate_name("a__b"), Err(IdentifierError::DoubleUnderscore));
        assert_eq!(validate_name("a.b"), Err(IdentifierError::BadCharacter('.')));
        assert_eq!(validate_name("while"), Err(IdentifierError::Reserved));
        assert_eq!(validate_name(""), Err(IdentifierError::Empty));
    }

    #[test]
    fn groups_cannot_end_in_digits() {
        assert!(validate_group("core").is_ok());
        assert_eq!(validate_group("core2"), Err(IdentifierError::TrailingDigit));
    }

    #[test]
    fn split_path_rejects_empty_components() {
        assert_eq!(split_path("a.b.c"), Some(vec!["a", "b", "c"]));
        assert_eq!(split_path("a..b"), None);
        assert_eq!(split_path(".a"), None);
        assert_eq!(split_path(""), None);
    }
}
