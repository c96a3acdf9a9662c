//! Job variables and `$VAR` expansion
//!
//! Image names, service names, aliases and cache keys may reference job
//! variables as `$NAME` or `${NAME}`. References to unknown variables expand
//! to an empty string, as in a POSIX shell.

use serde::{Deserialize, Serialize};

use crate::domain::job::JobVariable;

/// Ordered set of job variables; later definitions override earlier ones
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobVariables(Vec<JobVariable>);

impl JobVariables {
    pub fn new(variables: Vec<JobVariable>) -> Self {
        Self(variables)
    }

    pub fn push(&mut self, variable: JobVariable) {
        self.0.push(variable);
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobVariable> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Looks up a variable, last definition wins
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|v| v.key == key)
            .map(|v| v.value.as_str())
    }

    /// Expands `$NAME` and `${NAME}` references in `input`
    pub fn expand(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut chars = input.char_indices().peekable();

        while let Some((_, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }

            match chars.peek().copied() {
                Some((start, '{')) => {
                    chars.next();
                    let rest = &input[start + 1..];
                    match rest.find('}') {
                        Some(end) => {
                            out.push_str(self.get(&rest[..end]).unwrap_or_default());
                            // Skip the name and the closing brace
                            for _ in 0..rest[..end].chars().count() + 1 {
                                chars.next();
                            }
                        }
                        None => {
                            // Unterminated reference stays literal
                            out.push_str("${");
                        }
                    }
                }
                Some((start, n)) if is_name_char(n) => {
                    let mut end = start;
                    while let Some(&(i, n)) = chars.peek() {
                        if !is_name_char(n) {
                            break;
                        }
                        end = i + n.len_utf8();
                        chars.next();
                    }
                    out.push_str(self.get(&input[start..end]).unwrap_or_default());
                }
                _ => out.push('$'),
            }
        }

        out
    }
}

impl From<Vec<JobVariable>> for JobVariables {
    fn from(variables: Vec<JobVariable>) -> Self {
        Self(variables)
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> JobVariables {
        JobVariables::new(vec![
            JobVariable::new("CI_REGISTRY_IMAGE", "alpine"),
            JobVariable::new("TAG", "3.19"),
            JobVariable::new("TAG", "3.20"),
        ])
    }

    #[test]
    fn test_expand_plain_reference() {
        assert_eq!(vars().expand("$CI_REGISTRY_IMAGE"), "alpine");
    }

    #[test]
    fn test_expand_braced_reference() {
        assert_eq!(vars().expand("${CI_REGISTRY_IMAGE}:${TAG}"), "alpine:3.20");
    }

    #[test]
    fn test_expand_mixed_text() {
        assert_eq!(
            vars().expand("registry.local/$CI_REGISTRY_IMAGE:$TAG-slim"),
            "registry.local/alpine:3.20-slim"
        );
    }

    #[test]
    fn test_unknown_variable_is_empty() {
        assert_eq!(vars().expand("img-$MISSING"), "img-");
        assert_eq!(vars().expand("${MISSING}x"), "x");
    }

    #[test]
    fn test_literal_dollar_is_kept() {
        assert_eq!(vars().expand("a $ b"), "a $ b");
        assert_eq!(vars().expand("trailing $"), "trailing $");
        assert_eq!(vars().expand("open ${TAG"), "open ${TAG");
    }

    #[test]
    fn test_last_definition_wins() {
        assert_eq!(vars().get("TAG"), Some("3.20"));
    }
}
