// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Minimal kubectl-style JSONPath for `addKey.jsonPathExpression`.
//!
//! Supported forms:
//!
//! - `{.a.b}` and the bare `.a.b`
//! - array indices: `{.a[0]}`, negative indices count from the end
//! - quoted member names: `{.a['k.with.dots']}` or `{.a["k"]}`
//! - an optional leading `$`
//!
//! Filters, wildcards, slices and recursive descent are not supported.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JsonPathError {
    #[error("invalid JSONPath {expression:?}: {message}")]
    Syntax { expression: String, message: String },

    #[error("JSONPath {expression:?} matched nothing")]
    NoMatch { expression: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Step {
    Member(String),
    Index(i64),
}

/// A parsed path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsonPath {
    expression: String,
    steps: Vec<Step>,
}

impl JsonPath {
    /// Parse an expression.
    ///
    /// # Errors
    ///
    /// Returns [`JsonPathError::Syntax`] for unsupported or malformed input.
    pub fn parse(expression: &str) -> Result<Self, JsonPathError> {
        let syntax = |message: &str| JsonPathError::Syntax {
            expression: expression.to_string(),
            message: message.to_string(),
        };

        let trimmed = expression.trim();
        let body = match (trimmed.strip_prefix('{'), trimmed.ends_with('}')) {
            (Some(inner), true) => &inner[..inner.len() - 1],
            (Some(_), false) => return Err(syntax("unterminated '{'")),
            (None, _) => trimmed,
        };
        let body = body.trim();
        let body = body.strip_prefix('$').unwrap_or(body);
        if body.is_empty() {
            return Err(syntax("empty path"));
        }

        let chars: Vec<char> = body.chars().collect();
        let mut steps = Vec::new();
        let mut pos = 0;
        while pos < chars.len() {
            match chars[pos] {
                '.' => {
                    pos += 1;
                    let start = pos;
                    while pos < chars.len() && chars[pos] != '.' && chars[pos] != '[' {
                        pos += 1;
                    }
                    if start == pos {
                        return Err(syntax("empty member name"));
                    }
                    let name: String = chars[start..pos].iter().collect();
                    if name == "*" || name.contains(['?', '(', ')', '@']) {
                        return Err(syntax("filters and wildcards are not supported"));
                    }
                    steps.push(Step::Member(name));
                }
                '[' => {
                    pos += 1;
                    let close = chars[pos..]
                        .iter()
                        .position(|c| *c == ']')
                        .map(|offset| pos + offset)
                        .ok_or_else(|| syntax("unterminated '['"))?;
                    let inner: String = chars[pos..close].iter().collect();
                    steps.push(parse_bracket(inner.trim()).ok_or_else(|| {
                        syntax("brackets must hold an integer index or a quoted name")
                    })?);
                    pos = close + 1;
                }
                _ if steps.is_empty() && pos == 0 => {
                    // `a.b` without the leading dot.
                    let start = pos;
                    while pos < chars.len() && chars[pos] != '.' && chars[pos] != '[' {
                        pos += 1;
                    }
                    steps.push(Step::Member(chars[start..pos].iter().collect()));
                }
                other => {
                    return Err(syntax(&format!("unexpected character {other:?}")));
                }
            }
        }

        Ok(Self {
            expression: expression.to_string(),
            steps,
        })
    }

    /// Evaluate against `document`.
    ///
    /// # Errors
    ///
    /// Returns [`JsonPathError::NoMatch`] when a step does not resolve.
    pub fn evaluate<'v>(&self, document: &'v Value) -> Result<&'v Value, JsonPathError> {
        let mut current = document;
        for step in &self.steps {
            let next = match (step, current) {
                (Step::Member(name), Value::Object(map)) => map.get(name),
                (Step::Index(index), Value::Array(items)) => {
                    let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
                    let resolved = if *index < 0 { len + index } else { *index };
                    usize::try_from(resolved).ok().and_then(|i| items.get(i))
                }
                _ => None,
            };
            current = next.ok_or_else(|| JsonPathError::NoMatch {
                expression: self.expression.clone(),
            })?;
        }
        Ok(current)
    }
}

fn parse_bracket(inner: &str) -> Option<Step> {
    for quote in ['\'', '"'] {
        if let Some(name) = inner
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return Some(Step::Member(name.to_string()));
        }
    }
    inner.parse::<i64>().ok().map(Step::Index)
}

/// Evaluate `expression` and render the match for storage in a secret.
///
/// Strings are stored verbatim; anything else as its JSON encoding.
///
/// # Errors
///
/// Returns a [`JsonPathError`] if the expression is invalid or matches nothing.
pub fn evaluate_to_bytes(expression: &str, document: &Value) -> Result<Vec<u8>, JsonPathError> {
    let path = JsonPath::parse(expression)?;
    Ok(match path.evaluate(document)? {
        Value::String(s) => s.as_bytes().to_vec(),
        other => other.to_string().into_bytes(),
    })
}

#[cfg(test)]
#[path = "jsonpath_tests.rs"]
mod jsonpath_tests;
