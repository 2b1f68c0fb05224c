//! `${path}` placeholder resolution against an [`ExecutionState`].
//!
//! A string that is exactly one placeholder resolves to the referenced value
//! with its JSON type intact; a missing value resolves to `null`. Placeholders
//! embedded in larger strings are rendered as text, with missing values
//! rendered as the empty string. Placeholders whose path cannot be parsed, and
//! `${` without a closing brace, are left verbatim.

use crate::core::error::AppError;
use crate::core::flow::state::ExecutionState;
use crate::core::types::ErrorCategory;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{([^{}]*)\}").expect("placeholder regex is valid")
    })
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlaceholderError {
    #[error("placeholder is empty")]
    Empty,
    #[error("invalid root '{0}'")]
    InvalidRoot(String),
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },
    #[error("unterminated bracket")]
    UnterminatedBracket,
    #[error("invalid index '{0}'")]
    InvalidIndex(String),
}

impl From<PlaceholderError> for AppError {
    fn from(err: PlaceholderError) -> Self {
        AppError::new(ErrorCategory::ResolutionError, err.to_string()).with_code("RES-001")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderPath {
    pub root: String,
    pub segments: Vec<PathSegment>,
}

impl PlaceholderPath {
    pub fn parse(expr: &str) -> Result<Self, PlaceholderError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(PlaceholderError::Empty);
        }
        let chars: Vec<char> = expr.chars().collect();
        let mut pos = 0;

        let root = read_identifier(&chars, &mut pos);
        if root.is_empty() {
            return Err(PlaceholderError::InvalidRoot(expr.to_string()));
        }

        let mut segments = Vec::new();
        while pos < chars.len() {
            match chars[pos] {
                '.' => {
                    pos += 1;
                    let field = read_identifier(&chars, &mut pos);
                    if field.is_empty() {
                        return Err(unexpected(&chars, pos));
                    }
                    segments.push(PathSegment::Field(field));
                }
                '[' => {
                    pos += 1;
                    segments.push(read_bracket(&chars, &mut pos)?);
                }
                _ => return Err(unexpected(&chars, pos)),
            }
        }

        Ok(PlaceholderPath { root, segments })
    }

    /// Walk the path through the state; `None` when any hop is missing.
    pub fn lookup<'a>(&self, state: &'a ExecutionState) -> Option<&'a Value> {
        let mut current = state.lookup(&self.root)?;
        for segment in &self.segments {
            current = match (segment, current) {
                (PathSegment::Field(name), Value::Object(map)) => map.get(name)?,
                (PathSegment::Field(name), Value::Array(items)) => {
                    items.get(name.parse::<usize>().ok()?)?
                }
                (PathSegment::Index(index), Value::Array(items)) => items.get(*index)?,
                (PathSegment::Index(index), Value::Object(map)) => map.get(&index.to_string())?,
                _ => return None,
            };
        }
        Some(current)
    }
}

fn read_identifier(chars: &[char], pos: &mut usize) -> String {
    let start = *pos;
    while *pos < chars.len() && (chars[*pos].is_alphanumeric() || chars[*pos] == '_' || chars[*pos] == '$') {
        *pos += 1;
    }
    chars[start..*pos].iter().collect()
}

fn read_bracket(chars: &[char], pos: &mut usize) -> Result<PathSegment, PlaceholderError> {
    match chars.get(*pos) {
        Some(&quote) if quote == '\'' || quote == '"' => {
            *pos += 1;
            let start = *pos;
            while *pos < chars.len() && chars[*pos] != quote {
                *pos += 1;
            }
            if *pos >= chars.len() {
                return Err(PlaceholderError::UnterminatedBracket);
            }
            let field: String = chars[start..*pos].iter().collect();
            *pos += 1;
            expect_close(chars, pos)?;
            Ok(PathSegment::Field(field))
        }
        Some(_) => {
            let start = *pos;
            while *pos < chars.len() && chars[*pos] != ']' {
                *pos += 1;
            }
            if *pos >= chars.len() {
                return Err(PlaceholderError::UnterminatedBracket);
            }
            let raw: String = chars[start..*pos].iter().collect();
            *pos += 1;
            raw.trim()
                .parse::<usize>()
                .map(PathSegment::Index)
                .map_err(|_| PlaceholderError::InvalidIndex(raw))
        }
        None => Err(PlaceholderError::UnterminatedBracket),
    }
}

fn expect_close(chars: &[char], pos: &mut usize) -> Result<(), PlaceholderError> {
    match chars.get(*pos) {
        Some(']') => {
            *pos += 1;
            Ok(())
        }
        Some(_) => Err(unexpected(chars, *pos)),
        None => Err(PlaceholderError::UnterminatedBracket),
    }
}

fn unexpected(chars: &[char], pos: usize) -> PlaceholderError {
    match chars.get(pos) {
        Some(&ch) => PlaceholderError::UnexpectedChar { ch, offset: pos },
        None => PlaceholderError::UnterminatedBracket,
    }
}

/// Resolve every placeholder inside `template`, returning a new value.
pub fn resolve(template: &Value, state: &ExecutionState) -> Value {
    match template {
        Value::String(text) => resolve_str(text, state),
        Value::Array(items) => Value::Array(items.iter().map(|item| resolve(item, state)).collect()),
        Value::Object(map) => {
            let resolved: Map<String, Value> = map
                .iter()
                .map(|(key, value)| (key.clone(), resolve(value, state)))
                .collect();
            Value::Object(resolved)
        }
        other => other.clone(),
    }
}

/// Resolve a single string template.
pub fn resolve_str(text: &str, state: &ExecutionState) -> Value {
    let regex = placeholder_regex();
    let mut matches = regex.captures_iter(text);
    let first = match matches.next() {
        Some(first) => first,
        None => return Value::String(text.to_string()),
    };

    let whole = first.get(0).map(|m| m.start() == 0 && m.end() == text.len()).unwrap_or(false);
    if whole {
        return match PlaceholderPath::parse(&first[1]) {
            Ok(path) => path.lookup(state).cloned().unwrap_or(Value::Null),
            Err(err) => {
                tracing::debug!(placeholder = %text, error = %err, "leaving malformed placeholder verbatim");
                Value::String(text.to_string())
            }
        };
    }

    let rendered = regex.replace_all(text, |caps: &Captures<'_>| match PlaceholderPath::parse(&caps[1]) {
        Ok(path) => path.lookup(state).map(to_text).unwrap_or_default(),
        Err(err) => {
            tracing::debug!(placeholder = %&caps[0], error = %err, "leaving malformed placeholder verbatim");
            caps[0].to_string()
        }
    });
    Value::String(rendered.into_owned())
}

/// Text form of a value when it is spliced into a larger string.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Check that every placeholder in `template` has a parseable path.
pub fn validate_template(template: &Value) -> Result<(), PlaceholderError> {
    match template {
        Value::String(text) => {
            for caps in placeholder_regex().captures_iter(text) {
                PlaceholderPath::parse(&caps[1])?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(validate_template),
        Value::Object(map) => map.values().try_for_each(validate_template),
        _ => Ok(()),
    }
}
