use crate::core::flow::resolver::{resolve, to_text};
use crate::core::flow::state::ExecutionState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_case_sensitive() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchOperator {
    TextContains,
    TextDoesNotContain,
    TextExactlyMatches,
    TextDoesNotExactlyMatch,
    TextStartsWith,
    TextDoesNotStartWith,
    TextEndsWith,
    TextDoesNotEndWith,
    NumberIsGreaterThan,
    NumberIsLessThan,
    NumberIsEqualTo,
    BooleanIsTrue,
    BooleanIsFalse,
    Exists,
    DoesNotExist,
    ListIsEmpty,
    ListIsNotEmpty,
    ListContains,
}

/// One comparison between two resolved operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchCondition {
    #[serde(alias = "firstValue")]
    pub first_value: Value,
    pub operator: BranchOperator,
    #[serde(default, alias = "secondValue")]
    pub second_value: Value,
    #[serde(default = "default_case_sensitive", alias = "caseSensitive")]
    pub case_sensitive: bool,
}

/// OR of AND groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchSettings {
    #[serde(default)]
    pub conditions: Vec<Vec<BranchCondition>>,
}

impl BranchSettings {
    /// Empty sets and empty groups are false.
    pub fn evaluate(&self, state: &ExecutionState) -> bool {
        self.conditions.iter().any(|group| {
            !group.is_empty() && group.iter().all(|condition| condition.evaluate(state))
        })
    }
}

impl BranchCondition {
    pub fn evaluate(&self, state: &ExecutionState) -> bool {
        let first = resolve(&self.first_value, state);
        let second = resolve(&self.second_value, state);
        self.compare(&first, &second)
    }

    /// Apply the operator to already-resolved operands.
    pub fn compare(&self, first: &Value, second: &Value) -> bool {
        use BranchOperator::*;
        match self.operator {
            TextContains => self.text_pair(first, second, |a, b| a.contains(b)),
            TextDoesNotContain => !self.text_pair(first, second, |a, b| a.contains(b)),
            TextExactlyMatches => self.text_pair(first, second, |a, b| a == b),
            TextDoesNotExactlyMatch => !self.text_pair(first, second, |a, b| a == b),
            TextStartsWith => self.text_pair(first, second, |a, b| a.starts_with(b)),
            TextDoesNotStartWith => !self.text_pair(first, second, |a, b| a.starts_with(b)),
            TextEndsWith => self.text_pair(first, second, |a, b| a.ends_with(b)),
            TextDoesNotEndWith => !self.text_pair(first, second, |a, b| a.ends_with(b)),
            NumberIsGreaterThan => number_pair(first, second, |a, b| a > b),
            NumberIsLessThan => number_pair(first, second, |a, b| a < b),
            NumberIsEqualTo => number_pair(first, second, |a, b| a == b),
            BooleanIsTrue => as_bool(first) == Some(true),
            BooleanIsFalse => as_bool(first) == Some(false),
            Exists => exists(first),
            DoesNotExist => !exists(first),
            ListIsEmpty => matches!(first, Value::Array(items) if items.is_empty()),
            ListIsNotEmpty => matches!(first, Value::Array(items) if !items.is_empty()),
            ListContains => match first {
                Value::Array(items) => items.iter().any(|item| {
                    item == second || self.text_pair(item, second, |a, b| a == b)
                }),
                _ => false,
            },
        }
    }

    fn text_pair(&self, first: &Value, second: &Value, op: impl Fn(&str, &str) -> bool) -> bool {
        let (a, b) = (operand_text(first), operand_text(second));
        if self.case_sensitive {
            op(&a, &b)
        } else {
            op(&a.to_lowercase(), &b.to_lowercase())
        }
    }
}

fn operand_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => to_text(other),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn number_pair(first: &Value, second: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (as_number(first), as_number(second)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn exists(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}
