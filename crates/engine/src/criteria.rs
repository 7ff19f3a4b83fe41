//! Field criteria matched against JSON documents
//!
//! Used wherever a definition filters on structured data: trigger filters,
//! event listener match criteria and contact field conditions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator for a field criterion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Equality check (strings compare case-insensitively)
    #[default]
    Equals,
    /// Inequality check
    NotEquals,
    /// Substring or array membership
    Contains,
    /// Negation of `contains`
    NotContains,
    StartsWith,
    EndsWith,
    /// Numeric or timestamp comparison
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    /// Value is in list
    In,
    /// Value is not in list
    NotIn,
    /// Field is present and not null
    Exists,
    /// Field is absent or null
    NotExists,
    /// Regex match
    Matches,
}

/// One `field operator value` test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCriterion {
    /// Dotted path into the subject document (`data.order.total`)
    pub field: String,

    #[serde(default)]
    pub operator: Operator,

    #[serde(default)]
    pub value: Option<Value>,
}

impl FieldCriterion {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: Some(value.into()),
        }
    }

    /// Criterion that only requires the field to be present
    pub fn exists(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator: Operator::Exists,
            value: None,
        }
    }

    /// Check the criterion is well-formed
    pub fn validate(&self) -> Result<(), String> {
        if self.field.trim().is_empty() {
            return Err("criterion field must not be empty".to_string());
        }
        match self.operator {
            Operator::Exists | Operator::NotExists => Ok(()),
            Operator::In | Operator::NotIn => match &self.value {
                Some(Value::Array(_)) => Ok(()),
                _ => Err(format!("operator on '{}' requires a list value", self.field)),
            },
            Operator::Matches => {
                let pattern = self.value.as_ref().and_then(Value::as_str).ok_or_else(|| {
                    format!("regex criterion on '{}' requires a string pattern", self.field)
                })?;
                regex::Regex::new(pattern)
                    .map(|_| ())
                    .map_err(|e| format!("invalid regex on '{}': {}", self.field, e))
            }
            _ if self.value.is_none() => {
                Err(format!("criterion on '{}' requires a value", self.field))
            }
            _ => Ok(()),
        }
    }

    /// Evaluate against a subject document
    pub fn matches(&self, subject: &Value) -> bool {
        compare(lookup(subject, &self.field), self.operator, self.value.as_ref())
    }
}

/// All criteria match (an empty set always matches)
pub fn all_match(criteria: &[FieldCriterion], subject: &Value) -> bool {
    criteria.iter().all(|c| c.matches(subject))
}

/// Resolve a dotted path inside a JSON document
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Apply an operator to a resolved field value
pub fn compare(left: Option<&Value>, operator: Operator, right: Option<&Value>) -> bool {
    let left = left.filter(|v| !v.is_null());

    match operator {
        Operator::Exists => left.is_some(),
        Operator::NotExists => left.is_none(),
        Operator::Equals => match (left, right) {
            (Some(l), Some(r)) => loose_eq(l, r),
            (None, Some(Value::Null)) | (None, None) => true,
            _ => false,
        },
        Operator::NotEquals => !compare(left, Operator::Equals, right),
        Operator::Contains => match (left, right) {
            (Some(l), Some(r)) => contains(l, r),
            _ => false,
        },
        Operator::NotContains => match (left, right) {
            (Some(l), Some(r)) => !contains(l, r),
            (None, _) => true,
            _ => false,
        },
        Operator::StartsWith => string_pair(left, right)
            .map(|(l, r)| l.starts_with(&r))
            .unwrap_or(false),
        Operator::EndsWith => string_pair(left, right)
            .map(|(l, r)| l.ends_with(&r))
            .unwrap_or(false),
        Operator::GreaterThan => ordered(left, right, |o| o.is_gt()),
        Operator::LessThan => ordered(left, right, |o| o.is_lt()),
        Operator::GreaterOrEqual => ordered(left, right, |o| o.is_ge()),
        Operator::LessOrEqual => ordered(left, right, |o| o.is_le()),
        Operator::In => match (left, right) {
            (Some(l), Some(Value::Array(items))) => items.iter().any(|item| loose_eq(l, item)),
            _ => false,
        },
        Operator::NotIn => match (left, right) {
            (Some(l), Some(Value::Array(items))) => !items.iter().any(|item| loose_eq(l, item)),
            (None, _) => true,
            _ => false,
        },
        Operator::Matches => {
            let Some(text) = left.and_then(Value::as_str) else {
                return false;
            };
            let Some(pattern) = right.and_then(Value::as_str) else {
                return false;
            };
            regex::Regex::new(pattern)
                .map(|re| re.is_match(text))
                .unwrap_or(false)
        }
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::String(l), Value::String(r)) => l.eq_ignore_ascii_case(r),
        (Value::Number(_), Value::Number(_)) => as_f64(left) == as_f64(right),
        (Value::Number(_), Value::String(s)) | (Value::String(s), Value::Number(_)) => {
            s.parse::<f64>().ok() == as_f64(if left.is_number() { left } else { right })
        }
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            s.eq_ignore_ascii_case(if *b { "true" } else { "false" })
        }
        _ => left == right,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle
            .as_str()
            .map(|n| s.to_lowercase().contains(&n.to_lowercase()))
            .unwrap_or(false),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::Object(map) => needle.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
        _ => false,
    }
}

fn string_pair(left: Option<&Value>, right: Option<&Value>) -> Option<(String, String)> {
    let l = left?.as_str()?.to_lowercase();
    let r = right?.as_str()?.to_lowercase();
    Some((l, r))
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn ordered(
    left: Option<&Value>,
    right: Option<&Value>,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    let (Some(l), Some(r)) = (left, right) else {
        return false;
    };

    if let (Some(a), Some(b)) = (as_timestamp(l), as_timestamp(r)) {
        return accept(a.cmp(&b));
    }
    match (as_f64(l), as_f64(r)) {
        (Some(a), Some(b)) => a.partial_cmp(&b).map(accept).unwrap_or(false),
        _ => false,
    }
}
