//! Condition evaluation shared by filters, conditionals and validation rules.

use std::cmp::Ordering;

use serde_json::Value;

use crate::error::StepErrorKind;
use crate::ir::Combinator;
use crate::workflow::ConditionOperator;

/// Evaluate `left <operator> right`.
pub fn evaluate(
    left: &Value,
    operator: ConditionOperator,
    right: &Value,
) -> Result<bool, StepErrorKind> {
    use ConditionOperator as Op;
    match operator {
        Op::Equals => Ok(loose_equals(left, right)),
        Op::NotEquals => Ok(!loose_equals(left, right)),
        Op::Contains => Ok(contains(left, right)),
        Op::NotContains => Ok(!contains(left, right)),
        Op::Gt | Op::Gte | Op::Lt | Op::Lte => {
            let ordering = compare_ordered(left, right).ok_or_else(|| {
                StepErrorKind::TypeMismatch(format!(
                    "operator '{}' cannot compare {} with {}",
                    operator_name(operator),
                    left,
                    right
                ))
            })?;
            Ok(match operator {
                Op::Gt => ordering == Ordering::Greater,
                Op::Gte => ordering != Ordering::Less,
                Op::Lt => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            })
        }
        Op::In => match right {
            Value::Array(options) => Ok(options.iter().any(|o| loose_equals(left, o))),
            Value::String(s) => Ok(left.as_str().map(|l| s.contains(l)).unwrap_or(false)),
            other => Err(StepErrorKind::TypeMismatch(format!(
                "operator 'in' requires an array, got {}",
                other
            ))),
        },
        Op::Exists => Ok(!left.is_null()),
        Op::NotExists => Ok(left.is_null()),
        Op::Matches => {
            let pattern = right.as_str().ok_or_else(|| {
                StepErrorKind::TypeMismatch("operator 'matches' requires a string pattern".into())
            })?;
            let regex = regex_lite::Regex::new(pattern).map_err(|e| {
                StepErrorKind::InvalidConfig(format!("invalid pattern '{}': {}", pattern, e))
            })?;
            Ok(regex.is_match(&stringify(left)))
        }
    }
}

/// Combine condition results.
pub fn combine(results: impl IntoIterator<Item = bool>, combinator: Combinator) -> bool {
    let mut results = results.into_iter();
    match combinator {
        Combinator::And => results.all(|r| r),
        Combinator::Or => results.any(|r| r),
    }
}

pub fn operator_name(operator: ConditionOperator) -> String {
    serde_json::to_value(operator)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Equality with numeric normalization (`1 == 1.0`).
pub fn loose_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| loose_equals(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).map(|w| loose_equals(v, w)).unwrap_or(false))
        }
        _ => left == right,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => match needle {
            Value::String(n) => s.to_lowercase().contains(&n.to_lowercase()),
            other => s.contains(&other.to_string()),
        },
        Value::Array(items) => items.iter().any(|i| loose_equals(i, needle)),
        Value::Object(map) => needle.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
        _ => false,
    }
}

pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Ordering for `gt`/`lt`: numeric when both sides are numeric, otherwise
/// lexicographic for two strings (ISO dates compare correctly).
fn compare_ordered(left: &Value, right: &Value) -> Option<Ordering> {
    match (as_f64(left), as_f64(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r),
        _ => match (left, right) {
            (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
            _ => None,
        },
    }
}

/// Total order used by `sort`: nulls first, then booleans, numbers, strings.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        _ => rank(left).cmp(&rank(right)),
    }
}

pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Dot-path lookup inside an item (`customer.email`, `tags.0`).
///
/// A leading `item.` is accepted and ignored.
pub fn field_value<'a>(item: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    let path = path.strip_prefix("item.").unwrap_or(path);
    if path.is_empty() || path == "item" {
        return Some(item);
    }
    path.split('.')
        .filter(|s| !s.is_empty())
        .try_fold(item, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Stable string key for grouping and deduplication.
pub fn group_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
