//! Comparison step operations.

use serde_json::{json, Map, Value};

use super::conditions::loose_equals;
use crate::workflow::ComparisonOp;

/// Compare two resolved operands.
///
/// `equals`, `deep_equals`, `contains` and `subset` produce
/// `{"result": bool}`; `diff` produces `{added, removed, modified, unchanged}`.
pub fn compare(left: &Value, right: &Value, op: ComparisonOp) -> Value {
    match op {
        ComparisonOp::Equals => json!({ "result": left == right }),
        ComparisonOp::DeepEquals => json!({ "result": loose_equals(left, right) }),
        ComparisonOp::Diff => diff(left, right),
        ComparisonOp::Contains => json!({ "result": contains(left, right) }),
        ComparisonOp::Subset => json!({ "result": is_subset(left, right) }),
    }
}

/// Structural diff keyed by object key, or by element index for arrays.
pub fn diff(left: &Value, right: &Value) -> Value {
    let (left_entries, right_entries) = match (left, right) {
        (Value::Object(l), Value::Object(r)) => (l.clone(), r.clone()),
        (Value::Array(l), Value::Array(r)) => (indexed(l), indexed(r)),
        _ => {
            return if loose_equals(left, right) {
                json!({"added": {}, "removed": {}, "modified": {}, "unchanged": {"value": left}})
            } else {
                json!({
                    "added": {},
                    "removed": {},
                    "modified": {"value": {"from": left, "to": right}},
                    "unchanged": {}
                })
            };
        }
    };

    let mut added = Map::new();
    let mut removed = Map::new();
    let mut modified = Map::new();
    let mut unchanged = Map::new();

    for (key, old) in &left_entries {
        match right_entries.get(key) {
            None => {
                removed.insert(key.clone(), old.clone());
            }
            Some(new) if loose_equals(old, new) => {
                unchanged.insert(key.clone(), old.clone());
            }
            Some(new) => {
                modified.insert(key.clone(), json!({"from": old, "to": new}));
            }
        }
    }
    for (key, new) in &right_entries {
        if !left_entries.contains_key(key) {
            added.insert(key.clone(), new.clone());
        }
    }

    json!({
        "added": added,
        "removed": removed,
        "modified": modified,
        "unchanged": unchanged,
    })
}

fn indexed(items: &[Value]) -> Map<String, Value> {
    items
        .iter()
        .enumerate()
        .map(|(i, v)| (i.to_string(), v.clone()))
        .collect()
}

/// Whether `left` contains `right`: substring, array element, or object entries.
fn contains(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::String(l), Value::String(r)) => l.contains(r.as_str()),
        (Value::Array(items), needle) => items.iter().any(|i| loose_equals(i, needle)),
        (Value::Object(_), Value::Object(_)) => is_subset(right, left),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

/// Whether every element (or entry) of `left` also appears in `right`.
fn is_subset(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Array(small), Value::Array(big)) => small
            .iter()
            .all(|s| big.iter().any(|b| loose_equals(s, b))),
        (Value::Object(small), Value::Object(big)) => small
            .iter()
            .all(|(k, v)| big.get(k).map(|b| loose_equals(v, b)).unwrap_or(false)),
        _ => loose_equals(left, right),
    }
}
