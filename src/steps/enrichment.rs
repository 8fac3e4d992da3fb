//! Enrichment: combine several resolved sources into one value.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use super::conditions::{field_value, group_key};
use super::transform::shallow_merge;
use crate::error::StepErrorKind;
use crate::workflow::EnrichmentStrategy;

/// Combine `sources` with `strategy`.
///
/// `merge` and `deep_merge` fold left to right, later sources winning. Two
/// arrays are concatenated. `join` matches array items of every source on
/// `join_key` against the first source.
pub fn enrich(
    sources: Vec<Value>,
    strategy: EnrichmentStrategy,
    join_key: Option<&str>,
) -> Result<Value, StepErrorKind> {
    if sources.is_empty() {
        return Err(StepErrorKind::InvalidConfig(
            "enrichment requires at least one source".into(),
        ));
    }

    match strategy {
        EnrichmentStrategy::Merge => Ok(fold(sources, |acc, next| match (acc, next) {
            (Value::Array(mut a), Value::Array(b)) => {
                a.extend(b);
                Value::Array(a)
            }
            (acc, next) => shallow_merge(&acc, &next),
        })),
        EnrichmentStrategy::DeepMerge => Ok(fold(sources, deep_merge)),
        EnrichmentStrategy::Join => {
            let key = join_key.ok_or_else(|| {
                StepErrorKind::InvalidConfig("join strategy requires 'join_key'".into())
            })?;
            join_sources(sources, key)
        }
    }
}

fn fold(sources: Vec<Value>, f: impl Fn(Value, Value) -> Value) -> Value {
    let mut iter = sources.into_iter();
    let first = iter.next().unwrap_or(Value::Null);
    iter.fold(first, f)
}

/// Recursive merge: objects merge key by key, anything else is replaced.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

fn join_sources(sources: Vec<Value>, key: &str) -> Result<Value, StepErrorKind> {
    let mut collections = sources.into_iter().map(|s| match s {
        Value::Array(items) => Ok(items),
        other => Err(StepErrorKind::TypeMismatch(format!(
            "join enrichment requires array sources, got {}",
            crate::context::json_type(&other)
        ))),
    });

    let mut base = collections.next().transpose()?.unwrap_or_default();
    for other in collections {
        let other = other?;
        let mut index: HashMap<String, Map<String, Value>> = HashMap::new();
        for item in other {
            if let (Some(k), Value::Object(map)) = (field_value(&item, key).map(group_key), &item) {
                index.entry(k).or_default().extend(map.clone());
            }
        }
        for item in base.iter_mut() {
            let k = field_value(item, key).map(group_key);
            if let (Some(extra), Value::Object(map)) = (k.and_then(|k| index.get(&k)), item) {
                for (field, value) in extra {
                    map.entry(field.clone()).or_insert_with(|| value.clone());
                }
            }
        }
    }
    Ok(json!(base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shallow_merge_later_wins() {
        let out = enrich(
            vec![json!({"a": 1, "nested": {"x": 1}}), json!({"b": 2, "nested": {"y": 2}})],
            EnrichmentStrategy::Merge,
            None,
        )
        .unwrap();
        assert_eq!(out, json!({"a": 1, "b": 2, "nested": {"y": 2}}));
    }

    #[test]
    fn test_merge_concatenates_arrays() {
        let out = enrich(vec![json!([1]), json!([2, 3])], EnrichmentStrategy::Merge, None).unwrap();
        assert_eq!(out, json!([1, 2, 3]));
    }

    #[test]
    fn test_deep_merge() {
        let out = enrich(
            vec![json!({"nested": {"x": 1, "k": "a"}}), json!({"nested": {"y": 2, "k": "b"}})],
            EnrichmentStrategy::DeepMerge,
            None,
        )
        .unwrap();
        assert_eq!(out, json!({"nested": {"x": 1, "y": 2, "k": "b"}}));
    }

    #[test]
    fn test_join_on_key() {
        let out = enrich(
            vec![
                json!([{"email": "a@x.io", "subject": "hi"}, {"email": "c@x.io"}]),
                json!([{"email": "a@x.io", "owner": "ana"}]),
            ],
            EnrichmentStrategy::Join,
            Some("email"),
        )
        .unwrap();
        assert_eq!(
            out,
            json!([{"email": "a@x.io", "subject": "hi", "owner": "ana"}, {"email": "c@x.io"}])
        );
    }

    #[test]
    fn test_join_requires_key_and_arrays() {
        assert!(enrich(vec![json!([])], EnrichmentStrategy::Join, None).is_err());
        assert!(matches!(
            enrich(vec![json!([]), json!({})], EnrichmentStrategy::Join, Some("id")),
            Err(StepErrorKind::TypeMismatch(_))
        ));
    }
}
