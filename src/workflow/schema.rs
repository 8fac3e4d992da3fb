//! JSON Schemas for transform configs.
//!
//! One schema per transform operation. The post-compile parser checks every
//! transform step's config against its schema before anything runs.

use std::collections::HashMap;

use jsonschema::Validator;
use serde_json::{json, Value};

use super::types::TransformOp;
use crate::error::{Error, Result};

const OPERATORS: &[&str] = &[
    "equals",
    "not_equals",
    "contains",
    "not_contains",
    "gt",
    "gte",
    "lt",
    "lte",
    "in",
    "exists",
    "not_exists",
    "matches",
];

/// JSON Schema for the config of `op`.
pub fn transform_config_schema(op: TransformOp) -> Value {
    let key = json!({"type": "string", "minLength": 1});
    match op {
        TransformOp::Filter => json!({
            "type": "object",
            "required": ["conditions"],
            "properties": {
                "conditions": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "required": ["field", "operator"],
                        "properties": {
                            "field": key,
                            "operator": {"enum": OPERATORS},
                            "value": {}
                        }
                    }
                },
                "combine_with": {"enum": ["and", "or", "AND", "OR"]}
            }
        }),
        TransformOp::Map => json!({
            "type": "object",
            "anyOf": [
                {"required": ["expression"]},
                {"required": ["fields"]}
            ],
            "properties": {
                "expression": key,
                "fields": {"type": "object", "additionalProperties": {"type": "string"}}
            }
        }),
        TransformOp::Group => json!({
            "type": "object",
            "required": ["key"],
            "properties": {"key": key}
        }),
        TransformOp::Aggregate => json!({
            "type": "object",
            "properties": {
                "function": {"enum": ["count", "sum", "avg", "min", "max", "collect"]},
                "field": key
            }
        }),
        TransformOp::Deduplicate => json!({
            "type": "object",
            "properties": {
                "key": key,
                "keep": {"enum": ["first", "last"]}
            }
        }),
        TransformOp::Reduce => json!({
            "type": "object",
            "required": ["expression"],
            "properties": {"expression": key, "initial": {}}
        }),
        TransformOp::Join => json!({
            "type": "object",
            "required": ["right", "left_key"],
            "properties": {
                "right": {},
                "left_key": key,
                "right_key": key,
                "kind": {"enum": ["inner", "left"]}
            }
        }),
        TransformOp::Pivot => json!({
            "type": "object",
            "required": ["row_key", "column_key", "value_field"],
            "properties": {"row_key": key, "column_key": key, "value_field": key}
        }),
        TransformOp::Split => json!({
            "type": "object",
            "anyOf": [
                {"required": ["batch_size"]},
                {"required": ["field"]}
            ],
            "properties": {
                "batch_size": {"type": "integer", "minimum": 1},
                "field": key,
                "separator": {"type": "string"}
            }
        }),
        TransformOp::Expand => json!({
            "type": "object",
            "required": ["field"],
            "properties": {"field": key}
        }),
        TransformOp::Flatten => json!({
            "type": "object",
            "properties": {"depth": {"type": "integer", "minimum": 0}}
        }),
        TransformOp::Sort => json!({
            "type": "object",
            "properties": {
                "by": key,
                "order": {"enum": ["asc", "desc"]}
            }
        }),
        TransformOp::Extract => json!({
            "type": "object",
            "properties": {
                "field": key,
                "format": {"enum": ["auto", "text", "base64"]},
                "output_field": key
            }
        }),
    }
}

/// Compiled validators for every transform operation.
pub struct TransformSchemas {
    validators: HashMap<TransformOp, Validator>,
}

impl TransformSchemas {
    pub fn new() -> Result<Self> {
        let validators = TransformOp::ALL
            .iter()
            .map(|op| {
                jsonschema::validator_for(&transform_config_schema(*op))
                    .map(|v| (*op, v))
                    .map_err(|e| {
                        Error::Config(format!("invalid {} config schema: {}", op.as_str(), e))
                    })
            })
            .collect::<Result<_>>()?;
        Ok(Self { validators })
    }

    /// Violations of `config` for `op`, as `path: message` strings.
    pub fn validate(&self, op: TransformOp, config: &Value) -> Vec<String> {
        let empty = json!({});
        let config = if config.is_null() { &empty } else { config };
        match self.validators.get(&op) {
            Some(validator) => validator
                .iter_errors(config)
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{}: {}", path, e)
                    }
                })
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_schema_compiles() {
        assert!(TransformSchemas::new().is_ok());
    }

    #[test]
    fn test_filter_config() {
        let schemas = TransformSchemas::new().unwrap();
        let ok = json!({"conditions": [{"field": "body", "operator": "contains", "value": "x"}]});
        assert!(schemas.validate(TransformOp::Filter, &ok).is_empty());

        let bad = json!({"conditions": [{"field": "body", "operator": "like"}]});
        let errors = schemas.validate(TransformOp::Filter, &bad);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("/conditions/0/operator"));

        assert!(!schemas.validate(TransformOp::Filter, &Value::Null).is_empty());
    }

    #[test]
    fn test_optional_configs_accept_null() {
        let schemas = TransformSchemas::new().unwrap();
        for op in [TransformOp::Flatten, TransformOp::Sort, TransformOp::Extract, TransformOp::Aggregate] {
            assert!(schemas.validate(op, &Value::Null).is_empty(), "{}", op.as_str());
        }
    }

    #[test]
    fn test_split_needs_batch_or_field() {
        let schemas = TransformSchemas::new().unwrap();
        assert!(schemas.validate(TransformOp::Split, &json!({"batch_size": 10})).is_empty());
        assert!(!schemas.validate(TransformOp::Split, &json!({"separator": ","})).is_empty());
        assert!(!schemas.validate(TransformOp::Split, &json!({"batch_size": 0})).is_empty());
    }
}
