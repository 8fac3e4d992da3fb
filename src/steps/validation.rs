//! Validation step: schema checks and custom rules.
//!
//! The step schema is a compact subset of JSON Schema:
//!
//! ```yaml
//! type: object
//! required: [email, total]
//! properties:
//!   email: { type: string, pattern: "^[^@]+@[^@]+$" }
//!   total: { type: number, minimum: 0 }
//!   lines: { type: array, items: { type: object } }
//! ```
//!
//! `min_length`/`max_length` are accepted alongside the camel-case JSON
//! Schema keywords. The schema is translated once and checked with
//! `jsonschema`, so every violation is reported with its instance path.

use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::conditions::{evaluate, field_value, operator_name};
use crate::error::StepErrorKind;
use crate::workflow::ValidationRule;

/// One validation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

/// Result of validating one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| {
                if v.path.is_empty() {
                    v.message.clone()
                } else {
                    format!("{}: {}", v.path, v.message)
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Translate a step schema into JSON Schema.
pub fn to_json_schema(schema: &Value) -> Value {
    let Value::Object(map) = schema else {
        return schema.clone();
    };
    let mut out = Map::new();
    for (key, value) in map {
        let (key, value) = match key.as_str() {
            "min_length" => ("minLength".to_string(), value.clone()),
            "max_length" => ("maxLength".to_string(), value.clone()),
            "min_items" => ("minItems".to_string(), value.clone()),
            "max_items" => ("maxItems".to_string(), value.clone()),
            "items" => ("items".to_string(), to_json_schema(value)),
            "properties" => (
                "properties".to_string(),
                match value {
                    Value::Object(props) => Value::Object(
                        props
                            .iter()
                            .map(|(k, v)| (k.clone(), to_json_schema(v)))
                            .collect(),
                    ),
                    other => other.clone(),
                },
            ),
            _ => (key.clone(), value.clone()),
        };
        out.insert(key, value);
    }
    Value::Object(out)
}

/// Validate `input` against an optional schema and custom rules.
pub fn validate(
    input: &Value,
    schema: Option<&Value>,
    rules: &[ValidationRule],
) -> Result<ValidationReport, StepErrorKind> {
    let mut violations = Vec::new();

    if let Some(schema) = schema {
        let validator = validator_for(&to_json_schema(schema))
            .map_err(|e| StepErrorKind::InvalidConfig(format!("invalid schema: {}", e)))?;
        violations.extend(validator.iter_errors(input).map(|error| Violation {
            path: error.instance_path.to_string(),
            message: error.to_string(),
        }));
    }

    for rule in rules {
        let actual = field_value(input, &rule.field).cloned().unwrap_or(Value::Null);
        if !evaluate(&actual, rule.operator, &rule.value)? {
            violations.push(Violation {
                path: rule.field.clone(),
                message: rule.message.clone().unwrap_or_else(|| {
                    format!(
                        "expected {} {} {}",
                        rule.field,
                        operator_name(rule.operator),
                        rule.value
                    )
                }),
            });
        }
    }

    Ok(ValidationReport {
        valid: violations.is_empty(),
        violations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ConditionOperator;
    use serde_json::json;

    fn invoice_schema() -> Value {
        json!({
            "type": "object",
            "required": ["email", "total"],
            "properties": {
                "email": {"type": "string", "pattern": "^[^@]+@[^@]+$", "min_length": 5},
                "total": {"type": "number", "minimum": 0},
                "lines": {"type": "array", "items": {"type": "object", "required": ["sku"]}}
            }
        })
    }

    #[test]
    fn test_valid_input() {
        let report = validate(
            &json!({"email": "a@x.io", "total": 12.5, "lines": [{"sku": "A1"}]}),
            Some(&invoice_schema()),
            &[],
        )
        .unwrap();
        assert!(report.valid);
    }

    #[test]
    fn test_collects_every_violation() {
        let report = validate(
            &json!({"email": "nope", "total": -1, "lines": [{}]}),
            Some(&invoice_schema()),
            &[],
        )
        .unwrap();
        assert!(!report.valid);
        assert!(report.violations.len() >= 3);
        assert!(report.violations.iter().any(|v| v.path == "/total"));
        assert!(report.violations.iter().any(|v| v.path == "/lines/0"));
    }

    #[test]
    fn test_min_length_translated() {
        let report = validate(&json!({"email": "a@b", "total": 1}), Some(&invoice_schema()), &[]).unwrap();
        assert!(report.violations.iter().any(|v| v.path == "/email"));
    }

    #[test]
    fn test_custom_rules() {
        let rules = vec![ValidationRule {
            field: "status".into(),
            operator: ConditionOperator::In,
            value: json!(["paid", "due"]),
            message: Some("unknown invoice status".into()),
        }];
        let report = validate(&json!({"status": "lost"}), None, &rules).unwrap();
        assert_eq!(report.summary(), "status: unknown invoice status");
    }

    #[test]
    fn test_invalid_schema_is_config_error() {
        let err = validate(&json!({}), Some(&json!({"type": 12})), &[]).unwrap_err();
        assert!(matches!(err, StepErrorKind::InvalidConfig(_)));
    }
}
