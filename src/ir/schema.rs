//! JSON Schema for the declarative IR.
//!
//! Every property is listed in `required`; optional data is expressed as an
//! explicit `null`. A producer therefore cannot emit a partial structure that
//! is ambiguous between "absent" and "empty".

use jsonschema::Validator;
use serde_json::{json, Value};

use crate::error::{Error, Result, SchemaError, SchemaErrorCode};

/// JSON Schema for declarative IR documents.
pub fn ir_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": ["goal", "data_sources", "filtering", "ai_processing", "delivery_rules", "grouping"],
        "additionalProperties": false,
        "properties": {
            "goal": {
                "type": "string",
                "minLength": 1,
                "maxLength": 2048
            },
            "data_sources": {
                "type": "array",
                "minItems": 1,
                "items": { "$ref": "#/$defs/data_source" }
            },
            "filtering": {
                "oneOf": [
                    { "type": "null" },
                    { "$ref": "#/$defs/filtering" }
                ]
            },
            "ai_processing": {
                "type": "array",
                "items": { "$ref": "#/$defs/ai_processing" }
            },
            "delivery_rules": { "$ref": "#/$defs/delivery_rules" },
            "grouping": {
                "oneOf": [
                    { "type": "null" },
                    {
                        "type": "object",
                        "required": ["group_by"],
                        "additionalProperties": false,
                        "properties": {
                            "group_by": { "type": ["string", "null"], "minLength": 1 }
                        }
                    }
                ]
            }
        },
        "$defs": {
            "data_source": {
                "type": "object",
                "required": ["source", "kind", "operation", "query", "params"],
                "additionalProperties": false,
                "properties": {
                    "source": { "type": "string", "minLength": 1, "pattern": "^[a-zA-Z][a-zA-Z0-9_-]*$" },
                    "kind": { "enum": ["api", "database", "file", "webhook", "stream"] },
                    "operation": { "type": ["string", "null"], "minLength": 1 },
                    "query": { "type": ["string", "null"] },
                    "params": { "type": ["object", "null"] }
                }
            },
            "filtering": {
                "type": "object",
                "required": ["conditions", "combine_with"],
                "additionalProperties": false,
                "properties": {
                    "conditions": {
                        "type": "array",
                        "items": { "$ref": "#/$defs/filter_clause" }
                    },
                    "combine_with": { "$ref": "#/$defs/combinator" }
                }
            },
            "filter_clause": {
                "oneOf": [
                    { "$ref": "#/$defs/filter_condition" },
                    { "$ref": "#/$defs/filter_group" }
                ]
            },
            "filter_condition": {
                "type": "object",
                "required": ["field", "operator", "value"],
                "additionalProperties": false,
                "properties": {
                    "field": { "type": "string", "minLength": 1 },
                    "operator": {
                        "enum": ["equals", "not_equals", "contains", "not_contains", "gt", "gte", "lt", "lte", "in", "exists", "matches"]
                    },
                    "value": {}
                }
            },
            "filter_group": {
                "type": "object",
                "required": ["combine_with", "conditions"],
                "additionalProperties": false,
                "properties": {
                    "combine_with": { "$ref": "#/$defs/combinator" },
                    "conditions": {
                        "type": "array",
                        "items": { "$ref": "#/$defs/filter_clause" }
                    }
                }
            },
            "combinator": {
                "enum": ["and", "or", null]
            },
            "ai_processing": {
                "type": "object",
                "required": ["type", "instruction", "input_field", "output_field"],
                "additionalProperties": false,
                "properties": {
                    "type": { "type": "string", "minLength": 1 },
                    "instruction": { "type": "string" },
                    "input_field": { "type": ["string", "null"], "minLength": 1 },
                    "output_field": { "type": ["string", "null"], "minLength": 1 }
                }
            },
            "delivery_rules": {
                "type": "object",
                "required": ["per_group_delivery", "summary_delivery", "raw_delivery"],
                "additionalProperties": false,
                "properties": {
                    "per_group_delivery": {
                        "oneOf": [
                            { "type": "null" },
                            {
                                "type": "object",
                                "required": ["group_by", "plugin", "action", "recipient_field"],
                                "additionalProperties": false,
                                "properties": {
                                    "group_by": { "type": ["string", "null"], "minLength": 1 },
                                    "plugin": { "type": "string", "minLength": 1 },
                                    "action": { "type": "string", "minLength": 1 },
                                    "recipient_field": { "type": ["string", "null"], "minLength": 1 }
                                }
                            }
                        ]
                    },
                    "summary_delivery": { "$ref": "#/$defs/delivery_target" },
                    "raw_delivery": { "$ref": "#/$defs/delivery_target" }
                }
            },
            "delivery_target": {
                "oneOf": [
                    { "type": "null" },
                    {
                        "type": "object",
                        "required": ["plugin", "action", "recipient"],
                        "additionalProperties": false,
                        "properties": {
                            "plugin": { "type": "string", "minLength": 1 },
                            "action": { "type": "string", "minLength": 1 },
                            "recipient": { "type": ["string", "null"] }
                        }
                    }
                ]
            }
        }
    })
}

/// Compiled IR schema validator.
pub struct IrSchemaValidator {
    validator: Validator,
}

impl IrSchemaValidator {
    pub fn new() -> Result<Self> {
        let validator = jsonschema::validator_for(&ir_schema())
            .map_err(|e| Error::Config(format!("Invalid IR schema: {}", e)))?;
        Ok(Self { validator })
    }

    /// Validate an IR document, collecting every violation.
    pub fn validate(&self, ir: &Value) -> Vec<SchemaError> {
        self.validator
            .iter_errors(ir)
            .map(|error| {
                let path = error.instance_path.to_string();
                let code = if error.to_string().contains("is a required property") {
                    SchemaErrorCode::MissingField
                } else {
                    SchemaErrorCode::Schema
                };
                SchemaError::new(path, code, error.to_string())
            })
            .collect()
    }
}
