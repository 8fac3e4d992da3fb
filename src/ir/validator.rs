//! IR validation.
//!
//! Validation runs in a fixed order and stops at the first failing stage:
//! 1. forbidden execution-token scan over the raw document (fails closed)
//! 2. JSON Schema conformance
//! 3. typed deserialization
//! 4. semantic checks the schema cannot express

use std::ops::Deref;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use super::schema::IrSchemaValidator;
use super::types::{DeclarativeIr, FilterClause};
use crate::error::{Error, SchemaError, SchemaErrorCode};

/// Object keys that only make sense in a compiled step graph.
const FORBIDDEN_KEYS: &[&str] = &[
    "id",
    "step_id",
    "steps",
    "dependencies",
    "depends_on",
    "for_each",
    "foreach",
    "loop",
    "scatter_gather",
    "next_step",
];

fn template_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{|\}\}|\$\{").expect("valid regex"))
}

fn step_identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bstep_?\d+\b").expect("valid regex"))
}

/// IR that has passed every validation stage.
///
/// Only [`validate_ir`] can construct one, so the compiler never sees
/// unvalidated input.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidIr(DeclarativeIr);

impl ValidIr {
    pub fn into_inner(self) -> DeclarativeIr {
        self.0
    }
}

impl Deref for ValidIr {
    type Target = DeclarativeIr;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Validate a raw IR document.
pub fn validate_ir(raw: &Value) -> std::result::Result<ValidIr, Vec<SchemaError>> {
    let leaks = scan_forbidden_tokens(raw);
    if !leaks.is_empty() {
        warn!(
            "Rejecting IR: {} execution token(s) found before semantic validation",
            leaks.len()
        );
        return Err(leaks);
    }

    let schema = IrSchemaValidator::new().map_err(|e| {
        vec![SchemaError::new("", SchemaErrorCode::Schema, e.to_string())]
    })?;
    let schema_errors = schema.validate(raw);
    if !schema_errors.is_empty() {
        debug!("IR failed schema validation with {} error(s)", schema_errors.len());
        return Err(schema_errors);
    }

    let ir: DeclarativeIr = serde_json::from_value(raw.clone()).map_err(|e| {
        vec![SchemaError::new("", SchemaErrorCode::Schema, e.to_string())]
    })?;

    let semantic = semantic_errors(&ir);
    if !semantic.is_empty() {
        return Err(semantic);
    }

    Ok(ValidIr(ir))
}

/// Validate and convert failures into the crate error type.
pub fn validate_ir_strict(raw: &Value) -> crate::error::Result<ValidIr> {
    validate_ir(raw).map_err(Error::SchemaValidation)
}

/// Scan the raw structure for execution details.
///
/// Any match rejects the document; every match is reported.
pub fn scan_forbidden_tokens(raw: &Value) -> Vec<SchemaError> {
    let mut errors = Vec::new();
    scan_value(raw, String::new(), &mut errors);
    errors
}

fn scan_value(value: &Value, path: String, errors: &mut Vec<SchemaError>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = format!("{}/{}", path, key);
                if FORBIDDEN_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
                    errors.push(SchemaError::new(
                        child_path.clone(),
                        SchemaErrorCode::ForbiddenToken,
                        format!("key '{}' is an execution construct", key),
                    ));
                }
                scan_text(key, &child_path, errors);
                scan_value(child, child_path, errors);
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                scan_value(item, format!("{}/{}", path, index), errors);
            }
        }
        Value::String(text) => scan_text(text, &path, errors),
        _ => {}
    }
}

fn scan_text(text: &str, path: &str, errors: &mut Vec<SchemaError>) {
    if template_token_regex().is_match(text) {
        errors.push(SchemaError::new(
            path,
            SchemaErrorCode::ForbiddenToken,
            "variable-reference syntax is not allowed in declarative input",
        ));
    }
    if let Some(m) = step_identifier_regex().find(text) {
        errors.push(SchemaError::new(
            path,
            SchemaErrorCode::ForbiddenToken,
            format!("step identifier '{}' is not allowed in declarative input", m.as_str()),
        ));
    }
}

fn semantic_errors(ir: &DeclarativeIr) -> Vec<SchemaError> {
    let mut errors = Vec::new();

    if ir.goal.trim().is_empty() {
        errors.push(SchemaError::new(
            "/goal",
            SchemaErrorCode::InvalidValue,
            "goal must not be blank",
        ));
    }

    if ir.data_sources.is_empty() {
        errors.push(SchemaError::new(
            "/data_sources",
            SchemaErrorCode::MissingField,
            "at least one data source is required",
        ));
    }

    if let Some(filtering) = &ir.filtering {
        if filtering.conditions.is_empty() {
            errors.push(SchemaError::new(
                "/filtering/conditions",
                SchemaErrorCode::InvalidValue,
                "filtering must contain at least one condition (use null for no filtering)",
            ));
        }
        for (index, clause) in filtering.conditions.iter().enumerate() {
            if let FilterClause::Group(group) = clause {
                if group.conditions.is_empty() {
                    errors.push(SchemaError::new(
                        format!("/filtering/conditions/{}", index),
                        SchemaErrorCode::InvalidValue,
                        "condition group must not be empty",
                    ));
                }
            }
        }
    }

    for (index, processing) in ir.ai_processing.iter().enumerate() {
        if processing.processing_type.trim().is_empty() {
            errors.push(SchemaError::new(
                format!("/ai_processing/{}/type", index),
                SchemaErrorCode::InvalidValue,
                "processing type must not be blank",
            ));
        }
    }

    if ir.delivery_rules.configured_count() == 0 {
        errors.push(SchemaError::new(
            "/delivery_rules",
            SchemaErrorCode::MissingField,
            "at least one delivery rule must be set",
        ));
    }

    if ir.delivery_rules.per_group_delivery.is_some() && ir.group_key().is_none() {
        errors.push(SchemaError::new(
            "/delivery_rules/per_group_delivery/group_by",
            SchemaErrorCode::MissingField,
            "per-group delivery needs a group key (here or in grouping.group_by)",
        ));
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn angry_emails_ir() -> Value {
        json!({
            "goal": "Tell each sales person about angry customers",
            "data_sources": [
                {"source": "gmail", "kind": "api", "operation": "search_emails", "query": "newer_than:1d", "params": null}
            ],
            "filtering": {
                "conditions": [{"field": "body", "operator": "contains", "value": "angry"}],
                "combine_with": null
            },
            "ai_processing": [],
            "delivery_rules": {
                "per_group_delivery": {"group_by": "sales_person", "plugin": "gmail", "action": "send_email", "recipient_field": null},
                "summary_delivery": null,
                "raw_delivery": null
            },
            "grouping": null
        })
    }

    #[test]
    fn test_valid_ir_passes() {
        let valid = validate_ir(&angry_emails_ir()).unwrap();
        assert_eq!(valid.group_key(), Some("sales_person"));
        assert_eq!(valid.data_sources[0].source, "gmail");
    }

    #[test]
    fn test_template_syntax_is_rejected() {
        let mut ir = angry_emails_ir();
        ir["data_sources"][0]["query"] = json!("from:{{step1.sender}}");

        let errors = validate_ir(&ir).unwrap_err();
        assert!(errors
            .iter()
            .all(|e| e.code == SchemaErrorCode::ForbiddenToken));
        assert!(errors.iter().any(|e| e.path == "/data_sources/0/query"));
    }

    #[test]
    fn test_loop_keys_are_rejected_before_schema() {
        let mut ir = angry_emails_ir();
        ir["for_each"] = json!(true);

        let errors = validate_ir(&ir).unwrap_err();
        // Only the forbidden-token stage reports; the schema stage never runs.
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, SchemaErrorCode::ForbiddenToken);
        assert_eq!(errors[0].path, "/for_each");
    }

    #[test]
    fn test_step_identifier_in_value_is_rejected() {
        let mut ir = angry_emails_ir();
        ir["goal"] = json!("Run Step2 after the fetch");
        let errors = validate_ir(&ir).unwrap_err();
        assert!(errors[0].message.contains("Step2"));
    }

    #[test]
    fn test_per_group_without_key_is_rejected() {
        let mut ir = angry_emails_ir();
        ir["delivery_rules"]["per_group_delivery"]["group_by"] = Value::Null;

        let errors = validate_ir(&ir).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.path == "/delivery_rules/per_group_delivery/group_by"));
    }

    #[test]
    fn test_grouping_key_satisfies_per_group_delivery() {
        let mut ir = angry_emails_ir();
        ir["delivery_rules"]["per_group_delivery"]["group_by"] = Value::Null;
        ir["grouping"] = json!({"group_by": "region"});

        let valid = validate_ir(&ir).unwrap();
        assert_eq!(valid.group_key(), Some("region"));
    }

    #[test]
    fn test_no_delivery_rule_is_rejected() {
        let mut ir = angry_emails_ir();
        ir["delivery_rules"]["per_group_delivery"] = Value::Null;

        let errors = validate_ir(&ir).unwrap_err();
        assert_eq!(errors[0].code, SchemaErrorCode::MissingField);
    }

    #[test]
    fn test_strict_wrapper_returns_crate_error() {
        let err = validate_ir_strict(&json!({"goal": "x"})).unwrap_err();
        assert_eq!(err.code(), "SCHEMA_VALIDATION_ERROR");
    }
}
