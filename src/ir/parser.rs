//! IR document parsing (JSON or YAML text).

use std::path::Path;

use serde_json::Value;

use crate::error::{Error, Result};

/// Parse IR text into a raw JSON value.
///
/// The result is deliberately untyped: the forbidden-token scan in
/// [`super::validate_ir`] must see the document exactly as produced.
pub fn parse_ir(text: &str) -> Result<Value> {
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return Err(Error::Parse("Empty IR document".to_string()));
    }

    if trimmed.starts_with('{') {
        return serde_json::from_str(trimmed)
            .map_err(|e| Error::Parse(format!("Invalid JSON: {}", e)));
    }

    let value: Value = serde_yaml::from_str(text).map_err(|e| {
        let msg = e.to_string();
        Error::Parse(format!("Invalid YAML: {}", msg))
    })?;

    if !value.is_object() {
        return Err(Error::Parse(
            "IR document must be a mapping at the top level".to_string(),
        ));
    }
    Ok(value)
}

/// Parse an IR document from a file path.
pub fn parse_ir_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)?;
    parse_ir(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_ir() {
        let value = parse_ir(r#"{"goal": "x", "data_sources": []}"#).unwrap();
        assert_eq!(value["goal"], "x");
    }

    #[test]
    fn test_parse_yaml_ir() {
        let yaml = r##"
goal: Send a daily digest
data_sources:
  - source: sheets
    kind: api
    operation: null
    query: null
    params: null
filtering: null
ai_processing: []
delivery_rules:
  per_group_delivery: null
  summary_delivery:
    plugin: slack
    action: post_message
    recipient: "#ops"
  raw_delivery: null
grouping: null
"##;
        let value = parse_ir(yaml).unwrap();
        assert_eq!(value["data_sources"][0]["source"], "sheets");
        assert!(value["filtering"].is_null());
        assert!(crate::ir::validate_ir(&value).is_ok());
    }

    #[test]
    fn test_empty_document() {
        let err = parse_ir("   \n").unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");
    }

    #[test]
    fn test_scalar_document_rejected() {
        assert!(parse_ir("just a string").is_err());
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ir.json");
        std::fs::write(&path, r#"{"goal": "from file"}"#).unwrap();
        assert_eq!(parse_ir_file(&path).unwrap()["goal"], "from file");
    }
}
