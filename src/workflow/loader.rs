//! Loading compiled workflows from YAML or JSON.

use std::path::Path;

use super::types::CompiledWorkflow;
use crate::error::{Error, Result};

/// Parse a compiled workflow document. JSON is accepted as YAML.
pub fn parse_workflow(text: &str) -> Result<CompiledWorkflow> {
    if text.trim().is_empty() {
        return Err(Error::Parse("Empty workflow definition".to_string()));
    }

    let workflow: CompiledWorkflow = serde_yaml::from_str(text).map_err(|e| {
        let msg = e.to_string();
        if let Some(field) = extract_missing_field(&msg) {
            Error::Parse(format!("Missing required field: {}", field))
        } else if let Some(variant) = extract_unknown_variant(&msg) {
            Error::Parse(format!("Unknown step type or operation: {}", variant))
        } else {
            Error::Parse(format!("Invalid workflow document: {}", msg))
        }
    })?;
    Ok(workflow)
}

pub fn parse_workflow_file(path: &Path) -> Result<CompiledWorkflow> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow(&content)
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    between(error_message, "missing field `", '`')
}

fn extract_unknown_variant(error_message: &str) -> Option<&str> {
    between(error_message, "unknown variant `", '`')
}

fn between<'a>(text: &'a str, marker: &str, close: char) -> Option<&'a str> {
    let start = text.find(marker)? + marker.len();
    let rest = &text[start..];
    let end = rest.find(close)?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepKind;

    #[test]
    fn test_parse_yaml_workflow() {
        let yaml = r#"
goal: notify sales
steps:
  - id: step1
    name: fetch
    type: action
    plugin: gmail
    action: search_emails
  - id: step2
    name: each
    type: scatter_gather
    dependencies: [step1]
    input: "{{step1.emails}}"
    steps:
      - id: step2_1
        name: send
        type: action
        plugin: gmail
        action: send_email
        params:
          to: "{{item.from}}"
"#;
        let workflow = parse_workflow(yaml).unwrap();
        assert_eq!(workflow.goal, "notify sales");
        assert_eq!(workflow.steps.len(), 2);
        assert_eq!(workflow.index_of("step2"), Some(1));
        assert!(matches!(
            &workflow.steps[1].kind,
            StepKind::ScatterGather { item_variable, .. } if item_variable == "item"
        ));
    }

    #[test]
    fn test_parse_json_workflow() {
        let json = r#"{"goal": "g", "steps": [{"id": "step1", "name": "n", "type": "comparison",
            "left": 1, "right": 1, "operation": "equals"}]}"#;
        let workflow = parse_workflow(json).unwrap();
        assert_eq!(workflow.steps[0].step_type(), "comparison");
    }

    #[test]
    fn test_parse_errors_are_readable() {
        assert!(parse_workflow("  ").is_err());

        let err = parse_workflow("goal: g").unwrap_err();
        assert!(err.to_string().contains("Missing required field: steps"));

        let err = parse_workflow("steps:\n  - id: a\n    name: a\n    type: teleport\n").unwrap_err();
        assert!(err.to_string().contains("teleport"));
    }
}
