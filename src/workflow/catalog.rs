//! Action catalog.
//!
//! Declares, per `plugin.action`, the parameters an action accepts and the
//! transform (if any) its input must pass through first. The post-compile
//! parser checks action steps against these declarations.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::types::TransformOp;
use crate::error::{Error, Result};

/// Declared type of an action parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
            ParamType::Any => "any",
        }
    }

    /// Whether a literal value conforms.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
            ParamType::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
}

/// A transform that must sit between an action and the step feeding it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredTransform {
    /// Parameter whose value must come from the transform
    pub param: String,
    pub operation: TransformOp,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub plugin: String,
    pub action: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Reject parameters that are not declared
    #[serde(default)]
    pub strict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<RequiredTransform>,
}

impl ActionSpec {
    pub fn new(plugin: &str, action: &str) -> Self {
        Self {
            plugin: plugin.to_string(),
            action: action.to_string(),
            params: Vec::new(),
            strict: false,
            requires: None,
        }
    }

    pub fn param(mut self, name: &str, param_type: ParamType, required: bool) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            param_type,
            required,
        });
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn requires(mut self, param: &str, operation: TransformOp, config: Value) -> Self {
        self.requires = Some(RequiredTransform {
            param: param.to_string(),
            operation,
            config,
        });
        self
    }

    pub fn get_param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// Known actions keyed by `plugin.action`. Unknown actions are not checked.
#[derive(Debug, Clone, Default)]
pub struct ActionCatalog {
    actions: HashMap<String, ActionSpec>,
}

impl ActionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog of the actions the compiler emits by default.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(
            ActionSpec::new("gmail", "search_emails")
                .param("query", ParamType::String, false)
                .param("max_results", ParamType::Number, false),
        );
        catalog.register(
            ActionSpec::new("gmail", "send_email")
                .param("to", ParamType::Any, true)
                .param("subject", ParamType::String, false)
                .param("body", ParamType::Any, true),
        );
        catalog.register(
            ActionSpec::new("sheets", "read_range")
                .param("spreadsheet_id", ParamType::String, true)
                .param("range", ParamType::String, false),
        );
        catalog.register(
            ActionSpec::new("sheets", "append_rows")
                .param("spreadsheet_id", ParamType::String, true)
                .param("rows", ParamType::Array, true),
        );
        catalog.register(
            ActionSpec::new("slack", "post_message")
                .param("channel", ParamType::String, true)
                .param("text", ParamType::Any, true),
        );
        catalog.register(
            ActionSpec::new("ai", "summarize")
                .param("input", ParamType::Any, true)
                .param("instruction", ParamType::String, false)
                .param("output_field", ParamType::String, false),
        );
        catalog.register(
            ActionSpec::new("ai", "summarize_documents")
                .param("documents", ParamType::Any, true)
                .param("instruction", ParamType::String, false)
                .requires(
                    "documents",
                    TransformOp::Extract,
                    json!({"field": "attachments", "format": "auto"}),
                ),
        );
        catalog
    }

    /// Load extra specs from a JSON or YAML file, replacing same-named ones.
    pub fn load_from(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        let specs: Vec<ActionSpec> = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)
                .map_err(|e| Error::Parse(format!("{}: {}", path.display(), e)))?,
        };
        for spec in specs {
            self.register(spec);
        }
        Ok(())
    }

    pub fn register(&mut self, spec: ActionSpec) {
        self.actions
            .insert(format!("{}.{}", spec.plugin, spec.action), spec);
    }

    pub fn get(&self, plugin: &str, action: &str) -> Option<&ActionSpec> {
        self.actions.get(&format!("{}.{}", plugin, action))
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
