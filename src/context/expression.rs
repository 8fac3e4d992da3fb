//! Sandboxed expression evaluation with Rhai.
//!
//! Two engines are used:
//! - the *restricted* engine (`Engine::new_raw`, no packages) for literal
//!   fallbacks: arithmetic and string concatenation only
//! - the *transform* engine for `map`/`reduce` expressions over items
//!
//! Both evaluate expressions only (no statements, loops or function
//! definitions) under operation and size limits.

use rhai::{Dynamic, Engine, Scope};
use serde_json::Value;

use crate::error::ResolutionError;

const MAX_OPERATIONS: u64 = 10_000;
const MAX_EXPR_DEPTH: usize = 32;
const MAX_STRING_SIZE: usize = 64 * 1024;
const MAX_COLLECTION_SIZE: usize = 10_000;

fn apply_limits(engine: &mut Engine) {
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_EXPR_DEPTH);
    engine.set_max_string_size(MAX_STRING_SIZE);
    engine.set_max_array_size(MAX_COLLECTION_SIZE);
    engine.set_max_map_size(MAX_COLLECTION_SIZE);
}

/// Whether `text` looks like pure arithmetic/concatenation once string
/// literals are removed.
pub fn is_restricted_expression(text: &str) -> bool {
    let stripped = strip_literals(text);
    let has_operator = stripped.chars().any(|c| "+-*/%".contains(c));
    let allowed = stripped
        .chars()
        .all(|c| c.is_ascii_digit() || c.is_whitespace() || "+-*/%().".contains(c));
    has_operator && allowed
}

/// Whether a template skeleton is written as an expression: restricted,
/// with every operator starting a new term (after whitespace or `(`).
///
/// `{{n}} * 2` qualifies; `{{year}}-01-05` does not and is interpolated.
pub fn is_explicit_expression(text: &str) -> bool {
    if !is_restricted_expression(text) {
        return false;
    }
    let mut prev: Option<char> = None;
    for c in strip_literals(text).chars() {
        let delimited = match prev {
            None => true,
            Some(p) => p == '(' || p.is_whitespace(),
        };
        if "+-*/%".contains(c) && !delimited {
            return false;
        }
        prev = Some(c);
    }
    true
}

/// Replace each string literal with `0`, honoring escapes.
fn strip_literals(text: &str) -> String {
    let mut stripped = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '"' {
            // Skip the string literal, honoring escapes.
            let mut escaped = false;
            for inner in chars.by_ref() {
                if escaped {
                    escaped = false;
                } else if inner == '\\' {
                    escaped = true;
                } else if inner == '"' {
                    break;
                }
            }
            stripped.push('0');
        } else {
            stripped.push(c);
        }
    }
    stripped
}

/// Evaluate a restricted expression (arithmetic and string concatenation).
pub fn eval_restricted(text: &str) -> std::result::Result<Value, ResolutionError> {
    if !is_restricted_expression(text) {
        return Err(ResolutionError::Expression(format!(
            "'{}' is not an arithmetic or concatenation expression",
            text
        )));
    }
    let mut engine = Engine::new_raw();
    apply_limits(&mut engine);
    engine
        .eval_expression::<Dynamic>(text)
        .map(dynamic_to_json)
        .map_err(|e| ResolutionError::Expression(e.to_string()))
}

/// Engine for item-level transform expressions.
pub struct TransformEngine {
    engine: Engine,
}

impl Default for TransformEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformEngine {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        apply_limits(&mut engine);
        Self { engine }
    }

    /// Evaluate `expression` with the given variables in scope.
    pub fn eval(
        &self,
        expression: &str,
        variables: &[(&str, &Value)],
    ) -> std::result::Result<Value, ResolutionError> {
        let mut scope = Scope::new();
        for (name, value) in variables {
            scope.push_dynamic(name.to_string(), json_to_dynamic((*value).clone()));
        }
        self.engine
            .eval_expression_with_scope::<Dynamic>(&mut scope, expression)
            .map(dynamic_to_json)
            .map_err(|e| ResolutionError::Expression(e.to_string()))
    }
}

/// Convert rhai::Dynamic to serde_json::Value
pub fn dynamic_to_json(v: Dynamic) -> Value {
    if v.is_unit() {
        Value::Null
    } else if v.is_bool() {
        Value::Bool(v.as_bool().unwrap_or(false))
    } else if v.is_int() {
        serde_json::json!(v.as_int().unwrap_or(0))
    } else if v.is_float() {
        serde_json::json!(v.as_float().unwrap_or(0.0))
    } else if v.is_string() {
        Value::String(v.into_string().unwrap_or_default())
    } else if v.is_array() {
        match v.into_array() {
            Ok(arr) => Value::Array(arr.into_iter().map(dynamic_to_json).collect()),
            Err(_) => Value::Null,
        }
    } else if v.is_map() {
        match v.try_cast::<rhai::Map>() {
            Some(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                    .collect(),
            ),
            None => Value::Null,
        }
    } else {
        Value::String(v.to_string())
    }
}

/// Convert serde_json::Value to rhai::Dynamic
pub fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s),
        Value::Array(arr) => {
            let vec: Vec<Dynamic> = arr.into_iter().map(json_to_dynamic).collect();
            Dynamic::from(vec)
        }
        Value::Object(obj) => {
            let mut map = rhai::Map::new();
            for (k, v) in obj {
                map.insert(k.into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval_restricted("5 * 2 + 1").unwrap(), json!(11));
        assert_eq!(eval_restricted("(1.5 + 0.5) / 2.0").unwrap(), json!(1.0));
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(
            eval_restricted(r#""Ada" + " " + "Lovelace""#).unwrap(),
            json!("Ada Lovelace")
        );
    }

    #[test]
    fn test_explicit_expression_needs_spaced_operators() {
        assert!(is_explicit_expression("0 * 2"));
        assert!(is_explicit_expression(r#"0 + "-""#));
        assert!(is_explicit_expression("(0 + 1) * -2"));
        assert!(!is_explicit_expression("0-01-05"));
        assert!(!is_explicit_expression("0/2"));
        assert!(!is_explicit_expression("0 0"));
    }

    #[test]
    fn test_code_is_refused() {
        assert!(eval_restricted("print(1)").is_err());
        assert!(eval_restricted("let x = 1; x").is_err());
        assert!(eval_restricted("2024-01-05T10:00").is_err());
        assert!(eval_restricted("42").is_err());
    }

    #[test]
    fn test_transform_engine_scope() {
        let engine = TransformEngine::new();
        let item = json!({"price": 4, "qty": 3, "name": "pen"});
        let result = engine
            .eval(
                r#"#{ name: item.name, total: item.price * item.qty }"#,
                &[("item", &item)],
            )
            .unwrap();
        assert_eq!(result, json!({"name": "pen", "total": 12}));
    }

    #[test]
    fn test_transform_engine_rejects_heavy_expression() {
        let engine = TransformEngine::new();
        let result = engine.eval("(0..1000000).map(|x| x * 2).len()", &[]);
        assert!(result.is_err());
    }
}
