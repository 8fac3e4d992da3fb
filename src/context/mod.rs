//! Per-run execution context.
//!
//! The context exclusively owns every step output of one run. Top-level
//! outputs live in write-once slots indexed by arena position; nested steps
//! (scatter branches, conditional sub-lists) write into a branch scope that
//! overlays the run scope and is itself write-once per key.
//!
//! Template resolution order for a string:
//! 1. exactly one `{{ref}}` → the referenced value, type preserved
//! 2. no tokens → the string itself
//! 3. embedded tokens → typed JSON substitution and JSON parse, then a
//!    restricted arithmetic/concatenation expression when the template is
//!    written as one (operators set off by spaces), then plain
//!    interpolation

pub mod expression;
pub mod template;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ResolutionError;
use crate::workflow::CompiledWorkflow;
use template::{bare_reference, find_tokens, parse_reference, PathSegment, TemplateRef, Token};

type ResolveResult<T> = std::result::Result<T, ResolutionError>;

/// Field names recognised as a container's dominant collection.
pub const KNOWN_COLLECTION_FIELDS: &[&str] = &[
    "items", "values", "records", "rows", "results", "emails", "groups", "data",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Output of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub data: Value,
    pub metadata: Value,
    pub status: StepStatus,
}

impl StepOutput {
    pub fn completed(data: Value) -> Self {
        Self {
            data,
            metadata: serde_json::json!({}),
            status: StepStatus::Completed,
        }
    }

    pub fn with_metadata(data: Value, metadata: Value) -> Self {
        Self {
            data,
            metadata,
            status: StepStatus::Completed,
        }
    }

    pub fn failed(error: Value) -> Self {
        Self {
            data: Value::Null,
            metadata: serde_json::json!({ "error": error }),
            status: StepStatus::Failed,
        }
    }

    pub fn skipped(reason: &str) -> Self {
        Self {
            data: Value::Null,
            metadata: serde_json::json!({ "reason": reason }),
            status: StepStatus::Skipped,
        }
    }
}

/// A recorded auto-unwrap, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnwrapRecord {
    pub expression: String,
    pub field: String,
}

/// JSON type name for error messages.
pub fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Walk a path from a value.
pub fn navigate<'a>(value: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| match segment {
        PathSegment::Field(name) => current.get(name.as_str()),
        PathSegment::Index(i) => current.get(*i),
    })
}

/// Render a value for plain string interpolation.
pub fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

struct RunState {
    run_id: String,
    input: Value,
    ids: Vec<String>,
    index: HashMap<String, usize>,
    output_fields: Vec<Option<String>>,
    slots: Vec<OnceLock<StepOutput>>,
    unwraps: Mutex<Vec<UnwrapRecord>>,
}

struct ScopedOutput {
    output: StepOutput,
    output_field: Option<String>,
}

struct BranchScope {
    parent: Option<Arc<BranchScope>>,
    variables: HashMap<String, Value>,
    outputs: Mutex<HashMap<String, ScopedOutput>>,
}

impl BranchScope {
    fn outputs(&self) -> MutexGuard<'_, HashMap<String, ScopedOutput>> {
        self.outputs.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Store of step outputs for one run, plus template resolution.
///
/// Cloning is cheap and clones share the same run state.
#[derive(Clone)]
pub struct ExecutionContext {
    run: Arc<RunState>,
    scope: Option<Arc<BranchScope>>,
}

impl ExecutionContext {
    /// Context for a compiled workflow's top-level steps.
    pub fn new(workflow: &CompiledWorkflow, input: Value) -> Self {
        Self::with_steps(
            workflow
                .steps
                .iter()
                .map(|s| (s.id.clone(), s.output_field.clone())),
            input,
        )
    }

    /// Context for an explicit list of `(step id, output field)` slots.
    pub fn with_steps(
        steps: impl IntoIterator<Item = (String, Option<String>)>,
        input: Value,
    ) -> Self {
        let (ids, output_fields): (Vec<String>, Vec<Option<String>>) = steps.into_iter().unzip();
        let index = ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        let slots = ids.iter().map(|_| OnceLock::new()).collect();
        Self {
            run: Arc::new(RunState {
                run_id: uuid::Uuid::new_v4().to_string(),
                input,
                ids,
                index,
                output_fields,
                slots,
                unwraps: Mutex::new(Vec::new()),
            }),
            scope: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    pub fn input(&self) -> &Value {
        &self.run.input
    }

    /// Child context with branch variables (e.g. `item`, `group`).
    ///
    /// Outputs recorded through the child stay in the branch.
    pub fn branch(&self, variables: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            run: self.run.clone(),
            scope: Some(Arc::new(BranchScope {
                parent: self.scope.clone(),
                variables: variables.into_iter().collect(),
                outputs: Mutex::new(HashMap::new()),
            })),
        }
    }

    pub fn is_branch(&self) -> bool {
        self.scope.is_some()
    }

    /// Record a step output. Each key can be written exactly once.
    pub fn record_output(
        &self,
        step_id: &str,
        output: StepOutput,
        output_field: Option<&str>,
    ) -> ResolveResult<()> {
        if let Some(scope) = &self.scope {
            let mut outputs = scope.outputs();
            if outputs.contains_key(step_id) {
                return Err(ResolutionError::AlreadyWritten(step_id.to_string()));
            }
            outputs.insert(
                step_id.to_string(),
                ScopedOutput {
                    output,
                    output_field: output_field.map(str::to_string),
                },
            );
            return Ok(());
        }

        let index = self
            .run
            .index
            .get(step_id)
            .copied()
            .ok_or_else(|| ResolutionError::UnknownStep(step_id.to_string()))?;
        self.run.slots[index]
            .set(output)
            .map_err(|_| ResolutionError::AlreadyWritten(step_id.to_string()))
    }

    /// Output of a step visible from this context.
    pub fn output(&self, step_id: &str) -> Option<StepOutput> {
        let mut scope = self.scope.as_ref();
        while let Some(s) = scope {
            if let Some(found) = s.outputs().get(step_id) {
                return Some(found.output.clone());
            }
            scope = s.parent.as_ref();
        }
        let index = self.run.index.get(step_id)?;
        self.run.slots[*index].get().cloned()
    }

    /// Whether a top-level step has an output (any status).
    pub fn has_output(&self, step_id: &str) -> bool {
        self.run
            .index
            .get(step_id)
            .map(|i| self.run.slots[*i].get().is_some())
            .unwrap_or(false)
    }

    /// Data of every completed top-level step, in arena order.
    pub fn completed_outputs(&self) -> serde_json::Map<String, Value> {
        self.run
            .ids
            .iter()
            .zip(self.run.slots.iter())
            .filter_map(|(id, slot)| {
                slot.get()
                    .filter(|o| o.status == StepStatus::Completed)
                    .map(|o| (id.clone(), o.data.clone()))
            })
            .collect()
    }

    pub fn unwraps(&self) -> Vec<UnwrapRecord> {
        self.run
            .unwraps
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Run `f` on the value bound to `root` and its recorded output field.
    fn with_root<R>(
        &self,
        root: &str,
        f: impl FnOnce(&Value, Option<&str>) -> ResolveResult<R>,
    ) -> ResolveResult<R> {
        let mut scope = self.scope.as_ref();
        while let Some(s) = scope {
            if let Some(value) = s.variables.get(root) {
                return f(value, None);
            }
            if let Some(found) = s.outputs().get(root) {
                return f(&found.output.data, found.output_field.as_deref());
            }
            scope = s.parent.as_ref();
        }

        if root == "input" {
            return f(&self.run.input, None);
        }

        let index = self
            .run
            .index
            .get(root)
            .copied()
            .ok_or_else(|| ResolutionError::UnknownStep(root.to_string()))?;
        let output = self.run.slots[index]
            .get()
            .ok_or_else(|| ResolutionError::NotYetAvailable(root.to_string()))?;
        f(&output.data, self.run.output_fields[index].as_deref())
    }

    fn resolve_reference(&self, reference: &TemplateRef) -> ResolveResult<Value> {
        self.with_root(&reference.root, |value, _| {
            navigate(value, &reference.path)
                .cloned()
                .ok_or_else(|| ResolutionError::MissingField {
                    root: reference.root.clone(),
                    path: reference.path_string(),
                })
        })
    }

    /// Resolve a template expression.
    pub fn resolve(&self, expression: &str) -> ResolveResult<Value> {
        if let Some(inner) = bare_reference(expression) {
            let reference = parse_reference(inner)?;
            return self.resolve_reference(&reference);
        }

        let tokens = find_tokens(expression);
        if tokens.is_empty() {
            return Ok(Value::String(expression.to_string()));
        }
        self.resolve_embedded(expression, &tokens)
    }

    fn resolve_embedded(&self, text: &str, tokens: &[Token]) -> ResolveResult<Value> {
        let values = tokens
            .iter()
            .map(|t| parse_reference(&t.inner).and_then(|r| self.resolve_reference(&r)))
            .collect::<ResolveResult<Vec<Value>>>()?;

        let trimmed = text.trim_start();
        if trimmed.starts_with('[') || trimmed.starts_with('{') || trimmed.starts_with('"') {
            let json_text = substitute_json(text, tokens, &values);
            if let Ok(parsed) = serde_json::from_str::<Value>(&json_text) {
                return Ok(parsed);
            }
        }

        let skeleton = splice(text, tokens, |_| "0".to_string());
        if expression::is_explicit_expression(&skeleton) {
            let expr_text = splice(text, tokens, |i| values[i].to_string());
            if let Ok(result) = expression::eval_restricted(&expr_text) {
                return Ok(result);
            }
        }

        Ok(Value::String(splice(text, tokens, |i| {
            value_to_display(&values[i])
        })))
    }

    /// Resolve every template string inside a JSON value.
    pub fn resolve_value(&self, value: &Value) -> ResolveResult<Value> {
        match value {
            Value::String(s) => self.resolve(s),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_value(v))
                .collect::<ResolveResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve_value(v)?)))
                .collect::<ResolveResult<serde_json::Map<_, _>>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Resolve an expression that must yield a sequence.
    ///
    /// A container with one dominant collection field is unwrapped and the
    /// chosen field is recorded.
    pub fn resolve_collection(&self, expression: &str) -> ResolveResult<Vec<Value>> {
        let hint = match bare_reference(expression).map(parse_reference) {
            Some(Ok(reference)) if reference.path.is_empty() => self
                .with_root(&reference.root, |_, field| Ok(field.map(str::to_string)))
                .unwrap_or(None),
            _ => None,
        };
        let value = self.resolve(expression)?;
        self.unwrap_collection(expression, value, hint.as_deref())
    }

    /// Unwrap an already-resolved value into a sequence.
    pub fn unwrap_collection(
        &self,
        expression: &str,
        value: Value,
        hint: Option<&str>,
    ) -> ResolveResult<Vec<Value>> {
        let map = match value {
            Value::Array(items) => return Ok(items),
            Value::Object(map) => map,
            other => {
                return Err(ResolutionError::NotACollection {
                    expression: expression.to_string(),
                    found: json_type(&other).to_string(),
                })
            }
        };

        let array_fields: Vec<&String> = map
            .iter()
            .filter(|(_, v)| v.is_array())
            .map(|(k, _)| k)
            .collect();

        let chosen = hint
            .filter(|h| map.get(*h).map(Value::is_array).unwrap_or(false))
            .map(str::to_string)
            .or_else(|| match array_fields.as_slice() {
                [single] => Some((*single).clone()),
                _ => {
                    let known: Vec<&&String> = array_fields
                        .iter()
                        .filter(|f| KNOWN_COLLECTION_FIELDS.contains(&f.as_str()))
                        .collect();
                    match known.as_slice() {
                        [single] => Some((**single).clone()),
                        _ => None,
                    }
                }
            });

        match chosen {
            Some(field) => {
                debug!(expression, field = %field, "Auto-unwrapped collection field");
                self.run
                    .unwraps
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(UnwrapRecord {
                        expression: expression.to_string(),
                        field: field.clone(),
                    });
                match map.get(&field) {
                    Some(Value::Array(items)) => Ok(items.clone()),
                    _ => Err(ResolutionError::NotACollection {
                        expression: expression.to_string(),
                        found: "object".to_string(),
                    }),
                }
            }
            None if array_fields.is_empty() => Err(ResolutionError::NotACollection {
                expression: expression.to_string(),
                found: "object".to_string(),
            }),
            None => Err(ResolutionError::AmbiguousCollection {
                expression: expression.to_string(),
                fields: array_fields
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }
}

/// Replace each token with `render(token_index)`.
fn splice(text: &str, tokens: &[Token], render: impl Fn(usize) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (i, token) in tokens.iter().enumerate() {
        out.push_str(&text[cursor..token.span.start]);
        out.push_str(&render(i));
        cursor = token.span.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Typed JSON substitution.
///
/// A token that is the whole content of a JSON string literal (`"{{x}}"`)
/// is replaced, quotes included, by the JSON value. A token inside a longer
/// string literal is spliced in as escaped text. Any other token becomes the
/// value's JSON text.
fn substitute_json(text: &str, tokens: &[Token], values: &[Value]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut string_start = 0usize;
    let mut cursor = 0usize;

    for (token, value) in tokens.iter().zip(values) {
        if cursor > token.span.start {
            continue;
        }
        for (offset, c) in text[cursor..token.span.start].char_indices() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    in_string = false;
                }
            } else if c == '"' {
                in_string = true;
                string_start = cursor + offset + 1;
            }
            out.push(c);
        }

        let whole_literal = in_string
            && string_start == token.span.start
            && text[token.span.end..].starts_with('"');

        if whole_literal {
            out.pop();
            out.push_str(&value.to_string());
            in_string = false;
            cursor = token.span.end + 1;
        } else if in_string {
            let quoted = Value::String(value_to_display(value)).to_string();
            out.push_str(&quoted[1..quoted.len() - 1]);
            cursor = token.span.end;
        } else {
            out.push_str(&value.to_string());
            cursor = token.span.end;
        }
    }
    if cursor < text.len() {
        out.push_str(&text[cursor..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExecutionContext {
        let ctx = ExecutionContext::with_steps(
            vec![
                ("step1".to_string(), None),
                ("step2".to_string(), Some("emails".to_string())),
                ("step3".to_string(), None),
            ],
            json!({"threshold": 5}),
        );
        ctx.record_output(
            "step1",
            StepOutput::completed(json!({"id": "abc", "count": 3, "name": "Ada", "tags": ["x", "y"]})),
            None,
        )
        .unwrap();
        ctx.record_output(
            "step2",
            StepOutput::completed(json!({
                "emails": [{"from": "a@x.io"}, {"from": "b@x.io"}],
                "labels": ["inbox"],
                "total": 2
            })),
            None,
        )
        .unwrap();
        ctx
    }

    #[test]
    fn test_bare_reference_keeps_type() {
        let ctx = context();
        assert_eq!(ctx.resolve("{{step1.count}}").unwrap(), json!(3));
        assert_eq!(ctx.resolve("{{ step1.tags }}").unwrap(), json!(["x", "y"]));
        assert_eq!(ctx.resolve("{{input.threshold}}").unwrap(), json!(5));
    }

    #[test]
    fn test_quoted_reference_in_literal_substitutes_value() {
        let ctx = context();
        assert_eq!(ctx.resolve("[\"{{step1.id}}\"]").unwrap(), json!(["abc"]));
        assert_eq!(
            ctx.resolve(r#"{"tags": "{{step1.tags}}", "n": {{step1.count}}}"#)
                .unwrap(),
            json!({"tags": ["x", "y"], "n": 3})
        );
    }

    #[test]
    fn test_reference_inside_longer_string_literal() {
        let ctx = context();
        assert_eq!(
            ctx.resolve(r#"["id-{{step1.id}}", {{step1.count}}]"#).unwrap(),
            json!(["id-abc", 3])
        );
    }

    #[test]
    fn test_restricted_expression_fallback() {
        let ctx = context();
        assert_eq!(ctx.resolve("{{step1.count}} * 2").unwrap(), json!(6));
        assert_eq!(
            ctx.resolve(r#"{{step1.name}} + "!""#).unwrap(),
            json!("Ada!")
        );
    }

    #[test]
    fn test_date_like_text_is_not_arithmetic() {
        let ctx = context();
        assert_eq!(ctx.resolve("{{step1.count}}-01-05").unwrap(), json!("3-01-05"));
        assert_eq!(ctx.resolve("{{step1.count}}/4").unwrap(), json!("3/4"));
        assert_eq!(ctx.resolve("{{step1.count}} - 1").unwrap(), json!(2));
    }

    #[test]
    fn test_plain_interpolation_fallback() {
        let ctx = context();
        assert_eq!(
            ctx.resolve("Hello {{step1.name}}, you have {{step1.count}} items").unwrap(),
            json!("Hello Ada, you have 3 items")
        );
        assert_eq!(ctx.resolve("no tokens here").unwrap(), json!("no tokens here"));
    }

    #[test]
    fn test_resolution_is_repeatable() {
        let ctx = context();
        for expr in ["{{step1.id}}", "[\"{{step1.id}}\"]", "{{step1.count}} + 1", "x {{step1.name}}"] {
            assert_eq!(ctx.resolve(expr).unwrap(), ctx.resolve(expr).unwrap());
        }
    }

    #[test]
    fn test_resolution_errors() {
        let ctx = context();
        assert!(matches!(
            ctx.resolve("{{step1.missing}}"),
            Err(ResolutionError::MissingField { .. })
        ));
        assert!(matches!(
            ctx.resolve("{{nope.x}}"),
            Err(ResolutionError::UnknownStep(_))
        ));
        assert!(matches!(
            ctx.resolve("{{step3}}"),
            Err(ResolutionError::NotYetAvailable(_))
        ));
        assert!(matches!(
            ctx.resolve("{{ a b }}"),
            Err(ResolutionError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn test_write_once() {
        let ctx = context();
        let err = ctx
            .record_output("step1", StepOutput::completed(json!(1)), None)
            .unwrap_err();
        assert_eq!(err, ResolutionError::AlreadyWritten("step1".into()));
        assert_eq!(ctx.resolve("{{step1.id}}").unwrap(), json!("abc"));
    }

    #[test]
    fn test_collection_unwrap_uses_output_field() {
        let ctx = context();
        let items = ctx.resolve_collection("{{step2}}").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(
            ctx.unwraps(),
            vec![UnwrapRecord {
                expression: "{{step2}}".into(),
                field: "emails".into()
            }]
        );
    }

    #[test]
    fn test_collection_unwrap_ambiguous_and_scalar() {
        let ctx = ExecutionContext::with_steps(vec![("s".to_string(), None)], Value::Null);
        ctx.record_output(
            "s",
            StepOutput::completed(json!({"a": [1], "b": [2], "n": 1})),
            None,
        )
        .unwrap();
        assert!(matches!(
            ctx.resolve_collection("{{s}}"),
            Err(ResolutionError::AmbiguousCollection { .. })
        ));
        assert!(matches!(
            ctx.resolve_collection("{{s.n}}"),
            Err(ResolutionError::NotACollection { .. })
        ));
        assert_eq!(ctx.resolve_collection("{{s.a}}").unwrap(), vec![json!(1)]);
    }

    #[test]
    fn test_branch_scope_overlays_run() {
        let ctx = context();
        let branch = ctx.branch(vec![("group".to_string(), json!({"key": "ana", "items": [1, 2]}))]);

        assert_eq!(branch.resolve("{{group.key}}").unwrap(), json!("ana"));
        assert_eq!(branch.resolve("{{step1.id}}").unwrap(), json!("abc"));

        branch
            .record_output("step4_1", StepOutput::completed(json!({"sent": true})), None)
            .unwrap();
        assert_eq!(branch.resolve("{{step4_1.sent}}").unwrap(), json!(true));
        // Branch-local outputs are invisible to the run scope.
        assert!(ctx.resolve("{{step4_1.sent}}").is_err());
        assert!(branch
            .record_output("step4_1", StepOutput::completed(json!(null)), None)
            .is_err());
    }

    #[test]
    fn test_resolve_value_recurses() {
        let ctx = context();
        let params = json!({
            "to": "{{step2.emails[0].from}}",
            "subject": "Report for {{step1.name}}",
            "count": "{{step1.count}}",
            "fixed": 7
        });
        assert_eq!(
            ctx.resolve_value(&params).unwrap(),
            json!({"to": "a@x.io", "subject": "Report for Ada", "count": 3, "fixed": 7})
        );
    }

    #[test]
    fn test_completed_outputs_in_order() {
        let ctx = context();
        let outputs = ctx.completed_outputs();
        assert_eq!(outputs.keys().collect::<Vec<_>>(), vec!["step1", "step2"]);
    }
}
