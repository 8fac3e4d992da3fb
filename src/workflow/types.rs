//! Compiled step graph type definitions.
//!
//! A compiled workflow is a flat list of top-level steps plus nested step
//! templates inside `scatter_gather` and `conditional` steps. Step kinds are
//! a closed union; every consumer matches them exhaustively.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::approval::{ApprovalType, TimeoutAction};
use crate::error::{Error, Result};
use crate::ir::Combinator;

/// A compiled, executable workflow.
///
/// # Example JSON
///
/// ```json
/// {
///   "goal": "Notify each sales person about angry customer emails",
///   "steps": [
///     {"id": "step1", "name": "Fetch gmail data", "dependencies": [], "output_field": "emails",
///      "type": "action", "plugin": "gmail", "action": "search_emails", "params": {}},
///     {"id": "step2", "name": "Filter items", "dependencies": ["step1"],
///      "type": "transform", "operation": "filter", "input": "{{step1.emails}}",
///      "config": {"conditions": [{"field": "body", "operator": "contains", "value": "angry"}], "combine_with": "and"}}
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WorkflowDocument")]
pub struct CompiledWorkflow {
    pub goal: String,
    pub steps: Vec<WorkflowStep>,

    /// Top-level step id to arena index, built once.
    #[serde(skip)]
    index: HashMap<String, usize>,
}

#[derive(Deserialize)]
struct WorkflowDocument {
    #[serde(default)]
    goal: String,
    steps: Vec<WorkflowStep>,
}

impl From<WorkflowDocument> for CompiledWorkflow {
    fn from(doc: WorkflowDocument) -> Self {
        Self::new(doc.goal, doc.steps)
    }
}

impl CompiledWorkflow {
    pub fn new(goal: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        let index = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        Self {
            goal: goal.into(),
            steps,
            index,
        }
    }

    /// Arena index of a top-level step.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get_step(&self, id: &str) -> Option<&WorkflowStep> {
        self.index_of(id).map(|i| &self.steps[i])
    }

    /// Dependencies of every top-level step as arena indices.
    pub fn dependency_indices(&self) -> Result<Vec<Vec<usize>>> {
        self.steps
            .iter()
            .map(|step| {
                step.dependencies
                    .iter()
                    .map(|dep| {
                        self.index_of(dep).ok_or_else(|| {
                            Error::Compilation(format!(
                                "step '{}' depends on unknown step '{}'",
                                step.id, dep
                            ))
                        })
                    })
                    .collect()
            })
            .collect()
    }

    /// Top-level steps in a valid execution order.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let deps = self.dependency_indices()?;
        super::dag::topological_sort(&deps).map_err(|cycle| {
            Error::DependencyCycle(cycle.into_iter().map(|i| self.steps[i].id.clone()).collect())
        })
    }

    /// Every step including nested templates, depth first.
    pub fn all_steps(&self) -> Vec<&WorkflowStep> {
        let mut out = Vec::new();
        visit_steps(&self.steps, &mut |s| out.push(s));
        out
    }

    pub fn count_by_type(&self, step_type: &str) -> usize {
        self.all_steps()
            .iter()
            .filter(|s| s.step_type() == step_type)
            .count()
    }
}

/// Visit steps and their nested templates, depth first.
pub fn visit_steps<'a>(steps: &'a [WorkflowStep], f: &mut dyn FnMut(&'a WorkflowStep)) {
    for step in steps {
        f(step);
        match &step.kind {
            StepKind::ScatterGather { steps, .. } => visit_steps(steps, f),
            StepKind::Conditional {
                then_steps,
                else_steps,
                ..
            } => {
                visit_steps(then_steps, f);
                visit_steps(else_steps, f);
            }
            _ => {}
        }
    }
}

/// One step in the compiled graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique id (`step1`, `step2`, nested `step3_1`)
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Steps that must complete first
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Dominant collection field of this step's output, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_field: Option<String>,

    /// Added by the compiler or parser rather than derived from intent
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub injected: bool,

    #[serde(flatten)]
    pub kind: StepKind,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            dependencies: Vec::new(),
            output_field: None,
            injected: false,
            kind,
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_output_field(mut self, field: impl Into<String>) -> Self {
        self.output_field = Some(field.into());
        self
    }

    pub fn step_type(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Nested step templates (scatter body, conditional branches).
    pub fn sub_steps(&self) -> Vec<&WorkflowStep> {
        match &self.kind {
            StepKind::ScatterGather { steps, .. } => steps.iter().collect(),
            StepKind::Conditional {
                then_steps,
                else_steps,
                ..
            } => then_steps.iter().chain(else_steps.iter()).collect(),
            StepKind::Action { .. }
            | StepKind::Transform { .. }
            | StepKind::Enrichment { .. }
            | StepKind::Validation { .. }
            | StepKind::Comparison { .. }
            | StepKind::Approval { .. } => Vec::new(),
        }
    }

    /// Leaf steps do their own work; container steps only schedule others.
    pub fn is_leaf(&self) -> bool {
        !matches!(
            self.kind,
            StepKind::ScatterGather { .. } | StepKind::Conditional { .. }
        )
    }

    /// Every string in this step (not its children) that may hold templates.
    pub fn template_strings(&self) -> Vec<&str> {
        let mut out = Vec::new();
        match &self.kind {
            StepKind::Action { params, .. } => collect_strings(params, &mut out),
            StepKind::Transform { input, config, .. } => {
                if let Some(input) = input {
                    out.push(input.as_str());
                }
                collect_strings(config, &mut out);
            }
            StepKind::Conditional { conditions, .. } => {
                for c in conditions {
                    collect_strings(&c.left, &mut out);
                    collect_strings(&c.right, &mut out);
                }
            }
            StepKind::ScatterGather { input, .. } => out.push(input.as_str()),
            StepKind::Enrichment { sources, .. } => {
                out.extend(sources.iter().map(|s| s.as_str()));
            }
            StepKind::Validation { input, .. } => out.push(input.as_str()),
            StepKind::Comparison { left, right, .. } => {
                collect_strings(left, &mut out);
                collect_strings(right, &mut out);
            }
            StepKind::Approval { message, .. } => {
                if let Some(message) = message {
                    out.push(message.as_str());
                }
            }
        }
        out
    }
}

impl WorkflowStep {
    /// Rewrite every template-bearing string of this step (not its children).
    pub fn rewrite_templates(&mut self, f: &mut dyn FnMut(&str) -> String) {
        match &mut self.kind {
            StepKind::Action { params, .. } => rewrite_strings(params, f),
            StepKind::Transform { input, config, .. } => {
                if let Some(input) = input {
                    *input = f(input);
                }
                rewrite_strings(config, f);
            }
            StepKind::Conditional { conditions, .. } => {
                for c in conditions {
                    rewrite_strings(&mut c.left, f);
                    rewrite_strings(&mut c.right, f);
                }
            }
            StepKind::ScatterGather { input, .. } => *input = f(input),
            StepKind::Enrichment { sources, .. } => {
                for source in sources.iter_mut() {
                    *source = f(source);
                }
            }
            StepKind::Validation { input, .. } => *input = f(input),
            StepKind::Comparison { left, right, .. } => {
                rewrite_strings(left, f);
                rewrite_strings(right, f);
            }
            StepKind::Approval { message, .. } => {
                if let Some(message) = message {
                    *message = f(message);
                }
            }
        }
    }

    /// Mutable nested step lists.
    pub fn sub_step_lists_mut(&mut self) -> Vec<&mut Vec<WorkflowStep>> {
        match &mut self.kind {
            StepKind::ScatterGather { steps, .. } => vec![steps],
            StepKind::Conditional {
                then_steps,
                else_steps,
                ..
            } => vec![then_steps, else_steps],
            _ => Vec::new(),
        }
    }
}

fn rewrite_strings(value: &mut Value, f: &mut dyn FnMut(&str) -> String) {
    match value {
        Value::String(s) => *s = f(s),
        Value::Array(items) => items.iter_mut().for_each(|v| rewrite_strings(v, f)),
        Value::Object(map) => map.values_mut().for_each(|v| rewrite_strings(v, f)),
        _ => {}
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s.as_str()),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Variant-specific step data, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke an external plugin action
    Action {
        plugin: String,
        action: String,
        #[serde(default)]
        params: Value,
    },

    /// Pure data transformation
    Transform {
        operation: TransformOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<String>,
        #[serde(default)]
        config: Value,
    },

    /// Pick one of two nested step lists
    Conditional {
        conditions: Vec<Predicate>,
        #[serde(default)]
        combine_with: Combinator,
        #[serde(default)]
        then_steps: Vec<WorkflowStep>,
        #[serde(default)]
        else_steps: Vec<WorkflowStep>,
    },

    /// Run the nested steps once per element of `input`
    ScatterGather {
        input: String,
        #[serde(default = "default_item_variable")]
        item_variable: String,
        /// Grouping key the input was partitioned on, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partition_key: Option<String>,
        steps: Vec<WorkflowStep>,
        #[serde(default)]
        on_error: ScatterErrorPolicy,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<usize>,
    },

    /// Combine several resolved sources
    Enrichment {
        sources: Vec<String>,
        #[serde(default)]
        strategy: EnrichmentStrategy,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        join_key: Option<String>,
    },

    /// Check data against a schema and/or custom rules
    Validation {
        input: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
        #[serde(default)]
        rules: Vec<ValidationRule>,
        #[serde(default)]
        on_validation_fail: ValidationFailPolicy,
    },

    Comparison {
        left: Value,
        right: Value,
        operation: ComparisonOp,
    },

    /// Suspend until a human decision
    Approval {
        approvers: Vec<String>,
        #[serde(default)]
        approval_type: ApprovalType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
        #[serde(default)]
        timeout_action: TimeoutAction,
        #[serde(default)]
        escalation_targets: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

fn default_item_variable() -> String {
    "item".to_string()
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Action { .. } => "action",
            StepKind::Transform { .. } => "transform",
            StepKind::Conditional { .. } => "conditional",
            StepKind::ScatterGather { .. } => "scatter_gather",
            StepKind::Enrichment { .. } => "enrichment",
            StepKind::Validation { .. } => "validation",
            StepKind::Comparison { .. } => "comparison",
            StepKind::Approval { .. } => "approval",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformOp {
    Filter,
    Map,
    Group,
    Aggregate,
    Deduplicate,
    Reduce,
    Join,
    Pivot,
    Split,
    Expand,
    Flatten,
    Sort,
    Extract,
}

impl TransformOp {
    pub const ALL: [TransformOp; 13] = [
        TransformOp::Filter,
        TransformOp::Map,
        TransformOp::Group,
        TransformOp::Aggregate,
        TransformOp::Deduplicate,
        TransformOp::Reduce,
        TransformOp::Join,
        TransformOp::Pivot,
        TransformOp::Split,
        TransformOp::Expand,
        TransformOp::Flatten,
        TransformOp::Sort,
        TransformOp::Extract,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransformOp::Filter => "filter",
            TransformOp::Map => "map",
            TransformOp::Group => "group",
            TransformOp::Aggregate => "aggregate",
            TransformOp::Deduplicate => "deduplicate",
            TransformOp::Reduce => "reduce",
            TransformOp::Join => "join",
            TransformOp::Pivot => "pivot",
            TransformOp::Split => "split",
            TransformOp::Expand => "expand",
            TransformOp::Flatten => "flatten",
            TransformOp::Sort => "sort",
            TransformOp::Extract => "extract",
        }
    }
}

/// Comparison operators shared by filters, conditionals and validation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Exists,
    NotExists,
    Matches,
}

impl From<crate::ir::FilterOperator> for ConditionOperator {
    fn from(op: crate::ir::FilterOperator) -> Self {
        use crate::ir::FilterOperator as F;
        match op {
            F::Equals => ConditionOperator::Equals,
            F::NotEquals => ConditionOperator::NotEquals,
            F::Contains => ConditionOperator::Contains,
            F::NotContains => ConditionOperator::NotContains,
            F::Gt => ConditionOperator::Gt,
            F::Gte => ConditionOperator::Gte,
            F::Lt => ConditionOperator::Lt,
            F::Lte => ConditionOperator::Lte,
            F::In => ConditionOperator::In,
            F::Exists => ConditionOperator::Exists,
            F::Matches => ConditionOperator::Matches,
        }
    }
}

/// A conditional-step predicate over resolved operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub left: Value,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub right: Value,
}

/// One condition inside a filter transform's config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

/// Config of a `filter` transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub conditions: Vec<FilterRule>,
    #[serde(default)]
    pub combine_with: Combinator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScatterErrorPolicy {
    #[default]
    FailFast,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStrategy {
    #[default]
    Merge,
    DeepMerge,
    Join,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationFailPolicy {
    /// Fail the step
    #[default]
    Throw,
    /// Pass the input through; the report goes to metadata
    Continue,
    /// Succeed with a null output
    Skip,
}

/// Custom validation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    /// Dot path into the validated input
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Equals,
    DeepEquals,
    Diff,
    Contains,
    Subset,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> CompiledWorkflow {
        serde_json::from_value(json!({
            "goal": "test",
            "steps": [
                {"id": "step1", "name": "fetch", "type": "action", "plugin": "gmail", "action": "search", "params": {}},
                {"id": "step2", "name": "each", "dependencies": ["step1"], "type": "scatter_gather",
                 "input": "{{step1.emails}}",
                 "steps": [
                     {"id": "step2_1", "name": "send", "type": "action", "plugin": "gmail", "action": "send",
                      "params": {"to": "{{item.from}}"}}
                 ]},
                {"id": "step3", "name": "ok?", "dependencies": ["step2"], "type": "approval", "approvers": ["ana"]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_deserialize_builds_index() {
        let wf = sample();
        assert_eq!(wf.index_of("step2"), Some(1));
        assert_eq!(wf.index_of("step2_1"), None);
        assert_eq!(wf.dependency_indices().unwrap(), vec![vec![], vec![0], vec![1]]);
        assert_eq!(wf.topological_order().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_defaults_applied() {
        let wf = sample();
        match &wf.steps[1].kind {
            StepKind::ScatterGather {
                item_variable,
                on_error,
                ..
            } => {
                assert_eq!(item_variable, "item");
                assert_eq!(*on_error, ScatterErrorPolicy::FailFast);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        match &wf.steps[2].kind {
            StepKind::Approval {
                approval_type,
                timeout_action,
                ..
            } => {
                assert_eq!(*approval_type, ApprovalType::Any);
                assert_eq!(*timeout_action, TimeoutAction::Fail);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_keeps_type_tag() {
        let wf = sample();
        let json = serde_json::to_value(&wf).unwrap();
        assert_eq!(json["steps"][1]["type"], "scatter_gather");
        assert!(json["steps"][0].get("injected").is_none());
        let back: CompiledWorkflow = serde_json::from_value(json).unwrap();
        assert_eq!(back, wf);
    }

    #[test]
    fn test_all_steps_includes_nested() {
        let wf = sample();
        let ids: Vec<&str> = wf.all_steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["step1", "step2", "step2_1", "step3"]);
        assert_eq!(wf.count_by_type("action"), 2);
    }

    #[test]
    fn test_template_strings() {
        let wf = sample();
        let nested = wf.steps[1].sub_steps()[0];
        assert_eq!(nested.template_strings(), vec!["{{item.from}}"]);
        assert_eq!(wf.steps[1].template_strings(), vec!["{{step1.emails}}"]);
    }

    #[test]
    fn test_unknown_dependency() {
        let wf = CompiledWorkflow::new(
            "x",
            vec![WorkflowStep::new(
                "step1",
                "a",
                StepKind::Action {
                    plugin: "p".into(),
                    action: "a".into(),
                    params: json!({}),
                },
            )
            .with_dependencies(&["step9"])],
        );
        assert!(wf.dependency_indices().is_err());
    }
}
