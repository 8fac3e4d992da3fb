//! Post-compile rules.
//!
//! Each rule is a free function over a step list so it can be exercised on
//! its own. Rules that repair the graph return the fixes they applied; all
//! others only report.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::catalog::ActionCatalog;
use super::dag;
use super::ids;
use super::schema::TransformSchemas;
use super::types::{visit_steps, ConditionOperator, FilterConfig, StepKind, TransformOp, WorkflowStep};
use crate::context::template::{bare_reference, has_tokens, parse_reference, referenced_roots, PathSegment};
use crate::error::{SchemaError, SchemaErrorCode};
use crate::ir::Combinator;

/// A deterministic rewrite applied to the step graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoFix {
    pub rule: String,
    pub step_id: String,
    pub description: String,
    pub before: Value,
    pub after: Value,
}

pub const RULE_INSERT_TRANSFORM: &str = "insert_transform";
pub const RULE_ADD_DEPENDENCY: &str = "add_dependency";
pub const RULE_RENUMBER: &str = "renumber";

/// Names of a step's nested lists, parallel to `sub_step_lists_mut`.
fn list_names(step: &WorkflowStep) -> &'static [&'static str] {
    match step.kind {
        StepKind::ScatterGather { .. } => &["steps"],
        StepKind::Conditional { .. } => &["then_steps", "else_steps"],
        _ => &[],
    }
}

fn nested_lists(step: &WorkflowStep) -> Vec<&[WorkflowStep]> {
    match &step.kind {
        StepKind::ScatterGather { steps, .. } => vec![steps.as_slice()],
        StepKind::Conditional {
            then_steps,
            else_steps,
            ..
        } => vec![then_steps.as_slice(), else_steps.as_slice()],
        _ => Vec::new(),
    }
}

/// Visit every step list depth first with its path (`/steps/2/then_steps`).
fn visit_lists<'a>(
    list: &'a [WorkflowStep],
    path: &str,
    f: &mut dyn FnMut(&'a [WorkflowStep], &str),
) {
    f(list, path);
    for (i, step) in list.iter().enumerate() {
        for (name, child) in list_names(step).iter().zip(nested_lists(step)) {
            visit_lists(child, &format!("{}/{}/{}", path, i, name), f);
        }
    }
}

fn step_json(step: &WorkflowStep) -> Value {
    serde_json::to_value(step).unwrap_or_default()
}

// =============================================================================
// structure
// =============================================================================

/// Unique non-empty ids, known dependencies, required transform inputs.
pub fn check_structure(steps: &[WorkflowStep]) -> Vec<SchemaError> {
    let mut errors = Vec::new();
    if steps.is_empty() {
        errors.push(SchemaError::new(
            "/steps",
            SchemaErrorCode::MissingField,
            "workflow has no steps",
        ));
        return errors;
    }

    let mut all_ids = HashSet::new();
    let mut duplicates = Vec::new();
    visit_steps(steps, &mut |s| {
        if !s.id.is_empty() && !all_ids.insert(s.id.as_str()) {
            duplicates.push(s.id.clone());
        }
    });
    for id in duplicates {
        errors.push(SchemaError::new(
            "/steps",
            SchemaErrorCode::DuplicateId,
            format!("duplicate step id '{}'", id),
        ));
    }

    let top_ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    visit_lists(steps, "/steps", &mut |list, path| {
        let top_level = path == "/steps";
        for (i, step) in list.iter().enumerate() {
            let at = format!("{}/{}", path, i);
            if step.id.trim().is_empty() {
                errors.push(SchemaError::new(
                    &at,
                    SchemaErrorCode::MissingField,
                    "step id is empty",
                ));
            }
            for dep in &step.dependencies {
                let known = if top_level {
                    top_ids.contains(dep.as_str())
                } else {
                    all_ids.contains(dep.as_str())
                };
                if dep == &step.id {
                    errors.push(SchemaError::new(
                        format!("{}/dependencies", at),
                        SchemaErrorCode::DependencyCycle,
                        format!("step '{}' depends on itself", step.id),
                    ));
                } else if !known {
                    errors.push(SchemaError::new(
                        format!("{}/dependencies", at),
                        SchemaErrorCode::UnknownDependency,
                        format!("step '{}' depends on unknown step '{}'", step.id, dep),
                    ));
                }
            }
            if let StepKind::Transform {
                operation,
                input: None,
                ..
            } = &step.kind
            {
                errors.push(SchemaError::new(
                    format!("{}/input", at),
                    SchemaErrorCode::MissingField,
                    format!("{} transform '{}' has no input", operation.as_str(), step.id),
                ));
            }
            if let StepKind::Approval { approvers, .. } = &step.kind {
                if approvers.is_empty() {
                    errors.push(SchemaError::new(
                        format!("{}/approvers", at),
                        SchemaErrorCode::MissingField,
                        format!("approval step '{}' has no approvers", step.id),
                    ));
                }
            }
        }
    });
    errors
}

// =============================================================================
// ordering
// =============================================================================

/// Insert the transform an action declares it requires, when missing.
///
/// Only applies when the action's parameter is a single reference, so the
/// rewrite is unambiguous; anything else is reported.
pub fn insert_required_transforms(
    steps: &mut Vec<WorkflowStep>,
    catalog: &ActionCatalog,
) -> (Vec<AutoFix>, Vec<SchemaError>) {
    let mut producers: HashMap<String, Option<TransformOp>> = HashMap::new();
    let mut taken: HashSet<String> = HashSet::new();
    visit_steps(steps, &mut |s| {
        let op = match &s.kind {
            StepKind::Transform { operation, .. } => Some(*operation),
            _ => None,
        };
        producers.insert(s.id.clone(), op);
        taken.insert(s.id.clone());
    });

    let mut fixes = Vec::new();
    let mut errors = Vec::new();
    insert_in_list(steps, "/steps", catalog, &producers, &mut taken, &mut fixes, &mut errors);
    (fixes, errors)
}

#[allow(clippy::too_many_arguments)]
fn insert_in_list(
    list: &mut Vec<WorkflowStep>,
    path: &str,
    catalog: &ActionCatalog,
    producers: &HashMap<String, Option<TransformOp>>,
    taken: &mut HashSet<String>,
    fixes: &mut Vec<AutoFix>,
    errors: &mut Vec<SchemaError>,
) {
    let mut i = 0;
    while i < list.len() {
        let names = list_names(&list[i]);
        for (name, child) in names.iter().zip(list[i].sub_step_lists_mut()) {
            let child_path = format!("{}/{}/{}", path, i, name);
            insert_in_list(child, &child_path, catalog, producers, taken, fixes, errors);
        }

        let StepKind::Action {
            plugin,
            action,
            params,
        } = &list[i].kind
        else {
            i += 1;
            continue;
        };
        let Some(required) = catalog.get(plugin, action).and_then(|s| s.requires.clone()) else {
            i += 1;
            continue;
        };
        let Some(value) = params.get(&required.param).filter(|v| !v.is_null()) else {
            i += 1;
            continue;
        };

        let reference = value
            .as_str()
            .and_then(bare_reference)
            .and_then(|inner| parse_reference(inner).ok());
        let Some(reference) = reference else {
            errors.push(SchemaError::new(
                format!("{}/{}/params/{}", path, i, required.param),
                SchemaErrorCode::InvalidValue,
                format!(
                    "'{}' requires a {} transform on '{}', but the parameter is not a single reference",
                    list[i].id,
                    required.operation.as_str(),
                    required.param
                ),
            ));
            i += 1;
            continue;
        };
        if producers.get(&reference.root) == Some(&Some(required.operation)) {
            i += 1;
            continue;
        }

        let consumer_id = list[i].id.clone();
        let mut new_id = format!("{}_{}", consumer_id, required.operation.as_str());
        let mut suffix = 2;
        while taken.contains(&new_id) {
            new_id = format!("{}_{}{}", consumer_id, required.operation.as_str(), suffix);
            suffix += 1;
        }
        taken.insert(new_id.clone());

        let source = value.as_str().unwrap_or_default().to_string();
        let mut inserted = WorkflowStep::new(
            new_id.clone(),
            format!("{} for {}", required.operation.as_str(), list[i].name),
            StepKind::Transform {
                operation: required.operation,
                input: Some(source),
                config: required.config.clone(),
            },
        );
        inserted.injected = true;
        if list.iter().any(|s| s.id == reference.root) {
            inserted.dependencies.push(reference.root.clone());
        }

        let before = step_json(&list[i]);
        let consumer = &mut list[i];
        if let StepKind::Action { params, .. } = &mut consumer.kind {
            if let Some(map) = params.as_object_mut() {
                map.insert(required.param.clone(), json!(format!("{{{{{}}}}}", new_id)));
            }
        }
        consumer.dependencies.push(new_id.clone());
        let after = json!([step_json(&inserted), step_json(consumer)]);

        fixes.push(AutoFix {
            rule: RULE_INSERT_TRANSFORM.to_string(),
            step_id: consumer_id.clone(),
            description: format!(
                "inserted {} transform '{}' before '{}' for parameter '{}'",
                required.operation.as_str(),
                new_id,
                consumer_id,
                required.param
            ),
            before,
            after,
        });
        list.insert(i, inserted);
        i += 2;
    }
}

// =============================================================================
// reference resolvability
// =============================================================================

/// Check every `{{root...}}` reference names something that runs earlier.
///
/// A reference to an earlier step with no dependency path is repaired by
/// adding the edge. References to later steps, to the referencing step
/// itself, or to unknown roots are errors.
pub fn link_references(steps: &mut [WorkflowStep]) -> (Vec<AutoFix>, Vec<SchemaError>) {
    let mut fixes = Vec::new();
    let mut errors = Vec::new();
    let vars = vec!["input".to_string()];
    let escaped = link_list(steps, &vars, "/steps", &mut fixes, &mut errors);
    for (root, from) in escaped {
        errors.push(SchemaError::new(
            "/steps",
            SchemaErrorCode::UnresolvableReference,
            format!("step '{}' references unknown root '{}'", from, root),
        ));
    }
    (fixes, errors)
}

/// Resolve references within one list; returns `(root, from)` pairs that
/// belong to an enclosing list.
fn link_list(
    list: &mut [WorkflowStep],
    vars: &[String],
    path: &str,
    fixes: &mut Vec<AutoFix>,
    errors: &mut Vec<SchemaError>,
) -> Vec<(String, String)> {
    let index: HashMap<String, usize> = list
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.clone(), i))
        .collect();
    let mut deps: Vec<Vec<usize>> = list
        .iter()
        .map(|s| {
            s.dependencies
                .iter()
                .filter_map(|d| index.get(d).copied())
                .collect()
        })
        .collect();
    let mut escaped = Vec::new();

    for i in 0..list.len() {
        let mut refs: Vec<(String, String)> = list[i]
            .template_strings()
            .into_iter()
            .flat_map(referenced_roots)
            .map(|root| (root, list[i].id.clone()))
            .collect();

        let mut child_vars = vars.to_vec();
        if let StepKind::ScatterGather { item_variable, .. } = &list[i].kind {
            child_vars.push(item_variable.clone());
            child_vars.push("index".to_string());
        }
        let names = list_names(&list[i]);
        for (name, child) in names.iter().zip(list[i].sub_step_lists_mut()) {
            let child_path = format!("{}/{}/{}", path, i, name);
            refs.extend(link_list(child, &child_vars, &child_path, fixes, errors));
        }

        let mut seen = HashSet::new();
        for (root, from) in refs {
            if vars.contains(&root) || !seen.insert((root.clone(), from.clone())) {
                continue;
            }
            let Some(&r) = index.get(&root) else {
                escaped.push((root, from));
                continue;
            };
            let at = format!("{}/{}", path, i);
            if r == i {
                errors.push(SchemaError::new(
                    at,
                    SchemaErrorCode::UnresolvableReference,
                    format!("step '{}' references '{}', whose output is not available to it", from, root),
                ));
            } else if dag::depends_on(&deps, i, r) {
                continue;
            } else if r < i && !dag::depends_on(&deps, r, i) {
                let before = json!({"dependencies": list[i].dependencies});
                list[i].dependencies.push(root.clone());
                deps[i].push(r);
                fixes.push(AutoFix {
                    rule: RULE_ADD_DEPENDENCY.to_string(),
                    step_id: list[i].id.clone(),
                    description: format!(
                        "'{}' references '{}'; added the missing dependency edge",
                        from, root
                    ),
                    before,
                    after: json!({"dependencies": list[i].dependencies}),
                });
            } else {
                errors.push(SchemaError::new(
                    at,
                    SchemaErrorCode::UnresolvableReference,
                    format!("step '{}' references '{}', which does not run before it", from, root),
                ));
            }
        }
    }
    escaped
}

// =============================================================================
// type conformance
// =============================================================================

fn is_literal(value: &Value) -> bool {
    !matches!(value, Value::String(s) if has_tokens(s))
}

/// Action params against the catalog, transform configs against their schema.
pub fn check_types(
    steps: &[WorkflowStep],
    catalog: &ActionCatalog,
    schemas: &TransformSchemas,
) -> Vec<SchemaError> {
    let mut errors = Vec::new();
    visit_lists(steps, "/steps", &mut |list, path| {
        for (i, step) in list.iter().enumerate() {
            let at = format!("{}/{}", path, i);
            match &step.kind {
                StepKind::Action {
                    plugin,
                    action,
                    params,
                } => {
                    let Some(spec) = catalog.get(plugin, action) else {
                        continue;
                    };
                    let empty = serde_json::Map::new();
                    let params = match params {
                        Value::Object(map) => map,
                        Value::Null => &empty,
                        other => {
                            errors.push(SchemaError::new(
                                format!("{}/params", at),
                                SchemaErrorCode::TypeMismatch,
                                format!("params of '{}' must be an object, got {}", step.id, other),
                            ));
                            continue;
                        }
                    };
                    for param in &spec.params {
                        let present = params.get(&param.name).filter(|v| !v.is_null());
                        match present {
                            None if param.required => errors.push(SchemaError::new(
                                format!("{}/params/{}", at, param.name),
                                SchemaErrorCode::MissingField,
                                format!(
                                    "{}.{} requires parameter '{}'",
                                    plugin, action, param.name
                                ),
                            )),
                            Some(value) if is_literal(value) && !param.param_type.accepts(value) => {
                                errors.push(SchemaError::new(
                                    format!("{}/params/{}", at, param.name),
                                    SchemaErrorCode::TypeMismatch,
                                    format!(
                                        "parameter '{}' of {}.{} expects {}, got {}",
                                        param.name,
                                        plugin,
                                        action,
                                        param.param_type.as_str(),
                                        crate::context::json_type(value)
                                    ),
                                ))
                            }
                            _ => {}
                        }
                    }
                    if spec.strict {
                        for name in params.keys() {
                            if spec.get_param(name).is_none() {
                                errors.push(SchemaError::new(
                                    format!("{}/params/{}", at, name),
                                    SchemaErrorCode::InvalidValue,
                                    format!("{}.{} has no parameter '{}'", plugin, action, name),
                                ));
                            }
                        }
                    }
                }
                StepKind::Transform {
                    operation, config, ..
                } => {
                    for violation in schemas.validate(*operation, config) {
                        errors.push(SchemaError::new(
                            format!("{}/config", at),
                            SchemaErrorCode::TypeMismatch,
                            format!("{} config of '{}': {}", operation.as_str(), step.id, violation),
                        ));
                    }
                }
                _ => {}
            }
        }
    });
    errors
}

// =============================================================================
// acyclicity
// =============================================================================

/// Every step list must admit a topological order.
pub fn check_acyclic(steps: &[WorkflowStep]) -> Vec<SchemaError> {
    let mut errors = Vec::new();
    visit_lists(steps, "/steps", &mut |list, path| {
        let index: HashMap<&str, usize> = list
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        let deps: Vec<Vec<usize>> = list
            .iter()
            .map(|s| {
                s.dependencies
                    .iter()
                    .filter_map(|d| index.get(d.as_str()).copied())
                    .collect()
            })
            .collect();
        if let Err(cycle) = dag::topological_sort(&deps) {
            let ids: Vec<&str> = cycle.iter().map(|&i| list[i].id.as_str()).collect();
            errors.push(SchemaError::new(
                path,
                SchemaErrorCode::DependencyCycle,
                format!("dependency cycle involving {}", ids.join(", ")),
            ));
        }
    });
    errors
}

// =============================================================================
// scatter input
// =============================================================================

/// Whether a reference into `producer`'s output is statically a scalar.
fn static_scalar(producer: &WorkflowStep, path: &[PathSegment]) -> bool {
    let first = match path.first() {
        Some(PathSegment::Field(name)) => name.as_str(),
        _ => return false,
    };
    match &producer.kind {
        StepKind::Transform {
            operation: TransformOp::Aggregate,
            config,
            ..
        } => {
            let function = config
                .get("function")
                .and_then(Value::as_str)
                .unwrap_or("collect");
            first == "count" || first == "function" || (first == "value" && function != "collect")
        }
        StepKind::Comparison { .. } => first == "result",
        _ => false,
    }
}

/// A scatter's input must not be a scalar literal or a known scalar output.
pub fn check_scatter_inputs(steps: &[WorkflowStep]) -> Vec<SchemaError> {
    let mut by_id: HashMap<&str, &WorkflowStep> = HashMap::new();
    visit_steps(steps, &mut |s| {
        by_id.insert(s.id.as_str(), s);
    });

    let mut errors = Vec::new();
    visit_lists(steps, "/steps", &mut |list, path| {
        for (i, step) in list.iter().enumerate() {
            let StepKind::ScatterGather { input, .. } = &step.kind else {
                continue;
            };
            let at = format!("{}/{}/input", path, i);
            let scalar = if !has_tokens(input) {
                !matches!(serde_json::from_str::<Value>(input), Ok(Value::Array(_)))
            } else {
                bare_reference(input)
                    .and_then(|inner| parse_reference(inner).ok())
                    .and_then(|r| by_id.get(r.root.as_str()).map(|p| static_scalar(p, &r.path)))
                    .unwrap_or(false)
            };
            if scalar {
                errors.push(SchemaError::new(
                    at,
                    SchemaErrorCode::ScalarScatterInput,
                    format!("scatter '{}' input '{}' is a scalar, not a collection", step.id, input),
                ));
            }
        }
    });
    errors
}

// =============================================================================
// filter chains
// =============================================================================

/// The single `(field, value)` of a one-condition equals filter.
fn single_equals(step: &WorkflowStep) -> Option<(String, Value)> {
    let StepKind::Transform {
        operation: TransformOp::Filter,
        config,
        ..
    } = &step.kind
    else {
        return None;
    };
    let config: FilterConfig = serde_json::from_value(config.clone()).ok()?;
    match config.conditions.as_slice() {
        [only] if only.operator == ConditionOperator::Equals => {
            Some((only.field.clone(), only.value.clone()))
        }
        _ => None,
    }
}

/// Warn about equals filters on one field that can never both match.
pub fn filter_chain_warnings(steps: &[WorkflowStep]) -> Vec<String> {
    let mut by_id: HashMap<&str, &WorkflowStep> = HashMap::new();
    visit_steps(steps, &mut |s| {
        by_id.insert(s.id.as_str(), s);
    });

    let mut warnings = Vec::new();
    visit_steps(steps, &mut |step| {
        let StepKind::Transform {
            operation: TransformOp::Filter,
            input,
            config,
        } = &step.kind
        else {
            return;
        };

        if let Ok(filter) = serde_json::from_value::<FilterConfig>(config.clone()) {
            if filter.combine_with == Combinator::And {
                let equals: Vec<_> = filter
                    .conditions
                    .iter()
                    .filter(|c| c.operator == ConditionOperator::Equals)
                    .collect();
                for (a, pos) in equals.iter().zip(1..) {
                    if let Some(b) = equals[pos..]
                        .iter()
                        .find(|b| b.field == a.field && b.value != a.value)
                    {
                        warnings.push(format!(
                            "filter '{}' requires '{}' to equal both {} and {}; no item can match (did you mean OR?)",
                            step.id, a.field, a.value, b.value
                        ));
                    }
                }
            }
        }

        let upstream = input
            .as_deref()
            .and_then(bare_reference)
            .and_then(|inner| parse_reference(inner).ok())
            .and_then(|r| by_id.get(r.root.as_str()).copied());
        if let (Some(upstream), Some((field, value))) = (upstream, single_equals(step)) {
            if let Some((up_field, up_value)) = single_equals(upstream) {
                if up_field == field && up_value != value {
                    warnings.push(format!(
                        "filters '{}' and '{}' chain equals on '{}' ({} then {}); chained filters are AND, this looks like OR intent",
                        upstream.id, step.id, field, up_value, value
                    ));
                }
            }
        }
    });
    warnings
}

// =============================================================================
// renumbering
// =============================================================================

/// Renumber ids after insertions. Returns the fix when anything moved.
pub fn renumber_steps(steps: &mut [WorkflowStep]) -> Option<AutoFix> {
    let before: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
    let renames = ids::renumber(steps);
    if renames.is_empty() {
        return None;
    }
    let mut moved: Vec<String> = renames
        .iter()
        .map(|(old, new)| format!("{} -> {}", old, new))
        .collect();
    moved.sort();
    Some(AutoFix {
        rule: RULE_RENUMBER.to_string(),
        step_id: String::new(),
        description: format!("renumbered {} step ids: {}", renames.len(), moved.join(", ")),
        before: json!(before),
        after: json!(steps.iter().map(|s| s.id.clone()).collect::<Vec<_>>()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ScatterErrorPolicy;

    fn action(id: &str, plugin: &str, action: &str, params: Value) -> WorkflowStep {
        WorkflowStep::new(
            id,
            id,
            StepKind::Action {
                plugin: plugin.into(),
                action: action.into(),
                params,
            },
        )
    }

    fn transform(id: &str, op: TransformOp, input: &str, config: Value) -> WorkflowStep {
        WorkflowStep::new(
            id,
            id,
            StepKind::Transform {
                operation: op,
                input: Some(input.into()),
                config,
            },
        )
    }

    fn scatter(id: &str, input: &str, steps: Vec<WorkflowStep>) -> WorkflowStep {
        WorkflowStep::new(
            id,
            id,
            StepKind::ScatterGather {
                input: input.into(),
                item_variable: "group".into(),
                partition_key: None,
                steps,
                on_error: ScatterErrorPolicy::FailFast,
                max_concurrency: None,
            },
        )
    }

    fn codes(errors: &[SchemaError]) -> Vec<SchemaErrorCode> {
        errors.iter().map(|e| e.code).collect()
    }

    #[test]
    fn test_structure_errors() {
        assert_eq!(codes(&check_structure(&[])), vec![SchemaErrorCode::MissingField]);

        let steps = vec![
            action("step1", "gmail", "search_emails", json!({})),
            action("step1", "gmail", "search_emails", json!({})).with_dependencies(&["step9"]),
        ];
        let found = codes(&check_structure(&steps));
        assert!(found.contains(&SchemaErrorCode::DuplicateId));
        assert!(found.contains(&SchemaErrorCode::UnknownDependency));
    }

    #[test]
    fn test_insert_required_extract() {
        let catalog = ActionCatalog::builtin();
        let mut steps = vec![
            action("step1", "gmail", "search_emails", json!({})),
            action(
                "step2",
                "ai",
                "summarize_documents",
                json!({"documents": "{{step1.emails}}"}),
            )
            .with_dependencies(&["step1"]),
        ];

        let (fixes, errors) = insert_required_transforms(&mut steps, &catalog);
        assert!(errors.is_empty());
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].rule, RULE_INSERT_TRANSFORM);
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1].id, "step2_extract");
        assert!(steps[1].injected);
        assert_eq!(steps[1].dependencies, vec!["step1"]);
        assert_eq!(steps[2].dependencies, vec!["step1", "step2_extract"]);
        assert_eq!(steps[2].template_strings(), vec!["{{step2_extract}}"]);

        // Satisfied now; a second pass changes nothing.
        let (again, _) = insert_required_transforms(&mut steps, &catalog);
        assert!(again.is_empty());
    }

    #[test]
    fn test_insert_refuses_ambiguous_param() {
        let catalog = ActionCatalog::builtin();
        let mut steps = vec![action(
            "step1",
            "ai",
            "summarize_documents",
            json!({"documents": "{{input.a}} and {{input.b}}"}),
        )];
        let (fixes, errors) = insert_required_transforms(&mut steps, &catalog);
        assert!(fixes.is_empty());
        assert_eq!(codes(&errors), vec![SchemaErrorCode::InvalidValue]);
    }

    #[test]
    fn test_missing_dependency_edge_is_added() {
        let mut steps = vec![
            action("step1", "gmail", "search_emails", json!({})),
            transform("step2", TransformOp::Filter, "{{step1.emails}}", json!({})),
        ];
        let (fixes, errors) = link_references(&mut steps);
        assert!(errors.is_empty());
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].after, json!({"dependencies": ["step1"]}));
        assert_eq!(steps[1].dependencies, vec!["step1"]);
    }

    #[test]
    fn test_forward_and_unknown_references_fail() {
        let mut steps = vec![
            transform("step1", TransformOp::Filter, "{{step2}}", json!({})),
            action("step2", "gmail", "search_emails", json!({"q": "{{ghost.x}}"})),
        ];
        let (_, errors) = link_references(&mut steps);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.code == SchemaErrorCode::UnresolvableReference));
    }

    #[test]
    fn test_nested_references_resolve_through_container() {
        let mut steps = vec![
            action("step1", "gmail", "search_emails", json!({})),
            transform("step2", TransformOp::Group, "{{step1.emails}}", json!({"key": "owner"}))
                .with_dependencies(&["step1"]),
            scatter(
                "step3",
                "{{step2.groups}}",
                vec![
                    action("step3_1", "ai", "summarize", json!({"input": "{{group.items}}"})),
                    action(
                        "step3_2",
                        "gmail",
                        "send_email",
                        json!({"to": "{{group.key}}", "body": "{{step3_1}} of {{step1.emails}}"}),
                    ),
                ],
            ),
        ];
        let (fixes, errors) = link_references(&mut steps);
        assert!(errors.is_empty(), "{:?}", errors);
        let patched: Vec<&str> = fixes.iter().map(|f| f.step_id.as_str()).collect();
        assert!(patched.contains(&"step3_2"));
        assert!(patched.contains(&"step3"));
        assert!(steps[2].dependencies.contains(&"step2".to_string()));
        // step1 is reachable through step2, so no direct edge is added.
        assert!(!steps[2].dependencies.contains(&"step1".to_string()));
    }

    #[test]
    fn test_type_conformance() {
        let catalog = ActionCatalog::builtin();
        let schemas = TransformSchemas::new().unwrap();
        let steps = vec![
            action("step1", "gmail", "search_emails", json!({"max_results": "ten"})),
            action("step2", "gmail", "send_email", json!({"to": "{{step1.from}}"})),
            transform("step3", TransformOp::Group, "{{step1}}", json!({})),
            action("step4", "custom", "anything", json!({"x": 1})),
        ];
        let errors = check_types(&steps, &catalog, &schemas);
        let found = codes(&errors);
        assert_eq!(found.len(), 3, "{:?}", errors);
        assert_eq!(found[0], SchemaErrorCode::TypeMismatch);
        assert_eq!(found[1], SchemaErrorCode::MissingField);
        assert!(errors[2].path.ends_with("/2/config"));
    }

    #[test]
    fn test_cycle_detected() {
        let steps = vec![
            action("step1", "p", "a", json!({})).with_dependencies(&["step2"]),
            action("step2", "p", "a", json!({})).with_dependencies(&["step1"]),
        ];
        assert_eq!(codes(&check_acyclic(&steps)), vec![SchemaErrorCode::DependencyCycle]);
    }

    #[test]
    fn test_scalar_scatter_inputs() {
        let steps = vec![
            transform("step1", TransformOp::Aggregate, "{{input}}", json!({"function": "count"})),
            scatter("step2", "{{step1.value}}", vec![]),
            scatter("step3", "42", vec![]),
            scatter("step4", "[1, 2]", vec![]),
            scatter("step5", "{{input.items}}", vec![]),
        ];
        let errors = check_scatter_inputs(&steps);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].path.starts_with("/steps/1"));
        assert!(errors[1].path.starts_with("/steps/2"));
    }

    #[test]
    fn test_chained_equals_filters_warn() {
        let eq = |value: &str| {
            json!({"conditions": [{"field": "status", "operator": "equals", "value": value}]})
        };
        let steps = vec![
            transform("step1", TransformOp::Filter, "{{input.items}}", eq("open")),
            transform("step2", TransformOp::Filter, "{{step1}}", eq("closed")),
            transform(
                "step3",
                TransformOp::Filter,
                "{{input.items}}",
                json!({"conditions": [
                    {"field": "status", "operator": "equals", "value": "open"},
                    {"field": "status", "operator": "equals", "value": "closed"}
                ]}),
            ),
        ];
        let warnings = filter_chain_warnings(&steps);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("step1") && warnings[0].contains("step2"));
        assert!(warnings[1].contains("step3"));
    }

    #[test]
    fn test_renumber_fix() {
        let mut steps = vec![
            action("step1", "p", "a", json!({})),
            action("step2_extract", "p", "a", json!({"x": "{{step1}}"})),
            action("step2", "p", "a", json!({"x": "{{step2_extract}}"})),
        ];
        let fix = renumber_steps(&mut steps).unwrap();
        assert_eq!(fix.after, json!(["step1", "step2", "step3"]));
        assert_eq!(steps[2].template_strings(), vec!["{{step2}}"]);
        assert!(renumber_steps(&mut steps).is_none());
    }
}
