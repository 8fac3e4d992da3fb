//! Deterministic step id assignment.
//!
//! Top-level steps are `step1..stepN` in list order; nested steps extend
//! their parent's id (`step3_1`, `step3_2`, `step3_1_1`). Renaming rewrites
//! ids, dependency lists and every template reference in one pass.

use std::collections::HashMap;

use super::types::WorkflowStep;
use crate::context::template::rename_roots;

/// Renumber a step list in place. Returns the old-to-new id map.
pub fn renumber(steps: &mut [WorkflowStep]) -> HashMap<String, String> {
    let mut renames = HashMap::new();
    for (i, step) in steps.iter_mut().enumerate() {
        assign(step, format!("step{}", i + 1), &mut renames);
    }
    if !renames.is_empty() {
        apply_renames(steps, &renames);
    }
    renames
}

fn assign(step: &mut WorkflowStep, id: String, renames: &mut HashMap<String, String>) {
    let mut child = 0;
    for list in step.sub_step_lists_mut() {
        for sub in list.iter_mut() {
            child += 1;
            assign(sub, format!("{}_{}", id, child), renames);
        }
    }
    if step.id != id {
        renames.insert(step.id.clone(), id.clone());
    }
    step.id = id;
}

/// Apply an id map to dependencies and templates of every step.
pub fn apply_renames(steps: &mut [WorkflowStep], renames: &HashMap<String, String>) {
    for step in steps.iter_mut() {
        for dep in step.dependencies.iter_mut() {
            if let Some(new) = renames.get(dep.as_str()) {
                *dep = new.clone();
            }
        }
        step.rewrite_templates(&mut |text| rename_roots(text, renames));
        for list in step.sub_step_lists_mut() {
            apply_renames(list, renames);
        }
    }
}

/// Whether `id` follows the `stepN[_M...]` shape.
pub fn is_canonical_id(id: &str) -> bool {
    id.strip_prefix("step")
        .map(|rest| {
            !rest.is_empty()
                && rest
                    .split('_')
                    .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ScatterErrorPolicy, StepKind, TransformOp};
    use serde_json::json;

    fn action(id: &str, params: serde_json::Value) -> WorkflowStep {
        WorkflowStep::new(
            id,
            id,
            StepKind::Action {
                plugin: "p".into(),
                action: "a".into(),
                params,
            },
        )
    }

    #[test]
    fn test_renumber_rewrites_references() {
        let mut steps = vec![
            action("fetch", json!({})),
            WorkflowStep::new(
                "filter",
                "filter",
                StepKind::Transform {
                    operation: TransformOp::Filter,
                    input: Some("{{fetch.items}}".into()),
                    config: json!({"conditions": []}),
                },
            )
            .with_dependencies(&["fetch"]),
            WorkflowStep::new(
                "each",
                "each",
                StepKind::ScatterGather {
                    input: "{{filter}}".into(),
                    item_variable: "item".into(),
                    partition_key: None,
                    steps: vec![action("send", json!({"to": "{{item.from}} / {{ filter.len }}"}))],
                    on_error: ScatterErrorPolicy::FailFast,
                    max_concurrency: None,
                },
            )
            .with_dependencies(&["filter"]),
        ];

        let renames = renumber(&mut steps);
        assert_eq!(renames["fetch"], "step1");
        assert_eq!(steps[1].id, "step2");
        assert_eq!(steps[1].dependencies, vec!["step1"]);
        assert_eq!(steps[1].template_strings(), vec!["{{step1.items}}"]);
        assert_eq!(steps[2].template_strings(), vec!["{{step2}}"]);

        let nested = steps[2].sub_steps()[0];
        assert_eq!(nested.id, "step3_1");
        assert_eq!(nested.template_strings(), vec!["{{item.from}} / {{ step2.len }}"]);
    }

    #[test]
    fn test_renumber_is_stable_and_handles_shifts() {
        let mut steps = vec![
            action("step1", json!({})),
            action("step9", json!({"x": "{{step2}}"})),
            action("step2", json!({"x": "{{step1}}"})),
        ];
        renumber(&mut steps);
        assert_eq!(steps[1].template_strings(), vec!["{{step3}}"]);
        assert_eq!(steps[2].template_strings(), vec!["{{step1}}"]);

        let snapshot = steps.clone();
        assert!(renumber(&mut steps).is_empty());
        assert_eq!(steps, snapshot);
    }

    #[test]
    fn test_canonical_ids() {
        assert!(is_canonical_id("step1"));
        assert!(is_canonical_id("step12_3_1"));
        assert!(!is_canonical_id("step"));
        assert!(!is_canonical_id("step1_"));
        assert!(!is_canonical_id("fetch"));
    }
}
