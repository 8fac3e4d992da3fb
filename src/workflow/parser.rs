//! Post-compile workflow parser.
//!
//! Takes a compiled step list and either returns it (possibly repaired) or
//! reports every violation it found. Rules run in a fixed order:
//!
//! 1. Structure: unique ids, known dependencies. Failures stop here.
//! 2. Ordering: insert transforms that catalog actions require.
//! 3. References: every template root runs earlier; missing edges are added.
//! 4. Types: action params and transform configs.
//! 5. Acyclicity.
//! 6. Scatter inputs must be collections.
//! 7. Equals filters that cannot all match produce warnings.
//!
//! Ids are renumbered after any insertion. Every repair is logged, counted
//! and returned in [`ParseReport::auto_fixed`].

use serde::Serialize;
use tracing::{info, instrument, warn};

use super::catalog::ActionCatalog;
use super::rules::{self, AutoFix};
use super::schema::TransformSchemas;
use super::types::{CompiledWorkflow, WorkflowStep};
use crate::error::{Error, Result, SchemaError, SchemaErrorCode};
use crate::events::{EventSink, RunEvent};
use crate::metrics;

/// Outcome of [`WorkflowParser::validate`].
#[derive(Debug, Clone, Serialize)]
pub struct ParseReport {
    pub valid: bool,
    pub errors: Vec<SchemaError>,
    pub warnings: Vec<String>,
    pub auto_fixed: Vec<AutoFix>,
    /// The step list after repairs
    pub steps: Vec<WorkflowStep>,
}

impl ParseReport {
    /// The repaired steps, or every error as one schema failure.
    pub fn into_result(self) -> Result<Vec<WorkflowStep>> {
        if self.valid {
            Ok(self.steps)
        } else {
            Err(Error::SchemaValidation(self.errors))
        }
    }
}

pub struct WorkflowParser<'a> {
    catalog: &'a ActionCatalog,
    schemas: Option<TransformSchemas>,
    events: Option<EventSink>,
}

impl<'a> WorkflowParser<'a> {
    pub fn new(catalog: &'a ActionCatalog) -> Self {
        let schemas = match TransformSchemas::new() {
            Ok(schemas) => Some(schemas),
            Err(e) => {
                warn!("Transform config schemas unavailable: {}", e);
                None
            }
        };
        Self {
            catalog,
            schemas,
            events: None,
        }
    }

    /// Publish every applied fix as an [`RunEvent::AutoFixApplied`].
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    #[instrument(name = "workflow.parse", skip(self, steps), fields(steps = steps.len()))]
    pub fn validate(&self, steps: Vec<WorkflowStep>) -> ParseReport {
        let mut steps = steps;
        let mut errors = rules::check_structure(&steps);
        if !errors.is_empty() {
            return self.finish(steps, errors, Vec::new(), Vec::new());
        }

        let (mut fixes, ordering_errors) =
            rules::insert_required_transforms(&mut steps, self.catalog);
        let inserted = !fixes.is_empty();
        errors.extend(ordering_errors);

        let (linked, reference_errors) = rules::link_references(&mut steps);
        fixes.extend(linked);
        errors.extend(reference_errors);

        match &self.schemas {
            Some(schemas) => errors.extend(rules::check_types(&steps, self.catalog, schemas)),
            None => errors.push(SchemaError::new(
                "/steps",
                SchemaErrorCode::Schema,
                "transform config schemas failed to compile",
            )),
        }
        errors.extend(rules::check_acyclic(&steps));
        errors.extend(rules::check_scatter_inputs(&steps));
        let warnings = rules::filter_chain_warnings(&steps);

        if inserted && errors.is_empty() {
            fixes.extend(rules::renumber_steps(&mut steps));
        }

        self.finish(steps, errors, warnings, fixes)
    }

    /// Validate a whole workflow, keeping its goal.
    pub fn validate_workflow(&self, workflow: CompiledWorkflow) -> Result<(CompiledWorkflow, ParseReport)> {
        let goal = workflow.goal.clone();
        let report = self.validate(workflow.steps);
        let steps = report.clone().into_result()?;
        Ok((CompiledWorkflow::new(goal, steps), report))
    }

    fn finish(
        &self,
        steps: Vec<WorkflowStep>,
        errors: Vec<SchemaError>,
        warnings: Vec<String>,
        auto_fixed: Vec<AutoFix>,
    ) -> ParseReport {
        for fix in &auto_fixed {
            info!(
                rule = %fix.rule,
                step_id = %fix.step_id,
                before = %fix.before,
                after = %fix.after,
                "Auto-fix applied: {}",
                fix.description
            );
            metrics::record_autofix(&fix.rule);
            if let Some(events) = &self.events {
                events.emit(RunEvent::AutoFixApplied {
                    rule: fix.rule.clone(),
                    description: fix.description.clone(),
                    before: fix.before.clone(),
                    after: fix.after.clone(),
                });
            }
        }
        for warning in &warnings {
            warn!("{}", warning);
        }
        if !errors.is_empty() {
            warn!(count = errors.len(), "Workflow failed post-compile validation");
        }

        ParseReport {
            valid: errors.is_empty(),
            errors,
            warnings,
            auto_fixed,
            steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{StepKind, TransformOp};
    use serde_json::json;

    fn action(id: &str, plugin: &str, action: &str, params: serde_json::Value) -> WorkflowStep {
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

    #[test]
    fn test_valid_workflow_passes_untouched() {
        let catalog = ActionCatalog::builtin();
        let steps = vec![
            action("step1", "gmail", "search_emails", json!({"query": "is:unread"})),
            action(
                "step2",
                "slack",
                "post_message",
                json!({"channel": "#ops", "text": "{{step1.emails}}"}),
            )
            .with_dependencies(&["step1"]),
        ];
        let report = WorkflowParser::new(&catalog).validate(steps.clone());
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.auto_fixed.is_empty());
        assert_eq!(report.steps, steps);
    }

    #[test]
    fn test_missing_extract_is_inserted_and_renumbered() {
        let catalog = ActionCatalog::builtin();
        let events = EventSink::new();
        let mut rx = events.subscribe();
        let steps = vec![
            action("step1", "gmail", "search_emails", json!({})),
            action(
                "step2",
                "ai",
                "summarize_documents",
                json!({"documents": "{{step1.emails}}"}),
            ),
        ];

        let report = WorkflowParser::new(&catalog)
            .with_events(events)
            .validate(steps);
        assert!(report.valid, "{:?}", report.errors);

        let ids: Vec<&str> = report.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["step1", "step2", "step3"]);
        assert!(matches!(
            report.steps[1].kind,
            StepKind::Transform { operation: TransformOp::Extract, .. }
        ));
        assert_eq!(report.steps[2].dependencies, vec!["step2"]);
        assert_eq!(report.steps[2].template_strings(), vec!["{{step2}}"]);

        let rules: Vec<&str> = report.auto_fixed.iter().map(|f| f.rule.as_str()).collect();
        assert_eq!(rules, vec!["insert_transform", "renumber"]);
        assert!(matches!(rx.try_recv(), Ok(RunEvent::AutoFixApplied { .. })));
    }

    #[test]
    fn test_structure_failure_stops_early() {
        let catalog = ActionCatalog::builtin();
        let steps = vec![
            action("step1", "p", "a", json!({})).with_dependencies(&["ghost"]),
            WorkflowStep::new(
                "step2",
                "bad",
                StepKind::ScatterGather {
                    input: "7".into(),
                    item_variable: "item".into(),
                    partition_key: None,
                    steps: vec![],
                    on_error: Default::default(),
                    max_concurrency: None,
                },
            ),
        ];
        let report = WorkflowParser::new(&catalog).validate(steps);
        assert!(!report.valid);
        // The scalar scatter is not reported because structure failed first.
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].code, SchemaErrorCode::UnknownDependency);
    }

    #[test]
    fn test_all_violations_reported_together() {
        let catalog = ActionCatalog::builtin();
        let steps = vec![
            action("step1", "gmail", "send_email", json!({"to": 5, "body": "x"})),
            action("step2", "p", "a", json!({"x": "{{step3}}"})),
            action("step3", "p", "a", json!({})),
        ];
        let report = WorkflowParser::new(&catalog).validate(steps);
        assert!(!report.valid);
        let codes: Vec<SchemaErrorCode> = report.errors.iter().map(|e| e.code).collect();
        assert!(codes.contains(&SchemaErrorCode::UnresolvableReference));
        // `to` accepts any type.
        assert!(!codes.contains(&SchemaErrorCode::TypeMismatch));

        let err = report.into_result().unwrap_err();
        assert_eq!(err.code(), "SCHEMA_VALIDATION_ERROR");
    }

    #[test]
    fn test_validate_workflow_keeps_goal() {
        let catalog = ActionCatalog::builtin();
        let workflow = CompiledWorkflow::new(
            "ping",
            vec![action("step1", "slack", "post_message", json!({"channel": "#a", "text": "hi"}))],
        );
        let (checked, report) = WorkflowParser::new(&catalog)
            .validate_workflow(workflow)
            .unwrap();
        assert!(report.warnings.is_empty());
        assert_eq!(checked.goal, "ping");
        assert_eq!(checked.index_of("step1"), Some(0));
    }
}
