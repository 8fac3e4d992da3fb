//! Declarative IR to step graph compiler.
//!
//! The compiled graph always has the same skeleton:
//!
//! ```text
//! fetch (one per source) -> [merge] -> [filter] -> [dedupe...] -> [ai...] -> delivery tail
//! ```
//!
//! The delivery tail depends on the detected pattern. Per-group delivery
//! groups on the key and scatters over the groups; its AI steps move into
//! the scatter template so they run once per group. Summary delivery sends
//! the last AI output, or an aggregate when there is none. Raw delivery
//! sends the last collection as is.

mod builder;
mod injection;
mod patterns;

pub use injection::{normalize_type, DEDUPE_ALIASES};
pub use patterns::{compile_filter, detect_pattern, DeliveryPattern};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::ir::{validate_ir_strict, AiProcessing, DeclarativeIr, ValidIr};
use crate::metrics;
use crate::workflow::{
    ids, ActionCatalog, AutoFix, CompiledWorkflow, EnrichmentStrategy, ScatterErrorPolicy,
    StepKind, TransformOp, WorkflowParser, WorkflowStep,
};

use builder::{GraphBuilder, Producer};
use injection::DedupeTracker;

/// Item variable bound inside per-group scatters.
pub const GROUP_VARIABLE: &str = "group";

/// A compiled workflow plus everything reported on the way.
#[derive(Debug, Clone, Serialize)]
pub struct Compilation {
    /// The IR the workflow was compiled from
    pub ir: DeclarativeIr,
    pub workflow: CompiledWorkflow,
    pub warnings: Vec<String>,
    /// Post-compile repairs, empty when only [`DeclarativeCompiler::compile`] ran
    pub auto_fixed: Vec<AutoFix>,
}

#[derive(Debug, Default, Clone)]
pub struct DeclarativeCompiler;

impl DeclarativeCompiler {
    pub fn new() -> Self {
        Self
    }

    /// Compile validated IR. Unsupported patterns fail; ambiguous ones warn.
    #[instrument(name = "compiler.compile", skip(self, ir), fields(goal = %ir.goal))]
    pub fn compile(&self, ir: &ValidIr) -> Result<Compilation> {
        let ir: &DeclarativeIr = ir;
        let (pattern, mut warnings) = detect_pattern(ir)?;
        let filter = ir.filtering.as_ref().map(compile_filter).transpose()?;

        let mut builder = GraphBuilder::new();
        let mut steps = Vec::new();

        let mut current = fetch_sources(&mut builder, &mut steps, ir);

        if let Some((config, filter_warnings)) = filter {
            warnings.extend(filter_warnings);
            let config = serde_json::to_value(&config)?;
            current = builder.push(
                &mut steps,
                "filter",
                "Filter items",
                StepKind::Transform {
                    operation: TransformOp::Filter,
                    input: Some(current.collection.clone()),
                    config,
                },
                &[&current],
                None,
            );
        }

        let (dedupes, ai_steps): (Vec<&AiProcessing>, Vec<&AiProcessing>) =
            ir.ai_processing.iter().partition(|ai| injection::is_dedupe(ai));

        let mut tracker = DedupeTracker::default();
        for ai in dedupes {
            let key = ai.input_field.as_deref().or_else(|| ir.group_key());
            let alias = injection::normalize_type(&ai.processing_type);
            warnings.extend(tracker.record(key, &alias));
            let mut config = json!({"keep": "first"});
            if let Some(key) = key {
                config["key"] = json!(key);
            }
            current = builder.push(
                &mut steps,
                "dedupe",
                format!("Deduplicate ({})", alias),
                StepKind::Transform {
                    operation: TransformOp::Deduplicate,
                    input: Some(current.collection.clone()),
                    config,
                },
                &[&current],
                None,
            );
        }

        match pattern {
            DeliveryPattern::PerGroup { key, target } => {
                let group = builder.push(
                    &mut steps,
                    "group",
                    format!("Group by {}", key),
                    StepKind::Transform {
                        operation: TransformOp::Group,
                        input: Some(current.collection.clone()),
                        config: json!({"key": key}),
                    },
                    &[&current],
                    Some("groups"),
                );

                let mut nested = Vec::new();
                let mut extracted = false;
                let mut last = Producer::variable(&format!("{}.items", GROUP_VARIABLE));
                for ai in &ai_steps {
                    last = builder.push_ai(&mut nested, ai, &last, &mut extracted);
                }
                let recipient = match &target.recipient_field {
                    Some(field) => format!("{{{{{}.items[0].{}}}}}", GROUP_VARIABLE, field),
                    None => format!("{{{{{}.key}}}}", GROUP_VARIABLE),
                };
                builder.push(
                    &mut nested,
                    "deliver",
                    format!("Deliver via {}.{}", target.plugin, target.action),
                    StepKind::Action {
                        plugin: target.plugin.clone(),
                        action: target.action.clone(),
                        params: patterns::delivery_params(
                            &target.plugin,
                            Some(recipient),
                            &ir.goal,
                            last.value.clone(),
                        ),
                    },
                    &[&last],
                    None,
                );

                builder.push(
                    &mut steps,
                    "each",
                    format!("For each {} group", key),
                    StepKind::ScatterGather {
                        input: group.collection.clone(),
                        item_variable: GROUP_VARIABLE.to_string(),
                        partition_key: Some(key),
                        steps: nested,
                        on_error: ScatterErrorPolicy::Continue,
                        max_concurrency: None,
                    },
                    &[&group],
                    None,
                );
            }
            DeliveryPattern::Summary(target) => {
                let mut extracted = false;
                for ai in &ai_steps {
                    current = builder.push_ai(&mut steps, ai, &current, &mut extracted);
                }
                if ai_steps.is_empty() {
                    current = builder.push(
                        &mut steps,
                        "aggregate",
                        "Aggregate items",
                        StepKind::Transform {
                            operation: TransformOp::Aggregate,
                            input: Some(current.collection.clone()),
                            config: json!({"function": "collect"}),
                        },
                        &[&current],
                        None,
                    );
                }
                deliver(&mut builder, &mut steps, &target, ir, &current);
            }
            DeliveryPattern::Raw(target) => {
                let mut extracted = false;
                for ai in &ai_steps {
                    current = builder.push_ai(&mut steps, ai, &current, &mut extracted);
                }
                deliver(&mut builder, &mut steps, &target, ir, &current);
            }
        }

        let renames = ids::renumber(&mut steps);
        info!(steps = steps.len(), renamed = renames.len(), "Compiled workflow");
        for warning in &warnings {
            warn!("Compiler warning: {}", warning);
        }
        metrics::record_compile_warnings(warnings.len());

        Ok(Compilation {
            ir: ir.clone(),
            workflow: CompiledWorkflow::new(ir.goal.clone(), steps),
            warnings,
            auto_fixed: Vec::new(),
        })
    }
}

/// One fetch action per source, merged into one collection when several.
fn fetch_sources(
    builder: &mut GraphBuilder,
    steps: &mut Vec<WorkflowStep>,
    ir: &DeclarativeIr,
) -> Producer {
    let fetched: Vec<Producer> = ir
        .data_sources
        .iter()
        .map(|source| {
            let action = source.operation.clone().unwrap_or_else(|| "fetch".into());
            builder.push(
                steps,
                "fetch",
                format!("Fetch {} data", source.source),
                StepKind::Action {
                    plugin: source.source.clone(),
                    action,
                    params: patterns::fetch_params(source),
                },
                &[],
                Some(patterns::collection_field(source)),
            )
        })
        .collect();

    match fetched.as_slice() {
        [single] => single.clone(),
        _ => {
            let after: Vec<&Producer> = fetched.iter().collect();
            builder.push(
                steps,
                "merge",
                "Merge sources",
                StepKind::Enrichment {
                    sources: fetched.iter().map(|p| p.value.clone()).collect(),
                    strategy: EnrichmentStrategy::Merge,
                    join_key: None,
                },
                &after,
                None,
            )
        }
    }
}

fn deliver(
    builder: &mut GraphBuilder,
    steps: &mut Vec<WorkflowStep>,
    target: &crate::ir::DeliveryTarget,
    ir: &DeclarativeIr,
    source: &Producer,
) {
    builder.push(
        steps,
        "deliver",
        format!("Deliver via {}.{}", target.plugin, target.action),
        StepKind::Action {
            plugin: target.plugin.clone(),
            action: target.action.clone(),
            params: patterns::delivery_params(
                &target.plugin,
                target.recipient.clone(),
                &ir.goal,
                source.value.clone(),
            ),
        },
        &[source],
        None,
    );
}

/// Validate, compile and post-compile check raw IR. Fails closed.
pub fn compile_ir(raw: &Value, catalog: &ActionCatalog) -> Result<Compilation> {
    let ir = validate_ir_strict(raw)?;
    let compilation = DeclarativeCompiler::new().compile(&ir)?;
    let goal = compilation.workflow.goal.clone();

    let report = WorkflowParser::new(catalog).validate(compilation.workflow.steps);
    let mut warnings = compilation.warnings;
    warnings.extend(report.warnings.iter().cloned());
    let auto_fixed = report.auto_fixed.clone();
    let steps = report.into_result()?;

    Ok(Compilation {
        ir: compilation.ir,
        workflow: CompiledWorkflow::new(goal, steps),
        warnings,
        auto_fixed,
    })
}
