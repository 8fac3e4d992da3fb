//! Step list assembly with placeholder ids.
//!
//! Steps get unique placeholder ids (`fetch_1`, `filter_2`) while the graph
//! is being built; final ids are assigned by renumbering once the structure
//! is fixed.

use serde_json::{json, Value};

use crate::ir::AiProcessing;
use crate::workflow::{StepKind, TransformOp, WorkflowStep};

use super::injection;

/// Where the next step takes its data from.
#[derive(Debug, Clone, PartialEq)]
pub struct Producer {
    /// Step id when the data comes from a sibling step
    pub step_id: Option<String>,
    /// Reference for inputs resolved as collections (transforms, scatter)
    pub collection: String,
    /// Reference for action params, pointing at the dominant field
    pub value: String,
}

impl Producer {
    pub fn step(id: &str, field: Option<&str>) -> Self {
        let collection = format!("{{{{{}}}}}", id);
        let value = match field {
            Some(field) => format!("{{{{{}.{}}}}}", id, field),
            None => collection.clone(),
        };
        Self {
            step_id: Some(id.to_string()),
            collection,
            value,
        }
    }

    /// A branch variable path such as `group.items`.
    pub fn variable(path: &str) -> Self {
        let reference = format!("{{{{{}}}}}", path);
        Self {
            step_id: None,
            collection: reference.clone(),
            value: reference,
        }
    }
}

#[derive(Debug, Default)]
pub struct GraphBuilder {
    counter: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step depending on the given producers. Returns it as a producer.
    pub fn push(
        &mut self,
        list: &mut Vec<WorkflowStep>,
        label: &str,
        name: impl Into<String>,
        kind: StepKind,
        after: &[&Producer],
        output_field: Option<&str>,
    ) -> Producer {
        self.counter += 1;
        let id = format!("{}_{}", label, self.counter);
        let mut step = WorkflowStep::new(id.clone(), name, kind);
        for producer in after {
            if let Some(dep) = &producer.step_id {
                if !step.dependencies.contains(dep) {
                    step.dependencies.push(dep.clone());
                }
            }
        }
        step.output_field = output_field.map(str::to_string);
        list.push(step);
        Producer::step(&id, output_field)
    }

    /// Append an injected transform.
    pub fn inject(
        &mut self,
        list: &mut Vec<WorkflowStep>,
        operation: TransformOp,
        name: impl Into<String>,
        source: &Producer,
        config: Value,
    ) -> Producer {
        let producer = self.push(
            list,
            operation.as_str(),
            name,
            StepKind::Transform {
                operation,
                input: Some(source.collection.clone()),
                config,
            },
            &[source],
            None,
        );
        if let Some(step) = list.last_mut() {
            step.injected = true;
        }
        producer
    }

    /// Append an AI step, extracting unstructured content first when needed.
    ///
    /// `extracted` records whether an extraction already ran on this data
    /// path, so it is injected at most once per path.
    pub fn push_ai(
        &mut self,
        list: &mut Vec<WorkflowStep>,
        ai: &AiProcessing,
        source: &Producer,
        extracted: &mut bool,
    ) -> Producer {
        let action = injection::normalize_type(&ai.processing_type);
        let mut input = source.clone();
        let mut input_field = ai.input_field.clone();

        if injection::needs_extraction(ai) && !*extracted {
            let field = injection::extraction_field(ai);
            input = self.inject(
                list,
                TransformOp::Extract,
                format!("Extract {} for {}", field, action),
                source,
                json!({"field": field, "format": "auto", "output_field": "extracted_text"}),
            );
            input_field = Some("extracted_text".to_string());
            *extracted = true;
        }

        let mut params = serde_json::Map::new();
        params.insert("input".into(), json!(input.value));
        params.insert("instruction".into(), json!(ai.instruction));
        if let Some(field) = input_field {
            params.insert("input_field".into(), json!(field));
        }
        if let Some(field) = &ai.output_field {
            params.insert("output_field".into(), json!(field));
        }

        self.push(
            list,
            "ai",
            format!("AI {}", action),
            StepKind::Action {
                plugin: "ai".into(),
                action,
                params: Value::Object(params),
            },
            &[&input],
            None,
        )
    }
}
