//! intentflow - compiler and parallel runtime for declarative workflow intent
//!
//! Agents describe *what* a workflow should achieve as declarative IR: data
//! sources, filters, AI processing needs and delivery rules. intentflow
//! validates that IR, compiles it into an ordered step graph (inferring
//! loops, injecting missing transforms, wiring variables), checks and repairs
//! the graph, then runs it with bounded concurrency.
//!
//! ## Pipeline
//!
//! ```text
//! IR -> ir::validate_ir -> compiler::DeclarativeCompiler -> workflow::WorkflowParser
//!    -> engine::ParallelExecutor -> engine::RunSummary
//! ```
//!
//! ## Example IR
//!
//! ```yaml
//! goal: Notify each sales person about angry customer emails
//! data_sources:
//!   - {source: gmail, kind: api, operation: search_emails, query: "in:inbox", params: null}
//! filtering:
//!   conditions: [{field: body, operator: contains, value: angry}]
//!   combine_with: null
//! ai_processing: []
//! delivery_rules:
//!   per_group_delivery: {group_by: sales_person, plugin: gmail, action: send_email, recipient_field: null}
//!   summary_delivery: null
//!   raw_delivery: null
//! grouping: null
//! ```
//!
//! compiles to fetch, filter, group and one `scatter_gather` over the groups.

pub mod approval;
pub mod budget;
pub mod compiler;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod ir;
pub mod metrics;
pub mod steps;
pub mod telemetry;
pub mod workflow;

pub use error::{Error, Result};
