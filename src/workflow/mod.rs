//! Compiled workflows: the step graph, its loader, and post-compile checks.
//!
//! A compiled workflow is produced by the compiler (or loaded from YAML/JSON)
//! and must pass [`WorkflowParser::validate`] before the engine runs it.

pub mod catalog;
pub mod dag;
pub mod ids;
mod loader;
mod parser;
pub mod rules;
pub mod schema;
mod types;

pub use catalog::{ActionCatalog, ActionSpec, ParamSpec, ParamType, RequiredTransform};
pub use loader::{parse_workflow, parse_workflow_file};
pub use parser::{ParseReport, WorkflowParser};
pub use rules::AutoFix;
pub use schema::TransformSchemas;
pub use types::*;
