//! Declarative intermediate representation.
//!
//! The IR is produced by an external intent generator and is never trusted:
//! every document goes through [`validate_ir`] before it reaches the compiler.

mod parser;
mod schema;
mod types;
mod validator;

pub use parser::{parse_ir, parse_ir_file};
pub use schema::{ir_schema, IrSchemaValidator};
pub use types::{
    AiProcessing, Combinator, DataSource, DeclarativeIr, DeliveryRules, DeliveryTarget,
    FilterClause, FilterCondition, FilterGroup, FilterOperator, Filtering, Grouping,
    PerGroupDelivery, SourceKind,
};
pub use validator::{scan_forbidden_tokens, validate_ir, validate_ir_strict, ValidIr};
