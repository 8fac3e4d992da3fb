//! Error types for intentflow.
//!
//! Errors carry machine-readable codes so that callers (and the intent
//! generator feeding us IR) can act on them without parsing messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for intentflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error taxonomy.
///
/// Schema and compilation errors abort before any step runs. Step-level
/// failures are wrapped in [`StepExecutionError`] and scoped to the step.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Schema validation failed: {}", format_schema_errors(.0))]
    SchemaValidation(Vec<SchemaError>),

    #[error("Compilation error: {0}")]
    Compilation(String),

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Dependency cycle detected involving steps: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error(transparent)]
    StepExecution(#[from] StepExecutionError),

    #[error("Token budget exceeded for step '{step_id}': used {used} of {limit}")]
    BudgetExceeded {
        step_id: String,
        used: u64,
        limit: u64,
    },

    #[error("Approval request '{0}' timed out")]
    ApprovalTimeout(String),

    #[error("Approval failed: {0}")]
    ApprovalFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Error::SchemaValidation(_) => "SCHEMA_VALIDATION_ERROR",
            Error::Compilation(_) => "COMPILATION_ERROR",
            Error::Resolution(_) => "RESOLUTION_ERROR",
            Error::TypeMismatch(_) => "TYPE_MISMATCH_ERROR",
            Error::DependencyCycle(_) => "DEPENDENCY_CYCLE_ERROR",
            Error::StepExecution(_) => "STEP_EXECUTION_ERROR",
            Error::BudgetExceeded { .. } => "BUDGET_EXCEEDED_ERROR",
            Error::ApprovalTimeout(_) => "APPROVAL_TIMEOUT_ERROR",
            Error::ApprovalFailed(_) => "APPROVAL_FAILED_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Whether this error was raised before execution started.
    pub fn is_compile_time(&self) -> bool {
        matches!(
            self,
            Error::SchemaValidation(_)
                | Error::Compilation(_)
                | Error::TypeMismatch(_)
                | Error::DependencyCycle(_)
                | Error::Parse(_)
        )
    }

    /// Convert to a structured JSON error response.
    pub fn to_json(&self) -> serde_json::Value {
        let mut error = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        });

        match self {
            Error::SchemaValidation(errors) => {
                error["details"] = serde_json::to_value(errors).unwrap_or_default();
            }
            Error::StepExecution(e) => {
                error["step_id"] = serde_json::Value::String(e.step_id.clone());
            }
            _ => {}
        }

        serde_json::json!({
            "success": false,
            "error": error,
        })
    }
}

/// A single schema violation, either in the IR or in a compiled step graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaError {
    /// JSON-pointer-like location of the offending value.
    pub path: String,
    pub code: SchemaErrorCode,
    pub message: String,
}

impl SchemaError {
    pub fn new(path: impl Into<String>, code: SchemaErrorCode, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] at '{}': {}", self.code, self.path, self.message)
        }
    }
}

/// Schema violation categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaErrorCode {
    /// Execution detail leaked into declarative input.
    ForbiddenToken,
    /// Structural schema violation.
    Schema,
    MissingField,
    InvalidValue,
    DuplicateId,
    UnknownDependency,
    UnresolvableReference,
    TypeMismatch,
    DependencyCycle,
    ScalarScatterInput,
}

impl std::fmt::Display for SchemaErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SchemaErrorCode::ForbiddenToken => "FORBIDDEN_TOKEN",
            SchemaErrorCode::Schema => "SCHEMA",
            SchemaErrorCode::MissingField => "MISSING_FIELD",
            SchemaErrorCode::InvalidValue => "INVALID_VALUE",
            SchemaErrorCode::DuplicateId => "DUPLICATE_ID",
            SchemaErrorCode::UnknownDependency => "UNKNOWN_DEPENDENCY",
            SchemaErrorCode::UnresolvableReference => "UNRESOLVABLE_REFERENCE",
            SchemaErrorCode::TypeMismatch => "TYPE_MISMATCH",
            SchemaErrorCode::DependencyCycle => "DEPENDENCY_CYCLE",
            SchemaErrorCode::ScalarScatterInput => "SCALAR_SCATTER_INPUT",
        };
        f.write_str(s)
    }
}

fn format_schema_errors(errors: &[SchemaError]) -> String {
    match errors {
        [] => "no details".to_string(),
        [single] => single.to_string(),
        [first, rest @ ..] => format!("{} (and {} more)", first, rest.len()),
    }
}

/// Failure to resolve a template expression against an execution context.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("unknown reference root '{0}'")]
    UnknownStep(String),

    #[error("output of '{0}' is not available yet")]
    NotYetAvailable(String),

    #[error("missing field '{path}' in output of '{root}'")]
    MissingField { root: String, path: String },

    #[error("invalid template '{0}'")]
    InvalidTemplate(String),

    #[error("'{expression}' resolved to {found}, expected a collection")]
    NotACollection { expression: String, found: String },

    #[error("'{expression}' has several collection fields ({fields}); specify one explicitly")]
    AmbiguousCollection { expression: String, fields: String },

    #[error("expression evaluation failed: {0}")]
    Expression(String),

    #[error("output for '{0}' was already written")]
    AlreadyWritten(String),
}

/// Step-scoped execution failure.
#[derive(Error, Debug, Clone)]
#[error("Step '{step_id}' failed: {kind}")]
pub struct StepExecutionError {
    pub step_id: String,
    pub kind: StepErrorKind,
}

impl StepExecutionError {
    pub fn new(step_id: impl Into<String>, kind: StepErrorKind) -> Self {
        Self {
            step_id: step_id.into(),
            kind,
        }
    }

    /// Machine-readable code for the failure cause.
    pub fn code(&self) -> &'static str {
        match &self.kind {
            StepErrorKind::Resolution(_) => "RESOLUTION_ERROR",
            StepErrorKind::TypeMismatch(_) => "TYPE_MISMATCH_ERROR",
            StepErrorKind::InvalidConfig(_) => "INVALID_CONFIG",
            StepErrorKind::Plugin(_) => "PLUGIN_ERROR",
            StepErrorKind::ValidationFailed(_) => "VALIDATION_FAILED",
            StepErrorKind::BudgetExceeded { .. } => "BUDGET_EXCEEDED_ERROR",
            StepErrorKind::ApprovalRejected => "APPROVAL_REJECTED",
            StepErrorKind::ApprovalTimeout => "APPROVAL_TIMEOUT_ERROR",
            StepErrorKind::ApprovalFailed(_) => "APPROVAL_FAILED_ERROR",
            StepErrorKind::Branch { .. } => "SCATTER_BRANCH_FAILED",
            StepErrorKind::Cancelled => "CANCELLED",
            StepErrorKind::DeadlineExceeded => "WORKFLOW_TIMEOUT",
            StepErrorKind::Panicked(_) => "STEP_PANICKED",
        }
    }

    /// The step was stopped by run cancellation or the workflow deadline.
    pub fn is_interruption(&self) -> bool {
        matches!(
            self.kind,
            StepErrorKind::Cancelled | StepErrorKind::DeadlineExceeded
        )
    }
}

/// Cause of a step failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepErrorKind {
    #[error("{0}")]
    Resolution(#[from] ResolutionError),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("token budget exceeded: used {used} of {limit}")]
    BudgetExceeded { used: u64, limit: u64 },

    #[error("approval rejected")]
    ApprovalRejected,

    #[error("approval timed out")]
    ApprovalTimeout,

    #[error("approval failed: {0}")]
    ApprovalFailed(String),

    #[error("scatter branch {index} failed: {message}")]
    Branch { index: usize, message: String },

    #[error("cancelled before completion")]
    Cancelled,

    #[error("workflow deadline reached before completion")]
    DeadlineExceeded,

    #[error("step task panicked: {0}")]
    Panicked(String),
}

impl From<StepExecutionError> for serde_json::Value {
    fn from(err: StepExecutionError) -> Self {
        serde_json::json!({
            "step_id": err.step_id,
            "code": err.code(),
            "message": err.kind.to_string(),
        })
    }
}
