//! Parallel execution engine for compiled workflows.

mod cancellation;
mod executor;
mod scatter;
mod summary;

pub use cancellation::CancellationToken;
pub use executor::{ParallelExecutor, RunOptions};
pub use summary::{RunStatus, RunSummary, StepRecord, TokenUsage};
