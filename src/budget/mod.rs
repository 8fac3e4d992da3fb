//! Step intent classification and token budgets.
//!
//! Generation-heavy steps (summaries, classification, drafting) share one
//! token pool per run. The pool is scaled by the agent's complexity score
//! and split across steps by an [`AllocationStrategy`]; the
//! [`TokenBudgetManager`] then tracks usage per step and refuses further
//! generation once a step exceeds its allocation plus the configured
//! tolerance.

mod intent;
mod manager;

pub use intent::{
    IntentClassification, IntentClassifier, IntentScore, KeywordClassifier, SemanticClassifier,
    StepIntent, PATTERN_CONFIDENCE,
};
pub use manager::{
    allocate_budget, AllocationStrategy, TokenBudget, TokenBudgetManager, UsageStatus,
};
