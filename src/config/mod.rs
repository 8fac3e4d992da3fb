//! Configuration management.
//!
//! intentflow configuration can come from:
//! - Config file (~/.config/intentflow/config.toml)
//! - Environment variables (INTENTFLOW_*), applied last
//!
//! The loaded [`Config`] is passed explicitly into each component; nothing
//! reads configuration from global state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::budget::AllocationStrategy;
use crate::error::{Error, Result};

/// intentflow configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Scheduler configuration
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Token budget configuration
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Approval defaults
    #[serde(default)]
    pub approval: ApprovalConfig,
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum number of leaf steps running at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Workflow-level deadline (seconds); stops scheduling, not in-flight work
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Upper bound on scatter-gather fan-out
    #[serde(default = "default_max_scatter_items")]
    pub max_scatter_items: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            timeout_seconds: default_timeout_seconds(),
            max_scatter_items: default_max_scatter_items(),
        }
    }
}

fn default_max_concurrency() -> usize {
    10
}

fn default_timeout_seconds() -> u64 {
    3600
}

fn default_max_scatter_items() -> usize {
    10_000
}

/// Token budget configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Tokens available to one run before complexity scaling
    #[serde(default = "default_total_tokens")]
    pub total_tokens: u64,

    /// Fraction a step may exceed its allocation before generation stops
    #[serde(default = "default_overage_tolerance")]
    pub overage_tolerance: f64,

    #[serde(default)]
    pub strategy: AllocationStrategy,

    /// Tokens held per in-flight call until a step has reported real usage
    #[serde(default = "default_reservation_tokens")]
    pub reservation_tokens: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total_tokens: default_total_tokens(),
            overage_tolerance: default_overage_tolerance(),
            strategy: AllocationStrategy::default(),
            reservation_tokens: default_reservation_tokens(),
        }
    }
}

fn default_reservation_tokens() -> u64 {
    500
}

fn default_total_tokens() -> u64 {
    100_000
}

fn default_overage_tolerance() -> f64 {
    0.1
}

/// Approval defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Used when an approval step does not set its own timeout
    #[serde(default = "default_approval_timeout")]
    pub default_timeout_seconds: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_approval_timeout(),
        }
    }
}

fn default_approval_timeout() -> u64 {
    86_400
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Load configuration from an explicit file, then apply env overrides.
    ///
    /// Unlike [`Config::load`], a missing or malformed file is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let partial: PartialConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        let mut config = Self::default();
        config.apply_partial(partial);
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("intentflow"))
            .unwrap_or_else(|| PathBuf::from(".intentflow"))
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        if self.executor.max_concurrency == 0 {
            return Err(Error::Config(
                "executor.max_concurrency must be at least 1".to_string(),
            ));
        }
        if !(0.0..=10.0).contains(&self.budget.overage_tolerance) {
            return Err(Error::Config(format!(
                "budget.overage_tolerance must be between 0 and 10, got {}",
                self.budget.overage_tolerance
            )));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("INTENTFLOW_MAX_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.executor.max_concurrency = v;
        }
        if let Some(v) = lookup("INTENTFLOW_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
            self.executor.timeout_seconds = v;
        }
        if let Some(v) = lookup("INTENTFLOW_MAX_SCATTER_ITEMS").and_then(|v| v.parse().ok()) {
            self.executor.max_scatter_items = v;
        }
        if let Some(v) = lookup("INTENTFLOW_TOTAL_TOKENS").and_then(|v| v.parse().ok()) {
            self.budget.total_tokens = v;
        }
        if let Some(v) = lookup("INTENTFLOW_OVERAGE_TOLERANCE").and_then(|v| v.parse().ok()) {
            self.budget.overage_tolerance = v;
        }
        if let Some(v) = lookup("INTENTFLOW_RESERVATION_TOKENS").and_then(|v| v.parse().ok()) {
            self.budget.reservation_tokens = v;
        }
        if let Some(v) = lookup("INTENTFLOW_BUDGET_STRATEGY").and_then(|v| v.parse().ok()) {
            self.budget.strategy = v;
        }
        if let Some(v) = lookup("INTENTFLOW_APPROVAL_TIMEOUT_SECONDS").and_then(|v| v.parse().ok())
        {
            self.approval.default_timeout_seconds = v;
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(executor) = partial.executor {
            self.executor = executor;
        }
        if let Some(budget) = partial.budget {
            self.budget = budget;
        }
        if let Some(approval) = partial.approval {
            self.approval = approval;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    executor: Option<ExecutorConfig>,
    budget: Option<BudgetConfig>,
    approval: Option<ApprovalConfig>,
}
