//! Prometheus metrics for intentflow.
//!
//! Metrics go through the `metrics` facade; without an installed recorder
//! every call is a no-op. `intentflow run --metrics` installs the Prometheus
//! recorder and prints the rendered text after the run.
//!
//! ## Metrics
//!
//! ### Counters
//! - `intentflow_steps_executed_total` - Step executions by step_type and status
//! - `intentflow_compile_warnings_total` - Compiler and parser warnings
//! - `intentflow_autofixes_total` - Auto-fixes applied by the post-compile parser, by rule
//! - `intentflow_budget_overage_total` - Steps that exceeded their token allocation
//!
//! ### Histograms
//! - `intentflow_step_duration_seconds` - Step execution duration by step_type
//!
//! ### Gauges
//! - `intentflow_active_runs` - Currently executing workflow runs

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder.
///
/// Returns `None` if another recorder is already installed.
pub fn init_metrics() -> Option<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Some(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    Some(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

// =============================================================================
// Run Metrics
// =============================================================================

pub fn inc_active_runs() {
    gauge!("intentflow_active_runs").increment(1.0);
}

pub fn dec_active_runs() {
    gauge!("intentflow_active_runs").decrement(1.0);
}

// =============================================================================
// Step Metrics
// =============================================================================

/// Record a step execution.
pub fn record_step_execution(step_type: &str, status: &str) {
    counter!(
        "intentflow_steps_executed_total",
        "step_type" => step_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record step execution duration.
pub fn record_step_duration(duration: Duration, step_type: &str) {
    histogram!(
        "intentflow_step_duration_seconds",
        "step_type" => step_type.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Compiler Metrics
// =============================================================================

pub fn record_compile_warnings(count: usize) {
    counter!("intentflow_compile_warnings_total").increment(count as u64);
}

pub fn record_autofix(rule: &str) {
    counter!(
        "intentflow_autofixes_total",
        "rule" => rule.to_string()
    )
    .increment(1);
}

// =============================================================================
// Budget Metrics
// =============================================================================

pub fn record_budget_overage(intent: &str) {
    counter!(
        "intentflow_budget_overage_total",
        "intent" => intent.to_string()
    )
    .increment(1);
}
