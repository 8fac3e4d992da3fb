//! Scatter-gather fan-out.
//!
//! One branch per input element, each with its own branch scope binding the
//! item variable. Gathered results keep input order regardless of which
//! branch finishes first.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::executor::{run_step_list, Runtime, StepResult};
use crate::context::{ExecutionContext, StepOutput};
use crate::error::{StepErrorKind, StepExecutionError};
use crate::workflow::{ScatterErrorPolicy, StepKind, WorkflowStep};

struct BranchTemplate {
    runtime: Arc<Runtime>,
    ctx: ExecutionContext,
    steps: Arc<Vec<WorkflowStep>>,
    item_variable: String,
}

fn spawn_branch(
    join_set: &mut JoinSet<(usize, StepResult<Value>)>,
    index: usize,
    item: Value,
    template: &BranchTemplate,
) {
    let branch_ctx = template.ctx.branch([
        (template.item_variable.clone(), item),
        ("index".to_string(), json!(index)),
    ]);
    let runtime = template.runtime.clone();
    let steps = template.steps.clone();

    join_set.spawn(async move {
        let result = AssertUnwindSafe(run_step_list(&runtime, &steps, &branch_ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(StepExecutionError::new(
                    steps.first().map(|s| s.id.as_str()).unwrap_or_default(),
                    StepErrorKind::Panicked(format!("scatter branch {index}")),
                ))
            });
        // The branch result is the last nested step's output.
        let result = result.map(|outputs| {
            steps
                .last()
                .and_then(|last| outputs.get(&last.id).cloned())
                .unwrap_or(Value::Null)
        });
        (index, result)
    });
}

/// Run a `scatter_gather` step.
pub(crate) async fn run_scatter(
    runtime: &Runtime,
    step: &WorkflowStep,
    ctx: &ExecutionContext,
) -> StepResult<StepOutput> {
    let fail = |kind: StepErrorKind| StepExecutionError::new(&step.id, kind);
    let StepKind::ScatterGather {
        input,
        item_variable,
        partition_key,
        steps,
        on_error,
        max_concurrency,
    } = &step.kind
    else {
        return Err(fail(StepErrorKind::InvalidConfig("not a scatter_gather step".into())));
    };

    let items = ctx.resolve_collection(input).map_err(|e| fail(e.into()))?;
    let total = items.len();
    if total > runtime.max_scatter_items {
        return Err(fail(StepErrorKind::InvalidConfig(format!(
            "{} items exceed the scatter limit of {}",
            total, runtime.max_scatter_items
        ))));
    }
    info!(step_id = %step.id, items = total, "Scattering");
    if total == 0 {
        return Ok(StepOutput::with_metadata(
            json!([]),
            json!({"count": 0, "failed": [], "partition_key": partition_key}),
        ));
    }

    let template = BranchTemplate {
        runtime: Arc::new(runtime.clone()),
        ctx: ctx.clone(),
        steps: Arc::new(steps.clone()),
        item_variable: item_variable.clone(),
    };
    let width = max_concurrency.unwrap_or(total).clamp(1, total);

    let mut results = vec![Value::Null; total];
    let mut failed: Vec<usize> = Vec::new();
    let mut join_set: JoinSet<(usize, StepResult<Value>)> = JoinSet::new();
    let mut items = items.into_iter().enumerate();
    let mut started = 0usize;
    // Set once no further branch may start; in-flight branches still finish.
    let mut first_failure: Option<StepExecutionError> = None;
    let mut interrupted: Option<StepErrorKind> = None;

    for (index, item) in items.by_ref().take(width) {
        if let Some(kind) = runtime.interruption() {
            interrupted = Some(kind);
            break;
        }
        spawn_branch(&mut join_set, index, item, &template);
        started += 1;
    }

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, Ok(data))) => {
                results[index] = data;
            }
            Ok((index, Err(e))) if e.is_interruption() => {
                debug!(step_id = %step.id, index, "Branch stopped: {}", e.kind);
                interrupted.get_or_insert(e.kind);
            }
            Ok((index, Err(e))) => match on_error {
                ScatterErrorPolicy::Continue => {
                    warn!(step_id = %step.id, index, "Branch failed, continuing: {}", e);
                    results[index] = json!({"error": Value::from(e)});
                    failed.push(index);
                }
                ScatterErrorPolicy::FailFast => {
                    error!(step_id = %step.id, index, "Branch failed, starting no more branches: {}", e);
                    first_failure.get_or_insert(fail(StepErrorKind::Branch {
                        index,
                        message: e.to_string(),
                    }));
                }
            },
            Err(e) => {
                error!(step_id = %step.id, "Scatter worker join failed: {}", e);
                first_failure.get_or_insert(fail(StepErrorKind::Panicked(format!(
                    "scatter worker join failed: {e}"
                ))));
            }
        }

        if first_failure.is_some() || interrupted.is_some() {
            continue;
        }
        if let Some(kind) = runtime.interruption() {
            interrupted = Some(kind);
            continue;
        }
        if let Some((index, item)) = items.next() {
            spawn_branch(&mut join_set, index, item, &template);
            started += 1;
        }
    }

    if let Some(err) = first_failure {
        return Err(err);
    }
    if let Some(kind) = interrupted {
        let reason = match kind {
            StepErrorKind::Cancelled => "run cancelled",
            _ => "workflow timeout",
        };
        for index in started..total {
            runtime
                .events
                .step_skipped(&runtime.run_id, &format!("{}[{}]", step.id, index), reason);
        }
        warn!(
            step_id = %step.id,
            started,
            skipped = total - started,
            "Scatter stopped: {}",
            reason
        );
        return Err(fail(kind));
    }

    failed.sort_unstable();
    debug!(step_id = %step.id, failed = failed.len(), "Gathered");
    Ok(StepOutput::with_metadata(
        Value::Array(results),
        json!({
            "count": total,
            "failed": failed,
            "partition_key": partition_key,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalTracker;
    use crate::budget::TokenBudgetManager;
    use crate::config::Config;
    use crate::engine::CancellationToken;
    use crate::events::{EventSink, RunEvent};
    use crate::steps::{Plugin, PluginError, PluginRegistry, PluginResponse, StepExecutor};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Finishes items in reverse order; fails on negative numbers.
    struct Reverser;

    #[async_trait]
    impl Plugin for Reverser {
        fn name(&self) -> &str {
            "calc"
        }

        async fn invoke(&self, _action: &str, params: &Value) -> Result<PluginResponse, PluginError> {
            let n = params["n"].as_i64().unwrap_or_default();
            if n < 0 {
                return Err(PluginError::Failed(format!("negative: {n}")));
            }
            tokio::time::sleep(Duration::from_millis((10 - n.min(10)) as u64 * 3)).await;
            Ok(PluginResponse::new(json!({"square": n * n})))
        }
    }

    /// Counts finished calls; fails on negative numbers right away.
    struct Counter {
        finished: AtomicUsize,
    }

    #[async_trait]
    impl Plugin for Counter {
        fn name(&self) -> &str {
            "calc"
        }

        async fn invoke(&self, _action: &str, params: &Value) -> Result<PluginResponse, PluginError> {
            let n = params["n"].as_i64().unwrap_or_default();
            if n < 0 {
                return Err(PluginError::Failed(format!("negative: {n}")));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(PluginResponse::new(json!({"n": n})))
        }
    }

    fn runtime(max_items: usize) -> Runtime {
        runtime_with(Arc::new(Reverser), max_items)
    }

    fn runtime_with(plugin: Arc<dyn Plugin>, max_items: usize) -> Runtime {
        let mut plugins = PluginRegistry::new();
        plugins.register(plugin);
        let config = Config::default();
        let events = EventSink::new();
        Runtime {
            steps: Arc::new(StepExecutor::new(
                plugins,
                Arc::new(ApprovalTracker::new(events.clone())),
                Arc::new(TokenBudgetManager::new(&config.budget, events.clone())),
                &config.approval,
            )),
            semaphore: Arc::new(Semaphore::new(4)),
            events,
            run_id: "run".into(),
            max_scatter_items: max_items,
            cancel: CancellationToken::new(),
            deadline: tokio::time::Instant::now() + Duration::from_secs(60),
        }
    }

    fn scatter(on_error: ScatterErrorPolicy) -> WorkflowStep {
        WorkflowStep::new(
            "step2",
            "square each",
            StepKind::ScatterGather {
                input: "{{input.numbers}}".into(),
                item_variable: "item".into(),
                partition_key: None,
                steps: vec![WorkflowStep::new(
                    "step2_1",
                    "square",
                    StepKind::Action {
                        plugin: "calc".into(),
                        action: "square".into(),
                        params: json!({"n": "{{item}}"}),
                    },
                )],
                on_error,
                max_concurrency: Some(3),
            },
        )
    }

    fn ctx(numbers: Value) -> ExecutionContext {
        ExecutionContext::with_steps([("step2".to_string(), None)], json!({"numbers": numbers}))
    }

    #[tokio::test]
    async fn test_gather_preserves_input_order() {
        let numbers: Vec<i64> = (0..8).collect();
        let out = run_scatter(&runtime(100), &scatter(ScatterErrorPolicy::FailFast), &ctx(json!(numbers)))
            .await
            .unwrap();
        let gathered = out.data.as_array().unwrap();
        assert_eq!(gathered.len(), 8);
        for (i, value) in gathered.iter().enumerate() {
            assert_eq!(value["square"], json!((i * i) as i64));
        }
    }

    #[tokio::test]
    async fn test_fail_fast_reports_branch() {
        let err = run_scatter(
            &runtime(100),
            &scatter(ScatterErrorPolicy::FailFast),
            &ctx(json!([1, -2, 3])),
        )
        .await
        .unwrap_err();
        assert_eq!(err.step_id, "step2");
        assert!(matches!(err.kind, StepErrorKind::Branch { index: 1, .. }));
    }

    #[tokio::test]
    async fn test_fail_fast_lets_running_branches_finish() {
        let counter = Arc::new(Counter {
            finished: AtomicUsize::new(0),
        });
        let runtime = runtime_with(counter.clone(), 100);
        let err = run_scatter(&runtime, &scatter(ScatterErrorPolicy::FailFast), &ctx(json!([-1, 2, 3, 4, 5])))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, StepErrorKind::Branch { index: 0, .. }));
        // Branches 1 and 2 were in flight and complete; 3 and 4 never start.
        assert_eq!(counter.finished.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_continue_keeps_failed_slots() {
        let out = run_scatter(
            &runtime(100),
            &scatter(ScatterErrorPolicy::Continue),
            &ctx(json!([1, -2, 3])),
        )
        .await
        .unwrap();
        let gathered = out.data.as_array().unwrap();
        assert_eq!(gathered.len(), 3);
        assert_eq!(gathered[0]["square"], 1);
        assert_eq!(gathered[1]["error"]["code"], "PLUGIN_ERROR");
        assert_eq!(gathered[2]["square"], 9);
        assert_eq!(out.metadata["failed"], json!([1]));
    }

    #[tokio::test]
    async fn test_item_limit_and_empty_input() {
        let err = run_scatter(&runtime(2), &scatter(ScatterErrorPolicy::FailFast), &ctx(json!([1, 2, 3])))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");

        let out = run_scatter(&runtime(2), &scatter(ScatterErrorPolicy::FailFast), &ctx(json!([])))
            .await
            .unwrap();
        assert_eq!(out.data, json!([]));
    }

    #[tokio::test]
    async fn test_scalar_input_is_rejected() {
        let err = run_scatter(&runtime(10), &scatter(ScatterErrorPolicy::FailFast), &ctx(json!(5)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RESOLUTION_ERROR");
    }

    #[tokio::test]
    async fn test_stopped_run_starts_no_branches() {
        let runtime = runtime(100);
        let mut events = runtime.events.subscribe();
        runtime.cancel.cancel();
        let err = run_scatter(&runtime, &scatter(ScatterErrorPolicy::Continue), &ctx(json!([1, 2, 3])))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CANCELLED");

        let mut skipped = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RunEvent::StepSkipped { step_id, .. } = event {
                skipped.push(step_id);
            }
        }
        assert_eq!(skipped, vec!["step2[0]", "step2[1]", "step2[2]"]);
    }

    #[tokio::test]
    async fn test_past_deadline_reports_timeout() {
        let mut runtime = runtime(100);
        runtime.deadline = tokio::time::Instant::now();
        let err = run_scatter(&runtime, &scatter(ScatterErrorPolicy::FailFast), &ctx(json!([1, 2])))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "WORKFLOW_TIMEOUT");
    }
}
