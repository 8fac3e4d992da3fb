//! Parallel workflow executor.

use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::cancellation::CancellationToken;
use super::scatter;
use super::summary::{RunStatus, RunSummary, StepRecord, TokenUsage};
use crate::budget::{allocate_budget, AllocationStrategy, IntentClassifier, StepIntent};
use crate::config::{BudgetConfig, Config, ExecutorConfig};
use crate::context::{ExecutionContext, StepOutput, StepStatus};
use crate::error::{Result, StepErrorKind, StepExecutionError};
use crate::events::{EventSink, RunEvent};
use crate::metrics;
use crate::steps::StepExecutor;
use crate::workflow::{dag, CompiledWorkflow, StepKind, WorkflowStep};

pub(crate) type StepResult<T> = std::result::Result<T, StepExecutionError>;

/// Per-run knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunOptions {
    /// Workflow complexity on a 0–10 scale; scales the token pool
    pub complexity: f64,
    /// Overrides the configured allocation strategy
    pub strategy: Option<AllocationStrategy>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            complexity: 5.0,
            strategy: None,
        }
    }
}

/// Shared state of one run, handed to every spawned step task.
#[derive(Clone)]
pub(crate) struct Runtime {
    pub steps: Arc<StepExecutor>,
    pub semaphore: Arc<Semaphore>,
    pub events: EventSink,
    pub run_id: String,
    pub max_scatter_items: usize,
    pub cancel: CancellationToken,
    pub deadline: tokio::time::Instant,
}

impl Runtime {
    /// Why no further step may start, once the run is cancelled or past its deadline.
    pub(crate) fn interruption(&self) -> Option<StepErrorKind> {
        if self.cancel.is_cancelled() {
            Some(StepErrorKind::Cancelled)
        } else if tokio::time::Instant::now() >= self.deadline {
            Some(StepErrorKind::DeadlineExceeded)
        } else {
            None
        }
    }
}

/// Runs a compiled workflow as a DAG.
///
/// Every step whose dependencies have completed is started at once, up to
/// `executor.max_concurrency` leaf steps in flight. Container steps
/// (`conditional`, `scatter_gather`) hold no permit while their children run.
pub struct ParallelExecutor {
    steps: Arc<StepExecutor>,
    classifier: IntentClassifier,
    executor_config: ExecutorConfig,
    budget_config: BudgetConfig,
    events: EventSink,
}

impl ParallelExecutor {
    pub fn new(steps: Arc<StepExecutor>, config: &Config, events: EventSink) -> Self {
        Self {
            steps,
            classifier: IntentClassifier::default(),
            executor_config: config.executor.clone(),
            budget_config: config.budget.clone(),
            events,
        }
    }

    pub fn with_classifier(mut self, classifier: IntentClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn step_executor(&self) -> &Arc<StepExecutor> {
        &self.steps
    }

    /// Execute a workflow to completion, cancellation or deadline.
    ///
    /// A dependency cycle is rejected before any step runs. Step failures
    /// never abort the run: the failed step's transitive dependents are
    /// skipped and independent branches keep going.
    #[instrument(
        name = "workflow.run",
        skip(self, workflow, input, options, cancel),
        fields(goal = %workflow.goal, steps = workflow.steps.len(), run_id = tracing::field::Empty)
    )]
    pub async fn run(
        &self,
        workflow: &CompiledWorkflow,
        input: Value,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        workflow.topological_order()?;
        let deps: Vec<Vec<usize>> = workflow
            .dependency_indices()?
            .into_iter()
            .map(|d| d.into_iter().collect::<BTreeSet<_>>().into_iter().collect())
            .collect();

        let ctx = ExecutionContext::new(workflow, input);
        let run_id = ctx.run_id().to_string();
        tracing::Span::current().record("run_id", run_id.as_str());

        self.install_budgets(workflow, options);

        let started_at = Utc::now();
        let clock = Instant::now();
        metrics::inc_active_runs();
        self.events.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
            step_count: workflow.steps.len(),
        });
        info!("Run started with {} top-level steps", workflow.steps.len());

        let runtime = Arc::new(Runtime {
            steps: self.steps.clone(),
            semaphore: Arc::new(Semaphore::new(self.executor_config.max_concurrency.max(1))),
            events: self.events.clone(),
            run_id: run_id.clone(),
            max_scatter_items: self.executor_config.max_scatter_items,
            cancel,
            deadline: tokio::time::Instant::now()
                + Duration::from_secs(self.executor_config.timeout_seconds),
        });

        let mut scheduler = Scheduler::new(workflow, &deps);
        let stop = scheduler.drive(&runtime, &ctx).await;

        let leftover = match stop {
            Some(RunStatus::Cancelled) => "run cancelled",
            Some(RunStatus::TimedOut) => "workflow timeout",
            _ => "not scheduled",
        };
        let unscheduled = scheduler.skip_pending(&ctx, &self.events, &run_id, leftover);

        let failed = scheduler.records.iter().any(|r| r.status == StepStatus::Failed);
        let status = match stop {
            Some(stopped) if unscheduled > 0 || scheduler.interrupted => stopped,
            _ if failed => RunStatus::Failed,
            _ => RunStatus::Completed,
        };

        let budget = self.steps.budget();
        let summary = RunSummary {
            run_id: run_id.clone(),
            status,
            started_at,
            finished_at: Utc::now(),
            outputs: ctx.completed_outputs(),
            step_states: scheduler.records,
            token_usage: TokenUsage {
                total_used: budget.total_used(),
                steps: budget.report(),
            },
            approvals_resolved: self.steps.approvals().resolved_count(),
            unwraps: ctx.unwraps(),
        };

        metrics::dec_active_runs();
        let duration_ms = clock.elapsed().as_millis() as i64;
        self.events.emit(RunEvent::RunFinished {
            run_id,
            status: status.to_string(),
            duration_ms,
        });
        match status {
            RunStatus::Completed => info!(duration_ms, "Run completed"),
            other => warn!(duration_ms, status = %other, "Run did not complete"),
        }

        Ok(summary)
    }

    /// Classify every step and hand the generative ones their token share.
    fn install_budgets(&self, workflow: &CompiledWorkflow, options: RunOptions) {
        let mut generative: Vec<(String, StepIntent)> = Vec::new();
        for step in workflow.all_steps() {
            let classification = self.classifier.classify(step);
            debug!(
                step_id = %step.id,
                intent = %classification.intent,
                confidence = classification.confidence,
                "Classified step"
            );
            if classification.intent.is_generative() {
                generative.push((step.id.clone(), classification.intent));
            }
        }
        if generative.is_empty() {
            return;
        }

        let strategy = options.strategy.unwrap_or(self.budget_config.strategy);
        let budgets = allocate_budget(
            &generative,
            options.complexity,
            strategy,
            self.budget_config.total_tokens,
        );
        debug!(
            strategy = strategy.as_str(),
            steps = budgets.len(),
            "Token budgets allocated"
        );
        self.steps.budget().install(budgets);
    }
}

/// Ready-queue bookkeeping for the top-level DAG.
struct Scheduler<'a> {
    workflow: &'a CompiledWorkflow,
    deps: &'a [Vec<usize>],
    dependents: Vec<Vec<usize>>,
    waiting: Vec<usize>,
    ready: BTreeSet<usize>,
    records: Vec<StepRecord>,
    /// A running step was cut short by cancellation or the deadline
    interrupted: bool,
}

impl<'a> Scheduler<'a> {
    fn new(workflow: &'a CompiledWorkflow, deps: &'a [Vec<usize>]) -> Self {
        let mut dependents = vec![Vec::new(); deps.len()];
        for (node, node_deps) in deps.iter().enumerate() {
            for &dep in node_deps {
                dependents[dep].push(node);
            }
        }
        let waiting: Vec<usize> = deps.iter().map(Vec::len).collect();
        let ready = (0..deps.len()).filter(|&i| waiting[i] == 0).collect();
        let records = workflow
            .steps
            .iter()
            .map(|s| StepRecord {
                step_id: s.id.clone(),
                step_type: s.step_type().to_string(),
                status: StepStatus::Pending,
                duration_ms: None,
                error: None,
                reason: None,
            })
            .collect();

        Self {
            workflow,
            deps,
            dependents,
            waiting,
            ready,
            records,
            interrupted: false,
        }
    }

    /// Run until nothing is in flight. Returns why scheduling stopped early.
    async fn drive(&mut self, runtime: &Arc<Runtime>, ctx: &ExecutionContext) -> Option<RunStatus> {
        let cancel = &runtime.cancel;
        let deadline = runtime.deadline;
        let mut tasks: JoinSet<(usize, StepResult<StepOutput>, i64)> = JoinSet::new();
        let mut stop: Option<RunStatus> = None;

        loop {
            if stop.is_none() {
                match runtime.interruption() {
                    Some(StepErrorKind::Cancelled) => {
                        warn!("Cancellation requested, no new steps will start");
                        stop = Some(RunStatus::Cancelled);
                    }
                    Some(_) => {
                        warn!("Workflow deadline reached, no new steps will start");
                        stop = Some(RunStatus::TimedOut);
                    }
                    None => {}
                }
            }

            if stop.is_none() {
                while let Some(index) = self.ready.pop_first() {
                    self.records[index].status = StepStatus::Running;
                    let runtime = runtime.clone();
                    let step = self.workflow.steps[index].clone();
                    let ctx = ctx.clone();
                    tasks.spawn(async move {
                        let observed = AssertUnwindSafe(execute_observed(&runtime, &step, &ctx))
                            .catch_unwind()
                            .await;
                        match observed {
                            Ok((result, duration_ms)) => (index, result, duration_ms),
                            Err(panic) => {
                                let message = panic
                                    .downcast_ref::<&str>()
                                    .map(|s| s.to_string())
                                    .or_else(|| panic.downcast_ref::<String>().cloned())
                                    .unwrap_or_else(|| "unknown panic".to_string());
                                error!(step_id = %step.id, "Step task panicked: {}", message);
                                let err = StepExecutionError::new(
                                    &step.id,
                                    StepErrorKind::Panicked(message),
                                );
                                (index, Err(err), 0)
                            }
                        }
                    });
                }
            }

            if tasks.is_empty() {
                return stop;
            }

            let joined = if stop.is_some() {
                tasks.join_next().await
            } else {
                tokio::select! {
                    joined = tasks.join_next() => joined,
                    _ = cancel.cancelled() => continue,
                    _ = tokio::time::sleep_until(deadline) => continue,
                }
            };
            let Some(joined) = joined else {
                return stop;
            };

            match joined {
                Ok((index, result, duration_ms)) => {
                    self.records[index].duration_ms = Some(duration_ms);
                    self.finish(index, result, ctx, runtime);
                }
                Err(e) => error!("Step task join failed: {}", e),
            }
        }
    }

    fn finish(
        &mut self,
        index: usize,
        result: StepResult<StepOutput>,
        ctx: &ExecutionContext,
        runtime: &Runtime,
    ) {
        let workflow = self.workflow;
        let step = &workflow.steps[index];
        let result = result.and_then(|output| {
            ctx.record_output(&step.id, output, step.output_field.as_deref())
                .map_err(|e| StepExecutionError::new(&step.id, e.into()))
        });

        match result {
            Ok(()) => {
                self.records[index].status = StepStatus::Completed;
                for &dependent in &self.dependents[index] {
                    self.waiting[dependent] -= 1;
                    if self.waiting[dependent] == 0
                        && self.records[dependent].status == StepStatus::Pending
                    {
                        self.ready.insert(dependent);
                    }
                }
            }
            Err(err) if err.is_interruption() => {
                let reason = match err.kind {
                    StepErrorKind::Cancelled => "run cancelled",
                    _ => "workflow timeout",
                };
                self.interrupted = true;
                self.skip(index, ctx, &runtime.events, &runtime.run_id, reason);
                self.records[index].error = Some(err.into());
            }
            Err(err) => {
                let detail: Value = err.clone().into();
                self.records[index].status = StepStatus::Failed;
                self.records[index].error = Some(detail.clone());
                let _ = ctx.record_output(&step.id, StepOutput::failed(detail), None);

                for dependent in dag::transitive_dependents(self.deps, index) {
                    if self.records[dependent].status == StepStatus::Pending {
                        self.skip(dependent, ctx, &runtime.events, &runtime.run_id, "upstream failure");
                    }
                }
            }
        }
    }

    fn skip(
        &mut self,
        index: usize,
        ctx: &ExecutionContext,
        events: &EventSink,
        run_id: &str,
        reason: &str,
    ) {
        let workflow = self.workflow;
        let step = &workflow.steps[index];
        self.ready.remove(&index);
        self.records[index].status = StepStatus::Skipped;
        self.records[index].reason = Some(reason.to_string());
        let _ = ctx.record_output(&step.id, StepOutput::skipped(reason), None);
        metrics::record_step_execution(step.step_type(), StepStatus::Skipped.as_str());
        events.step_skipped(run_id, &step.id, reason);
        debug!(step_id = %step.id, reason, "Step skipped");
    }

    /// Skip everything never started. Returns how many steps that was.
    fn skip_pending(
        &mut self,
        ctx: &ExecutionContext,
        events: &EventSink,
        run_id: &str,
        reason: &str,
    ) -> usize {
        let pending: Vec<usize> = (0..self.records.len())
            .filter(|&i| self.records[i].status == StepStatus::Pending)
            .collect();
        for &index in &pending {
            self.skip(index, ctx, events, run_id, reason);
        }
        pending.len()
    }
}

/// Execute one step with lifecycle events, metrics and timing.
pub(crate) async fn execute_observed(
    runtime: &Runtime,
    step: &WorkflowStep,
    ctx: &ExecutionContext,
) -> (StepResult<StepOutput>, i64) {
    let step_type = step.step_type();
    runtime.events.step_started(&runtime.run_id, &step.id, step_type);
    let start = Instant::now();

    let result = execute_step(runtime, step, ctx).await;

    let elapsed = start.elapsed();
    let duration_ms = elapsed.as_millis() as i64;
    metrics::record_step_duration(elapsed, step_type);
    match &result {
        Ok(_) => {
            metrics::record_step_execution(step_type, StepStatus::Completed.as_str());
            runtime.events.step_completed(&runtime.run_id, &step.id, duration_ms);
            debug!(step_id = %step.id, duration_ms, "Step completed");
        }
        Err(e) if e.is_interruption() => {
            debug!(step_id = %step.id, "Step not started: {}", e.kind);
        }
        Err(e) => {
            metrics::record_step_execution(step_type, StepStatus::Failed.as_str());
            runtime
                .events
                .step_failed(&runtime.run_id, &step.id, e.code(), &e.kind.to_string());
            warn!(step_id = %step.id, code = e.code(), "Step failed: {}", e.kind);
        }
    }
    (result, duration_ms)
}

/// Dispatch on step kind. Boxed because containers recurse into it.
pub(crate) fn execute_step<'a>(
    runtime: &'a Runtime,
    step: &'a WorkflowStep,
    ctx: &'a ExecutionContext,
) -> BoxFuture<'a, StepResult<StepOutput>> {
    Box::pin(async move {
        match &step.kind {
            StepKind::ScatterGather { .. } => scatter::run_scatter(runtime, step, ctx).await,
            StepKind::Conditional {
                then_steps,
                else_steps,
                ..
            } => {
                let met = runtime.steps.evaluate_conditional(step, ctx)?;
                let (branch, chosen) = if met {
                    ("then", then_steps)
                } else {
                    ("else", else_steps)
                };
                debug!(step_id = %step.id, branch, "Condition evaluated");

                let scope = ctx.branch(std::iter::empty());
                let outputs = run_step_list(runtime, chosen, &scope).await?;
                Ok(StepOutput::with_metadata(
                    json!({
                        "branch": branch,
                        "condition_met": met,
                        "outputs": outputs,
                    }),
                    json!({"executed": chosen.len()}),
                ))
            }
            _ => {
                let _permit = runtime
                    .semaphore
                    .acquire()
                    .await
                    .map_err(|_| StepExecutionError::new(&step.id, StepErrorKind::Cancelled))?;
                // A permit may be granted long after the run was stopped.
                if let Some(kind) = runtime.interruption() {
                    return Err(StepExecutionError::new(&step.id, kind));
                }
                runtime.steps.execute(step, ctx).await
            }
        }
    })
}

/// Run a nested step list inside one branch scope, in dependency order.
///
/// Dependencies on steps outside the list are already satisfied by the
/// time the enclosing container runs. The first failure ends the list, and
/// no further step starts once the run is cancelled or past its deadline.
pub(crate) async fn run_step_list(
    runtime: &Runtime,
    steps: &[WorkflowStep],
    ctx: &ExecutionContext,
) -> StepResult<Map<String, Value>> {
    let local: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let deps: Vec<Vec<usize>> = steps
        .iter()
        .map(|s| {
            s.dependencies
                .iter()
                .filter_map(|d| local.get(d.as_str()).copied())
                .collect()
        })
        .collect();
    let order = dag::topological_sort(&deps).map_err(|cycle| {
        let ids: Vec<&str> = cycle.iter().map(|&i| steps[i].id.as_str()).collect();
        StepExecutionError::new(
            steps.first().map(|s| s.id.as_str()).unwrap_or_default(),
            StepErrorKind::InvalidConfig(format!("nested steps form a cycle: {}", ids.join(", "))),
        )
    })?;

    let mut outputs = Map::new();
    for index in order {
        let step = &steps[index];
        if let Some(kind) = runtime.interruption() {
            return Err(StepExecutionError::new(&step.id, kind));
        }
        let (result, _) = execute_observed(runtime, step, ctx).await;
        let output = result?;
        outputs.insert(step.id.clone(), output.data.clone());
        ctx.record_output(&step.id, output, step.output_field.as_deref())
            .map_err(|e| StepExecutionError::new(&step.id, e.into()))?;
    }
    Ok(outputs)
}
