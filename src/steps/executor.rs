//! Single-step interpreter.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::plugin::PluginRegistry;
use super::{comparison, conditions, enrichment, transform, validation};
use crate::approval::{ApprovalSpec, ApprovalStatus, ApprovalTracker};
use crate::budget::{TokenBudgetManager, UsageStatus};
use crate::config::ApprovalConfig;
use crate::context::expression::TransformEngine;
use crate::context::{ExecutionContext, StepOutput};
use crate::error::{StepErrorKind, StepExecutionError};
use crate::workflow::{StepKind, ValidationFailPolicy, WorkflowStep};

type StepResult<T> = Result<T, StepExecutionError>;

/// Executes one leaf step against an execution context.
///
/// Container steps (`scatter_gather`, `conditional`) are scheduled by the
/// parallel executor; for those this type only evaluates the predicate.
pub struct StepExecutor {
    plugins: PluginRegistry,
    approvals: Arc<ApprovalTracker>,
    budget: Arc<TokenBudgetManager>,
    transforms: TransformEngine,
    default_approval_timeout: u64,
}

impl StepExecutor {
    pub fn new(
        plugins: PluginRegistry,
        approvals: Arc<ApprovalTracker>,
        budget: Arc<TokenBudgetManager>,
        approval_config: &ApprovalConfig,
    ) -> Self {
        Self {
            plugins,
            approvals,
            budget,
            transforms: TransformEngine::new(),
            default_approval_timeout: approval_config.default_timeout_seconds,
        }
    }

    pub fn approvals(&self) -> &Arc<ApprovalTracker> {
        &self.approvals
    }

    pub fn budget(&self) -> &Arc<TokenBudgetManager> {
        &self.budget
    }

    /// Execute a leaf step.
    #[instrument(
        name = "step.execute",
        skip(self, step, ctx),
        fields(step_id = %step.id, step_type = step.step_type())
    )]
    pub async fn execute(&self, step: &WorkflowStep, ctx: &ExecutionContext) -> StepResult<StepOutput> {
        let fail = |kind: StepErrorKind| StepExecutionError::new(&step.id, kind);

        match &step.kind {
            StepKind::Action {
                plugin,
                action,
                params,
            } => self.execute_action(step, ctx, plugin, action, params).await,

            StepKind::Transform {
                operation,
                input,
                config,
            } => {
                let input = input.as_deref().ok_or_else(|| {
                    fail(StepErrorKind::InvalidConfig(format!(
                        "{} transform has no input",
                        operation.as_str()
                    )))
                })?;
                let items = ctx.resolve_collection(input).map_err(|e| fail(e.into()))?;
                let config = ctx.resolve_value(config).map_err(|e| fail(e.into()))?;
                let output = transform::apply(*operation, items, &config, &self.transforms)
                    .map_err(fail)?;
                debug!(operation = operation.as_str(), "Transform applied");
                Ok(StepOutput::with_metadata(output.data, output.metadata))
            }

            StepKind::Enrichment {
                sources,
                strategy,
                join_key,
            } => {
                let resolved = sources
                    .iter()
                    .map(|s| ctx.resolve(s))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| fail(e.into()))?;
                let count = resolved.len();
                let data = enrichment::enrich(resolved, *strategy, join_key.as_deref())
                    .map_err(fail)?;
                Ok(StepOutput::with_metadata(
                    data,
                    json!({"sources": count, "strategy": strategy}),
                ))
            }

            StepKind::Validation {
                input,
                schema,
                rules,
                on_validation_fail,
            } => {
                let value = ctx.resolve(input).map_err(|e| fail(e.into()))?;
                let report =
                    validation::validate(&value, schema.as_ref(), rules).map_err(fail)?;
                let metadata = serde_json::to_value(&report).unwrap_or_default();

                if report.valid {
                    return Ok(StepOutput::with_metadata(value, metadata));
                }
                match on_validation_fail {
                    ValidationFailPolicy::Throw => {
                        Err(fail(StepErrorKind::ValidationFailed(report.summary())))
                    }
                    ValidationFailPolicy::Continue => {
                        warn!(violations = report.violations.len(), "Validation failed, continuing");
                        Ok(StepOutput::with_metadata(value, metadata))
                    }
                    ValidationFailPolicy::Skip => {
                        warn!(violations = report.violations.len(), "Validation failed, output dropped");
                        Ok(StepOutput::with_metadata(Value::Null, metadata))
                    }
                }
            }

            StepKind::Comparison {
                left,
                right,
                operation,
            } => {
                let left = ctx.resolve_value(left).map_err(|e| fail(e.into()))?;
                let right = ctx.resolve_value(right).map_err(|e| fail(e.into()))?;
                Ok(StepOutput::with_metadata(
                    comparison::compare(&left, &right, *operation),
                    json!({"operation": operation}),
                ))
            }

            StepKind::Approval { .. } => self.execute_approval(step, ctx).await,

            StepKind::Conditional { .. } | StepKind::ScatterGather { .. } => {
                Err(fail(StepErrorKind::InvalidConfig(format!(
                    "{} steps are scheduled by the parallel executor",
                    step.step_type()
                ))))
            }
        }
    }

    async fn execute_action(
        &self,
        step: &WorkflowStep,
        ctx: &ExecutionContext,
        plugin: &str,
        action: &str,
        params: &Value,
    ) -> StepResult<StepOutput> {
        let fail = |kind: StepErrorKind| StepExecutionError::new(&step.id, kind);

        let params = ctx.resolve_value(params).map_err(|e| fail(e.into()))?;
        let reserved = self.budget.begin_generation(&step.id).map_err(fail)?;

        let response = match self.plugins.invoke(plugin, action, &params).await {
            Ok(response) => response,
            Err(e) => {
                self.budget.settle_generation(&step.id, reserved, None);
                return Err(fail(StepErrorKind::Plugin(e.to_string())));
            }
        };

        let status = self
            .budget
            .settle_generation(&step.id, reserved, response.tokens_used());
        if let UsageStatus::Exhausted { used, limit } = status {
            warn!(used, limit, "Step exhausted its token budget");
        }

        Ok(StepOutput::with_metadata(
            response.data,
            json!({
                "plugin": plugin,
                "action": action,
                "plugin_metadata": response.metadata,
            }),
        ))
    }

    async fn execute_approval(
        &self,
        step: &WorkflowStep,
        ctx: &ExecutionContext,
    ) -> StepResult<StepOutput> {
        let fail = |kind: StepErrorKind| StepExecutionError::new(&step.id, kind);
        let StepKind::Approval {
            approvers,
            approval_type,
            timeout_seconds,
            timeout_action,
            escalation_targets,
            message,
        } = &step.kind
        else {
            return Err(fail(StepErrorKind::InvalidConfig("not an approval step".into())));
        };

        let message = match message {
            Some(m) => Some(conditions::stringify(
                &ctx.resolve(m).map_err(|e| fail(e.into()))?,
            )),
            None => None,
        };

        let spec = ApprovalSpec {
            step_id: step.id.clone(),
            approvers: approvers.clone(),
            approval_type: *approval_type,
            timeout_seconds: timeout_seconds.unwrap_or(self.default_approval_timeout),
            timeout_action: *timeout_action,
            escalation_targets: escalation_targets.clone(),
            message,
        };

        let request_id = self
            .approvals
            .create_request(spec, Utc::now())
            .map_err(|e| fail(StepErrorKind::ApprovalFailed(e.to_string())))?;
        let request = self
            .approvals
            .wait_for_decision(&request_id)
            .await
            .map_err(|e| fail(StepErrorKind::ApprovalFailed(e.to_string())))?;

        let timed_out = request
            .history
            .iter()
            .any(|t| t.to == ApprovalStatus::Timeout);

        match request.status {
            ApprovalStatus::Approved | ApprovalStatus::AutoApproved => Ok(StepOutput::with_metadata(
                json!({
                    "request_id": request.id,
                    "status": request.status,
                    "approved": true,
                    "responses": request.responses,
                }),
                json!({"escalated": request.escalated}),
            )),
            ApprovalStatus::Rejected | ApprovalStatus::AutoRejected => {
                Err(fail(StepErrorKind::ApprovalRejected))
            }
            ApprovalStatus::Failed if timed_out => Err(fail(StepErrorKind::ApprovalTimeout)),
            other => Err(fail(StepErrorKind::ApprovalFailed(format!(
                "request '{}' ended in '{}'",
                request.id, other
            )))),
        }
    }

    /// Evaluate a conditional step's predicates.
    pub fn evaluate_conditional(
        &self,
        step: &WorkflowStep,
        ctx: &ExecutionContext,
    ) -> StepResult<bool> {
        let fail = |kind: StepErrorKind| StepExecutionError::new(&step.id, kind);
        let StepKind::Conditional {
            conditions: predicates,
            combine_with,
            ..
        } = &step.kind
        else {
            return Err(fail(StepErrorKind::InvalidConfig("not a conditional step".into())));
        };

        let results = predicates
            .iter()
            .map(|p| {
                let left = ctx.resolve_value(&p.left).map_err(|e| fail(e.into()))?;
                let right = ctx.resolve_value(&p.right).map_err(|e| fail(e.into()))?;
                conditions::evaluate(&left, p.operator, &right).map_err(fail)
            })
            .collect::<StepResult<Vec<bool>>>()?;

        Ok(conditions::combine(results, *combine_with))
    }
}
