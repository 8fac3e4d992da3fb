//! Approval request types and quorum rules.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How many approvers must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    /// First approval wins; rejected only once everyone has rejected
    #[default]
    Any,
    /// Every approver must approve; one rejection rejects
    All,
    /// Strictly more than half must approve
    Majority,
}

/// What happens when the approval window closes without a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    AutoApprove,
    AutoReject,
    Escalate,
    #[default]
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Requested,
    Approved,
    Rejected,
    Timeout,
    Escalated,
    AutoApproved,
    AutoRejected,
    Failed,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApprovalStatus::Approved
                | ApprovalStatus::Rejected
                | ApprovalStatus::AutoApproved
                | ApprovalStatus::AutoRejected
                | ApprovalStatus::Failed
        )
    }

    /// Whether the step guarded by this request may proceed.
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalStatus::Approved | ApprovalStatus::AutoApproved)
    }

    /// Whether responses are still accepted.
    pub fn is_open(&self) -> bool {
        matches!(self, ApprovalStatus::Requested | ApprovalStatus::Escalated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Requested => "requested",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Timeout => "timeout",
            ApprovalStatus::Escalated => "escalated",
            ApprovalStatus::AutoApproved => "auto_approved",
            ApprovalStatus::AutoRejected => "auto_rejected",
            ApprovalStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approver: String,
    pub decision: Decision,
    #[serde(default)]
    pub comment: Option<String>,
    pub responded_at: DateTime<Utc>,
}

/// One status change, kept for the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: ApprovalStatus,
    pub to: ApprovalStatus,
    pub at: DateTime<Utc>,
}

/// Parameters for a new approval request.
#[derive(Debug, Clone)]
pub struct ApprovalSpec {
    pub step_id: String,
    pub approvers: Vec<String>,
    pub approval_type: ApprovalType,
    pub timeout_seconds: u64,
    pub timeout_action: TimeoutAction,
    pub escalation_targets: Vec<String>,
    pub message: Option<String>,
}

/// A human-in-the-loop approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub step_id: String,
    pub approvers: Vec<String>,
    pub approval_type: ApprovalType,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub timeout_seconds: u64,
    pub timeout_action: TimeoutAction,
    pub escalation_targets: Vec<String>,
    /// Set once the approver set has been replaced; never reset
    pub escalated: bool,
    pub responses: Vec<ApprovalResponse>,
    #[serde(default)]
    pub message: Option<String>,
    pub history: Vec<StatusTransition>,
}

impl ApprovalRequest {
    pub fn new(id: String, spec: ApprovalSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            step_id: spec.step_id,
            approvers: spec.approvers,
            approval_type: spec.approval_type,
            status: ApprovalStatus::Requested,
            created_at: now,
            timeout_at: now + window(spec.timeout_seconds),
            timeout_seconds: spec.timeout_seconds,
            timeout_action: spec.timeout_action,
            escalation_targets: spec.escalation_targets,
            escalated: false,
            responses: Vec::new(),
            message: spec.message,
            history: Vec::new(),
        }
    }

    pub(crate) fn transition(&mut self, to: ApprovalStatus, at: DateTime<Utc>) {
        self.history.push(StatusTransition {
            from: self.status,
            to,
            at,
        });
        self.status = to;
    }

    /// Replace approvers with escalation targets and restart the window.
    pub(crate) fn escalate(&mut self, now: DateTime<Utc>) {
        self.approvers = std::mem::take(&mut self.escalation_targets);
        self.responses.clear();
        self.escalated = true;
        self.timeout_at = now + window(self.timeout_seconds);
        self.transition(ApprovalStatus::Escalated, now);
    }

    pub fn approvals(&self) -> usize {
        self.count(Decision::Approve)
    }

    pub fn rejections(&self) -> usize {
        self.count(Decision::Reject)
    }

    fn count(&self, decision: Decision) -> usize {
        self.responses
            .iter()
            .filter(|r| r.decision == decision)
            .count()
    }

    /// Evaluate the quorum against accumulated responses.
    ///
    /// Returns the terminal status once one is decided.
    pub fn evaluate_quorum(&self) -> Option<ApprovalStatus> {
        let total = self.approvers.len();
        let approvals = self.approvals();
        let rejections = self.rejections();
        let remaining = total.saturating_sub(approvals + rejections);

        match self.approval_type {
            ApprovalType::Any => {
                if approvals >= 1 {
                    Some(ApprovalStatus::Approved)
                } else if total > 0 && rejections >= total {
                    Some(ApprovalStatus::Rejected)
                } else {
                    None
                }
            }
            ApprovalType::All => {
                if rejections >= 1 {
                    Some(ApprovalStatus::Rejected)
                } else if total > 0 && approvals >= total {
                    Some(ApprovalStatus::Approved)
                } else {
                    None
                }
            }
            ApprovalType::Majority => {
                let needed = total / 2 + 1;
                if approvals >= needed {
                    Some(ApprovalStatus::Approved)
                } else if approvals + remaining < needed {
                    Some(ApprovalStatus::Rejected)
                } else {
                    None
                }
            }
        }
    }
}

/// Ten years; longer windows are clamped.
const MAX_WINDOW_SECONDS: u64 = 315_360_000;

fn window(seconds: u64) -> Duration {
    Duration::seconds(seconds.min(MAX_WINDOW_SECONDS) as i64)
}
