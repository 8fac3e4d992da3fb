//! Lifecycle event sink.
//!
//! Events fan out over a tokio broadcast channel. Emitting never blocks and
//! never fails: with no subscribers, or with a lagging subscriber, events are
//! simply dropped for that receiver.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Maximum number of events buffered per subscriber.
const BROADCAST_CAPACITY: usize = 1024;

/// Lifecycle events emitted during compilation and execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Post-compile parser rewrote the step graph
    AutoFixApplied {
        rule: String,
        description: String,
        before: Value,
        after: Value,
    },
    RunStarted {
        run_id: String,
        step_count: usize,
    },
    StepStarted {
        run_id: String,
        step_id: String,
        step_type: String,
    },
    StepCompleted {
        run_id: String,
        step_id: String,
        duration_ms: i64,
    },
    StepFailed {
        run_id: String,
        step_id: String,
        code: String,
        error: String,
    },
    StepSkipped {
        run_id: String,
        step_id: String,
        reason: String,
    },
    ApprovalRequested {
        request_id: String,
        step_id: String,
        approvers: Vec<String>,
    },
    ApprovalResolved {
        request_id: String,
        step_id: String,
        status: String,
    },
    BudgetOverage {
        step_id: String,
        used: u64,
        limit: u64,
    },
    RunFinished {
        run_id: String,
        status: String,
        duration_ms: i64,
    },
}

/// Fire-and-forget event sink shared by every component of a run.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<RunEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: RunEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn step_started(&self, run_id: &str, step_id: &str, step_type: &str) {
        self.emit(RunEvent::StepStarted {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            step_type: step_type.to_string(),
        });
    }

    pub fn step_completed(&self, run_id: &str, step_id: &str, duration_ms: i64) {
        self.emit(RunEvent::StepCompleted {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            duration_ms,
        });
    }

    pub fn step_failed(&self, run_id: &str, step_id: &str, code: &str, error: &str) {
        self.emit(RunEvent::StepFailed {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            code: code.to_string(),
            error: error.to_string(),
        });
    }

    pub fn step_skipped(&self, run_id: &str, step_id: &str, reason: &str) {
        self.emit(RunEvent::StepSkipped {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn budget_overage(&self, step_id: &str, used: u64, limit: u64) {
        self.emit(RunEvent::BudgetOverage {
            step_id: step_id.to_string(),
            used,
            limit,
        });
    }
}
