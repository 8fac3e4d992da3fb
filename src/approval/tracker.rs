//! Approval state machine.
//!
//! Every transition for every request goes through one mutex, so a response
//! racing a timeout check (or another response) can never produce two
//! terminal transitions. Waiters are woken through a per-request watch
//! channel.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{
    ApprovalRequest, ApprovalResponse, ApprovalSpec, ApprovalStatus, Decision, TimeoutAction,
};
use crate::error::{Error, Result};
use crate::events::{EventSink, RunEvent};

struct ActiveRequest {
    request: ApprovalRequest,
    notify: watch::Sender<ApprovalStatus>,
}

#[derive(Default)]
struct TrackerState {
    active: HashMap<String, ActiveRequest>,
    archive: HashMap<String, ApprovalRequest>,
}

/// Tracks approval requests for one run.
pub struct ApprovalTracker {
    state: Mutex<TrackerState>,
    events: EventSink,
}

impl ApprovalTracker {
    pub fn new(events: EventSink) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a new request in `requested` state.
    pub fn create_request(&self, spec: ApprovalSpec, now: DateTime<Utc>) -> Result<String> {
        if spec.approvers.is_empty() {
            return Err(Error::ApprovalFailed(format!(
                "approval for step '{}' has no approvers",
                spec.step_id
            )));
        }

        let id = Uuid::new_v4().to_string();
        let request = ApprovalRequest::new(id.clone(), spec, now);
        let (notify, _) = watch::channel(ApprovalStatus::Requested);

        info!(
            request_id = %id,
            step_id = %request.step_id,
            approvers = ?request.approvers,
            "Approval requested"
        );
        self.events.emit(RunEvent::ApprovalRequested {
            request_id: id.clone(),
            step_id: request.step_id.clone(),
            approvers: request.approvers.clone(),
        });

        self.lock()
            .active
            .insert(id.clone(), ActiveRequest { request, notify });
        Ok(id)
    }

    /// Record one approver's decision and re-evaluate the quorum.
    pub fn respond(
        &self,
        request_id: &str,
        approver: &str,
        decision: Decision,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalStatus> {
        let mut state = self.lock();

        let Some(active) = state.active.get_mut(request_id) else {
            return match state.archive.get(request_id) {
                Some(done) => Err(Error::ApprovalFailed(format!(
                    "request '{}' is already {}",
                    request_id, done.status
                ))),
                None => Err(Error::ApprovalFailed(format!(
                    "unknown approval request '{}'",
                    request_id
                ))),
            };
        };

        let request = &mut active.request;
        if !request.status.is_open() {
            return Err(Error::ApprovalFailed(format!(
                "request '{}' is {} and no longer accepts responses",
                request_id, request.status
            )));
        }
        if !request.approvers.iter().any(|a| a == approver) {
            return Err(Error::ApprovalFailed(format!(
                "'{}' is not an approver for request '{}'",
                approver, request_id
            )));
        }
        if request.responses.iter().any(|r| r.approver == approver) {
            return Err(Error::ApprovalFailed(format!(
                "'{}' has already responded to request '{}'",
                approver, request_id
            )));
        }

        request.responses.push(ApprovalResponse {
            approver: approver.to_string(),
            decision,
            comment,
            responded_at: now,
        });
        debug!(
            request_id,
            approver,
            approvals = request.approvals(),
            rejections = request.rejections(),
            "Approval response recorded"
        );

        match request.evaluate_quorum() {
            Some(outcome) => {
                self.finalize(&mut state, request_id, outcome, now);
                Ok(outcome)
            }
            None => Ok(request.status),
        }
    }

    /// Apply timeout actions to every open request whose window has closed.
    ///
    /// Returns the transitions that happened. Escalation happens at most
    /// once per request; a second expiry fails the request.
    pub fn check_timeouts(&self, now: DateTime<Utc>) -> Vec<(String, ApprovalStatus)> {
        let mut state = self.lock();

        let expired: Vec<String> = state
            .active
            .iter()
            .filter(|(_, a)| a.request.status.is_open() && now >= a.request.timeout_at)
            .map(|(id, _)| id.clone())
            .collect();

        let mut transitions = Vec::new();
        for id in expired {
            let Some(active) = state.active.get_mut(&id) else {
                continue;
            };
            let request = &mut active.request;
            request.transition(ApprovalStatus::Timeout, now);
            warn!(request_id = %id, step_id = %request.step_id, "Approval window expired");

            let outcome = match request.timeout_action {
                TimeoutAction::AutoApprove => ApprovalStatus::AutoApproved,
                TimeoutAction::AutoReject => ApprovalStatus::AutoRejected,
                TimeoutAction::Fail => ApprovalStatus::Failed,
                TimeoutAction::Escalate => {
                    if !request.escalated && !request.escalation_targets.is_empty() {
                        request.escalate(now);
                        info!(
                            request_id = %id,
                            approvers = ?request.approvers,
                            "Approval escalated"
                        );
                        let _ = active.notify.send(ApprovalStatus::Escalated);
                        self.events.emit(RunEvent::ApprovalRequested {
                            request_id: id.clone(),
                            step_id: active.request.step_id.clone(),
                            approvers: active.request.approvers.clone(),
                        });
                        transitions.push((id, ApprovalStatus::Escalated));
                        continue;
                    }
                    ApprovalStatus::Failed
                }
            };

            self.finalize(&mut state, &id, outcome, now);
            transitions.push((id, outcome));
        }
        transitions
    }

    /// Move a request to a terminal status and archive it.
    fn finalize(
        &self,
        state: &mut TrackerState,
        request_id: &str,
        outcome: ApprovalStatus,
        now: DateTime<Utc>,
    ) {
        let Some(mut active) = state.active.remove(request_id) else {
            return;
        };
        active.request.transition(outcome, now);
        let _ = active.notify.send(outcome);

        info!(
            request_id,
            step_id = %active.request.step_id,
            status = %outcome,
            "Approval resolved"
        );
        self.events.emit(RunEvent::ApprovalResolved {
            request_id: request_id.to_string(),
            step_id: active.request.step_id.clone(),
            status: outcome.to_string(),
        });
        state
            .archive
            .insert(request_id.to_string(), active.request);
    }

    /// Suspend until the request reaches a terminal status.
    ///
    /// The waiter drives its own deadline: when the window closes it runs
    /// the timeout check itself, so no external timer is needed.
    pub async fn wait_for_decision(&self, request_id: &str) -> Result<ApprovalRequest> {
        loop {
            let (mut rx, deadline) = {
                let state = self.lock();
                if let Some(done) = state.archive.get(request_id) {
                    return Ok(done.clone());
                }
                let active = state.active.get(request_id).ok_or_else(|| {
                    Error::ApprovalFailed(format!("unknown approval request '{}'", request_id))
                })?;
                (active.notify.subscribe(), active.request.timeout_at)
            };

            let wait = (deadline - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);

            tokio::select! {
                _ = rx.changed() => {}
                _ = tokio::time::sleep(wait) => {
                    self.check_timeouts(Utc::now());
                }
            }
        }
    }

    pub fn status(&self, request_id: &str) -> Option<ApprovalStatus> {
        let state = self.lock();
        state
            .active
            .get(request_id)
            .map(|a| a.request.status)
            .or_else(|| state.archive.get(request_id).map(|r| r.status))
    }

    pub fn get(&self, request_id: &str) -> Option<ApprovalRequest> {
        let state = self.lock();
        state
            .active
            .get(request_id)
            .map(|a| a.request.clone())
            .or_else(|| state.archive.get(request_id).cloned())
    }

    pub fn pending(&self) -> Vec<ApprovalRequest> {
        self.lock()
            .active
            .values()
            .map(|a| a.request.clone())
            .collect()
    }

    /// Number of requests that reached a terminal status.
    pub fn resolved_count(&self) -> usize {
        self.lock().archive.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalType;
    use chrono::Duration;
    use std::sync::Arc;

    fn spec(approval_type: ApprovalType, approvers: &[&str]) -> ApprovalSpec {
        ApprovalSpec {
            step_id: "step4".to_string(),
            approvers: approvers.iter().map(|s| s.to_string()).collect(),
            approval_type,
            timeout_seconds: 60,
            timeout_action: TimeoutAction::Fail,
            escalation_targets: vec![],
            message: Some("Send the refunds?".to_string()),
        }
    }

    #[test]
    fn test_majority_two_approve_one_reject() {
        let tracker = ApprovalTracker::new(EventSink::new());
        let now = Utc::now();
        let id = tracker
            .create_request(spec(ApprovalType::Majority, &["ana", "ben", "cy"]), now)
            .unwrap();

        assert_eq!(
            tracker.respond(&id, "ana", Decision::Approve, None, now).unwrap(),
            ApprovalStatus::Requested
        );
        assert_eq!(
            tracker.respond(&id, "ben", Decision::Reject, None, now).unwrap(),
            ApprovalStatus::Requested
        );
        assert_eq!(
            tracker.respond(&id, "cy", Decision::Approve, None, now).unwrap(),
            ApprovalStatus::Approved
        );
        assert_eq!(tracker.status(&id), Some(ApprovalStatus::Approved));
        assert_eq!(tracker.resolved_count(), 1);
    }

    #[test]
    fn test_response_after_resolution_is_rejected() {
        let tracker = ApprovalTracker::new(EventSink::new());
        let now = Utc::now();
        let id = tracker
            .create_request(spec(ApprovalType::Any, &["ana", "ben"]), now)
            .unwrap();

        tracker.respond(&id, "ana", Decision::Approve, None, now).unwrap();
        let err = tracker
            .respond(&id, "ben", Decision::Reject, None, now)
            .unwrap_err();
        assert!(err.to_string().contains("already approved"));
    }

    #[test]
    fn test_unknown_and_duplicate_approvers() {
        let tracker = ApprovalTracker::new(EventSink::new());
        let now = Utc::now();
        let id = tracker
            .create_request(spec(ApprovalType::All, &["ana", "ben"]), now)
            .unwrap();

        assert!(tracker
            .respond(&id, "mallory", Decision::Approve, None, now)
            .is_err());
        tracker.respond(&id, "ana", Decision::Approve, None, now).unwrap();
        assert!(tracker
            .respond(&id, "ana", Decision::Approve, None, now)
            .is_err());
    }

    #[test]
    fn test_escalation_happens_exactly_once() {
        let tracker = ApprovalTracker::new(EventSink::new());
        let now = Utc::now();
        let mut s = spec(ApprovalType::Any, &["ana"]);
        s.timeout_action = TimeoutAction::Escalate;
        s.escalation_targets = vec!["lead".to_string(), "director".to_string()];
        let id = tracker.create_request(s, now).unwrap();

        let first = now + Duration::seconds(61);
        assert_eq!(
            tracker.check_timeouts(first),
            vec![(id.clone(), ApprovalStatus::Escalated)]
        );

        // Subsequent checks inside the restarted window do nothing.
        assert!(tracker.check_timeouts(first + Duration::seconds(1)).is_empty());
        assert!(tracker.check_timeouts(first + Duration::seconds(30)).is_empty());

        let request = tracker.get(&id).unwrap();
        assert_eq!(request.status, ApprovalStatus::Escalated);
        assert_eq!(request.approvers, vec!["lead", "director"]);
        let escalations = request
            .history
            .iter()
            .filter(|t| t.to == ApprovalStatus::Escalated)
            .count();
        assert_eq!(escalations, 1);

        // Second expiry fails instead of escalating again.
        assert_eq!(
            tracker.check_timeouts(first + Duration::seconds(61)),
            vec![(id.clone(), ApprovalStatus::Failed)]
        );
    }

    #[test]
    fn test_escalate_without_targets_fails() {
        let tracker = ApprovalTracker::new(EventSink::new());
        let now = Utc::now();
        let mut s = spec(ApprovalType::Any, &["ana"]);
        s.timeout_action = TimeoutAction::Escalate;
        let id = tracker.create_request(s, now).unwrap();

        let transitions = tracker.check_timeouts(now + Duration::seconds(120));
        assert_eq!(transitions, vec![(id, ApprovalStatus::Failed)]);
    }

    #[test]
    fn test_escalated_request_accepts_new_approvers() {
        let tracker = ApprovalTracker::new(EventSink::new());
        let now = Utc::now();
        let mut s = spec(ApprovalType::Any, &["ana"]);
        s.timeout_action = TimeoutAction::Escalate;
        s.escalation_targets = vec!["lead".to_string()];
        let id = tracker.create_request(s, now).unwrap();
        tracker.check_timeouts(now + Duration::seconds(61));

        assert!(tracker.respond(&id, "ana", Decision::Approve, None, now).is_err());
        assert_eq!(
            tracker.respond(&id, "lead", Decision::Approve, None, now).unwrap(),
            ApprovalStatus::Approved
        );
    }

    #[tokio::test]
    async fn test_wait_for_decision_wakes_on_response() {
        let tracker = Arc::new(ApprovalTracker::new(EventSink::new()));
        let id = tracker
            .create_request(spec(ApprovalType::Any, &["ana"]), Utc::now())
            .unwrap();

        let responder = {
            let tracker = tracker.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                tracker
                    .respond(&id, "ana", Decision::Approve, None, Utc::now())
                    .unwrap();
            })
        };

        let resolved = tracker.wait_for_decision(&id).await.unwrap();
        responder.await.unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_wait_for_decision_drives_timeout() {
        let tracker = ApprovalTracker::new(EventSink::new());
        let mut s = spec(ApprovalType::Any, &["ana"]);
        s.timeout_seconds = 0;
        s.timeout_action = TimeoutAction::AutoApprove;
        let id = tracker.create_request(s, Utc::now()).unwrap();

        let resolved = tracker.wait_for_decision(&id).await.unwrap();
        assert_eq!(resolved.status, ApprovalStatus::AutoApproved);
        let path: Vec<_> = resolved.history.iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![ApprovalStatus::Timeout, ApprovalStatus::AutoApproved]
        );
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let events = EventSink::new();
        let mut rx = events.subscribe();
        let tracker = ApprovalTracker::new(events);
        let now = Utc::now();
        let id = tracker
            .create_request(spec(ApprovalType::Any, &["ana"]), now)
            .unwrap();
        tracker.respond(&id, "ana", Decision::Reject, None, now).unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            RunEvent::ApprovalRequested { .. }
        ));
        match rx.recv().await.unwrap() {
            RunEvent::ApprovalResolved { status, .. } => assert_eq!(status, "rejected"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
