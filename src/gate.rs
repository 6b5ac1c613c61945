//! Execution gate: pause on `request_code_execution`, resume after a human
//! decision.
//!
//! The gate's visible state lives in the run store (the `exec_request`
//! action and the run's `waiting_exec` status). This type only holds what is
//! ephemeral: the single accepted request currently executing in the sandbox,
//! and decisions that were made before their resume token arrived.

use crate::error::GateError;
use crate::store::{Action, ActionKind, ActionStatus, RunStatus, RunStore};
use crate::textutil::tail_by_chars;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

/// Used when the agent did not supply its own rejection text.
pub const DEFAULT_REJECTION_MESSAGE: &str = "User declined to run the code.";
/// Upper bound on rejection text sent with a resume.
pub const REJECTION_RESULT_CAP: usize = 20_000;
/// Upper bound on sandbox output sent with a resume.
pub const SANDBOX_RESULT_CAP: usize = 100_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecDecision {
    Accept,
    Reject,
}

/// Locally held link between an accepted request and its sandbox session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCorrelation {
    pub run_id: String,
    pub action_id: String,
}

/// Everything the transport needs to reopen a paused run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRequest {
    pub run_id: String,
    pub action_id: String,
    pub resume_token: String,
    pub result: String,
}

/// What the caller must do after a gate transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Reopen the subscription now.
    Resume(ResumeRequest),
    /// Start a sandbox session from current files; report back via
    /// [`ExecutionGate::sandbox_finished`] / [`ExecutionGate::sandbox_failed`].
    StartSandbox(ExecCorrelation),
    /// Decision recorded; the resume fires once the token is attached.
    AwaitingToken(ExecCorrelation),
}

impl GateOutcome {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Resume(request) => &request.run_id,
            Self::StartSandbox(correlation) | Self::AwaitingToken(correlation) => {
                &correlation.run_id
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecutionGate {
    in_flight: Option<ExecCorrelation>,
    /// `(run_id, action_id) -> result` for decisions waiting on a token.
    deferred: HashMap<(String, String), String>,
}

impl ExecutionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepted request currently owning the sandbox.
    pub fn in_flight(&self) -> Option<&ExecCorrelation> {
        self.in_flight.as_ref()
    }

    pub fn has_deferred(&self, run_id: &str, action_id: &str) -> bool {
        self.deferred
            .contains_key(&(run_id.to_string(), action_id.to_string()))
    }

    /// Apply a human decision to the run's single running exec request.
    pub fn decide(
        &mut self,
        store: &mut RunStore,
        run_id: &str,
        action_id: &str,
        decision: ExecDecision,
    ) -> Result<GateOutcome, GateError> {
        let run = store
            .run(run_id)
            .ok_or_else(|| GateError::UnknownRun(run_id.to_string()))?;
        let not_awaiting = || GateError::NotAwaitingDecision {
            run_id: run_id.to_string(),
            action_id: action_id.to_string(),
        };
        if run.status.is_terminal() {
            return Err(not_awaiting());
        }
        let action = run.action(action_id).ok_or_else(not_awaiting)?;
        let ActionKind::ExecRequest {
            response_on_reject, ..
        } = &action.kind
        else {
            return Err(not_awaiting());
        };
        if action.status != ActionStatus::Running {
            return Err(not_awaiting());
        }
        let response_on_reject = response_on_reject.clone();

        match decision {
            ExecDecision::Reject => {
                let message = response_on_reject
                    .filter(|text| !text.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_REJECTION_MESSAGE.to_string());
                store.add_action(
                    run_id,
                    Action::new(
                        format!("{action_id}-rejected"),
                        ActionStatus::Done,
                        ActionKind::SystemNotice {
                            message: message.clone(),
                        },
                    ),
                );
                store.update_action(run_id, action_id, |existing| {
                    let mut next = existing.cloned().unwrap_or_else(|| exec_placeholder(action_id));
                    next.status = ActionStatus::Failed;
                    next.merge_metadata("decision", json!("rejected"));
                    next
                });
                store.set_run_status(run_id, RunStatus::Streaming);
                tracing::info!(run_id, action_id, "exec request rejected");

                let result = tail_by_chars(&message, REJECTION_RESULT_CAP).to_string();
                Ok(self.resume_or_defer(store, run_id, action_id, result))
            }
            ExecDecision::Accept => {
                if let Some(busy) = &self.in_flight {
                    return Err(GateError::SandboxBusy {
                        run_id: busy.run_id.clone(),
                        action_id: busy.action_id.clone(),
                    });
                }
                store.update_action(run_id, action_id, |existing| {
                    let mut next = existing.cloned().unwrap_or_else(|| exec_placeholder(action_id));
                    next.merge_metadata("decision", json!("accepted"));
                    next
                });
                let correlation = ExecCorrelation {
                    run_id: run_id.to_string(),
                    action_id: action_id.to_string(),
                };
                self.in_flight = Some(correlation.clone());
                tracing::info!(run_id, action_id, "exec request accepted; starting sandbox");
                Ok(GateOutcome::StartSandbox(correlation))
            }
        }
    }

    /// The correlated sandbox reached `done`. Records the capped output and
    /// returns the resume (or defers it until the token arrives).
    pub fn sandbox_finished(
        &mut self,
        store: &mut RunStore,
        logs: &str,
        exit_code: Option<i64>,
    ) -> Option<GateOutcome> {
        let correlation = self.in_flight.take()?;
        let ExecCorrelation { run_id, action_id } = &correlation;
        if store.run(run_id).map_or(true, |run| run.status.is_terminal()) {
            tracing::debug!(run_id = %run_id, action_id = %action_id, "run ended before sandbox finished");
            return None;
        }

        let output = if logs.is_empty() {
            match exit_code {
                Some(code) => format!("(no output; exit code {code})"),
                None => "(no output)".to_string(),
            }
        } else {
            tail_by_chars(logs, SANDBOX_RESULT_CAP).to_string()
        };

        store.add_action(
            run_id,
            Action::new(
                format!("{action_id}-result"),
                ActionStatus::Done,
                ActionKind::ExecResult {
                    output: output.clone(),
                },
            ),
        );
        store.update_action(run_id, action_id, |existing| {
            let mut next = existing.cloned().unwrap_or_else(|| exec_placeholder(action_id));
            next.status = ActionStatus::Done;
            next.merge_metadata("exit_code", json!(exit_code));
            next
        });
        store.set_run_status(run_id, RunStatus::Streaming);
        Some(self.resume_or_defer(store, run_id, action_id, output))
    }

    /// The correlated sandbox failed. The request stays `running` so the user
    /// can accept again.
    pub fn sandbox_failed(&mut self, store: &mut RunStore, error: &str) -> Option<ExecCorrelation> {
        let correlation = self.in_flight.take()?;
        store.update_action(&correlation.run_id, &correlation.action_id, |existing| {
            let mut next = existing
                .cloned()
                .unwrap_or_else(|| exec_placeholder(&correlation.action_id));
            next.merge_metadata("sandbox_error", json!(error));
            next
        });
        tracing::warn!(
            run_id = %correlation.run_id,
            action_id = %correlation.action_id,
            error,
            "sandbox failed; exec request left pending"
        );
        Some(correlation)
    }

    /// Fire a deferred resume once the reducer attached the token.
    pub fn token_attached(
        &mut self,
        store: &RunStore,
        run_id: &str,
        action_id: &str,
    ) -> Option<ResumeRequest> {
        let key = (run_id.to_string(), action_id.to_string());
        let token = store.action(run_id, action_id)?.resume_token()?.to_string();
        let result = self.deferred.remove(&key)?;
        Some(ResumeRequest {
            run_id: run_id.to_string(),
            action_id: action_id.to_string(),
            resume_token: token,
            result,
        })
    }

    /// Forget everything held for a cancelled or discarded run.
    pub fn cancel_run(&mut self, run_id: &str) -> bool {
        let mut dropped = false;
        if self.in_flight.as_ref().is_some_and(|c| c.run_id == run_id) {
            self.in_flight = None;
            dropped = true;
        }
        let before = self.deferred.len();
        self.deferred.retain(|(run, _), _| run != run_id);
        dropped || before != self.deferred.len()
    }

    pub fn reset(&mut self) {
        self.in_flight = None;
        self.deferred.clear();
    }

    fn resume_or_defer(
        &mut self,
        store: &RunStore,
        run_id: &str,
        action_id: &str,
        result: String,
    ) -> GateOutcome {
        match store
            .action(run_id, action_id)
            .and_then(Action::resume_token)
        {
            Some(token) => GateOutcome::Resume(ResumeRequest {
                run_id: run_id.to_string(),
                action_id: action_id.to_string(),
                resume_token: token.to_string(),
                result,
            }),
            None => {
                tracing::debug!(run_id, action_id, "resume deferred until token arrives");
                self.deferred
                    .insert((run_id.to_string(), action_id.to_string()), result);
                GateOutcome::AwaitingToken(ExecCorrelation {
                    run_id: run_id.to_string(),
                    action_id: action_id.to_string(),
                })
            }
        }
    }
}

fn exec_placeholder(action_id: &str) -> Action {
    Action::new(
        action_id,
        ActionStatus::Running,
        ActionKind::ExecRequest {
            response_on_reject: None,
            resume_token: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_store(reject_text: Option<&str>, token: Option<&str>) -> RunStore {
        let mut store = RunStore::new();
        store.create_run("r1", "run it", "p1", "t1");
        store.add_action(
            "r1",
            Action::new(
                "ex_1",
                ActionStatus::Running,
                ActionKind::ExecRequest {
                    response_on_reject: reject_text.map(ToString::to_string),
                    resume_token: token.map(ToString::to_string),
                },
            ),
        );
        store.set_run_status("r1", RunStatus::WaitingExec);
        store
    }

    fn attach_token(store: &mut RunStore, token: &str) {
        store.update_action("r1", "ex_1", |a| {
            let mut next = a.cloned().unwrap();
            if let ActionKind::ExecRequest { resume_token, .. } = &mut next.kind {
                *resume_token = Some(token.to_string());
            }
            next
        });
    }

    #[test]
    fn reject_appends_notice_fails_request_and_resumes() {
        let mut store = pending_store(Some("declined"), Some("tok"));
        let mut gate = ExecutionGate::new();
        let outcome = gate
            .decide(&mut store, "r1", "ex_1", ExecDecision::Reject)
            .expect("decision");
        assert_eq!(
            outcome,
            GateOutcome::Resume(ResumeRequest {
                run_id: "r1".into(),
                action_id: "ex_1".into(),
                resume_token: "tok".into(),
                result: "declined".into(),
            })
        );
        assert_eq!(
            store.action("r1", "ex_1-rejected").unwrap().kind,
            ActionKind::SystemNotice {
                message: "declined".into()
            }
        );
        assert_eq!(store.action("r1", "ex_1").unwrap().status, ActionStatus::Failed);
        assert_eq!(store.run("r1").unwrap().status, RunStatus::Streaming);
    }

    #[test]
    fn reject_uses_default_text_and_caps_result() {
        let mut store = pending_store(None, Some("tok"));
        let mut gate = ExecutionGate::new();
        let GateOutcome::Resume(resume) = gate
            .decide(&mut store, "r1", "ex_1", ExecDecision::Reject)
            .unwrap()
        else {
            panic!("expected resume");
        };
        assert_eq!(resume.result, DEFAULT_REJECTION_MESSAGE);

        let long = "x".repeat(REJECTION_RESULT_CAP + 50);
        let mut store = pending_store(Some(&long), Some("tok"));
        let GateOutcome::Resume(resume) = gate
            .decide(&mut store, "r1", "ex_1", ExecDecision::Reject)
            .unwrap()
        else {
            panic!("expected resume");
        };
        assert_eq!(resume.result.chars().count(), REJECTION_RESULT_CAP);
    }

    #[test]
    fn decisions_keep_existing_metadata() {
        let mut store = pending_store(None, Some("tok"));
        store.update_action("r1", "ex_1", |a| {
            let mut next = a.cloned().unwrap();
            next.merge_metadata("result", json!("queued"));
            next
        });
        let mut gate = ExecutionGate::new();
        gate.decide(&mut store, "r1", "ex_1", ExecDecision::Accept).unwrap();
        gate.sandbox_finished(&mut store, "ok", Some(0)).unwrap();
        let metadata = store.action("r1", "ex_1").unwrap().metadata.clone().unwrap();
        assert_eq!(metadata["result"], json!("queued"));
        assert_eq!(metadata["decision"], json!("accepted"));
        assert_eq!(metadata["exit_code"], json!(0));
    }

    #[test]
    fn second_decision_is_refused() {
        let mut store = pending_store(None, Some("tok"));
        let mut gate = ExecutionGate::new();
        gate.decide(&mut store, "r1", "ex_1", ExecDecision::Reject).unwrap();
        let err = gate
            .decide(&mut store, "r1", "ex_1", ExecDecision::Accept)
            .unwrap_err();
        assert!(matches!(err, GateError::NotAwaitingDecision { .. }));
        assert_eq!(
            gate.decide(&mut store, "nope", "ex_1", ExecDecision::Accept),
            Err(GateError::UnknownRun("nope".into()))
        );
    }

    #[test]
    fn accept_then_done_records_capped_result_and_resumes() {
        let mut store = pending_store(None, Some("tok"));
        let mut gate = ExecutionGate::new();
        let outcome = gate
            .decide(&mut store, "r1", "ex_1", ExecDecision::Accept)
            .unwrap();
        assert!(matches!(outcome, GateOutcome::StartSandbox(_)));
        assert_eq!(store.action("r1", "ex_1").unwrap().status, ActionStatus::Running);

        let logs = format!("{}{}", "a".repeat(50_000), "b".repeat(100_000));
        let Some(GateOutcome::Resume(resume)) = gate.sandbox_finished(&mut store, &logs, Some(0))
        else {
            panic!("expected resume");
        };
        assert_eq!(resume.result.chars().count(), SANDBOX_RESULT_CAP);
        assert!(resume.result.chars().all(|c| c == 'b'));
        assert_eq!(
            store.action("r1", "ex_1-result").unwrap().kind,
            ActionKind::ExecResult {
                output: resume.result.clone()
            }
        );
        assert_eq!(store.action("r1", "ex_1").unwrap().status, ActionStatus::Done);
        assert!(gate.in_flight().is_none());
    }

    #[test]
    fn concurrent_acceptance_is_busy() {
        let mut store = pending_store(None, Some("tok"));
        store.create_run("r2", "other", "p1", "t1");
        store.add_action(
            "r2",
            Action::new(
                "ex_9",
                ActionStatus::Running,
                ActionKind::ExecRequest {
                    response_on_reject: None,
                    resume_token: None,
                },
            ),
        );
        let mut gate = ExecutionGate::new();
        gate.decide(&mut store, "r1", "ex_1", ExecDecision::Accept).unwrap();
        let err = gate
            .decide(&mut store, "r2", "ex_9", ExecDecision::Accept)
            .unwrap_err();
        assert!(matches!(err, GateError::SandboxBusy { ref action_id, .. } if action_id == "ex_1"));
    }

    #[test]
    fn sandbox_error_leaves_request_pending_for_retry() {
        let mut store = pending_store(None, Some("tok"));
        let mut gate = ExecutionGate::new();
        gate.decide(&mut store, "r1", "ex_1", ExecDecision::Accept).unwrap();
        assert!(gate.sandbox_failed(&mut store, "boot timeout").is_some());
        assert!(gate.in_flight().is_none());
        assert_eq!(store.action("r1", "ex_1").unwrap().status, ActionStatus::Running);
        assert_eq!(store.run("r1").unwrap().status, RunStatus::WaitingExec);
        // Retry is allowed.
        assert!(matches!(
            gate.decide(&mut store, "r1", "ex_1", ExecDecision::Accept),
            Ok(GateOutcome::StartSandbox(_))
        ));
    }

    #[test]
    fn decision_before_token_is_deferred() {
        let mut store = pending_store(Some("no thanks"), None);
        let mut gate = ExecutionGate::new();
        let outcome = gate
            .decide(&mut store, "r1", "ex_1", ExecDecision::Reject)
            .unwrap();
        assert!(matches!(outcome, GateOutcome::AwaitingToken(_)));
        assert!(gate.has_deferred("r1", "ex_1"));
        assert!(gate.token_attached(&store, "r1", "ex_1").is_none());

        attach_token(&mut store, "late-tok");
        let resume = gate.token_attached(&store, "r1", "ex_1").expect("resume fires");
        assert_eq!(resume.resume_token, "late-tok");
        assert_eq!(resume.result, "no thanks");
        assert!(gate.token_attached(&store, "r1", "ex_1").is_none());
    }

    #[test]
    fn cancel_drops_correlation() {
        let mut store = pending_store(None, None);
        let mut gate = ExecutionGate::new();
        gate.decide(&mut store, "r1", "ex_1", ExecDecision::Accept).unwrap();
        assert!(gate.cancel_run("r1"));
        assert!(gate.in_flight().is_none());
        assert!(gate.sandbox_finished(&mut store, "out", Some(0)).is_none());
        assert!(!gate.cancel_run("r1"));
    }
}
