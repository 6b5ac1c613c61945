//! Protocol interpreter: folds agent events into the run store.
//!
//! Each message maps to one category of idempotent mutation. Reads used for
//! deduplication go straight to the store, so back-to-back messages for the
//! same run always see each other's effects. Side effects that belong to
//! other components (file tree, preview, gate, UI loading state) are returned
//! as [`ReducerEffect`]s for the caller to route.

mod completion;

use crate::protocol::{tools, AgentEvent, ToolCall};
use crate::store::{Action, ActionKind, ActionStatus, RunStatus, RunStore};
use crate::workspace::{TreeOp, Workspace};
use serde::{Deserialize, Serialize};

/// Fixed action ids for run-level entries, so replays upsert instead of append.
pub const FINAL_ANSWER_ID: &str = "final_answer";
pub const RUN_CANCELLED_ID: &str = "run_cancelled";
pub const RUN_FAILED_ID: &str = "run_failed";

/// Mutable state one reduction step may touch.
pub struct ReducerContext<'a> {
    pub store: &'a mut RunStore,
    /// Workspace of the project the run belongs to.
    pub workspace: &'a mut Workspace,
    /// Run the caller currently treats as active, if it tracks one.
    pub active_run: Option<&'a str>,
}

/// Work for collaborators outside the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "effect")]
pub enum ReducerEffect {
    TreeChanged {
        run_id: String,
        op: TreeOp,
    },
    ProposalAdded {
        run_id: String,
        path: String,
    },
    FileMaterialized {
        run_id: String,
        path: String,
    },
    PreviewUrl {
        run_id: String,
        url: String,
        port: Option<u16>,
        label: Option<String>,
    },
    ExecRequested {
        run_id: String,
        action_id: String,
    },
    /// A resume token reached an exec request; `still_pending` is false when
    /// the human already decided.
    ResumeTokenAttached {
        run_id: String,
        action_id: String,
        still_pending: bool,
    },
    ClearLoading {
        run_id: String,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
    },
}

/// Apply one event addressed to `run_id`.
pub fn apply(ctx: &mut ReducerContext<'_>, run_id: &str, event: &AgentEvent) -> Vec<ReducerEffect> {
    let mut effects = Vec::new();

    let Some(status) = ctx.store.run(run_id).map(|run| run.status) else {
        tracing::debug!(run_id, event_type = event.label(), "dropping event for unknown run");
        return effects;
    };
    if status.is_terminal() {
        tracing::debug!(
            run_id,
            event_type = event.label(),
            status = ?status,
            "dropping late event for finished run"
        );
        return effects;
    }

    match event {
        AgentEvent::ToolStarted { call } if call.name == tools::REQUEST_CODE_EXECUTION => {
            apply_exec_started(ctx, run_id, call, &mut effects);
        }
        AgentEvent::ToolStarted { call } => apply_tool_started(ctx, run_id, call),
        AgentEvent::ToolLog { action_id, chunk } => {
            ctx.store.append_action_log(run_id, action_id, chunk);
        }
        AgentEvent::ToolCompleted { call, output } => {
            completion::apply_completed(ctx, run_id, call, output, &mut effects);
        }
        AgentEvent::ToolFailed { call, error } => apply_tool_failed(ctx, run_id, call, error),
        AgentEvent::AgentOutput { content } => {
            ctx.store.add_action(
                run_id,
                Action::new(
                    FINAL_ANSWER_ID,
                    ActionStatus::Done,
                    ActionKind::FinalAnswer {
                        content: content.clone(),
                    },
                ),
            );
            finish_run(ctx, run_id, ActionStatus::Done, RunStatus::Done, &mut effects);
            if ctx.active_run.map_or(true, |active| active == run_id) {
                effects.push(ReducerEffect::ClearLoading {
                    run_id: run_id.to_string(),
                });
            }
        }
        AgentEvent::RunCancelled { reason } => {
            let message = reason.clone().unwrap_or_else(|| "Run cancelled.".to_string());
            push_notice(ctx, run_id, RUN_CANCELLED_ID, message);
            finish_run(ctx, run_id, ActionStatus::Done, RunStatus::Cancelled, &mut effects);
        }
        AgentEvent::RunFailed { error } => {
            push_notice(ctx, run_id, RUN_FAILED_ID, error.clone());
            finish_run(ctx, run_id, ActionStatus::Failed, RunStatus::Failed, &mut effects);
        }
        AgentEvent::RunLog { message } => {
            tracing::debug!(run_id, message = %crate::textutil::preview_line(message, 200), "run log");
        }
        AgentEvent::Unknown { event_type, reason } => {
            tracing::warn!(run_id, event_type = %event_type, reason = %reason, "dropping unrecognized event");
        }
    }
    effects
}

fn apply_exec_started(
    ctx: &mut ReducerContext<'_>,
    run_id: &str,
    call: &ToolCall,
    effects: &mut Vec<ReducerEffect>,
) {
    let Some(run) = ctx.store.run(run_id) else {
        return;
    };
    if run
        .actions
        .iter()
        .any(|a| a.kind.is_exec_request() && a.id != call.id)
    {
        tracing::debug!(run_id, action_id = %call.id, "dropping second exec request for run");
        return;
    }
    if let Some(existing) = run.action(&call.id) {
        if existing.status != ActionStatus::Running {
            tracing::debug!(run_id, action_id = %call.id, "exec request already decided; ignoring replay");
            return;
        }
    }

    let response_on_reject = call.arg_str("response_on_reject").map(ToString::to_string);
    ctx.store.update_action(run_id, &call.id, |existing| {
        let mut next = Action::new(
            call.id.clone(),
            ActionStatus::Running,
            ActionKind::ExecRequest {
                response_on_reject: response_on_reject.clone(),
                resume_token: None,
            },
        );
        if let Some(prev) = existing {
            next.timestamp_ms = prev.timestamp_ms;
            next.logs = prev.logs.clone();
            next.metadata = prev.metadata.clone();
            if let (
                ActionKind::ExecRequest {
                    response_on_reject: prev_reject,
                    resume_token: prev_token,
                },
                ActionKind::ExecRequest {
                    response_on_reject: reject,
                    resume_token: token,
                },
            ) = (&prev.kind, &mut next.kind)
            {
                if reject.is_none() {
                    *reject = prev_reject.clone();
                }
                *token = prev_token.clone();
            }
        }
        next
    });
    ctx.store.set_run_status(run_id, RunStatus::WaitingExec);
    effects.push(ReducerEffect::ExecRequested {
        run_id: run_id.to_string(),
        action_id: call.id.clone(),
    });
}

fn apply_tool_started(ctx: &mut ReducerContext<'_>, run_id: &str, call: &ToolCall) {
    if let Some(existing) = ctx.store.action(run_id, &call.id) {
        if matches!(existing.status, ActionStatus::Done | ActionStatus::Failed) {
            tracing::debug!(run_id, action_id = %call.id, "tool already resolved; ignoring replayed start");
            return;
        }
    }
    ctx.store.update_action(run_id, &call.id, |existing| {
        let mut next = Action::new(
            call.id.clone(),
            ActionStatus::Running,
            ActionKind::ToolStarted {
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        );
        if let Some(prev) = existing {
            next.timestamp_ms = prev.timestamp_ms;
            next.logs = prev.logs.clone();
            next.metadata = prev.metadata.clone();
        }
        next
    });
    ctx.store.set_run_status(run_id, RunStatus::Streaming);
}

fn apply_tool_failed(ctx: &mut ReducerContext<'_>, run_id: &str, call: &ToolCall, error: &str) {
    if let Some(existing) = ctx.store.action(run_id, &call.id) {
        if existing.kind.is_exec_request() && existing.status != ActionStatus::Running {
            tracing::debug!(run_id, action_id = %call.id, "exec request already decided; ignoring failure");
            return;
        }
        if existing.status == ActionStatus::Done {
            tracing::debug!(run_id, action_id = %call.id, "tool already completed; ignoring late failure");
            return;
        }
    }
    completion::upsert_failed(ctx, run_id, call, error.to_string());
}

fn push_notice(ctx: &mut ReducerContext<'_>, run_id: &str, id: &str, message: String) {
    ctx.store.add_action(
        run_id,
        Action::new(id, ActionStatus::Done, ActionKind::SystemNotice { message }),
    );
}

fn finish_run(
    ctx: &mut ReducerContext<'_>,
    run_id: &str,
    running_to: ActionStatus,
    status: RunStatus,
    effects: &mut Vec<ReducerEffect>,
) {
    let forced = ctx.store.force_running(run_id, running_to);
    if forced > 0 {
        tracing::debug!(run_id, forced, "forced running actions at end of run");
    }
    ctx.store.set_run_status(run_id, status);
    effects.push(ReducerEffect::RunFinished {
        run_id: run_id.to_string(),
        status,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_agent_message;
    use crate::testsupport::{
        agent_output_event, run_cancelled_event, run_failed_event, tool_completed_event,
        tool_failed_event, tool_log_event, tool_started_event,
    };
    use crate::workspace::ProjectState;
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine;
    use serde_json::{json, Value};

    struct Harness {
        store: RunStore,
        workspace: Workspace,
        active: Option<String>,
    }

    impl Harness {
        fn new() -> Self {
            let mut store = RunStore::new();
            store.create_run("r1", "add a /health route", "p1", "t1");
            Self {
                store,
                workspace: Workspace::new(ProjectState::default()),
                active: None,
            }
        }

        fn feed(&mut self, raw: Value) -> Vec<ReducerEffect> {
            let msg = parse_agent_message(&raw);
            let run_id = msg.task_id.clone().unwrap_or_default();
            let mut ctx = ReducerContext {
                store: &mut self.store,
                workspace: &mut self.workspace,
                active_run: self.active.as_deref(),
            };
            apply(&mut ctx, &run_id, &msg.event)
        }

        fn action(&self, id: &str) -> &Action {
            self.store.action("r1", id).expect("action exists")
        }

        fn status(&self) -> RunStatus {
            self.store.run("r1").expect("run exists").status
        }
    }

    #[test]
    fn replayed_start_never_reverts_completed_tool() {
        let mut h = Harness::new();
        h.feed(tool_started_event("r1", "tc_1", "grep", json!({"q": "x"})));
        h.feed(tool_completed_event("r1", "tc_1", "grep", json!({"hits": 2})));
        h.feed(tool_started_event("r1", "tc_1", "grep", json!({"q": "x"})));
        let action = h.action("tc_1");
        assert_eq!(action.status, ActionStatus::Done);
        assert!(matches!(action.kind, ActionKind::ToolCompleted { .. }));
        assert_eq!(h.store.run("r1").unwrap().actions.len(), 1);
    }

    #[test]
    fn completion_before_start_is_kept() {
        let mut h = Harness::new();
        h.feed(tool_completed_event("r1", "tc_1", "grep", json!({"hits": 2})));
        h.feed(tool_started_event("r1", "tc_1", "grep", json!({})));
        assert_eq!(h.action("tc_1").status, ActionStatus::Done);
    }

    #[test]
    fn at_most_one_exec_request_runs_per_run() {
        let mut h = Harness::new();
        let first = h.feed(tool_started_event("r1", "ex_1", "request_code_execution", json!({})));
        let second = h.feed(tool_started_event("r1", "ex_2", "request_code_execution", json!({})));
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        let running = h
            .store
            .run("r1")
            .unwrap()
            .actions
            .iter()
            .filter(|a| a.kind.is_exec_request() && a.status == ActionStatus::Running)
            .count();
        assert_eq!(running, 1);
        assert!(h.store.action("r1", "ex_2").is_none());
        assert_eq!(h.status(), RunStatus::WaitingExec);
    }

    #[test]
    fn decided_exec_request_is_not_reopened() {
        let mut h = Harness::new();
        h.feed(tool_started_event(
            "r1",
            "ex_1",
            "request_code_execution",
            json!({"response_on_reject": "declined"}),
        ));
        h.store.update_action("r1", "ex_1", |a| {
            let mut next = a.cloned().unwrap();
            next.status = ActionStatus::Failed;
            next
        });
        let effects = h.feed(tool_started_event("r1", "ex_1", "request_code_execution", json!({})));
        assert!(effects.is_empty());
        assert_eq!(h.action("ex_1").status, ActionStatus::Failed);

        // The token still attaches, without reopening the request.
        let effects = h.feed(tool_completed_event(
            "r1",
            "ex_1",
            "request_code_execution",
            json!({"response_on_reject": "declined", "resume_token": "tok"}),
        ));
        assert_eq!(h.action("ex_1").status, ActionStatus::Failed);
        assert_eq!(h.action("ex_1").resume_token(), Some("tok"));
        assert_eq!(
            effects,
            vec![ReducerEffect::ResumeTokenAttached {
                run_id: "r1".into(),
                action_id: "ex_1".into(),
                still_pending: false,
            }]
        );
    }

    #[test]
    fn exec_request_keeps_reject_text_and_token() {
        let mut h = Harness::new();
        h.feed(tool_started_event(
            "r1",
            "ex_1",
            "request_code_execution",
            json!({"response_on_reject": "declined"}),
        ));
        h.feed(tool_completed_event(
            "r1",
            "ex_1",
            "request_code_execution",
            json!({"resume_token": "tok"}),
        ));
        let action = h.action("ex_1");
        assert_eq!(action.status, ActionStatus::Running);
        assert_eq!(
            action.kind,
            ActionKind::ExecRequest {
                response_on_reject: Some("declined".into()),
                resume_token: Some("tok".into()),
            }
        );
    }

    #[test]
    fn create_file_populates_proposals_only() {
        let mut h = Harness::new();
        h.workspace.state.files.insert("main.py".into(), "old".into());
        h.feed(tool_started_event("r1", "tc_1", "create_file", json!({"file_path": "main.py"})));
        let effects = h.feed(tool_completed_event(
            "r1",
            "tc_1",
            "create_file",
            json!({"file_path": "main.py", "new_file_content": "from fastapi import FastAPI\n"}),
        ));
        assert_eq!(h.workspace.files()["main.py"], "old");
        assert_eq!(h.workspace.proposal("main.py"), Some("from fastapi import FastAPI\n"));
        assert!(effects.contains(&ReducerEffect::ProposalAdded {
            run_id: "r1".into(),
            path: "main.py".into()
        }));
        assert_eq!(h.action("tc_1").status, ActionStatus::Done);

        assert!(h.workspace.accept("main.py").is_some());
        assert_eq!(h.workspace.files()["main.py"], "from fastapi import FastAPI\n");
        assert!(h.workspace.proposal("main.py").is_none());
    }

    #[test]
    fn file_write_error_marks_tool_failed() {
        let mut h = Harness::new();
        h.feed(tool_completed_event("r1", "tc_1", "edit_code", json!({"error": "not found"})));
        assert_eq!(h.action("tc_1").status, ActionStatus::Failed);
        assert!(h.workspace.proposals().is_empty());
    }

    #[test]
    fn tree_ops_are_forwarded() {
        let mut h = Harness::new();
        h.workspace.state.files.insert("a.txt".into(), "x".into());
        let effects = h.feed(tool_completed_event(
            "r1",
            "tc_1",
            "rename_file",
            json!({"old_path": "a.txt", "new_path": "b.txt"}),
        ));
        assert_eq!(
            effects,
            vec![ReducerEffect::TreeChanged {
                run_id: "r1".into(),
                op: TreeOp::RenameFile {
                    from: "a.txt".into(),
                    to: "b.txt".into()
                }
            }]
        );
        assert!(h.workspace.files().contains_key("b.txt"));
    }

    #[test]
    fn completion_preserves_streamed_logs() {
        let mut h = Harness::new();
        h.feed(tool_started_event("r1", "tc_1", "run_tests", json!({})));
        h.feed(tool_log_event("r1", "tc_1", "ok 1\n"));
        h.feed(tool_log_event("r1", "tc_1", "ok 2\n"));
        h.feed(tool_completed_event("r1", "tc_1", "run_tests", json!("passed")));
        let action = h.action("tc_1");
        assert_eq!(action.logs.as_deref(), Some("ok 1\nok 2\n"));
        assert_eq!(action.status, ActionStatus::Done);
    }

    #[test]
    fn think_appends_assistant_thought() {
        let mut h = Harness::new();
        h.feed(tool_completed_event("r1", "tc_1", "think", json!("check routes first")));
        let thought = h.action("tc_1-thought");
        assert_eq!(
            thought.kind,
            ActionKind::AssistantThought {
                content: "check routes first".into()
            }
        );
    }

    #[test]
    fn sandbox_run_delta_materializes_and_proposes() {
        let mut h = Harness::new();
        h.workspace.state.files.insert("old.txt".into(), "keep".into());
        let effects = h.feed(tool_completed_event(
            "r1",
            "tc_1",
            "sandbox_run",
            json!({
                "exit_code": 0,
                "preview_url": "https://preview.local",
                "fs": {
                    "created": ["out/report.txt", "__pycache__/x.pyc"],
                    "updated": ["main.py"],
                    "deleted": ["old.txt"],
                    "data": [
                        {"path": "out/report.txt", "encoding": "base64", "content": B64.encode("done\n")},
                        {"path": "main.py", "content": "print(2)\n"}
                    ]
                }
            }),
        ));
        assert_eq!(h.workspace.files()["out/report.txt"], "");
        assert!(!h.workspace.files().contains_key("__pycache__/x.pyc"));
        assert_eq!(h.workspace.proposal("out/report.txt"), Some("done\n"));
        assert_eq!(h.workspace.proposal("main.py"), Some("print(2)\n"));
        assert_eq!(h.workspace.files()["old.txt"], "keep");
        assert!(matches!(
            h.action("tc_1-deleted").kind,
            ActionKind::SystemNotice { ref message } if message.contains("old.txt")
        ));
        assert!(effects.iter().any(|e| matches!(e, ReducerEffect::PreviewUrl { url, .. } if url == "https://preview.local")));
        let ActionKind::ToolCompleted { result, .. } = &h.action("tc_1").kind else {
            panic!("expected completed");
        };
        assert!(result["fs"].get("data").is_none());
    }

    #[test]
    fn show_preview_surfaces_url() {
        let mut h = Harness::new();
        let effects = h.feed(tool_completed_event(
            "r1",
            "tc_1",
            "sandbox_show_preview",
            json!({"url": "https://app.local", "port": 8000, "label": "api"}),
        ));
        assert_eq!(
            effects,
            vec![ReducerEffect::PreviewUrl {
                run_id: "r1".into(),
                url: "https://app.local".into(),
                port: Some(8000),
                label: Some("api".into()),
            }]
        );
    }

    #[test]
    fn agent_output_forces_running_actions_done() {
        let mut h = Harness::new();
        h.feed(tool_started_event("r1", "tc_1", "grep", json!({})));
        let effects = h.feed(agent_output_event("r1", "Added /health."));
        assert_eq!(h.action("tc_1").status, ActionStatus::Done);
        assert_eq!(
            h.action(FINAL_ANSWER_ID).kind,
            ActionKind::FinalAnswer {
                content: "Added /health.".into()
            }
        );
        assert_eq!(h.status(), RunStatus::Done);
        assert!(effects.contains(&ReducerEffect::ClearLoading { run_id: "r1".into() }));
    }

    #[test]
    fn agent_output_for_inactive_run_keeps_loading() {
        let mut h = Harness::new();
        h.active = Some("r2".into());
        let effects = h.feed(agent_output_event("r1", "done"));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, ReducerEffect::ClearLoading { .. })));
    }

    #[test]
    fn run_failed_forces_running_actions_failed() {
        let mut h = Harness::new();
        h.feed(tool_started_event("r1", "tc_1", "grep", json!({})));
        h.feed(run_failed_event("r1", "No output produced."));
        assert_eq!(h.action("tc_1").status, ActionStatus::Failed);
        assert_eq!(h.status(), RunStatus::Failed);
        assert_eq!(
            h.action(RUN_FAILED_ID).kind,
            ActionKind::SystemNotice {
                message: "No output produced.".into()
            }
        );
    }

    #[test]
    fn cancelled_run_drops_late_events() {
        let mut h = Harness::new();
        h.feed(tool_started_event("r1", "tc_1", "grep", json!({})));
        h.feed(run_cancelled_event("r1"));
        assert_eq!(h.action("tc_1").status, ActionStatus::Done);
        assert_eq!(h.status(), RunStatus::Cancelled);

        h.feed(tool_started_event("r1", "tc_2", "grep", json!({})));
        h.feed(tool_failed_event("r1", "tc_1", "grep", "late"));
        assert!(h.store.action("r1", "tc_2").is_none());
        assert_eq!(h.action("tc_1").status, ActionStatus::Done);
    }

    #[test]
    fn tool_failure_is_recorded() {
        let mut h = Harness::new();
        h.feed(tool_started_event("r1", "tc_1", "edit_code", json!({})));
        h.feed(tool_log_event("r1", "tc_1", "partial"));
        h.feed(tool_failed_event("r1", "tc_1", "edit_code", "disk full"));
        let action = h.action("tc_1");
        assert_eq!(action.status, ActionStatus::Failed);
        assert_eq!(action.logs.as_deref(), Some("partial"));
        assert_eq!(action.kind.tool_name(), Some("edit_code"));
    }

    #[test]
    fn late_failure_does_not_undo_completed_tool() {
        let mut h = Harness::new();
        h.feed(tool_started_event("r1", "tc_1", "grep", json!({})));
        h.feed(tool_completed_event("r1", "tc_1", "grep", json!({"hits": 1})));
        h.feed(tool_failed_event("r1", "tc_1", "grep", "timeout"));
        assert_eq!(h.action("tc_1").status, ActionStatus::Done);
        assert_eq!(h.status(), RunStatus::Streaming);
    }

    #[test]
    fn unknown_events_and_runs_are_dropped() {
        let mut h = Harness::new();
        assert!(h
            .feed(json!({"event_type": "progress_update_mystery", "task_id": "r1"}))
            .is_empty());
        assert!(h.feed(tool_started_event("ghost", "tc_1", "grep", json!({}))).is_empty());
        assert!(h.store.run("ghost").is_none());
        assert!(h.store.run("r1").unwrap().actions.is_empty());
    }
}
