//! State owned by the engine actor and shared read-only with frontends.

use crate::api::HistoryMessage;
use crate::gate::{ExecCorrelation, ExecutionGate};
use crate::protocol::AgentEvent;
use crate::reducer::{self, ReducerContext, ReducerEffect};
use crate::sandbox::{SandboxController, SandboxSession};
use crate::store::{ActionStatus, RunStatus, RunStore};
use crate::workspace::Workspace;
use std::collections::HashMap;

/// Conventional entry points tried when a session has no explicit entry.
const ENTRY_CANDIDATES: &[&str] = &[
    "main.py",
    "app.py",
    "server.py",
    "index.js",
    "server.js",
    "app.js",
    "main.js",
    "index.ts",
    "main.rb",
    "app.rb",
];

/// Everything the single-writer applier mutates.
///
/// Frontends lock it through [`super::EngineHandle::state`] to render; only
/// the actor writes.
#[derive(Debug)]
pub struct EngineState {
    pub(super) store: RunStore,
    pub(super) workspaces: HashMap<String, Workspace>,
    pub(super) project_id: String,
    pub(super) thread_id: String,
    pub(super) active_run: Option<String>,
    pub(super) gate: ExecutionGate,
    pub(super) sandbox: SandboxController,
}

impl EngineState {
    pub(super) fn new(
        project_id: String,
        thread_id: String,
        workspace: Workspace,
        sandbox: SandboxController,
    ) -> Self {
        let mut workspaces = HashMap::new();
        workspaces.insert(project_id.clone(), workspace);
        Self {
            store: RunStore::new(),
            workspaces,
            project_id,
            thread_id,
            active_run: None,
            gate: ExecutionGate::new(),
            sandbox,
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn active_run(&self) -> Option<&str> {
        self.active_run.as_deref()
    }

    /// Workspace of the active project.
    pub fn workspace(&self) -> Option<&Workspace> {
        self.workspaces.get(&self.project_id)
    }

    pub fn workspace_for(&self, project_id: &str) -> Option<&Workspace> {
        self.workspaces.get(project_id)
    }

    pub fn sandbox(&self) -> &SandboxSession {
        self.sandbox.session()
    }

    /// Exec request currently owning the sandbox, if any.
    pub fn exec_in_flight(&self) -> Option<&ExecCorrelation> {
        self.gate.in_flight()
    }

    /// Exec request of a paused run that still needs a decision: nothing is
    /// executing it, either because no one decided yet or because its sandbox
    /// failed.
    pub fn undecided_exec(&self, run_id: &str) -> Option<&str> {
        let run = self.store.run(run_id)?;
        if run.status != RunStatus::WaitingExec {
            return None;
        }
        if self.gate.in_flight().is_some_and(|c| c.run_id == run_id) {
            return None;
        }
        run.actions
            .iter()
            .find(|a| a.kind.is_exec_request() && a.status == ActionStatus::Running)
            .map(|a| a.id.as_str())
    }

    pub(super) fn workspace_mut(&mut self, project_id: &str) -> &mut Workspace {
        self.workspaces.entry(project_id.to_string()).or_default()
    }

    /// Fold one agent event into the run's project.
    pub(super) fn apply_agent_event(
        &mut self,
        run_id: &str,
        event: &AgentEvent,
    ) -> Vec<ReducerEffect> {
        let Some(project_id) = self.store.run(run_id).map(|run| run.project_id.clone()) else {
            tracing::debug!(run_id, event_type = event.label(), "dropping event for unknown run");
            return Vec::new();
        };
        let workspace = self.workspaces.entry(project_id).or_default();
        let mut ctx = ReducerContext {
            store: &mut self.store,
            workspace,
            active_run: self.active_run.as_deref(),
        };
        reducer::apply(&mut ctx, run_id, event)
    }

    /// Prior user/assistant turns of the active thread.
    pub(super) fn message_history(&self) -> Vec<HistoryMessage> {
        let mut history = Vec::new();
        for run in self.store.runs_in_order() {
            if run.project_id != self.project_id || run.thread_id != self.thread_id {
                continue;
            }
            history.push(HistoryMessage {
                role: "user".to_string(),
                content: run.user_prompt.clone(),
            });
            if let Some(answer) = run.final_answer() {
                history.push(HistoryMessage {
                    role: "assistant".to_string(),
                    content: answer.to_string(),
                });
            }
        }
        history
    }

    /// Whether any run of `project_id` still has work in flight.
    pub(super) fn project_has_live_runs(&self, project_id: &str) -> bool {
        self.store
            .runs_in_order()
            .any(|run| run.project_id == project_id && !run.status.is_terminal())
    }
}

/// Entry file for a sandbox session: the active file, then a conventional
/// name, then the first file in path order.
pub(super) fn pick_entry(workspace: &Workspace) -> Option<String> {
    let files = workspace.files();
    let ignore = workspace.ignore_matcher();
    if let Some(active) = workspace.state.active_file.as_deref() {
        if files.contains_key(active) {
            return Some(active.to_string());
        }
    }
    for candidate in ENTRY_CANDIDATES {
        if files.contains_key(*candidate) {
            return Some((*candidate).to_string());
        }
    }
    files
        .keys()
        .find(|path| !ignore.is_ignored(path) && !path.starts_with('.'))
        .cloned()
}
