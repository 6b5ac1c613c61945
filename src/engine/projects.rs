//! Project, thread and proposal commands plus their persistence.

use super::{EngineActor, EngineEvent, EngineState, ThreadEvent, WorkspaceEvent};
use crate::persist::generate_thread_id;
use crate::workspace::Workspace;

impl EngineActor {
    /// Persist one thread's runs. A no-op without a project store or when
    /// the thread has no runs yet.
    pub(super) fn save_thread(&mut self, state: &EngineState, project_id: &str, thread_id: &str) {
        let Some(store) = self.project_store.as_ref() else {
            return;
        };
        let snapshot = state.store.thread_snapshot(project_id, thread_id);
        if snapshot.order.is_empty() {
            return;
        }
        match store.save_thread(project_id, thread_id, &snapshot) {
            Ok(evicted) => self.emit(EngineEvent::Thread(ThreadEvent::Saved {
                project_id: project_id.to_string(),
                thread_id: thread_id.to_string(),
                evicted,
            })),
            Err(err) => {
                tracing::warn!(project_id, thread_id, error = %err, "failed to save thread");
                self.emit(EngineEvent::warning(None, format!("failed to save thread: {err}")));
            }
        }
    }

    /// Write every loaded workspace into `state.json`.
    pub(super) fn save_project_state(&mut self, state: &EngineState) {
        let Some(store) = self.project_store.as_ref() else {
            return;
        };
        let result = store.load_state().and_then(|mut persisted| {
            for (project_id, workspace) in &state.workspaces {
                let name = if *project_id == state.project_id {
                    self.settings.project_name.as_deref().unwrap_or(project_id)
                } else {
                    project_id
                };
                persisted.ensure_project(project_id, name);
                persisted
                    .project_states
                    .insert(project_id.clone(), workspace.state.clone());
            }
            persisted.active_project_id = Some(state.project_id.clone());
            store.save_state(&persisted)
        });
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to save project state");
            self.emit(EngineEvent::warning(
                None,
                format!("failed to save project state: {err}"),
            ));
        }
    }

    pub(super) fn resolve_proposals(
        &mut self,
        state: &mut EngineState,
        path: Option<&str>,
        accept: bool,
    ) {
        let project_id = state.project_id.clone();
        let workspace = state.workspace_mut(&project_id);
        let (accepted, rejected) = match (path, accept) {
            (Some(path), true) => match workspace.accept(path) {
                Some(_) => (vec![path.to_string()], Vec::new()),
                None => {
                    self.emit(EngineEvent::error(None, format!("no proposal for `{path}`")));
                    return;
                }
            },
            (Some(path), false) => {
                if !workspace.reject(path) {
                    self.emit(EngineEvent::error(None, format!("no proposal for `{path}`")));
                    return;
                }
                (Vec::new(), vec![path.to_string()])
            }
            (None, true) => (workspace.accept_all(), Vec::new()),
            (None, false) => {
                let rejected: Vec<String> = workspace.proposals().keys().cloned().collect();
                workspace.reject_all();
                (Vec::new(), rejected)
            }
        };
        tracing::info!(
            project_id = %project_id,
            accepted = accepted.len(),
            rejected = rejected.len(),
            "proposals resolved"
        );
        self.emit(EngineEvent::Workspace(WorkspaceEvent::ProposalsResolved {
            project_id,
            accepted,
            rejected,
        }));
        self.save_project_state(state);
    }

    pub(super) fn switch_project(
        &mut self,
        state: &mut EngineState,
        project_id: &str,
        name: Option<String>,
    ) {
        if project_id.trim().is_empty() {
            self.emit(EngineEvent::error(None, "project id is empty"));
            return;
        }
        if project_id == state.project_id {
            return;
        }
        let (previous, previous_thread) = (state.project_id.clone(), state.thread_id.clone());
        self.save_thread(state, &previous, &previous_thread);
        self.save_project_state(state);
        // Runs still streaming keep their subscriptions and stay in memory.
        if !state.project_has_live_runs(&previous) {
            state.store.clear_project_runs(&previous);
        }

        if !state.workspaces.contains_key(project_id) {
            let workspace = self.load_workspace(project_id);
            state.workspaces.insert(project_id.to_string(), workspace);
        }
        self.settings.project_name = name;
        state.project_id = project_id.to_string();
        state.active_run = None;

        let latest = self
            .project_store
            .as_ref()
            .and_then(|store| store.list_threads(project_id).ok())
            .and_then(|threads| threads.into_iter().next());
        match latest {
            Some(record) => {
                state
                    .store
                    .merge_project_runs(project_id, &record.snapshot, &record.id);
                state.thread_id = record.id;
            }
            None => state.thread_id = generate_thread_id(),
        }
        self.emit_thread_switched(state);
    }

    pub(super) fn switch_thread(&mut self, state: &mut EngineState, thread_id: &str) {
        if thread_id == state.thread_id {
            return;
        }
        let Some(store) = self.project_store.as_ref() else {
            self.emit(EngineEvent::error(None, "thread persistence is disabled"));
            return;
        };
        let project_id = state.project_id.clone();
        let record = match store.load_thread(&project_id, thread_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.emit(EngineEvent::error(None, format!("unknown thread `{thread_id}`")));
                return;
            }
            Err(err) => {
                self.emit(EngineEvent::error(None, format!("failed to load thread: {err}")));
                return;
            }
        };
        let previous = state.thread_id.clone();
        self.save_thread(state, &project_id, &previous);
        if !state.project_has_live_runs(&project_id) {
            state.store.clear_project_runs(&project_id);
        }
        state
            .store
            .merge_project_runs(&project_id, &record.snapshot, thread_id);
        state.thread_id = thread_id.to_string();
        state.active_run = None;
        self.emit_thread_switched(state);
    }

    pub(super) fn new_thread(&mut self, state: &mut EngineState) {
        let (project_id, previous) = (state.project_id.clone(), state.thread_id.clone());
        self.save_thread(state, &project_id, &previous);
        state.thread_id = generate_thread_id();
        state.active_run = None;
        self.emit_thread_switched(state);
    }

    fn load_workspace(&self, project_id: &str) -> Workspace {
        let Some(store) = self.project_store.as_ref() else {
            return Workspace::default();
        };
        match store.load_state() {
            Ok(persisted) => persisted
                .project_states
                .get(project_id)
                .cloned()
                .map(Workspace::new)
                .unwrap_or_default(),
            Err(err) => {
                tracing::warn!(project_id, error = %err, "failed to load project state");
                Workspace::default()
            }
        }
    }

    fn emit_thread_switched(&mut self, state: &EngineState) {
        let runs = state
            .store
            .runs_in_order()
            .filter(|run| run.project_id == state.project_id && run.thread_id == state.thread_id)
            .count();
        tracing::info!(project_id = %state.project_id, thread_id = %state.thread_id, runs, "thread switched");
        self.emit(EngineEvent::Thread(ThreadEvent::Switched {
            project_id: state.project_id.clone(),
            thread_id: state.thread_id.clone(),
            runs,
        }));
    }
}
