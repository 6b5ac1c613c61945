//! In-memory run history.
//!
//! The store is a map of runs, each holding its ordered actions plus an
//! `action id -> index` map, so every upsert is keyed and never scans another
//! run's data. It is owned by a single writer (the engine actor); nothing here
//! locks.

mod types;

pub use types::*;

use std::collections::HashMap;

#[derive(Debug, Clone)]
struct RunEntry {
    run: Run,
    index: HashMap<String, usize>,
}

impl RunEntry {
    fn new(run: Run) -> Self {
        let index = run
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.clone(), i))
            .collect();
        Self { run, index }
    }
}

/// Keyed collection of runs with idempotent mutation operations.
#[derive(Debug, Clone, Default)]
pub struct RunStore {
    runs: HashMap<String, RunEntry>,
    order: Vec<String>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every run (sign-out teardown).
    pub fn reset(&mut self) {
        self.runs.clear();
        self.order.clear();
    }

    /// Insert an empty streaming run. Returns false when `id` already exists.
    pub fn create_run(
        &mut self,
        id: &str,
        prompt: &str,
        project_id: &str,
        thread_id: &str,
    ) -> bool {
        if self.runs.contains_key(id) {
            return false;
        }
        let run = Run {
            id: id.to_string(),
            user_prompt: prompt.to_string(),
            project_id: project_id.to_string(),
            thread_id: thread_id.to_string(),
            status: RunStatus::Streaming,
            actions: Vec::new(),
        };
        self.runs.insert(id.to_string(), RunEntry::new(run));
        self.order.push(id.to_string());
        true
    }

    /// Append `action`, or replace the existing action with the same id.
    pub fn add_action(&mut self, run_id: &str, action: Action) -> bool {
        let action_id = action.id.clone();
        self.update_action(run_id, &action_id, move |_| action)
    }

    /// Upsert by id: `updater` receives the current action (if any) and
    /// returns its replacement. Unknown runs are ignored.
    pub fn update_action<F>(&mut self, run_id: &str, action_id: &str, updater: F) -> bool
    where
        F: FnOnce(Option<&Action>) -> Action,
    {
        let Some(entry) = self.runs.get_mut(run_id) else {
            tracing::debug!(run_id, action_id, "dropping action update for unknown run");
            return false;
        };
        match entry.index.get(action_id).copied() {
            Some(i) => {
                let mut next = updater(Some(&entry.run.actions[i]));
                next.id = action_id.to_string();
                entry.run.actions[i] = next;
            }
            None => {
                let mut next = updater(None);
                next.id = action_id.to_string();
                entry.index.insert(action_id.to_string(), entry.run.actions.len());
                entry.run.actions.push(next);
            }
        }
        true
    }

    /// Concatenate `chunk` onto the action's log. Missing actions are ignored.
    pub fn append_action_log(&mut self, run_id: &str, action_id: &str, chunk: &str) -> bool {
        let Some(entry) = self.runs.get_mut(run_id) else {
            return false;
        };
        let Some(i) = entry.index.get(action_id).copied() else {
            tracing::debug!(run_id, action_id, "dropping log chunk for unknown action");
            return false;
        };
        entry.run.actions[i]
            .logs
            .get_or_insert_with(String::new)
            .push_str(chunk);
        true
    }

    pub fn set_run_status(&mut self, run_id: &str, status: RunStatus) -> bool {
        match self.runs.get_mut(run_id) {
            Some(entry) => {
                entry.run.status = status;
                true
            }
            None => false,
        }
    }

    /// Move every `running` action of a run to `to`. Returns how many moved.
    pub fn force_running(&mut self, run_id: &str, to: ActionStatus) -> usize {
        let Some(entry) = self.runs.get_mut(run_id) else {
            return 0;
        };
        let mut moved = 0;
        for action in &mut entry.run.actions {
            if action.status == ActionStatus::Running {
                action.status = to;
                moved += 1;
            }
        }
        moved
    }

    /// Merge a persisted thread snapshot. Runs already present (by id) are
    /// left untouched, so merging the same snapshot twice is a no-op.
    ///
    /// A rehydrated run has no subscription and no resume token, so one saved
    /// mid-flight comes back `failed` with its running actions failed.
    pub fn merge_project_runs(
        &mut self,
        project_id: &str,
        snapshot: &ThreadSnapshot,
        thread_id: &str,
    ) -> usize {
        let mut ids: Vec<&String> = snapshot.order.iter().collect();
        for id in snapshot.runs.keys() {
            if !snapshot.order.contains(id) {
                ids.push(id);
            }
        }

        let mut merged = 0;
        for id in ids {
            if self.runs.contains_key(id.as_str()) {
                continue;
            }
            let Some(run) = snapshot.runs.get(id.as_str()) else {
                continue;
            };
            let mut run = run.clone();
            run.project_id = project_id.to_string();
            run.thread_id = thread_id.to_string();
            if !run.status.is_terminal() {
                tracing::debug!(run_id = %id, status = ?run.status, "rehydrated run was still live; marking failed");
                for action in &mut run.actions {
                    if action.status == ActionStatus::Running {
                        action.status = ActionStatus::Failed;
                    }
                }
                run.status = RunStatus::Failed;
            }
            self.runs.insert(id.clone(), RunEntry::new(run));
            self.order.push(id.clone());
            merged += 1;
        }
        merged
    }

    /// Remove every run belonging to `project_id`.
    pub fn clear_project_runs(&mut self, project_id: &str) -> usize {
        let before = self.order.len();
        self.runs.retain(|_, entry| entry.run.project_id != project_id);
        let runs = &self.runs;
        self.order.retain(|id| runs.contains_key(id));
        before - self.order.len()
    }

    /// Build the persisted `{runs, order}` pair for one project thread.
    pub fn thread_snapshot(&self, project_id: &str, thread_id: &str) -> ThreadSnapshot {
        let mut snapshot = ThreadSnapshot::default();
        for run in self.runs_in_order() {
            if run.project_id == project_id && run.thread_id == thread_id {
                snapshot.order.push(run.id.clone());
                snapshot.runs.insert(run.id.clone(), run.clone());
            }
        }
        snapshot
    }

    pub fn run(&self, run_id: &str) -> Option<&Run> {
        self.runs.get(run_id).map(|entry| &entry.run)
    }

    pub fn action(&self, run_id: &str, action_id: &str) -> Option<&Action> {
        let entry = self.runs.get(run_id)?;
        let i = *entry.index.get(action_id)?;
        entry.run.actions.get(i)
    }

    /// Runs in creation order.
    pub fn runs_in_order(&self) -> impl Iterator<Item = &Run> {
        self.order
            .iter()
            .filter_map(|id| self.runs.get(id).map(|entry| &entry.run))
    }

    pub fn run_order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn started(id: &str, tool: &str) -> Action {
        Action::new(
            id,
            ActionStatus::Running,
            ActionKind::ToolStarted {
                tool_name: tool.into(),
                arguments: json!({}),
            },
        )
    }

    fn store_with_run() -> RunStore {
        let mut store = RunStore::new();
        store.create_run("r1", "hello", "p1", "t1");
        store
    }

    #[test]
    fn create_run_is_idempotent() {
        let mut store = store_with_run();
        assert!(!store.create_run("r1", "other", "p2", "t2"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.run("r1").unwrap().user_prompt, "hello");
        assert_eq!(store.run_order(), ["r1".to_string()]);
    }

    #[test]
    fn add_action_replaces_by_id() {
        let mut store = store_with_run();
        store.add_action("r1", started("a", "edit_code"));
        let mut done = started("a", "edit_code");
        done.status = ActionStatus::Done;
        store.add_action("r1", done);
        let run = store.run("r1").unwrap();
        assert_eq!(run.actions.len(), 1);
        assert_eq!(run.actions[0].status, ActionStatus::Done);
    }

    #[test]
    fn unknown_run_mutations_are_dropped() {
        let mut store = RunStore::new();
        assert!(!store.add_action("ghost", started("a", "x")));
        assert!(!store.append_action_log("ghost", "a", "chunk"));
        assert!(!store.set_run_status("ghost", RunStatus::Done));
        assert_eq!(store.force_running("ghost", ActionStatus::Done), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn update_action_upserts_and_keeps_position() {
        let mut store = store_with_run();
        store.add_action("r1", started("a", "x"));
        store.add_action("r1", started("b", "y"));
        store.update_action("r1", "a", |existing| {
            let mut next = existing.cloned().expect("a exists");
            next.status = ActionStatus::Failed;
            next
        });
        store.update_action("r1", "c", |existing| {
            assert!(existing.is_none());
            started("ignored-id", "z")
        });
        let ids: Vec<&str> = store
            .run("r1")
            .unwrap()
            .actions
            .iter()
            .map(|a| a.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(store.action("r1", "a").unwrap().status, ActionStatus::Failed);
    }

    #[test]
    fn log_append_is_concatenation_in_order() {
        let mut store = store_with_run();
        assert!(!store.append_action_log("r1", "missing", "x"));
        store.add_action("r1", started("a", "sandbox_run"));
        store.append_action_log("r1", "a", "hello ");
        store.append_action_log("r1", "a", "world");
        assert_eq!(
            store.action("r1", "a").unwrap().logs.as_deref(),
            Some("hello world")
        );
    }

    #[test]
    fn force_running_only_touches_running_actions() {
        let mut store = store_with_run();
        store.add_action("r1", started("a", "x"));
        let mut done = started("b", "y");
        done.status = ActionStatus::Done;
        store.add_action("r1", done);
        assert_eq!(store.force_running("r1", ActionStatus::Failed), 1);
        assert_eq!(store.action("r1", "a").unwrap().status, ActionStatus::Failed);
        assert_eq!(store.action("r1", "b").unwrap().status, ActionStatus::Done);
    }

    #[test]
    fn merging_same_snapshot_twice_matches_merging_once() {
        let mut source = store_with_run();
        source.add_action("r1", started("a", "x"));
        source.create_run("r2", "second", "p1", "t1");
        source.create_run("other", "elsewhere", "p1", "t2");
        let snapshot = source.thread_snapshot("p1", "t1");
        assert_eq!(snapshot.order, vec!["r1".to_string(), "r2".to_string()]);

        let mut once = RunStore::new();
        once.merge_project_runs("p1", &snapshot, "t1");
        let mut twice = RunStore::new();
        twice.merge_project_runs("p1", &snapshot, "t1");
        assert_eq!(twice.merge_project_runs("p1", &snapshot, "t1"), 0);

        let once_runs: Vec<&Run> = once.runs_in_order().collect();
        let twice_runs: Vec<&Run> = twice.runs_in_order().collect();
        assert_eq!(once_runs, twice_runs);
        assert_eq!(twice.len(), 2);
    }

    #[test]
    fn merge_does_not_overwrite_live_runs() {
        let mut store = store_with_run();
        store.add_action("r1", started("live", "x"));
        let mut snapshot = ThreadSnapshot::default();
        let mut stale = store.run("r1").unwrap().clone();
        stale.actions.clear();
        snapshot.order.push("r1".into());
        snapshot.runs.insert("r1".into(), stale);
        assert_eq!(store.merge_project_runs("p1", &snapshot, "t1"), 0);
        assert_eq!(store.run("r1").unwrap().actions.len(), 1);
    }

    #[test]
    fn merged_live_runs_come_back_failed() {
        let mut source = store_with_run();
        source.add_action("r1", started("tc_1", "grep"));
        source.add_action(
            "r1",
            Action::new(
                "ex_1",
                ActionStatus::Running,
                ActionKind::ExecRequest {
                    response_on_reject: None,
                    resume_token: None,
                },
            ),
        );
        source.set_run_status("r1", RunStatus::WaitingExec);
        source.create_run("r2", "finished", "p1", "t1");
        source.set_run_status("r2", RunStatus::Done);
        let snapshot = source.thread_snapshot("p1", "t1");

        let mut store = RunStore::new();
        assert_eq!(store.merge_project_runs("p1", &snapshot, "t1"), 2);
        let run = store.run("r1").unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.actions.iter().all(|a| a.status == ActionStatus::Failed));
        assert_eq!(store.run("r2").unwrap().status, RunStatus::Done);
    }

    #[test]
    fn clear_project_runs_keeps_other_projects() {
        let mut store = store_with_run();
        store.create_run("r2", "x", "p2", "t1");
        store.create_run("r3", "y", "p1", "t9");
        assert_eq!(store.clear_project_runs("p1"), 2);
        assert_eq!(store.run_order(), ["r2".to_string()]);
        store.reset();
        assert!(store.is_empty());
    }
}

#[cfg(all(test, feature = "fuzz-tests"))]
mod fuzz_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn logs_equal_concatenation_and_never_shrink(chunks in proptest::collection::vec(".{0,12}", 0..40)) {
            let mut store = RunStore::new();
            store.create_run("r", "p", "proj", "t");
            store.add_action(
                "r",
                Action::new("a", ActionStatus::Running, ActionKind::ToolStarted {
                    tool_name: "sandbox_run".into(),
                    arguments: serde_json::Value::Null,
                }),
            );
            let mut expected = String::new();
            let mut last_len = 0;
            for chunk in &chunks {
                store.append_action_log("r", "a", chunk);
                expected.push_str(chunk);
                let logs = store.action("r", "a").and_then(|a| a.logs.clone()).unwrap_or_default();
                prop_assert!(logs.len() >= last_len);
                last_len = logs.len();
            }
            let logs = store.action("r", "a").and_then(|a| a.logs.clone()).unwrap_or_default();
            prop_assert_eq!(logs, expected);
        }
    }
}
