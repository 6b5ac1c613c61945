//! Offline replay of a captured event log.
//!
//! Each non-empty line holds one wire message, either bare JSON or an SSE
//! `data:` line. Messages are folded through the reducer exactly as a live
//! subscription would apply them.

use crate::protocol::{parse_agent_payload, AgentEvent};
use crate::reducer::{self, ReducerContext, ReducerEffect};
use crate::store::{Run, RunStore};
use crate::workspace::Workspace;
use serde::Serialize;
use std::collections::BTreeMap;

const REPLAY_SCOPE: &str = "replay";
const FALLBACK_RUN_ID: &str = "replay";

/// Reconciled history produced by [`replay_log`].
#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutput {
    pub run: Run,
    /// Proposals left pending by the run.
    pub proposals: BTreeMap<String, String>,
    /// Files materialized or changed by tree operations.
    pub files: BTreeMap<String, String>,
    pub effects: Vec<ReducerEffect>,
    /// Lines addressed to another run.
    pub skipped: usize,
    /// Lines that did not parse into a known event.
    pub unknown: usize,
}

/// Fold `log` into a fresh store. Lines for runs other than `run_id` (or the
/// first `task_id` seen) are counted and skipped.
pub fn replay_log(log: &str, run_id: Option<&str>) -> ReplayOutput {
    let messages: Vec<_> = log
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(':'))
        .map(|line| line.strip_prefix("data:").map_or(line, str::trim_start))
        .filter(|payload| *payload != "[DONE]")
        .map(parse_agent_payload)
        .collect();

    let run_id = run_id
        .map(ToString::to_string)
        .or_else(|| messages.iter().find_map(|m| m.task_id.clone()))
        .unwrap_or_else(|| FALLBACK_RUN_ID.to_string());

    let mut store = RunStore::new();
    store.create_run(&run_id, "", REPLAY_SCOPE, REPLAY_SCOPE);
    let mut workspace = Workspace::default();
    let mut effects = Vec::new();
    let (mut skipped, mut unknown) = (0, 0);

    for message in &messages {
        if message.task_id.as_deref().is_some_and(|task| task != run_id) {
            skipped += 1;
            continue;
        }
        if matches!(message.event, AgentEvent::Unknown { .. }) {
            unknown += 1;
        }
        let mut ctx = ReducerContext {
            store: &mut store,
            workspace: &mut workspace,
            active_run: None,
        };
        effects.extend(reducer::apply(&mut ctx, &run_id, &message.event));
    }
    tracing::debug!(run_id = %run_id, lines = messages.len(), skipped, unknown, "replay finished");

    let run = store.run(&run_id).cloned().unwrap_or_else(|| Run {
        id: run_id.clone(),
        user_prompt: String::new(),
        project_id: REPLAY_SCOPE.to_string(),
        thread_id: REPLAY_SCOPE.to_string(),
        status: crate::store::RunStatus::Streaming,
        actions: Vec::new(),
    });
    ReplayOutput {
        run,
        proposals: workspace.proposals().clone(),
        files: workspace.files().clone(),
        effects,
        skipped,
        unknown,
    }
}
