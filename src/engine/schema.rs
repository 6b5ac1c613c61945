//! Engine command/event schema.
//!
//! Frontends drive the engine with [`EngineCommand`]s and render the
//! sequenced [`EngineEventEnvelope`] stream it produces.

use crate::gate::ExecDecision;
use crate::reducer::ReducerEffect;
use crate::sandbox::SandboxNotice;
use crate::store::{now_unix_millis, RunStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Control-plane commands for the engine actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineCommand {
    SubmitPrompt {
        prompt: String,
    },
    Decide {
        run_id: String,
        action_id: String,
        decision: ExecDecision,
    },
    CancelRun {
        run_id: String,
    },
    /// Start a sandbox session. Without an entry path the engine picks one
    /// from the active project.
    StartPlay {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entry_path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        runtime: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env: Option<BTreeMap<String, String>>,
    },
    StopPlay,
    /// Accept one proposal, or every pending proposal when `path` is unset.
    AcceptProposal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    RejectProposal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    SwitchProject {
        project_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    SwitchThread {
        thread_id: String,
    },
    NewThread,
    SetActiveRun {
        run_id: Option<String>,
    },
    Shutdown,
}

/// Monotonic envelope for engine events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineEventEnvelope {
    pub seq: u64,
    pub ts_unix_ms: u64,
    pub event: EngineEvent,
}

impl EngineEventEnvelope {
    pub fn new(seq: u64, event: EngineEvent) -> Self {
        Self {
            seq,
            ts_unix_ms: now_unix_millis(),
            event,
        }
    }
}

/// Typed engine event families.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    Lifecycle(LifecycleEvent),
    Run(RunEvent),
    /// Reducer side effect, forwarded as-is.
    Effect(ReducerEffect),
    Sandbox(SandboxEvent),
    Workspace(WorkspaceEvent),
    Thread(ThreadEvent),
    Warning(WarningEvent),
    Error(ErrorEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    EngineStarted {
        project_id: String,
        thread_id: String,
    },
    EngineStopped,
}

/// Run-scoped transitions. Full run contents are read from the shared
/// engine state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunEvent {
    Queued {
        project_id: String,
        thread_id: String,
        prompt: String,
    },
    Created {
        run_id: String,
        project_id: String,
        thread_id: String,
    },
    Updated {
        run_id: String,
        status: RunStatus,
        actions: usize,
    },
    Decided {
        run_id: String,
        action_id: String,
        decision: ExecDecision,
    },
    /// A decision was recorded before its resume token arrived.
    ResumeDeferred {
        run_id: String,
        action_id: String,
    },
    Resumed {
        run_id: String,
        action_id: String,
    },
    /// The subscription ended without the run reaching a terminal status.
    StreamEnded {
        run_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxEvent {
    Starting {
        entry_path: String,
        delay_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
    },
    Created {
        task_id: String,
    },
    Notice(SandboxNotice),
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceEvent {
    ProposalsResolved {
        project_id: String,
        accepted: Vec<String>,
        rejected: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadEvent {
    Switched {
        project_id: String,
        thread_id: String,
        runs: usize,
    },
    Saved {
        project_id: String,
        thread_id: String,
        evicted: Vec<String>,
    },
}

/// Non-fatal warning surfaced to frontends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WarningEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub message: String,
}

/// Error surfaced to frontends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub message: String,
}

impl EngineEvent {
    pub fn warning(run_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::Warning(WarningEvent {
            run_id: run_id.map(ToString::to_string),
            message: message.into(),
        })
    }

    pub fn error(run_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::Error(ErrorEvent {
            run_id: run_id.map(ToString::to_string),
            message: message.into(),
        })
    }
}
