//! Run/Action data model.
//!
//! These types are both the in-memory history and the persisted thread
//! snapshot shape, so every field is serde-friendly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle of one chat turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Streaming,
    WaitingExec,
    Done,
    Cancelled,
    Failed,
}

impl RunStatus {
    /// Done, cancelled and failed runs accept no further protocol mutations.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }
}

/// Lifecycle of one action inside a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// Variant payload of an [`Action`], tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    UserMessage {
        content: String,
    },
    AssistantThought {
        content: String,
    },
    ToolStarted {
        tool_name: String,
        #[serde(default)]
        arguments: Value,
    },
    ToolCompleted {
        tool_name: String,
        #[serde(default)]
        result: Value,
    },
    ToolFailed {
        tool_name: String,
        error: String,
    },
    ExecRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_on_reject: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_token: Option<String>,
    },
    ExecResult {
        output: String,
    },
    SystemNotice {
        message: String,
    },
    FinalAnswer {
        content: String,
    },
}

impl ActionKind {
    /// Tool name for the three tool-lifecycle variants.
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::ToolStarted { tool_name, .. }
            | Self::ToolCompleted { tool_name, .. }
            | Self::ToolFailed { tool_name, .. } => Some(tool_name),
            _ => None,
        }
    }

    pub fn is_exec_request(&self) -> bool {
        matches!(self, Self::ExecRequest { .. })
    }
}

/// One independently addressable entry in a run's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub id: String,
    pub status: ActionStatus,
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Streamed tool/exec output, only ever appended to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
}

impl Action {
    /// Build an action stamped with the current wall-clock time.
    pub fn new(id: impl Into<String>, status: ActionStatus, kind: ActionKind) -> Self {
        Self {
            id: id.into(),
            status,
            timestamp_ms: now_unix_millis(),
            kind,
            metadata: None,
            logs: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set one metadata key, keeping whatever else is already recorded.
    pub fn merge_metadata(&mut self, key: &str, value: Value) {
        let mut map = match self.metadata.take() {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        map.insert(key.to_string(), value);
        self.metadata = Some(Value::Object(map));
    }

    /// Resume token carried by an exec request, if any.
    pub fn resume_token(&self) -> Option<&str> {
        match &self.kind {
            ActionKind::ExecRequest { resume_token, .. } => resume_token.as_deref(),
            _ => None,
        }
    }
}

/// One chat turn scoped to a project and a thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: String,
    pub user_prompt: String,
    pub project_id: String,
    pub thread_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Run {
    pub fn action(&self, action_id: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.id == action_id)
    }

    /// The final answer text, when the run produced one.
    pub fn final_answer(&self) -> Option<&str> {
        self.actions.iter().rev().find_map(|a| match &a.kind {
            ActionKind::FinalAnswer { content } => Some(content.as_str()),
            _ => None,
        })
    }
}

/// Persisted `{runs, order}` pair used to rehydrate one thread.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ThreadSnapshot {
    #[serde(default)]
    pub runs: BTreeMap<String, Run>,
    #[serde(default)]
    pub order: Vec<String>,
}

impl ThreadSnapshot {
    /// Runs in creation order; ids missing from `runs` are skipped.
    pub fn ordered_runs(&self) -> impl Iterator<Item = &Run> {
        self.order.iter().filter_map(|id| self.runs.get(id))
    }
}

/// Current Unix timestamp in milliseconds.
pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
