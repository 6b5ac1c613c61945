//! Wire protocol for agent run and play event streams.
//!
//! Every inbound message is validated into a closed tagged union at this
//! boundary. Payloads that do not match a known `event_type`/shape become
//! [`AgentEvent::Unknown`] instead of an error, so the reducer can log and
//! drop them.

pub mod play;
pub mod sse;
pub mod tools;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TOOL_ACTION_STARTED: &str = "progress_update_tool_action_started";
pub const TOOL_ACTION_LOG: &str = "progress_update_tool_action_log";
pub const TOOL_ACTION_COMPLETED: &str = "progress_update_tool_action_completed";
pub const TOOL_ACTION_FAILED: &str = "progress_update_tool_action_failed";
pub const AGENT_OUTPUT: &str = "agent_output";
pub const RUN_CANCELLED: &str = "run_cancelled";
pub const RUN_FAILED: &str = "run_failed";
pub const RUN_LOG: &str = "run_log";

/// Raw `{event_type, task_id, timestamp, data, error}` envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    pub event_type: String,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// Tool invocation descriptor shared by started/completed/failed messages.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Arguments object; JSON-encoded strings are decoded.
    pub arguments: Value,
}

impl ToolCall {
    /// String argument lookup.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

/// Closed set of agent stream events.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    ToolStarted { call: ToolCall },
    ToolLog { action_id: String, chunk: String },
    ToolCompleted { call: ToolCall, output: Value },
    ToolFailed { call: ToolCall, error: String },
    AgentOutput { content: String },
    RunCancelled { reason: Option<String> },
    RunFailed { error: String },
    RunLog { message: String },
    Unknown { event_type: String, reason: String },
}

impl AgentEvent {
    /// Short label for logs.
    pub fn label(&self) -> &str {
        match self {
            Self::ToolStarted { .. } => TOOL_ACTION_STARTED,
            Self::ToolLog { .. } => TOOL_ACTION_LOG,
            Self::ToolCompleted { .. } => TOOL_ACTION_COMPLETED,
            Self::ToolFailed { .. } => TOOL_ACTION_FAILED,
            Self::AgentOutput { .. } => AGENT_OUTPUT,
            Self::RunCancelled { .. } => RUN_CANCELLED,
            Self::RunFailed { .. } => RUN_FAILED,
            Self::RunLog { .. } => RUN_LOG,
            Self::Unknown { event_type, .. } => event_type,
        }
    }
}

/// One parsed message plus the task id it claims to belong to.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentMessage {
    pub task_id: Option<String>,
    pub event: AgentEvent,
}

/// Parse one SSE `data` payload.
pub fn parse_agent_payload(payload: &str) -> AgentMessage {
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => parse_agent_message(&value),
        Err(err) => AgentMessage {
            task_id: None,
            event: AgentEvent::Unknown {
                event_type: String::new(),
                reason: format!("payload is not JSON: {err}"),
            },
        },
    }
}

/// Parse one decoded JSON message.
pub fn parse_agent_message(value: &Value) -> AgentMessage {
    let envelope = match WireEnvelope::deserialize(value) {
        Ok(envelope) => envelope,
        Err(err) => {
            return AgentMessage {
                task_id: None,
                event: AgentEvent::Unknown {
                    event_type: value
                        .get("event_type")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    reason: format!("malformed envelope: {err}"),
                },
            }
        }
    };
    let task_id = envelope.task_id.clone();
    let event = parse_envelope(&envelope);
    AgentMessage { task_id, event }
}

fn parse_envelope(envelope: &WireEnvelope) -> AgentEvent {
    let data = envelope.data.as_ref().unwrap_or(&Value::Null);
    let unknown = |reason: &str| AgentEvent::Unknown {
        event_type: envelope.event_type.clone(),
        reason: reason.to_string(),
    };

    match envelope.event_type.as_str() {
        TOOL_ACTION_STARTED => match started_call(data) {
            Some(call) => AgentEvent::ToolStarted { call },
            None => unknown("missing tool call descriptor in data.args[0]"),
        },
        TOOL_ACTION_LOG => match log_chunk(data) {
            Some((action_id, chunk)) => AgentEvent::ToolLog { action_id, chunk },
            None => unknown("log message without an action id"),
        },
        TOOL_ACTION_COMPLETED => {
            let Some(result) = data.get("result") else {
                return unknown("missing data.result");
            };
            match result.get("tool_call").and_then(parse_call) {
                Some(call) => AgentEvent::ToolCompleted {
                    call,
                    output: result.get("output_data").cloned().unwrap_or(Value::Null),
                },
                None => unknown("missing data.result.tool_call"),
            }
        }
        TOOL_ACTION_FAILED => {
            let call = data
                .get("result")
                .and_then(|r| r.get("tool_call"))
                .and_then(parse_call)
                .or_else(|| started_call(data));
            let error = envelope
                .error
                .as_ref()
                .and_then(value_text)
                .or_else(|| data.get("error").and_then(value_text))
                .unwrap_or_else(|| "tool failed".to_string());
            match call {
                Some(call) => AgentEvent::ToolFailed { call, error },
                None => unknown("failed message without a tool call"),
            }
        }
        AGENT_OUTPUT => AgentEvent::AgentOutput {
            content: value_text(data).unwrap_or_default(),
        },
        RUN_CANCELLED => AgentEvent::RunCancelled {
            reason: value_text(data),
        },
        RUN_FAILED => AgentEvent::RunFailed {
            error: envelope
                .error
                .as_ref()
                .and_then(value_text)
                .or_else(|| value_text(data))
                .unwrap_or_else(|| "run failed".to_string()),
        },
        RUN_LOG => AgentEvent::RunLog {
            message: value_text(data).unwrap_or_default(),
        },
        _ => unknown("unrecognized event_type"),
    }
}

fn started_call(data: &Value) -> Option<ToolCall> {
    data.get("args")
        .and_then(Value::as_array)
        .and_then(|args| args.first())
        .and_then(parse_call)
}

fn parse_call(raw: &Value) -> Option<ToolCall> {
    let id = id_text(raw.get("id")?)?;
    let function = raw.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();
    let arguments = match function.get("arguments") {
        Some(args) => tools::decode_embedded_json(args),
        None => Value::Null,
    };
    Some(ToolCall {
        id,
        name,
        arguments,
    })
}

fn log_chunk(data: &Value) -> Option<(String, String)> {
    let action_id = data
        .get("id")
        .or_else(|| data.get("tool_id"))
        .and_then(id_text)?;
    let chunk = data
        .get("data")
        .or_else(|| data.get("chunk"))
        .and_then(value_text)
        .unwrap_or_default();
    Some((action_id, chunk))
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Render a loosely typed value as display text; `null` becomes `None`.
pub(crate) fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .or_else(|| Some(value.to_string())),
        other => Some(other.to_string()),
    }
}
