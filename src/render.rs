//! Plain-text rendering of reconciled runs.
//!
//! `RenderSink` is the output contract used by the CLI; [`RunView`] turns the
//! current state of a run into incremental sink calls, printing each action
//! once and then only its status changes and new log output.

use crate::store::{Action, ActionKind, ActionStatus, Run};
use crate::textutil::{preview_line, tail_by_chars};
use serde_json::Value;
use std::collections::HashMap;

const ARGUMENT_PREVIEW_CHARS: usize = 120;
const OUTPUT_BLOCK_CHARS: usize = 4_000;

/// Injectable rendering interface.
pub trait RenderSink: Send + Sync {
    /// Render one assistant message destined for stdout.
    fn assistant_message(&self, content: &str);
    /// Render a titled section divider.
    fn section(&self, title: &str);
    /// Render activity/lifecycle text.
    fn activity(&self, text: &str);
    /// Render one key/value field row.
    fn field(&self, key: &str, value: &str);
    /// Render additional detail text.
    fn detail(&self, text: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);
    /// Render raw command output as a block.
    fn command_output_block(&self, text: &str);
    /// Render approval-related text as a block.
    fn approval_block(&self, text: &str);
}

/// Default sink: assistant text on stdout, everything else on stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextRenderer;

impl RenderSink for TextRenderer {
    fn assistant_message(&self, content: &str) {
        println!("{content}");
    }

    fn section(&self, title: &str) {
        eprintln!("== {title} ==");
    }

    fn activity(&self, text: &str) {
        eprintln!("• {text}");
    }

    fn field(&self, key: &str, value: &str) {
        eprintln!("  {key}: {value}");
    }

    fn detail(&self, text: &str) {
        for line in text.lines() {
            eprintln!("    {line}");
        }
    }

    fn warn(&self, msg: &str) {
        eprintln!("warning: {msg}");
    }

    fn error(&self, msg: &str) {
        eprintln!("error: {msg}");
    }

    fn command_output_block(&self, text: &str) {
        for line in text.lines() {
            eprintln!("  | {line}");
        }
    }

    fn approval_block(&self, text: &str) {
        eprintln!("?? {text}");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SeenAction {
    kind: &'static str,
    status: ActionStatus,
    logs_len: usize,
}

/// Remembers what has already been printed for every run.
#[derive(Debug, Default)]
pub struct RunView {
    seen: HashMap<(String, String), SeenAction>,
}

impl RunView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Print whatever changed in `run` since the last call.
    pub fn render(&mut self, run: &Run, sink: &dyn RenderSink) {
        for action in &run.actions {
            let key = (run.id.clone(), action.id.clone());
            let current = SeenAction {
                kind: kind_label(&action.kind),
                status: action.status,
                logs_len: action.logs.as_deref().map_or(0, str::len),
            };
            let previous = self.seen.get(&key).cloned();
            match &previous {
                None => render_action(action, sink),
                Some(seen) if seen.kind != current.kind => render_action(action, sink),
                Some(seen) if seen.status != current.status => {
                    render_status_change(action, sink)
                }
                Some(_) => {}
            }
            if let Some(logs) = action.logs.as_deref() {
                let from = previous.as_ref().map_or(0, |seen| seen.logs_len);
                if let Some(delta) = logs.get(from..).filter(|delta| !delta.is_empty()) {
                    sink.command_output_block(delta);
                }
            }
            self.seen.insert(key, current);
        }
    }
}

/// Stable label for an action variant.
pub fn kind_label(kind: &ActionKind) -> &'static str {
    match kind {
        ActionKind::UserMessage { .. } => "user_message",
        ActionKind::AssistantThought { .. } => "assistant_thought",
        ActionKind::ToolStarted { .. } => "tool_started",
        ActionKind::ToolCompleted { .. } => "tool_completed",
        ActionKind::ToolFailed { .. } => "tool_failed",
        ActionKind::ExecRequest { .. } => "exec_request",
        ActionKind::ExecResult { .. } => "exec_result",
        ActionKind::SystemNotice { .. } => "system_notice",
        ActionKind::FinalAnswer { .. } => "final_answer",
    }
}

fn render_action(action: &Action, sink: &dyn RenderSink) {
    match &action.kind {
        ActionKind::UserMessage { content } => sink.field("prompt", &preview_line(content, 200)),
        ActionKind::AssistantThought { content } => sink.detail(content),
        ActionKind::ToolStarted {
            tool_name,
            arguments,
        } => sink.activity(&format!("{tool_name} {}", argument_preview(arguments))),
        ActionKind::ToolCompleted { tool_name, result } => {
            sink.activity(&format!("{tool_name} done"));
            let summary = value_preview(result);
            if !summary.is_empty() {
                sink.detail(&summary);
            }
        }
        ActionKind::ToolFailed { tool_name, error } => {
            sink.warn(&format!("{tool_name} failed: {error}"))
        }
        ActionKind::ExecRequest { .. } => match action.status {
            ActionStatus::Running => sink.approval_block(&format!(
                "agent requests code execution (action {})",
                action.id
            )),
            _ => render_status_change(action, sink),
        },
        ActionKind::ExecResult { output } => {
            sink.activity("execution result");
            sink.command_output_block(tail_by_chars(output, OUTPUT_BLOCK_CHARS));
        }
        ActionKind::SystemNotice { message } => sink.detail(message),
        ActionKind::FinalAnswer { content } => sink.assistant_message(content),
    }
}

fn render_status_change(action: &Action, sink: &dyn RenderSink) {
    let status = match action.status {
        ActionStatus::Pending => "pending",
        ActionStatus::Running => "running",
        ActionStatus::Done => "done",
        ActionStatus::Failed => "failed",
    };
    sink.activity(&format!("{} {} -> {status}", kind_label(&action.kind), action.id));
}

fn argument_preview(arguments: &Value) -> String {
    match arguments {
        Value::Null => String::new(),
        Value::Object(map) => {
            let path = ["file_path", "folder_path", "path", "entry_path"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str));
            match path {
                Some(path) => path.to_string(),
                None => preview_line(&arguments.to_string(), ARGUMENT_PREVIEW_CHARS),
            }
        }
        other => preview_line(&other.to_string(), ARGUMENT_PREVIEW_CHARS),
    }
}

fn value_preview(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => preview_line(text, ARGUMENT_PREVIEW_CHARS),
        other => preview_line(&other.to_string(), ARGUMENT_PREVIEW_CHARS),
    }
}
