//! `progress_update_tool_action_completed` handling.

use super::{ReducerContext, ReducerEffect};
use crate::protocol::tools::{FsDelta, SandboxRunOutput, ToolOutput};
use crate::protocol::{tools, ToolCall};
use crate::store::{Action, ActionKind, ActionStatus, RunStatus};
use crate::workspace::TreeOp;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde_json::{json, Value};

pub(super) fn apply_completed(
    ctx: &mut ReducerContext<'_>,
    run_id: &str,
    call: &ToolCall,
    output: &Value,
    effects: &mut Vec<ReducerEffect>,
) {
    let parsed = ToolOutput::parse(&call.name, output);
    match parsed {
        ToolOutput::ExecRequest {
            response_on_reject,
            resume_token,
            result,
        } => {
            attach_exec_output(ctx, run_id, call, response_on_reject, resume_token, result, effects);
        }
        ToolOutput::FileWrite { file_path, content } => {
            ctx.workspace.propose(&file_path, content);
            effects.push(ReducerEffect::ProposalAdded {
                run_id: run_id.to_string(),
                path: file_path.clone(),
            });
            upsert_completed(ctx, run_id, call, json!({ "file_path": file_path }));
        }
        ToolOutput::FileWriteError { error } => {
            upsert_failed(ctx, run_id, call, error);
        }
        ToolOutput::Rename {
            old_path,
            new_path,
            folder,
        } => {
            let op = if folder {
                TreeOp::RenameFolder {
                    from: old_path,
                    to: new_path,
                }
            } else {
                TreeOp::RenameFile {
                    from: old_path,
                    to: new_path,
                }
            };
            apply_tree(ctx, run_id, call, op, output, effects);
        }
        ToolOutput::DeleteFile { file_path } => {
            apply_tree(ctx, run_id, call, TreeOp::DeleteFile { path: file_path }, output, effects);
        }
        ToolOutput::CreateFolder { folder_path } => {
            apply_tree(ctx, run_id, call, TreeOp::CreateFolder { path: folder_path }, output, effects);
        }
        ToolOutput::DeleteFolder { folder_path } => {
            apply_tree(ctx, run_id, call, TreeOp::DeleteFolder { path: folder_path }, output, effects);
        }
        ToolOutput::Think(thought) => {
            upsert_completed(ctx, run_id, call, Value::String(thought.clone()));
            ctx.store.add_action(
                run_id,
                Action::new(
                    format!("{}-thought", call.id),
                    ActionStatus::Done,
                    ActionKind::AssistantThought { content: thought },
                ),
            );
        }
        ToolOutput::SandboxRun(run) => {
            apply_sandbox_run(ctx, run_id, call, &run, output, effects);
        }
        ToolOutput::ShowPreview { url, port, label } => {
            effects.push(ReducerEffect::PreviewUrl {
                run_id: run_id.to_string(),
                url,
                port,
                label,
            });
            upsert_completed(ctx, run_id, call, output.clone());
        }
        ToolOutput::Other(value) => {
            upsert_completed(ctx, run_id, call, value);
        }
    }
}

/// Attach the resume token (and any reject text) to the exec request without
/// touching its status.
fn attach_exec_output(
    ctx: &mut ReducerContext<'_>,
    run_id: &str,
    call: &ToolCall,
    response_on_reject: Option<String>,
    resume_token: Option<String>,
    result: Option<String>,
    effects: &mut Vec<ReducerEffect>,
) {
    let existing = ctx.store.action(run_id, &call.id).cloned();
    match existing {
        Some(action) if action.kind.is_exec_request() => {
            let status = action.status;
            let token_attached = resume_token.is_some();
            ctx.store.update_action(run_id, &call.id, |current| {
                let mut next = current.cloned().unwrap_or(action);
                if let ActionKind::ExecRequest {
                    response_on_reject: reject_text,
                    resume_token: token,
                } = &mut next.kind
                {
                    if reject_text.is_none() {
                        *reject_text = response_on_reject;
                    }
                    if resume_token.is_some() {
                        *token = resume_token;
                    }
                }
                if let Some(result) = result {
                    next.merge_metadata("result", json!(result));
                }
                next
            });
            if token_attached {
                effects.push(ReducerEffect::ResumeTokenAttached {
                    run_id: run_id.to_string(),
                    action_id: call.id.clone(),
                    still_pending: status == ActionStatus::Running,
                });
            }
        }
        Some(_) => {
            tracing::debug!(run_id, action_id = %call.id, "exec output for a non-exec action; dropping");
        }
        None => {
            let other_request = ctx
                .store
                .run(run_id)
                .is_some_and(|run| run.actions.iter().any(|a| a.kind.is_exec_request()));
            if other_request || resume_token.is_none() {
                tracing::debug!(run_id, action_id = %call.id, "dropping exec output without a matching request");
                return;
            }
            // The started message never arrived; open the request from here.
            ctx.store.add_action(
                run_id,
                Action::new(
                    call.id.clone(),
                    ActionStatus::Running,
                    ActionKind::ExecRequest {
                        response_on_reject: response_on_reject
                            .or_else(|| call.arg_str("response_on_reject").map(ToString::to_string)),
                        resume_token,
                    },
                ),
            );
            ctx.store.set_run_status(run_id, RunStatus::WaitingExec);
            effects.push(ReducerEffect::ExecRequested {
                run_id: run_id.to_string(),
                action_id: call.id.clone(),
            });
            effects.push(ReducerEffect::ResumeTokenAttached {
                run_id: run_id.to_string(),
                action_id: call.id.clone(),
                still_pending: true,
            });
        }
    }
}

fn apply_tree(
    ctx: &mut ReducerContext<'_>,
    run_id: &str,
    call: &ToolCall,
    op: TreeOp,
    output: &Value,
    effects: &mut Vec<ReducerEffect>,
) {
    ctx.workspace.apply_tree_op(&op);
    effects.push(ReducerEffect::TreeChanged {
        run_id: run_id.to_string(),
        op,
    });
    upsert_completed(ctx, run_id, call, tools::decode_embedded_json(output));
}

fn apply_sandbox_run(
    ctx: &mut ReducerContext<'_>,
    run_id: &str,
    call: &ToolCall,
    run: &SandboxRunOutput,
    output: &Value,
    effects: &mut Vec<ReducerEffect>,
) {
    if let Some(url) = &run.preview_url {
        effects.push(ReducerEffect::PreviewUrl {
            run_id: run_id.to_string(),
            url: url.clone(),
            port: None,
            label: None,
        });
    }
    if let Some(fs) = &run.fs {
        apply_fs_delta(ctx, run_id, call, fs, effects);
    }

    // Sampled file contents live in the proposal overlay, not the history.
    let mut summary = tools::decode_embedded_json(output);
    if let Some(fs) = summary.get_mut("fs").and_then(Value::as_object_mut) {
        fs.remove("data");
    }
    upsert_completed(ctx, run_id, call, summary);
}

fn apply_fs_delta(
    ctx: &mut ReducerContext<'_>,
    run_id: &str,
    call: &ToolCall,
    fs: &FsDelta,
    effects: &mut Vec<ReducerEffect>,
) {
    let matcher = ctx.workspace.ignore_matcher();

    for path in &fs.created {
        if matcher.is_ignored(path) {
            continue;
        }
        if ctx.workspace.ensure_file(path) {
            effects.push(ReducerEffect::FileMaterialized {
                run_id: run_id.to_string(),
                path: path.clone(),
            });
        }
    }

    for sample in &fs.data {
        if matcher.is_ignored(&sample.path) {
            continue;
        }
        let content = match sample.encoding.as_deref() {
            Some("base64") => match B64.decode(sample.content.trim()) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::debug!(run_id, path = %sample.path, "skipping binary sandbox sample");
                        continue;
                    }
                },
                Err(err) => {
                    tracing::warn!(run_id, path = %sample.path, error = %err, "invalid base64 sandbox sample");
                    continue;
                }
            },
            _ => sample.content.clone(),
        };
        if ctx.workspace.files().get(&sample.path) == Some(&content) {
            continue;
        }
        ctx.workspace.propose(&sample.path, content);
        effects.push(ReducerEffect::ProposalAdded {
            run_id: run_id.to_string(),
            path: sample.path.clone(),
        });
    }

    let deleted: Vec<&str> = fs
        .deleted
        .iter()
        .map(String::as_str)
        .filter(|path| !matcher.is_ignored(path))
        .collect();
    if !deleted.is_empty() {
        ctx.store.add_action(
            run_id,
            Action::new(
                format!("{}-deleted", call.id),
                ActionStatus::Done,
                ActionKind::SystemNotice {
                    message: format!(
                        "Sandbox run deleted {} file(s): {}",
                        deleted.len(),
                        deleted.join(", ")
                    ),
                },
            ),
        );
    }
}

/// Upsert a `tool_completed` action, keeping streamed logs and metadata.
pub(super) fn upsert_completed(ctx: &mut ReducerContext<'_>, run_id: &str, call: &ToolCall, result: Value) {
    let tool_name = call.name.clone();
    ctx.store.update_action(run_id, &call.id, |existing| {
        let mut next = Action::new(
            call.id.clone(),
            ActionStatus::Done,
            ActionKind::ToolCompleted { tool_name, result },
        );
        if let Some(prev) = existing {
            next.timestamp_ms = prev.timestamp_ms;
            next.logs = prev.logs.clone();
            next.metadata = prev.metadata.clone();
        }
        next
    });
}

/// Upsert a `tool_failed` action, keeping streamed logs and metadata.
pub(super) fn upsert_failed(ctx: &mut ReducerContext<'_>, run_id: &str, call: &ToolCall, error: String) {
    let tool_name = call.name.clone();
    ctx.store.update_action(run_id, &call.id, |existing| {
        let mut next = Action::new(
            call.id.clone(),
            ActionStatus::Failed,
            ActionKind::ToolFailed { tool_name, error },
        );
        if let Some(prev) = existing {
            next.timestamp_ms = prev.timestamp_ms;
            next.logs = prev.logs.clone();
            next.metadata = prev.metadata.clone();
        }
        next
    });
}
