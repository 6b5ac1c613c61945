//! CLI entry point for tether.

mod cli;

use clap::Parser;
use cli::{Command, PlayArgs, ReplayArgs, RunArgs, ThreadsArgs};
use std::path::Path;
use std::sync::Arc;
use tether::api::HttpServerApi;
use tether::config::{load_config_with_source, Config};
use tether::engine::{
    spawn_engine, EngineCommand, EngineConfig, EngineEvent, EngineEventStream, EngineHandle,
    LifecycleEvent, RunEvent, SandboxEvent, WorkspaceEvent,
};
use tether::gate::ExecDecision;
use tether::persist::{project_id_for_dir, ProjectStore};
use tether::reducer::ReducerEffect;
use tether::render::{RenderSink, RunView, TextRenderer};
use tether::replay::replay_log;
use tether::sandbox::SandboxNotice;
use tether::store::{now_unix_millis, RunStatus};
use tether::workspace::Workspace;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info";

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();

    let loaded = match load_config_with_source(args.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    let mut config = loaded.config;
    if let Some(base_url) = &args.base_url {
        config.server.base_url = base_url.trim_end_matches('/').to_string();
    }
    init_tracing(&config);
    tracing::debug!(source = ?loaded.source, base_url = %config.server.base_url, "config loaded");

    let result = match args.command {
        Command::Run(run) => run_prompt(&config, run).await,
        Command::Play(play) => run_play(&config, play).await,
        Command::Replay(replay) => replay_file(replay),
        Command::Threads(threads) => list_threads(&config, threads),
    };
    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

/// `RUST_LOG` wins over `[log] filter`, which wins over the built-in default.
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = config.log.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER);
        EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(config: &Config) -> Option<ProjectStore> {
    match ProjectStore::open(&config.threads.state_dir, config.threads.max_threads) {
        Ok(store) => Some(store),
        Err(e) => {
            eprintln!("warning: thread persistence disabled: {e}");
            None
        }
    }
}

fn engine_config(config: &Config, project: &Path, workspace: Workspace) -> EngineConfig {
    let project_id = project_id_for_dir(project);
    let mut engine = EngineConfig::new(config.server.user_id.clone(), project_id.clone());
    engine.model = config.server.model.clone();
    engine.project_name = Some(project_id);
    engine.workspace = Some(workspace);
    engine.sandbox_cooldown = config.sandbox.cooldown();
    engine.sandbox_runtime = config.sandbox.runtime.clone();
    engine
}

async fn run_prompt(config: &Config, args: RunArgs) -> Result<i32, String> {
    let workspace = Workspace::from_dir(&args.project)
        .map_err(|e| format!("failed to read {}: {e}", args.project.display()))?;
    let mut engine = engine_config(config, &args.project, workspace);
    if args.model.is_some() {
        engine.model = args.model.clone();
    }
    engine.thread_id = args.thread.clone();
    engine.project_store = open_store(config);

    let api = Arc::new(HttpServerApi::new(
        &config.server.base_url,
        config.server.timeout(),
    ));
    let (handle, mut events) = spawn_engine(api, engine);
    handle
        .send(EngineCommand::SubmitPrompt {
            prompt: args.prompt.clone(),
        })
        .await?;

    let sink = TextRenderer;
    let mut view = RunView::new();
    let mut run_id: Option<String> = None;
    let mut status: Option<RunStatus> = None;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        let envelope = tokio::select! {
            envelope = events.recv() => envelope,
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                match &run_id {
                    Some(id) => {
                        sink.warn("cancelling run");
                        handle.send(EngineCommand::CancelRun { run_id: id.clone() }).await?;
                    }
                    None => break,
                }
                continue;
            }
        };
        let Some(envelope) = envelope else {
            break;
        };
        match envelope.event {
            EngineEvent::Run(RunEvent::Created { run_id: id, .. }) => {
                sink.section(&format!("run {id}"));
                run_id = Some(id);
            }
            EngineEvent::Run(RunEvent::Updated {
                run_id: id,
                status: current,
                ..
            }) if run_id.as_deref() == Some(id.as_str()) => {
                {
                    let state = handle.state.lock().await;
                    if let Some(run) = state.store().run(&id) {
                        view.render(run, &sink);
                    }
                }
                if current.is_terminal() {
                    status = Some(current);
                    break;
                }
            }
            EngineEvent::Run(RunEvent::StreamEnded { run_id: id, error })
                if run_id.as_deref() == Some(id.as_str()) =>
            {
                match error {
                    Some(error) => sink.error(&format!("stream ended: {error}")),
                    None => sink.warn("stream ended before the run finished"),
                }
                break;
            }
            EngineEvent::Run(RunEvent::ResumeDeferred { action_id, .. }) => {
                sink.detail(&format!("decision on {action_id} sent once the agent is ready"));
            }
            EngineEvent::Effect(ReducerEffect::ExecRequested {
                run_id: id,
                action_id,
            }) if run_id.as_deref() == Some(id.as_str()) => {
                let decision = decide(&args, &action_id).await?;
                handle
                    .send(EngineCommand::Decide {
                        run_id: id,
                        action_id,
                        decision,
                    })
                    .await?;
            }
            EngineEvent::Effect(ReducerEffect::ProposalAdded { path, .. }) => {
                sink.field("proposed", &path);
            }
            EngineEvent::Effect(ReducerEffect::PreviewUrl { url, .. }) => {
                sink.field("preview", &url);
            }
            EngineEvent::Sandbox(event) => render_sandbox(&sink, event),
            EngineEvent::Warning(warning) => sink.warn(&warning.message),
            EngineEvent::Error(error) => {
                sink.error(&error.message);
                let Some(id) = run_id.clone() else {
                    // Nothing to follow when the run could not be created.
                    break;
                };
                if error.run_id.as_deref() != Some(id.as_str()) {
                    continue;
                }
                // A failed sandbox leaves the request open for another decision.
                let retry = {
                    let state = handle.state.lock().await;
                    state.undecided_exec(&id).map(ToString::to_string)
                };
                let Some(action_id) = retry else {
                    continue;
                };
                if args.approve {
                    sink.warn("code execution failed; cancelling run");
                    handle.send(EngineCommand::CancelRun { run_id: id }).await?;
                } else {
                    let decision = decide(&args, &action_id).await?;
                    handle
                        .send(EngineCommand::Decide {
                            run_id: id,
                            action_id,
                            decision,
                        })
                        .await?;
                }
            }
            _ => {}
        }
    }

    if run_id.is_some() {
        finish_proposals(&handle, &mut events, &args.project, args.apply, &sink).await?;
    }
    shutdown(&handle, &mut events).await;
    Ok(if status == Some(RunStatus::Done) { 0 } else { 1 })
}

async fn decide(args: &RunArgs, action_id: &str) -> Result<ExecDecision, String> {
    if args.approve {
        return Ok(ExecDecision::Accept);
    }
    if args.reject {
        return Ok(ExecDecision::Reject);
    }
    TextRenderer.approval_block(&format!("run the agent's code for {action_id}? [y/N]"));
    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await
    .map_err(|e| format!("approval prompt failed: {e}"))?
    .map_err(|e| format!("failed to read approval: {e}"))?;
    Ok(match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ExecDecision::Accept,
        _ => ExecDecision::Reject,
    })
}

async fn finish_proposals(
    handle: &EngineHandle,
    events: &mut EngineEventStream,
    project: &Path,
    apply: bool,
    sink: &dyn RenderSink,
) -> Result<(), String> {
    let pending = {
        let state = handle.state.lock().await;
        state.workspace().map_or(0, |ws| ws.proposals().len())
    };
    if pending == 0 {
        return Ok(());
    }
    if !apply {
        sink.activity(&format!(
            "{pending} proposed file change(s) pending; re-run with --apply to write them"
        ));
        return Ok(());
    }

    handle
        .send(EngineCommand::AcceptProposal { path: None })
        .await?;
    while let Some(envelope) = events.recv().await {
        let EngineEvent::Workspace(WorkspaceEvent::ProposalsResolved { accepted, .. }) =
            envelope.event
        else {
            continue;
        };
        let state = handle.state.lock().await;
        if let Some(workspace) = state.workspace() {
            workspace
                .write_files(project, &accepted)
                .map_err(|e| format!("failed to write files: {e}"))?;
        }
        for path in &accepted {
            sink.field("wrote", path);
        }
        break;
    }
    Ok(())
}

fn render_sandbox(sink: &dyn RenderSink, event: SandboxEvent) {
    match event {
        SandboxEvent::Starting {
            entry_path,
            delay_ms,
            ..
        } => {
            if delay_ms > 0 {
                sink.activity(&format!("starting {entry_path} in {delay_ms}ms"));
            } else {
                sink.activity(&format!("starting {entry_path}"));
            }
        }
        SandboxEvent::Created { task_id } => sink.field("sandbox task", &task_id),
        SandboxEvent::Notice(notice) => match notice {
            SandboxNotice::Started { runtime } => sink.field("runtime", &runtime),
            SandboxNotice::SandboxId { sandbox_id } => sink.field("sandbox", &sandbox_id),
            SandboxNotice::Preview { url, .. } => sink.field("preview", &url),
            SandboxNotice::Log { chunk } => sink.command_output_block(&chunk),
            SandboxNotice::Done { exit_code } => sink.activity(&format!("exited with {exit_code}")),
            SandboxNotice::Error { message } => sink.error(&message),
        },
        SandboxEvent::Stopped => sink.activity("sandbox stopped"),
    }
}

async fn run_play(config: &Config, args: PlayArgs) -> Result<i32, String> {
    let workspace = Workspace::from_dir(&args.project)
        .map_err(|e| format!("failed to read {}: {e}", args.project.display()))?;
    let mut engine = engine_config(config, &args.project, workspace);
    // Sessions started from the CLI are not delayed by a previous process.
    engine.sandbox_cooldown = std::time::Duration::ZERO;

    let api = Arc::new(HttpServerApi::new(
        &config.server.base_url,
        config.server.timeout(),
    ));
    let (handle, mut events) = spawn_engine(api, engine);
    handle
        .send(EngineCommand::StartPlay {
            entry_path: Some(args.entry.clone()),
            runtime: args.runtime.clone(),
            env: None,
        })
        .await?;

    let sink = TextRenderer;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut code = 1;

    loop {
        let envelope = tokio::select! {
            envelope = events.recv() => envelope,
            _ = &mut ctrl_c => {
                handle.send(EngineCommand::StopPlay).await?;
                sink.warn("sandbox stopped by user");
                break;
            }
        };
        let Some(envelope) = envelope else {
            break;
        };
        match envelope.event {
            EngineEvent::Sandbox(SandboxEvent::Notice(SandboxNotice::Log { chunk })) => {
                print!("{chunk}");
            }
            EngineEvent::Sandbox(SandboxEvent::Notice(SandboxNotice::Done { exit_code })) => {
                sink.activity(&format!("exited with {exit_code}"));
                code = i32::try_from(exit_code).unwrap_or(1);
                break;
            }
            EngineEvent::Sandbox(SandboxEvent::Notice(SandboxNotice::Error { message })) => {
                sink.error(&message);
                break;
            }
            EngineEvent::Sandbox(event) => render_sandbox(&sink, event),
            EngineEvent::Warning(warning) => sink.warn(&warning.message),
            EngineEvent::Error(error) => {
                sink.error(&error.message);
                break;
            }
            _ => {}
        }
    }

    shutdown(&handle, &mut events).await;
    Ok(code)
}

fn replay_file(args: ReplayArgs) -> Result<i32, String> {
    let log = std::fs::read_to_string(&args.file)
        .map_err(|e| format!("failed to read {}: {e}", args.file.display()))?;
    let output = replay_log(&log, args.run_id.as_deref());
    let json = serde_json::to_string_pretty(&output)
        .map_err(|e| format!("failed to encode replay: {e}"))?;
    println!("{json}");
    Ok(0)
}

fn list_threads(config: &Config, args: ThreadsArgs) -> Result<i32, String> {
    let store = ProjectStore::open(&config.threads.state_dir, config.threads.max_threads)
        .map_err(|e| e.to_string())?;
    let project_id = args
        .project
        .unwrap_or_else(|| project_id_for_dir(Path::new(".")));
    let threads = store.list_threads(&project_id).map_err(|e| e.to_string())?;
    if threads.is_empty() {
        eprintln!("no threads for project `{project_id}`");
        return Ok(0);
    }
    let now = now_unix_millis();
    for thread in threads {
        println!(
            "{}  {:>8}  {}",
            thread.id,
            format_age(now.saturating_sub(thread.updated_at_millis)),
            thread.title
        );
    }
    Ok(0)
}

fn format_age(elapsed_ms: u64) -> String {
    let secs = elapsed_ms / 1_000;
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3_599 => format!("{}m ago", secs / 60),
        3_600..=86_399 => format!("{}h ago", secs / 3_600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

/// Ask the engine to persist and stop, then drain until it confirms.
async fn shutdown(handle: &EngineHandle, events: &mut EngineEventStream) {
    if handle.send(EngineCommand::Shutdown).await.is_err() {
        return;
    }
    while let Some(envelope) = events.recv().await {
        match envelope.event {
            EngineEvent::Lifecycle(LifecycleEvent::EngineStopped) => break,
            EngineEvent::Warning(warning) => eprintln!("warning: {}", warning.message),
            _ => {}
        }
    }
}
