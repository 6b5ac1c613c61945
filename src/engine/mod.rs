//! Single-writer engine actor and schema facade.
//!
//! One task owns the run store, workspaces, execution gate, sandbox
//! controller and stream transport. Commands, transport deliveries and
//! results of spawned create calls are all funnelled through one
//! `select!` loop, so no two mutations ever interleave. Command/event types
//! live in `schema`.

use crate::api::{ServerApi, StreamCredentials};
use crate::error::ApiError;
use crate::persist::{generate_thread_id, ProjectStore};
use crate::sandbox::{SandboxController, DEFAULT_COOLDOWN};
use crate::transport::{StreamKey, StreamTransport, TransportDelivery};
use crate::workspace::Workspace;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

mod play;
mod projects;
mod runs;
mod schema;
mod state;

pub use schema::*;
pub use state::EngineState;

/// Id of the `user_message` action every run starts with.
pub const USER_MESSAGE_ID: &str = "user_message";

/// Handle for sending commands to a spawned engine and reading its state.
#[derive(Clone)]
pub struct EngineHandle {
    pub commands: mpsc::Sender<EngineCommand>,
    pub state: Arc<Mutex<EngineState>>,
}

impl EngineHandle {
    /// Send one command to the engine actor.
    pub async fn send(&self, command: EngineCommand) -> Result<(), String> {
        self.commands
            .send(command)
            .await
            .map_err(|_| "engine command channel closed".to_string())
    }
}

/// Event stream receiver returned by [`spawn_engine`].
pub type EngineEventStream = mpsc::UnboundedReceiver<EngineEventEnvelope>;

/// Bootstrap inputs for the engine actor.
pub struct EngineConfig {
    pub user_id: String,
    /// Model requested for new runs unless the project picked one.
    pub model: Option<String>,
    pub project_id: String,
    pub project_name: Option<String>,
    /// Thread to rehydrate; a fresh thread is started when unset.
    pub thread_id: Option<String>,
    /// Initial project files; falls back to the persisted project state.
    pub workspace: Option<Workspace>,
    pub sandbox_cooldown: Duration,
    pub sandbox_runtime: Option<String>,
    pub project_store: Option<ProjectStore>,
}

impl EngineConfig {
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            model: None,
            project_id: project_id.into(),
            project_name: None,
            thread_id: None,
            workspace: None,
            sandbox_cooldown: DEFAULT_COOLDOWN,
            sandbox_runtime: None,
            project_store: None,
        }
    }
}

/// Spawn the engine actor. Must be called from within a tokio runtime.
pub fn spawn_engine(
    api: Arc<dyn ServerApi>,
    config: EngineConfig,
) -> (EngineHandle, EngineEventStream) {
    let (command_tx, mut command_rx) = mpsc::channel::<EngineCommand>(64);
    let (event_tx, event_rx) = mpsc::unbounded_channel::<EngineEventEnvelope>();

    let (state, warnings) = bootstrap_state(&config);
    let shared = Arc::new(Mutex::new(state));
    let actor_state = Arc::clone(&shared);

    tokio::spawn(async move {
        let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel::<TransportDelivery>();
        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<Internal>();
        let mut actor = EngineActor {
            transport: StreamTransport::new(api, delivery_tx),
            settings: EngineSettings {
                user_id: config.user_id,
                model: config.model,
                project_name: config.project_name,
                sandbox_runtime: config.sandbox_runtime,
            },
            project_store: config.project_store,
            event_tx,
            seq: 0,
            internal_tx,
            play_attempt: 0,
        };

        {
            let state = actor_state.lock().await;
            actor.emit(EngineEvent::Lifecycle(LifecycleEvent::EngineStarted {
                project_id: state.project_id.clone(),
                thread_id: state.thread_id.clone(),
            }));
        }
        for warning in warnings {
            actor.emit(EngineEvent::warning(None, warning));
        }

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    let mut state = actor_state.lock().await;
                    let Some(command) = command else {
                        actor.shutdown(&mut state);
                        break;
                    };
                    if actor.handle_command(&mut state, command) {
                        actor.emit(EngineEvent::Lifecycle(LifecycleEvent::EngineStopped));
                        break;
                    }
                }
                Some(delivery) = delivery_rx.recv() => {
                    let mut state = actor_state.lock().await;
                    actor.handle_delivery(&mut state, delivery);
                }
                Some(message) = internal_rx.recv() => {
                    let mut state = actor_state.lock().await;
                    actor.handle_internal(&mut state, message);
                }
                else => break,
            }
        }
        tracing::debug!("engine actor stopped");
    });

    (
        EngineHandle {
            commands: command_tx,
            state: shared,
        },
        event_rx,
    )
}

fn bootstrap_state(config: &EngineConfig) -> (EngineState, Vec<String>) {
    let mut warnings = Vec::new();
    let store = config.project_store.as_ref();

    let workspace = match (&config.workspace, store) {
        (Some(workspace), _) => workspace.clone(),
        (None, Some(store)) => match store.load_state() {
            Ok(persisted) => persisted
                .project_states
                .get(&config.project_id)
                .cloned()
                .map(Workspace::new)
                .unwrap_or_default(),
            Err(err) => {
                warnings.push(format!("failed to load project state: {err}"));
                Workspace::default()
            }
        },
        (None, None) => Workspace::default(),
    };

    let thread_id = config.thread_id.clone().unwrap_or_else(generate_thread_id);
    let mut state = EngineState::new(
        config.project_id.clone(),
        thread_id.clone(),
        workspace,
        SandboxController::new(config.sandbox_cooldown),
    );

    if let (Some(store), Some(_)) = (store, &config.thread_id) {
        match store.load_thread(&config.project_id, &thread_id) {
            Ok(Some(record)) => {
                state
                    .store
                    .merge_project_runs(&config.project_id, &record.snapshot, &thread_id);
            }
            Ok(None) => warnings.push(format!("thread `{thread_id}` not found; starting empty")),
            Err(err) => warnings.push(format!("failed to load thread `{thread_id}`: {err}")),
        }
    }
    (state, warnings)
}

struct EngineSettings {
    user_id: String,
    model: Option<String>,
    project_name: Option<String>,
    sandbox_runtime: Option<String>,
}

/// Completion notifications from spawned create calls.
enum Internal {
    RunCreated {
        project_id: String,
        thread_id: String,
        prompt: String,
        result: Result<StreamCredentials, ApiError>,
    },
    PlayCreated {
        attempt: u64,
        result: Result<StreamCredentials, ApiError>,
    },
}

struct EngineActor {
    transport: StreamTransport,
    settings: EngineSettings,
    project_store: Option<ProjectStore>,
    event_tx: mpsc::UnboundedSender<EngineEventEnvelope>,
    seq: u64,
    internal_tx: mpsc::UnboundedSender<Internal>,
    /// Bumped on every start/stop so late create results can be recognised.
    play_attempt: u64,
}

impl EngineActor {
    fn emit(&mut self, event: EngineEvent) {
        emit_event(&self.event_tx, &mut self.seq, event);
    }

    /// Returns true when the actor should stop.
    fn handle_command(&mut self, state: &mut EngineState, command: EngineCommand) -> bool {
        match command {
            EngineCommand::SubmitPrompt { prompt } => self.submit_prompt(state, prompt),
            EngineCommand::Decide {
                run_id,
                action_id,
                decision,
            } => self.decide(state, &run_id, &action_id, decision),
            EngineCommand::CancelRun { run_id } => self.cancel_run(state, &run_id),
            EngineCommand::StartPlay {
                entry_path,
                runtime,
                env,
            } => self.start_play_command(state, entry_path, runtime, env),
            EngineCommand::StopPlay => self.stop_play(state),
            EngineCommand::AcceptProposal { path } => {
                self.resolve_proposals(state, path.as_deref(), true)
            }
            EngineCommand::RejectProposal { path } => {
                self.resolve_proposals(state, path.as_deref(), false)
            }
            EngineCommand::SwitchProject { project_id, name } => {
                self.switch_project(state, &project_id, name)
            }
            EngineCommand::SwitchThread { thread_id } => self.switch_thread(state, &thread_id),
            EngineCommand::NewThread => self.new_thread(state),
            EngineCommand::SetActiveRun { run_id } => {
                state.active_run = run_id;
            }
            EngineCommand::Shutdown => {
                self.shutdown(state);
                return true;
            }
        }
        false
    }

    fn handle_delivery(&mut self, state: &mut EngineState, delivery: TransportDelivery) {
        let TransportDelivery {
            key,
            generation,
            item,
        } = delivery;
        if !self.transport.is_current(&key, generation) {
            tracing::debug!(?key, generation, "dropping delivery from a replaced subscription");
            return;
        }
        match key {
            StreamKey::Run(run_id) => self.on_run_delivery(state, &run_id, generation, item),
            StreamKey::Play => self.on_play_delivery(state, generation, item),
        }
    }

    fn handle_internal(&mut self, state: &mut EngineState, message: Internal) {
        match message {
            Internal::RunCreated {
                project_id,
                thread_id,
                prompt,
                result,
            } => self.on_run_created(state, &project_id, &thread_id, &prompt, result),
            Internal::PlayCreated { attempt, result } => {
                self.on_play_created(state, attempt, result)
            }
        }
    }

    /// Persist everything and close every subscription.
    fn shutdown(&mut self, state: &mut EngineState) {
        let (project_id, thread_id) = (state.project_id.clone(), state.thread_id.clone());
        self.save_thread(state, &project_id, &thread_id);
        self.save_project_state(state);
        if let Some(stop) = state.sandbox.stop(std::time::Instant::now()) {
            self.transport.stop_play_remote(stop);
        }
        self.transport.shutdown();
    }
}

fn emit_event(tx: &mpsc::UnboundedSender<EngineEventEnvelope>, seq: &mut u64, event: EngineEvent) {
    let _ = tx.send(EngineEventEnvelope::new(*seq, event));
    *seq = seq.saturating_add(1);
}
