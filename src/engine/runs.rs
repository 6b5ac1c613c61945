//! Run lifecycle: prompt submission, stream deliveries, gate decisions and
//! cancellation.

use super::{EngineActor, EngineEvent, EngineState, Internal, RunEvent, USER_MESSAGE_ID};
use crate::api::{CreateRunRequest, StreamCredentials};
use crate::error::ApiError;
use crate::gate::{ExecDecision, GateOutcome, ResumeRequest};
use crate::protocol::AgentEvent;
use crate::reducer::ReducerEffect;
use crate::store::{Action, ActionKind, ActionStatus, RunStatus};
use crate::textutil::preview_line;
use crate::transport::{StreamKey, TransportItem};

const CANCELLED_BY_USER: &str = "Cancelled by user.";

impl EngineActor {
    pub(super) fn submit_prompt(&mut self, state: &mut EngineState, prompt: String) {
        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            self.emit(EngineEvent::error(None, "prompt is empty"));
            return;
        }
        let project_id = state.project_id.clone();
        let thread_id = state.thread_id.clone();
        let message_history = state.message_history();
        let workspace = state.workspace_mut(&project_id);
        let request = CreateRunRequest {
            user_id: self.settings.user_id.clone(),
            query: prompt.clone(),
            project: workspace.agent_payload(),
            message_history,
            model: workspace
                .state
                .model
                .clone()
                .or_else(|| self.settings.model.clone()),
        };
        tracing::info!(
            project_id = %project_id,
            thread_id = %thread_id,
            files = request.project.len(),
            history = request.message_history.len(),
            "submitting prompt"
        );
        self.emit(EngineEvent::Run(RunEvent::Queued {
            project_id: project_id.clone(),
            thread_id: thread_id.clone(),
            prompt: preview_line(&prompt, 80),
        }));

        let api = self.transport.api();
        let done_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = api.create_run(&request).await;
            let _ = done_tx.send(Internal::RunCreated {
                project_id,
                thread_id,
                prompt,
                result,
            });
        });
    }

    pub(super) fn on_run_created(
        &mut self,
        state: &mut EngineState,
        project_id: &str,
        thread_id: &str,
        prompt: &str,
        result: Result<StreamCredentials, ApiError>,
    ) {
        let credentials = match result {
            Ok(credentials) => credentials,
            Err(err) => {
                tracing::warn!(project_id, error = %err, "failed to create run");
                self.emit(EngineEvent::error(None, format!("failed to create run: {err}")));
                return;
            }
        };
        let run_id = credentials.task_id;
        if !state.store.create_run(&run_id, prompt, project_id, thread_id) {
            tracing::warn!(run_id = %run_id, "server reused an existing run id; ignoring");
            return;
        }
        state.store.add_action(
            &run_id,
            Action::new(
                USER_MESSAGE_ID,
                ActionStatus::Done,
                ActionKind::UserMessage {
                    content: prompt.to_string(),
                },
            ),
        );
        state.active_run = Some(run_id.clone());
        self.transport.connect(&run_id, &credentials.stream_token);
        self.emit(EngineEvent::Run(RunEvent::Created {
            run_id: run_id.clone(),
            project_id: project_id.to_string(),
            thread_id: thread_id.to_string(),
        }));
        self.emit_run_updated(state, &run_id);
    }

    pub(super) fn on_run_delivery(
        &mut self,
        state: &mut EngineState,
        run_id: &str,
        generation: u64,
        item: TransportItem,
    ) {
        match item {
            TransportItem::Agent(message) => {
                if message.task_id.as_deref().is_some_and(|task| task != run_id) {
                    tracing::warn!(
                        run_id,
                        task_id = ?message.task_id,
                        event_type = message.event.label(),
                        "dropping event addressed to another run"
                    );
                    return;
                }
                let effects = state.apply_agent_event(run_id, &message.event);
                self.route_effects(state, effects);
                self.emit_run_updated(state, run_id);
            }
            TransportItem::Closed => self.on_run_stream_end(state, run_id, generation, None),
            TransportItem::Failed(err) => {
                self.on_run_stream_end(state, run_id, generation, Some(err))
            }
            TransportItem::Play(event) => {
                tracing::warn!(run_id, ?event, "play event on a run subscription");
            }
        }
    }

    fn on_run_stream_end(
        &mut self,
        state: &mut EngineState,
        run_id: &str,
        generation: u64,
        error: Option<String>,
    ) {
        self.transport
            .finished(&StreamKey::Run(run_id.to_string()), generation);
        let status = state.store.run(run_id).map(|run| run.status);
        // A paused run closes its stream while it waits for a decision.
        if status == Some(RunStatus::WaitingExec) && error.is_none() {
            tracing::debug!(run_id, "stream closed while awaiting exec decision");
            return;
        }
        if status.is_some_and(RunStatus::is_terminal) {
            return;
        }
        match &error {
            Some(err) => tracing::warn!(run_id, error = %err, "run stream failed"),
            None => tracing::info!(run_id, "run stream closed before the run finished"),
        }
        self.emit(EngineEvent::Effect(ReducerEffect::ClearLoading {
            run_id: run_id.to_string(),
        }));
        self.emit(EngineEvent::Run(RunEvent::StreamEnded {
            run_id: run_id.to_string(),
            error: error.clone(),
        }));
        // Nothing more can arrive for a run whose stream broke.
        if let Some(err) = error {
            let effects = state.apply_agent_event(
                run_id,
                &AgentEvent::RunFailed {
                    error: format!("Connection to the agent failed: {err}"),
                },
            );
            self.route_effects(state, effects);
            self.emit_run_updated(state, run_id);
        }
    }

    pub(super) fn decide(
        &mut self,
        state: &mut EngineState,
        run_id: &str,
        action_id: &str,
        decision: ExecDecision,
    ) {
        let outcome = match state.gate.decide(&mut state.store, run_id, action_id, decision) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.emit(EngineEvent::error(Some(run_id), err.to_string()));
                return;
            }
        };
        self.emit(EngineEvent::Run(RunEvent::Decided {
            run_id: run_id.to_string(),
            action_id: action_id.to_string(),
            decision,
        }));
        self.handle_gate_outcome(state, outcome);
        self.emit_run_updated(state, run_id);
    }

    /// Stop listening and record the cancellation locally. The remote agent
    /// may keep going; whatever it still sends is dropped.
    pub(super) fn cancel_run(&mut self, state: &mut EngineState, run_id: &str) {
        let Some(status) = state.store.run(run_id).map(|run| run.status) else {
            self.emit(EngineEvent::error(Some(run_id), format!("unknown run `{run_id}`")));
            return;
        };
        if status.is_terminal() {
            self.emit(EngineEvent::error(
                Some(run_id),
                format!("run `{run_id}` already finished"),
            ));
            return;
        }
        self.transport.disconnect(run_id);
        self.drop_gate_state(state, run_id);
        let effects = state.apply_agent_event(
            run_id,
            &AgentEvent::RunCancelled {
                reason: Some(CANCELLED_BY_USER.to_string()),
            },
        );
        self.route_effects(state, effects);
        self.emit_run_updated(state, run_id);
    }

    pub(super) fn route_effects(&mut self, state: &mut EngineState, effects: Vec<ReducerEffect>) {
        for effect in effects {
            match &effect {
                ReducerEffect::ResumeTokenAttached {
                    run_id,
                    action_id,
                    still_pending: false,
                } => {
                    if let Some(request) = state.gate.token_attached(&state.store, run_id, action_id)
                    {
                        self.resume(request);
                    }
                }
                ReducerEffect::RunFinished { run_id, status } => {
                    self.transport.disconnect(run_id);
                    self.drop_gate_state(state, run_id);
                    tracing::info!(run_id = %run_id, status = ?status, "run finished");
                    if let Some((project_id, thread_id)) = state
                        .store
                        .run(run_id)
                        .map(|run| (run.project_id.clone(), run.thread_id.clone()))
                    {
                        self.save_thread(state, &project_id, &thread_id);
                    }
                }
                _ => {}
            }
            self.emit(EngineEvent::Effect(effect));
        }
    }

    /// Forget the run's gate state and stop any sandbox still executing its
    /// accepted request.
    fn drop_gate_state(&mut self, state: &mut EngineState, run_id: &str) {
        let owns_sandbox = state
            .gate
            .in_flight()
            .is_some_and(|correlation| correlation.run_id == run_id);
        if state.gate.cancel_run(run_id) {
            tracing::debug!(run_id, "dropped exec gate state for ended run");
        }
        if owns_sandbox {
            self.stop_play(state);
        }
    }

    pub(super) fn handle_gate_outcome(&mut self, state: &mut EngineState, outcome: GateOutcome) {
        match outcome {
            GateOutcome::Resume(request) => self.resume(request),
            GateOutcome::AwaitingToken(correlation) => {
                tracing::debug!(
                    run_id = %correlation.run_id,
                    action_id = %correlation.action_id,
                    "decision recorded before resume token"
                );
                self.emit(EngineEvent::Run(RunEvent::ResumeDeferred {
                    run_id: correlation.run_id,
                    action_id: correlation.action_id,
                }));
            }
            GateOutcome::StartSandbox(correlation) => {
                self.start_exec_sandbox(state, &correlation.run_id);
            }
        }
    }

    fn resume(&mut self, request: ResumeRequest) {
        self.transport
            .resume(&request.run_id, &request.resume_token, &request.result);
        self.emit(EngineEvent::Run(RunEvent::Resumed {
            run_id: request.run_id,
            action_id: request.action_id,
        }));
    }

    pub(super) fn emit_run_updated(&mut self, state: &EngineState, run_id: &str) {
        if let Some(run) = state.store.run(run_id) {
            let event = RunEvent::Updated {
                run_id: run.id.clone(),
                status: run.status,
                actions: run.actions.len(),
            };
            self.emit(EngineEvent::Run(event));
        }
    }
}
