//! Sandbox session orchestration: user-started plays and accepted exec
//! requests share one controller.

use super::state::pick_entry;
use super::{EngineActor, EngineEvent, EngineState, Internal, SandboxEvent};
use crate::api::{CreatePlayRequest, StreamCredentials};
use crate::error::{ApiError, SandboxError};
use crate::sandbox::{RemoteStop, SandboxNotice, SandboxStatus};
use crate::transport::{StreamKey, TransportItem};
use std::collections::BTreeMap;
use std::time::Instant;

impl EngineActor {
    pub(super) fn start_play_command(
        &mut self,
        state: &mut EngineState,
        entry_path: Option<String>,
        runtime: Option<String>,
        env: Option<BTreeMap<String, String>>,
    ) {
        let project_id = state.project_id.clone();
        let entry = entry_path.or_else(|| pick_entry(state.workspace_mut(&project_id)));
        let Some(entry) = entry else {
            self.emit(EngineEvent::error(None, "no entry file to run"));
            return;
        };
        if let Err(err) = self.start_play(state, &project_id, &entry, runtime, env, None) {
            self.emit(EngineEvent::error(None, format!("cannot start sandbox: {err}")));
        }
    }

    /// Run the current files of the exec request's project.
    pub(super) fn start_exec_sandbox(&mut self, state: &mut EngineState, run_id: &str) {
        let project_id = state
            .store
            .run(run_id)
            .map(|run| run.project_id.clone())
            .unwrap_or_else(|| state.project_id.clone());
        let started = match pick_entry(state.workspace_mut(&project_id)) {
            Some(entry) => self
                .start_play(state, &project_id, &entry, None, None, Some(run_id))
                .map_err(|err| format!("cannot start sandbox: {err}")),
            None => Err("no entry file to run".to_string()),
        };
        if let Err(message) = started {
            if let Some(correlation) = state.gate.sandbox_failed(&mut state.store, &message) {
                self.emit(EngineEvent::error(Some(&correlation.run_id), message));
            }
        }
    }

    fn start_play(
        &mut self,
        state: &mut EngineState,
        project_id: &str,
        entry: &str,
        runtime: Option<String>,
        env: Option<BTreeMap<String, String>>,
        run_id: Option<&str>,
    ) -> Result<(), SandboxError> {
        let now = Instant::now();
        state.sandbox.tick(now);
        let runtime = runtime.or_else(|| self.settings.sandbox_runtime.clone());
        let delay = state.sandbox.begin(now, entry, runtime.as_deref())?;

        self.play_attempt = self.play_attempt.saturating_add(1);
        let attempt = self.play_attempt;
        let request = CreatePlayRequest {
            user_id: self.settings.user_id.clone(),
            project: state.workspace_mut(project_id).agent_payload(),
            entry_path: entry.to_string(),
            runtime,
            env,
        };
        self.emit(EngineEvent::Sandbox(SandboxEvent::Starting {
            entry_path: entry.to_string(),
            delay_ms: delay.as_millis() as u64,
            run_id: run_id.map(ToString::to_string),
        }));

        let api = self.transport.api();
        let done_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = api.create_play(&request).await;
            let _ = done_tx.send(Internal::PlayCreated { attempt, result });
        });
        Ok(())
    }

    pub(super) fn on_play_created(
        &mut self,
        state: &mut EngineState,
        attempt: u64,
        result: Result<StreamCredentials, ApiError>,
    ) {
        let stale =
            attempt != self.play_attempt || state.sandbox.status() != SandboxStatus::Starting;
        match result {
            Ok(credentials) if stale => {
                tracing::debug!(task_id = %credentials.task_id, "stopping sandbox created for a superseded start");
                self.transport.stop_play_remote(RemoteStop {
                    task_id: credentials.task_id,
                    stream_token: credentials.stream_token,
                    sandbox_id: None,
                });
            }
            Ok(credentials) => {
                if let Err(err) = state
                    .sandbox
                    .attach(&credentials.task_id, &credentials.stream_token)
                {
                    tracing::warn!(error = %err, "sandbox credentials arrived in unexpected state");
                    return;
                }
                self.transport
                    .connect_play(&credentials.task_id, &credentials.stream_token);
                self.emit(EngineEvent::Sandbox(SandboxEvent::Created {
                    task_id: credentials.task_id,
                }));
            }
            Err(err) if stale => {
                tracing::debug!(error = %err, "ignoring failure of a superseded sandbox start");
            }
            Err(err) => self.sandbox_failed(state, &format!("failed to start sandbox: {err}")),
        }
    }

    pub(super) fn on_play_delivery(
        &mut self,
        state: &mut EngineState,
        generation: u64,
        item: TransportItem,
    ) {
        match item {
            TransportItem::Play(event) => {
                let notices = state.sandbox.apply(Instant::now(), &event);
                let finished = notices.iter().any(|notice| {
                    matches!(notice, SandboxNotice::Done { .. } | SandboxNotice::Error { .. })
                });
                for notice in notices {
                    self.emit(EngineEvent::Sandbox(SandboxEvent::Notice(notice)));
                }
                if !finished {
                    return;
                }
                match state.sandbox.status() {
                    SandboxStatus::Done => self.sandbox_done(state),
                    SandboxStatus::Error => {
                        self.transport.disconnect_play();
                        let message = state
                            .sandbox
                            .session()
                            .error
                            .clone()
                            .unwrap_or_else(|| "sandbox failed".to_string());
                        self.release_exec(state, &message);
                    }
                    _ => {}
                }
            }
            TransportItem::Closed => {
                self.transport.finished(&StreamKey::Play, generation);
                if state.sandbox.status().is_active() {
                    self.sandbox_failed(state, "sandbox stream closed before completion");
                }
            }
            TransportItem::Failed(err) => {
                self.transport.finished(&StreamKey::Play, generation);
                if state.sandbox.status().is_active() {
                    self.sandbox_failed(state, &format!("sandbox stream failed: {err}"));
                }
            }
            TransportItem::Agent(message) => {
                tracing::warn!(event_type = message.event.label(), "agent event on the play subscription");
            }
        }
    }

    pub(super) fn stop_play(&mut self, state: &mut EngineState) {
        self.play_attempt = self.play_attempt.saturating_add(1);
        self.transport.disconnect_play();
        if !state.sandbox.status().is_active() {
            self.emit(EngineEvent::warning(None, "no sandbox session is running"));
            return;
        }
        if let Some(stop) = state.sandbox.stop(Instant::now()) {
            self.transport.stop_play_remote(stop);
        }
        self.emit(EngineEvent::Sandbox(SandboxEvent::Stopped));
        self.release_exec(state, "sandbox stopped");
    }

    fn sandbox_done(&mut self, state: &mut EngineState) {
        self.transport.disconnect_play();
        let session = state.sandbox.session();
        let (logs, exit_code) = (session.logs.clone(), session.exit_code);
        if let Some(outcome) = state
            .gate
            .sandbox_finished(&mut state.store, &logs, exit_code)
        {
            let run_id = outcome.run_id().to_string();
            self.handle_gate_outcome(state, outcome);
            self.emit_run_updated(state, &run_id);
        }
    }

    /// Fail the local session and release any exec request waiting on it.
    pub(super) fn sandbox_failed(&mut self, state: &mut EngineState, message: &str) {
        self.transport.disconnect_play();
        if let Some(notice) = state.sandbox.fail(Instant::now(), message) {
            self.emit(EngineEvent::Sandbox(SandboxEvent::Notice(notice)));
        }
        self.release_exec(state, message);
    }

    fn release_exec(&mut self, state: &mut EngineState, message: &str) {
        if let Some(correlation) = state.gate.sandbox_failed(&mut state.store, message) {
            self.emit(EngineEvent::error(
                Some(&correlation.run_id),
                format!("code execution did not complete: {message}"),
            ));
            self.emit_run_updated(state, &correlation.run_id);
        }
    }
}
