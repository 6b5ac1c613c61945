//! Sandbox session lifecycle: `idle -> starting -> running -> done | error`,
//! with a timed `done/error -> idle` edge once the restart cooldown elapses.
//!
//! The controller is a pure state machine. It never sleeps or performs I/O;
//! callers pass `now` in and receive the delay to honour before a start
//! request, plus the remote stop to issue (if any).

use crate::error::SandboxError;
use crate::protocol::play::PlayEvent;
use crate::textutil::tail_by_chars;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Delay between a finished session and the next start request.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(1500);

const PREVIEW_LOG_MARKER: &str = "Preview available at:";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    #[default]
    Idle,
    Starting,
    Running,
    Done,
    Error,
}

impl SandboxStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// Ephemeral session state. Nothing here is ever persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxSession {
    pub status: SandboxStatus,
    pub entry_path: Option<String>,
    pub runtime: Option<String>,
    pub task_id: Option<String>,
    pub stream_token: Option<String>,
    pub sandbox_id: Option<String>,
    pub preview_url: Option<String>,
    pub preview_port: Option<u16>,
    pub logs: String,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
}

/// Changes surfaced to the caller as play events are folded in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum SandboxNotice {
    Started { runtime: String },
    SandboxId { sandbox_id: String },
    Preview { url: String, port: Option<u16> },
    Log { chunk: String },
    Done { exit_code: i64 },
    Error { message: String },
}

/// Identifiers for a best-effort remote teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStop {
    pub task_id: String,
    pub stream_token: String,
    pub sandbox_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SandboxController {
    session: SandboxSession,
    cooldown: Duration,
    finished_at: Option<Instant>,
}

impl Default for SandboxController {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

impl SandboxController {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            session: SandboxSession::default(),
            cooldown,
            finished_at: None,
        }
    }

    pub fn session(&self) -> &SandboxSession {
        &self.session
    }

    pub fn status(&self) -> SandboxStatus {
        self.session.status
    }

    /// Fire the `done/error -> idle` edge if the cooldown has elapsed.
    pub fn tick(&mut self, now: Instant) -> bool {
        if self.session.status.is_finished() && self.cooldown_remaining(now).is_zero() {
            self.session.status = SandboxStatus::Idle;
            self.finished_at = None;
            return true;
        }
        false
    }

    pub fn cooldown_remaining(&self, now: Instant) -> Duration {
        match self.finished_at {
            Some(at) => self.cooldown.saturating_sub(now.saturating_duration_since(at)),
            None => Duration::ZERO,
        }
    }

    /// Enter `starting`. Returns how long the caller must wait before issuing
    /// the remote start request.
    pub fn begin(
        &mut self,
        now: Instant,
        entry_path: &str,
        runtime: Option<&str>,
    ) -> Result<Duration, SandboxError> {
        if self.session.status.is_active() {
            return Err(SandboxError::Busy);
        }
        let delay = self.cooldown_remaining(now);
        self.finished_at = None;
        self.session = SandboxSession {
            status: SandboxStatus::Starting,
            entry_path: Some(entry_path.to_string()),
            runtime: runtime.map(ToString::to_string),
            ..SandboxSession::default()
        };
        tracing::debug!(entry_path, delay_ms = delay.as_millis() as u64, "sandbox session starting");
        Ok(delay)
    }

    /// Record the stream credentials returned by the create call.
    pub fn attach(&mut self, task_id: &str, stream_token: &str) -> Result<(), SandboxError> {
        if self.session.status != SandboxStatus::Starting {
            return Err(SandboxError::NotStarting);
        }
        self.session.task_id = Some(task_id.to_string());
        self.session.stream_token = Some(stream_token.to_string());
        Ok(())
    }

    /// Fold one play-stream event. Events for a session that is not active
    /// are ignored.
    pub fn apply(&mut self, now: Instant, event: &PlayEvent) -> Vec<SandboxNotice> {
        if !self.session.status.is_active() {
            tracing::debug!(?event, status = ?self.session.status, "dropping play event for inactive session");
            return Vec::new();
        }
        let mut notices = Vec::new();
        match event {
            PlayEvent::Started {
                entry_path,
                runtime,
            } => {
                self.session.status = SandboxStatus::Running;
                let entry = entry_path
                    .clone()
                    .or_else(|| self.session.entry_path.clone())
                    .unwrap_or_default();
                let runtime = runtime
                    .clone()
                    .or_else(|| self.session.runtime.clone())
                    .unwrap_or_else(|| infer_runtime(&entry).to_string());
                self.session.runtime = Some(runtime.clone());
                notices.push(SandboxNotice::Started { runtime });
            }
            PlayEvent::Sandbox { sandbox_id, .. } => {
                self.session.status = SandboxStatus::Running;
                self.session.sandbox_id = Some(sandbox_id.clone());
                notices.push(SandboxNotice::SandboxId {
                    sandbox_id: sandbox_id.clone(),
                });
            }
            PlayEvent::Log(chunk) => {
                self.session.logs.push_str(chunk);
                notices.push(SandboxNotice::Log {
                    chunk: chunk.clone(),
                });
                if self.session.preview_url.is_none() {
                    if let Some(url) = preview_from_log(chunk) {
                        self.session.preview_url = Some(url.clone());
                        notices.push(SandboxNotice::Preview { url, port: None });
                    }
                }
            }
            PlayEvent::Preview { url, port } => {
                self.session.preview_url = Some(url.clone());
                self.session.preview_port = *port;
                notices.push(SandboxNotice::Preview {
                    url: url.clone(),
                    port: *port,
                });
            }
            PlayEvent::Complete { exit_code } => {
                self.finish(now, SandboxStatus::Done);
                self.session.exit_code = Some(*exit_code);
                notices.push(SandboxNotice::Done {
                    exit_code: *exit_code,
                });
            }
            PlayEvent::Failed(message) => {
                self.finish(now, SandboxStatus::Error);
                self.session.error = Some(message.clone());
                notices.push(SandboxNotice::Error {
                    message: message.clone(),
                });
            }
            PlayEvent::Unknown { event_type } => {
                tracing::debug!(event_type = %event_type, "ignoring unknown play event");
            }
        }
        notices
    }

    /// Move an active session to `error` (create call or subscription failed).
    pub fn fail(&mut self, now: Instant, message: &str) -> Option<SandboxNotice> {
        if !self.session.status.is_active() {
            return None;
        }
        self.finish(now, SandboxStatus::Error);
        self.session.error = Some(message.to_string());
        Some(SandboxNotice::Error {
            message: message.to_string(),
        })
    }

    /// Stop locally. Returns the remote teardown to attempt when the session
    /// identifiers are known.
    pub fn stop(&mut self, now: Instant) -> Option<RemoteStop> {
        if !self.session.status.is_active() {
            return None;
        }
        self.finish(now, SandboxStatus::Error);
        self.session.error = Some("stopped".to_string());
        let task_id = self.session.task_id.clone()?;
        let stream_token = self.session.stream_token.clone()?;
        Some(RemoteStop {
            task_id,
            stream_token,
            sandbox_id: self.session.sandbox_id.clone(),
        })
    }

    /// Bounded window of the accumulated log.
    pub fn logs_tail(&self, max_chars: usize) -> &str {
        tail_by_chars(&self.session.logs, max_chars)
    }

    fn finish(&mut self, now: Instant, status: SandboxStatus) {
        self.session.status = status;
        self.finished_at = Some(now);
    }
}

/// Runtime label used when the server did not report one.
pub fn infer_runtime(entry_path: &str) -> &'static str {
    let ext = entry_path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "py" => "python3.13",
        "js" | "mjs" | "cjs" | "ts" | "tsx" => "node22",
        "rb" => "ruby3.2",
        _ => "auto",
    }
}

fn preview_from_log(chunk: &str) -> Option<String> {
    let (_, rest) = chunk.split_once(PREVIEW_LOG_MARKER)?;
    let url = rest.split_whitespace().next()?;
    (url.starts_with("http://") || url.starts_with("https://")).then(|| url.to_string())
}
