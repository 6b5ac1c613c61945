//! Shared test fixtures: temp dirs, SSE framing, wire-event builders and a
//! scripted [`ServerApi`].

use crate::api::{CreatePlayRequest, CreateRunRequest, EventStream, ServerApi, StreamCredentials};
use crate::error::ApiError;
use async_trait::async_trait;
use futures_util::stream;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temporary directory fixture with best-effort cleanup.
#[derive(Debug)]
pub struct TestTempDir {
    path: PathBuf,
}

impl TestTempDir {
    pub fn new(prefix: &str) -> Self {
        let suffix = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let dir = std::env::temp_dir().join(format!("tether-{prefix}-{millis}-{suffix}"));
        fs::create_dir_all(&dir).expect("failed to create temporary fixture directory");
        Self { path: dir }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write UTF-8 text to a child path, creating parent directories as needed.
    pub fn write_text(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.path.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create parent directories for fixture");
        }
        fs::write(&path, content).expect("failed to write fixture file");
        path
    }
}

impl Drop for TestTempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// One SSE frame carrying a single `data:` line.
pub fn sse_data_block(data: &str) -> String {
    format!("data: {data}\n\n")
}

/// SSE terminator frame.
pub fn sse_done_block() -> &'static str {
    "data: [DONE]\n\n"
}

fn envelope(task_id: &str, event_type: &str, data: Value, error: Value) -> Value {
    json!({
        "event_type": event_type,
        "task_id": task_id,
        "timestamp": "2025-01-01T00:00:00+00:00",
        "data": data,
        "error": error,
    })
}

fn tool_call(id: &str, name: &str, arguments: Value) -> Value {
    json!({"id": id, "function": {"name": name, "arguments": arguments}})
}

pub fn tool_started_event(task_id: &str, id: &str, name: &str, arguments: Value) -> Value {
    envelope(
        task_id,
        "progress_update_tool_action_started",
        json!({"args": [tool_call(id, name, arguments)]}),
        Value::Null,
    )
}

pub fn tool_completed_event(task_id: &str, id: &str, name: &str, output: Value) -> Value {
    envelope(
        task_id,
        "progress_update_tool_action_completed",
        json!({"result": {"tool_call": tool_call(id, name, json!({})), "output_data": output}}),
        Value::Null,
    )
}

pub fn tool_failed_event(task_id: &str, id: &str, name: &str, error: &str) -> Value {
    envelope(
        task_id,
        "progress_update_tool_action_failed",
        json!({"args": [tool_call(id, name, json!({}))]}),
        json!(error),
    )
}

pub fn tool_log_event(task_id: &str, id: &str, chunk: &str) -> Value {
    envelope(
        task_id,
        "progress_update_tool_action_log",
        json!({"id": id, "name": "sandbox_run", "data": chunk}),
        Value::Null,
    )
}

pub fn agent_output_event(task_id: &str, content: &str) -> Value {
    envelope(task_id, "agent_output", json!(content), Value::Null)
}

pub fn run_cancelled_event(task_id: &str) -> Value {
    envelope(task_id, "run_cancelled", Value::Null, Value::Null)
}

pub fn run_failed_event(task_id: &str, error: &str) -> Value {
    envelope(task_id, "run_failed", Value::Null, json!(error))
}

/// Serialized `run_log` message, ready to feed as an SSE payload.
pub fn run_log_payload(task_id: &str, message: &str) -> String {
    envelope(task_id, "run_log", json!(message), Value::Null).to_string()
}

/// Requests observed by [`ScriptedApi`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    CreateRun(CreateRunRequest),
    OpenEvents { task_id: String, token: String },
    Resume { task_id: String, token: String, result: String },
    CreatePlay(CreatePlayRequest),
    OpenPlay { task_id: String },
    StopPlay { task_id: String, sandbox_id: Option<String> },
}

type ScriptedItem = Result<String, ApiError>;

/// In-memory backend. Streams are scripted per `"events:<id>"`,
/// `"resume:<id>"` or `"play:<id>"` key; opening an unscripted stream
/// answers 404.
#[derive(Default)]
pub struct ScriptedApi {
    calls: Mutex<Vec<ApiCall>>,
    credentials: Mutex<VecDeque<StreamCredentials>>,
    streams: Mutex<HashMap<String, VecDeque<mpsc::UnboundedReceiver<ScriptedItem>>>>,
}

impl ScriptedApi {
    /// Queue the credentials returned by the next create call.
    pub fn push_credentials(&self, task_id: &str, stream_token: &str) {
        self.credentials.lock().unwrap().push_back(StreamCredentials {
            task_id: task_id.to_string(),
            stream_token: stream_token.to_string(),
        });
    }

    /// Script the next stream opened under `key`; payloads are fed through the
    /// returned sender, and dropping it ends the stream.
    pub fn script_stream(&self, key: &str) -> mpsc::UnboundedSender<ScriptedItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(rx);
        tx
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Poll until a recorded call satisfies `pred`.
    pub async fn wait_for_call<F>(&self, pred: F) -> ApiCall
    where
        F: Fn(&ApiCall) -> bool,
    {
        for _ in 0..400 {
            if let Some(call) = self.calls().into_iter().find(|call| pred(call)) {
                return call;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected api call never arrived; saw {:?}", self.calls());
    }

    fn record(&self, call: ApiCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_credentials(&self) -> Result<StreamCredentials, ApiError> {
        self.credentials
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ApiError::status(500, "no scripted credentials".to_string()))
    }

    fn open(&self, key: String) -> Result<EventStream, ApiError> {
        let rx = self
            .streams
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| ApiError::status(404, format!("no scripted stream for {key}")))?;
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}

#[async_trait]
impl ServerApi for ScriptedApi {
    async fn create_run(&self, request: &CreateRunRequest) -> Result<StreamCredentials, ApiError> {
        self.record(ApiCall::CreateRun(request.clone()));
        self.next_credentials()
    }

    async fn open_run_events(&self, task_id: &str, token: &str) -> Result<EventStream, ApiError> {
        self.record(ApiCall::OpenEvents {
            task_id: task_id.to_string(),
            token: token.to_string(),
        });
        self.open(format!("events:{task_id}"))
    }

    async fn open_run_resume(
        &self,
        task_id: &str,
        token: &str,
        result: &str,
    ) -> Result<EventStream, ApiError> {
        self.record(ApiCall::Resume {
            task_id: task_id.to_string(),
            token: token.to_string(),
            result: result.to_string(),
        });
        self.open(format!("resume:{task_id}"))
    }

    async fn create_play(&self, request: &CreatePlayRequest) -> Result<StreamCredentials, ApiError> {
        self.record(ApiCall::CreatePlay(request.clone()));
        self.next_credentials()
    }

    async fn open_play_events(&self, task_id: &str, _token: &str) -> Result<EventStream, ApiError> {
        self.record(ApiCall::OpenPlay {
            task_id: task_id.to_string(),
        });
        self.open(format!("play:{task_id}"))
    }

    async fn stop_play(
        &self,
        task_id: &str,
        _token: &str,
        sandbox_id: Option<&str>,
    ) -> Result<(), ApiError> {
        self.record(ApiCall::StopPlay {
            task_id: task_id.to_string(),
            sandbox_id: sandbox_id.map(ToString::to_string),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_dir_fixture_writes_and_resolves_paths() {
        let fixture = TestTempDir::new("fixture");
        let file = fixture.write_text("nested/file.txt", "hello");
        assert_eq!(fs::read_to_string(file).unwrap(), "hello");
        assert!(fixture.path().exists());
    }

    #[test]
    fn sse_helpers_emit_expected_wire_format() {
        assert_eq!(sse_data_block("{}"), "data: {}\n\n");
        assert_eq!(sse_done_block(), "data: [DONE]\n\n");
    }

    #[test]
    fn event_builders_use_wire_envelope() {
        let started = tool_started_event("r1", "tc_1", "think", json!({}));
        assert_eq!(started["event_type"], "progress_update_tool_action_started");
        assert_eq!(started["data"]["args"][0]["function"]["name"], "think");
        let failed = run_failed_event("r1", "boom");
        assert_eq!(failed["error"], "boom");
    }
}
