//! HTTP surface of the agent backend.
//!
//! - `POST /runs` and `GET /runs/{id}/events|resume` for agent runs.
//! - `POST /play`, `GET /play/{id}/events` and `DELETE /play/{id}` for
//!   sandbox sessions.
//!
//! Event endpoints are exposed as streams of raw SSE `data` payloads; parsing
//! them into typed events is the transport's job.

use crate::error::ApiError;
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;

mod client;

pub use client::HttpServerApi;

/// Stream of SSE `data` payloads from one subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<String, ApiError>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// Body of `POST /runs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateRunRequest {
    pub user_id: String,
    pub query: String,
    pub project: BTreeMap<String, String>,
    pub message_history: Vec<HistoryMessage>,
    /// Server default when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Body of `POST /play`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatePlayRequest {
    pub user_id: String,
    pub project: BTreeMap<String, String>,
    pub entry_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}

/// `{task_id, stream_token}` returned by both create endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamCredentials {
    pub task_id: String,
    pub stream_token: String,
}

/// Backend interface used by the engine.
///
/// Tests inject scripted implementations; production uses [`HttpServerApi`].
#[async_trait]
pub trait ServerApi: Send + Sync {
    async fn create_run(&self, request: &CreateRunRequest) -> Result<StreamCredentials, ApiError>;

    async fn open_run_events(&self, task_id: &str, token: &str) -> Result<EventStream, ApiError>;

    async fn open_run_resume(
        &self,
        task_id: &str,
        token: &str,
        result: &str,
    ) -> Result<EventStream, ApiError>;

    async fn create_play(&self, request: &CreatePlayRequest) -> Result<StreamCredentials, ApiError>;

    async fn open_play_events(&self, task_id: &str, token: &str) -> Result<EventStream, ApiError>;

    /// Best-effort teardown; callers treat failures as informational.
    async fn stop_play(
        &self,
        task_id: &str,
        token: &str,
        sandbox_id: Option<&str>,
    ) -> Result<(), ApiError>;
}
