//! reqwest-backed [`ServerApi`].
//!
//! - `transport`: client construction, status mapping and SSE framing.
//! - `retry`: bounded backoff for the create endpoints.

mod retry;
mod transport;

use super::{CreatePlayRequest, CreateRunRequest, EventStream, ServerApi, StreamCredentials};
use crate::error::ApiError;
use async_trait::async_trait;
use retry::RetryPolicy;
use serde::Serialize;
use std::time::Duration;
use tokio::time::sleep;

/// HTTP client for the agent backend.
pub struct HttpServerApi {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl HttpServerApi {
    /// `timeout` bounds connection setup and each create request; event
    /// streams are unbounded.
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self::new_with_retry_policy(base_url, timeout, RetryPolicy::default())
    }

    fn new_with_retry_policy(base_url: &str, timeout: Duration, retry_policy: RetryPolicy) -> Self {
        Self {
            http: transport::build_http_client(timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout: timeout,
            retry_policy,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_credentials<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<StreamCredentials, ApiError> {
        let mut attempt: u32 = 0;
        loop {
            match self.post_once(path, body).await {
                Ok(credentials) => return Ok(credentials),
                Err(err) => {
                    if !self.retry_policy.should_retry(&err, attempt) {
                        return Err(err);
                    }
                    let delay = self.retry_policy.retry_delay_for(attempt);
                    tracing::warn!(path, attempt, error = %err, "retrying create request");
                    attempt = attempt.saturating_add(1);
                    sleep(delay).await;
                }
            }
        }
    }

    async fn post_once<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<StreamCredentials, ApiError> {
        let response = self
            .http
            .post(self.url(path))
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await?;
        let response = transport::ensure_success(response).await?;
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|err| ApiError::InvalidResponse(format!("{path}: {err}")))
    }

    async fn open_stream(&self, path: &str, query: &[(&str, &str)]) -> Result<EventStream, ApiError> {
        let response = self
            .http
            .get(self.url(path))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .query(query)
            .send()
            .await?;
        let response = transport::ensure_success(response).await?;
        Ok(transport::sse_payloads(response))
    }
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn create_run(&self, request: &CreateRunRequest) -> Result<StreamCredentials, ApiError> {
        self.post_credentials("/runs", request).await
    }

    async fn open_run_events(&self, task_id: &str, token: &str) -> Result<EventStream, ApiError> {
        self.open_stream(&format!("/runs/{task_id}/events"), &[("token", token)])
            .await
    }

    async fn open_run_resume(
        &self,
        task_id: &str,
        token: &str,
        result: &str,
    ) -> Result<EventStream, ApiError> {
        self.open_stream(
            &format!("/runs/{task_id}/resume"),
            &[("token", token), ("result", result)],
        )
        .await
    }

    async fn create_play(&self, request: &CreatePlayRequest) -> Result<StreamCredentials, ApiError> {
        self.post_credentials("/play", request).await
    }

    async fn open_play_events(&self, task_id: &str, token: &str) -> Result<EventStream, ApiError> {
        self.open_stream(&format!("/play/{task_id}/events"), &[("token", token)])
            .await
    }

    async fn stop_play(
        &self,
        task_id: &str,
        token: &str,
        sandbox_id: Option<&str>,
    ) -> Result<(), ApiError> {
        let mut query = vec![("token", token)];
        if let Some(sandbox_id) = sandbox_id {
            query.push(("sandbox_id", sandbox_id));
        }
        let response = self
            .http
            .delete(self.url(&format!("/play/{task_id}")))
            .timeout(self.request_timeout)
            .query(&query)
            .send()
            .await?;
        transport::ensure_success(response).await?;
        Ok(())
    }
}
