//! HTTP helpers: client construction, status checks and SSE body streaming.

use crate::api::EventStream;
use crate::error::ApiError;
use crate::protocol::sse::SseStreamParser;
use futures_util::{stream, Stream, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;

/// Build an HTTP client with a connect timeout only.
///
/// Event streams stay open for the whole run, so the overall request timeout
/// is applied per `POST` instead of on the client.
pub(super) fn build_http_client(connect_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Map non-2xx responses to `ApiError::Status` carrying the body text.
pub(super) async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| status.canonical_reason().unwrap_or("request failed").to_string());
    Err(ApiError::status(status.as_u16(), body))
}

/// Turn a `text/event-stream` body into a stream of `data` payloads.
pub(super) fn sse_payloads(response: reqwest::Response) -> EventStream {
    payload_stream(Box::pin(response.bytes_stream()))
}

/// Frame raw body chunks into SSE payloads.
///
/// A transport error is yielded once and ends the stream; a trailing frame
/// without its blank-line terminator is flushed at end of body.
pub(super) fn payload_stream<S, B>(bytes: S) -> EventStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = SseState {
        bytes,
        parser: SseStreamParser::default(),
        queue: VecDeque::new(),
        done: false,
    };
    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(payload) = state.queue.pop_front() {
                return Some((Ok(payload), state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let payloads = state.parser.feed(chunk.as_ref());
                    state.queue.extend(payloads);
                }
                Some(Err(err)) => {
                    state.done = true;
                    return Some((Err(ApiError::Http(err)), state));
                }
                None => {
                    state.done = true;
                    let tail = state.parser.finish();
                    state.queue.extend(tail);
                }
            }
        }
    }))
}

struct SseState<S> {
    bytes: S,
    parser: SseStreamParser,
    queue: VecDeque<String>,
    done: bool,
}
