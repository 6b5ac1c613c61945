//! One logical subscription per run (plus one for the sandbox session).
//!
//! Each subscription is a spawned pump task that opens the endpoint, parses
//! every SSE payload and forwards it, in arrival order, to the engine's
//! delivery channel tagged with a generation number. Replacing or tearing
//! down a subscription aborts its task and bumps the generation, so anything
//! still in flight from the old one can be recognised and dropped.

use crate::api::{EventStream, ServerApi};
use crate::error::ApiError;
use crate::gate::SANDBOX_RESULT_CAP;
use crate::protocol::play::PlayEvent;
use crate::protocol::{parse_agent_payload, AgentMessage};
use crate::sandbox::RemoteStop;
use crate::textutil::tail_by_chars;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKey {
    Run(String),
    Play,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportItem {
    Agent(AgentMessage),
    Play(PlayEvent),
    /// The server ended the stream.
    Closed,
    /// Opening or reading the stream failed.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportDelivery {
    pub key: StreamKey,
    pub generation: u64,
    pub item: TransportItem,
}

struct Subscription {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct StreamTransport {
    api: Arc<dyn ServerApi>,
    tx: mpsc::UnboundedSender<TransportDelivery>,
    subscriptions: HashMap<StreamKey, Subscription>,
    next_generation: u64,
}

impl StreamTransport {
    pub fn new(api: Arc<dyn ServerApi>, tx: mpsc::UnboundedSender<TransportDelivery>) -> Self {
        Self {
            api,
            tx,
            subscriptions: HashMap::new(),
            next_generation: 1,
        }
    }

    pub fn api(&self) -> Arc<dyn ServerApi> {
        Arc::clone(&self.api)
    }

    /// Open the primary event subscription for `run_id`, closing any
    /// existing one first. Returns the new generation.
    pub fn connect(&mut self, run_id: &str, stream_token: &str) -> u64 {
        self.disconnect(run_id);
        let api = self.api();
        let (task_id, token) = (run_id.to_string(), stream_token.to_string());
        tracing::debug!(run_id, "opening run subscription");
        self.spawn(StreamKey::Run(run_id.to_string()), parse_agent, async move {
            api.open_run_events(&task_id, &token).await
        })
    }

    /// Close the current subscription and reopen it carrying `result`,
    /// trimmed to its last [`SANDBOX_RESULT_CAP`] characters.
    pub fn resume(&mut self, run_id: &str, resume_token: &str, result: &str) -> u64 {
        self.disconnect(run_id);
        let api = self.api();
        let task_id = run_id.to_string();
        let token = resume_token.to_string();
        let result = tail_by_chars(result, SANDBOX_RESULT_CAP).to_string();
        tracing::info!(run_id, result_chars = result.chars().count(), "resuming run");
        self.spawn(StreamKey::Run(run_id.to_string()), parse_agent, async move {
            api.open_run_resume(&task_id, &token, &result).await
        })
    }

    /// Tear down the run's subscription. Safe to call when already closed.
    pub fn disconnect(&mut self, run_id: &str) -> bool {
        self.close(&StreamKey::Run(run_id.to_string()))
    }

    pub fn connect_play(&mut self, task_id: &str, stream_token: &str) -> u64 {
        self.close(&StreamKey::Play);
        let api = self.api();
        let (task_id, token) = (task_id.to_string(), stream_token.to_string());
        self.spawn(StreamKey::Play, parse_play, async move {
            api.open_play_events(&task_id, &token).await
        })
    }

    pub fn disconnect_play(&mut self) -> bool {
        self.close(&StreamKey::Play)
    }

    /// Fire-and-forget remote teardown of a sandbox session.
    pub fn stop_play_remote(&self, stop: RemoteStop) -> JoinHandle<()> {
        let api = self.api();
        tokio::spawn(async move {
            if let Err(err) = api
                .stop_play(&stop.task_id, &stop.stream_token, stop.sandbox_id.as_deref())
                .await
            {
                tracing::info!(task_id = %stop.task_id, error = %err, "remote sandbox stop not confirmed");
            }
        })
    }

    /// Whether `generation` is still the live subscription for `key`.
    pub fn is_current(&self, key: &StreamKey, generation: u64) -> bool {
        self.subscriptions
            .get(key)
            .is_some_and(|sub| sub.generation == generation)
    }

    /// Forget a subscription whose pump reported `Closed`/`Failed`.
    pub fn finished(&mut self, key: &StreamKey, generation: u64) {
        if self.is_current(key, generation) {
            self.subscriptions.remove(key);
        }
    }

    pub fn is_open(&self, key: &StreamKey) -> bool {
        self.subscriptions.contains_key(key)
    }

    pub fn shutdown(&mut self) {
        for (_, sub) in self.subscriptions.drain() {
            sub.handle.abort();
        }
    }

    fn close(&mut self, key: &StreamKey) -> bool {
        match self.subscriptions.remove(key) {
            Some(sub) => {
                sub.handle.abort();
                tracing::debug!(?key, generation = sub.generation, "subscription closed");
                true
            }
            None => false,
        }
    }

    fn spawn<F>(&mut self, key: StreamKey, parse: fn(&str) -> TransportItem, open: F) -> u64
    where
        F: Future<Output = Result<EventStream, ApiError>> + Send + 'static,
    {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.saturating_add(1);
        let handle = tokio::spawn(pump(self.tx.clone(), key.clone(), generation, parse, open));
        self.subscriptions
            .insert(key, Subscription { generation, handle });
        generation
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn pump<F>(
    tx: mpsc::UnboundedSender<TransportDelivery>,
    key: StreamKey,
    generation: u64,
    parse: fn(&str) -> TransportItem,
    open: F,
) where
    F: Future<Output = Result<EventStream, ApiError>> + Send,
{
    let send = |item: TransportItem| {
        tx.send(TransportDelivery {
            key: key.clone(),
            generation,
            item,
        })
        .is_ok()
    };

    let mut stream = match open.await {
        Ok(stream) => stream,
        Err(err) => {
            send(TransportItem::Failed(err.to_string()));
            return;
        }
    };
    while let Some(next) = stream.next().await {
        match next {
            Ok(payload) => {
                if !send(parse(&payload)) {
                    return;
                }
            }
            Err(err) => {
                send(TransportItem::Failed(err.to_string()));
                return;
            }
        }
    }
    send(TransportItem::Closed);
}

fn parse_agent(payload: &str) -> TransportItem {
    TransportItem::Agent(parse_agent_payload(payload))
}

fn parse_play(payload: &str) -> TransportItem {
    TransportItem::Play(PlayEvent::parse_payload(payload))
}
