//! Tether: client-side reconciliation for a remote coding agent.
//!
//! A run is started on the agent backend and its progress arrives as a
//! stream of loosely-typed events. This crate folds those events into a
//! per-run action timeline, holds proposed file changes until a human
//! accepts them, gates the agent's code-execution requests behind an
//! explicit decision, drives sandbox sessions for accepted requests and
//! persists threads of runs per project.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether::api::HttpServerApi;
//! use tether::engine::{spawn_engine, EngineCommand, EngineConfig};
//!
//! # async fn example() {
//! let api = Arc::new(HttpServerApi::new(
//!     "http://localhost:8000",
//!     std::time::Duration::from_secs(30),
//! ));
//! let (handle, mut events) = spawn_engine(api, EngineConfig::new("local", "demo"));
//! handle
//!     .send(EngineCommand::SubmitPrompt { prompt: "add a /health route".into() })
//!     .await
//!     .unwrap();
//! while let Some(envelope) = events.recv().await {
//!     println!("{:?}", envelope.event);
//! }
//! # }
//! ```

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod ignore;
pub mod persist;
pub mod protocol;
pub mod reducer;
pub mod render;
pub mod replay;
pub mod sandbox;
pub mod store;
#[cfg(test)]
pub mod testsupport;
pub mod textutil;
pub mod transport;
pub mod workspace;
