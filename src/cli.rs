//! CLI argument parsing via clap.

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

/// Client for a remote coding agent: streams runs, gates code execution and
/// keeps a local history of threads.
#[derive(Debug, Parser)]
#[command(name = "tether", version)]
pub struct Args {
    /// Path to config file (default: ./tether.toml or ~/.config/tether/tether.toml).
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<String>,

    /// Override the agent backend base URL.
    #[arg(long = "base-url", global = true)]
    pub base_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit a prompt and follow the run until it finishes.
    Run(RunArgs),
    /// Run one file in a sandbox session.
    Play(PlayArgs),
    /// Fold a captured event log through the reducer and print the history.
    Replay(ReplayArgs),
    /// List persisted threads.
    Threads(ThreadsArgs),
}

#[derive(Debug, ClapArgs)]
pub struct RunArgs {
    pub prompt: String,

    /// Project directory whose files are sent with the prompt.
    #[arg(long = "project", default_value = ".")]
    pub project: PathBuf,

    /// Continue an existing thread.
    #[arg(long = "thread")]
    pub thread: Option<String>,

    /// Override the model for this run.
    #[arg(short = 'm', long = "model")]
    pub model: Option<String>,

    /// Accept every code execution request without asking.
    #[arg(long = "approve", conflicts_with = "reject")]
    pub approve: bool,

    /// Reject every code execution request without asking.
    #[arg(long = "reject")]
    pub reject: bool,

    /// Accept all proposed file changes and write them to the project.
    #[arg(long = "apply")]
    pub apply: bool,
}

#[derive(Debug, ClapArgs)]
pub struct PlayArgs {
    /// Entry file, relative to the project directory.
    pub entry: String,

    #[arg(long = "project", default_value = ".")]
    pub project: PathBuf,

    /// Runtime label (for example `python3.13`); inferred when unset.
    #[arg(long = "runtime")]
    pub runtime: Option<String>,
}

#[derive(Debug, ClapArgs)]
pub struct ReplayArgs {
    /// Newline-delimited JSON file with one wire message per line.
    pub file: PathBuf,

    /// Run id to fold events into; defaults to the first `task_id` seen.
    #[arg(long = "run-id")]
    pub run_id: Option<String>,
}

#[derive(Debug, ClapArgs)]
pub struct ThreadsArgs {
    /// Project id; defaults to the current directory's project.
    #[arg(long = "project")]
    pub project: Option<String>,
}
