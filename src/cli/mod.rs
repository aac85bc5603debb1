//! CLI commands for hivemind

pub mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// hivemind - event kernel for the multi-agent terminal orchestrator
#[derive(Parser)]
#[command(name = "hivemind")]
#[command(about = "Event kernel daemon for the multi-agent terminal orchestrator")]
#[command(version)]
pub struct Cli {
    /// Trigger directory (default: <data-dir>/hivemind/triggers)
    #[arg(long, global = true)]
    pub trigger_dir: Option<PathBuf>,

    /// Developer mode: disable payload redaction
    #[arg(long, global = true)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run or control the trigger daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Print sequencing and contract promotion state
    Status {
        /// Raw JSON instead of the summary view
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum DaemonAction {
    /// Run the daemon in the foreground
    Run,
    /// Spawn the daemon in the background
    Start,
    /// Stop a background daemon
    Stop,
}
