//! `hivemind` - event kernel daemon for a multi-agent terminal orchestrator
//!
//! This binary watches the trigger directory, feeds file drops through the
//! event kernel, and keeps message sequencing and contract promotion state
//! on disk.

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Commands, DaemonAction};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Daemon { action } => match action {
            DaemonAction::Run => cli::daemon::handle_daemon_run(&cli).await,
            DaemonAction::Start => cli::daemon::handle_daemon_start(),
            DaemonAction::Stop => cli::daemon::handle_daemon_stop(),
        },
        Commands::Status { json } => cli::daemon::handle_status(*json),
    }
}
