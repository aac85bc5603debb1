//! Daemon lifecycle and status commands
//!
//! `daemon run` wires the kernel, trigger ingestor, and stores together and
//! polls in the foreground; `daemon start`/`stop` manage a detached copy
//! via a pid file.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::Style;
use parking_lot::Mutex;

use hivemind_core::delivery::MessageStore;
use hivemind_core::kernel::contract::default_contracts;
use hivemind_core::promotion::{PromotionEngine, StatsStore};
use hivemind_core::trigger::{TriggerDaemon, TriggerIngestor};
use hivemind_core::{EventKernel, KernelConfig};

use crate::cli::Cli;

fn data_dir() -> Result<PathBuf> {
    Ok(dirs::data_dir()
        .context("Could not find data directory")?
        .join("hivemind"))
}

pub async fn handle_daemon_run(cli: &Cli) -> Result<()> {
    let data = data_dir()?;
    fs::create_dir_all(&data)?;
    hivemind_core::init_debug_log(Some(data.join("debug.log")))?;

    let mut config =
        KernelConfig::load(&data.join("config.json")).context("Failed to load configuration")?;
    if cli.dev {
        config.dev_mode = true;
    }

    let message_store = MessageStore::new_in(data.clone());
    let stats_store = StatsStore::new_in(data.clone());

    let mut kernel = EventKernel::new(config.clone());
    kernel
        .delivery_mut()
        .hydrate(&message_store.load().context("Failed to load message state")?);
    for contract in default_contracts() {
        kernel.register_contract(contract)?;
    }

    let mut promotion = PromotionEngine::new();
    promotion.merge_file(&stats_store.load().context("Failed to load contract stats")?);
    let now = kernel.now_ms();
    promotion.begin_session(&kernel, now);

    let kernel = Arc::new(Mutex::new(kernel));
    let promotion = Arc::new(Mutex::new(promotion));

    // Shadow-violation evidence feeds the promotion stats
    {
        let promotion = Arc::clone(&promotion);
        kernel.lock().subscribe(
            "contract.shadow.violation",
            Box::new(move |envelope| {
                promotion.lock().observe(envelope, envelope.timestamp);
                Ok(())
            }),
        )?;
    }

    let trigger_dir = cli
        .trigger_dir
        .clone()
        .unwrap_or_else(|| data.join("triggers"));
    let daemon = TriggerDaemon::new(
        Arc::clone(&kernel),
        TriggerIngestor::new(&config),
        trigger_dir.clone(),
    );

    let pid_path = data.join("daemon.pid");
    fs::write(&pid_path, std::process::id().to_string())?;
    println!(
        "{} watching {}",
        Style::new().green().apply_to("hivemind daemon"),
        trigger_dir.display()
    );

    tokio::select! {
        res = daemon.start_loop() => {
            if let Err(e) = res {
                eprintln!("Daemon error: {:?}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down daemon...");
        }
    }

    // Persist message state and promotion evidence on the way out
    let now = kernel.lock().now_ms();
    {
        let mut promotion = promotion.lock();
        promotion.check_and_promote(&mut kernel.lock(), now);
        promotion.merge_file(&stats_store.load().unwrap_or_default());
        stats_store.save(&promotion.snapshot())?;
    }
    message_store.save(&kernel.lock().delivery().snapshot(now))?;
    let _ = fs::remove_file(&pid_path);
    Ok(())
}

pub fn handle_daemon_start() -> Result<()> {
    let exe = std::env::current_exe()?;
    let data = data_dir()?;
    fs::create_dir_all(&data)?;
    let pid_path = data.join("daemon.pid");

    if pid_path.exists() {
        let pid = fs::read_to_string(&pid_path)?;
        println!("Daemon already running (PID: {})", pid);
        return Ok(());
    }

    // Spawn detached
    Command::new(exe)
        .arg("daemon")
        .arg("run")
        .spawn()
        .context("Failed to spawn daemon process")?;

    println!("Daemon started in background.");
    Ok(())
}

pub fn handle_daemon_stop() -> Result<()> {
    let data = data_dir()?;
    let pid_path = data.join("daemon.pid");

    if !pid_path.exists() {
        println!("Daemon is not running.");
        return Ok(());
    }

    let pid_str = fs::read_to_string(&pid_path)?;
    let pid: i32 = pid_str.trim().parse().context("Invalid PID in file")?;

    println!("Stopping daemon (PID: {})...", pid);

    #[cfg(unix)]
    {
        Command::new("kill")
            .arg(pid.to_string())
            .status()
            .context("Failed to execute kill command")?;
    }

    #[cfg(windows)]
    {
        Command::new("taskkill")
            .arg("/F")
            .arg("/PID")
            .arg(pid.to_string())
            .status()
            .context("Failed to execute taskkill command")?;
    }

    let _ = fs::remove_file(&pid_path);
    println!("Daemon stopped.");
    Ok(())
}

pub fn handle_status(json: bool) -> Result<()> {
    let data = data_dir()?;
    let message_state = MessageStore::new_in(data.clone()).load()?;
    let contract_stats = StatsStore::new_in(data).load()?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "messageState": message_state,
                "contractStats": contract_stats,
            }))?
        );
        return Ok(());
    }

    let blue = Style::new().blue();
    let green = Style::new().green();
    let dim = Style::new().dim();

    println!("{}", blue.apply_to("Message sequences"));
    if message_state.sequences.is_empty() {
        println!("  {}", dim.apply_to("(none)"));
    }
    for (role, entry) in &message_state.sequences {
        let last_seen: Vec<String> = entry
            .last_seen
            .iter()
            .map(|(sender, seq)| format!("{}#{}", sender, seq))
            .collect();
        println!(
            "  {}: outbound #{} | seen: {}",
            green.apply_to(role),
            entry.outbound,
            if last_seen.is_empty() {
                "-".to_string()
            } else {
                last_seen.join(", ")
            }
        );
    }
    if let Some(updated) = chrono::DateTime::from_timestamp_millis(message_state.last_updated as i64)
    {
        println!("  {}", dim.apply_to(format!("updated {}", updated)));
    }

    println!("{}", blue.apply_to("Contract promotion"));
    if contract_stats.contracts.is_empty() {
        println!("  {}", dim.apply_to("(none tracked)"));
    }
    for (contract_id, stats) in &contract_stats.contracts {
        println!(
            "  {}: {:?} | sessions {} | violations {} | signoffs {}",
            green.apply_to(contract_id),
            stats.mode,
            stats.sessions_tracked,
            stats.shadow_violations,
            stats.agent_signoffs.len()
        );
    }
    Ok(())
}
