//! Core library for hivemind - the event kernel of the multi-agent
//! terminal orchestrator
//!
//! # Architecture
//! - `kernel`: envelope minting, pane state vectors, telemetry ring,
//!   subscriber dispatch, contract evaluation, deferred queues. The kernel
//!   is synchronous and single-writer; callers serialize entry.
//! - `delivery`: outbound sequence numbers and per-delivery acknowledgement
//!   tracking with reliability metrics.
//! - `trigger`: trigger-file ingestion (atomic claim, decode, dedupe) and
//!   the async polling daemon that feeds the kernel.
//! - `promotion`: shadow-contract statistics and promotion to enforced.

#![deny(unsafe_code)]

use std::sync::Mutex;

/// Global log file handle for debug.log
static DEBUG_LOG: Mutex<Option<std::fs::File>> = Mutex::new(None);

/// Initialize debug.log file logging
pub fn init_debug_log(path: Option<std::path::PathBuf>) -> std::io::Result<()> {
    let log_path = path.unwrap_or_else(|| std::path::PathBuf::from("debug.log"));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    *DEBUG_LOG.lock().unwrap() = Some(file);
    Ok(())
}

/// Write to debug.log if initialized
pub fn write_to_debug_log(level: &str, message: &str) {
    use std::io::Write;
    if let Ok(mut guard) = DEBUG_LOG.lock() {
        if let Some(ref mut file) = *guard {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level, message);
            let _ = file.flush();
        }
    }
}

// Logging macros - write ONLY to debug.log (not stderr; the binary owns the terminal)
#[macro_export]
macro_rules! info_log {
    ($($arg:tt)*) => {
        {
            let msg = format!($($arg)*);
            $crate::write_to_debug_log("INFO", &msg);
        }
    };
}

#[macro_export]
macro_rules! error_log {
    ($($arg:tt)*) => {
        {
            let msg = format!($($arg)*);
            $crate::write_to_debug_log("ERROR", &msg);
        }
    };
}

#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        {
            let msg = format!($($arg)*);
            $crate::write_to_debug_log("DEBUG", &msg);
        }
    };
}

#[macro_export]
macro_rules! warn_log {
    ($($arg:tt)*) => {
        {
            let msg = format!($($arg)*);
            $crate::write_to_debug_log("WARN", &msg);
        }
    };
}

pub mod config;
pub mod delivery;
pub mod error;
pub mod kernel;
pub mod promotion;
pub mod trigger;

pub use config::KernelConfig;
pub use error::{KernelError, Result, SendOutcome};
pub use kernel::contract::{Contract, ContractAction, ContractMode, Precondition, Severity};
pub use kernel::envelope::{Clock, EventEnvelope, NewEvent};
pub use kernel::ring::EventQuery;
pub use kernel::state::{Activity, Compacting, PaneState, StatePatch};
pub use kernel::{DispatchOutcome, EmitResult, EventKernel};
