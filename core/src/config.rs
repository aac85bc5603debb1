//! Configuration for the event kernel
//!
//! KernelConfig contains ONLY knobs and thresholds. No executors, no
//! channels, no runtime resources. Defaults match the shipped orchestrator;
//! the daemon may override them from `config.json` in the data directory.

use std::path::Path;
use serde::{Deserialize, Serialize};

/// Tunable knobs for the kernel and its collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KernelConfig {
    /// Telemetry ring: entry count above which aged entries are evicted
    pub ring_max_entries: usize,

    /// Telemetry ring: age in ms beyond which surplus entries are evicted
    pub ring_max_age_ms: u64,

    /// Time-to-live for deferred events awaiting a gate clear
    pub defer_ttl_ms: u64,

    /// Sliding window over enforced contract violations
    pub safemode_window_ms: u64,

    /// Enforced violations within the window required to enter safe mode
    pub safemode_threshold: usize,

    /// How long safe mode stays up before the kernel exits it
    pub safemode_cooldown_ms: u64,

    /// Delivery acknowledgement deadline
    pub ack_timeout_ms: u64,

    /// Fallback-id dedupe window: entry age bound
    pub trigger_dedupe_ttl_ms: u64,

    /// Fallback-id dedupe window: entry count bound
    pub trigger_dedupe_cap: usize,

    /// Age at which a `.processing` claim is considered abandoned
    pub stale_processing_ms: u64,

    /// Developer mode disables payload redaction
    pub dev_mode: bool,
}

impl KernelConfig {
    pub fn new() -> Self {
        Self {
            ring_max_entries: 1000,
            ring_max_age_ms: 300_000,
            defer_ttl_ms: 30_000,
            safemode_window_ms: 10_000,
            safemode_threshold: 3,
            safemode_cooldown_ms: 30_000,
            ack_timeout_ms: 65_000,
            trigger_dedupe_ttl_ms: 300_000,
            trigger_dedupe_cap: 2000,
            stale_processing_ms: 60_000,
            dev_mode: false,
        }
    }

    /// Load overrides from a JSON file; missing file yields defaults
    pub fn load(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    pub fn with_ring(mut self, max_entries: usize, max_age_ms: u64) -> Self {
        self.ring_max_entries = max_entries;
        self.ring_max_age_ms = max_age_ms;
        self
    }

    pub fn with_defer_ttl(mut self, ttl_ms: u64) -> Self {
        self.defer_ttl_ms = ttl_ms;
        self
    }

    pub fn with_safemode(mut self, window_ms: u64, threshold: usize, cooldown_ms: u64) -> Self {
        self.safemode_window_ms = window_ms;
        self.safemode_threshold = threshold;
        self.safemode_cooldown_ms = cooldown_ms;
        self
    }

    pub fn with_ack_timeout(mut self, timeout_ms: u64) -> Self {
        self.ack_timeout_ms = timeout_ms;
        self
    }

    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
