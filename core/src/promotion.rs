//! Shadow-contract promotion
//!
//! Shadow contracts earn enforcement: enough observed sessions, zero false
//! positives, and at least two agent sign-offs. Stats persist to
//! `contract-stats.json` and merge with what is already on disk so parallel
//! sessions never lose evidence.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::kernel::contract::ContractMode;
use crate::kernel::EventKernel;

/// Sessions a shadow contract must be tracked across before promotion
pub const PROMOTION_MIN_SESSIONS: u64 = 5;

/// Agent sign-offs required before promotion
pub const PROMOTION_MIN_SIGNOFFS: usize = 2;

/// Evidence collected for one shadow contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractStats {
    pub mode: ContractMode,
    pub sessions_tracked: u64,
    pub shadow_violations: u64,
    pub false_positives: u64,
    pub agent_signoffs: BTreeSet<String>,
    pub last_updated: u64,
}

impl ContractStats {
    fn new(mode: ContractMode, now_ms: u64) -> Self {
        Self {
            mode,
            sessions_tracked: 0,
            shadow_violations: 0,
            false_positives: 0,
            agent_signoffs: BTreeSet::new(),
            last_updated: now_ms,
        }
    }

    /// Ready for enforcement?
    pub fn is_ready(&self) -> bool {
        self.mode == ContractMode::Shadow
            && self.sessions_tracked >= PROMOTION_MIN_SESSIONS
            && self.false_positives == 0
            && self.agent_signoffs.len() >= PROMOTION_MIN_SIGNOFFS
    }

    /// Reload-then-merge: prefer enforced, pointwise max of counters,
    /// union of sign-offs, newest timestamp
    pub fn merge(&mut self, other: &ContractStats) {
        if other.mode == ContractMode::Enforced {
            self.mode = ContractMode::Enforced;
        }
        self.sessions_tracked = self.sessions_tracked.max(other.sessions_tracked);
        self.shadow_violations = self.shadow_violations.max(other.shadow_violations);
        self.false_positives = self.false_positives.max(other.false_positives);
        self.agent_signoffs
            .extend(other.agent_signoffs.iter().cloned());
        self.last_updated = self.last_updated.max(other.last_updated);
    }
}

/// On-disk shape of `contract-stats.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractStatsFile {
    pub contracts: BTreeMap<String, ContractStats>,
}

/// Watches shadow evidence and lifts contracts to enforced on threshold
#[derive(Debug, Default)]
pub struct PromotionEngine {
    stats: BTreeMap<String, ContractStats>,
}

impl PromotionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a contract is tracked (no-op if already known)
    pub fn track(&mut self, contract_id: &str, mode: ContractMode, now_ms: u64) {
        self.stats
            .entry(contract_id.to_string())
            .or_insert_with(|| ContractStats::new(mode, now_ms));
    }

    pub fn stats(&self, contract_id: &str) -> Option<&ContractStats> {
        self.stats.get(contract_id)
    }

    pub fn tracked_ids(&self) -> Vec<String> {
        self.stats.keys().cloned().collect()
    }

    pub fn record_violation(&mut self, contract_id: &str, now_ms: u64) {
        let entry = self.entry(contract_id, now_ms);
        entry.shadow_violations += 1;
        entry.last_updated = now_ms;
    }

    /// Operator-flagged false positive: blocks promotion outright
    pub fn record_false_positive(&mut self, contract_id: &str, now_ms: u64) {
        let entry = self.entry(contract_id, now_ms);
        entry.false_positives += 1;
        entry.last_updated = now_ms;
    }

    /// Set semantics; true when the sign-off was new
    pub fn add_signoff(&mut self, contract_id: &str, agent: &str, now_ms: u64) -> bool {
        let entry = self.entry(contract_id, now_ms);
        let added = entry.agent_signoffs.insert(agent.to_string());
        if added {
            entry.last_updated = now_ms;
        }
        added
    }

    /// Bumped once per session boundary
    pub fn increment_session(&mut self, contract_id: &str, now_ms: u64) {
        let entry = self.entry(contract_id, now_ms);
        entry.sessions_tracked += 1;
        entry.last_updated = now_ms;
    }

    /// Session boundary for every shadow contract the kernel knows
    pub fn begin_session(&mut self, kernel: &EventKernel, now_ms: u64) {
        for contract_id in kernel.shadow_contract_ids() {
            self.track(&contract_id, ContractMode::Shadow, now_ms);
            self.increment_session(&contract_id, now_ms);
        }
    }

    /// Feed a `contract.shadow.violation` envelope into the stats
    pub fn observe(&mut self, envelope: &crate::kernel::envelope::EventEnvelope, now_ms: u64) {
        if envelope.event_type != "contract.shadow.violation" {
            return;
        }
        if let Some(contract_id) = envelope.payload.get("contractId").and_then(|v| v.as_str()) {
            self.record_violation(contract_id, now_ms);
        }
    }

    pub fn is_ready(&self, contract_id: &str) -> bool {
        self.stats.get(contract_id).is_some_and(|s| s.is_ready())
    }

    /// Promote every ready contract: re-register as enforced in the kernel
    /// (which emits `contract.promoted`) and flip the tracked mode
    pub fn check_and_promote(&mut self, kernel: &mut EventKernel, now_ms: u64) -> Vec<String> {
        let ready: Vec<String> = self
            .stats
            .iter()
            .filter(|(_, s)| s.is_ready())
            .map(|(id, _)| id.clone())
            .collect();

        let mut promoted = Vec::new();
        for contract_id in ready {
            if kernel.promote_contract(&contract_id) {
                if let Some(entry) = self.stats.get_mut(&contract_id) {
                    entry.mode = ContractMode::Enforced;
                    entry.last_updated = now_ms;
                }
                crate::info_log!("contract {} promoted to enforced", contract_id);
                promoted.push(contract_id);
            }
        }
        promoted
    }

    /// Merge persisted evidence into this engine
    pub fn merge_file(&mut self, file: &ContractStatsFile) {
        for (contract_id, disk) in &file.contracts {
            match self.stats.get_mut(contract_id) {
                Some(entry) => entry.merge(disk),
                None => {
                    self.stats.insert(contract_id.clone(), disk.clone());
                }
            }
        }
    }

    pub fn snapshot(&self) -> ContractStatsFile {
        ContractStatsFile {
            contracts: self.stats.clone(),
        }
    }

    pub fn reset(&mut self) {
        self.stats.clear();
    }

    fn entry(&mut self, contract_id: &str, now_ms: u64) -> &mut ContractStats {
        self.stats
            .entry(contract_id.to_string())
            .or_insert_with(|| ContractStats::new(ContractMode::Shadow, now_ms))
    }
}

/// Atomic JSON store for promotion stats
#[derive(Debug, Clone)]
pub struct StatsStore {
    path: PathBuf,
}

impl StatsStore {
    pub fn new() -> Result<Self> {
        let dir = dirs::data_dir()
            .ok_or_else(|| KernelError::Validation {
                message: "could not find data directory".to_string(),
            })?
            .join("hivemind");
        Ok(Self::new_in(dir))
    }

    pub fn new_in(dir: PathBuf) -> Self {
        Self {
            path: dir.join("contract-stats.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<ContractStatsFile> {
        if !self.path.exists() {
            return Ok(ContractStatsFile::default());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|source| {
            KernelError::ReadError {
                path: self.path.clone(),
                source,
            }
        })?;
        if content.trim().is_empty() {
            return Ok(ContractStatsFile::default());
        }
        serde_json::from_str(&content).map_err(|_| KernelError::StoreCorrupted {
            path: self.path.clone(),
        })
    }

    /// Write to a temp file, then rename
    pub fn save(&self, file: &ContractStatsFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(file)?;
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).map_err(|source| KernelError::PersistFailed {
            path: temp_path.clone(),
            source,
        })?;
        std::fs::rename(&temp_path, &self.path).map_err(|source| KernelError::PersistFailed {
            path: self.path.clone(),
            source,
        })
    }
}
