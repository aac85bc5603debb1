//! Deferred event queues
//!
//! Events a contract chose to defer wait here, FIFO per recipient, until a
//! gate clear drains them. Each entry keeps its original `deferred_at`
//! across drains that keep it.

use std::collections::{HashMap, VecDeque};

use super::envelope::EventEnvelope;

/// One deferred emission awaiting a gate clear
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredEntry {
    pub envelope: EventEnvelope,
    pub contract_id: String,
    pub deferred_at: u64,
    pub ttl_ms: u64,
}

impl DeferredEntry {
    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.deferred_at) > self.ttl_ms
    }
}

/// Per-recipient FIFO queues of deferred entries
#[derive(Debug, Default)]
pub struct DeferredQueues {
    queues: HashMap<String, VecDeque<DeferredEntry>>,
}

impl DeferredQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, recipient_id: &str, entry: DeferredEntry) {
        self.queues
            .entry(recipient_id.to_string())
            .or_default()
            .push_back(entry);
    }

    /// Remove and return the recipient's queue for a drain pass
    pub fn take(&mut self, recipient_id: &str) -> VecDeque<DeferredEntry> {
        self.queues.remove(recipient_id).unwrap_or_default()
    }

    /// Put surviving entries back after a drain pass
    pub fn restore(&mut self, recipient_id: &str, entries: VecDeque<DeferredEntry>) {
        if !entries.is_empty() {
            self.queues.insert(recipient_id.to_string(), entries);
        }
    }

    pub fn len(&self, recipient_id: &str) -> usize {
        self.queues.get(recipient_id).map_or(0, |q| q.len())
    }

    pub fn total(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn recipients(&self) -> Vec<String> {
        let mut recipients: Vec<String> = self.queues.keys().cloned().collect();
        recipients.sort();
        recipients
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}
