//! Per-delivery acknowledgement tracking
//!
//! A delivery is a (sender, sequence, recipient-set) tuple tracked to full
//! acknowledgement or timeout. `lastSeen` commits only when every expected
//! recipient acknowledged verified; any unverified or failed entry prevents
//! the commit and records why.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use uuid::Uuid;

use crate::error::SendOutcome;

use super::metrics::{MetricKind, ReliabilityMetrics};
use super::sequencer::{MessageStateFile, SequenceBook};

/// Default acknowledgement deadline
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 65_000;

/// How a delivery reaches its recipients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Single-recipient send
    Routed,
    /// Multi-recipient fan-out
    Broadcast,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Routed => "routed",
            Self::Broadcast => "broadcast",
        }
    }

    fn timeout_outcome(&self) -> SendOutcome {
        match self {
            Self::Routed => SendOutcome::RoutedUnverifiedTimeout,
            Self::Broadcast => SendOutcome::BroadcastUnverifiedTimeout,
        }
    }
}

/// A delivery awaiting acknowledgements
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub delivery_id: String,
    pub sender: String,
    pub sequence: u64,
    pub recipient_key: String,
    pub expected: BTreeSet<String>,
    pub acked: BTreeSet<String>,
    pub unverified: BTreeSet<String>,
    pub failed: BTreeMap<String, String>,
    pub sent_at: u64,
    pub msg_type: String,
    pub mode: DeliveryMode,
    pub deadline: u64,
}

impl PendingDelivery {
    fn covered(&self) -> bool {
        self.expected.iter().all(|r| {
            self.acked.contains(r) || self.unverified.contains(r) || self.failed.contains_key(r)
        })
    }

    fn fully_verified(&self) -> bool {
        self.failed.is_empty() && self.unverified.is_empty() && self.acked == self.expected
    }
}

/// How one tracked delivery ended
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    pub delivery_id: String,
    pub outcome: SendOutcome,
    pub sender: String,
    pub sequence: u64,
    pub recipient_key: String,
    pub latency_ms: Option<u64>,
    pub failed: BTreeMap<String, String>,
}

/// Disposition of an incoming wire message after dedupe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingDisposition {
    Fresh,
    Duplicate,
}

/// Mint a delivery id for a (sender, sequence, recipient-key) send
pub fn create_delivery_id(sender: &str, sequence: u64, recipient_key: &str) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}-{}", sender, sequence, recipient_key, &nonce[..8])
}

/// Sequencing plus acknowledgement bookkeeping
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    sequences: SequenceBook,
    pending: HashMap<String, PendingDelivery>,
    metrics: ReliabilityMetrics,
    ack_timeout_ms: u64,
}

impl DeliveryTracker {
    pub fn new(ack_timeout_ms: u64) -> Self {
        Self {
            sequences: SequenceBook::new(),
            pending: HashMap::new(),
            metrics: ReliabilityMetrics::new(),
            ack_timeout_ms,
        }
    }

    pub fn sequences(&self) -> &SequenceBook {
        &self.sequences
    }

    pub fn sequences_mut(&mut self) -> &mut SequenceBook {
        &mut self.sequences
    }

    pub fn metrics(&self) -> &ReliabilityMetrics {
        &self.metrics
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self, delivery_id: &str) -> Option<&PendingDelivery> {
        self.pending.get(delivery_id)
    }

    /// Begin tracking a delivery; schedules the acknowledgement deadline
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &mut self,
        delivery_id: &str,
        sender: &str,
        sequence: u64,
        recipient_key: &str,
        expected: Vec<String>,
        msg_type: &str,
        mode: DeliveryMode,
        now_ms: u64,
    ) {
        self.metrics
            .record(MetricKind::Sent, mode.as_str(), recipient_key, msg_type, now_ms);
        self.pending.insert(
            delivery_id.to_string(),
            PendingDelivery {
                delivery_id: delivery_id.to_string(),
                sender: sender.to_string(),
                sequence,
                recipient_key: recipient_key.to_string(),
                expected: expected.into_iter().collect(),
                acked: BTreeSet::new(),
                unverified: BTreeSet::new(),
                failed: BTreeMap::new(),
                sent_at: now_ms,
                msg_type: msg_type.to_string(),
                mode,
                deadline: now_ms + self.ack_timeout_ms,
            },
        );
    }

    /// Record one recipient's acknowledgement outcome
    ///
    /// Returns the delivery result once every expected recipient reported.
    /// Acks for recipients outside the expected set are ignored.
    pub fn record_outcome(
        &mut self,
        delivery_id: &str,
        recipient: &str,
        accepted: bool,
        verified: bool,
        reason: Option<String>,
        now_ms: u64,
    ) -> Option<DeliveryResult> {
        let pending = match self.pending.get_mut(delivery_id) {
            Some(p) => p,
            None => {
                crate::debug_log!("ack for unknown delivery {}", delivery_id);
                return None;
            }
        };
        if !pending.expected.contains(recipient) {
            crate::debug_log!(
                "ack for unexpected recipient {} on delivery {}",
                recipient,
                delivery_id
            );
            return None;
        }

        if accepted && verified {
            pending.unverified.remove(recipient);
            pending.failed.remove(recipient);
            pending.acked.insert(recipient.to_string());
        } else if accepted {
            if !pending.acked.contains(recipient) {
                pending.unverified.insert(recipient.to_string());
            }
        } else {
            pending.acked.remove(recipient);
            pending.unverified.remove(recipient);
            pending.failed.insert(
                recipient.to_string(),
                reason.unwrap_or_else(|| "unspecified".to_string()),
            );
        }

        if !pending.covered() {
            return None;
        }

        let pending = self.pending.remove(delivery_id)?;
        Some(self.resolve(pending, now_ms))
    }

    /// Fire overdue deadlines; timers are implicit, the caller drives time
    pub fn tick(&mut self, now_ms: u64) -> Vec<DeliveryResult> {
        let overdue: Vec<String> = self
            .pending
            .values()
            .filter(|p| now_ms >= p.deadline)
            .map(|p| p.delivery_id.clone())
            .collect();

        overdue
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|pending| {
                self.metrics.record(
                    MetricKind::TimedOut,
                    pending.mode.as_str(),
                    &pending.recipient_key,
                    &pending.msg_type,
                    now_ms,
                );
                DeliveryResult {
                    delivery_id: pending.delivery_id.clone(),
                    outcome: pending.mode.timeout_outcome(),
                    sender: pending.sender.clone(),
                    sequence: pending.sequence,
                    recipient_key: pending.recipient_key.clone(),
                    latency_ms: None,
                    failed: pending.failed,
                }
            })
            .collect()
    }

    /// Dedupe an incoming wire message against the high-water marks
    ///
    /// A `#1` with the session-reset marker restarts the sender's sequence
    /// toward this recipient before the check.
    pub fn observe_incoming(
        &mut self,
        sender: &str,
        recipient: &str,
        sequence: u64,
        session_reset: bool,
        now_ms: u64,
    ) -> IncomingDisposition {
        if session_reset && sequence == 1 {
            self.sequences.reset_last_seen(sender, recipient);
        }
        if self.sequences.is_duplicate(sender, recipient, sequence) {
            self.metrics.record_skipped(now_ms);
            return IncomingDisposition::Duplicate;
        }
        IncomingDisposition::Fresh
    }

    pub fn hydrate(&mut self, file: &MessageStateFile) {
        self.sequences.hydrate(file);
    }

    pub fn snapshot(&self, now_ms: u64) -> MessageStateFile {
        self.sequences.snapshot(now_ms)
    }

    pub fn reset(&mut self) {
        self.sequences.clear();
        self.pending.clear();
        self.metrics.reset();
    }

    fn resolve(&mut self, pending: PendingDelivery, now_ms: u64) -> DeliveryResult {
        let (outcome, latency_ms) = if pending.fully_verified() {
            for recipient in &pending.expected {
                self.sequences
                    .commit(&pending.sender, recipient, pending.sequence);
            }
            let latency = now_ms.saturating_sub(pending.sent_at);
            self.metrics.record(
                MetricKind::Delivered,
                pending.mode.as_str(),
                &pending.recipient_key,
                &pending.msg_type,
                now_ms,
            );
            self.metrics.record_latency(latency);
            (SendOutcome::DeliveredVerified, Some(latency))
        } else if !pending.failed.is_empty() {
            self.metrics.record(
                MetricKind::Failed,
                pending.mode.as_str(),
                &pending.recipient_key,
                &pending.msg_type,
                now_ms,
            );
            (SendOutcome::DeliveryFailed, None)
        } else {
            (SendOutcome::AcceptedUnverified, None)
        };

        DeliveryResult {
            delivery_id: pending.delivery_id.clone(),
            outcome,
            sender: pending.sender.clone(),
            sequence: pending.sequence,
            recipient_key: pending.recipient_key.clone(),
            latency_ms,
            failed: pending.failed,
        }
    }
}
