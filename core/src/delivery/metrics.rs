//! Delivery reliability metrics
//!
//! Aggregate counters plus per-mode, per-recipient, and per-type breakdowns,
//! a bounded latency reservoir, and rolling windows computed from an
//! append-only event log capped at 2000 entries.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;

/// Append-only log bound
pub const METRICS_LOG_CAP: usize = 2000;

/// Latency reservoir bound
pub const LATENCY_SAMPLE_CAP: usize = 500;

pub const WINDOW_15_MIN_MS: u64 = 15 * 60 * 1000;
pub const WINDOW_1_HOUR_MS: u64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Sent,
    Delivered,
    Failed,
    TimedOut,
    Skipped,
    Retry,
}

#[derive(Debug, Clone, Copy)]
struct MetricEvent {
    at: u64,
    kind: MetricKind,
}

/// One breakdown bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSet {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub timed_out: u64,
}

impl CounterSet {
    fn bump(&mut self, kind: MetricKind) {
        match kind {
            MetricKind::Sent => self.sent += 1,
            MetricKind::Delivered => self.delivered += 1,
            MetricKind::Failed => self.failed += 1,
            MetricKind::TimedOut => self.timed_out += 1,
            MetricKind::Skipped | MetricKind::Retry => {}
        }
    }
}

/// Rolling-window view
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStats {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub skipped: u64,
    /// delivered / sent, 1.0 when nothing was sent
    pub delivery_rate: f64,
}

/// Latency reservoir summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
}

#[derive(Debug, Default)]
pub struct ReliabilityMetrics {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub skipped: u64,
    pub retries: u64,
    by_mode: HashMap<String, CounterSet>,
    by_recipient: HashMap<String, CounterSet>,
    by_type: HashMap<String, CounterSet>,
    latency_ms: VecDeque<u64>,
    log: VecDeque<MetricEvent>,
}

impl ReliabilityMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        kind: MetricKind,
        mode: &str,
        recipient: &str,
        msg_type: &str,
        now_ms: u64,
    ) {
        match kind {
            MetricKind::Sent => self.sent += 1,
            MetricKind::Delivered => self.delivered += 1,
            MetricKind::Failed => self.failed += 1,
            MetricKind::TimedOut => self.timed_out += 1,
            MetricKind::Skipped => self.skipped += 1,
            MetricKind::Retry => self.retries += 1,
        }
        self.by_mode.entry(mode.to_string()).or_default().bump(kind);
        self.by_recipient
            .entry(recipient.to_string())
            .or_default()
            .bump(kind);
        self.by_type
            .entry(msg_type.to_string())
            .or_default()
            .bump(kind);

        self.log.push_back(MetricEvent { at: now_ms, kind });
        while self.log.len() > METRICS_LOG_CAP {
            self.log.pop_front();
        }
    }

    /// Skips have no mode/recipient/type context
    pub fn record_skipped(&mut self, now_ms: u64) {
        self.skipped += 1;
        self.log.push_back(MetricEvent {
            at: now_ms,
            kind: MetricKind::Skipped,
        });
        while self.log.len() > METRICS_LOG_CAP {
            self.log.pop_front();
        }
    }

    pub fn record_latency(&mut self, latency_ms: u64) {
        self.latency_ms.push_back(latency_ms);
        while self.latency_ms.len() > LATENCY_SAMPLE_CAP {
            self.latency_ms.pop_front();
        }
    }

    pub fn latency(&self) -> LatencyStats {
        if self.latency_ms.is_empty() {
            return LatencyStats::default();
        }
        let count = self.latency_ms.len();
        let sum: u64 = self.latency_ms.iter().sum();
        LatencyStats {
            count,
            min_ms: *self.latency_ms.iter().min().unwrap_or(&0),
            max_ms: *self.latency_ms.iter().max().unwrap_or(&0),
            avg_ms: sum / count as u64,
        }
    }

    pub fn window(&self, now_ms: u64, span_ms: u64) -> WindowStats {
        let mut stats = WindowStats::default();
        for event in self
            .log
            .iter()
            .rev()
            .take_while(|e| now_ms.saturating_sub(e.at) <= span_ms)
        {
            match event.kind {
                MetricKind::Sent => stats.sent += 1,
                MetricKind::Delivered => stats.delivered += 1,
                MetricKind::Failed => stats.failed += 1,
                MetricKind::TimedOut => stats.timed_out += 1,
                MetricKind::Skipped => stats.skipped += 1,
                MetricKind::Retry => {}
            }
        }
        stats.delivery_rate = if stats.sent == 0 {
            1.0
        } else {
            stats.delivered as f64 / stats.sent as f64
        };
        stats
    }

    pub fn last_fifteen_minutes(&self, now_ms: u64) -> WindowStats {
        self.window(now_ms, WINDOW_15_MIN_MS)
    }

    pub fn last_hour(&self, now_ms: u64) -> WindowStats {
        self.window(now_ms, WINDOW_1_HOUR_MS)
    }

    pub fn by_mode(&self) -> BTreeMap<String, CounterSet> {
        self.by_mode.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    pub fn by_recipient(&self) -> BTreeMap<String, CounterSet> {
        self.by_recipient
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn by_type(&self) -> BTreeMap<String, CounterSet> {
        self.by_type.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
