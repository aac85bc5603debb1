//! Bounded telemetry ring and query surface
//!
//! Every emission lands here in insertion order. Eviction only fires when
//! the count exceeds the cap AND the oldest entry is past the age bound, so
//! bursts legitimately expand the buffer and collapse back as entries age
//! out. Telemetry failures never reach the dispatcher.

use std::collections::{HashMap, VecDeque};

use super::dispatch::type_matches;
use super::envelope::EventEnvelope;

/// Query over the ring; all filters optional, combined with AND
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub correlation_id: Option<String>,
    pub recipient_id: Option<String>,
    /// Exact type or `prefix.*`
    pub event_type: Option<String>,
    /// Any-of list of exact types or patterns
    pub event_types: Option<Vec<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn recipient(mut self, recipient_id: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self
    }

    pub fn of_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn of_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, envelope: &EventEnvelope) -> bool {
        if let Some(correlation_id) = &self.correlation_id {
            if &envelope.correlation_id != correlation_id {
                return false;
            }
        }
        if let Some(recipient_id) = &self.recipient_id {
            if &envelope.recipient_id != recipient_id {
                return false;
            }
        }
        if let Some(pattern) = &self.event_type {
            if !type_matches(pattern, &envelope.event_type) {
                return false;
            }
        }
        if let Some(patterns) = &self.event_types {
            if !patterns.iter().any(|p| type_matches(p, &envelope.event_type)) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if envelope.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if envelope.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Insertion-ordered bounded event store
#[derive(Debug, Default)]
pub struct EventRing {
    entries: VecDeque<EventEnvelope>,
    max_entries: usize,
    max_age_ms: u64,
}

impl EventRing {
    pub fn new(max_entries: usize, max_age_ms: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries,
            max_age_ms,
        }
    }

    /// Append and evict. Entries drop only while count > cap and the oldest
    /// is past the age bound.
    pub fn push(&mut self, envelope: EventEnvelope, now_ms: u64) {
        self.entries.push_back(envelope);
        while self.entries.len() > self.max_entries {
            let oldest_expired = self
                .entries
                .front()
                .map(|e| now_ms.saturating_sub(e.timestamp) > self.max_age_ms)
                .unwrap_or(false);
            if !oldest_expired {
                break;
            }
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Matching entries, newest first, at most `limit`
    pub fn query(&self, query: &EventQuery) -> Vec<EventEnvelope> {
        let limit = query.limit.unwrap_or(usize::MAX);
        self.entries
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }

    /// All events of one correlation chain in causal order
    ///
    /// Roots (no causation id) come first sorted by timestamp, each followed
    /// depth-first by its children sorted by timestamp. Orphans whose
    /// causation id is unknown to the chain are appended at the end.
    pub fn causation_chain(&self, correlation_id: &str) -> Vec<EventEnvelope> {
        let chain: Vec<&EventEnvelope> = self
            .entries
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .collect();

        let known: std::collections::HashSet<&str> =
            chain.iter().map(|e| e.event_id.as_str()).collect();

        let mut children: HashMap<&str, Vec<&EventEnvelope>> = HashMap::new();
        let mut roots: Vec<&EventEnvelope> = Vec::new();
        let mut orphans: Vec<&EventEnvelope> = Vec::new();

        for event in &chain {
            match event.causation_id.as_deref() {
                None => roots.push(event),
                Some(parent) if known.contains(parent) => {
                    children.entry(parent).or_default().push(event);
                }
                Some(_) => orphans.push(event),
            }
        }

        roots.sort_by_key(|e| e.timestamp);
        orphans.sort_by_key(|e| e.timestamp);
        for siblings in children.values_mut() {
            siblings.sort_by_key(|e| e.timestamp);
        }

        let mut ordered = Vec::with_capacity(chain.len());
        let mut stack: Vec<&EventEnvelope> = roots.into_iter().rev().collect();
        while let Some(event) = stack.pop() {
            ordered.push(event.clone());
            if let Some(siblings) = children.get(event.event_id.as_str()) {
                for child in siblings.iter().rev() {
                    stack.push(child);
                }
            }
        }
        ordered.extend(orphans.into_iter().cloned());
        ordered
    }
}
