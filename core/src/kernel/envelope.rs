//! Event envelope and identity minting
//!
//! The envelope is the single schema every intent travels in. The builder
//! assigns ids, stamps time, advances the per-source sequence, inherits or
//! mints the correlation id, and applies payload redaction. Envelopes are
//! immutable once dispatched; subscribers receive shared references.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Recipient id used for events that concern no particular pane
pub const SYSTEM_RECIPIENT: &str = "system";

/// Default source for events minted by the kernel itself
pub const KERNEL_SOURCE: &str = "kernel";

/// Payload keys replaced by a redaction stub outside developer mode
const REDACTED_KEYS: [&str; 2] = ["body", "message"];

/// Millisecond clock handle
///
/// The kernel never calls the system clock directly; everything time-shaped
/// goes through one of these so tests can pin and advance it.
#[derive(Debug, Clone)]
pub enum Clock {
    System,
    Fixed(Arc<AtomicU64>),
}

impl Clock {
    pub fn system() -> Self {
        Clock::System
    }

    /// A manually driven clock starting at `start_ms`
    pub fn fixed(start_ms: u64) -> Self {
        Clock::Fixed(Arc::new(AtomicU64::new(start_ms)))
    }

    pub fn now_ms(&self) -> u64 {
        match self {
            Clock::System => chrono::Utc::now().timestamp_millis().max(0) as u64,
            Clock::Fixed(ms) => ms.load(Ordering::SeqCst),
        }
    }

    /// Advance a fixed clock; ignored (and logged) on the system clock
    pub fn advance(&self, delta_ms: u64) {
        match self {
            Clock::Fixed(ms) => {
                ms.fetch_add(delta_ms, Ordering::SeqCst);
            }
            Clock::System => {
                crate::warn_log!("Clock::advance called on the system clock");
            }
        }
    }
}

/// The immutable event record dispatched to subscribers and telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Globally unique id for this event
    pub event_id: String,

    /// Chain id shared by every event in one causal story
    pub correlation_id: String,

    /// Event id of the event that caused this one; None for roots
    pub causation_id: Option<String>,

    /// Dotted type string, e.g. `inject.requested`
    #[serde(rename = "type")]
    pub event_type: String,

    /// Short identifier of the emitter module; sequence key
    pub source: String,

    /// Pane/target this event concerns, or `system`
    pub recipient_id: String,

    /// Milliseconds since epoch
    pub timestamp: u64,

    /// Monotonically increasing within `source`
    pub sequence: u64,

    /// Opaque payload; `body`/`message` fields redacted outside dev mode
    pub payload: Map<String, Value>,

    /// Set when a contract chose `skip`: receivers observe but decline the
    /// side effect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
}

impl EventEnvelope {
    /// First dotted segment of the type, used for `<root>.resumed` and
    /// `<root>.dropped` markers
    pub fn type_root(&self) -> &str {
        self.event_type.split('.').next().unwrap_or(&self.event_type)
    }
}

/// Inputs for a fresh emission
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub event_type: String,
    pub recipient_id: String,
    pub payload: Map<String, Value>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub source: Option<String>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, recipient_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            recipient_id: recipient_id.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Inherit chain identity from a parent event
    pub fn caused_by(mut self, parent: &EventEnvelope) -> Self {
        self.correlation_id = Some(parent.correlation_id.clone());
        self.causation_id = Some(parent.event_id.clone());
        self
    }
}

/// Mints envelopes: ids, sequences, timestamps, correlation, redaction
#[derive(Debug)]
pub struct EnvelopeBuilder {
    sequences: HashMap<String, u64>,
    current_correlation: Option<String>,
    dev_mode: bool,
    clock: Clock,
}

impl EnvelopeBuilder {
    pub fn new(clock: Clock) -> Self {
        Self {
            sequences: HashMap::new(),
            current_correlation: None,
            dev_mode: false,
            clock,
        }
    }

    pub fn dev_mode(&self) -> bool {
        self.dev_mode
    }

    pub fn set_dev_mode(&mut self, dev_mode: bool) {
        self.dev_mode = dev_mode;
    }

    /// Process-wide default correlation; when set, emissions without an
    /// explicit correlation inherit it instead of minting one
    pub fn set_current_correlation(&mut self, correlation_id: Option<String>) {
        self.current_correlation = correlation_id;
    }

    pub fn current_correlation(&self) -> Option<&str> {
        self.current_correlation.as_deref()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Build a fresh envelope from emission inputs
    pub fn build(&mut self, spec: NewEvent) -> EventEnvelope {
        let source = spec.source.unwrap_or_else(|| KERNEL_SOURCE.to_string());
        let sequence = self.next_sequence(&source);
        let correlation_id = spec
            .correlation_id
            .or_else(|| self.current_correlation.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        EventEnvelope {
            event_id: Uuid::new_v4().to_string(),
            correlation_id,
            causation_id: spec.causation_id,
            event_type: spec.event_type,
            source,
            recipient_id: spec.recipient_id,
            timestamp: self.clock.now_ms(),
            sequence,
            payload: redact_payload(spec.payload, self.dev_mode),
            skipped: None,
        }
    }

    /// Accept a fully-formed envelope from an external bridge
    ///
    /// Ids are preserved; the source sequence counter advances to
    /// `max(current, incoming.sequence)` so later local emissions stay
    /// monotonic. Redaction still applies.
    pub fn ingest(&mut self, mut envelope: EventEnvelope) -> EventEnvelope {
        let counter = self.sequences.entry(envelope.source.clone()).or_insert(0);
        *counter = (*counter).max(envelope.sequence);
        envelope.payload = redact_payload(envelope.payload, self.dev_mode);
        envelope
    }

    /// Last sequence handed out for a source (0 if never used)
    pub fn last_sequence(&self, source: &str) -> u64 {
        self.sequences.get(source).copied().unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.sequences.clear();
        self.current_correlation = None;
    }

    fn next_sequence(&mut self, source: &str) -> u64 {
        let counter = self.sequences.entry(source.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}

/// Replace `body`/`message` payload fields with a redaction stub
///
/// Runs in the builder so subscribers, telemetry, and disk artefacts all
/// share the same view.
pub fn redact_payload(payload: Map<String, Value>, dev_mode: bool) -> Map<String, Value> {
    if dev_mode {
        return payload;
    }
    let mut redacted = Map::with_capacity(payload.len());
    for (key, value) in payload {
        if REDACTED_KEYS.contains(&key.as_str()) {
            let length = match &value {
                Value::String(s) => s.chars().count(),
                other => other.to_string().chars().count(),
            };
            redacted.insert(key, json!({ "redacted": true, "length": length }));
        } else {
            redacted.insert(key, value);
        }
    }
    redacted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::new(Clock::fixed(1_000))
    }

    #[test]
    fn test_sequences_are_monotonic_per_source() {
        let mut b = builder();
        let e1 = b.build(NewEvent::new("inject.requested", "p1").with_source("tracker"));
        let e2 = b.build(NewEvent::new("inject.requested", "p1").with_source("tracker"));
        let e3 = b.build(NewEvent::new("inject.requested", "p1").with_source("trigger"));

        assert_eq!(e1.sequence, 1);
        assert_eq!(e2.sequence, 2);
        assert_eq!(e3.sequence, 1); // independent counter per source
        assert!(e1.event_id != e2.event_id);
    }

    #[test]
    fn test_correlation_inherited_from_current() {
        let mut b = builder();
        b.set_current_correlation(Some("corr-1".to_string()));
        let e = b.build(NewEvent::new("resize.started", SYSTEM_RECIPIENT));
        assert_eq!(e.correlation_id, "corr-1");

        b.set_current_correlation(None);
        let e2 = b.build(NewEvent::new("resize.started", SYSTEM_RECIPIENT));
        assert_ne!(e2.correlation_id, "corr-1");
    }

    #[test]
    fn test_explicit_correlation_wins() {
        let mut b = builder();
        b.set_current_correlation(Some("corr-1".to_string()));
        let mut spec = NewEvent::new("inject.requested", "p1");
        spec.correlation_id = Some("corr-2".to_string());
        assert_eq!(b.build(spec).correlation_id, "corr-2");
    }

    #[test]
    fn test_caused_by_links_chain() {
        let mut b = builder();
        let parent = b.build(NewEvent::new("inject.requested", "p1"));
        let child = b.build(NewEvent::new("contract.checked", "p1").caused_by(&parent));
        assert_eq!(child.correlation_id, parent.correlation_id);
        assert_eq!(child.causation_id, Some(parent.event_id.clone()));
    }

    #[test]
    fn test_payload_redaction() {
        let mut b = builder();
        let mut payload = Map::new();
        payload.insert("body".to_string(), Value::String("secret".to_string()));
        payload.insert("other".to_string(), Value::String("kept".to_string()));

        let e = b.build(NewEvent::new("inject.requested", "p1").with_payload(payload.clone()));
        assert_eq!(e.payload["body"], json!({ "redacted": true, "length": 6 }));
        assert_eq!(e.payload["other"], Value::String("kept".to_string()));

        b.set_dev_mode(true);
        let e = b.build(NewEvent::new("inject.requested", "p1").with_payload(payload));
        assert_eq!(e.payload["body"], Value::String("secret".to_string()));
    }

    #[test]
    fn test_ingest_preserves_ids_and_advances_sequence() {
        let mut b = builder();
        b.build(NewEvent::new("x", "p1").with_source("bridge"));

        let incoming = EventEnvelope {
            event_id: "ext-1".to_string(),
            correlation_id: "ext-corr".to_string(),
            causation_id: None,
            event_type: "inject.requested".to_string(),
            source: "bridge".to_string(),
            recipient_id: "p1".to_string(),
            timestamp: 500,
            sequence: 9,
            payload: Map::new(),
            skipped: None,
        };
        let ingested = b.ingest(incoming);
        assert_eq!(ingested.event_id, "ext-1");
        assert_eq!(ingested.sequence, 9);
        assert_eq!(b.last_sequence("bridge"), 9);

        // Lower incoming sequence never regresses the counter
        let behind = EventEnvelope {
            event_id: "ext-2".to_string(),
            sequence: 3,
            ..ingested.clone()
        };
        b.ingest(behind);
        assert_eq!(b.last_sequence("bridge"), 9);

        let next = b.build(NewEvent::new("x", "p1").with_source("bridge"));
        assert_eq!(next.sequence, 10);
    }

    #[test]
    fn test_type_root() {
        let mut b = builder();
        let e = b.build(NewEvent::new("inject.requested", "p1"));
        assert_eq!(e.type_root(), "inject");
    }

    #[test]
    fn test_fixed_clock() {
        let clock = Clock::fixed(100);
        assert_eq!(clock.now_ms(), 100);
        clock.advance(50);
        assert_eq!(clock.now_ms(), 150);
    }
}
