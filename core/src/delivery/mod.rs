//! Message sequencing and delivery tracking
//!
//! Every outbound message gets a monotonic per-sender sequence, a delivery
//! id, a per-recipient acknowledgement set, and a bounded verification
//! window. Reliability metrics ride along.

pub mod metrics;
pub mod sequencer;
pub mod tracker;

pub use metrics::{CounterSet, LatencyStats, MetricKind, ReliabilityMetrics, WindowStats};
pub use sequencer::{
    format_wire, parse_wire, MessageStateFile, MessageStore, ParsedMessage, SequenceBook,
    AGENT_MSG_PREFIX, SESSION_RESET_MARKER,
};
pub use tracker::{
    create_delivery_id, DeliveryMode, DeliveryResult, DeliveryTracker, IncomingDisposition,
    PendingDelivery, DEFAULT_ACK_TIMEOUT_MS,
};
