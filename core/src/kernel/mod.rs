//! The event kernel
//!
//! Single point through which every intent passes before taking effect:
//! envelope minting, contract evaluation, subscriber fan-out, telemetry,
//! deferred queues, safe mode, and delivery bookkeeping all live behind one
//! `&mut self` surface. The kernel is synchronous and single-writer; the
//! daemon serializes entry with a mutex and timer callbacks re-enter under
//! the same exclusion via `tick`.
//!
//! Engine-originated events (`contract.checked`, `contract.violation`,
//! `safemode.*`, `pane.state.changed`, `*.resumed`, `*.dropped`) take an
//! internal path that bypasses the contract engine, which breaks the cycle
//! of contracts gating their own diagnostics.

pub mod contract;
pub mod deferred;
pub mod dispatch;
pub mod envelope;
pub mod ring;
pub mod state;

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::KernelConfig;
use crate::delivery::{DeliveryMode, DeliveryResult, DeliveryTracker, IncomingDisposition};
use crate::error::{KernelError, Result};

use contract::{Contract, ContractAction, ContractEngine, EngineEvent, SafeModeState};
use deferred::{DeferredEntry, DeferredQueues};
use dispatch::{EventHandler, SubscriberTable, SubscriptionId};
use envelope::{Clock, EnvelopeBuilder, EventEnvelope, NewEvent, SYSTEM_RECIPIENT};
use ring::{EventQuery, EventRing};
use state::{GateClears, PaneState, StatePatch, StateRegistry};

/// Orchestrator workflow state the trigger gate checks against
pub const DEFAULT_WORKFLOW_STATE: &str = "active";

/// Aggregate kernel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelCounters {
    pub emitted: u64,
    pub delivered: u64,
    pub deferred: u64,
    pub dropped: u64,
    pub resumed: u64,
    pub ttl_expired: u64,
    pub handler_faults: u64,
    pub safemode_entries: u64,
}

/// How one emission was dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered normally to `handlers` subscribers
    Delivered { handlers: usize },
    /// Delivered with `skipped=true` after a skip-action violation
    Skipped { contract_id: String, handlers: usize },
    /// Parked on the recipient's deferred queue
    Deferred { contract_id: String },
    /// Withheld from subscribers entirely
    Blocked { contract_id: String },
}

/// Returned from `emit`/`ingest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitResult {
    pub event_id: String,
    pub correlation_id: String,
    pub outcome: DispatchOutcome,
}

/// The kernel instance: subscriptions, contracts, state vectors, ring
/// buffer, deferred queues, and the delivery table
pub struct EventKernel {
    config: KernelConfig,
    clock: Clock,
    builder: EnvelopeBuilder,
    states: StateRegistry,
    ring: EventRing,
    subscribers: SubscriberTable,
    engine: ContractEngine,
    safemode: SafeModeState,
    deferred: DeferredQueues,
    delivery: DeliveryTracker,
    counters: KernelCounters,
    workflow_state: String,
}

impl EventKernel {
    pub fn new(config: KernelConfig) -> Self {
        Self::with_clock(config, Clock::system())
    }

    pub fn with_clock(config: KernelConfig, clock: Clock) -> Self {
        let mut builder = EnvelopeBuilder::new(clock.clone());
        builder.set_dev_mode(config.dev_mode);
        Self {
            ring: EventRing::new(config.ring_max_entries, config.ring_max_age_ms),
            delivery: DeliveryTracker::new(config.ack_timeout_ms),
            builder,
            states: StateRegistry::new(),
            subscribers: SubscriberTable::new(),
            engine: ContractEngine::new(),
            safemode: SafeModeState::new(),
            deferred: DeferredQueues::new(),
            counters: KernelCounters::default(),
            workflow_state: DEFAULT_WORKFLOW_STATE.to_string(),
            clock,
            config,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn counters(&self) -> KernelCounters {
        self.counters
    }

    pub fn dev_mode(&self) -> bool {
        self.builder.dev_mode()
    }

    pub fn set_dev_mode(&mut self, dev_mode: bool) {
        self.builder.set_dev_mode(dev_mode);
    }

    /// Process-wide default correlation for subsequent emissions
    pub fn set_current_correlation(&mut self, correlation_id: Option<String>) {
        self.builder.set_current_correlation(correlation_id);
    }

    pub fn workflow_state(&self) -> &str {
        &self.workflow_state
    }

    pub fn set_workflow_state(&mut self, state: impl Into<String>) {
        self.workflow_state = state.into();
    }

    pub fn safemode_active(&self) -> bool {
        self.safemode.active
    }

    pub fn deferred_len(&self, recipient_id: &str) -> usize {
        self.deferred.len(recipient_id)
    }

    pub fn delivery(&self) -> &DeliveryTracker {
        &self.delivery
    }

    pub fn delivery_mut(&mut self) -> &mut DeliveryTracker {
        &mut self.delivery
    }

    // =========================================================================
    // Subscriptions & contracts
    // =========================================================================

    pub fn subscribe(
        &mut self,
        pattern: impl Into<String>,
        handler: EventHandler,
    ) -> Result<SubscriptionId> {
        self.subscribers.subscribe(pattern, handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Register or replace a contract (same id replaces the prior)
    pub fn register_contract(&mut self, contract: Contract) -> Result<()> {
        self.engine.register(contract)
    }

    pub fn contract_ids(&self) -> Vec<String> {
        self.engine.contract_ids()
    }

    pub fn shadow_contract_ids(&self) -> Vec<String> {
        self.engine.shadow_ids()
    }

    pub fn violation_count(&self, contract_id: &str) -> u64 {
        self.engine.violation_count(contract_id)
    }

    /// Lift a shadow contract to enforced; emits `contract.promoted`
    pub fn promote_contract(&mut self, contract_id: &str) -> bool {
        if !self.engine.promote(contract_id) {
            return false;
        }
        let mut payload = Map::new();
        payload.insert("contractId".to_string(), json!(contract_id));
        payload.insert("mode".to_string(), json!("enforced"));
        self.emit_internal("contract.promoted", SYSTEM_RECIPIENT, payload, None);
        true
    }

    // =========================================================================
    // Emission paths
    // =========================================================================

    /// Emit an event through the contract engine
    pub fn emit(&mut self, spec: NewEvent) -> Result<EmitResult> {
        Self::validate_spec(&spec)?;
        let envelope = self.builder.build(spec);
        self.counters.emitted += 1;
        Ok(self.route(envelope))
    }

    /// Accept a fully-formed envelope from an external bridge
    ///
    /// Ids are preserved, the source sequence advances to
    /// `max(current, incoming)`, and the contract engine is bypassed.
    pub fn ingest(&mut self, envelope: EventEnvelope) -> Result<EmitResult> {
        if envelope.event_type.is_empty() {
            return Err(KernelError::MissingEnvelopeField {
                field: "type".to_string(),
            });
        }
        if envelope.event_id.is_empty() {
            return Err(KernelError::MissingEnvelopeField {
                field: "eventId".to_string(),
            });
        }
        let envelope = self.builder.ingest(envelope);
        self.counters.emitted += 1;
        self.ring_append(envelope.clone());
        let handlers = self.fan_out(&envelope);
        self.counters.delivered += 1;
        Ok(EmitResult {
            event_id: envelope.event_id,
            correlation_id: envelope.correlation_id,
            outcome: DispatchOutcome::Delivered { handlers },
        })
    }

    fn validate_spec(spec: &NewEvent) -> Result<()> {
        if spec.event_type.is_empty() || spec.event_type.contains('*') {
            return Err(KernelError::MissingEnvelopeField {
                field: "type".to_string(),
            });
        }
        if spec.recipient_id.is_empty() {
            return Err(KernelError::MissingEnvelopeField {
                field: "recipientId".to_string(),
            });
        }
        Ok(())
    }

    /// Contract evaluation and outcome handling for a fresh emission
    fn route(&mut self, mut envelope: EventEnvelope) -> EmitResult {
        let state = self.states.get(&envelope.recipient_id);
        let eval = self.engine.evaluate(&envelope, &state, false);
        let action = eval.outcome();
        if action == ContractAction::Skip {
            envelope.skipped = Some(true);
        }

        // Telemetry sees every intent that reached the kernel, delivered or not
        self.ring_append(envelope.clone());
        self.publish_engine_trace(&envelope, &eval.trace);
        if eval.enforced.is_some() {
            self.note_enforced_violation();
        }

        let event_id = envelope.event_id.clone();
        let correlation_id = envelope.correlation_id.clone();
        let outcome = match action {
            ContractAction::Defer => {
                let contract_id = eval
                    .enforced
                    .map(|v| v.contract_id)
                    .unwrap_or_default();
                let recipient_id = envelope.recipient_id.clone();
                self.deferred.push(
                    &recipient_id,
                    DeferredEntry {
                        envelope,
                        contract_id: contract_id.clone(),
                        deferred_at: self.clock.now_ms(),
                        ttl_ms: self.config.defer_ttl_ms,
                    },
                );
                self.counters.deferred += 1;
                DispatchOutcome::Deferred { contract_id }
            }
            ContractAction::Block | ContractAction::Drop => {
                self.counters.dropped += 1;
                DispatchOutcome::Blocked {
                    contract_id: eval
                        .enforced
                        .map(|v| v.contract_id)
                        .unwrap_or_default(),
                }
            }
            ContractAction::Skip => {
                let handlers = self.fan_out(&envelope);
                self.counters.delivered += 1;
                DispatchOutcome::Skipped {
                    contract_id: eval
                        .enforced
                        .map(|v| v.contract_id)
                        .unwrap_or_default(),
                    handlers,
                }
            }
            ContractAction::Continue => {
                let handlers = self.fan_out(&envelope);
                self.counters.delivered += 1;
                DispatchOutcome::Delivered { handlers }
            }
        };

        EmitResult {
            event_id,
            correlation_id,
            outcome,
        }
    }

    /// Internal emission path: build, record, fan out; no contract engine
    fn emit_internal(
        &mut self,
        event_type: &str,
        recipient_id: &str,
        payload: Map<String, Value>,
        parent: Option<&EventEnvelope>,
    ) -> EventEnvelope {
        let mut spec = NewEvent::new(event_type, recipient_id).with_payload(payload);
        if let Some(parent) = parent {
            spec = spec.caused_by(parent);
        }
        let envelope = self.builder.build(spec);
        self.ring_append(envelope.clone());
        let _ = self.fan_out(&envelope);
        envelope
    }

    fn ring_append(&mut self, envelope: EventEnvelope) {
        self.ring.push(envelope, self.clock.now_ms());
    }

    fn fan_out(&mut self, envelope: &EventEnvelope) -> usize {
        let result = self.subscribers.dispatch(envelope);
        for fault in &result.faults {
            self.counters.handler_faults += 1;
            crate::error_log!(
                "handler fault on {} (subscription {}): {}",
                envelope.event_type,
                fault.subscription_id,
                fault.detail
            );
        }
        // bus.error is best-effort and never re-entrant: ring only, no fan-out
        for fault in result.faults {
            let mut payload = Map::new();
            payload.insert("error".to_string(), json!(fault.detail));
            payload.insert("pattern".to_string(), json!(fault.pattern));
            payload.insert("eventId".to_string(), json!(envelope.event_id));
            let spec = NewEvent::new("bus.error", SYSTEM_RECIPIENT)
                .with_payload(payload)
                .caused_by(envelope);
            let bus_error = self.builder.build(spec);
            self.ring_append(bus_error);
        }
        result.invoked
    }

    fn publish_engine_trace(&mut self, envelope: &EventEnvelope, trace: &[EngineEvent]) {
        for event in trace {
            match event {
                EngineEvent::Checked { contract_id } => {
                    let mut payload = Map::new();
                    payload.insert("contractId".to_string(), json!(contract_id));
                    payload.insert("eventId".to_string(), json!(envelope.event_id));
                    payload.insert("eventType".to_string(), json!(envelope.event_type));
                    self.emit_internal(
                        "contract.checked",
                        &envelope.recipient_id,
                        payload,
                        Some(envelope),
                    );
                }
                EngineEvent::ShadowViolation(record) | EngineEvent::EnforcedViolation(record) => {
                    let mut payload = Map::new();
                    payload.insert("contractId".to_string(), json!(record.contract_id));
                    payload.insert(
                        "action".to_string(),
                        serde_json::to_value(record.action).unwrap_or(Value::Null),
                    );
                    payload.insert(
                        "mode".to_string(),
                        serde_json::to_value(record.mode).unwrap_or(Value::Null),
                    );
                    payload.insert(
                        "severity".to_string(),
                        serde_json::to_value(record.severity).unwrap_or(Value::Null),
                    );
                    payload.insert(
                        "failedPrecondition".to_string(),
                        json!(record.failed_precondition),
                    );
                    payload.insert("eventId".to_string(), json!(envelope.event_id));
                    self.emit_internal(
                        &record.emit_type,
                        &envelope.recipient_id,
                        payload,
                        Some(envelope),
                    );
                }
            }
        }
    }

    // =========================================================================
    // State vectors
    // =========================================================================

    /// Copy of a recipient's state; unknown recipients default
    pub fn get_state(&self, recipient_id: &str) -> PaneState {
        self.states.get(recipient_id)
    }

    pub fn known_recipients(&self) -> Vec<String> {
        self.states.known_recipients()
    }

    /// Partial state merge; true when anything changed
    ///
    /// A change publishes `pane.state.changed` with before/after snapshots
    /// before any drain it causes. Clearing focus-lock, confirmed
    /// compaction, or safe mode drains the recipient's deferred queue.
    pub fn update_state(&mut self, recipient_id: &str, patch: StatePatch) -> bool {
        self.apply_state_patch(recipient_id, patch, true)
    }

    fn apply_state_patch(
        &mut self,
        recipient_id: &str,
        patch: StatePatch,
        drain_on_clear: bool,
    ) -> bool {
        let before = self.states.get(recipient_id);
        let mut after = before;
        patch.apply(&mut after);
        if after == before {
            return false;
        }
        self.states.insert(recipient_id, after);

        let mut payload = Map::new();
        payload.insert(
            "before".to_string(),
            serde_json::to_value(before).unwrap_or(Value::Null),
        );
        payload.insert(
            "after".to_string(),
            serde_json::to_value(after).unwrap_or(Value::Null),
        );
        self.emit_internal("pane.state.changed", recipient_id, payload, None);

        if drain_on_clear && GateClears::detect(&before, &after).any() {
            self.drain_deferred(recipient_id);
        }
        true
    }

    // =========================================================================
    // Deferred queue drains
    // =========================================================================

    /// Re-evaluate a recipient's deferred events against current state
    ///
    /// Idempotent: an empty queue drains to nothing.
    pub fn drain_deferred(&mut self, recipient_id: &str) {
        let mut queue = self.deferred.take(recipient_id);
        if queue.is_empty() {
            return;
        }
        let mut kept = VecDeque::new();
        while let Some(entry) = queue.pop_front() {
            let now = self.clock.now_ms();
            if entry.expired(now) {
                self.counters.ttl_expired += 1;
                self.counters.dropped += 1;
                let dropped_type = format!("{}.dropped", entry.envelope.type_root());
                let mut payload = Map::new();
                payload.insert("eventId".to_string(), json!(entry.envelope.event_id));
                payload.insert("reason".to_string(), json!("ttl_expired"));
                payload.insert("contractId".to_string(), json!(entry.contract_id));
                self.emit_internal(&dropped_type, recipient_id, payload, Some(&entry.envelope));
                continue;
            }

            let state = self.states.get(recipient_id);
            let eval = self.engine.evaluate(&entry.envelope, &state, true);
            self.publish_engine_trace(&entry.envelope, &eval.trace);

            match eval.outcome() {
                ContractAction::Defer | ContractAction::Block | ContractAction::Drop => {
                    // Still gated; original deferredAt is kept
                    kept.push_back(entry);
                }
                action @ (ContractAction::Skip | ContractAction::Continue) => {
                    self.counters.resumed += 1;
                    let resumed_type = format!("{}.resumed", entry.envelope.type_root());
                    let mut payload = Map::new();
                    payload.insert("eventId".to_string(), json!(entry.envelope.event_id));
                    payload.insert("contractId".to_string(), json!(entry.contract_id));
                    self.emit_internal(&resumed_type, recipient_id, payload, Some(&entry.envelope));

                    let mut envelope = entry.envelope;
                    if action == ContractAction::Skip {
                        envelope.skipped = Some(true);
                    }
                    let _ = self.fan_out(&envelope);
                    self.counters.delivered += 1;
                }
            }
        }
        self.deferred.restore(recipient_id, kept);
    }

    // =========================================================================
    // Safe mode
    // =========================================================================

    fn note_enforced_violation(&mut self) {
        let now = self.clock.now_ms();
        if self.safemode.record_violation(
            now,
            self.config.safemode_window_ms,
            self.config.safemode_threshold,
        ) {
            self.enter_safe_mode(now);
        }
    }

    fn enter_safe_mode(&mut self, now_ms: u64) {
        self.safemode.enter(now_ms, self.config.safemode_cooldown_ms);
        self.counters.safemode_entries += 1;
        crate::warn_log!("safe mode entered at {}", now_ms);
        for recipient in self.states.known_recipients() {
            self.apply_state_patch(&recipient, StatePatch::safe_mode(true), true);
        }
        let mut payload = Map::new();
        payload.insert(
            "until".to_string(),
            json!(now_ms + self.config.safemode_cooldown_ms),
        );
        self.emit_internal("safemode.entered", SYSTEM_RECIPIENT, payload, None);
    }

    fn exit_safe_mode(&mut self) {
        self.safemode.exit();
        crate::info_log!("safe mode exited");
        let recipients = self.states.known_recipients();
        for recipient in &recipients {
            // safemode.exited goes out before the drains it causes
            self.apply_state_patch(recipient, StatePatch::safe_mode(false), false);
        }
        self.emit_internal("safemode.exited", SYSTEM_RECIPIENT, Map::new(), None);
        for recipient in &recipients {
            self.drain_deferred(recipient);
        }
    }

    // =========================================================================
    // Delivery bookkeeping
    // =========================================================================

    /// Begin tracking a delivery toward its acknowledgement deadline
    #[allow(clippy::too_many_arguments)]
    pub fn start_delivery(
        &mut self,
        delivery_id: &str,
        sender: &str,
        sequence: u64,
        recipient_key: &str,
        expected: Vec<String>,
        msg_type: &str,
        mode: DeliveryMode,
    ) {
        let now = self.clock.now_ms();
        self.delivery.start(
            delivery_id,
            sender,
            sequence,
            recipient_key,
            expected,
            msg_type,
            mode,
            now,
        );
    }

    /// Record one recipient's acknowledgement; emits `delivery.resolved`
    /// when the set completes
    pub fn record_delivery_outcome(
        &mut self,
        delivery_id: &str,
        recipient: &str,
        accepted: bool,
        verified: bool,
        reason: Option<String>,
    ) -> Option<DeliveryResult> {
        let now = self.clock.now_ms();
        let result =
            self.delivery
                .record_outcome(delivery_id, recipient, accepted, verified, reason, now)?;
        let mut payload = Map::new();
        payload.insert("deliveryId".to_string(), json!(result.delivery_id));
        payload.insert("outcome".to_string(), json!(result.outcome.to_string()));
        payload.insert("sender".to_string(), json!(result.sender));
        payload.insert("sequence".to_string(), json!(result.sequence));
        if let Some(latency) = result.latency_ms {
            payload.insert("latencyMs".to_string(), json!(latency));
        }
        self.emit_internal("delivery.resolved", SYSTEM_RECIPIENT, payload, None);
        Some(result)
    }

    /// Sequence-dedupe an incoming wire message; emits `delivery.skipped`
    /// and counts the skip on duplicates
    pub fn observe_incoming_message(
        &mut self,
        sender: &str,
        recipient: &str,
        sequence: u64,
        session_reset: bool,
    ) -> IncomingDisposition {
        let now = self.clock.now_ms();
        let disposition = self
            .delivery
            .observe_incoming(sender, recipient, sequence, session_reset, now);
        if disposition == IncomingDisposition::Duplicate {
            let mut payload = Map::new();
            payload.insert("sender".to_string(), json!(sender));
            payload.insert("sequence".to_string(), json!(sequence));
            payload.insert("reason".to_string(), json!("duplicate_sequence"));
            self.emit_internal("delivery.skipped", recipient, payload, None);
        }
        disposition
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Process due deadlines: safe-mode exit and delivery timeouts
    ///
    /// The daemon drives this on an interval under the same mutex as
    /// emissions; tests drive it with a pinned clock.
    pub fn tick(&mut self) -> Vec<DeliveryResult> {
        let now = self.clock.now_ms();
        if self.safemode.exit_due(now) {
            self.exit_safe_mode();
        }
        let timed_out = self.delivery.tick(now);
        for result in &timed_out {
            let mut payload = Map::new();
            payload.insert("deliveryId".to_string(), json!(result.delivery_id));
            payload.insert("outcome".to_string(), json!(result.outcome.to_string()));
            payload.insert("sender".to_string(), json!(result.sender));
            payload.insert("sequence".to_string(), json!(result.sequence));
            self.emit_internal("delivery.timeout", SYSTEM_RECIPIENT, payload, None);
        }
        timed_out
    }

    // =========================================================================
    // Telemetry queries
    // =========================================================================

    pub fn query(&self, query: &EventQuery) -> Vec<EventEnvelope> {
        self.ring.query(query)
    }

    pub fn causation_chain(&self, correlation_id: &str) -> Vec<EventEnvelope> {
        self.ring.causation_chain(correlation_id)
    }

    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }

    /// Drop all state except configuration and the clock
    pub fn reset(&mut self) {
        self.builder.reset();
        self.states.clear();
        self.ring.clear();
        self.subscribers.clear();
        self.engine.clear();
        self.safemode.reset();
        self.deferred.clear();
        self.delivery.reset();
        self.counters = KernelCounters::default();
        self.workflow_state = DEFAULT_WORKFLOW_STATE.to_string();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::contract::{ContractMode, Severity};
    use super::state::Activity;
    use super::*;

    type Seen = Arc<Mutex<Vec<EventEnvelope>>>;

    fn kernel() -> EventKernel {
        EventKernel::with_clock(KernelConfig::default(), Clock::fixed(1_000_000))
    }

    fn recorder(kernel: &mut EventKernel, pattern: &str) -> Seen {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        kernel
            .subscribe(pattern, Box::new(move |e| {
                sink.lock().unwrap().push(e.clone());
                Ok(())
            }))
            .unwrap();
        seen
    }

    fn inject_payload(text: &str) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("text".to_string(), json!(text));
        payload
    }

    #[test]
    fn test_focus_lock_defer_and_resume() {
        let mut k = kernel();
        let delivered = recorder(&mut k, "inject.requested");
        let violations = recorder(&mut k, "contract.violation");
        let resumed = recorder(&mut k, "inject.resumed");

        k.register_contract(
            Contract::new("focus-lock-guard")
                .applies_to("inject.requested")
                .precondition("focus-unlocked", |_, s| !s.gates.focus_locked)
                .severity(Severity::Block)
                .action(ContractAction::Defer),
        )
        .unwrap();

        k.update_state("p1", StatePatch::focus_locked(true));
        let result = k
            .emit(NewEvent::new("inject.requested", "p1").with_payload(inject_payload("hi")))
            .unwrap();

        assert!(matches!(
            result.outcome,
            DispatchOutcome::Deferred { ref contract_id } if contract_id == "focus-lock-guard"
        ));
        assert!(delivered.lock().unwrap().is_empty());
        {
            let v = violations.lock().unwrap();
            assert_eq!(v.len(), 1);
            assert_eq!(v[0].payload["contractId"], json!("focus-lock-guard"));
            assert_eq!(v[0].payload["action"], json!("defer"));
        }
        assert_eq!(k.deferred_len("p1"), 1);

        k.update_state("p1", StatePatch::focus_locked(false));

        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].event_id, result.event_id);
        let resumed = resumed.lock().unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].payload["eventId"], json!(result.event_id));
        assert_eq!(k.deferred_len("p1"), 0);
        assert_eq!(k.counters().resumed, 1);
    }

    #[test]
    fn test_ownership_exclusion_blocks() {
        let mut k = kernel();
        let delivered = recorder(&mut k, "inject.requested");
        let violations = recorder(&mut k, "contract.violation");

        k.register_contract(
            Contract::new("ownership-exclusive")
                .applies_to("inject.requested")
                .applies_to("resize.requested")
                .precondition("pane-idle", |_, s| s.activity == Activity::Idle)
                .severity(Severity::Block)
                .action(ContractAction::Block),
        )
        .unwrap();

        k.update_state("p1", StatePatch::activity(Activity::Injecting));
        let result = k.emit(NewEvent::new("inject.requested", "p1")).unwrap();

        assert!(matches!(result.outcome, DispatchOutcome::Blocked { .. }));
        assert!(delivered.lock().unwrap().is_empty());
        assert_eq!(violations.lock().unwrap()[0].payload["action"], json!("block"));
        assert_eq!(k.counters().dropped, 1);
    }

    #[test]
    fn test_overlay_skip_delivers_with_flag() {
        let mut k = kernel();
        let delivered = recorder(&mut k, "resize.started");
        let violations = recorder(&mut k, "contract.violation");

        k.register_contract(
            Contract::new("overlay-fit-exclusion")
                .applies_to("resize.started")
                .precondition("overlay-closed", |_, s| !s.overlay.open)
                .action(ContractAction::Skip),
        )
        .unwrap();

        k.update_state(SYSTEM_RECIPIENT, StatePatch::overlay_open(true));
        let result = k
            .emit(NewEvent::new("resize.started", SYSTEM_RECIPIENT))
            .unwrap();

        assert!(matches!(
            result.outcome,
            DispatchOutcome::Skipped { handlers: 1, .. }
        ));
        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].skipped, Some(true));
        assert_eq!(violations.lock().unwrap()[0].payload["action"], json!("skip"));
        // Skip does not count as dropped
        assert_eq!(k.counters().dropped, 0);
    }

    #[test]
    fn test_shadow_coexists_with_enforced() {
        let mut k = kernel();
        let delivered = recorder(&mut k, "resize.started");
        let shadow = recorder(&mut k, "contract.shadow.violation");
        let enforced = recorder(&mut k, "contract.violation");

        k.register_contract(
            Contract::new("overlay-fit-exclusion-shadow")
                .applies_to("resize.started")
                .precondition("overlay-closed", |_, s| !s.overlay.open)
                .mode(ContractMode::Shadow)
                .emit_on_violation("contract.shadow.violation"),
        )
        .unwrap();
        k.register_contract(
            Contract::new("overlay-fit-exclusion")
                .applies_to("resize.started")
                .precondition("overlay-closed", |_, s| !s.overlay.open)
                .action(ContractAction::Skip),
        )
        .unwrap();

        k.update_state(SYSTEM_RECIPIENT, StatePatch::overlay_open(true));
        k.emit(NewEvent::new("resize.started", SYSTEM_RECIPIENT))
            .unwrap();

        assert_eq!(shadow.lock().unwrap().len(), 1);
        assert_eq!(enforced.lock().unwrap().len(), 1);
        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].skipped, Some(true));
    }

    #[test]
    fn test_safe_mode_enters_once_and_exits_after_cooldown() {
        let mut k = kernel();
        let entered = recorder(&mut k, "safemode.entered");
        let exited = recorder(&mut k, "safemode.exited");

        k.register_contract(
            Contract::new("ownership-exclusive")
                .applies_to("inject.requested")
                .precondition("pane-idle", |_, s| s.activity == Activity::Idle)
                .action(ContractAction::Block),
        )
        .unwrap();
        k.update_state("p1", StatePatch::activity(Activity::Injecting));
        k.update_state("p2", StatePatch::activity(Activity::Recovering));

        for _ in 0..3 {
            k.emit(NewEvent::new("inject.requested", "p1")).unwrap();
            k.clock().advance(1_000);
        }
        assert!(k.safemode_active());
        assert_eq!(entered.lock().unwrap().len(), 1);
        assert!(k.get_state("p1").gates.safe_mode);
        assert!(k.get_state("p2").gates.safe_mode);

        // A fourth violation during cooldown does not rearm it
        k.emit(NewEvent::new("inject.requested", "p1")).unwrap();
        assert_eq!(entered.lock().unwrap().len(), 1);
        assert_eq!(k.counters().safemode_entries, 1);

        k.clock().advance(31_000);
        k.tick();
        assert!(!k.safemode_active());
        assert_eq!(exited.lock().unwrap().len(), 1);
        assert!(!k.get_state("p1").gates.safe_mode);
    }

    #[test]
    fn test_recheck_violations_do_not_feed_safemode_window() {
        let mut k = kernel();
        k.register_contract(
            Contract::new("focus-lock-guard")
                .applies_to("inject.requested")
                .precondition("focus-unlocked", |_, s| !s.gates.focus_locked)
                .action(ContractAction::Defer),
        )
        .unwrap();
        k.register_contract(
            Contract::new("compaction-guard")
                .applies_to("inject.requested")
                .precondition("not-compacting", |_, s| {
                    s.gates.compacting != super::state::Compacting::Confirmed
                })
                .action(ContractAction::Defer),
        )
        .unwrap();

        // Lock both gates, defer one event
        k.update_state("p1", StatePatch::focus_locked(true));
        k.update_state("p1", StatePatch::compacting(super::state::Compacting::Confirmed));
        k.emit(NewEvent::new("inject.requested", "p1")).unwrap();

        // Repeated drains re-violate compaction-guard but never count
        for _ in 0..5 {
            k.update_state("p1", StatePatch::focus_locked(true));
            k.update_state("p1", StatePatch::focus_locked(false));
        }
        assert!(!k.safemode_active());
        assert_eq!(k.deferred_len("p1"), 1);
    }

    #[test]
    fn test_ttl_expired_entry_is_dropped_on_drain() {
        let mut k = kernel();
        let delivered = recorder(&mut k, "inject.requested");
        let dropped = recorder(&mut k, "inject.dropped");

        k.register_contract(
            Contract::new("focus-lock-guard")
                .applies_to("inject.requested")
                .precondition("focus-unlocked", |_, s| !s.gates.focus_locked)
                .action(ContractAction::Defer),
        )
        .unwrap();
        k.update_state("p1", StatePatch::focus_locked(true));
        k.emit(NewEvent::new("inject.requested", "p1")).unwrap();

        k.clock().advance(30_001);
        k.update_state("p1", StatePatch::focus_locked(false));

        assert!(delivered.lock().unwrap().is_empty());
        let dropped = dropped.lock().unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].payload["reason"], json!("ttl_expired"));
        assert_eq!(k.counters().ttl_expired, 1);
        assert_eq!(k.deferred_len("p1"), 0);
    }

    #[test]
    fn test_state_changed_published_before_resume() {
        let mut k = kernel();
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        for pattern in ["pane.state.changed", "inject.resumed", "inject.requested"] {
            let sink = Arc::clone(&seen);
            k.subscribe(pattern, Box::new(move |e| {
                sink.lock().unwrap().push(e.clone());
                Ok(())
            }))
            .unwrap();
        }

        k.register_contract(
            Contract::new("focus-lock-guard")
                .applies_to("inject.requested")
                .precondition("focus-unlocked", |_, s| !s.gates.focus_locked)
                .action(ContractAction::Defer),
        )
        .unwrap();
        k.update_state("p1", StatePatch::focus_locked(true));
        k.emit(NewEvent::new("inject.requested", "p1")).unwrap();
        k.update_state("p1", StatePatch::focus_locked(false));

        let types: Vec<String> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type.clone())
            .collect();
        let changed_clear = types
            .iter()
            .rposition(|t| t == "pane.state.changed")
            .unwrap();
        let resumed = types.iter().position(|t| t == "inject.resumed").unwrap();
        assert!(changed_clear < resumed);
        assert_eq!(types.last().unwrap(), "inject.requested");
    }

    #[test]
    fn test_ingest_bypasses_contracts_and_advances_sequence() {
        let mut k = kernel();
        let delivered = recorder(&mut k, "inject.requested");
        let checked = recorder(&mut k, "contract.checked");

        // A contract that would block everything
        k.register_contract(
            Contract::new("deny-all")
                .applies_to("inject.requested")
                .precondition("never", |_, _| false)
                .action(ContractAction::Block),
        )
        .unwrap();

        let envelope = EventEnvelope {
            event_id: "ext-1".to_string(),
            correlation_id: "ext-corr".to_string(),
            causation_id: None,
            event_type: "inject.requested".to_string(),
            source: "bridge".to_string(),
            recipient_id: "p1".to_string(),
            timestamp: 5,
            sequence: 41,
            payload: Map::new(),
            skipped: None,
        };
        let result = k.ingest(envelope).unwrap();

        assert!(matches!(result.outcome, DispatchOutcome::Delivered { handlers: 1 }));
        assert_eq!(delivered.lock().unwrap()[0].event_id, "ext-1");
        assert!(checked.lock().unwrap().is_empty());

        // Subsequent local emission from the same source continues past it
        let local = k
            .emit(NewEvent::new("inject.requested", "p1").with_source("bridge"))
            .unwrap();
        let stored = k.query(&EventQuery::new().of_type("inject.requested").limit(1));
        assert_eq!(stored[0].event_id, local.event_id);
        assert_eq!(stored[0].sequence, 42);
    }

    #[test]
    fn test_redaction_reaches_subscribers_and_ring() {
        let mut k = kernel();
        let delivered = recorder(&mut k, "inject.requested");

        let mut payload = Map::new();
        payload.insert("body".to_string(), json!("top secret"));
        k.emit(NewEvent::new("inject.requested", "p1").with_payload(payload))
            .unwrap();

        let seen = delivered.lock().unwrap();
        assert_eq!(seen[0].payload["body"], json!({"redacted": true, "length": 10}));
        let stored = k.query(&EventQuery::new().of_type("inject.requested"));
        assert_eq!(stored[0].payload["body"], json!({"redacted": true, "length": 10}));
    }

    #[test]
    fn test_handler_fault_recorded_as_bus_error() {
        let mut k = kernel();
        k.subscribe("inject.requested", Box::new(|_| anyhow::bail!("sink broke")))
            .unwrap();
        let delivered = recorder(&mut k, "inject.requested");

        let result = k.emit(NewEvent::new("inject.requested", "p1")).unwrap();
        assert!(matches!(result.outcome, DispatchOutcome::Delivered { handlers: 2 }));
        assert_eq!(delivered.lock().unwrap().len(), 1);
        assert_eq!(k.counters().handler_faults, 1);

        let errors = k.query(&EventQuery::new().of_type("bus.error"));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload["error"], json!("sink broke"));
    }

    #[test]
    fn test_identical_state_write_emits_nothing() {
        let mut k = kernel();
        let changed = recorder(&mut k, "pane.state.changed");

        assert!(k.update_state("p1", StatePatch::focus_locked(true)));
        assert!(!k.update_state("p1", StatePatch::focus_locked(true)));
        assert_eq!(changed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_delivery_timeout_emits_event() {
        let mut k = kernel();
        let timeouts = recorder(&mut k, "delivery.timeout");

        k.start_delivery(
            "d1",
            "architect",
            3,
            "builder",
            vec!["builder".to_string()],
            "trigger",
            DeliveryMode::Routed,
        );
        k.clock().advance(65_000);
        let results = k.tick();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].outcome,
            crate::error::SendOutcome::RoutedUnverifiedTimeout
        );
        assert_eq!(timeouts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_incoming_emits_skip_event() {
        let mut k = kernel();
        let skips = recorder(&mut k, "delivery.skipped");

        k.delivery_mut().sequences_mut().commit("architect", "p1", 7);
        let disposition = k.observe_incoming_message("architect", "p1", 7, false);
        assert_eq!(disposition, IncomingDisposition::Duplicate);
        assert_eq!(skips.lock().unwrap().len(), 1);
        assert_eq!(k.delivery().metrics().skipped, 1);
    }

    #[test]
    fn test_promote_contract_emits_event() {
        let mut k = kernel();
        let promoted = recorder(&mut k, "contract.promoted");

        k.register_contract(
            Contract::new("shadow-guard")
                .applies_to("inject.requested")
                .precondition("never", |_, _| false)
                .mode(ContractMode::Shadow),
        )
        .unwrap();

        assert!(k.promote_contract("shadow-guard"));
        assert!(!k.promote_contract("shadow-guard"));
        assert_eq!(promoted.lock().unwrap().len(), 1);
        assert!(k.shadow_contract_ids().is_empty());
    }

    #[test]
    fn test_emit_validates_spec() {
        let mut k = kernel();
        assert!(k.emit(NewEvent::new("", "p1")).is_err());
        assert!(k.emit(NewEvent::new("inject.*", "p1")).is_err());
        assert!(k.emit(NewEvent::new("inject.requested", "")).is_err());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut k = kernel();
        recorder(&mut k, "inject.requested");
        k.register_contract(
            Contract::new("guard")
                .applies_to("inject.requested")
                .precondition("never", |_, _| false)
                .action(ContractAction::Defer),
        )
        .unwrap();
        k.update_state("p1", StatePatch::focus_locked(true));
        k.emit(NewEvent::new("inject.requested", "p1")).unwrap();

        k.reset();
        assert_eq!(k.ring_len(), 0);
        assert_eq!(k.deferred_len("p1"), 0);
        assert!(k.contract_ids().is_empty());
        assert!(k.known_recipients().is_empty());
        assert_eq!(k.counters(), KernelCounters::default());

        // Fresh emission works and redispatches to nobody
        let result = k.emit(NewEvent::new("inject.requested", "p1")).unwrap();
        assert!(matches!(result.outcome, DispatchOutcome::Delivered { handlers: 0 }));
    }
}
