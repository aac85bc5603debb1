//! Contract engine: preconditions, actions, shadow vs enforced
//!
//! Contracts are pure rules over (event, state). The engine decides; the
//! kernel enforces and emits. Within one evaluation the first enforced
//! contract whose preconditions fail determines the outcome; shadow
//! contracts are always evaluated but never alter delivery.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::KernelError;

use super::dispatch::{type_matches, validate_pattern};
use super::envelope::EventEnvelope;
use super::state::PaneState;

/// Side-effect policy chosen when an enforced contract is violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractAction {
    Defer,
    Block,
    Drop,
    Skip,
    Continue,
}

impl ContractAction {
    /// Actions that withhold delivery entirely
    pub fn suppresses_delivery(&self) -> bool {
        matches!(self, Self::Block | Self::Drop)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractMode {
    Enforced,
    Shadow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn,
    Block,
}

/// One boolean predicate over (event, state), labelled for diagnostics
pub struct Precondition {
    pub label: String,
    check: Box<dyn Fn(&EventEnvelope, &PaneState) -> bool + Send>,
}

impl Precondition {
    pub fn new(
        label: impl Into<String>,
        check: impl Fn(&EventEnvelope, &PaneState) -> bool + Send + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            check: Box::new(check),
        }
    }

    pub fn holds(&self, event: &EventEnvelope, state: &PaneState) -> bool {
        (self.check)(event, state)
    }
}

impl std::fmt::Debug for Precondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Precondition")
            .field("label", &self.label)
            .finish()
    }
}

/// A named precondition bundle with a policy outcome on failure
#[derive(Debug)]
pub struct Contract {
    pub id: String,
    pub version: u32,
    pub owner: String,
    /// Type patterns this contract applies to (exact or suffix `.*`)
    pub applies_to: Vec<String>,
    /// Ordered predicates; the first failure decides
    pub preconditions: Vec<Precondition>,
    pub severity: Severity,
    pub action: ContractAction,
    pub fallback_action: ContractAction,
    pub mode: ContractMode,
    /// Event type published when a precondition fails
    pub emit_on_violation: String,
}

impl Contract {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            owner: "orchestrator".to_string(),
            applies_to: Vec::new(),
            preconditions: Vec::new(),
            severity: Severity::Warn,
            action: ContractAction::Continue,
            fallback_action: ContractAction::Continue,
            mode: ContractMode::Enforced,
            emit_on_violation: "contract.violation".to_string(),
        }
    }

    pub fn applies_to(mut self, pattern: impl Into<String>) -> Self {
        self.applies_to.push(pattern.into());
        self
    }

    pub fn precondition(
        mut self,
        label: impl Into<String>,
        check: impl Fn(&EventEnvelope, &PaneState) -> bool + Send + 'static,
    ) -> Self {
        self.preconditions.push(Precondition::new(label, check));
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn action(mut self, action: ContractAction) -> Self {
        self.action = action;
        self.fallback_action = action;
        self
    }

    pub fn fallback(mut self, action: ContractAction) -> Self {
        self.fallback_action = action;
        self
    }

    pub fn mode(mut self, mode: ContractMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn emit_on_violation(mut self, event_type: impl Into<String>) -> Self {
        self.emit_on_violation = event_type.into();
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn matches(&self, event_type: &str) -> bool {
        self.applies_to.iter().any(|p| type_matches(p, event_type))
    }

    fn validate(&self) -> Result<(), KernelError> {
        if self.applies_to.is_empty() {
            return Err(KernelError::Validation {
                message: format!("contract {:?} has no appliesTo patterns", self.id),
            });
        }
        for pattern in &self.applies_to {
            validate_pattern(pattern)?;
        }
        Ok(())
    }
}

/// A single precondition failure, ready for the kernel to publish
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationRecord {
    pub contract_id: String,
    pub mode: ContractMode,
    pub action: ContractAction,
    pub severity: Severity,
    pub emit_type: String,
    pub failed_precondition: String,
}

/// Ordered trace of one evaluation, replayed by the kernel as events
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Checked { contract_id: String },
    ShadowViolation(ViolationRecord),
    EnforcedViolation(ViolationRecord),
}

/// Outcome of evaluating one emission
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Events to publish, in the order the engine produced them
    pub trace: Vec<EngineEvent>,
    /// The first enforced violation, if any; decides the dispatch outcome
    pub enforced: Option<ViolationRecord>,
}

impl Evaluation {
    pub fn outcome(&self) -> ContractAction {
        self.enforced
            .as_ref()
            .map(|v| v.action)
            .unwrap_or(ContractAction::Continue)
    }
}

/// Registration-ordered contract list with violation counters
#[derive(Default)]
pub struct ContractEngine {
    contracts: Vec<Contract>,
    violations: HashMap<String, u64>,
    shadow_violations: HashMap<String, u64>,
}

impl ContractEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace (same id replaces in place, keeping its position)
    pub fn register(&mut self, contract: Contract) -> Result<(), KernelError> {
        contract.validate()?;
        match self.contracts.iter_mut().find(|c| c.id == contract.id) {
            Some(slot) => *slot = contract,
            None => self.contracts.push(contract),
        }
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.contracts.len();
        self.contracts.retain(|c| c.id != id);
        self.contracts.len() != before
    }

    pub fn get(&self, id: &str) -> Option<&Contract> {
        self.contracts.iter().find(|c| c.id == id)
    }

    pub fn contract_ids(&self) -> Vec<String> {
        self.contracts.iter().map(|c| c.id.clone()).collect()
    }

    pub fn shadow_ids(&self) -> Vec<String> {
        self.contracts
            .iter()
            .filter(|c| c.mode == ContractMode::Shadow)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Flip a shadow contract to enforced; true if a flip happened
    pub fn promote(&mut self, id: &str) -> bool {
        match self.contracts.iter_mut().find(|c| c.id == id) {
            Some(c) if c.mode == ContractMode::Shadow => {
                c.mode = ContractMode::Enforced;
                true
            }
            _ => false,
        }
    }

    pub fn violation_count(&self, id: &str) -> u64 {
        self.violations.get(id).copied().unwrap_or(0)
    }

    pub fn shadow_violation_count(&self, id: &str) -> u64 {
        self.shadow_violations.get(id).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    pub fn clear(&mut self) {
        self.contracts.clear();
        self.violations.clear();
        self.shadow_violations.clear();
    }

    /// Evaluate one emission against the registered contracts
    ///
    /// Iterates a snapshot of the list in registration order. Stops at the
    /// first enforced violation; shadow violations accumulate but never
    /// decide. Counters move only when `is_recheck` is false.
    pub fn evaluate(
        &mut self,
        event: &EventEnvelope,
        state: &PaneState,
        is_recheck: bool,
    ) -> Evaluation {
        let mut trace = Vec::new();
        let mut enforced = None;

        let ids: Vec<String> = self.contracts.iter().map(|c| c.id.clone()).collect();
        for id in ids {
            let Some(contract) = self.contracts.iter().find(|c| c.id == id) else {
                continue;
            };
            if !contract.matches(&event.event_type) {
                continue;
            }
            trace.push(EngineEvent::Checked {
                contract_id: contract.id.clone(),
            });

            let failed = contract
                .preconditions
                .iter()
                .find(|p| !p.holds(event, state));
            let Some(precondition) = failed else {
                continue;
            };

            let record = ViolationRecord {
                contract_id: contract.id.clone(),
                mode: contract.mode,
                action: contract.action,
                severity: contract.severity,
                emit_type: contract.emit_on_violation.clone(),
                failed_precondition: precondition.label.clone(),
            };

            match contract.mode {
                ContractMode::Shadow => {
                    if !is_recheck {
                        *self.shadow_violations.entry(id).or_insert(0) += 1;
                    }
                    trace.push(EngineEvent::ShadowViolation(record));
                }
                ContractMode::Enforced => {
                    if !is_recheck {
                        *self.violations.entry(id).or_insert(0) += 1;
                    }
                    trace.push(EngineEvent::EnforcedViolation(record.clone()));
                    enforced = Some(record);
                    break;
                }
            }
        }

        Evaluation { trace, enforced }
    }
}

/// Circuit breaker over bursts of enforced violations
///
/// Tracks a sliding window; recheck-driven violations never feed it (they
/// would cascade false positives during drains).
#[derive(Debug, Default)]
pub struct SafeModeState {
    window: VecDeque<u64>,
    pub active: bool,
    pub exit_at: Option<u64>,
}

impl SafeModeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an enforced violation; true when the threshold is crossed
    /// while safe mode is not already up (no rearm during cooldown).
    pub fn record_violation(&mut self, now_ms: u64, window_ms: u64, threshold: usize) -> bool {
        if self.active {
            return false;
        }
        self.window.push_back(now_ms);
        self.prune(now_ms, window_ms);
        self.window.len() >= threshold
    }

    pub fn enter(&mut self, now_ms: u64, cooldown_ms: u64) {
        self.active = true;
        self.exit_at = Some(now_ms + cooldown_ms);
        self.window.clear();
    }

    pub fn exit_due(&self, now_ms: u64) -> bool {
        self.active && self.exit_at.is_some_and(|at| now_ms >= at)
    }

    pub fn exit(&mut self) {
        self.active = false;
        self.exit_at = None;
        self.window.clear();
    }

    pub fn reset(&mut self) {
        self.exit();
    }

    fn prune(&mut self, now_ms: u64, window_ms: u64) {
        while self
            .window
            .front()
            .is_some_and(|&at| now_ms.saturating_sub(at) > window_ms)
        {
            self.window.pop_front();
        }
    }
}

/// The contracts the orchestrator ships with
///
/// Guard rails for message injection and pane resizing; registered by the
/// daemon at startup.
pub fn default_contracts() -> Vec<Contract> {
    vec![
        Contract::new("focus-lock-guard")
            .applies_to("inject.requested")
            .precondition("focus-unlocked", |_, state| !state.gates.focus_locked)
            .severity(Severity::Block)
            .action(ContractAction::Defer),
        Contract::new("compaction-guard")
            .applies_to("inject.requested")
            .precondition("not-compacting", |_, state| {
                state.gates.compacting != super::state::Compacting::Confirmed
            })
            .severity(Severity::Block)
            .action(ContractAction::Defer),
        Contract::new("safemode-guard")
            .applies_to("inject.requested")
            .applies_to("resize.requested")
            .precondition("safemode-off", |_, state| !state.gates.safe_mode)
            .severity(Severity::Block)
            .action(ContractAction::Defer),
        Contract::new("ownership-exclusive")
            .applies_to("inject.requested")
            .applies_to("resize.requested")
            .precondition("pane-idle", |_, state| {
                state.activity == super::state::Activity::Idle
            })
            .severity(Severity::Block)
            .action(ContractAction::Block),
        Contract::new("overlay-fit-exclusion")
            .applies_to("resize.started")
            .precondition("overlay-closed", |_, state| !state.overlay.open)
            .severity(Severity::Warn)
            .action(ContractAction::Skip),
    ]
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::super::state::{Activity, StatePatch};
    use super::*;

    fn envelope(event_type: &str) -> EventEnvelope {
        EventEnvelope {
            event_id: "e1".to_string(),
            correlation_id: "c1".to_string(),
            causation_id: None,
            event_type: event_type.to_string(),
            source: "test".to_string(),
            recipient_id: "p1".to_string(),
            timestamp: 0,
            sequence: 1,
            payload: Map::new(),
            skipped: None,
        }
    }

    fn locked_state() -> PaneState {
        let mut state = PaneState::default();
        StatePatch::focus_locked(true).apply(&mut state);
        state
    }

    #[test]
    fn test_first_enforced_violation_decides() {
        let mut engine = ContractEngine::new();
        engine
            .register(
                Contract::new("first")
                    .applies_to("inject.requested")
                    .precondition("always-fails", |_, _| false)
                    .action(ContractAction::Defer),
            )
            .unwrap();
        engine
            .register(
                Contract::new("second")
                    .applies_to("inject.requested")
                    .precondition("also-fails", |_, _| false)
                    .action(ContractAction::Block),
            )
            .unwrap();

        let eval = engine.evaluate(&envelope("inject.requested"), &PaneState::default(), false);
        assert_eq!(eval.outcome(), ContractAction::Defer);
        assert_eq!(eval.enforced.as_ref().unwrap().contract_id, "first");
        // Second contract never checked after the enforced stop
        assert_eq!(
            eval.trace
                .iter()
                .filter(|e| matches!(e, EngineEvent::Checked { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_shadow_never_alters_delivery() {
        let mut engine = ContractEngine::new();
        engine
            .register(
                Contract::new("shadow-guard")
                    .applies_to("inject.requested")
                    .precondition("always-fails", |_, _| false)
                    .mode(ContractMode::Shadow)
                    .action(ContractAction::Block)
                    .emit_on_violation("contract.shadow.violation"),
            )
            .unwrap();

        let eval = engine.evaluate(&envelope("inject.requested"), &PaneState::default(), false);
        assert_eq!(eval.outcome(), ContractAction::Continue);
        assert_eq!(
            eval.trace
                .iter()
                .filter(|e| matches!(e, EngineEvent::ShadowViolation(_)))
                .count(),
            1
        );
        assert_eq!(engine.shadow_violation_count("shadow-guard"), 1);
    }

    #[test]
    fn test_shadow_coexists_with_enforced() {
        let mut engine = ContractEngine::new();
        engine
            .register(
                Contract::new("overlay-fit-exclusion-shadow")
                    .applies_to("resize.started")
                    .precondition("overlay-closed", |_, state| !state.overlay.open)
                    .mode(ContractMode::Shadow)
                    .emit_on_violation("contract.shadow.violation"),
            )
            .unwrap();
        engine
            .register(
                Contract::new("overlay-fit-exclusion")
                    .applies_to("resize.started")
                    .precondition("overlay-closed", |_, state| !state.overlay.open)
                    .action(ContractAction::Skip),
            )
            .unwrap();

        let mut state = PaneState::default();
        StatePatch::overlay_open(true).apply(&mut state);

        let eval = engine.evaluate(&envelope("resize.started"), &state, false);
        assert_eq!(eval.outcome(), ContractAction::Skip);
        let shadows = eval
            .trace
            .iter()
            .filter(|e| matches!(e, EngineEvent::ShadowViolation(_)))
            .count();
        let enforced = eval
            .trace
            .iter()
            .filter(|e| matches!(e, EngineEvent::EnforcedViolation(_)))
            .count();
        assert_eq!((shadows, enforced), (1, 1));
    }

    #[test]
    fn test_recheck_skips_counters() {
        let mut engine = ContractEngine::new();
        engine
            .register(
                Contract::new("guard")
                    .applies_to("inject.requested")
                    .precondition("focus-unlocked", |_, s| !s.gates.focus_locked)
                    .action(ContractAction::Defer),
            )
            .unwrap();

        engine.evaluate(&envelope("inject.requested"), &locked_state(), true);
        assert_eq!(engine.violation_count("guard"), 0);

        engine.evaluate(&envelope("inject.requested"), &locked_state(), false);
        assert_eq!(engine.violation_count("guard"), 1);
    }

    #[test]
    fn test_reregistration_replaces_in_place() {
        let mut engine = ContractEngine::new();
        engine
            .register(Contract::new("guard").applies_to("a.b").action(ContractAction::Block))
            .unwrap();
        engine
            .register(Contract::new("other").applies_to("a.b"))
            .unwrap();
        engine
            .register(Contract::new("guard").applies_to("a.b").action(ContractAction::Skip))
            .unwrap();

        assert_eq!(engine.len(), 2);
        assert_eq!(engine.contract_ids(), vec!["guard", "other"]);
        assert_eq!(engine.get("guard").unwrap().action, ContractAction::Skip);
    }

    #[test]
    fn test_register_rejects_malformed() {
        let mut engine = ContractEngine::new();
        assert!(engine.register(Contract::new("no-patterns")).is_err());
        assert!(engine
            .register(Contract::new("bad-pattern").applies_to("a.*.b"))
            .is_err());
    }

    #[test]
    fn test_safe_mode_window() {
        let mut safemode = SafeModeState::new();
        assert!(!safemode.record_violation(1_000, 10_000, 3));
        assert!(!safemode.record_violation(2_000, 10_000, 3));
        assert!(safemode.record_violation(3_000, 10_000, 3));
        safemode.enter(3_000, 30_000);

        // Violations during cooldown never rearm
        assert!(!safemode.record_violation(4_000, 10_000, 3));
        assert!(!safemode.exit_due(32_999));
        assert!(safemode.exit_due(33_000));
        safemode.exit();
        assert!(!safemode.active);
    }

    #[test]
    fn test_safe_mode_window_slides() {
        let mut safemode = SafeModeState::new();
        assert!(!safemode.record_violation(0, 10_000, 3));
        assert!(!safemode.record_violation(1_000, 10_000, 3));
        // First entry is now out of the window
        assert!(!safemode.record_violation(12_000, 10_000, 3));
    }

    #[test]
    fn test_default_contracts_cover_inject_and_resize() {
        let contracts = default_contracts();
        assert!(contracts.iter().any(|c| c.id == "focus-lock-guard"));
        let overlay = contracts
            .iter()
            .find(|c| c.id == "overlay-fit-exclusion")
            .unwrap();
        assert_eq!(overlay.action, ContractAction::Skip);
        assert!(overlay.matches("resize.started"));

        let ownership = contracts
            .iter()
            .find(|c| c.id == "ownership-exclusive")
            .unwrap();
        let mut state = PaneState::default();
        state.activity = Activity::Injecting;
        assert!(!ownership.preconditions[0].holds(&envelope("inject.requested"), &state));
    }
}
