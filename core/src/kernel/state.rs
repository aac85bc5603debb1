//! Per-recipient state vectors
//!
//! One `PaneState` per recipient: activity, gates, connectivity, overlay.
//! Updates are partial merges at the shallow leaves; a structurally
//! identical write emits no change event. The kernel watches updates for
//! gate clears that should drain the recipient's deferred queue.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// What the pane is currently doing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    #[default]
    Idle,
    Injecting,
    Resizing,
    Recovering,
    Error,
}

/// Compaction suspicion level for a pane's conversation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compacting {
    #[default]
    None,
    Suspected,
    Confirmed,
    Cooldown,
}

/// Link liveness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    #[default]
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gates {
    pub focus_locked: bool,
    pub compacting: Compacting,
    pub safe_mode: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connectivity {
    pub bridge: LinkState,
    pub pty: LinkState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overlay {
    pub open: bool,
}

/// Full state vector for one recipient
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaneState {
    pub activity: Activity,
    pub gates: Gates,
    pub connectivity: Connectivity,
    pub overlay: Overlay,
}

/// Partial update: every leaf optional, merged one level deep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatePatch {
    pub activity: Option<Activity>,
    pub gates: Option<GatesPatch>,
    pub connectivity: Option<ConnectivityPatch>,
    pub overlay: Option<OverlayPatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatesPatch {
    pub focus_locked: Option<bool>,
    pub compacting: Option<Compacting>,
    pub safe_mode: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectivityPatch {
    pub bridge: Option<LinkState>,
    pub pty: Option<LinkState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayPatch {
    pub open: Option<bool>,
}

impl StatePatch {
    /// Merge this patch into a state vector, leaf by leaf
    pub fn apply(&self, state: &mut PaneState) {
        if let Some(activity) = self.activity {
            state.activity = activity;
        }
        if let Some(gates) = &self.gates {
            if let Some(focus_locked) = gates.focus_locked {
                state.gates.focus_locked = focus_locked;
            }
            if let Some(compacting) = gates.compacting {
                state.gates.compacting = compacting;
            }
            if let Some(safe_mode) = gates.safe_mode {
                state.gates.safe_mode = safe_mode;
            }
        }
        if let Some(connectivity) = &self.connectivity {
            if let Some(bridge) = connectivity.bridge {
                state.connectivity.bridge = bridge;
            }
            if let Some(pty) = connectivity.pty {
                state.connectivity.pty = pty;
            }
        }
        if let Some(overlay) = &self.overlay {
            if let Some(open) = overlay.open {
                state.overlay.open = open;
            }
        }
    }

    /// Convenience: patch that sets only `gates.focusLocked`
    pub fn focus_locked(locked: bool) -> Self {
        Self {
            gates: Some(GatesPatch {
                focus_locked: Some(locked),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Convenience: patch that sets only `gates.safeMode`
    pub fn safe_mode(on: bool) -> Self {
        Self {
            gates: Some(GatesPatch {
                safe_mode: Some(on),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Convenience: patch that sets only `activity`
    pub fn activity(activity: Activity) -> Self {
        Self {
            activity: Some(activity),
            ..Default::default()
        }
    }

    /// Convenience: patch that sets only `overlay.open`
    pub fn overlay_open(open: bool) -> Self {
        Self {
            overlay: Some(OverlayPatch { open: Some(open) }),
            ..Default::default()
        }
    }

    /// Convenience: patch that sets only `gates.compacting`
    pub fn compacting(level: Compacting) -> Self {
        Self {
            gates: Some(GatesPatch {
                compacting: Some(level),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Gate transitions that release deferred events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateClears {
    pub focus_unlocked: bool,
    pub compacting_cleared: bool,
    pub safe_mode_cleared: bool,
}

impl GateClears {
    /// Detect releasing transitions between two snapshots
    pub fn detect(before: &PaneState, after: &PaneState) -> Self {
        Self {
            focus_unlocked: before.gates.focus_locked && !after.gates.focus_locked,
            compacting_cleared: before.gates.compacting == Compacting::Confirmed
                && after.gates.compacting != Compacting::Confirmed,
            safe_mode_cleared: before.gates.safe_mode && !after.gates.safe_mode,
        }
    }

    pub fn any(&self) -> bool {
        self.focus_unlocked || self.compacting_cleared || self.safe_mode_cleared
    }
}

/// Owner of all pane state vectors
///
/// Missing recipients are lazily defaulted; external readers only ever see
/// copies.
#[derive(Debug, Default)]
pub struct StateRegistry {
    panes: HashMap<String, PaneState>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the recipient's state, defaulted if unknown
    pub fn get(&self, recipient_id: &str) -> PaneState {
        self.panes.get(recipient_id).copied().unwrap_or_default()
    }

    pub fn insert(&mut self, recipient_id: &str, state: PaneState) {
        self.panes.insert(recipient_id.to_string(), state);
    }

    /// Recipients that have been written to at least once
    pub fn known_recipients(&self) -> Vec<String> {
        let mut recipients: Vec<String> = self.panes.keys().cloned().collect();
        recipients.sort();
        recipients
    }

    pub fn len(&self) -> usize {
        self.panes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.panes.is_empty()
    }

    pub fn clear(&mut self) {
        self.panes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let state = PaneState::default();
        assert_eq!(state.activity, Activity::Idle);
        assert!(!state.gates.focus_locked);
        assert_eq!(state.gates.compacting, Compacting::None);
        assert!(!state.gates.safe_mode);
        assert_eq!(state.connectivity.bridge, LinkState::Up);
        assert!(!state.overlay.open);
    }

    #[test]
    fn test_patch_merges_shallow_leaves() {
        let mut state = PaneState::default();
        state.gates.focus_locked = true;

        // Patching compacting must not disturb the sibling leaf
        StatePatch::compacting(Compacting::Suspected).apply(&mut state);
        assert!(state.gates.focus_locked);
        assert_eq!(state.gates.compacting, Compacting::Suspected);
    }

    #[test]
    fn test_identical_patch_produces_equal_state() {
        let before = PaneState::default();
        let mut after = before;
        StatePatch::focus_locked(false).apply(&mut after);
        assert_eq!(before, after);
    }

    #[test]
    fn test_gate_clears() {
        let mut before = PaneState::default();
        before.gates.focus_locked = true;
        before.gates.compacting = Compacting::Confirmed;
        before.gates.safe_mode = true;

        let mut after = before;
        after.gates.focus_locked = false;
        let clears = GateClears::detect(&before, &after);
        assert!(clears.focus_unlocked);
        assert!(!clears.compacting_cleared);
        assert!(clears.any());

        let mut after = before;
        after.gates.compacting = Compacting::Cooldown;
        assert!(GateClears::detect(&before, &after).compacting_cleared);

        // Suspected -> Confirmed is not a clear
        let mut before2 = PaneState::default();
        before2.gates.compacting = Compacting::Suspected;
        let mut after2 = before2;
        after2.gates.compacting = Compacting::Confirmed;
        assert!(!GateClears::detect(&before2, &after2).any());
    }

    #[test]
    fn test_registry_lazily_defaults() {
        let registry = StateRegistry::new();
        assert_eq!(registry.get("never-seen"), PaneState::default());
        assert!(registry.known_recipients().is_empty());
    }

    #[test]
    fn test_state_serializes_camel_case() {
        let state = PaneState::default();
        let value = serde_json::to_value(state).unwrap();
        assert_eq!(value["gates"]["focusLocked"], serde_json::json!(false));
        assert_eq!(value["gates"]["compacting"], serde_json::json!("none"));
        assert_eq!(value["connectivity"]["bridge"], serde_json::json!("up"));
    }

    #[test]
    fn test_patch_deserializes_from_partial_json() {
        let patch: StatePatch =
            serde_json::from_str(r#"{"gates": {"focusLocked": true}}"#).unwrap();
        let mut state = PaneState::default();
        patch.apply(&mut state);
        assert!(state.gates.focus_locked);
        assert_eq!(state.activity, Activity::Idle);
    }
}
