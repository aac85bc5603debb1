//! Canonical role table and trigger filename resolution
//!
//! Trigger files are named after their targets: `architect.txt`,
//! `builder.txt`, `oracle.txt`, `workers.txt` (alias `implementers.txt`),
//! `all.txt`, `others-<role>.txt`. Unknown names are rejected.

use std::collections::BTreeMap;

use crate::error::KernelError;

/// The resolved target set for one trigger file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSet {
    /// Canonical name of the target group (`builder`, `all`, `others-oracle`)
    pub name: String,
    pub recipients: Vec<String>,
    /// Multi-role fan-out (`all`, `workers`, `others-*`)
    pub broadcast: bool,
    /// True when any recipient is a worker pane (workflow-gated)
    pub includes_worker: bool,
}

/// Role -> pane-id mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleTable {
    roles: BTreeMap<String, Vec<String>>,
    aliases: BTreeMap<String, String>,
    worker_role: String,
}

impl Default for RoleTable {
    fn default() -> Self {
        let mut roles = BTreeMap::new();
        roles.insert("architect".to_string(), vec!["architect".to_string()]);
        roles.insert("builder".to_string(), vec!["builder".to_string()]);
        roles.insert("oracle".to_string(), vec!["oracle".to_string()]);
        roles.insert(
            "workers".to_string(),
            vec!["worker-1".to_string(), "worker-2".to_string()],
        );

        let mut aliases = BTreeMap::new();
        aliases.insert("implementers".to_string(), "workers".to_string());

        Self {
            roles,
            aliases,
            worker_role: "workers".to_string(),
        }
    }
}

impl RoleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pane list for a role (used by daemon configuration)
    pub fn set_role(&mut self, role: impl Into<String>, panes: Vec<String>) {
        self.roles.insert(role.into(), panes);
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }

    pub fn panes_for(&self, role: &str) -> Option<&[String]> {
        self.roles.get(role).map(Vec::as_slice)
    }

    /// All panes across every role, deduplicated, stable order
    pub fn all_panes(&self) -> Vec<String> {
        let mut panes = Vec::new();
        for list in self.roles.values() {
            for pane in list {
                if !panes.contains(pane) {
                    panes.push(pane.clone());
                }
            }
        }
        panes
    }

    pub fn is_worker_pane(&self, pane: &str) -> bool {
        self.roles
            .get(&self.worker_role)
            .is_some_and(|panes| panes.iter().any(|p| p == pane))
    }

    /// Role that owns a pane, if any (used for self-exclusion)
    pub fn role_of_pane(&self, pane: &str) -> Option<&str> {
        self.roles
            .iter()
            .find(|(_, panes)| panes.iter().any(|p| p == pane))
            .map(|(role, _)| role.as_str())
    }

    /// Resolve a trigger filename to its target set
    ///
    /// Lowercases, strips `.txt`, applies aliases, expands `all` and
    /// `others-<role>`.
    pub fn resolve_filename(&self, filename: &str) -> Result<TargetSet, KernelError> {
        let lowered = filename.to_lowercase();
        let stem = lowered.strip_suffix(".txt").unwrap_or(&lowered);
        let stem = self.aliases.get(stem).map(String::as_str).unwrap_or(stem);

        if stem == "all" {
            let recipients = self.all_panes();
            return Ok(TargetSet {
                name: "all".to_string(),
                includes_worker: recipients.iter().any(|p| self.is_worker_pane(p)),
                broadcast: true,
                recipients,
            });
        }

        if let Some(excluded) = stem.strip_prefix("others-") {
            let excluded = self.aliases.get(excluded).map(String::as_str).unwrap_or(excluded);
            let excluded_panes = self.roles.get(excluded).cloned().unwrap_or_default();
            if !self.roles.contains_key(excluded) {
                return Err(KernelError::UnknownTarget {
                    name: filename.to_string(),
                });
            }
            let recipients: Vec<String> = self
                .all_panes()
                .into_iter()
                .filter(|p| !excluded_panes.contains(p))
                .collect();
            return Ok(TargetSet {
                name: format!("others-{}", excluded),
                includes_worker: recipients.iter().any(|p| self.is_worker_pane(p)),
                broadcast: true,
                recipients,
            });
        }

        match self.roles.get(stem) {
            Some(panes) => Ok(TargetSet {
                name: stem.to_string(),
                recipients: panes.clone(),
                broadcast: panes.len() > 1,
                includes_worker: panes.iter().any(|p| self.is_worker_pane(p)),
            }),
            None => Err(KernelError::UnknownTarget {
                name: filename.to_string(),
            }),
        }
    }
}
