//! Trigger file ingestion
//!
//! Atomic message files dropped into a watched directory become sequenced
//! messages with at-most-once semantics: resolve the filename, gate on the
//! orchestrator workflow state, claim via rename, decode, dedupe twice
//! (fallback id, then sequence), self-exclude on broadcasts, and dispatch
//! one `inject.requested` per recipient with the delivery id in tow.

pub mod decode;
pub mod roles;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map};

use crate::config::KernelConfig;
use crate::delivery::{create_delivery_id, DeliveryMode, IncomingDisposition};
use crate::error::{KernelError, Result, SendOutcome};
use crate::kernel::envelope::{NewEvent, SYSTEM_RECIPIENT};
use crate::kernel::EventKernel;

pub use decode::{decode_trigger_body, split_message_id, FallbackIdWindow, MESSAGE_ID_PREFIX};
pub use roles::{RoleTable, TargetSet};

/// Source tag stamped on envelopes minted by the ingestor
pub const TRIGGER_SOURCE: &str = "trigger";

/// Message type recorded against delivery metrics
pub const TRIGGER_MSG_TYPE: &str = "trigger";

/// How one trigger file was handled
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// Claimed, parsed, and dispatched to the kernel
    Dispatched {
        delivery_id: String,
        sender: String,
        sequence: u64,
        recipients: Vec<String>,
    },
    /// Refused before dispatch
    Rejected { outcome: SendOutcome },
    /// Every surviving recipient had already seen this sequence
    SkippedDuplicate { sender: String, sequence: u64 },
}

/// Turns trigger files into kernel emissions
pub struct TriggerIngestor {
    roles: RoleTable,
    fallback_ids: FallbackIdWindow,
    workflow_allow: Vec<String>,
    stale_processing_ms: u64,
}

impl TriggerIngestor {
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            roles: RoleTable::default(),
            fallback_ids: FallbackIdWindow::new(
                config.trigger_dedupe_ttl_ms,
                config.trigger_dedupe_cap,
            ),
            workflow_allow: vec![crate::kernel::DEFAULT_WORKFLOW_STATE.to_string()],
            stale_processing_ms: config.stale_processing_ms,
        }
    }

    pub fn with_roles(mut self, roles: RoleTable) -> Self {
        self.roles = roles;
        self
    }

    /// Orchestrator states in which worker-targeted triggers may pass
    pub fn set_workflow_allow(&mut self, states: Vec<String>) {
        self.workflow_allow = states;
    }

    pub fn roles(&self) -> &RoleTable {
        &self.roles
    }

    /// Run the full ingest pipeline for one `<name>.txt` drop
    pub fn ingest_file(
        &mut self,
        kernel: &mut EventKernel,
        path: &Path,
    ) -> Result<TriggerOutcome> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| KernelError::UnknownTarget {
                name: path.display().to_string(),
            })?
            .to_string();

        // 1. Resolve the filename before touching the filesystem
        let targets = self.roles.resolve_filename(&filename)?;
        if targets.recipients.is_empty() {
            return Ok(TriggerOutcome::Rejected {
                outcome: SendOutcome::WindowUnavailable,
            });
        }

        // 2. Workflow gate: worker-targeted triggers wait for an allowed state
        if targets.includes_worker
            && !self
                .workflow_allow
                .iter()
                .any(|s| s == kernel.workflow_state())
        {
            let mut payload = Map::new();
            payload.insert("file".to_string(), json!(filename));
            payload.insert("state".to_string(), json!(kernel.workflow_state()));
            payload.insert("reason".to_string(), json!("workflow_gate"));
            let _ = kernel.emit(
                NewEvent::new("trigger.blocked", SYSTEM_RECIPIENT)
                    .with_source(TRIGGER_SOURCE)
                    .with_payload(payload),
            );
            return Ok(TriggerOutcome::Rejected {
                outcome: SendOutcome::WorkflowGate,
            });
        }

        // 3. Claim the file; stale claims are broken by mtime
        let processing = claim_path(path);
        self.claim(path, &processing)?;

        // 4-9. Everything after the claim unlinks it, success or not
        let result = self.process_claimed(kernel, &processing, &targets);
        if let Err(err) = std::fs::remove_file(&processing) {
            crate::warn_log!("failed to unlink claim {}: {}", processing.display(), err);
        }
        result
    }

    fn claim(&self, path: &Path, processing: &Path) -> Result<()> {
        if processing.exists() {
            let age_ms = claim_age_ms(processing);
            if age_ms < self.stale_processing_ms {
                return Err(KernelError::ClaimConflict {
                    path: path.to_path_buf(),
                });
            }
            crate::warn_log!(
                "breaking stale claim {} (age {}ms)",
                processing.display(),
                age_ms
            );
            let _ = std::fs::remove_file(processing);
        }
        std::fs::rename(path, processing).map_err(|source| KernelError::RenameError {
            path: path.to_path_buf(),
            source,
        })
    }

    fn process_claimed(
        &mut self,
        kernel: &mut EventKernel,
        processing: &Path,
        targets: &TargetSet,
    ) -> Result<TriggerOutcome> {
        // 4. Read & decode
        let bytes = std::fs::read(processing).map_err(|source| KernelError::ReadError {
            path: processing.to_path_buf(),
            source,
        })?;
        let decoded = decode_trigger_body(&bytes);

        // 5. Fallback-id dedupe
        let (message_id, body) = split_message_id(&decoded);
        if let Some(id) = message_id {
            if !self.fallback_ids.check_and_insert(&id, kernel.now_ms()) {
                crate::debug_log!("duplicate trigger message id {}", id);
                return Ok(TriggerOutcome::Rejected {
                    outcome: SendOutcome::DuplicateMessageId,
                });
            }
        }

        // 6. Sequence parse & dedupe
        let Some(parsed) = crate::delivery::parse_wire(body) else {
            return Ok(TriggerOutcome::Rejected {
                outcome: SendOutcome::InvalidMessage,
            });
        };
        let mut fresh: Vec<String> = Vec::new();
        for recipient in &targets.recipients {
            let disposition = kernel.observe_incoming_message(
                &parsed.sender,
                recipient,
                parsed.sequence,
                parsed.session_reset,
            );
            if disposition == IncomingDisposition::Fresh {
                fresh.push(recipient.clone());
            }
        }
        if fresh.is_empty() {
            return Ok(TriggerOutcome::SkippedDuplicate {
                sender: parsed.sender,
                sequence: parsed.sequence,
            });
        }

        // 7. Self-exclusion on broadcasts
        let recipients: Vec<String> = if targets.broadcast {
            fresh
                .into_iter()
                .filter(|pane| {
                    pane != &parsed.sender
                        && self.roles.role_of_pane(pane) != Some(parsed.sender.as_str())
                })
                .collect()
        } else {
            fresh
        };
        if recipients.is_empty() {
            return Ok(TriggerOutcome::Rejected {
                outcome: SendOutcome::NoTargets,
            });
        }

        // 8. Mint the delivery, start tracking, fan out one envelope per
        //    recipient; the delivery id doubles as the correlation chain
        let delivery_id = create_delivery_id(&parsed.sender, parsed.sequence, &targets.name);
        let mode = if targets.broadcast {
            DeliveryMode::Broadcast
        } else {
            DeliveryMode::Routed
        };
        kernel.start_delivery(
            &delivery_id,
            &parsed.sender,
            parsed.sequence,
            &targets.name,
            recipients.clone(),
            TRIGGER_MSG_TYPE,
            mode,
        );
        for recipient in &recipients {
            let mut payload = Map::new();
            payload.insert("text".to_string(), json!(parsed.body));
            payload.insert("deliveryId".to_string(), json!(delivery_id));
            payload.insert("sender".to_string(), json!(parsed.sender));
            payload.insert("sequence".to_string(), json!(parsed.sequence));
            payload.insert("msgType".to_string(), json!(TRIGGER_MSG_TYPE));
            let mut spec = NewEvent::new("inject.requested", recipient)
                .with_source(TRIGGER_SOURCE)
                .with_payload(payload);
            spec.correlation_id = Some(delivery_id.clone());
            let _ = kernel.emit(spec)?;
        }

        Ok(TriggerOutcome::Dispatched {
            delivery_id,
            sender: parsed.sender,
            sequence: parsed.sequence,
            recipients,
        })
    }
}

/// `<name>.txt` -> `<name>.txt.processing`
fn claim_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".processing");
    PathBuf::from(name)
}

fn claim_age_ms(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map(|age| age.as_millis() as u64)
        .unwrap_or(u64::MAX)
}

/// Async polling loop feeding the ingestor and driving kernel timers
///
/// The kernel mutex is the single-writer exclusion: file ingest and timer
/// ticks contend for it exactly like synchronous emissions.
pub struct TriggerDaemon {
    kernel: Arc<Mutex<EventKernel>>,
    ingestor: Mutex<TriggerIngestor>,
    dir: PathBuf,
    poll_interval: Duration,
}

impl TriggerDaemon {
    pub fn new(kernel: Arc<Mutex<EventKernel>>, ingestor: TriggerIngestor, dir: PathBuf) -> Self {
        Self {
            kernel,
            ingestor: Mutex::new(ingestor),
            dir,
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Poll forever; cancelled by dropping the future (tokio::select)
    pub async fn start_loop(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.poll_once();
        }
    }

    /// One scan of the trigger directory plus a timer tick
    pub fn poll_once(&self) {
        let mut files: Vec<PathBuf> = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("txt"))
                .collect(),
            Err(err) => {
                crate::error_log!("trigger dir scan failed: {}", err);
                Vec::new()
            }
        };
        files.sort();

        let mut kernel = self.kernel.lock();
        let mut ingestor = self.ingestor.lock();
        for path in files {
            match ingestor.ingest_file(&mut kernel, &path) {
                Ok(outcome) => {
                    crate::info_log!("trigger {}: {:?}", path.display(), outcome);
                }
                Err(err) if err.is_retryable() => {
                    crate::debug_log!("trigger {} deferred: {}", path.display(), err);
                }
                Err(err) => {
                    crate::error_log!("trigger {} failed: {}", path.display(), err);
                }
            }
        }
        kernel.tick();
    }
}
