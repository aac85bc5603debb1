//! Wire format and per-sender sequence bookkeeping
//!
//! Outbound messages read `"(ROLE #N): body"`. The parser tolerates a
//! single bridge envelope prefix which is stripped before extraction.
//! `lastSeen` advances only when the delivery tracker commits a fully
//! verified acknowledgement.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

/// Body marker that, together with `#1`, restarts a sender's sequence
pub const SESSION_RESET_MARKER: &str = "[SESSION-RESET]";

/// Bridge envelope prefix stripped before sequence extraction
pub const AGENT_MSG_PREFIX: &str = "[AGENT MSG - reply via hm-send.js] ";

lazy_static! {
    static ref WIRE_RE: Regex =
        Regex::new(r"(?s)^\(([A-Za-z][A-Za-z0-9_-]*) #(\d+)\):\s?(.*)$").expect("wire regex");
}

/// A successfully parsed wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    /// Sender role, lowercased
    pub sender: String,
    pub sequence: u64,
    pub body: String,
    /// True when `#1` carries the session-reset marker
    pub session_reset: bool,
}

/// Parse `"(ROLE #N): body"`, tolerating one bridge prefix
pub fn parse_wire(raw: &str) -> Option<ParsedMessage> {
    let stripped = raw.strip_prefix(AGENT_MSG_PREFIX).unwrap_or(raw);
    let captures = WIRE_RE.captures(stripped)?;
    let sender = captures[1].to_lowercase();
    let sequence: u64 = captures[2].parse().ok()?;
    let body = captures[3].to_string();
    let session_reset = sequence == 1 && body.contains(SESSION_RESET_MARKER);
    Some(ParsedMessage {
        sender,
        sequence,
        body,
        session_reset,
    })
}

/// Render the wire form of an outbound message
pub fn format_wire(sender: &str, sequence: u64, body: &str) -> String {
    format!("({} #{}): {}", sender.to_uppercase(), sequence, body)
}

/// Per-sender outbound counters and per-(sender, recipient) high-water marks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceBook {
    outbound: HashMap<String, u64>,
    /// sender -> recipient -> last fully-acknowledged sequence
    last_seen: HashMap<String, HashMap<String, u64>>,
}

impl SequenceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the next outbound sequence for a sender
    pub fn next_outbound(&mut self, sender: &str) -> u64 {
        let counter = self.outbound.entry(sender.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn outbound(&self, sender: &str) -> u64 {
        self.outbound.get(sender).copied().unwrap_or(0)
    }

    pub fn last_seen(&self, sender: &str, recipient: &str) -> u64 {
        self.last_seen
            .get(sender)
            .and_then(|m| m.get(recipient))
            .copied()
            .unwrap_or(0)
    }

    /// Monotonic commit: never regresses
    pub fn commit(&mut self, sender: &str, recipient: &str, sequence: u64) {
        let slot = self
            .last_seen
            .entry(sender.to_string())
            .or_default()
            .entry(recipient.to_string())
            .or_insert(0);
        *slot = (*slot).max(sequence);
    }

    /// Session restart: the sender starts a fresh sequence toward a recipient
    pub fn reset_last_seen(&mut self, sender: &str, recipient: &str) {
        self.last_seen
            .entry(sender.to_string())
            .or_default()
            .insert(recipient.to_string(), 0);
    }

    pub fn is_duplicate(&self, sender: &str, recipient: &str, sequence: u64) -> bool {
        sequence <= self.last_seen(sender, recipient)
    }

    pub fn clear(&mut self) {
        self.outbound.clear();
        self.last_seen.clear();
    }

    /// Role-major view for `message-state.json`
    pub fn snapshot(&self, now_ms: u64) -> MessageStateFile {
        let mut sequences: BTreeMap<String, RoleSequences> = BTreeMap::new();
        for (sender, counter) in &self.outbound {
            sequences.entry(sender.clone()).or_default().outbound = *counter;
        }
        for (sender, recipients) in &self.last_seen {
            for (recipient, seq) in recipients {
                sequences
                    .entry(recipient.clone())
                    .or_default()
                    .last_seen
                    .insert(sender.clone(), *seq);
            }
        }
        MessageStateFile {
            version: MESSAGE_STATE_VERSION,
            sequences,
            last_updated: now_ms,
        }
    }

    /// Rebuild from the role-major disk view
    pub fn hydrate(&mut self, file: &MessageStateFile) {
        self.clear();
        for (role, entry) in &file.sequences {
            if entry.outbound > 0 {
                self.outbound.insert(role.clone(), entry.outbound);
            }
            for (sender, seq) in &entry.last_seen {
                self.last_seen
                    .entry(sender.clone())
                    .or_default()
                    .insert(role.clone(), *seq);
            }
        }
    }
}

pub const MESSAGE_STATE_VERSION: u32 = 1;

/// On-disk shape: `{version, sequences: {role: {outbound, lastSeen}}, lastUpdated}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStateFile {
    pub version: u32,
    pub sequences: BTreeMap<String, RoleSequences>,
    pub last_updated: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoleSequences {
    pub outbound: u64,
    pub last_seen: BTreeMap<String, u64>,
}

/// Atomic JSON store for the message state
#[derive(Debug, Clone)]
pub struct MessageStore {
    path: PathBuf,
}

impl MessageStore {
    /// Default location under the hivemind data directory
    pub fn new() -> Result<Self> {
        let dir = dirs::data_dir()
            .ok_or_else(|| KernelError::Validation {
                message: "could not find data directory".to_string(),
            })?
            .join("hivemind");
        Ok(Self::new_in(dir))
    }

    pub fn new_in(dir: PathBuf) -> Self {
        Self {
            path: dir.join("message-state.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or empty file yields the default state
    pub fn load(&self) -> Result<MessageStateFile> {
        if !self.path.exists() {
            return Ok(MessageStateFile::default());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|source| {
            KernelError::ReadError {
                path: self.path.clone(),
                source,
            }
        })?;
        if content.trim().is_empty() {
            return Ok(MessageStateFile::default());
        }
        serde_json::from_str(&content).map_err(|_| KernelError::StoreCorrupted {
            path: self.path.clone(),
        })
    }

    /// Write to a temp file, then rename
    pub fn save(&self, file: &MessageStateFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(file)?;
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).map_err(|source| KernelError::PersistFailed {
            path: temp_path.clone(),
            source,
        })?;
        std::fs::rename(&temp_path, &self.path).map_err(|source| KernelError::PersistFailed {
            path: self.path.clone(),
            source,
        })
    }
}
