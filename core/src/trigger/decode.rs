//! Trigger file decoding
//!
//! Trigger bodies arrive from assorted shells and editors: tolerate UTF-16
//! LE and UTF-8 BOMs, strip NUL and C0 control bytes (keeping tab, newline,
//! CR), and peel the optional fallback-id header off the front.

use std::collections::{HashSet, VecDeque};

/// Header carrying a client-chosen dedupe key:
/// `[HM-MESSAGE-ID:<id>]\n` at the very start of the body
pub const MESSAGE_ID_PREFIX: &str = "[HM-MESSAGE-ID:";

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];
const UTF16_LE_BOM: [u8; 2] = [0xFF, 0xFE];

/// Decode raw trigger bytes into clean text
pub fn decode_trigger_body(bytes: &[u8]) -> String {
    let text = if bytes.starts_with(&UTF16_LE_BOM) {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        let stripped = bytes.strip_prefix(&UTF8_BOM[..]).unwrap_or(bytes);
        String::from_utf8_lossy(stripped).into_owned()
    };

    text.chars()
        .filter(|&c| c == '\t' || c == '\n' || c == '\r' || c >= ' ')
        .collect()
}

/// Split an optional `[HM-MESSAGE-ID:<id>]` header line off the body
///
/// Returns `(message_id, rest)`; the header never reaches the payload.
pub fn split_message_id(body: &str) -> (Option<String>, &str) {
    let Some(after_prefix) = body.strip_prefix(MESSAGE_ID_PREFIX) else {
        return (None, body);
    };
    let Some(close) = after_prefix.find(']') else {
        return (None, body);
    };
    let id = &after_prefix[..close];
    if id.is_empty() {
        return (None, body);
    }
    let mut rest = &after_prefix[close + 1..];
    rest = rest.strip_prefix('\n').unwrap_or(rest);
    (Some(id.to_string()), rest)
}

/// Time- and count-bounded bag of recently seen fallback ids
///
/// Rejects duplicate retries of file-drop triggers without unbounded
/// memory.
#[derive(Debug, Default)]
pub struct FallbackIdWindow {
    seen: VecDeque<(u64, String)>,
    index: HashSet<String>,
    ttl_ms: u64,
    cap: usize,
}

impl FallbackIdWindow {
    pub fn new(ttl_ms: u64, cap: usize) -> Self {
        Self {
            seen: VecDeque::new(),
            index: HashSet::new(),
            ttl_ms,
            cap,
        }
    }

    /// True when the id is fresh; records it either way it was unseen
    pub fn check_and_insert(&mut self, id: &str, now_ms: u64) -> bool {
        self.prune(now_ms);
        if self.index.contains(id) {
            return false;
        }
        self.seen.push_back((now_ms, id.to_string()));
        self.index.insert(id.to_string());
        self.prune(now_ms);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.index.clear();
    }

    fn prune(&mut self, now_ms: u64) {
        while self.seen.len() > self.cap
            || self
                .seen
                .front()
                .is_some_and(|(at, _)| now_ms.saturating_sub(*at) > self.ttl_ms)
        {
            if let Some((_, id)) = self.seen.pop_front() {
                self.index.remove(&id);
            } else {
                break;
            }
        }
    }
}
