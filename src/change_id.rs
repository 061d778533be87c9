//! Change-Id identity and commit message contracts.
//!
//! Every commit this tool writes carries a fixed message shape that other
//! devices read straight out of the shared object store:
//!
//! - drafts: `[draft] WIP` plus an optional `Change-Id:` trailer
//! - traces: `[trace]`, `[trace] agent:<name>`, `[trace] merge`, `[trace] restack`
//! - checkpoints: caller text plus `Change-Id:` and optionally
//!   `Trace-Base:` / `Trace-Head:` trailers
//!
//! Byte-for-byte compatibility of these strings matters more than elegance.

use anyhow::{Result, bail};
use rand08::RngCore;
use sha1::{Digest, Sha1};
use std::fmt;

pub const CHANGE_ID_TRAILER: &str = "Change-Id";
pub const TRACE_BASE_TRAILER: &str = "Trace-Base";
pub const TRACE_HEAD_TRAILER: &str = "Trace-Head";

pub const DRAFT_MESSAGE: &str = "[draft] WIP";
const DRAFT_PREFIX: &str = "[draft]";
pub const TRACE_MESSAGE: &str = "[trace]";
pub const TRACE_MERGE_MESSAGE: &str = "[trace] merge";
pub const TRACE_RESTACK_MESSAGE: &str = "[trace] restack";

/// Number of hex characters following the leading `I`.
const CHANGE_ID_HEX_LEN: usize = 40;

// ---------------------------------------------------------------------------
// ChangeId
// ---------------------------------------------------------------------------

/// Stable logical-change label: `I` followed by 40 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeId(String);

impl ChangeId {
    /// Generate a fresh id from 20 random bytes.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 20];
        rand08::thread_rng().fill_bytes(&mut bytes);
        Self(format!("I{}", bytes_to_hex(&bytes)))
    }

    /// Derive the deterministic id used for commits that lack a trailer.
    ///
    /// The input is the commit's textual object id, not its raw bytes.
    pub fn fallback_for(commit_sha: &str) -> Self {
        let digest = Sha1::digest(commit_sha.trim().as_bytes());
        Self(format!("I{:x}", digest))
    }

    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if !is_valid(value) {
            bail!("invalid Change-Id {value:?}: expected I followed by 40 hex characters");
        }
        Ok(Self(format!("I{}", value[1..].to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_valid(value: &str) -> bool {
    let Some(hex) = value.strip_prefix('I') else {
        return false;
    };
    hex.len() == CHANGE_ID_HEX_LEN && hex.chars().all(|c| c.is_ascii_hexdigit())
}

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0F) as usize] as char);
    }
    out
}

// ---------------------------------------------------------------------------
// Trailers
// ---------------------------------------------------------------------------

/// Find the first `Change-Id` trailer in a commit message.
///
/// Matching is case-insensitive on the key and accepts both `Change-Id:` and
/// the older `Change-Id <value>` spelling. Malformed values are ignored.
pub fn extract_change_id(message: &str) -> Option<ChangeId> {
    for line in message.lines() {
        let trimmed = line.trim();
        let lower = trimmed.to_ascii_lowercase();
        for key in ["change-id:", "change-id "] {
            if lower.starts_with(key) {
                if let Ok(id) = ChangeId::parse(&trimmed[key.len()..]) {
                    return Some(id);
                }
            }
        }
    }
    None
}

/// Change-Id of a commit: its trailer, or the fallback derived from its sha.
pub fn change_id_of(commit_sha: &str, message: &str) -> ChangeId {
    extract_change_id(message).unwrap_or_else(|| ChangeId::fallback_for(commit_sha))
}

/// Return the value of the first `key:` trailer line, if any.
pub fn extract_trailer(message: &str, key: &str) -> Option<String> {
    let prefix = format!("{key}:");
    message.lines().find_map(|line| {
        line.trim()
            .strip_prefix(&prefix)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Drop every line that starts with `key:`.
pub fn strip_trailer(message: &str, key: &str) -> String {
    let prefix = format!("{key}:");
    let kept: Vec<&str> = message
        .lines()
        .filter(|line| !line.trim().starts_with(&prefix))
        .collect();
    kept.join("\n").trim_end().to_string()
}

/// Append `key: value` as a trailer paragraph.
pub fn add_trailer(message: &str, key: &str, value: &str) -> String {
    if key.trim().is_empty() || value.trim().is_empty() {
        return message.trim().to_string();
    }
    format!("{}\n\n{}: {}\n", message.trim(), key.trim(), value.trim())
}

/// Add `key: value` unless a `key:` trailer is already present.
pub fn ensure_trailer(message: &str, key: &str, value: &str) -> String {
    if extract_trailer(message, key).is_some() {
        return message.to_string();
    }
    add_trailer(message, key, value)
}

/// Add a `Change-Id` trailer unless the message already carries one.
pub fn ensure_change_id(message: &str, change_id: &ChangeId) -> String {
    if extract_change_id(message).is_some() {
        return message.to_string();
    }
    add_trailer(message, CHANGE_ID_TRAILER, change_id.as_str())
}

// ---------------------------------------------------------------------------
// Message contracts
// ---------------------------------------------------------------------------

pub fn draft_message(change_id: Option<&ChangeId>) -> String {
    match change_id {
        Some(id) => format!("{DRAFT_MESSAGE}\n\n{CHANGE_ID_TRAILER}: {id}\n"),
        None => DRAFT_MESSAGE.to_string(),
    }
}

pub fn is_draft_message(message: &str) -> bool {
    message.trim_start().starts_with(DRAFT_PREFIX)
}

pub fn trace_message(agent: Option<&str>) -> String {
    match agent.map(str::trim).filter(|a| !a.is_empty()) {
        Some(agent) => format!("{TRACE_MESSAGE} agent:{agent}"),
        None => TRACE_MESSAGE.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
