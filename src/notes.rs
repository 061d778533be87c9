//! JSON payloads attached to commits through the engine's notes primitive.
//!
//! Two notes refs are used: trace metadata (`refs/notes/jul/traces`) and
//! checkpoint attestations (`refs/notes/jul/attestations/checkpoint`).
//! Payloads are bounded at [`MAX_NOTE_SIZE`] bytes.

use anyhow::{Context, Result};
use rand08::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::change_id::{bytes_to_hex, change_id_of};
use crate::engine::Engine;

pub const TRACES_NOTES_REF: &str = "refs/notes/jul/traces";
pub const ATTESTATIONS_NOTES_REF: &str = "refs/notes/jul/attestations/checkpoint";

/// Largest serialized payload accepted, in bytes.
pub const MAX_NOTE_SIZE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NoteError {
    #[error("note exceeds max size: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },
}

/// Current UTC time as RFC 3339.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::UNIX_EPOCH.to_string())
}

fn new_id() -> String {
    let mut bytes = [0u8; 16];
    rand08::thread_rng().fill_bytes(&mut bytes);
    bytes_to_hex(&bytes)
}

// ---------------------------------------------------------------------------
// Raw JSON notes
// ---------------------------------------------------------------------------

/// Serialize `payload` and attach it to `object`, replacing any previous note.
pub fn write_json<E: Engine, T: Serialize>(
    engine: &E,
    notes_ref: &str,
    object: &str,
    payload: &T,
) -> Result<()> {
    let data = serde_json::to_string(payload).context("failed to serialize note")?;
    if data.len() > MAX_NOTE_SIZE {
        return Err(NoteError::TooLarge {
            size: data.len(),
            limit: MAX_NOTE_SIZE,
        }
        .into());
    }
    engine
        .write_note(notes_ref, object, &data)
        .with_context(|| format!("failed to write note {notes_ref} on {object}"))
}

/// Read and parse the note on `object`; `Ok(None)` when absent or blank.
pub fn read_json<E: Engine, T: DeserializeOwned>(
    engine: &E,
    notes_ref: &str,
    object: &str,
) -> Result<Option<T>> {
    let Some(raw) = engine.read_note(notes_ref, object)? else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw.trim())
        .map(Some)
        .with_context(|| format!("failed to parse note {notes_ref} on {object}"))
}

// ---------------------------------------------------------------------------
// Trace notes
// ---------------------------------------------------------------------------

/// Metadata describing one trace commit.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceNote {
    pub trace_sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_full: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub created_at: String,
}

/// Write a trace note. If it is too large and carries the full prompt, the
/// prompt is dropped and the write retried once.
pub fn write_trace_note<E: Engine>(engine: &E, note: &TraceNote) -> Result<()> {
    match write_json(engine, TRACES_NOTES_REF, &note.trace_sha, note) {
        Err(err)
            if note.prompt_full.is_some()
                && matches!(err.downcast_ref::<NoteError>(), Some(NoteError::TooLarge { .. })) =>
        {
            let trimmed = TraceNote {
                prompt_full: None,
                ..note.clone()
            };
            write_json(engine, TRACES_NOTES_REF, &trimmed.trace_sha, &trimmed)
        }
        other => other,
    }
}

pub fn read_trace_note<E: Engine>(engine: &E, trace_sha: &str) -> Result<Option<TraceNote>> {
    read_json(engine, TRACES_NOTES_REF, trace_sha)
}

// ---------------------------------------------------------------------------
// Attestations
// ---------------------------------------------------------------------------

/// CI attestation of a checkpoint, or a pointer to the one it inherits.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Attestation {
    pub attestation_id: String,
    pub commit_sha: String,
    pub change_id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation_inherit_from: Option<String>,
    pub created_at: String,
}

impl Attestation {
    /// A fresh attestation with a recorded status.
    pub fn new(commit_sha: &str, change_id: &str, kind: &str, status: &str) -> Self {
        Self {
            attestation_id: new_id(),
            commit_sha: commit_sha.to_string(),
            change_id: change_id.to_string(),
            kind: Some(kind.to_string()),
            status: Some(status.to_string()),
            attestation_inherit_from: None,
            created_at: now_rfc3339(),
        }
    }

    pub fn has_status(&self) -> bool {
        self.status.as_deref().is_some_and(|s| !s.trim().is_empty())
    }

    pub fn inherit_from(&self) -> Option<&str> {
        self.attestation_inherit_from
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

pub fn read_attestation<E: Engine>(engine: &E, commit: &str) -> Result<Option<Attestation>> {
    read_json(engine, ATTESTATIONS_NOTES_REF, commit)
}

pub fn write_attestation<E: Engine>(engine: &E, attestation: &Attestation) -> Result<()> {
    write_json(
        engine,
        ATTESTATIONS_NOTES_REF,
        &attestation.commit_sha,
        attestation,
    )
}

/// The commit whose attestation `commit` carries: itself when it has a
/// status, the commit it inherits from when that one has a status.
pub fn attested_source<E: Engine>(engine: &E, commit: &str) -> Result<Option<String>> {
    let Some(attestation) = read_attestation(engine, commit)? else {
        return Ok(None);
    };
    if attestation.has_status() {
        return Ok(Some(commit.to_string()));
    }
    if let Some(from) = attestation.inherit_from()
        && read_attestation(engine, from)?.is_some_and(|a| a.has_status())
    {
        return Ok(Some(from.to_string()));
    }
    Ok(None)
}

/// Record that `commit` inherits the attestation of `inherit_from`.
///
/// Never replaces a record that already has a status or an inheritance.
/// Returns whether a record was written.
pub fn write_inheritance<E: Engine>(engine: &E, commit: &str, inherit_from: &str) -> Result<bool> {
    if let Some(existing) = read_attestation(engine, commit)?
        && (existing.has_status() || existing.inherit_from().is_some())
    {
        return Ok(false);
    }
    let info = engine.commit_info(commit)?;
    let attestation = Attestation {
        attestation_id: new_id(),
        commit_sha: commit.to_string(),
        change_id: change_id_of(commit, &info.message).to_string(),
        kind: None,
        status: None,
        attestation_inherit_from: Some(inherit_from.to_string()),
        created_at: now_rfc3339(),
    };
    write_attestation(engine, &attestation)?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;

    fn engine_with_commits() -> (MemoryEngine, String, String) {
        let engine = MemoryEngine::new();
        engine.write_file("a", "1");
        let first = engine.commit_all("first").unwrap();
        engine.write_file("a", "2");
        let second = engine.commit_all("second").unwrap();
        (engine, first, second)
    }

    #[test]
    fn test_json_roundtrip_and_missing() {
        let (engine, first, _) = engine_with_commits();
        let note = TraceNote {
            trace_sha: first.clone(),
            agent: Some("codex".to_string()),
            turn: Some(3),
            created_at: now_rfc3339(),
            ..TraceNote::default()
        };
        write_trace_note(&engine, &note).unwrap();
        assert_eq!(read_trace_note(&engine, &first).unwrap(), Some(note));
        assert_eq!(read_trace_note(&engine, "deadbeef").unwrap(), None);

        let raw = engine.read_note(TRACES_NOTES_REF, &first).unwrap().unwrap();
        assert!(!raw.contains("prompt_full"));
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let (engine, first, _) = engine_with_commits();
        let payload = "x".repeat(MAX_NOTE_SIZE + 1);
        let err = write_json(&engine, TRACES_NOTES_REF, &first, &payload).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NoteError>(),
            Some(NoteError::TooLarge { limit: MAX_NOTE_SIZE, .. })
        ));
    }

    #[test]
    fn test_trace_note_drops_full_prompt_once() {
        let (engine, first, _) = engine_with_commits();
        let note = TraceNote {
            trace_sha: first.clone(),
            prompt_summary: Some("summary".to_string()),
            prompt_full: Some("p".repeat(MAX_NOTE_SIZE)),
            created_at: now_rfc3339(),
            ..TraceNote::default()
        };
        write_trace_note(&engine, &note).unwrap();
        let stored = read_trace_note(&engine, &first).unwrap().unwrap();
        assert_eq!(stored.prompt_full, None);
        assert_eq!(stored.prompt_summary.as_deref(), Some("summary"));
    }

    #[test]
    fn test_trace_note_still_too_large_fails() {
        let (engine, first, _) = engine_with_commits();
        let note = TraceNote {
            trace_sha: first,
            prompt_summary: Some("s".repeat(MAX_NOTE_SIZE)),
            prompt_full: Some("p".to_string()),
            created_at: now_rfc3339(),
            ..TraceNote::default()
        };
        let err = write_trace_note(&engine, &note).unwrap_err();
        assert!(err.downcast_ref::<NoteError>().is_some());
    }

    #[test]
    fn test_attestation_type_field_name() {
        let att = Attestation::new("abc", "Ixyz", "ci", "pass");
        let json = serde_json::to_value(&att).unwrap();
        assert_eq!(json["type"], "ci");
        assert_eq!(json["status"], "pass");
        assert_eq!(att.attestation_id.len(), 32);
    }

    #[test]
    fn test_inheritance_never_overwrites() {
        let (engine, first, second) = engine_with_commits();
        write_attestation(&engine, &Attestation::new(&first, "I1", "ci", "pass")).unwrap();

        assert!(write_inheritance(&engine, &second, &first).unwrap());
        let stored = read_attestation(&engine, &second).unwrap().unwrap();
        assert_eq!(stored.inherit_from(), Some(first.as_str()));
        assert!(!stored.has_status());

        // A second inheritance does not replace the first, nor does one
        // aimed at an attested commit.
        assert!(!write_inheritance(&engine, &second, "other").unwrap());
        assert!(!write_inheritance(&engine, &first, &second).unwrap());
        assert_eq!(
            read_attestation(&engine, &first).unwrap().unwrap().status.as_deref(),
            Some("pass")
        );
    }

    #[test]
    fn test_attested_source_follows_one_inheritance_hop() {
        let (engine, first, second) = engine_with_commits();
        assert_eq!(attested_source(&engine, &first).unwrap(), None);

        write_attestation(&engine, &Attestation::new(&first, "I1", "ci", "pass")).unwrap();
        write_inheritance(&engine, &second, &first).unwrap();
        assert_eq!(attested_source(&engine, &first).unwrap(), Some(first.clone()));
        assert_eq!(attested_source(&engine, &second).unwrap(), Some(first));
    }
}
