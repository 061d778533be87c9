//! Trace lineage.
//!
//! Each device appends trace commits to its own `trace-sync` ref. The
//! workspace's canonical `traces` ref must end up a descendant of every device
//! tip it has seen: a fast-forward when one side contains the other, otherwise
//! an explicit `[trace] merge` commit over both tips whose tree is the current
//! working tree.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::change_id::{TRACE_MERGE_MESSAGE, TRACE_RESTACK_MESSAGE, trace_message};
use crate::config::TraceSettings;
use crate::engine::{Engine, PushMode};
use crate::notes::{self, TRACES_NOTES_REF, TraceNote};
use crate::output;
use crate::secrets;
use crate::workspace::Workspace;

/// Agent name recorded on traces this tool writes itself.
pub const RESTACK_AGENT: &str = "jul";
const RESTACK_TRACE_TYPE: &str = "restack";

#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    pub prompt: Option<String>,
    pub agent: Option<String>,
    pub session_id: Option<String>,
    pub turn: Option<u32>,
    /// Record an entry even when the tree did not change.
    pub force: bool,
    /// Fold the new tip into the canonical lineage.
    pub update_canonical: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceResult {
    /// The new trace commit, or the reused parent when skipped.
    pub trace_sha: String,
    pub trace_ref: String,
    pub trace_sync_ref: String,
    pub canonical_sha: Option<String>,
    /// Previous device tip the new trace builds on.
    pub trace_base: Option<String>,
    pub prompt_hash: Option<String>,
    pub remote: Option<String>,
    pub remote_pushed: bool,
    pub merged: bool,
    pub skipped: bool,
    pub warnings: Vec<String>,
}

/// `sha256:<hex>` of a prompt.
pub fn prompt_hash(prompt: &str) -> String {
    format!("sha256:{:x}", Sha256::digest(prompt.as_bytes()))
}

/// Record a trace of the current working tree.
pub fn record_trace<E: Engine>(
    engine: &E,
    workspace: &Workspace,
    settings: &TraceSettings,
    remote: Option<&str>,
    opts: &TraceOptions,
) -> Result<TraceResult> {
    let trace_ref = workspace.trace_ref();
    let trace_sync_ref = workspace.trace_sync_ref();

    let mut remote_tip = None;
    if opts.update_canonical
        && let Some(remote) = remote
    {
        remote_tip = engine
            .fetch_ref(remote, &trace_ref)
            .with_context(|| format!("failed to fetch {trace_ref} from {remote}"))?;
    }

    let tree = engine.snapshot_tree()?;
    let parent = match engine.resolve_ref(&trace_sync_ref)? {
        Some(sha) => Some(sha),
        None => engine.resolve_ref(&trace_ref)?,
    };

    let mut result = TraceResult {
        trace_sha: String::new(),
        trace_ref: trace_ref.clone(),
        trace_sync_ref: trace_sync_ref.clone(),
        canonical_sha: None,
        trace_base: parent.clone(),
        prompt_hash: None,
        remote: remote.map(str::to_string),
        remote_pushed: false,
        merged: false,
        skipped: false,
        warnings: Vec::new(),
    };

    if !opts.force
        && let Some(parent) = &parent
        && engine.commit_info(parent)?.tree == tree
    {
        if !engine.ref_exists(&trace_sync_ref)? {
            engine.update_ref(&trace_sync_ref, parent)?;
        }
        output::detail(&format!("trace unchanged at {parent}"));
        result.trace_sha = parent.clone();
        result.canonical_sha = Some(parent.clone());
        result.skipped = true;
        return Ok(result);
    }

    let parents: Vec<String> = parent.iter().cloned().collect();
    let trace_sha = engine
        .commit_tree(&tree, &parents, &trace_message(opts.agent.as_deref()))
        .context("failed to create trace commit")?;
    engine.update_ref(&trace_sync_ref, &trace_sha)?;
    result.trace_sha = trace_sha.clone();

    let prompt = opts
        .prompt
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty());
    result.prompt_hash = prompt.map(prompt_hash);
    let mut note = TraceNote {
        trace_sha: trace_sha.clone(),
        agent: non_blank(opts.agent.as_deref()),
        session_id: non_blank(opts.session_id.as_deref()),
        turn: opts.turn,
        device: Some(workspace.device.clone()),
        created_at: notes::now_rfc3339(),
        ..TraceNote::default()
    };
    if let Some(prompt) = prompt {
        if settings.prompt_hash {
            note.prompt_hash = result.prompt_hash.clone();
        }
        if settings.prompt_summary {
            note.prompt_summary = Some(secrets::summarize_prompt(prompt)).filter(|s| !s.is_empty());
        }
        if settings.prompt_full {
            note.prompt_full = Some(prompt.to_string());
        }
    }
    notes::write_trace_note(engine, &note)?;

    let canonical = if opts.update_canonical {
        let existing = match &remote_tip {
            Some(tip) => Some(tip.clone()),
            None => engine.resolve_ref(&trace_ref)?,
        };
        let (canonical, merged) = canonicalize(engine, existing.as_deref(), &trace_sha, &tree)?;
        engine.update_ref(&trace_ref, &canonical)?;
        result.merged = merged;
        Some(canonical)
    } else {
        engine.resolve_ref(&trace_ref)?
    };
    result.canonical_sha = canonical.clone();

    if let Some(remote) = remote {
        engine
            .push_ref(remote, &trace_sha, &trace_sync_ref, &PushMode::Force)
            .with_context(|| format!("failed to push {trace_sync_ref}"))?;
        result.remote_pushed = true;
        if let Err(err) = engine.push_notes(remote, TRACES_NOTES_REF) {
            result
                .warnings
                .push(format!("failed to push trace notes: {err:#}"));
        }
        if opts.update_canonical
            && let Some(canonical) = &canonical
            && remote_tip.as_ref() != Some(canonical)
        {
            let mode = PushMode::Lease {
                expected: remote_tip.clone(),
            };
            engine
                .push_ref(remote, canonical, &trace_ref, &mode)
                .with_context(|| format!("failed to push {trace_ref}"))?;
        }
    }

    Ok(result)
}

/// Decide the canonical tip after `new` joins a lineage whose tip is `existing`.
///
/// Returns the canonical sha and whether a merge commit was created.
pub fn canonicalize<E: Engine>(
    engine: &E,
    existing: Option<&str>,
    new: &str,
    tree: &str,
) -> Result<(String, bool)> {
    let Some(existing) = existing.filter(|e| *e != new) else {
        return Ok((new.to_string(), false));
    };
    if engine.is_ancestor(existing, new)? {
        return Ok((new.to_string(), false));
    }
    if engine.is_ancestor(new, existing)? {
        return Ok((existing.to_string(), false));
    }
    let parents = [existing.to_string(), new.to_string()];
    let merge = engine
        .commit_tree(tree, &parents, TRACE_MERGE_MESSAGE)
        .with_context(|| format!("failed to merge trace {new} into {existing}"))?;
    output::detail(&format!("trace fork merged as {merge}"));
    Ok((merge, true))
}

/// Trace commit recording one replayed checkpoint during restack.
pub fn record_restack_trace<E: Engine>(
    engine: &E,
    tree: &str,
    parents: &[String],
    device: &str,
) -> Result<String> {
    let sha = engine
        .commit_tree(tree, parents, TRACE_RESTACK_MESSAGE)
        .context("failed to create restack trace")?;
    let note = TraceNote {
        trace_sha: sha.clone(),
        trace_type: Some(RESTACK_TRACE_TYPE.to_string()),
        agent: Some(RESTACK_AGENT.to_string()),
        device: Some(device.to_string()),
        created_at: notes::now_rfc3339(),
        ..TraceNote::default()
    };
    notes::write_trace_note(engine, &note)?;
    Ok(sha)
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
