//! Checkpoint extraction.
//!
//! A checkpoint freezes the current draft's tree under the caller's message,
//! anchors it with a keep-ref and opens a fresh draft on top of it. Keep-ref,
//! change-ref and anchor pushes are durability guarantees: any failure there
//! is fatal.

use anyhow::{Context, Result, bail};

use crate::change_id::{
    ChangeId, TRACE_BASE_TRAILER, TRACE_HEAD_TRAILER, ensure_change_id, ensure_trailer,
    extract_change_id,
};
use crate::config::TraceSettings;
use crate::draft;
use crate::engine::{Engine, PushMode, RefUpdate};
use crate::output;
use crate::refs;
use crate::sync::{self, Divergence, SyncOptions, SyncResult};
use crate::trace::{self, TraceOptions};
use crate::workspace::Workspace;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("checkpoint message is empty")]
    EmptyMessage,
    #[error("no lease recorded for {workspace_ref}; run 'jul ws checkout' before checkpointing")]
    LeaseMissing { workspace_ref: String },
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    pub message: String,
    /// Give the draft opened after the checkpoint a new Change-Id.
    pub start_new_change: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointResult {
    pub checkpoint_sha: String,
    pub change_id: ChangeId,
    pub keep_ref: String,
    pub change_ref: String,
    pub anchor_ref: String,
    /// Draft opened on top of the checkpoint.
    pub draft_sha: String,
    pub draft_change_id: ChangeId,
    pub trace_head: Option<String>,
    pub workspace_updated: bool,
    pub pushed: bool,
    /// The sync that preceded the checkpoint.
    pub sync: SyncResult,
    pub warnings: Vec<String>,
}

/// Sync, then turn the resulting draft into a checkpoint.
pub fn checkpoint<E: Engine>(
    engine: &E,
    workspace: &Workspace,
    traces: &TraceSettings,
    sync_opts: &SyncOptions,
    opts: &CheckpointOptions,
) -> Result<CheckpointResult> {
    let message = opts.message.trim();
    if message.is_empty() {
        return Err(CheckpointError::EmptyMessage.into());
    }

    let synced = sync::sync(engine, workspace, sync_opts)?;
    if let Some(Divergence::LeaseMissing { .. }) = synced.divergence {
        return Err(CheckpointError::LeaseMissing {
            workspace_ref: synced.workspace_ref,
        }
        .into());
    }
    let publish = synced.secret_block.is_none();
    let remote = synced.remote.clone().filter(|_| publish);
    let mut warnings = synced.warnings.clone();

    let draft = engine
        .commit_info(&synced.draft_sha)
        .with_context(|| format!("failed to read draft {}", synced.draft_sha))?;
    let change_id = extract_change_id(message).unwrap_or_else(|| synced.change_id.clone());

    let trace_opts = TraceOptions {
        force: true,
        update_canonical: true,
        ..TraceOptions::default()
    };
    let mut final_message = ensure_change_id(message, &change_id);
    let mut trace_head = None;
    match trace::record_trace(engine, workspace, traces, remote.as_deref(), &trace_opts) {
        Ok(traced) => {
            warnings.extend(traced.warnings);
            let head = traced.canonical_sha.unwrap_or(traced.trace_sha);
            final_message = ensure_trailer(&final_message, TRACE_HEAD_TRAILER, &head);
            if let Some(base) = &traced.trace_base {
                final_message = ensure_trailer(&final_message, TRACE_BASE_TRAILER, base);
            }
            trace_head = Some(head);
        }
        Err(err) => warnings.push(format!("failed to record checkpoint trace: {err:#}")),
    }

    let checkpoint_sha = engine
        .commit_tree(&draft.tree, &draft.parents, &final_message)
        .with_context(|| format!("failed to create checkpoint for change {change_id}"))?;

    let draft_change_id = if opts.start_new_change {
        ChangeId::generate()
    } else {
        change_id.clone()
    };
    let draft_sha = draft::create_draft_commit(
        engine,
        &draft.tree,
        Some(checkpoint_sha.as_str()),
        Some(&draft_change_id),
    )?;

    let keep_ref = workspace.keep_ref(&change_id, &checkpoint_sha);
    let change_ref = refs::change_ref(&change_id);
    let anchor_ref = refs::anchor_ref(&change_id);
    let mut updates = vec![
        RefUpdate::new(&keep_ref, &checkpoint_sha),
        RefUpdate::new(&change_ref, &checkpoint_sha),
        RefUpdate::new(&synced.sync_ref, &draft_sha),
    ];
    if !engine.ref_exists(&anchor_ref)? {
        updates.push(RefUpdate::new(&anchor_ref, &checkpoint_sha));
    }
    engine
        .update_refs(&updates)
        .with_context(|| format!("failed to record checkpoint {checkpoint_sha}"))?;
    output::detail(&format!("checkpoint {checkpoint_sha} kept at {keep_ref}"));

    // The shared ref follows only a draft the sync itself was allowed to publish.
    let advance_shared = synced.workspace_updated;
    let mut result = CheckpointResult {
        checkpoint_sha,
        change_id,
        keep_ref,
        change_ref,
        anchor_ref,
        draft_sha,
        draft_change_id,
        trace_head,
        workspace_updated: false,
        pushed: false,
        sync: synced,
        warnings,
    };

    match &remote {
        Some(remote) => {
            push_checkpoint(engine, workspace, remote, sync_opts.draft_push, &mut result)?;
            result.pushed = true;
            if advance_shared {
                publish_new_draft(engine, workspace, Some(remote.as_str()), &mut result)?;
            }
        }
        None if advance_shared => publish_new_draft(engine, workspace, None, &mut result)?,
        None => {}
    }
    Ok(result)
}

/// Move the shared ref from the synced draft to the post-checkpoint draft.
fn publish_new_draft<E: Engine>(
    engine: &E,
    workspace: &Workspace,
    remote: Option<&str>,
    result: &mut CheckpointResult,
) -> Result<()> {
    let expected = result.sync.draft_sha.clone();
    match sync::publish_shared(engine, workspace, remote, &result.draft_sha, Some(expected.as_str()))? {
        None => result.workspace_updated = true,
        Some(divergence) => result.warnings.push(divergence.to_string()),
    }
    Ok(())
}

fn push_checkpoint<E: Engine>(
    engine: &E,
    workspace: &Workspace,
    remote: &str,
    draft_push: bool,
    result: &mut CheckpointResult,
) -> Result<()> {
    let sync_ref = &result.sync.sync_ref;
    if draft_push
        && let Err(err) = engine.push_ref(remote, &result.draft_sha, sync_ref, &PushMode::Force)
    {
        result
            .warnings
            .push(format!("failed to push draft to {sync_ref}: {err:#}"));
    }

    push_keep_refs(engine, workspace, remote)?;

    let change_tip = engine.remote_tip(remote, &result.change_ref)?;
    if change_tip.as_deref() != Some(result.checkpoint_sha.as_str()) {
        let mode = PushMode::Lease {
            expected: change_tip,
        };
        engine
            .push_ref(remote, &result.checkpoint_sha, &result.change_ref, &mode)
            .with_context(|| format!("failed to push {} to {remote}", result.change_ref))?;
    }

    let Some(anchor) = engine.resolve_ref(&result.anchor_ref)? else {
        return Ok(());
    };
    match engine.remote_tip(remote, &result.anchor_ref)? {
        None => engine
            .push_ref(remote, &anchor, &result.anchor_ref, &PushMode::Lease { expected: None })
            .with_context(|| format!("failed to push {} to {remote}", result.anchor_ref))?,
        Some(remote_anchor) if remote_anchor != anchor => bail!(
            "anchor ref mismatch for change {}: remote has {remote_anchor}, local has {anchor}",
            result.change_id
        ),
        Some(_) => {}
    }
    Ok(())
}

/// Push every keep-ref of the workspace. Keep-refs are immutable, so
/// re-pushing older ones is a no-op on the remote.
pub(crate) fn push_keep_refs<E: Engine>(engine: &E, workspace: &Workspace, remote: &str) -> Result<()> {
    for name in engine.list_refs(&workspace.keep_prefix())? {
        let Some(sha) = engine.resolve_ref(&name)? else {
            continue;
        };
        engine
            .push_ref(remote, &sha, &name, &PushMode::Force)
            .with_context(|| format!("failed to push keep-ref {name} to {remote}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
