//! Restack engine.
//!
//! Rewrites a change's whole checkpoint chain onto a new base inside the
//! workspace's isolated checkout. The refs a user follows (sync, shared,
//! change) only move after every checkpoint replayed cleanly; keep-refs of
//! already rewritten checkpoints may be left behind by a failed run. The
//! shared ref and the lease move last, after the remote accepted the new draft.

use anyhow::{Context, Result, bail};
use std::collections::HashSet;

use crate::change_id::{
    ChangeId, TRACE_BASE_TRAILER, TRACE_HEAD_TRAILER, add_trailer, change_id_of,
    extract_change_id, extract_trailer, strip_trailer,
};
use crate::checkpoint::push_keep_refs;
use crate::draft;
use crate::engine::{Checkout, Engine, MergeInProgress, PickOutcome, PushMode, RefUpdate};
use crate::notes::{self, ATTESTATIONS_NOTES_REF, TRACES_NOTES_REF};
use crate::output;
use crate::refs;
use crate::remote;
use crate::sync::{self, Divergence};
use crate::trace;
use crate::workspace::{Workspace, WorkspaceConfig};

const BRANCH_PREFIX: &str = "refs/heads/";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RestackError {
    #[error("restack conflict in checkpoint {checkpoint}: {}", .paths.join(", "))]
    Conflict {
        checkpoint: String,
        paths: Vec<String>,
    },
    #[error("merge in progress in isolated checkout {path}; resolve it or rerun with --resume")]
    MergeInProgress { path: String },
    #[error("no draft at {sync_ref}; run 'jul sync' first")]
    NoDraft { sync_ref: String },
    #[error("no checkpoint found for change {change_id}; run 'jul checkpoint' first")]
    NoCheckpoint { change_id: String },
    #[error("working tree has changes since checkpoint {checkpoint}; checkpoint them before restacking")]
    UncheckpointedChanges { checkpoint: String },
    #[error("{0}")]
    Diverged(Divergence),
}

#[derive(Debug, Clone, Default)]
pub struct RestackOptions {
    /// Branch, tag or commit to rebuild the change on.
    pub base_ref: String,
    /// Continue in an isolated checkout that is mid-merge.
    pub allow_resume: bool,
    /// Configured remote name; `None` selects by precedence.
    pub remote: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestackResult {
    pub change_id: ChangeId,
    pub base_ref: String,
    pub base_sha: String,
    /// Rewritten checkpoints, oldest first.
    pub checkpoints: Vec<String>,
    pub draft_sha: String,
    pub trace_head: Option<String>,
    pub remote: Option<String>,
    pub pushed: bool,
    pub warnings: Vec<String>,
}

impl RestackResult {
    /// The last rewritten checkpoint, which the new draft sits on.
    pub fn new_parent(&self) -> Option<&str> {
        self.checkpoints.last().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Chain discovery
// ---------------------------------------------------------------------------

/// The newest checkpoint kept for `change_id` in this workspace.
///
/// Newest means greatest commit time; equal times go to the greatest sha.
pub fn latest_checkpoint<E: Engine>(
    engine: &E,
    workspace: &Workspace,
    change_id: &ChangeId,
) -> Result<Option<String>> {
    let prefix = workspace.keep_prefix();
    let mut best: Option<(i64, String)> = None;
    for name in engine.list_refs(&prefix)? {
        let Some(keep) = refs::parse_keep_ref(&prefix, &name) else {
            continue;
        };
        if keep.change_id != change_id.as_str() {
            continue;
        }
        let Some(sha) = engine.resolve_ref(&name)? else {
            continue;
        };
        let candidate = (engine.commit_info(&sha)?.committed_at, sha);
        if best.as_ref().is_none_or(|current| candidate > *current) {
            best = Some(candidate);
        }
    }
    Ok(best.map(|(_, sha)| sha))
}

/// Checkpoints of `change_id` ending at `latest`, oldest first.
pub fn checkpoint_chain<E: Engine>(
    engine: &E,
    latest: &str,
    change_id: &ChangeId,
) -> Result<Vec<String>> {
    let mut chain = vec![latest.to_string()];
    let mut seen: HashSet<String> = chain.iter().cloned().collect();
    let mut current = engine.commit_info(latest)?;
    while let Some(parent) = current.first_parent().map(str::to_string) {
        let info = engine.commit_info(&parent)?;
        if extract_change_id(&info.message).as_ref() != Some(change_id) || !seen.insert(parent.clone())
        {
            break;
        }
        chain.push(parent);
        current = info;
    }
    chain.reverse();
    Ok(chain)
}

// ---------------------------------------------------------------------------
// Restack
// ---------------------------------------------------------------------------

/// Rebuild the current change onto `opts.base_ref`.
pub fn restack<E: Engine>(engine: &E, workspace: &Workspace, opts: &RestackOptions) -> Result<RestackResult> {
    let sync_ref = workspace.sync_ref();
    let workspace_ref = workspace.workspace_ref();

    let Some(draft_sha) = engine.resolve_ref(&sync_ref)? else {
        return Err(RestackError::NoDraft { sync_ref }.into());
    };
    let draft = engine.commit_info(&draft_sha)?;
    let change_id = change_id_of(&draft_sha, &draft.message);

    let Some(latest) = latest_checkpoint(engine, workspace, &change_id)? else {
        return Err(RestackError::NoCheckpoint {
            change_id: change_id.to_string(),
        }
        .into());
    };
    if engine.snapshot_tree()? != engine.commit_info(&latest)?.tree {
        return Err(RestackError::UncheckpointedChanges { checkpoint: latest }.into());
    }

    let remote = remote::select(engine, opts.remote.as_deref())?.ok();
    let shared_tip = match &remote {
        Some(remote) => engine
            .fetch_ref(remote, &workspace_ref)
            .with_context(|| format!("failed to fetch {workspace_ref} from {remote}"))?,
        None => engine.resolve_ref(&workspace_ref)?,
    };
    if let Some(divergence) = sync::check_lease(workspace.read_lease()?.as_deref(), shared_tip.as_deref()) {
        return Err(RestackError::Diverged(divergence).into());
    }

    let chain = checkpoint_chain(engine, &latest, &change_id)?;
    let (base_ref, base_sha) = resolve_base(engine, &opts.base_ref)?;
    output::detail(&format!(
        "restacking {} checkpoint(s) of {change_id} onto {base_ref} ({base_sha})",
        chain.len()
    ));

    let mut checkout = engine
        .isolated_checkout(workspace.checkout_key(), &base_sha, opts.allow_resume)
        .map_err(|err| match err.downcast::<MergeInProgress>() {
            Ok(mid_merge) => RestackError::MergeInProgress {
                path: mid_merge.path,
            }
            .into(),
            Err(err) => err,
        })?;

    let mut warnings = Vec::new();
    let mut prev_trace: Option<String> = None;
    let mut last_attested: Option<String> = None;
    let mut rewritten = Vec::with_capacity(chain.len());
    for (idx, old) in chain.iter().enumerate() {
        if let Some(source) = notes::attested_source(engine, old)? {
            last_attested = Some(source);
        }

        match checkout.cherry_pick(old)? {
            PickOutcome::Applied => {}
            PickOutcome::Empty => output::detail(&format!("checkpoint {old} is already applied")),
            PickOutcome::Conflict(paths) => {
                return Err(RestackError::Conflict {
                    checkpoint: old.clone(),
                    paths,
                }
                .into());
            }
        }
        let tree = checkout.write_tree()?;

        let old_message = engine.commit_info(old)?.message;
        let old_head = extract_trailer(&old_message, TRACE_HEAD_TRAILER);
        if idx == 0 && prev_trace.is_none() {
            prev_trace = extract_trailer(&old_message, TRACE_BASE_TRAILER);
        }
        let mut trace_parents: Vec<String> = prev_trace.iter().cloned().collect();
        if let Some(head) = old_head
            && prev_trace.as_ref() != Some(&head)
        {
            trace_parents.push(head);
        }
        let trace_sha = trace::record_restack_trace(engine, &tree, &trace_parents, &workspace.device)
            .with_context(|| format!("failed to trace restack of checkpoint {old}"))?;

        let mut message = strip_trailer(
            &strip_trailer(&old_message, TRACE_HEAD_TRAILER),
            TRACE_BASE_TRAILER,
        );
        if let Some(base) = &prev_trace {
            message = add_trailer(&message, TRACE_BASE_TRAILER, base);
        }
        message = add_trailer(&message, TRACE_HEAD_TRAILER, &trace_sha);

        let new = checkout
            .commit(&message)
            .with_context(|| format!("failed to commit restacked checkpoint {old}"))?;
        if let Some(source) = &last_attested {
            notes::write_inheritance(engine, &new, source)?;
        }
        engine
            .update_ref(&workspace.keep_ref(&change_id, &new), &new)
            .with_context(|| format!("failed to keep restacked checkpoint {new}"))?;
        output::detail(&format!("{old} -> {new}"));
        prev_trace = Some(trace_sha);
        rewritten.push(new);
    }

    let (Some(first), Some(last)) = (rewritten.first(), rewritten.last()) else {
        bail!("no checkpoints found for change {change_id}");
    };
    let last_tree = engine.commit_info(last)?.tree;
    let new_draft =
        draft::create_draft_commit(engine, &last_tree, Some(last.as_str()), Some(&change_id))?;

    let change_ref = refs::change_ref(&change_id);
    let anchor_ref = refs::anchor_ref(&change_id);
    let mut updates = vec![
        RefUpdate::new(&sync_ref, &new_draft),
        RefUpdate::new(&change_ref, last),
    ];
    if !engine.ref_exists(&anchor_ref)? {
        updates.push(RefUpdate::new(&anchor_ref, first));
    }
    engine
        .update_refs(&updates)
        .with_context(|| format!("failed to record restack of change {change_id}"))?;
    workspace.write_config(&WorkspaceConfig::for_base(&base_ref, &base_sha))?;

    checkout.reset(&new_draft)?;
    engine.reset_working_tree(&new_draft)?;

    let mut result = RestackResult {
        change_id,
        base_ref,
        base_sha,
        checkpoints: rewritten,
        draft_sha: new_draft,
        trace_head: prev_trace,
        remote: remote.clone(),
        pushed: false,
        warnings: Vec::new(),
    };

    match &remote {
        Some(remote) => {
            publish(engine, workspace, remote, shared_tip.as_deref(), &mut result, &mut warnings)?;
            result.pushed = true;
        }
        None => {
            sync::publish_shared(engine, workspace, None, &result.draft_sha, shared_tip.as_deref())?;
        }
    }
    result.warnings = warnings;
    Ok(result)
}

/// Full ref name and sha of the new base. Branch short names are expanded so
/// the workspace config can track them.
fn resolve_base<E: Engine>(engine: &E, base_ref: &str) -> Result<(String, String)> {
    let base_ref = base_ref.trim();
    if base_ref.is_empty() {
        bail!("base ref required for restack");
    }
    if !base_ref.starts_with("refs/") {
        let branch = format!("{BRANCH_PREFIX}{base_ref}");
        if let Some(sha) = engine.resolve_ref(&branch)? {
            return Ok((branch, sha));
        }
    }
    match engine.resolve_ref(base_ref)? {
        Some(sha) => Ok((base_ref.to_string(), sha)),
        None => bail!("base ref {base_ref} not found"),
    }
}

fn publish<E: Engine>(
    engine: &E,
    workspace: &Workspace,
    remote: &str,
    shared_tip: Option<&str>,
    result: &mut RestackResult,
    warnings: &mut Vec<String>,
) -> Result<()> {
    push_keep_refs(engine, workspace, remote)?;

    let change_ref = refs::change_ref(&result.change_id);
    if let Some(last) = result.new_parent() {
        let mode = PushMode::Lease {
            expected: engine.remote_tip(remote, &change_ref)?,
        };
        engine
            .push_ref(remote, last, &change_ref, &mode)
            .with_context(|| format!("failed to push {change_ref} to {remote}"))?;
    }

    let anchor_ref = refs::anchor_ref(&result.change_id);
    if let Some(anchor) = engine.resolve_ref(&anchor_ref)? {
        match engine.remote_tip(remote, &anchor_ref)? {
            None => engine
                .push_ref(remote, &anchor, &anchor_ref, &PushMode::Lease { expected: None })
                .with_context(|| format!("failed to push {anchor_ref} to {remote}"))?,
            Some(remote_anchor) if remote_anchor != anchor => warnings.push(format!(
                "anchor ref mismatch for change {}: remote has {remote_anchor}",
                result.change_id
            )),
            Some(_) => {}
        }
    }

    let sync_ref = workspace.sync_ref();
    if let Err(err) = engine.push_ref(remote, &result.draft_sha, &sync_ref, &PushMode::Force) {
        warnings.push(format!("failed to push draft to {sync_ref}: {err:#}"));
    }

    // The shared ref and lease move last, once everything they point at is
    // already on the remote.
    if let Some(divergence) =
        sync::publish_shared(engine, workspace, Some(remote), &result.draft_sha, shared_tip)?
    {
        return Err(RestackError::Diverged(divergence).into());
    }

    for notes_ref in [TRACES_NOTES_REF, ATTESTATIONS_NOTES_REF] {
        if let Err(err) = engine.push_notes(remote, notes_ref) {
            warnings.push(format!("failed to push {notes_ref}: {err:#}"));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointOptions, CheckpointResult, checkpoint};
    use crate::config::TraceSettings;
    use crate::engine::memory::{MemoryEngine, MemoryRemote};
    use crate::notes::Attestation;
    use crate::sync::SyncOptions;
    use crate::sync::tests::{Device, device_with_remote};

    fn make_checkpoint(dev: &Device, path: &str, contents: &str, message: &str) -> CheckpointResult {
        dev.engine.write_file(path, contents);
        checkpoint(
            &dev.engine,
            &dev.ws,
            &TraceSettings::default(),
            &SyncOptions::default(),
            &CheckpointOptions {
                message: message.to_string(),
                start_new_change: false,
            },
        )
        .unwrap()
    }

    /// Commit an upstream change on `main` that descends from `HEAD`.
    fn move_upstream(dev: &Device, path: &str, contents: &str) -> String {
        let head = dev.engine.resolve_ref("HEAD").unwrap().unwrap();
        let upstream = dev.engine.sibling();
        upstream.reset_working_tree(&head).unwrap();
        upstream.write_file(path, contents);
        let tree = upstream.snapshot_tree().unwrap();
        let sha = dev
            .engine
            .commit_tree(&tree, &[head], "upstream change")
            .unwrap();
        dev.engine.update_ref("refs/heads/main", &sha).unwrap();
        sha
    }

    fn onto_main() -> RestackOptions {
        RestackOptions {
            base_ref: "main".to_string(),
            ..RestackOptions::default()
        }
    }

    /// Base `B` with `shared.txt`, then checkpoints C1..C3 of one change.
    fn three_checkpoints(remote: &MemoryRemote) -> (Device, Vec<CheckpointResult>) {
        let dev = device_with_remote(remote);
        dev.engine.write_file("shared.txt", "base\n");
        dev.engine.commit_all("base").unwrap();
        let c1 = make_checkpoint(&dev, "one.txt", "1\n", "first");
        let c2 = make_checkpoint(&dev, "shared.txt", "mine\n", "second");
        let c3 = make_checkpoint(&dev, "three.txt", "3\n", "third");
        (dev, vec![c1, c2, c3])
    }

    #[test]
    fn test_chain_is_rebuilt_on_new_base() {
        let remote = MemoryRemote::new();
        let (dev, olds) = three_checkpoints(&remote);
        let change_id = olds[0].change_id.clone();
        let upstream = move_upstream(&dev, "UPSTREAM.md", "new\n");

        let result = restack(&dev.engine, &dev.ws, &onto_main()).unwrap();
        assert_eq!(result.change_id, change_id);
        assert_eq!(result.base_ref, "refs/heads/main");
        assert_eq!(result.base_sha, upstream);
        assert_eq!(result.checkpoints.len(), 3);

        let mut parent = upstream.clone();
        for (old, new) in olds.iter().zip(&result.checkpoints) {
            let old_info = dev.engine.commit_info(&old.checkpoint_sha).unwrap();
            let new_info = dev.engine.commit_info(new).unwrap();
            assert_eq!(new_info.parents, vec![parent.clone()]);
            assert_eq!(
                dev.engine.changed_paths(Some(&parent), new).unwrap(),
                dev.engine
                    .changed_paths(old_info.first_parent(), &old.checkpoint_sha)
                    .unwrap()
            );
            assert_eq!(extract_change_id(&new_info.message), Some(change_id.clone()));
            assert_eq!(
                dev.engine.resolve_ref(&dev.ws.keep_ref(&change_id, new)).unwrap(),
                Some(new.clone())
            );
            parent = new.clone();
        }

        let draft = dev.engine.commit_info(&result.draft_sha).unwrap();
        assert_eq!(draft.parents, vec![parent.clone()]);
        assert_eq!(extract_change_id(&draft.message), Some(change_id.clone()));
        for name in [dev.ws.sync_ref(), dev.ws.workspace_ref()] {
            assert_eq!(
                dev.engine.resolve_ref(&name).unwrap(),
                Some(result.draft_sha.clone())
            );
        }
        assert_eq!(
            dev.engine.resolve_ref(&refs::change_ref(&change_id)).unwrap(),
            Some(parent.clone())
        );
        // The anchor keeps pointing at the original first checkpoint.
        assert_eq!(
            dev.engine.resolve_ref(&refs::anchor_ref(&change_id)).unwrap(),
            Some(olds[0].checkpoint_sha.clone())
        );
        assert_eq!(dev.ws.read_lease().unwrap(), Some(result.draft_sha.clone()));
        let config = dev.ws.read_config().unwrap().unwrap();
        assert_eq!(config.track_ref.as_deref(), Some("refs/heads/main"));
        assert_eq!(config.base_sha.as_deref(), Some(upstream.as_str()));
        assert_eq!(dev.engine.worktree_file("UPSTREAM.md"), Some(b"new\n".to_vec()));
        assert_eq!(dev.engine.worktree_file("three.txt"), Some(b"3\n".to_vec()));

        assert!(result.pushed);
        assert_eq!(remote.tip(&dev.ws.workspace_ref()), Some(result.draft_sha.clone()));
        assert_eq!(remote.tip(&refs::change_ref(&change_id)), Some(parent));
        for new in &result.checkpoints {
            let keep = dev.ws.keep_ref(&change_id, new);
            assert_eq!(remote.tip(&keep), Some(new.clone()));
        }

        // The next sync on this device publishes normally.
        let next = sync::sync(&dev.engine, &dev.ws, &SyncOptions::default()).unwrap();
        assert!(!next.diverged());
        assert_eq!(next.draft_sha, result.draft_sha);
    }

    #[test]
    fn test_trace_lineage_links_old_heads() {
        let remote = MemoryRemote::new();
        let (dev, olds) = three_checkpoints(&remote);
        move_upstream(&dev, "UPSTREAM.md", "new\n");
        let result = restack(&dev.engine, &dev.ws, &onto_main()).unwrap();

        let mut prev: Option<String> = None;
        for (old, new) in olds.iter().zip(&result.checkpoints) {
            let old_message = dev.engine.commit_info(&old.checkpoint_sha).unwrap().message;
            let new_message = dev.engine.commit_info(new).unwrap().message;
            let head = extract_trailer(&new_message, TRACE_HEAD_TRAILER).unwrap();
            let trace = dev.engine.commit_info(&head).unwrap();
            assert_eq!(trace.message, crate::change_id::TRACE_RESTACK_MESSAGE);

            let old_head = extract_trailer(&old_message, TRACE_HEAD_TRAILER).unwrap();
            let expected_base = prev
                .clone()
                .or_else(|| extract_trailer(&old_message, TRACE_BASE_TRAILER));
            let mut expected_parents: Vec<String> = expected_base.iter().cloned().collect();
            expected_parents.push(old_head);
            assert_eq!(trace.parents, expected_parents);
            assert_eq!(extract_trailer(&new_message, TRACE_BASE_TRAILER), expected_base);
            assert_eq!(new_message.matches("Trace-Head:").count(), 1);
            prev = Some(head);
        }
        assert_eq!(result.trace_head, prev);
    }

    #[test]
    fn test_conflict_leaves_followed_refs_alone() {
        let remote = MemoryRemote::new();
        let (dev, olds) = three_checkpoints(&remote);
        move_upstream(&dev, "shared.txt", "upstream\n");
        let sync_before = dev.engine.resolve_ref(&dev.ws.sync_ref()).unwrap();
        let shared_before = remote.tip(&dev.ws.workspace_ref());
        let config_before = dev.ws.read_config().unwrap();
        let change_id = olds[0].change_id.clone();

        let err = restack(&dev.engine, &dev.ws, &onto_main()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<RestackError>(),
            Some(&RestackError::Conflict {
                checkpoint: olds[1].checkpoint_sha.clone(),
                paths: vec!["shared.txt".to_string()],
            })
        );

        for old in &olds {
            assert_eq!(
                dev.engine.resolve_ref(&old.keep_ref).unwrap(),
                Some(old.checkpoint_sha.clone())
            );
        }
        // Only C1' was rewritten before the conflict.
        let keeps = dev.engine.list_refs(&dev.ws.keep_prefix()).unwrap();
        assert_eq!(keeps.len(), 4);
        assert_eq!(dev.engine.resolve_ref(&dev.ws.sync_ref()).unwrap(), sync_before);
        assert_eq!(remote.tip(&dev.ws.workspace_ref()), shared_before);
        assert_eq!(
            dev.engine.resolve_ref(&refs::change_ref(&change_id)).unwrap(),
            Some(olds[2].checkpoint_sha.clone())
        );
        assert_eq!(dev.ws.read_config().unwrap(), config_before);
    }

    #[test]
    fn test_uncheckpointed_changes_refuse() {
        let remote = MemoryRemote::new();
        let (dev, olds) = three_checkpoints(&remote);
        move_upstream(&dev, "UPSTREAM.md", "new\n");
        dev.engine.write_file("scratch.txt", "unsaved");

        let err = restack(&dev.engine, &dev.ws, &onto_main()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<RestackError>(),
            Some(&RestackError::UncheckpointedChanges {
                checkpoint: olds[2].checkpoint_sha.clone()
            })
        );
        assert_eq!(dev.engine.worktree_file("scratch.txt"), Some(b"unsaved".to_vec()));
    }

    #[test]
    fn test_missing_draft_and_checkpoint() {
        let remote = MemoryRemote::new();
        let dev = device_with_remote(&remote);
        let err = restack(&dev.engine, &dev.ws, &onto_main()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RestackError>(),
            Some(RestackError::NoDraft { .. })
        ));

        sync::sync(&dev.engine, &dev.ws, &SyncOptions::default()).unwrap();
        let err = restack(&dev.engine, &dev.ws, &onto_main()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RestackError>(),
            Some(RestackError::NoCheckpoint { .. })
        ));
    }

    #[test]
    fn test_mid_merge_checkout_is_not_discarded() {
        let remote = MemoryRemote::new();
        let (dev, _) = three_checkpoints(&remote);
        move_upstream(&dev, "UPSTREAM.md", "new\n");
        dev.engine.mark_mid_merge(dev.ws.checkout_key());

        let err = restack(&dev.engine, &dev.ws, &onto_main()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RestackError>(),
            Some(RestackError::MergeInProgress { .. })
        ));
        assert!(err.to_string().contains("--resume"));
    }

    #[test]
    fn test_stale_lease_is_diverged() {
        let remote = MemoryRemote::new();
        let (dev, _) = three_checkpoints(&remote);
        move_upstream(&dev, "UPSTREAM.md", "new\n");
        let other = dev.engine.sibling();
        other.write_file("x", "from elsewhere");
        let tree = other.snapshot_tree().unwrap();
        let foreign = other.commit_tree(&tree, &[], "[draft] WIP").unwrap();
        remote.set_tip(&dev.ws.workspace_ref(), &foreign);

        let err = restack(&dev.engine, &dev.ws, &onto_main()).unwrap_err();
        match err.downcast_ref::<RestackError>() {
            Some(RestackError::Diverged(divergence)) => {
                assert_eq!(divergence.remote_tip(), foreign)
            }
            other => panic!("expected divergence, got {other:?}"),
        }
    }

    #[test]
    fn test_lost_shared_race_keeps_lease() {
        let remote = MemoryRemote::new();
        let (dev, olds) = three_checkpoints(&remote);
        move_upstream(&dev, "UPSTREAM.md", "new\n");
        let workspace_ref = dev.ws.workspace_ref();
        let lease_before = dev.ws.read_lease().unwrap();
        let local_before = dev.engine.resolve_ref(&workspace_ref).unwrap();
        assert_eq!(lease_before, local_before);

        // Another device publishes after our fetch but before our push.
        let racer = olds[0].checkpoint_sha.clone();
        remote.race_next_push(&workspace_ref, &racer);
        let err = restack(&dev.engine, &dev.ws, &onto_main()).unwrap_err();
        match err.downcast_ref::<RestackError>() {
            Some(RestackError::Diverged(Divergence::LeaseMismatch { lease, remote_tip })) => {
                assert_eq!(Some(lease), lease_before.as_ref());
                assert_eq!(remote_tip, &racer);
            }
            other => panic!("expected lease mismatch, got {other:?}"),
        }

        assert_eq!(dev.ws.read_lease().unwrap(), lease_before);
        assert_eq!(dev.engine.resolve_ref(&workspace_ref).unwrap(), local_before);
        assert_eq!(remote.tip(&workspace_ref), Some(racer));
        // Everything the shared ref would have named was published first.
        let change_id = &olds[0].change_id;
        let rebuilt = remote.tip(&refs::change_ref(change_id)).unwrap();
        assert_ne!(rebuilt, olds[2].checkpoint_sha);
        assert_eq!(remote.tip(&dev.ws.keep_ref(change_id, &rebuilt)), Some(rebuilt));
    }

    #[test]
    fn test_rejected_shared_push_keeps_lease() {
        let remote = MemoryRemote::new();
        let (dev, _) = three_checkpoints(&remote);
        move_upstream(&dev, "UPSTREAM.md", "new\n");
        let workspace_ref = dev.ws.workspace_ref();
        let lease_before = dev.ws.read_lease().unwrap();
        let shared_before = remote.tip(&workspace_ref);
        remote.reject(&workspace_ref);

        let err = restack(&dev.engine, &dev.ws, &onto_main()).unwrap_err();
        assert!(format!("{err:#}").contains("rejected by remote"), "got: {err:#}");
        assert_eq!(dev.ws.read_lease().unwrap(), lease_before);
        assert_eq!(dev.engine.resolve_ref(&workspace_ref).unwrap(), lease_before);
        assert_eq!(remote.tip(&workspace_ref), shared_before);
    }

    #[test]
    fn test_restack_without_remote_publishes_locally() {
        let dev = crate::sync::tests::device(MemoryEngine::new(), "dev-a");
        dev.engine.write_file("shared.txt", "base\n");
        dev.engine.commit_all("base").unwrap();
        make_checkpoint(&dev, "one.txt", "1\n", "first");
        move_upstream(&dev, "UPSTREAM.md", "new\n");

        let result = restack(&dev.engine, &dev.ws, &onto_main()).unwrap();
        assert!(!result.pushed);
        assert_eq!(result.remote, None);
        assert_eq!(
            dev.engine.resolve_ref(&dev.ws.workspace_ref()).unwrap(),
            Some(result.draft_sha.clone())
        );
        assert_eq!(dev.ws.read_lease().unwrap(), Some(result.draft_sha));
    }

    #[test]
    fn test_attestation_is_inherited() {
        let remote = MemoryRemote::new();
        let (dev, olds) = three_checkpoints(&remote);
        move_upstream(&dev, "UPSTREAM.md", "new\n");
        let c1 = &olds[0];
        notes::write_attestation(
            &dev.engine,
            &Attestation::new(&c1.checkpoint_sha, c1.change_id.as_str(), "ci", "pass"),
        )
        .unwrap();

        let result = restack(&dev.engine, &dev.ws, &onto_main()).unwrap();
        for new in &result.checkpoints {
            let attestation = notes::read_attestation(&dev.engine, new).unwrap().unwrap();
            assert_eq!(attestation.inherit_from(), Some(c1.checkpoint_sha.as_str()));
            assert!(!attestation.has_status());
            assert_eq!(
                notes::attested_source(&dev.engine, new).unwrap(),
                Some(c1.checkpoint_sha.clone())
            );
        }
        assert!(remote
            .note(ATTESTATIONS_NOTES_REF, &result.checkpoints[0])
            .is_some());
    }

    #[test]
    fn test_latest_checkpoint_tie_breaks_on_sha() {
        let engine = MemoryEngine::new();
        let ws = Workspace::new("alice", "@", "dev-a", "/nonexistent/.jul");
        let change_id = ChangeId::generate();
        let message = format!("work\n\nChange-Id: {change_id}\n");
        engine.write_file("a", "1");
        let older = engine.commit_all(&message).unwrap();
        engine.update_ref(&ws.keep_ref(&change_id, &older), &older).unwrap();

        engine.freeze_clock();
        engine.write_file("a", "2");
        let x = engine.commit_all(&message).unwrap();
        engine.write_file("a", "3");
        let y = engine.commit_all(&message).unwrap();
        for sha in [&x, &y] {
            engine.update_ref(&ws.keep_ref(&change_id, sha), sha).unwrap();
        }
        // A keep-ref of another change is ignored.
        let other = ChangeId::generate();
        engine.write_file("a", "4");
        let unrelated = engine.commit_all("other").unwrap();
        engine.update_ref(&ws.keep_ref(&other, &unrelated), &unrelated).unwrap();

        let latest = latest_checkpoint(&engine, &ws, &change_id).unwrap().unwrap();
        assert_eq!(latest, std::cmp::max(x.clone(), y.clone()));
        assert_eq!(latest_checkpoint(&engine, &ws, &ChangeId::generate()).unwrap(), None);

        let chain = checkpoint_chain(&engine, &y, &change_id).unwrap();
        assert_eq!(chain, vec![older, x, y]);
    }
}
