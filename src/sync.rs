//! Sync protocol.
//!
//! A sync snapshots the working tree as this device's draft and, when the
//! device can prove it last observed the shared workspace tip (its lease),
//! advances the shared workspace ref to that draft with a compare-and-swap
//! push. A device that cannot prove it is told it diverged; its draft is still
//! recorded on its own sync ref.

use anyhow::{Context, Result, bail};
use std::fmt;
use std::path::Path;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::api_client::{ApiClient, SyncPayload, SyncResponse};
use crate::change_id::{ChangeId, change_id_of, is_draft_message};
use crate::config::Settings;
use crate::draft;
use crate::engine::{CommitInfo, Engine, PushMode};
use crate::output;
use crate::remote::{self, RemoteProblem};
use crate::secrets;
use crate::syncignore::SyncIgnore;
use crate::workspace::{Workspace, WorkspaceConfig};

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Configured remote name; `None` selects by precedence.
    pub remote: Option<String>,
    /// Publish the draft to the remote copy of the sync ref.
    pub draft_push: bool,
    /// Skip the secret gate.
    pub allow_secrets: bool,
    pub ignore: SyncIgnore,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            remote: None,
            draft_push: true,
            allow_secrets: false,
            ignore: SyncIgnore::default(),
        }
    }
}

impl SyncOptions {
    pub fn from_settings(settings: &Settings, state_dir: &Path) -> Result<Self> {
        Ok(Self {
            remote: settings.remote.clone(),
            draft_push: settings.draft_push,
            allow_secrets: settings.allow_secrets,
            ignore: SyncIgnore::load(state_dir)?,
        })
    }
}

/// Why the shared workspace ref was not advanced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Divergence {
    /// A shared tip exists but this device never recorded a lease.
    LeaseMissing { remote_tip: String },
    /// The shared tip moved since this device last observed it.
    LeaseMismatch { lease: String, remote_tip: String },
}

impl Divergence {
    pub fn remote_tip(&self) -> &str {
        match self {
            Self::LeaseMissing { remote_tip } | Self::LeaseMismatch { remote_tip, .. } => remote_tip,
        }
    }
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LeaseMissing { .. } => {
                write!(f, "workspace lease missing; run 'jul ws checkout' first")
            }
            Self::LeaseMismatch { lease, remote_tip } => write!(
                f,
                "workspace lease {lease} does not match shared tip {remote_tip}; run 'jul ws checkout' to realign"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub draft_sha: String,
    pub change_id: ChangeId,
    /// Parent of the draft, `None` for a root draft.
    pub base: Option<String>,
    pub workspace_ref: String,
    pub sync_ref: String,
    /// The shared workspace ref now points at `draft_sha`.
    pub workspace_updated: bool,
    pub remote: Option<String>,
    pub draft_pushed: bool,
    pub workspace_pushed: bool,
    pub divergence: Option<Divergence>,
    /// Reported only; never changes what sync does locally.
    pub remote_problem: Option<RemoteProblem>,
    /// Reason the secret gate blocked all pushes.
    pub secret_block: Option<String>,
    /// Shared tip observed before any update.
    pub shared_tip: Option<String>,
    pub warnings: Vec<String>,
}

impl SyncResult {
    pub fn diverged(&self) -> bool {
        self.divergence.is_some()
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Publish the working tree as this device's draft.
pub fn sync<E: Engine>(engine: &E, workspace: &Workspace, opts: &SyncOptions) -> Result<SyncResult> {
    let workspace_ref = workspace.workspace_ref();
    let sync_ref = workspace.sync_ref();

    let (remote, remote_problem) = match remote::select(engine, opts.remote.as_deref())? {
        Ok(name) => (Some(name), None),
        Err(problem) => {
            output::detail(&problem.to_string());
            (None, Some(problem))
        }
    };

    let base = resolve_base(engine, &sync_ref, &workspace_ref)?;
    let (parent, change_id) = draft_parent(base.as_ref());

    let existing = engine.resolve_ref(&sync_ref)?;
    let tree = engine.snapshot_tree()?;
    let draft = draft::reuse_or_create(engine, existing.as_deref(), &tree, parent.as_deref(), &change_id)?;
    engine
        .update_ref(&sync_ref, &draft)
        .with_context(|| format!("failed to update {sync_ref}"))?;
    output::detail(&format!("draft {draft} on {sync_ref}"));

    let mut result = SyncResult {
        draft_sha: draft.clone(),
        change_id,
        base: parent.clone(),
        workspace_ref: workspace_ref.clone(),
        sync_ref: sync_ref.clone(),
        workspace_updated: false,
        remote: remote.clone(),
        draft_pushed: false,
        workspace_pushed: false,
        divergence: None,
        remote_problem,
        secret_block: None,
        shared_tip: None,
        warnings: Vec::new(),
    };

    let shared_tip = match &remote {
        Some(remote) => {
            if !opts.allow_secrets
                && let Some(reason) =
                    secrets::check_draft(engine, parent.as_deref(), &draft, &opts.ignore)?
            {
                result.secret_block = Some(reason);
                return Ok(result);
            }
            if opts.draft_push {
                match engine.push_ref(remote, &draft, &sync_ref, &PushMode::Force) {
                    Ok(()) => result.draft_pushed = true,
                    Err(err) => result
                        .warnings
                        .push(format!("failed to push draft to {sync_ref}: {err:#}")),
                }
            }
            engine
                .fetch_ref(remote, &workspace_ref)
                .with_context(|| format!("failed to fetch {workspace_ref} from {remote}"))?
        }
        None => engine.resolve_ref(&workspace_ref)?,
    };
    result.shared_tip = shared_tip.clone();

    let lease = workspace.read_lease()?;
    if let Some(divergence) = check_lease(lease.as_deref(), shared_tip.as_deref()) {
        output::detail(&divergence.to_string());
        result.divergence = Some(divergence);
        return Ok(result);
    }

    if let Some(divergence) =
        publish_shared(engine, workspace, remote.as_deref(), &draft, shared_tip.as_deref())?
    {
        output::detail(&divergence.to_string());
        result.divergence = Some(divergence);
        return Ok(result);
    }
    result.workspace_pushed = remote.is_some();
    result.workspace_updated = true;

    if workspace.read_config()?.is_none() {
        let config = WorkspaceConfig {
            base_sha: result.base.clone(),
            ..WorkspaceConfig::default()
        };
        workspace.write_config(&config)?;
    }
    Ok(result)
}

/// Advance the shared workspace ref to `sha`, then record it as the lease.
///
/// With a remote the push is a compare-and-swap on `expected`; the local ref
/// and the lease only move once the remote accepted it. Losing the race to
/// another writer comes back as a [`Divergence`].
pub(crate) fn publish_shared<E: Engine>(
    engine: &E,
    workspace: &Workspace,
    remote: Option<&str>,
    sha: &str,
    expected: Option<&str>,
) -> Result<Option<Divergence>> {
    let workspace_ref = workspace.workspace_ref();
    if let Some(remote) = remote {
        let mode = PushMode::Lease {
            expected: expected.map(str::to_string),
        };
        if let Err(err) = engine.push_ref(remote, sha, &workspace_ref, &mode) {
            let now = engine.remote_tip(remote, &workspace_ref).ok().flatten();
            if let Some(now) = now
                && Some(now.as_str()) != expected
            {
                return Ok(Some(match expected {
                    Some(lease) => Divergence::LeaseMismatch {
                        lease: lease.to_string(),
                        remote_tip: now,
                    },
                    None => Divergence::LeaseMissing { remote_tip: now },
                }));
            }
            return Err(err).with_context(|| format!("failed to push {workspace_ref} to {remote}"));
        }
    }
    engine
        .update_ref(&workspace_ref, sha)
        .with_context(|| format!("failed to update {workspace_ref}"))?;
    workspace.write_lease(sha)?;
    Ok(None)
}

/// The commit the next draft builds on: this device's draft, else the shared
/// tip, else `HEAD`.
fn resolve_base<E: Engine>(
    engine: &E,
    sync_ref: &str,
    workspace_ref: &str,
) -> Result<Option<CommitInfo>> {
    for candidate in [sync_ref, workspace_ref, "HEAD"] {
        if let Some(sha) = engine.resolve_ref(candidate)? {
            let info = engine
                .commit_info(&sha)
                .with_context(|| format!("failed to read {candidate} at {sha}"))?;
            return Ok(Some(info));
        }
    }
    Ok(None)
}

/// Drafts never chain: a draft base is replaced by its own parent.
fn draft_parent(base: Option<&CommitInfo>) -> (Option<String>, ChangeId) {
    match base {
        Some(info) if is_draft_message(&info.message) => (
            info.first_parent().map(str::to_string),
            change_id_of(&info.sha, &info.message),
        ),
        Some(info) => (Some(info.sha.clone()), change_id_of(&info.sha, &info.message)),
        None => (None, ChangeId::generate()),
    }
}

/// Compare the cached lease with the observed shared tip.
pub fn check_lease(lease: Option<&str>, shared_tip: Option<&str>) -> Option<Divergence> {
    match (lease, shared_tip) {
        (None, Some(tip)) => Some(Divergence::LeaseMissing {
            remote_tip: tip.to_string(),
        }),
        (Some(lease), Some(tip)) if lease != tip => Some(Divergence::LeaseMismatch {
            lease: lease.to_string(),
            remote_tip: tip.to_string(),
        }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Workspace checkout
// ---------------------------------------------------------------------------

/// Adopt the current shared tip: it becomes the lease, this device's draft
/// and the working tree. Returns the adopted sha.
pub fn checkout_workspace<E: Engine>(
    engine: &E,
    workspace: &Workspace,
    remote: Option<&str>,
) -> Result<String> {
    let workspace_ref = workspace.workspace_ref();
    let fetched = match remote {
        Some(remote) => engine
            .fetch_ref(remote, &workspace_ref)
            .with_context(|| format!("failed to fetch {workspace_ref} from {remote}"))?,
        None => None,
    };
    let tip = match fetched {
        Some(tip) => tip,
        None => match engine.resolve_ref(&workspace_ref)? {
            Some(tip) => tip,
            None => bail!("workspace {} has no shared tip at {workspace_ref}", workspace.id()),
        },
    };

    workspace.write_lease(&tip)?;
    let sync_ref = workspace.sync_ref();
    engine
        .update_ref(&sync_ref, &tip)
        .with_context(|| format!("failed to update {sync_ref}"))?;
    engine.reset_working_tree(&tip)?;
    Ok(tip)
}

// ---------------------------------------------------------------------------
// Server report
// ---------------------------------------------------------------------------

/// Tell the bookkeeping server about a published draft.
///
/// Failures are recorded as warnings on `result`.
pub fn report_sync<E: Engine>(
    engine: &E,
    client: &ApiClient,
    workspace: &Workspace,
    repo: &str,
    result: &mut SyncResult,
) -> Option<SyncResponse> {
    let response = sync_payload(engine, workspace, repo, result)
        .and_then(|payload| client.sync(&payload));
    match response {
        Ok(response) => Some(response),
        Err(err) => {
            result.warnings.push(format!("server sync failed: {err:#}"));
            None
        }
    }
}

fn sync_payload<E: Engine>(
    engine: &E,
    workspace: &Workspace,
    repo: &str,
    result: &SyncResult,
) -> Result<SyncPayload> {
    let info = engine.commit_info(&result.draft_sha)?;
    Ok(SyncPayload {
        workspace_id: workspace.id(),
        repo: repo.to_string(),
        branch: result.workspace_ref.clone(),
        commit_sha: result.draft_sha.clone(),
        change_id: result.change_id.to_string(),
        message: info.message,
        author: workspace.user.clone(),
        committed_at: rfc3339(info.committed_at)?,
    })
}

fn rfc3339(unix_seconds: i64) -> Result<String> {
    OffsetDateTime::from_unix_timestamp(unix_seconds)
        .context("commit time out of range")?
        .format(&Rfc3339)
        .context("failed to format commit time")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
