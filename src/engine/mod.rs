//! The version-control engine seam.
//!
//! Every algorithm in this crate (sync, checkpoint, restack, trace) talks to
//! the repository only through [`Engine`]. [`cli::GitEngine`] shells out to
//! `git`; [`memory::MemoryEngine`] keeps a content-addressed object graph in
//! memory so multi-device scenarios can run without any external process.

pub mod cli;
pub mod memory;

use anyhow::Result;

/// A commit as the algorithms see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub tree: String,
    pub parents: Vec<String>,
    pub message: String,
    /// Committer time, seconds since the Unix epoch.
    pub committed_at: i64,
}

impl CommitInfo {
    pub fn first_parent(&self) -> Option<&str> {
        self.parents.first().map(String::as_str)
    }
}

/// One entry of a batched ref update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub name: String,
    pub target: String,
}

impl RefUpdate {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
        }
    }
}

/// How a push treats the remote's current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMode {
    /// Overwrite unconditionally.
    Force,
    /// Compare-and-swap: succeed only if the remote ref currently equals
    /// `expected` (`None` means the ref must not exist yet).
    Lease { expected: Option<String> },
}

/// Result of replaying one commit without committing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickOutcome {
    Applied,
    /// The change was already present; nothing to apply.
    Empty,
    /// The replay conflicted on these paths and was aborted.
    Conflict(Vec<String>),
}

/// Primitive operations over refs, objects, remotes and notes.
pub trait Engine {
    type Checkout: Checkout;

    // -- refs ---------------------------------------------------------------

    /// Resolve a ref to a commit id; `Ok(None)` when it does not exist.
    fn resolve_ref(&self, name: &str) -> Result<Option<String>>;

    fn ref_exists(&self, name: &str) -> Result<bool> {
        Ok(self.resolve_ref(name)?.is_some())
    }

    /// Atomically point a single ref at `target`.
    fn update_ref(&self, name: &str, target: &str) -> Result<()>;

    /// Apply several ref updates. Each update is atomic on its own; the batch
    /// is not a transaction.
    fn update_refs(&self, updates: &[RefUpdate]) -> Result<()> {
        for update in updates {
            self.update_ref(&update.name, &update.target)?;
        }
        Ok(())
    }

    /// All refs under `prefix`, sorted.
    fn list_refs(&self, prefix: &str) -> Result<Vec<String>>;

    // -- objects ------------------------------------------------------------

    fn commit_info(&self, sha: &str) -> Result<CommitInfo>;

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool>;

    fn commit_tree(&self, tree: &str, parents: &[String], message: &str) -> Result<String>;

    /// Tree id of the full working tree, excluding the `.jul/` state directory.
    fn snapshot_tree(&self) -> Result<String>;

    /// Paths that differ between `base` (or the empty tree) and `commit`.
    fn changed_paths(&self, base: Option<&str>, commit: &str) -> Result<Vec<String>>;

    /// Contents of `path` at `commit`; `Ok(None)` if absent.
    fn read_file(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>>;

    /// Make the user's working tree match `commit`, leaving `.jul/` alone.
    fn reset_working_tree(&self, commit: &str) -> Result<()>;

    // -- remotes ------------------------------------------------------------

    /// Configured remote names.
    fn remotes(&self) -> Result<Vec<String>>;

    /// Current value of `name` on `remote`, without touching local refs.
    fn remote_tip(&self, remote: &str, name: &str) -> Result<Option<String>>;

    /// Fetch `name` from `remote` into the same local ref (forced) and return
    /// the remote value. A ref missing on the remote leaves the local ref alone.
    fn fetch_ref(&self, remote: &str, name: &str) -> Result<Option<String>>;

    fn push_ref(&self, remote: &str, sha: &str, name: &str, mode: &PushMode) -> Result<()>;

    /// Publish a notes ref to the remote.
    fn push_notes(&self, remote: &str, notes_ref: &str) -> Result<()>;

    // -- notes --------------------------------------------------------------

    fn read_note(&self, notes_ref: &str, object: &str) -> Result<Option<String>>;

    /// Write (replacing) the note attached to `object`.
    fn write_note(&self, notes_ref: &str, object: &str, content: &str) -> Result<()>;

    /// Annotated object ids under a notes ref.
    fn list_notes(&self, notes_ref: &str) -> Result<Vec<String>>;

    // -- isolated checkout --------------------------------------------------

    /// Obtain the persistent checkout for `key`, reset to `base`.
    ///
    /// A checkout with a merge in progress is returned untouched when
    /// `allow_resume` is set and is an error otherwise.
    fn isolated_checkout(&self, key: &str, base: &str, allow_resume: bool)
    -> Result<Self::Checkout>;
}

/// A working tree independent from the user's, used to replay commits.
pub trait Checkout {
    fn head(&self) -> Result<String>;

    /// `cherry-pick --no-commit`. Conflicts are aborted before returning.
    fn cherry_pick(&mut self, commit: &str) -> Result<PickOutcome>;

    /// Tree id of the current index.
    fn write_tree(&mut self) -> Result<String>;

    /// Commit the index on top of `head` (allow-empty, no hooks).
    fn commit(&mut self, message: &str) -> Result<String>;

    /// Hard reset to `commit` and drop untracked files.
    fn reset(&mut self, commit: &str) -> Result<()>;
}

/// Raised when the isolated checkout is mid-merge and resuming was not allowed.
#[derive(Debug, thiserror::Error)]
#[error("merge in progress in isolated checkout {path}; resolve it or resume explicitly")]
pub struct MergeInProgress {
    pub path: String,
}
