//! Production engine: every primitive is a `git` invocation.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

use super::{Checkout, CommitInfo, Engine, MergeInProgress, PickOutcome, PushMode, RefUpdate};
use crate::draft;
use crate::git::Git;
use crate::output;
use crate::refs::{self, GitDirs};

/// Name of the tool's state directory at the repository root.
pub const STATE_DIR_NAME: &str = ".jul";

/// Isolated checkout location, relative to the state directory.
const ISOLATED_CHECKOUT_DIR: &str = "agent-workspace";

/// Stderr fragments git prints when a cherry-pick turns out to be a no-op.
const EMPTY_PICK_MARKERS: [&str; 3] = [
    "previous cherry-pick is empty",
    "patch is empty",
    "nothing to commit",
];

/// Engine backed by the `git` CLI for one repository.
#[derive(Debug, Clone)]
pub struct GitEngine {
    git: Git,
    dirs: Option<GitDirs>,
    state_dir: PathBuf,
}

impl GitEngine {
    /// Open the repository containing `start`.
    pub fn open(start: &Path) -> Result<Self> {
        let git = Git::discover(start)?;
        let dirs = refs::git_dirs(git.dir());
        let state_dir = git.dir().join(STATE_DIR_NAME);
        Ok(Self {
            git,
            dirs,
            state_dir,
        })
    }

    pub fn root(&self) -> &Path {
        self.git.dir()
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    fn isolated_path(&self, key: &str) -> PathBuf {
        let root = self.state_dir.join(ISOLATED_CHECKOUT_DIR);
        if key.is_empty() || key == "@" {
            root.join("worktree")
        } else {
            root.join(escape_checkout_key(key)).join("worktree")
        }
    }
}

/// One path component per key; `%` and `/` are percent-encoded so distinct
/// keys never share a directory.
fn escape_checkout_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            _ => out.push(c),
        }
    }
    out
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("path is not valid UTF-8: {}", path.display()))
}

fn is_mid_merge(git: &Git) -> Result<bool> {
    for marker in ["MERGE_HEAD", "CHERRY_PICK_HEAD"] {
        if git.succeeds(&["rev-parse", "-q", "--verify", marker])? {
            return Ok(true);
        }
    }
    Ok(false)
}

impl Engine for GitEngine {
    type Checkout = GitCheckout;

    fn resolve_ref(&self, name: &str) -> Result<Option<String>> {
        if let Some(dirs) = &self.dirs
            && let Some(sha) = refs::resolve_fast(dirs, name)
        {
            return Ok(Some(sha));
        }
        let spec = format!("{name}^{{commit}}");
        let outcome = self.git.attempt(&["rev-parse", "--verify", "--quiet", &spec])?;
        if !outcome.success {
            return Ok(None);
        }
        let sha = outcome.stdout.trim();
        Ok((!sha.is_empty()).then(|| sha.to_string()))
    }

    fn update_ref(&self, name: &str, target: &str) -> Result<()> {
        self.git
            .run(&["update-ref", name, target])
            .with_context(|| format!("failed to update {name} to {target}"))
    }

    fn update_refs(&self, updates: &[RefUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut script = String::new();
        for update in updates {
            script.push_str(&format!("update {} {}\n", update.name, update.target));
        }
        self.git
            .output_with_stdin(&["update-ref", "--stdin"], &script)
            .map(|_| ())
            .with_context(|| {
                let names: Vec<&str> = updates.iter().map(|u| u.name.as_str()).collect();
                format!("failed to update refs {}", names.join(", "))
            })
    }

    fn list_refs(&self, prefix: &str) -> Result<Vec<String>> {
        if let Some(dirs) = &self.dirs
            && let Some(found) = refs::list_fast(dirs, prefix)
        {
            return Ok(found);
        }
        let out = self
            .git
            .output(&["for-each-ref", "--format=%(refname)", prefix])?;
        let mut names: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn commit_info(&self, sha: &str) -> Result<CommitInfo> {
        let out = self
            .git
            .output_env(&["show", "-s", "--format=%H%x00%T%x00%P%x00%ct%x00%B", sha], &[])
            .with_context(|| format!("failed to read commit {sha}"))?;
        let mut fields = out.splitn(5, '\0');
        let mut next = || fields.next().unwrap_or_default();
        let full = next().trim().to_string();
        let tree = next().trim().to_string();
        let parents = next()
            .split_whitespace()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let committed_at = next()
            .trim()
            .parse::<i64>()
            .with_context(|| format!("failed to parse commit time of {sha}"))?;
        let message = next().trim_end_matches('\n').to_string();
        Ok(CommitInfo {
            sha: full,
            tree,
            parents,
            message,
            committed_at,
        })
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let outcome = self
            .git
            .attempt(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        if outcome.success {
            return Ok(true);
        }
        if outcome.stderr.trim().is_empty() {
            return Ok(false);
        }
        bail!(
            "failed to compare {ancestor} and {descendant}: {}",
            outcome.stderr.trim()
        )
    }

    fn commit_tree(&self, tree: &str, parents: &[String], message: &str) -> Result<String> {
        let mut args = vec!["commit-tree", tree];
        for parent in parents {
            args.push("-p");
            args.push(parent);
        }
        args.extend(["-F", "-"]);
        self.git
            .output_with_stdin(&args, message)
            .with_context(|| format!("failed to commit tree {tree}"))
    }

    fn snapshot_tree(&self) -> Result<String> {
        draft::draft_tree(&self.git, &self.state_dir)
    }

    fn changed_paths(&self, base: Option<&str>, commit: &str) -> Result<Vec<String>> {
        let out = match base {
            Some(base) => self.git.output(&["diff", "--name-only", base, commit])?,
            None => self.git.output(&[
                "diff-tree",
                "--root",
                "--no-commit-id",
                "--name-only",
                "-r",
                commit,
            ])?,
        };
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn read_file(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>> {
        self.git
            .bytes_if_ok(&["cat-file", "blob", &format!("{commit}:{path}")])
    }

    fn reset_working_tree(&self, commit: &str) -> Result<()> {
        self.git
            .run(&["read-tree", "--reset", "-u", commit])
            .with_context(|| format!("failed to update working tree to {commit}"))?;
        self.git
            .run(&["clean", "-fd", &format!("--exclude={STATE_DIR_NAME}")])
    }

    fn remotes(&self) -> Result<Vec<String>> {
        let out = self.git.output(&["remote"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn remote_tip(&self, remote: &str, name: &str) -> Result<Option<String>> {
        let out = self
            .git
            .output(&["ls-remote", remote, name])
            .with_context(|| format!("failed to query {name} on {remote}"))?;
        Ok(out.lines().find_map(|line| {
            let (sha, refname) = line.split_once('\t')?;
            (refname.trim() == name).then(|| sha.trim().to_string())
        }))
    }

    fn fetch_ref(&self, remote: &str, name: &str) -> Result<Option<String>> {
        let Some(tip) = self.remote_tip(remote, name)? else {
            return Ok(None);
        };
        self.git
            .run(&["fetch", "--quiet", remote, &format!("+{name}:{name}")])
            .with_context(|| format!("failed to fetch {name} from {remote}"))?;
        Ok(Some(tip))
    }

    fn push_ref(&self, remote: &str, sha: &str, name: &str, mode: &PushMode) -> Result<()> {
        let refspec = format!("{sha}:{name}");
        let result = match mode {
            PushMode::Force => self.git.run(&["push", "--quiet", "--force", remote, &refspec]),
            PushMode::Lease { expected } => {
                let lease = format!(
                    "--force-with-lease={name}:{}",
                    expected.as_deref().unwrap_or_default()
                );
                self.git.run(&["push", "--quiet", &lease, remote, &refspec])
            }
        };
        result.with_context(|| format!("failed to push {name} to {remote}"))
    }

    fn push_notes(&self, remote: &str, notes_ref: &str) -> Result<()> {
        if self.resolve_ref(notes_ref)?.is_none() {
            return Ok(());
        }
        self.git
            .run(&["push", "--quiet", remote, &format!("{notes_ref}:{notes_ref}")])
            .with_context(|| format!("failed to push {notes_ref} to {remote}"))
    }

    fn read_note(&self, notes_ref: &str, object: &str) -> Result<Option<String>> {
        let outcome = self.git.attempt(&["notes", "--ref", notes_ref, "show", object])?;
        if !outcome.success {
            return Ok(None);
        }
        Ok(Some(outcome.stdout.trim_end().to_string()))
    }

    fn write_note(&self, notes_ref: &str, object: &str, content: &str) -> Result<()> {
        self.git
            .output_with_stdin(
                &["notes", "--ref", notes_ref, "add", "-f", "-F", "-", object],
                content,
            )
            .map(|_| ())
            .with_context(|| format!("failed to write note on {object} under {notes_ref}"))
    }

    fn list_notes(&self, notes_ref: &str) -> Result<Vec<String>> {
        let outcome = self.git.attempt(&["notes", "--ref", notes_ref, "list"])?;
        if !outcome.success {
            return Ok(Vec::new());
        }
        Ok(outcome
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .map(str::to_string)
            .collect())
    }

    fn isolated_checkout(
        &self,
        key: &str,
        base: &str,
        allow_resume: bool,
    ) -> Result<GitCheckout> {
        let path = self.isolated_path(key);
        if path.exists() {
            let mut checkout = GitCheckout {
                git: Git::new(&path),
            };
            if is_mid_merge(&checkout.git)? {
                if allow_resume {
                    return Ok(checkout);
                }
                return Err(MergeInProgress {
                    path: path.display().to_string(),
                }
                .into());
            }
            if checkout.reset(base).is_ok() {
                return Ok(checkout);
            }
            if let Err(err) = self
                .git
                .run(&["worktree", "remove", "--force", path_arg(&path)?])
            {
                output::detail(&format!(
                    "failed to remove stale checkout {}: {err:#}",
                    path.display()
                ));
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        self.git
            .run(&["worktree", "add", "--detach", path_arg(&path)?, base])
            .with_context(|| format!("failed to create isolated checkout at {}", path.display()))?;
        let mut checkout = GitCheckout {
            git: Git::new(&path),
        };
        checkout.reset(base)?;
        Ok(checkout)
    }
}

// ---------------------------------------------------------------------------
// GitCheckout
// ---------------------------------------------------------------------------

/// A linked git worktree under `.jul/agent-workspace/`.
#[derive(Debug, Clone)]
pub struct GitCheckout {
    git: Git,
}

impl GitCheckout {
    pub fn path(&self) -> &Path {
        self.git.dir()
    }

    fn conflicted_paths(&self) -> Vec<String> {
        self.git
            .output(&["diff", "--name-only", "--diff-filter=U"])
            .map(|out| {
                out.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Checkout for GitCheckout {
    fn head(&self) -> Result<String> {
        self.git.output(&["rev-parse", "HEAD"])
    }

    fn cherry_pick(&mut self, commit: &str) -> Result<PickOutcome> {
        let outcome = self.git.attempt(&["cherry-pick", "--no-commit", commit])?;
        if outcome.success {
            let unchanged = self.git.succeeds(&["diff", "--cached", "--quiet", "HEAD"])?;
            return Ok(if unchanged {
                PickOutcome::Empty
            } else {
                PickOutcome::Applied
            });
        }

        let text = format!("{}\n{}", outcome.stdout, outcome.stderr).to_lowercase();
        if EMPTY_PICK_MARKERS.iter().any(|m| text.contains(m)) {
            let _ = self.git.attempt(&["cherry-pick", "--skip"]);
            return Ok(PickOutcome::Empty);
        }

        let conflicts = self.conflicted_paths();
        if !self.git.attempt(&["cherry-pick", "--abort"])?.success {
            self.git
                .run(&["reset", "--hard", "HEAD"])
                .context("failed to clean isolated checkout after aborted cherry-pick")?;
        }
        if conflicts.is_empty() {
            bail!("cherry-pick of {commit} failed: {}", outcome.stderr.trim());
        }
        Ok(PickOutcome::Conflict(conflicts))
    }

    fn write_tree(&mut self) -> Result<String> {
        self.git.output(&["write-tree"])
    }

    fn commit(&mut self, message: &str) -> Result<String> {
        self.git
            .output_with_stdin(
                &["commit", "--quiet", "--no-verify", "--allow-empty", "-F", "-"],
                message,
            )
            .context("failed to commit in isolated checkout")?;
        self.head()
    }

    fn reset(&mut self, commit: &str) -> Result<()> {
        self.git
            .run(&["reset", "--quiet", "--hard", commit])
            .with_context(|| format!("failed to reset isolated checkout to {commit}"))?;
        self.git.run(&["clean", "-fd"])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
