//! Ref naming and on-disk ref resolution.
//!
//! Every ref family lives under `refs/jul/`. The fast path reads loose refs,
//! `packed-refs` and `HEAD` directly from the git directory; callers fall back
//! to `git rev-parse` / `git for-each-ref` whenever it reports `None`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::change_id::ChangeId;

const JUL_PREFIX: &str = "refs/jul";

/// Symbolic refs deeper than this are treated as unresolvable.
const MAX_SYMREF_DEPTH: usize = 5;

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// Shared workspace tip: `refs/jul/workspaces/<user>/<workspace>`.
pub fn workspace_ref(user: &str, workspace: &str) -> String {
    format!("{JUL_PREFIX}/workspaces/{user}/{workspace}")
}

/// Per-device draft pointer: `refs/jul/sync/<user>/<device>/<workspace>`.
pub fn sync_ref(user: &str, device: &str, workspace: &str) -> String {
    format!("{JUL_PREFIX}/sync/{user}/{device}/{workspace}")
}

/// Prefix of every keep-ref for a workspace, with trailing slash.
pub fn keep_prefix(user: &str, workspace: &str) -> String {
    format!("{JUL_PREFIX}/keep/{user}/{workspace}/")
}

pub fn keep_ref(user: &str, workspace: &str, change_id: &ChangeId, checkpoint: &str) -> String {
    format!("{}{change_id}/{checkpoint}", keep_prefix(user, workspace))
}

pub fn change_ref(change_id: &ChangeId) -> String {
    format!("{JUL_PREFIX}/changes/{change_id}")
}

pub fn anchor_ref(change_id: &ChangeId) -> String {
    format!("{JUL_PREFIX}/anchors/{change_id}")
}

/// Canonical trace lineage: `refs/jul/traces/<user>/<workspace>`.
pub fn trace_ref(user: &str, workspace: &str) -> String {
    format!("{JUL_PREFIX}/traces/{user}/{workspace}")
}

/// Device-local trace tip: `refs/jul/trace-sync/<user>/<device>/<workspace>`.
pub fn trace_sync_ref(user: &str, device: &str, workspace: &str) -> String {
    format!("{JUL_PREFIX}/trace-sync/{user}/{device}/{workspace}")
}

/// A parsed keep-ref name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepRef {
    pub name: String,
    pub change_id: String,
    pub checkpoint: String,
}

/// Split `<prefix><changeId>/<sha>` into its parts. Anything else is `None`.
pub fn parse_keep_ref(prefix: &str, name: &str) -> Option<KeepRef> {
    let rest = name.strip_prefix(prefix)?;
    let (change_id, checkpoint) = rest.split_once('/')?;
    if change_id.is_empty() || checkpoint.is_empty() || checkpoint.contains('/') {
        return None;
    }
    Some(KeepRef {
        name: name.to_string(),
        change_id: change_id.to_string(),
        checkpoint: checkpoint.to_string(),
    })
}

/// Whether a ref name is simple enough for direct on-disk lookup.
///
/// Revision expressions (`..`, `@{`, `^`, `~`, `:`) and anything outside
/// `refs/` other than `HEAD` always go through git.
pub fn is_plain_ref(name: &str) -> bool {
    let name = name.trim();
    if name.is_empty() {
        return false;
    }
    if name != "HEAD" && !name.starts_with("refs/") {
        return false;
    }
    !(name.contains("..") || name.contains("@{") || name.contains(['^', '~', ':']))
}

// ---------------------------------------------------------------------------
// Git directory discovery
// ---------------------------------------------------------------------------

/// Locations of a repository's metadata.
///
/// `git_dir` holds `HEAD`; `common_dir` holds shared refs. They differ only
/// for linked worktrees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitDirs {
    pub git_dir: PathBuf,
    pub common_dir: PathBuf,
}

/// Find the git directory for a worktree root: either a `.git` directory or a
/// `.git` file containing `gitdir: <path>`.
pub fn git_dirs(repo_root: &Path) -> Option<GitDirs> {
    let dot_git = repo_root.join(".git");
    let meta = std::fs::metadata(&dot_git).ok()?;
    let git_dir = if meta.is_dir() {
        dot_git
    } else {
        let contents = std::fs::read_to_string(&dot_git).ok()?;
        let path = contents.trim().strip_prefix("gitdir:")?.trim();
        if path.is_empty() {
            return None;
        }
        let path = PathBuf::from(path);
        if path.is_absolute() {
            path
        } else {
            repo_root.join(path)
        }
    };

    let common_dir = match std::fs::read_to_string(git_dir.join("commondir")) {
        Ok(contents) => {
            let path = PathBuf::from(contents.trim());
            if path.is_absolute() {
                path
            } else {
                git_dir.join(path)
            }
        }
        Err(_) => git_dir.clone(),
    };

    Some(GitDirs {
        git_dir,
        common_dir,
    })
}

// ---------------------------------------------------------------------------
// Fast resolution
// ---------------------------------------------------------------------------

/// Resolve a ref to an object id by reading files under the git directory.
///
/// Follows `ref:` indirections to a concrete id or gives up; it never returns
/// a half-resolved symbolic name.
pub fn resolve_fast(dirs: &GitDirs, name: &str) -> Option<String> {
    if !is_plain_ref(name) {
        return None;
    }
    resolve_at_depth(dirs, name.trim(), 0)
}

fn resolve_at_depth(dirs: &GitDirs, name: &str, depth: usize) -> Option<String> {
    if depth > MAX_SYMREF_DEPTH {
        return None;
    }

    let loose = if name == "HEAD" {
        dirs.git_dir.join("HEAD")
    } else {
        dirs.common_dir.join(name)
    };
    if let Ok(contents) = std::fs::read_to_string(&loose) {
        let line = contents.trim();
        if let Some(target) = line.strip_prefix("ref:") {
            let target = target.trim();
            if target.is_empty() {
                return None;
            }
            return resolve_at_depth(dirs, target, depth + 1);
        }
        if is_object_id(line) {
            return Some(line.to_string());
        }
    }

    if name == "HEAD" {
        return None;
    }
    read_packed_refs(&dirs.common_dir)
        .into_iter()
        .find(|(_, packed)| packed == name)
        .map(|(sha, _)| sha)
}

/// List refs under `prefix` from loose files and `packed-refs`.
///
/// A trailing slash restricts matches to refs strictly below the directory;
/// without one, the prefix itself also matches when it names a ref. The
/// result is sorted and free of duplicates.
pub fn list_fast(dirs: &GitDirs, prefix: &str) -> Option<Vec<String>> {
    let prefix = prefix.trim();
    if !prefix.starts_with("refs/") {
        return None;
    }
    let had_trailing_slash = prefix.ends_with('/');
    let normalized = prefix.trim_end_matches('/');
    if normalized.is_empty() {
        return None;
    }

    let matches = |name: &str| -> bool {
        if !name.starts_with(normalized) {
            return false;
        }
        if !had_trailing_slash {
            return true;
        }
        name.len() > normalized.len() && name.as_bytes()[normalized.len()] == b'/'
    };

    let mut seen = BTreeSet::new();
    let base = dirs.common_dir.join(normalized);
    if base.is_dir() {
        walk_loose(&base, normalized, &mut |name| {
            if matches(&name) {
                seen.insert(name);
            }
        });
    } else if base.is_file() && !had_trailing_slash {
        seen.insert(normalized.to_string());
    }

    for (_, name) in read_packed_refs(&dirs.common_dir) {
        if matches(&name) {
            seen.insert(name);
        }
    }

    Some(seen.into_iter().collect())
}

fn walk_loose(dir: &Path, name_prefix: &str, visit: &mut dyn FnMut(String)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let name = format!("{name_prefix}/{file_name}");
        let path = entry.path();
        if path.is_dir() {
            walk_loose(&path, &name, visit);
        } else if !file_name.ends_with(".lock") {
            visit(name);
        }
    }
}

/// Parse `packed-refs`, skipping comments and peeled (`^`) lines.
fn read_packed_refs(common_dir: &Path) -> Vec<(String, String)> {
    let Ok(contents) = std::fs::read_to_string(common_dir.join("packed-refs")) else {
        return Vec::new();
    };
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('^'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let sha = fields.next()?;
            let name = fields.next()?;
            Some((sha.to_string(), name.to_string()))
        })
        .collect()
}

fn is_object_id(value: &str) -> bool {
    (value.len() == 40 || value.len() == 64) && value.chars().all(|c| c.is_ascii_hexdigit())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
