//! Draft synthesis.
//!
//! A draft is a commit whose tree snapshots the whole working tree minus the
//! `.jul/` state directory. The git implementation stages into a private index
//! (`.jul/draft-index`) so the user's real index is never touched; later calls
//! only re-add paths that `git status` reports as changed.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;

use crate::change_id::{ChangeId, draft_message};
use crate::engine::Engine;
use crate::git::Git;

/// File name of the scratch index inside the state directory.
const DRAFT_INDEX_FILE: &str = "draft-index";

/// Exclude pattern for the tool's own state directory.
pub const STATE_DIR_PATTERN: &str = ".jul/";

// ---------------------------------------------------------------------------
// Tree synthesis (git)
// ---------------------------------------------------------------------------

/// Write the working tree into the scratch index and return its tree id.
pub fn draft_tree(git: &Git, state_dir: &Path) -> Result<String> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create {}", state_dir.display()))?;
    let index_path = state_dir.join(DRAFT_INDEX_FILE);
    let index = index_path
        .to_str()
        .context("draft index path is not valid UTF-8")?;

    let mut excludes = tempfile::Builder::new()
        .prefix("jul-exclude-")
        .tempfile()
        .context("failed to create temporary excludes file")?;
    writeln!(excludes, "{STATE_DIR_PATTERN}").context("failed to write excludes file")?;
    let excludes_arg = format!(
        "core.excludesfile={}",
        excludes
            .path()
            .to_str()
            .context("excludes path is not valid UTF-8")?
    );

    let env = [("GIT_INDEX_FILE", index)];
    let incremental_ok = index_path.exists() && update_incremental(git, &env, &excludes_arg).is_ok();
    if !incremental_ok {
        git.output_env(&["-c", &excludes_arg, "add", "-A", "--", "."], &env)
            .context("failed to stage working tree into draft index")?;
    }

    let tree = git
        .output_env(&["write-tree"], &env)
        .context("failed to write draft tree")?;
    Ok(tree.trim().to_string())
}

fn update_incremental(git: &Git, env: &[(&str, &str)], excludes_arg: &str) -> Result<()> {
    let status = git.output_env(
        &["-c", excludes_arg, "status", "--porcelain", "-z", "-unormal"],
        env,
    )?;
    let paths = changed_paths_from_status(&status);
    if paths.is_empty() {
        return Ok(());
    }
    let mut args = vec!["-c", excludes_arg, "add", "-A", "--"];
    args.extend(paths.iter().map(String::as_str));
    git.output_env(&args, env)?;
    Ok(())
}

/// Collect every path named in `git status --porcelain -z` output.
///
/// Rename and copy entries carry a second NUL-separated path (the source);
/// both sides are returned so the scratch index drops the old path too.
pub fn changed_paths_from_status(status: &str) -> Vec<String> {
    let mut paths = std::collections::BTreeSet::new();
    let mut expect_source = false;
    for entry in status.split('\0') {
        if entry.is_empty() {
            continue;
        }
        let path = if expect_source {
            expect_source = false;
            entry
        } else if entry.len() > 3 && entry.as_bytes()[2] == b' ' {
            let code = &entry[..2];
            if code.contains('R') || code.contains('C') {
                expect_source = true;
            }
            &entry[3..]
        } else {
            entry
        };
        if !path.is_empty() {
            paths.insert(path.to_string());
        }
    }
    paths.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Draft commits (any engine)
// ---------------------------------------------------------------------------

/// Commit `tree` as a draft on `parent` (or as a root commit).
pub fn create_draft_commit<E: Engine>(
    engine: &E,
    tree: &str,
    parent: Option<&str>,
    change_id: Option<&ChangeId>,
) -> Result<String> {
    let parents: Vec<String> = parent.map(str::to_string).into_iter().collect();
    engine
        .commit_tree(tree, &parents, &draft_message(change_id))
        .context("failed to create draft commit")
}

/// Reuse `existing` when it already is a draft of `tree` on `parent` carrying
/// the same Change-Id; otherwise create a fresh draft.
pub fn reuse_or_create<E: Engine>(
    engine: &E,
    existing: Option<&str>,
    tree: &str,
    parent: Option<&str>,
    change_id: &ChangeId,
) -> Result<String> {
    if let Some(existing) = existing
        && let Ok(info) = engine.commit_info(existing)
        && info.tree == tree
        && info.first_parent() == parent
        && info.message.trim_end() == draft_message(Some(change_id)).trim_end()
    {
        return Ok(existing.to_string());
    }
    create_draft_commit(engine, tree, parent, Some(change_id))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;
    use crate::git::tests::{init_temp_repo, run_git};

    #[test]
    fn test_status_parsing_handles_renames() {
        let status = "M  src/lib.rs\0R  new.rs\0old.rs\0?? notes.txt\0";
        let paths = changed_paths_from_status(status);
        assert_eq!(paths, vec!["new.rs", "notes.txt", "old.rs", "src/lib.rs"]);
    }

    #[test]
    fn test_status_parsing_keeps_surrounding_spaces() {
        let status = "?? notes.txt \0 M  lead.txt\0";
        let paths = changed_paths_from_status(status);
        assert_eq!(paths, vec![" lead.txt", "notes.txt "]);
    }

    #[test]
    fn test_draft_tree_keeps_names_with_spaces() {
        let dir = init_temp_repo();
        let git = Git::new(dir.path());
        let state = dir.path().join(".jul");
        draft_tree(&git, &state).unwrap();

        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/ lead.txt"), "a").unwrap();
        std::fs::write(dir.path().join("notes.txt "), "b").unwrap();
        let tree = draft_tree(&git, &state).unwrap();

        let listing = run_git(dir.path(), &["ls-tree", "-r", "-z", "--name-only", &tree]);
        let names: Vec<&str> = listing.split('\0').collect();
        assert!(names.contains(&"docs/ lead.txt"), "got {names:?}");
        assert!(names.contains(&"notes.txt "), "got {names:?}");
    }

    #[test]
    fn test_status_parsing_empty() {
        assert!(changed_paths_from_status("").is_empty());
    }

    #[test]
    fn test_draft_tree_is_idempotent_and_excludes_state_dir() {
        let dir = init_temp_repo();
        let git = Git::new(dir.path());
        let state = dir.path().join(".jul");
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join("lease"), "abc\n").unwrap();
        std::fs::write(dir.path().join("work.txt"), "wip").unwrap();

        let first = draft_tree(&git, &state).unwrap();
        let second = draft_tree(&git, &state).unwrap();
        assert_eq!(first, second);

        let listing = run_git(dir.path(), &["ls-tree", "-r", "--name-only", &first]);
        assert!(listing.lines().any(|l| l == "work.txt"));
        assert!(!listing.lines().any(|l| l.starts_with(".jul")));
    }

    #[test]
    fn test_draft_tree_tracks_incremental_changes_without_touching_index() {
        let dir = init_temp_repo();
        let git = Git::new(dir.path());
        let state = dir.path().join(".jul");

        let before = draft_tree(&git, &state).unwrap();
        std::fs::write(dir.path().join("README.md"), "changed").unwrap();
        std::fs::rename(dir.path().join("README.md"), dir.path().join("MOVED.md")).unwrap();
        let after = draft_tree(&git, &state).unwrap();
        assert_ne!(before, after);

        let listing = run_git(dir.path(), &["ls-tree", "-r", "--name-only", &after]);
        assert_eq!(listing, "MOVED.md");

        // The real index still only knows the committed README.
        let staged = run_git(dir.path(), &["diff", "--cached", "--name-only"]);
        assert!(staged.is_empty());
    }

    #[test]
    fn test_reuse_or_create_reuses_matching_draft() {
        let engine = MemoryEngine::new();
        engine.write_file("a.txt", "one");
        let tree = engine.snapshot_tree().unwrap();
        let base = engine.commit_tree(&tree, &[], "base").unwrap();
        let id = ChangeId::generate();

        let first = reuse_or_create(&engine, None, &tree, Some(&base), &id).unwrap();
        let again = reuse_or_create(&engine, Some(&first), &tree, Some(&base), &id).unwrap();
        assert_eq!(first, again);

        engine.write_file("a.txt", "two");
        let new_tree = engine.snapshot_tree().unwrap();
        let changed = reuse_or_create(&engine, Some(&first), &new_tree, Some(&base), &id).unwrap();
        assert_ne!(first, changed);
        let info = engine.commit_info(&changed).unwrap();
        assert_eq!(info.parents, vec![base]);
        assert_eq!(info.message, draft_message(Some(&id)).trim_end());
    }
}
