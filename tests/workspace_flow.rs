//! Integration tests for the draft, checkpoint and restack flow across devices.
//!
//! Every device is a `MemoryEngine` sibling registered against one shared
//! `MemoryRemote`, so the whole multi-device protocol runs in-process.

use jul_cli::change_id::extract_change_id;
use jul_cli::checkpoint::{self, CheckpointError, CheckpointOptions};
use jul_cli::config::TraceSettings;
use jul_cli::engine::Engine;
use jul_cli::engine::memory::{MemoryEngine, MemoryRemote};
use jul_cli::refs;
use jul_cli::restack::{self, RestackError, RestackOptions};
use jul_cli::sync::{self, Divergence, SyncOptions};
use jul_cli::workspace::Workspace;
use tempfile::TempDir;

struct Device {
    engine: MemoryEngine,
    ws: Workspace,
    _dir: TempDir,
}

fn device(engine: MemoryEngine, name: &str) -> Device {
    let dir = TempDir::new().unwrap();
    let ws = Workspace::new("alice", "@", name, dir.path().join(".jul"));
    Device {
        engine,
        ws,
        _dir: dir,
    }
}

/// A laptop with one commit on `HEAD` and a desktop clone of the same repo.
fn two_devices(remote: &MemoryRemote) -> (Device, Device, String) {
    let laptop = MemoryEngine::new();
    laptop.add_remote("origin", remote);
    laptop.write_file("README.md", "hello\n");
    let initial = laptop.commit_all("initial").unwrap();
    let desktop = laptop.sibling();
    (device(laptop, "laptop"), device(desktop, "desktop"), initial)
}

fn checkpoint_opts(message: &str) -> CheckpointOptions {
    CheckpointOptions {
        message: message.to_string(),
        start_new_change: false,
    }
}

#[test]
fn devices_hand_off_the_shared_workspace() {
    let remote = MemoryRemote::new();
    let (laptop, desktop, initial) = two_devices(&remote);
    let opts = SyncOptions::default();

    laptop.engine.write_file("notes.txt", "from laptop\n");
    let first = sync::sync(&laptop.engine, &laptop.ws, &opts).unwrap();
    assert!(first.workspace_pushed);
    assert_eq!(
        remote.tip(&laptop.ws.workspace_ref()),
        Some(first.draft_sha.clone())
    );

    let adopted = sync::checkout_workspace(&desktop.engine, &desktop.ws, Some("origin")).unwrap();
    assert_eq!(adopted, first.draft_sha);
    assert_eq!(
        desktop.engine.worktree_file("notes.txt"),
        Some(b"from laptop\n".to_vec())
    );

    desktop.engine.write_file("notes.txt", "from desktop\n");
    let second = sync::sync(&desktop.engine, &desktop.ws, &opts).unwrap();
    assert!(!second.diverged());
    assert_eq!(second.change_id, first.change_id);
    // The adopted draft is unwrapped, so drafts never stack on drafts.
    assert_eq!(
        desktop.engine.commit_info(&second.draft_sha).unwrap().parents,
        vec![initial]
    );
    assert_eq!(
        remote.tip(&desktop.ws.workspace_ref()),
        Some(second.draft_sha.clone())
    );

    // The laptop still holds the old lease and must not clobber the desktop.
    laptop.engine.write_file("notes.txt", "laptop again\n");
    let stale = sync::sync(&laptop.engine, &laptop.ws, &opts).unwrap();
    match &stale.divergence {
        Some(Divergence::LeaseMismatch { lease, remote_tip }) => {
            assert_eq!(lease, &first.draft_sha);
            assert_eq!(remote_tip, &second.draft_sha);
        }
        other => panic!("expected lease mismatch, got {other:?}"),
    }
    assert!(!stale.workspace_updated);
    assert!(stale.draft_pushed);
    assert_eq!(
        remote.tip(&laptop.ws.workspace_ref()),
        Some(second.draft_sha.clone())
    );
    assert_eq!(
        remote.tip(&laptop.ws.sync_ref()),
        Some(stale.draft_sha.clone())
    );

    // Checking out again resolves the divergence.
    sync::checkout_workspace(&laptop.engine, &laptop.ws, Some("origin")).unwrap();
    laptop.engine.write_file("notes.txt", "merged by hand\n");
    let resumed = sync::sync(&laptop.engine, &laptop.ws, &opts).unwrap();
    assert!(!resumed.diverged());
    assert_eq!(
        remote.tip(&laptop.ws.workspace_ref()),
        Some(resumed.draft_sha)
    );
}

#[test]
fn checkpoint_on_fresh_device_requires_checkout() {
    let remote = MemoryRemote::new();
    let (laptop, desktop, _) = two_devices(&remote);
    sync::sync(&laptop.engine, &laptop.ws, &SyncOptions::default()).unwrap();

    desktop.engine.write_file("scratch.txt", "wip\n");
    let err = checkpoint::checkpoint(
        &desktop.engine,
        &desktop.ws,
        &TraceSettings::default(),
        &SyncOptions::default(),
        &checkpoint_opts("too early"),
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CheckpointError>(),
        Some(CheckpointError::LeaseMissing { .. })
    ));
}

#[test]
fn restacked_change_is_visible_to_other_devices() {
    let remote = MemoryRemote::new();
    let (laptop, desktop, initial) = two_devices(&remote);

    laptop.engine.write_file("feature.txt", "v1\n");
    let cp = checkpoint::checkpoint(
        &laptop.engine,
        &laptop.ws,
        &TraceSettings::default(),
        &SyncOptions::default(),
        &checkpoint_opts("add feature"),
    )
    .unwrap();
    assert!(cp.pushed);
    assert_eq!(remote.tip(&cp.keep_ref), Some(cp.checkpoint_sha.clone()));
    assert_eq!(
        remote.tip(&refs::anchor_ref(&cp.change_id)),
        Some(cp.checkpoint_sha.clone())
    );

    // Upstream moves on `main`.
    let upstream = laptop.engine.sibling();
    upstream.reset_working_tree(&initial).unwrap();
    upstream.write_file("UPSTREAM.md", "news\n");
    let tree = upstream.snapshot_tree().unwrap();
    let main = laptop
        .engine
        .commit_tree(&tree, &[initial], "upstream")
        .unwrap();
    laptop.engine.update_ref("refs/heads/main", &main).unwrap();

    let result = restack::restack(
        &laptop.engine,
        &laptop.ws,
        &RestackOptions {
            base_ref: "main".to_string(),
            ..RestackOptions::default()
        },
    )
    .unwrap();
    assert!(result.pushed);
    assert_eq!(result.checkpoints.len(), 1);
    let rebuilt = result.new_parent().unwrap().to_string();
    let info = laptop.engine.commit_info(&rebuilt).unwrap();
    assert_eq!(info.parents, vec![main]);
    assert_eq!(extract_change_id(&info.message), Some(cp.change_id.clone()));
    assert_eq!(
        remote.tip(&refs::change_ref(&cp.change_id)),
        Some(rebuilt.clone())
    );
    // The anchor still names the first checkpoint ever made for the change.
    assert_eq!(
        remote.tip(&refs::anchor_ref(&cp.change_id)),
        Some(cp.checkpoint_sha.clone())
    );

    let adopted = sync::checkout_workspace(&desktop.engine, &desktop.ws, Some("origin")).unwrap();
    assert_eq!(adopted, result.draft_sha);
    assert_eq!(
        desktop.engine.worktree_file("UPSTREAM.md"),
        Some(b"news\n".to_vec())
    );
    assert_eq!(
        desktop.engine.worktree_file("feature.txt"),
        Some(b"v1\n".to_vec())
    );

    let next = sync::sync(&desktop.engine, &desktop.ws, &SyncOptions::default()).unwrap();
    assert!(!next.diverged());
    assert_eq!(next.change_id, cp.change_id);
}

#[test]
fn restack_refuses_unsaved_work() {
    let remote = MemoryRemote::new();
    let (laptop, _desktop, initial) = two_devices(&remote);

    laptop.engine.write_file("feature.txt", "v1\n");
    checkpoint::checkpoint(
        &laptop.engine,
        &laptop.ws,
        &TraceSettings::default(),
        &SyncOptions::default(),
        &checkpoint_opts("add feature"),
    )
    .unwrap();
    laptop.engine.update_ref("refs/heads/main", &initial).unwrap();

    laptop.engine.write_file("feature.txt", "v2, not checkpointed\n");
    sync::sync(&laptop.engine, &laptop.ws, &SyncOptions::default()).unwrap();

    let err = restack::restack(
        &laptop.engine,
        &laptop.ws,
        &RestackOptions {
            base_ref: "main".to_string(),
            ..RestackOptions::default()
        },
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RestackError>(),
        Some(RestackError::UncheckpointedChanges { .. })
    ));
    assert_eq!(
        laptop.engine.worktree_file("feature.txt"),
        Some(b"v2, not checkpointed\n".to_vec())
    );
}
