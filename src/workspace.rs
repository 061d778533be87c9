//! Workspace identity and its local state files.
//!
//! Each workspace keeps two files under `.jul/workspaces/<name>/`:
//! `lease` (the last shared tip this device observed, one sha and a newline)
//! and `config` (TOML anchoring the workspace to an upstream base).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::change_id::ChangeId;
use crate::refs;

/// Workspace name used when none is configured.
pub const DEFAULT_WORKSPACE: &str = "@";

const WORKSPACES_DIR: &str = "workspaces";
const LEASE_FILE: &str = "lease";
const CONFIG_FILE: &str = "config";

/// Branch prefix whose bases are also tracked upstream.
const BRANCH_PREFIX: &str = "refs/heads/";

/// Base a workspace was started from or restacked onto.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_tip: Option<String>,
}

impl WorkspaceConfig {
    /// Config for a base; branch bases are tracked at the same tip.
    pub fn for_base(base_ref: &str, base_sha: &str) -> Self {
        let tracked = base_ref.starts_with(BRANCH_PREFIX);
        Self {
            base_ref: Some(base_ref.to_string()),
            base_sha: Some(base_sha.to_string()),
            track_ref: tracked.then(|| base_ref.to_string()),
            track_tip: tracked.then(|| base_sha.to_string()),
        }
    }
}

/// One `(user, name)` workspace as seen from one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub user: String,
    pub name: String,
    pub device: String,
    state_dir: PathBuf,
}

impl Workspace {
    pub fn new(
        user: impl Into<String>,
        name: impl Into<String>,
        device: impl Into<String>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            user: user.into(),
            name: name.into(),
            device: device.into(),
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// `user/name`, as used in messages and server requests.
    pub fn id(&self) -> String {
        format!("{}/{}", self.user, self.name)
    }

    // -- refs ---------------------------------------------------------------

    pub fn workspace_ref(&self) -> String {
        refs::workspace_ref(&self.user, &self.name)
    }

    pub fn sync_ref(&self) -> String {
        refs::sync_ref(&self.user, &self.device, &self.name)
    }

    pub fn keep_prefix(&self) -> String {
        refs::keep_prefix(&self.user, &self.name)
    }

    pub fn keep_ref(&self, change_id: &ChangeId, checkpoint: &str) -> String {
        refs::keep_ref(&self.user, &self.name, change_id, checkpoint)
    }

    pub fn trace_ref(&self) -> String {
        refs::trace_ref(&self.user, &self.name)
    }

    pub fn trace_sync_ref(&self) -> String {
        refs::trace_sync_ref(&self.user, &self.device, &self.name)
    }

    /// Key of this workspace's isolated restack checkout.
    pub fn checkout_key(&self) -> &str {
        &self.name
    }

    // -- files --------------------------------------------------------------

    fn dir(&self) -> PathBuf {
        self.state_dir.join(WORKSPACES_DIR).join(&self.name)
    }

    pub fn lease_path(&self) -> PathBuf {
        self.dir().join(LEASE_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir().join(CONFIG_FILE)
    }

    /// Cached shared tip, or `None` when no lease has been recorded.
    pub fn read_lease(&self) -> Result<Option<String>> {
        let path = self.lease_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let sha = contents.trim();
                Ok((!sha.is_empty()).then(|| sha.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read lease at {}", path.display())),
        }
    }

    pub fn write_lease(&self, sha: &str) -> Result<()> {
        let path = self.lease_path();
        write_file(&path, &format!("{}\n", sha.trim()))
            .with_context(|| format!("failed to write lease at {}", path.display()))
    }

    /// The workspace config, or `None` if it was never written.
    pub fn read_config(&self) -> Result<Option<WorkspaceConfig>> {
        let path = self.config_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents)
                .map(Some)
                .with_context(|| format!("failed to parse workspace config at {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("failed to read workspace config at {}", path.display())),
        }
    }

    pub fn write_config(&self, config: &WorkspaceConfig) -> Result<()> {
        let path = self.config_path();
        let contents = toml::to_string_pretty(config).context("failed to serialize workspace config")?;
        write_file(&path, &contents)
            .with_context(|| format!("failed to write workspace config at {}", path.display()))
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace(dir: &TempDir) -> Workspace {
        Workspace::new("alice", DEFAULT_WORKSPACE, "brave-otter", dir.path().join(".jul"))
    }

    #[test]
    fn test_ref_names() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        assert_eq!(ws.workspace_ref(), "refs/jul/workspaces/alice/@");
        assert_eq!(ws.sync_ref(), "refs/jul/sync/alice/brave-otter/@");
        assert_eq!(ws.trace_ref(), "refs/jul/traces/alice/@");
        assert_eq!(ws.trace_sync_ref(), "refs/jul/trace-sync/alice/brave-otter/@");
        assert_eq!(ws.keep_prefix(), "refs/jul/keep/alice/@/");
        assert_eq!(ws.id(), "alice/@");
    }

    #[test]
    fn test_lease_roundtrip_and_missing() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        assert_eq!(ws.read_lease().unwrap(), None);

        ws.write_lease("abc123").unwrap();
        assert_eq!(ws.read_lease().unwrap().as_deref(), Some("abc123"));
        let raw = std::fs::read_to_string(ws.lease_path()).unwrap();
        assert_eq!(raw, "abc123\n");
        assert!(ws.lease_path().ends_with(".jul/workspaces/@/lease"));
    }

    #[test]
    fn test_blank_lease_is_missing() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        std::fs::create_dir_all(ws.lease_path().parent().unwrap()).unwrap();
        std::fs::write(ws.lease_path(), "  \n").unwrap();
        assert_eq!(ws.read_lease().unwrap(), None);
    }

    #[test]
    fn test_config_tracks_branch_bases_only() {
        let branch = WorkspaceConfig::for_base("refs/heads/main", "abc");
        assert_eq!(branch.track_ref.as_deref(), Some("refs/heads/main"));
        assert_eq!(branch.track_tip.as_deref(), Some("abc"));

        let tag = WorkspaceConfig::for_base("refs/tags/v1", "abc");
        assert_eq!(tag.track_ref, None);
        assert_eq!(tag.track_tip, None);
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        assert_eq!(ws.read_config().unwrap(), None);

        let config = WorkspaceConfig::for_base("refs/heads/main", "abc");
        ws.write_config(&config).unwrap();
        assert_eq!(ws.read_config().unwrap(), Some(config));
        let raw = std::fs::read_to_string(ws.config_path()).unwrap();
        assert!(raw.contains("base_ref = \"refs/heads/main\""));
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        std::fs::create_dir_all(ws.config_path().parent().unwrap()).unwrap();
        std::fs::write(ws.config_path(), "base_ref = [").unwrap();
        let err = ws.read_config().unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse workspace config"));
    }
}
