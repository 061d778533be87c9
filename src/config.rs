//! Layered configuration and device identity.
//!
//! Two TOML files share one schema ([`JulConfig`]): the user file at
//! `$JUL_CONFIG_HOME/config.toml` (default `$HOME/.config/jul/config.toml`)
//! and the repository file at `<root>/.jul/config.toml`. Resolution order,
//! highest first: environment, repository file, user file, built-in defaults.
//!
//! [`Settings`] is the resolved result. It is built once per process and
//! passed explicitly; nothing below `main` reads the environment.

use anyhow::{Context, Result};
use rand08::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::workspace::DEFAULT_WORKSPACE;

/// Environment variable naming the user config directory.
pub const CONFIG_HOME_ENV: &str = "JUL_CONFIG_HOME";
pub const WORKSPACE_ENV: &str = "JUL_WORKSPACE";
pub const REMOTE_ENV: &str = "JUL_REMOTE";
pub const BASE_URL_ENV: &str = "JUL_BASE_URL";
pub const ALLOW_SECRETS_ENV: &str = "JUL_ALLOW_SECRETS";
pub const DEVICE_ID_ENV: &str = "JUL_DEVICE_ID";
pub const VERBOSE_ENV: &str = "JUL_VERBOSE";

/// Config file name, in both the user and the repository directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Device id file inside the user config directory.
const DEVICE_FILE_NAME: &str = "device";

/// User name used when nothing else is available.
const FALLBACK_USER: &str = "user";

// ---------------------------------------------------------------------------
// File schema
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSection {
    pub name: Option<String>,
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceSection {
    /// `name` or `user/name`.
    pub id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSection {
    pub name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSection {
    /// Push the device draft to the remote on every sync.
    pub draft_push: Option<bool>,
    /// Skip the secret gate.
    pub allow_secrets: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TracesSection {
    pub prompt_hash: Option<bool>,
    pub prompt_summary: Option<bool>,
    pub prompt_full: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSection {
    pub url: Option<String>,
    pub token: Option<String>,
}

/// On-disk configuration. Every field is optional so files can be partial.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct JulConfig {
    pub user: UserSection,
    pub workspace: WorkspaceSection,
    pub remote: RemoteSection,
    pub sync: SyncSection,
    pub traces: TracesSection,
    pub server: ServerSection,
}

impl JulConfig {
    /// Load config from a specific path. Returns defaults if the file does not exist.
    ///
    /// Parse errors and I/O errors (other than file-not-found) are surfaced as
    /// hard failures to prevent silently operating on corrupted state.
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .with_context(|| format!("failed to parse config file at {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read config file at {}", path.display()))
            }
        }
    }

    /// Save config to a specific path, creating parent directories if needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory at {}", parent.display())
            })?;
        }
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, &contents)
            .with_context(|| format!("failed to write config file at {}", path.display()))?;
        Ok(())
    }

    /// Overlay `over` on `self`: any field set in `over` wins.
    pub fn overlay(self, over: JulConfig) -> JulConfig {
        JulConfig {
            user: UserSection {
                name: over.user.name.or(self.user.name),
                namespace: over.user.namespace.or(self.user.namespace),
            },
            workspace: WorkspaceSection {
                id: over.workspace.id.or(self.workspace.id),
            },
            remote: RemoteSection {
                name: over.remote.name.or(self.remote.name),
            },
            sync: SyncSection {
                draft_push: over.sync.draft_push.or(self.sync.draft_push),
                allow_secrets: over.sync.allow_secrets.or(self.sync.allow_secrets),
            },
            traces: TracesSection {
                prompt_hash: over.traces.prompt_hash.or(self.traces.prompt_hash),
                prompt_summary: over.traces.prompt_summary.or(self.traces.prompt_summary),
                prompt_full: over.traces.prompt_full.or(self.traces.prompt_full),
            },
            server: ServerSection {
                url: over.server.url.or(self.server.url),
                token: over.server.token.or(self.server.token),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Values read from the process environment, captured once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub config_home: Option<String>,
    pub home: Option<String>,
    pub workspace: Option<String>,
    pub remote: Option<String>,
    pub base_url: Option<String>,
    pub allow_secrets: Option<bool>,
    pub device_id: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let var = |key: &str| non_empty_trimmed(std::env::var(key).ok());
        Self {
            config_home: var(CONFIG_HOME_ENV),
            home: var("HOME"),
            workspace: var(WORKSPACE_ENV),
            remote: var(REMOTE_ENV),
            base_url: var(BASE_URL_ENV),
            allow_secrets: var(ALLOW_SECRETS_ENV).map(|v| parse_bool(&v)),
            device_id: var(DEVICE_ID_ENV),
        }
    }

    /// User config directory: `$JUL_CONFIG_HOME`, else `$HOME/.config/jul`.
    pub fn config_home(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.config_home {
            return Some(PathBuf::from(dir));
        }
        self.home
            .as_ref()
            .map(|home| Path::new(home).join(".config").join("jul"))
    }
}

/// Whether verbose output was requested through the environment.
pub fn verbose_from_env() -> bool {
    non_empty_trimmed(std::env::var(VERBOSE_ENV).ok()).is_some_and(|v| parse_bool(&v))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// ---------------------------------------------------------------------------
// Resolved settings
// ---------------------------------------------------------------------------

/// Which prompt details trace notes may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceSettings {
    pub prompt_hash: bool,
    pub prompt_summary: bool,
    pub prompt_full: bool,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            prompt_hash: true,
            prompt_summary: false,
            prompt_full: false,
        }
    }
}

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub user: String,
    pub workspace: String,
    pub device: String,
    pub remote: Option<String>,
    pub draft_push: bool,
    pub allow_secrets: bool,
    pub traces: TraceSettings,
    pub server_url: Option<String>,
    pub server_token: Option<String>,
}

impl Settings {
    /// Read both config files, the device identity and `git config user.name`.
    pub fn load(repo_root: &Path, git_user_name: Option<String>) -> Result<Self> {
        let env = EnvOverrides::from_env();
        let user_file = match env.config_home() {
            Some(dir) => JulConfig::load_from(&dir.join(CONFIG_FILE_NAME))?,
            None => JulConfig::default(),
        };
        let repo_file = JulConfig::load_from(
            &repo_root
                .join(crate::engine::cli::STATE_DIR_NAME)
                .join(CONFIG_FILE_NAME),
        )?;
        let device = match (&env.device_id, env.config_home()) {
            (Some(id), _) => id.clone(),
            (None, Some(dir)) => device_id(&dir)?,
            (None, None) => generate_device_id(),
        };
        Ok(Self::resolve(&env, user_file.overlay(repo_file), git_user_name, device))
    }

    /// Combine already-loaded layers.
    pub fn resolve(
        env: &EnvOverrides,
        files: JulConfig,
        git_user_name: Option<String>,
        device: String,
    ) -> Self {
        let workspace_id = env.workspace.clone().or(non_empty_trimmed(files.workspace.id));
        let (explicit_user, workspace) = match workspace_id.as_deref().map(str::trim) {
            Some(id) => match id.split_once('/') {
                Some((user, name)) => (non_empty_trimmed(Some(user.to_string())), name.to_string()),
                None => (None, id.to_string()),
            },
            None => (None, String::new()),
        };
        let workspace = if workspace.trim().is_empty() {
            DEFAULT_WORKSPACE.to_string()
        } else {
            workspace.trim().to_string()
        };

        let user = explicit_user
            .or_else(|| non_empty_trimmed(files.user.namespace.clone()))
            .or_else(|| files.user.name.as_deref().map(slug).filter(|s| !s.is_empty()))
            .or_else(|| git_user_name.as_deref().map(slug).filter(|s| !s.is_empty()))
            .unwrap_or_else(|| FALLBACK_USER.to_string());

        let defaults = TraceSettings::default();
        Self {
            user,
            workspace,
            device,
            remote: env.remote.clone().or(non_empty_trimmed(files.remote.name)),
            draft_push: files.sync.draft_push.unwrap_or(true),
            allow_secrets: env
                .allow_secrets
                .or(files.sync.allow_secrets)
                .unwrap_or(false),
            traces: TraceSettings {
                prompt_hash: files.traces.prompt_hash.unwrap_or(defaults.prompt_hash),
                prompt_summary: files.traces.prompt_summary.unwrap_or(defaults.prompt_summary),
                prompt_full: files.traces.prompt_full.unwrap_or(defaults.prompt_full),
            },
            server_url: env
                .base_url
                .clone()
                .or(non_empty_trimmed(files.server.url))
                .map(|url| url.trim_end_matches('/').to_string()),
            server_token: non_empty_trimmed(files.server.token),
        }
    }
}

// ---------------------------------------------------------------------------
// Device identity
// ---------------------------------------------------------------------------

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brave", "calm", "clever", "crisp", "eager", "fancy", "gentle", "happy",
    "jolly", "keen", "lucky", "mellow", "nimble", "proud", "quick", "quiet", "rapid", "shy",
    "silent", "sunny", "swift", "tidy", "vivid", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "bison", "crane", "falcon", "ferret", "gecko", "heron", "ibis", "koala", "lynx",
    "marten", "moose", "newt", "otter", "owl", "panda", "puffin", "quail", "raven", "salmon",
    "tapir", "toad", "walrus", "wombat", "yak", "zebra",
];

/// Read the device id stored under `config_home`, creating it on first use.
pub fn device_id(config_home: &Path) -> Result<String> {
    let path = config_home.join(DEVICE_FILE_NAME);
    match std::fs::read_to_string(&path) {
        Ok(contents) if !contents.trim().is_empty() => return Ok(contents.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read device id at {}", path.display()));
        }
    }
    let id = generate_device_id();
    std::fs::create_dir_all(config_home).with_context(|| {
        format!("failed to create config directory at {}", config_home.display())
    })?;
    std::fs::write(&path, format!("{id}\n"))
        .with_context(|| format!("failed to write device id at {}", path.display()))?;
    Ok(id)
}

/// Random `adjective-noun` id.
pub fn generate_device_id() -> String {
    let mut rng = rand08::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("otter");
    format!("{adjective}-{noun}")
}

/// Lowercase ASCII alphanumerics joined by single dashes.
pub fn slug(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

/// Return the trimmed value if non-empty after trimming, otherwise `None`.
fn non_empty_trimmed(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
