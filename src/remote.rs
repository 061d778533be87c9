//! Remote selection.
//!
//! Precedence: the configured remote name, then `origin`, then the only
//! remaining remote. Anything else is a [`RemoteProblem`], which callers
//! report but never treat as a failure.

use anyhow::Result;
use std::fmt;

use crate::engine::Engine;

/// Name preferred when nothing is configured.
pub const DEFAULT_REMOTE: &str = "origin";

/// Why no remote was selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteProblem {
    NoRemote,
    MultipleRemotes,
    ConfiguredMissing { name: String },
}

impl fmt::Display for RemoteProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRemote => write!(f, "no remote configured"),
            Self::MultipleRemotes => {
                write!(f, "multiple remotes found; run 'jul remote set <name>'")
            }
            Self::ConfiguredMissing { name } => {
                write!(f, "configured remote not found: {name}")
            }
        }
    }
}

/// Pick the remote to publish to.
///
/// The outer `Result` carries engine failures; the inner one is the
/// selection outcome.
pub fn select<E: Engine>(
    engine: &E,
    configured: Option<&str>,
) -> Result<std::result::Result<String, RemoteProblem>> {
    let remotes = engine.remotes()?;
    if let Some(name) = configured.map(str::trim).filter(|n| !n.is_empty()) {
        if remotes.iter().any(|r| r == name) {
            return Ok(Ok(name.to_string()));
        }
        return Ok(Err(RemoteProblem::ConfiguredMissing {
            name: name.to_string(),
        }));
    }
    if remotes.iter().any(|r| r == DEFAULT_REMOTE) {
        return Ok(Ok(DEFAULT_REMOTE.to_string()));
    }
    match remotes.as_slice() {
        [] => Ok(Err(RemoteProblem::NoRemote)),
        [only] => Ok(Ok(only.clone())),
        _ => Ok(Err(RemoteProblem::MultipleRemotes)),
    }
}
