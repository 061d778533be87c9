//! Paths the secret gate never scans.
//!
//! A built-in list covers the tool's own state directory and common credential
//! files; users append glob patterns, one per line, in `.jul/syncignore`.
//! Blank lines and `#` comments are skipped.

use anyhow::{Context, Result};
use std::path::Path;

/// Always-ignored patterns.
pub const DEFAULT_PATTERNS: &[&str] = &[
    ".jul/",
    ".env",
    ".env.*",
    "*.pem",
    "*.key",
    "id_rsa",
    ".aws/credentials",
    ".npmrc",
    ".pypirc",
    ".netrc",
];

/// File name of the user list inside the state directory.
pub const SYNCIGNORE_FILE: &str = "syncignore";

#[derive(Debug, Clone)]
enum Rule {
    /// `dir/` matches the directory itself and everything below it.
    Dir(String),
    /// A pattern containing `/` is matched against the full path.
    FullPath(glob::Pattern),
    /// Any other pattern is matched against the file name only.
    BaseName(glob::Pattern),
}

/// Compiled ignore list.
#[derive(Debug, Clone)]
pub struct SyncIgnore {
    rules: Vec<Rule>,
}

impl Default for SyncIgnore {
    fn default() -> Self {
        Self::from_patterns(DEFAULT_PATTERNS.iter().copied())
    }
}

impl SyncIgnore {
    /// Defaults plus the user's `syncignore` file under `state_dir`, if any.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(SYNCIGNORE_FILE);
        let user = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        Ok(Self::from_patterns(
            DEFAULT_PATTERNS.iter().copied().chain(user.lines()),
        ))
    }

    /// Compile patterns. Malformed globs are skipped rather than failing the gate.
    pub fn from_patterns<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Self {
        let rules = patterns
            .into_iter()
            .map(str::trim)
            .filter(|p| !p.is_empty() && !p.starts_with('#'))
            .filter_map(|p| {
                let p = p.replace('\\', "/");
                if let Some(dir) = p.strip_suffix('/') {
                    return Some(Rule::Dir(dir.to_string()));
                }
                let pattern = glob::Pattern::new(&p).ok()?;
                if p.contains('/') {
                    Some(Rule::FullPath(pattern))
                } else {
                    Some(Rule::BaseName(pattern))
                }
            })
            .collect();
        Self { rules }
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        let path = path.trim().replace('\\', "/");
        if path.is_empty() {
            return false;
        }
        let base = path.rsplit('/').next().unwrap_or(&path);
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        self.rules.iter().any(|rule| match rule {
            Rule::Dir(dir) => path == *dir || path.starts_with(&format!("{dir}/")),
            Rule::FullPath(pattern) => pattern.matches_with(&path, options),
            Rule::BaseName(pattern) => pattern.matches_with(base, options),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
