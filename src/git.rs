//! Git process helpers.
//!
//! All functions shell out to `git -C <dir>` via `std::process::Command`.
//! Higher layers never build `Command`s themselves.

use anyhow::{Context, Result, bail};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Captured result of a git invocation that is allowed to fail.
#[derive(Debug, Clone)]
pub struct GitOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// A git working directory that commands run against.
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
}

impl Git {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Locate the top level of the repository containing `start`.
    pub fn discover(start: &Path) -> Result<Self> {
        let root = Self::new(start)
            .output(&["rev-parse", "--show-toplevel"])
            .with_context(|| format!("{} is not inside a git repository", start.display()))?;
        Ok(Self::new(root))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn command(&self, args: &[&str], env: &[(&str, &str)]) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.dir).args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Run a git command and return its stdout as a trimmed `String`.
    /// Returns an error if the command exits with a non-zero status.
    pub fn output(&self, args: &[&str]) -> Result<String> {
        Ok(self.output_env(args, &[])?.trim().to_string())
    }

    /// Like [`Git::output`] with extra environment and untrimmed stdout.
    pub fn output_env(&self, args: &[&str], env: &[(&str, &str)]) -> Result<String> {
        let outcome = self.attempt_env(args, env)?;
        if !outcome.success {
            bail!("git {} failed: {}", args.join(" "), outcome.stderr.trim());
        }
        Ok(outcome.stdout)
    }

    /// Run a git command and discard its output.
    pub fn run(&self, args: &[&str]) -> Result<()> {
        self.output_env(args, &[]).map(|_| ())
    }

    /// Run a git command and return whether it succeeded (exit code 0).
    /// Does not treat non-zero exit as an error; returns `false` instead.
    pub fn succeeds(&self, args: &[&str]) -> Result<bool> {
        let status = self
            .command(args, &[])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("failed to execute git")?;
        Ok(status.success())
    }

    /// Run a git command whose failure the caller wants to inspect.
    pub fn attempt(&self, args: &[&str]) -> Result<GitOutcome> {
        self.attempt_env(args, &[])
    }

    fn attempt_env(&self, args: &[&str], env: &[(&str, &str)]) -> Result<GitOutcome> {
        let output = self
            .command(args, env)
            .output()
            .context("failed to execute git")?;
        Ok(GitOutcome {
            success: output.status.success(),
            stdout: String::from_utf8(output.stdout).context("git output was not valid UTF-8")?,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run a git command with `input` piped to stdin; returns trimmed stdout.
    pub fn output_with_stdin(&self, args: &[&str], input: &str) -> Result<String> {
        let mut child = self
            .command(args, &[])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to execute git")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .with_context(|| format!("failed to write stdin for git {}", args.join(" ")))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for git {}", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        let stdout = String::from_utf8(output.stdout).context("git output was not valid UTF-8")?;
        Ok(stdout.trim().to_string())
    }

    /// Raw stdout of a command, or `None` when it exits non-zero.
    pub fn bytes_if_ok(&self, args: &[&str]) -> Result<Option<Vec<u8>>> {
        let output = self
            .command(args, &[])
            .stderr(Stdio::null())
            .output()
            .context("failed to execute git")?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(output.stdout))
    }

    /// Read a git config value. Returns `Ok(None)` if the key is not set.
    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let outcome = self.attempt(&["config", "--get", key])?;
        if !outcome.success {
            // Exit code 1 means the key is not set; that is not an error.
            return Ok(None);
        }
        let value = outcome.stdout.trim();
        if value.is_empty() {
            return Ok(None);
        }
        Ok(Some(value.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
