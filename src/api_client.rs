//! HTTP client for the jul bookkeeping server.
//!
//! A thin wrapper around `reqwest::blocking::Client`. The server is optional:
//! callers treat every failure here as a warning, never as control flow. All
//! methods return `anyhow::Result` and translate HTTP errors into short,
//! user-facing messages.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::notes::Attestation;

// ---------------------------------------------------------------------------
// Endpoint path constants
// ---------------------------------------------------------------------------

const SYNC_PATH: &str = "/api/v1/sync";
const COMMITS_PATH: &str = "/api/v1/commits";
const WORKSPACES_PATH: &str = "/api/v1/workspaces";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Request DTOs
// ---------------------------------------------------------------------------

/// Request body for `POST /api/v1/sync`.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SyncPayload {
    pub workspace_id: String,
    pub repo: String,
    pub branch: String,
    pub commit_sha: String,
    pub change_id: String,
    pub message: String,
    pub author: String,
    /// RFC 3339.
    pub committed_at: String,
}

/// Request body for `POST /api/v1/workspaces/{id}/promote`.
#[derive(Serialize)]
struct PromoteRequest<'a> {
    target_branch: &'a str,
    commit_sha: &'a str,
    force: bool,
}

// ---------------------------------------------------------------------------
// Response DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ServerWorkspace {
    pub workspace_id: String,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub last_commit_sha: Option<String>,
    #[serde(default)]
    pub last_change_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ServerRevision {
    #[serde(default)]
    pub rev_index: u32,
    pub commit_sha: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ServerChange {
    pub change_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub latest_revision: Option<ServerRevision>,
    #[serde(default)]
    pub revision_count: u32,
}

/// Response from `POST /api/v1/sync`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct SyncResponse {
    pub workspace: ServerWorkspace,
    pub change: ServerChange,
    pub revision: ServerRevision,
}

/// Standard API response envelope used by current backend endpoints.
#[derive(Debug, Deserialize)]
struct ApiResponseEnvelope<T> {
    data: T,
}

// ---------------------------------------------------------------------------
// ApiClient
// ---------------------------------------------------------------------------

/// HTTP client for the jul server.
///
/// The Bearer token is optional; it is attached to every request when set.
pub struct ApiClient {
    client: reqwest::blocking::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client.
    ///
    /// `base_url` is trimmed and stripped of trailing slashes so endpoint
    /// paths join without double slashes.
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        let normalized = base_url.trim().trim_end_matches('/').to_string();
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            client,
            base_url: normalized,
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    // -----------------------------------------------------------------------
    // Public endpoint methods
    // -----------------------------------------------------------------------

    /// Report a draft or checkpoint to the server.
    pub fn sync(&self, payload: &SyncPayload) -> Result<SyncResponse> {
        let url = self.url(SYNC_PATH);
        let resp = self
            .request(reqwest::Method::POST, &url)
            .json(payload)
            .send()
            .with_context(|| format!("failed to connect to server at {url}"))?;

        let body = map_http_error(resp)?;
        parse_response_payload(&body, "failed to parse sync response")
    }

    /// Attach an attestation to a commit.
    pub fn post_attestation(&self, attestation: &Attestation) -> Result<Attestation> {
        let url = self.url(&format!(
            "{COMMITS_PATH}/{}/attestation",
            attestation.commit_sha
        ));
        let resp = self
            .request(reqwest::Method::POST, &url)
            .json(attestation)
            .send()
            .with_context(|| format!("failed to connect to server at {url}"))?;

        let body = map_http_error(resp)?;
        parse_response_payload(&body, "failed to parse attestation response")
    }

    /// Ask the server to promote `commit_sha` of a workspace onto `target_branch`.
    pub fn promote(
        &self,
        workspace_id: &str,
        target_branch: &str,
        commit_sha: &str,
        force: bool,
    ) -> Result<()> {
        let url = self.url(&format!("{WORKSPACES_PATH}/{workspace_id}/promote"));
        let payload = PromoteRequest {
            target_branch,
            commit_sha,
            force,
        };
        let resp = self
            .request(reqwest::Method::POST, &url)
            .json(&payload)
            .send()
            .with_context(|| format!("failed to connect to server at {url}"))?;

        map_http_error(resp)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Build a full URL by joining the base URL with an endpoint path.
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::blocking::RequestBuilder {
        let builder = self.client.request(method, url);
        match self.token.as_deref() {
            Some(token) => builder.header("Authorization", format!("Bearer {token}")),
            None => builder,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP error mapping
// ---------------------------------------------------------------------------

/// Read a response body and return it as a string, or map non-success status
/// codes to user-friendly error messages.
fn map_http_error(resp: reqwest::blocking::Response) -> Result<String> {
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    if status.is_success() {
        return Ok(body);
    }

    match status.as_u16() {
        401 | 403 => anyhow::bail!("Not authenticated. Set `token` under [server] in your jul config."),
        400 => {
            let detail = extract_error_message(&body);
            anyhow::bail!("Bad request: {detail}");
        }
        404 => {
            let detail = extract_error_message(&body);
            anyhow::bail!("Not found: {detail}");
        }
        409 => {
            let detail = extract_error_message(&body);
            anyhow::bail!("Conflict: {detail}");
        }
        500..=599 => {
            let detail = extract_error_message(&body);
            anyhow::bail!("Server error: {detail}");
        }
        _ => {
            anyhow::bail!("Unexpected response (HTTP {status}): {body}");
        }
    }
}

/// Parse either an enveloped response (`{"data": ...}`) or a direct payload.
fn parse_response_payload<T>(body: &str, context: &'static str) -> Result<T>
where
    T: DeserializeOwned,
{
    if let Ok(enveloped) = serde_json::from_str::<ApiResponseEnvelope<T>>(body) {
        return Ok(enveloped.data);
    }

    serde_json::from_str::<T>(body).context(context)
}

/// Try to extract a `message` or `error` field from a JSON error body.
/// Falls back to the raw body (truncated) if parsing fails.
fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body)
        && let Some(msg) = value.get("message").or(value.get("error"))
        && let Some(s) = msg.as_str()
    {
        return s.to_string();
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "no details provided".to_string();
    }

    if trimmed.len() > 200 {
        let mut end = 200;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &trimmed[..end])
    } else {
        trimmed.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
