//! Remote commit source: the GitHub REST API over a blocking `reqwest` client.
//!
//! Endpoints used:
//! - `GET /repos/{owner}/{repo}/commits?author={login}` (paged, bounded)
//! - `GET /repos/{owner}/{repo}/commits/{sha}` (per-file details)
//! - `GET /users/{login}/repos?type=all` and `GET /repos/{owner}/{repo}` (discovery)
//!
//! Rate-limited responses are retried with a fixed delay. Any other failure is
//! returned immediately; the pipeline decides whether it degrades or skips.

use std::collections::HashSet;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, ClientBuilder};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::{RetryPolicy, Settings};
use crate::{
    CommitObservation, CommitSource, DetailSource, FileChange, RepoKey, RepoTarget, StatsError,
    normalize_timestamp, truncate,
};

const SOURCE_NAME: &str = "remote";

/// GitHub's maximum page size.
pub const PER_PAGE: usize = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest error body echoed into an error message.
const MAX_ERROR_BODY: usize = 200;

// ─── Payloads ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CommitListItem {
    sha: String,
    commit: CommitPayload,
}

#[derive(Debug, Deserialize)]
struct CommitPayload {
    #[serde(default)]
    author: Option<Signature>,
    #[serde(default)]
    committer: Option<Signature>,
}

#[derive(Debug, Deserialize)]
struct Signature {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    #[serde(default)]
    files: Vec<FilePayload>,
}

#[derive(Debug, Deserialize)]
struct FilePayload {
    filename: String,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct RepoPayload {
    full_name: String,
    #[serde(default)]
    fork: bool,
    #[serde(default)]
    source: Option<RepoRef>,
    #[serde(default)]
    parent: Option<RepoRef>,
}

#[derive(Debug, Deserialize)]
struct RepoRef {
    full_name: String,
}

impl CommitListItem {
    /// Authored date, falling back to the committer date. `None` → unusable.
    fn into_observation(self) -> Option<CommitObservation> {
        let date = self
            .commit
            .author
            .as_ref()
            .and_then(|s| s.date.as_deref())
            .or_else(|| self.commit.committer.as_ref().and_then(|s| s.date.as_deref()))
            .map(normalize_timestamp)?;

        let author = self.commit.author.as_ref().and_then(|s| match (&s.name, &s.email) {
            (Some(name), Some(email)) => Some((name.trim().to_string(), email.trim().to_string())),
            _ => None,
        });

        Some(CommitObservation {
            sha: self.sha.trim().to_ascii_lowercase(),
            authored_at: date,
            files: None,
            author,
        })
    }
}

impl From<FilePayload> for FileChange {
    fn from(f: FilePayload) -> Self {
        FileChange {
            filename: f.filename,
            additions: f.additions,
            deletions: f.deletions,
            status: f.status,
        }
    }
}

// ─── Rate limiting ──────────────────────────────────────────────────

/// HTTP 429, or 403 with an exhausted `x-ratelimit-remaining` quota.
pub fn is_rate_limit_response(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    status == StatusCode::FORBIDDEN
        && headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() == "0")
}

/// Run `attempt` until it succeeds, fails with a non-rate-limit error, or the
/// retry budget is spent. Waits `policy.delay` between attempts.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    url: &str,
    mut attempt: impl FnMut() -> Result<T, StatsError>,
) -> Result<T, StatsError> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match attempt() {
            Err(e) if e.is_rate_limited() => {
                if attempts > policy.max_retries {
                    return Err(StatsError::RateLimited {
                        url: url.to_string(),
                        attempts,
                    });
                }
                warn!(
                    url,
                    attempt = attempts,
                    max_retries = policy.max_retries,
                    delay_secs = policy.delay.as_secs(),
                    "Rate limited, waiting before retry"
                );
                std::thread::sleep(policy.delay);
            }
            other => return other,
        }
    }
}

// ─── Client ─────────────────────────────────────────────────────────

/// Client builder with the API headers, user agent and timeout applied.
pub fn client_builder(settings: &Settings) -> Result<ClientBuilder, StatsError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
    if let Some(token) = settings.token.as_deref().filter(|t| !t.trim().is_empty()) {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
            .map_err(|_| StatsError::InvalidArgs("Token contains invalid characters".to_string()))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    } else {
        debug!("No token configured, using unauthenticated rate limit");
    }

    Ok(Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .default_headers(headers)
        .timeout(REQUEST_TIMEOUT))
}

/// GitHub-backed commit source, detail provider and repository discovery.
pub struct GitHubSource {
    client: Client,
    api_url: String,
    login: Option<String>,
    retry: RetryPolicy,
    max_commits: usize,
}

impl GitHubSource {
    pub fn new(settings: &Settings) -> Result<Self, StatsError> {
        let client = client_builder(settings)?.build()?;
        Ok(Self::with_client(client, settings))
    }

    /// Use a prepared client (e.g. one built from [`client_builder`] with extra options).
    pub fn with_client(client: Client, settings: &Settings) -> Self {
        Self {
            client,
            api_url: settings.api_url.trim().trim_end_matches('/').to_string(),
            login: settings.login.clone(),
            retry: settings.retry,
            max_commits: settings.max_remote_commits,
        }
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, StatsError> {
        with_retry(&self.retry, url, || self.get_once(url))
    }

    fn get_once<T: DeserializeOwned>(&self, url: &str) -> Result<T, StatsError> {
        debug!(url, "GET");
        let response = self.client.get(url).send()?;
        let status = response.status();

        if is_rate_limit_response(status, response.headers()) {
            return Err(StatsError::RateLimited {
                url: url.to_string(),
                attempts: 1,
            });
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(StatsError::SourceUnavailable {
                source_name: SOURCE_NAME,
                message: format!("GET {} returned {}: {}", url, status, truncate(body.trim(), MAX_ERROR_BODY)),
            });
        }

        Ok(response.json()?)
    }

    fn unavailable(e: StatsError) -> StatsError {
        match e {
            e @ StatsError::SourceUnavailable { .. } => e,
            other => StatsError::SourceUnavailable {
                source_name: SOURCE_NAME,
                message: other.to_string(),
            },
        }
    }

    /// Every repository the login can see, forks replaced by their upstream.
    ///
    /// Order follows the API; duplicates (a fork and its upstream) appear once.
    pub fn list_repositories(&self) -> Result<Vec<RepoKey>, StatsError> {
        let login = self.login.as_deref().ok_or_else(|| {
            StatsError::InvalidArgs("Repository discovery needs a login".to_string())
        })?;

        let mut seen = HashSet::new();
        let mut repos = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{}/users/{}/repos?type=all&per_page={}&page={}",
                self.api_url, login, PER_PAGE, page
            );
            let items: Vec<RepoPayload> = self.get_json(&url)?;
            let n = items.len();

            for item in items {
                let full_name = if item.fork {
                    self.resolve_upstream(&item.full_name)
                } else {
                    item.full_name
                };
                match RepoKey::parse(&full_name) {
                    Ok(key) if seen.insert(key.clone()) => repos.push(key),
                    Ok(_) => {}
                    Err(e) => warn!(repo = %full_name, error = %e, "Skipping repository"),
                }
            }

            if n < PER_PAGE {
                break;
            }
            page += 1;
        }

        info!(login, repositories = repos.len(), "Discovered repositories");
        Ok(repos)
    }

    /// Upstream `owner/name` of a fork (`source`, else `parent`). Falls back to the
    /// fork itself when the lookup fails.
    fn resolve_upstream(&self, fork: &str) -> String {
        let url = format!("{}/repos/{}", self.api_url, fork);
        match self.get_json::<RepoPayload>(&url) {
            Ok(detail) => match detail.source.or(detail.parent) {
                Some(upstream) => {
                    debug!(fork, upstream = %upstream.full_name, "Fork resolved to upstream");
                    upstream.full_name
                }
                None => fork.to_string(),
            },
            Err(e) => {
                warn!(fork, error = %e, "Could not resolve fork upstream, using the fork");
                fork.to_string()
            }
        }
    }
}

impl DetailSource for GitHubSource {
    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    fn commit_files(&self, target: &RepoTarget, sha: &str) -> Result<Vec<FileChange>, StatsError> {
        let url = format!(
            "{}/repos/{}/{}/commits/{}",
            self.api_url, target.key.owner, target.key.name, sha
        );
        let detail: CommitDetail = self.get_json(&url)?;
        Ok(detail.files.into_iter().map(FileChange::from).collect())
    }
}

impl CommitSource for GitHubSource {
    fn commits(&self, target: &RepoTarget) -> Result<Vec<CommitObservation>, StatsError> {
        let login = self.login.as_deref().ok_or_else(|| StatsError::SourceUnavailable {
            source_name: SOURCE_NAME,
            message: "no login configured".to_string(),
        })?;

        let mut commits = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{}/repos/{}/{}/commits?author={}&per_page={}&page={}",
                self.api_url, target.key.owner, target.key.name, login, PER_PAGE, page
            );
            let items: Vec<CommitListItem> = self.get_json(&url).map_err(Self::unavailable)?;
            let n = items.len();

            for item in items {
                if commits.len() >= self.max_commits {
                    break;
                }
                let sha = item.sha.clone();
                match item.into_observation() {
                    Some(obs) => commits.push(obs),
                    None => warn!(repo = %target.key, sha = %sha, "Commit without a date, skipping"),
                }
            }

            if n < PER_PAGE || commits.len() >= self.max_commits {
                break;
            }
            page += 1;
        }

        debug!(repo = %target.key, commits = commits.len(), pages = page, "Remote history read");
        Ok(commits)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
#[path = "github_tests.rs"]
mod tests;
