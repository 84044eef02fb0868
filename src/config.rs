//! Run settings, validated once from CLI arguments and passed down by reference.

use std::path::PathBuf;
use std::time::Duration;

use crate::analyze::DEFAULT_BATCH_SIZE;
use crate::identity::Identity;
use crate::{RepoKey, StatsError};

/// Default GitHub REST endpoint.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Upper bound on commits fetched from the remote source per repository.
pub const DEFAULT_MAX_REMOTE_COMMITS: usize = 1000;

/// Directory name under the platform data dir.
const APP_DIR: &str = "contrib-ledger";

/// How rate-limited requests are retried: a fixed delay between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// No retries, no waiting. Used by tests.
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }
}

/// Default cache directory: `<data_local_dir>/contrib-ledger`, or `.contrib-ledger`
/// in the working directory when the platform has no data dir.
pub fn default_cache_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(format!(".{}", APP_DIR)))
}

/// Everything a run needs.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Tracked GitHub login. Required for remote history and discovery.
    pub login: Option<String>,
    pub token: Option<String>,
    pub api_url: String,
    pub cache_dir: PathBuf,
    /// Explicit repositories. Empty means discover them from the login.
    pub repositories: Vec<RepoKey>,
    /// Directory holding local checkouts, looked up as `<checkouts>/<name>`.
    pub checkouts: Option<PathBuf>,
    /// Identities seeded from the command line.
    pub identities: Vec<Identity>,
    pub jobs: usize,
    pub batch_size: usize,
    pub max_remote_commits: usize,
    pub retry: RetryPolicy,
    pub deadline: Option<Duration>,
    pub readme: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            login: None,
            token: None,
            api_url: DEFAULT_API_URL.to_string(),
            cache_dir: default_cache_dir(),
            repositories: Vec::new(),
            checkouts: None,
            identities: Vec::new(),
            jobs: 1,
            batch_size: DEFAULT_BATCH_SIZE,
            max_remote_commits: DEFAULT_MAX_REMOTE_COMMITS,
            retry: RetryPolicy::default(),
            deadline: None,
            readme: None,
        }
    }
}

impl Settings {
    /// Root of the ledger store.
    pub fn ledger_dir(&self) -> PathBuf {
        self.cache_dir.join("ledgers")
    }

    /// The identity set lives beside the store so clearing ledgers keeps it.
    pub fn identity_file(&self) -> PathBuf {
        self.cache_dir.join("identities.json")
    }

    /// Local checkout path for a repository, if a checkouts dir is configured.
    pub fn checkout_for(&self, repo: &RepoKey) -> Option<PathBuf> {
        self.checkouts.as_ref().map(|dir| dir.join(&repo.name))
    }

    /// Reject settings no run could use.
    pub fn validate(self) -> Result<Self, StatsError> {
        if self.jobs == 0 {
            return Err(StatsError::InvalidArgs("--jobs must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(StatsError::InvalidArgs("--batch-size must be at least 1".to_string()));
        }
        if self.max_remote_commits == 0 {
            return Err(StatsError::InvalidArgs("--max-remote-commits must be at least 1".to_string()));
        }
        if self.repositories.is_empty() && self.login.is_none() {
            return Err(StatsError::InvalidArgs(
                "No repositories given and no login to discover them (set --login or USERNAME)".to_string(),
            ));
        }
        if self.login.as_deref().is_some_and(|l| l.trim().is_empty()) {
            return Err(StatsError::InvalidArgs("--login must not be empty".to_string()));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Settings {
        Settings {
            login: Some("octocat".to_string()),
            cache_dir: PathBuf::from("/tmp/cl"),
            ..Settings::default()
        }
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.retry.max_retries, 3);
        assert_eq!(s.retry.delay, Duration::from_secs(10));
        assert_eq!(s.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(s.max_remote_commits, 1000);
        assert!(s.cache_dir.ends_with(APP_DIR) || s.cache_dir.ends_with(".contrib-ledger"));
    }

    #[test]
    fn test_validate_accepts_login_only() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn test_validate_requires_login_or_repositories() {
        let s = Settings { login: None, ..base() };
        assert!(matches!(s.validate(), Err(StatsError::InvalidArgs(_))));

        let s = Settings {
            login: None,
            repositories: vec![RepoKey::new("octo", "widgets")],
            ..base()
        };
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_counts() {
        assert!(Settings { jobs: 0, ..base() }.validate().is_err());
        assert!(Settings { batch_size: 0, ..base() }.validate().is_err());
        assert!(Settings { max_remote_commits: 0, ..base() }.validate().is_err());
    }

    #[test]
    fn test_paths() {
        let s = Settings {
            checkouts: Some(PathBuf::from("/src")),
            ..base()
        };
        assert_eq!(s.ledger_dir(), PathBuf::from("/tmp/cl/ledgers"));
        assert_eq!(s.identity_file(), PathBuf::from("/tmp/cl/identities.json"));
        assert_eq!(
            s.checkout_for(&RepoKey::new("octo", "widgets")),
            Some(PathBuf::from("/src/widgets"))
        );
    }
}
