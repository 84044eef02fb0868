//! CLI argument structs for all subcommands.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use contrib_ledger::config::{self, RetryPolicy, Settings};
use contrib_ledger::identity::Identity;
use contrib_ledger::{RepoKey, StatsError};

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// GitHub login whose contributions are counted
    #[arg(short, long, env = "USERNAME")]
    pub login: Option<String>,

    /// GitHub token (falls back to GITHUB_TOKEN)
    #[arg(long, env = "GH_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Repository to process as <owner>/<name> (repeatable). Default: discover from --login
    #[arg(short, long = "repo")]
    pub repos: Vec<String>,

    /// Directory containing local checkouts, looked up as <DIR>/<repo-name>
    #[arg(long)]
    pub checkouts: Option<PathBuf>,

    /// Author identity counted in local history, as "Name <email>" (repeatable)
    #[arg(long = "identity")]
    pub identities: Vec<String>,

    /// Cache directory for ledgers and the identity set
    #[arg(long, env = "CONTRIB_LEDGER_CACHE")]
    pub cache_dir: Option<PathBuf>,

    /// Repositories processed in parallel
    #[arg(short, long, default_value = "4")]
    pub jobs: usize,

    /// Concurrent commit-detail fetches per repository
    #[arg(long, default_value = "8")]
    pub batch_size: usize,

    /// Max commits fetched from the GitHub API per repository
    #[arg(long, default_value = "1000")]
    pub max_remote_commits: usize,

    /// Retries for rate-limited API requests
    #[arg(long, default_value = "3")]
    pub max_retries: u32,

    /// Seconds to wait between rate-limit retries
    #[arg(long, default_value = "10")]
    pub retry_delay_secs: u64,

    /// Stop starting new repositories after this many seconds
    #[arg(long)]
    pub deadline_secs: Option<u64>,

    /// README to update with the run totals
    #[arg(long)]
    pub readme: Option<PathBuf>,

    /// GitHub API base URL
    #[arg(long, default_value = config::DEFAULT_API_URL)]
    pub api_url: String,

    /// Print the run summary as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Validate into [`Settings`]. Repeated repositories are kept once, first
    /// occurrence order.
    pub fn into_settings(self) -> Result<Settings, StatsError> {
        let mut seen = HashSet::new();
        let mut repositories = Vec::new();
        for r in &self.repos {
            let key = RepoKey::parse(r)?;
            if seen.insert(key.clone()) {
                repositories.push(key);
            }
        }
        let identities = self
            .identities
            .iter()
            .map(|s| Identity::parse(s))
            .collect::<Result<Vec<_>, _>>()?;

        Settings {
            login: self.login.filter(|l| !l.trim().is_empty()),
            token: self.token.or_else(|| std::env::var("GITHUB_TOKEN").ok()),
            api_url: self.api_url,
            cache_dir: self.cache_dir.unwrap_or_else(config::default_cache_dir),
            repositories,
            checkouts: self.checkouts,
            identities,
            jobs: self.jobs,
            batch_size: self.batch_size,
            max_remote_commits: self.max_remote_commits,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                delay: Duration::from_secs(self.retry_delay_secs),
            },
            deadline: self.deadline_secs.map(Duration::from_secs),
            readme: self.readme,
        }
        .validate()
    }
}

#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Cache directory for ledgers and the identity set
    #[arg(long, env = "CONTRIB_LEDGER_CACHE")]
    pub cache_dir: Option<PathBuf>,

    /// Print as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ClearCacheArgs {
    /// Cache directory for ledgers and the identity set
    #[arg(long, env = "CONTRIB_LEDGER_CACHE")]
    pub cache_dir: Option<PathBuf>,
}
