//! # contrib-ledger: incremental contribution statistics
//!
//! Computes cumulative lines added, lines deleted and newly added images for one
//! identity across many repositories. Two partial histories (a local `git`
//! checkout and the GitHub REST API) are reconciled per repository, the cached
//! ledger is pruned of rewritten commits, and only unseen commits are analyzed.
//!
//! ## Pipeline
//!
//! ```text
//! LedgerStore::load → CommitSource × 2 → reconcile → clean → analyze → LedgerStore::save
//! ```
//!
//! The binary wraps this in a CLI; everything below is exposed as a library for
//! benchmarking and integration testing.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

pub mod analyze;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod git;
pub mod github;
pub mod identity;
pub mod ledger;
pub mod pipeline;
pub mod readme;
pub mod reconcile;

pub use error::StatsError;

/// File extensions counted as images when a commit adds them.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "svg", "webp", "ico"];

/// Reconciled view of one repository: sha → authoritative observation.
///
/// A `BTreeMap` so iteration order (and therefore miss processing and logging)
/// is deterministic.
pub type CommitMap = BTreeMap<String, CommitObservation>;

// ─── Repository identity ────────────────────────────────────────────

/// `owner/name` of a GitHub repository. Also the storage key of its ledger.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepoKey {
    pub owner: String,
    pub name: String,
}

impl RepoKey {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse `owner/name`. Both halves must be non-empty and contain no further `/`.
    pub fn parse(s: &str) -> Result<Self, StatsError> {
        let s = s.trim().trim_end_matches('/');
        match s.split_once('/') {
            Some((owner, name))
                if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(owner, name))
            }
            _ => Err(StatsError::InvalidArgs(format!(
                "Invalid repository '{}': expected <owner>/<name>",
                s
            ))),
        }
    }

    /// Canonical identity of a commit in this repository.
    ///
    /// The sha is trimmed and lowercased so that identities coming from `git`,
    /// the API and older ledgers compare equal.
    #[must_use]
    pub fn commit_url(&self, sha: &str) -> String {
        format!(
            "https://github.com/{}/{}/commit/{}",
            self.owner,
            self.name,
            sha.trim().to_ascii_lowercase()
        )
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

// ─── Commit observations ────────────────────────────────────────────

/// One file touched by a commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub filename: String,
    pub additions: u64,
    pub deletions: u64,
    /// GitHub vocabulary: `added`, `modified`, `removed`, `renamed`, `copied`, `changed`.
    pub status: String,
}

impl FileChange {
    /// True when this change adds a new image file.
    #[must_use]
    pub fn is_added_image(&self) -> bool {
        self.status == "added" && is_image_path(&self.filename)
    }
}

/// Check a path against [`IMAGE_EXTENSIONS`], ignoring case.
#[must_use]
pub fn is_image_path(path: &str) -> bool {
    std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(ext)))
}

/// A commit as reported by one commit source. Never persisted as-is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitObservation {
    pub sha: String,
    /// UTC `YYYY-MM-DDTHH:MM:SSZ`; compared as text.
    pub authored_at: String,
    /// Present when the source already knows the per-file changes.
    pub files: Option<Vec<FileChange>>,
    /// Author `(name, email)` when the source reports it.
    pub author: Option<(String, String)>,
}

impl CommitObservation {
    pub fn new(sha: impl Into<String>, authored_at: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            authored_at: authored_at.into(),
            files: None,
            author: None,
        }
    }

    #[must_use]
    pub fn with_files(mut self, files: Vec<FileChange>) -> Self {
        self.files = Some(files);
        self
    }
}

// ─── Commit sources ─────────────────────────────────────────────────

/// A repository to process: its ledger key plus an optional local checkout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoTarget {
    pub key: RepoKey,
    pub checkout: Option<std::path::PathBuf>,
}

impl RepoTarget {
    pub fn remote_only(key: RepoKey) -> Self {
        Self { key, checkout: None }
    }
}

/// Supplies per-file changes for one commit. Used only on cache miss.
pub trait DetailSource: Sync {
    /// Short label used in logs and error messages.
    fn name(&self) -> &'static str;

    fn commit_files(&self, target: &RepoTarget, sha: &str) -> Result<Vec<FileChange>, StatsError>;
}

/// One view of a repository's history, attributed to the tracked identity.
pub trait CommitSource: DetailSource {
    fn commits(&self, target: &RepoTarget) -> Result<Vec<CommitObservation>, StatsError>;
}

// ─── Ledger records ─────────────────────────────────────────────────

/// Persisted statistics for one commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Position after the last save (1-based). Only `ledger::canonicalize` assigns it.
    #[serde(default)]
    pub index: usize,
    pub url: String,
    pub additions: u64,
    pub deletions: u64,
    #[serde(default)]
    pub images: u64,
    /// Authored timestamp of the commit, never the time it was processed.
    pub timestamp: String,
}

impl CommitRecord {
    /// Build a record from per-file changes.
    pub fn from_files(url: String, timestamp: String, files: &[FileChange]) -> Self {
        let mut record = Self {
            index: 0,
            url,
            additions: 0,
            deletions: 0,
            images: 0,
            timestamp,
        };
        for file in files {
            record.additions += file.additions;
            record.deletions += file.deletions;
            if file.is_added_image() {
                record.images += 1;
            }
        }
        record
    }

    #[must_use]
    pub fn totals(&self) -> Totals {
        Totals {
            additions: self.additions,
            deletions: self.deletions,
            images: self.images,
        }
    }
}

/// Ordered list of records for one repository.
pub type Ledger = Vec<CommitRecord>;

// ─── Totals ─────────────────────────────────────────────────────────

/// Additive contribution counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub additions: u64,
    pub deletions: u64,
    pub images: u64,
}

impl Totals {
    /// Sum every record of a ledger.
    #[must_use]
    pub fn of(records: &[CommitRecord]) -> Self {
        records.iter().map(CommitRecord::totals).fold(Self::default(), Add::add)
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl Add for Totals {
    type Output = Totals;

    fn add(self, rhs: Totals) -> Totals {
        Totals {
            additions: self.additions + rhs.additions,
            deletions: self.deletions + rhs.deletions,
            images: self.images + rhs.images,
        }
    }
}

impl AddAssign for Totals {
    fn add_assign(&mut self, rhs: Totals) {
        *self = *self + rhs;
    }
}

/// At most `max` characters of `s`, cut on a char boundary.
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

// ─── Timestamps ─────────────────────────────────────────────────────

/// Text format shared by every timestamp the ledger compares.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Format unix seconds as a sortable UTC timestamp.
#[must_use]
pub fn format_unix_timestamp(secs: i64) -> Option<String> {
    chrono::DateTime::from_timestamp(secs, 0).map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
}

/// Normalize an RFC 3339 timestamp (any offset) to UTC text.
///
/// A naive `YYYY-MM-DDTHH:MM:SS[.ffffff]` with no offset is read as UTC;
/// fractional seconds are dropped. Other unparseable input is returned trimmed
/// but otherwise unchanged, so a source with an odd format still produces
/// comparable text against itself.
#[must_use]
pub fn normalize_timestamp(raw: &str) -> String {
    let raw = raw.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return dt.with_timezone(&chrono::Utc).format(TIMESTAMP_FORMAT).to_string();
    }
    match chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        Ok(naive) => naive.and_utc().format(TIMESTAMP_FORMAT).to_string(),
        Err(_) => raw.to_string(),
    }
}

/// Current wall-clock time, same format.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string()
}
