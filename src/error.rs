//! Unified error type for the ledger pipeline.

use thiserror::Error;

/// All errors that can occur while collecting, reconciling and persisting statistics.
///
/// None of these is process-fatal inside the pipeline: each one is scoped to a
/// single commit or a single repository and reported in the run summary.
#[derive(Error, Debug)]
pub enum StatsError {
    /// I/O error (file read/write, directory access)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport-level HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// `git` could not be run or exited with an error
    #[error("git error: {0}")]
    Git(String),

    /// A commit source failed or stayed rate-limited past the retry budget
    #[error("{source_name} commit source unavailable: {message}")]
    SourceUnavailable {
        source_name: &'static str,
        message: String,
    },

    /// The remote service kept answering with a rate limit
    #[error("Rate limited by {url} after {attempts} attempt(s)")]
    RateLimited { url: String, attempts: u32 },

    /// Per-file details for a cache miss could not be resolved
    #[error("Failed to fetch details for commit {sha}: {message}")]
    DetailFetchFailed { sha: String, message: String },

    /// Persisted ledger exists but cannot be decoded
    #[error("Corrupt ledger for {key}: {message}")]
    CorruptLedger { key: String, message: String },

    /// Ledger could not be written; the previous snapshot is untouched
    #[error("Failed to persist ledger for {key}: {message}")]
    PersistFailure { key: String, message: String },

    /// Mutually exclusive flags or other argument validation error
    #[error("{0}")]
    InvalidArgs(String),
}

impl StatsError {
    /// True for errors a retry with backoff may clear.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, StatsError::RateLimited { .. })
    }
}
