//! Local commit source: reads history from a checkout via the `git` CLI.
//!
//! One streaming `git log --raw --numstat` pass yields every commit authored by
//! the tracked identity together with its per-file changes, so local misses
//! never need a second fetch. `git show` covers single-commit lookups for shas
//! that only the remote source reported.

use std::io::BufRead;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::identity::IdentitySet;
use crate::{
    CommitObservation, CommitSource, DetailSource, FileChange, RepoTarget, StatsError,
    format_unix_timestamp, truncate,
};

// ─── Constants ──────────────────────────────────────────────────────

/// Field separator in git log format, U+241E (SYMBOL FOR RECORD SEPARATOR).
/// Never appears in commit data.
const FIELD_SEP: &str = "␞";

/// Commit line prefix in git log output.
const COMMIT_PREFIX: &str = "COMMIT:";

const SOURCE_NAME: &str = "local";

fn log_format() -> String {
    format!("--format={}%H{}%at{}%aE{}%aN", COMMIT_PREFIX, FIELD_SEP, FIELD_SEP, FIELD_SEP)
}

// ─── Streaming parser ───────────────────────────────────────────────

/// Map a `--raw` status letter to the GitHub file status vocabulary.
fn status_name(letter: char) -> &'static str {
    match letter {
        'A' => "added",
        'D' => "removed",
        'R' => "renamed",
        'C' => "copied",
        'T' => "changed",
        _ => "modified",
    }
}

/// A commit being assembled while its file lines stream in.
struct PendingCommit {
    sha: String,
    authored_at: String,
    author: (String, String),
    /// path → status from `--raw`
    statuses: Vec<(String, &'static str)>,
    /// (path, additions, deletions) from `--numstat`
    numstat: Vec<(String, u64, u64)>,
}

impl PendingCommit {
    fn finish(self) -> CommitObservation {
        let mut files: Vec<FileChange> = self
            .numstat
            .iter()
            .map(|(path, additions, deletions)| FileChange {
                filename: path.clone(),
                additions: *additions,
                deletions: *deletions,
                status: self
                    .statuses
                    .iter()
                    .find(|(p, _)| p == path)
                    .map_or("modified", |(_, s)| *s)
                    .to_string(),
            })
            .collect();

        // A raw entry without numstat (should not happen, but keep the file).
        for (path, status) in &self.statuses {
            if !files.iter().any(|f| &f.filename == path) {
                files.push(FileChange {
                    filename: path.clone(),
                    additions: 0,
                    deletions: 0,
                    status: status.to_string(),
                });
            }
        }

        CommitObservation {
            sha: self.sha,
            authored_at: self.authored_at,
            files: Some(files),
            author: Some(self.author),
        }
    }
}

/// Parse a `--raw` line: `:100644 100644 abc1234 def5678 M\tpath`.
fn parse_raw_line(line: &str) -> Option<(String, &'static str)> {
    let (meta, path) = line.split_once('\t')?;
    let letter = meta.split_whitespace().nth(4)?.chars().next()?;
    Some((path.to_string(), status_name(letter)))
}

/// Parse a `--numstat` line: `12\t3\tpath` (binary files report `-\t-`).
fn parse_numstat_line(line: &str) -> Option<(String, u64, u64)> {
    let mut parts = line.splitn(3, '\t');
    let additions = parts.next()?;
    let deletions = parts.next()?;
    let path = parts.next()?;
    let count = |s: &str| -> Option<u64> {
        if s == "-" { Some(0) } else { s.parse().ok() }
    };
    Some((path.to_string(), count(additions)?, count(deletions)?))
}

/// Parse git log output line by line (streaming).
///
/// Expected format: `--format=COMMIT:%H␞%at␞%aE␞%aN` with `--raw --numstat`.
/// When `identities` is given, commits by other authors are skipped.
pub fn parse_git_log_stream(
    reader: impl BufRead,
    identities: Option<&IdentitySet>,
) -> Result<Vec<CommitObservation>, StatsError> {
    let mut commits = Vec::new();
    let mut current: Option<PendingCommit> = None;
    let mut skipped = 0usize;

    for line_result in reader.lines() {
        let line = line_result.map_err(|e| StatsError::Git(format!("IO error reading git log: {}", e)))?;

        if let Some(header) = line.strip_prefix(COMMIT_PREFIX) {
            if let Some(done) = current.take() {
                commits.push(done.finish());
            }

            // COMMIT:<hash>␞<timestamp>␞<email>␞<name>
            let fields: Vec<&str> = header.split(FIELD_SEP).collect();
            if fields.len() < 4 {
                warn!(line = %truncate(&line, 100), "Malformed commit line, skipping");
                continue;
            }

            let sha = fields[0].trim().to_ascii_lowercase();
            let email = fields[2].trim();
            let name = fields[3..].join(FIELD_SEP);
            let name = name.trim();

            let Some(authored_at) = fields[1].trim().parse::<i64>().ok().and_then(format_unix_timestamp) else {
                warn!(sha = %sha, timestamp = fields[1], "Bad commit timestamp, skipping");
                continue;
            };

            if identities.is_some_and(|ids| !ids.matches(name, email)) {
                skipped += 1;
                continue;
            }

            current = Some(PendingCommit {
                sha,
                authored_at,
                author: (name.to_string(), email.to_string()),
                statuses: Vec::new(),
                numstat: Vec::new(),
            });
        } else if line.is_empty() {
            // Separator between header and diff output
        } else if let Some(pending) = current.as_mut() {
            if line.starts_with(':') {
                if let Some(entry) = parse_raw_line(&line) {
                    pending.statuses.push(entry);
                }
            } else if let Some(entry) = parse_numstat_line(&line) {
                pending.numstat.push(entry);
            }
        }
        // File lines of a skipped commit fall through here and are ignored.
    }

    if let Some(done) = current.take() {
        commits.push(done.finish());
    }

    debug!(commits = commits.len(), skipped, "Parsed git log");
    Ok(commits)
}

// ─── Git CLI helpers ────────────────────────────────────────────────

fn git_command(repo_path: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.arg("-C")
        .arg(repo_path)
        .args(["-c", "core.quotePath=false"]);
    cmd
}

/// Spawn a git command and stream its stdout through [`parse_git_log_stream`].
fn run_log(mut cmd: Command, identities: Option<&IdentitySet>) -> Result<Vec<CommitObservation>, StatsError> {
    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| StatsError::Git(format!("Failed to execute git: {}. Is git installed and in PATH?", e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| StatsError::Git("Failed to capture git stdout".to_string()))?;

    let parsed = parse_git_log_stream(std::io::BufReader::new(stdout), identities);

    let output = child
        .wait_with_output()
        .map_err(|e| StatsError::Git(format!("Failed to wait for git: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StatsError::Git(format!("git exited with {}: {}", output.status, stderr.trim())));
    }

    parsed
}

/// Check that a path is a git work tree.
pub fn is_git_checkout(path: &Path) -> bool {
    path.join(".git").exists()
}

// ─── Commit source ──────────────────────────────────────────────────

/// Local history adapter.
///
/// Shares the identity set with the rest of the run so that identities learned
/// from the remote source apply to later repositories.
#[derive(Clone)]
pub struct LocalGitSource {
    identities: Arc<RwLock<IdentitySet>>,
}

impl LocalGitSource {
    pub fn new(identities: Arc<RwLock<IdentitySet>>) -> Self {
        Self { identities }
    }

    fn checkout<'a>(&self, target: &'a RepoTarget) -> Result<&'a Path, StatsError> {
        match target.checkout.as_deref() {
            Some(path) if is_git_checkout(path) => Ok(path),
            Some(path) => Err(StatsError::SourceUnavailable {
                source_name: SOURCE_NAME,
                message: format!("{} is not a git checkout", path.display()),
            }),
            None => Err(StatsError::SourceUnavailable {
                source_name: SOURCE_NAME,
                message: "no local checkout".to_string(),
            }),
        }
    }
}

impl DetailSource for LocalGitSource {
    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    fn commit_files(&self, target: &RepoTarget, sha: &str) -> Result<Vec<FileChange>, StatsError> {
        let path = self.checkout(target)?;
        let mut cmd = git_command(path);
        cmd.args(["show", "--no-renames", "--raw", "--numstat"])
            .arg(log_format())
            .arg(sha)
            .arg("--");

        let mut commits = run_log(cmd, None)?;
        if commits.is_empty() {
            return Err(StatsError::Git(format!("commit {} not found", sha)));
        }
        Ok(commits.swap_remove(0).files.unwrap_or_default())
    }
}

impl CommitSource for LocalGitSource {
    fn commits(&self, target: &RepoTarget) -> Result<Vec<CommitObservation>, StatsError> {
        let path = self.checkout(target)?;

        let identities = self.identities.read().unwrap_or_else(|e| e.into_inner()).clone();
        if identities.is_empty() {
            return Err(StatsError::SourceUnavailable {
                source_name: SOURCE_NAME,
                message: "identity set is empty, cannot attribute local commits".to_string(),
            });
        }

        let mut cmd = git_command(path);
        cmd.args(["log", "--no-renames", "--raw", "--numstat"])
            .arg(log_format())
            .arg("HEAD")
            .arg("--");

        let commits = run_log(cmd, Some(&identities)).map_err(|e| StatsError::SourceUnavailable {
            source_name: SOURCE_NAME,
            message: e.to_string(),
        })?;

        debug!(repo = %target.key, commits = commits.len(), "Local history read");
        Ok(commits)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
#[path = "git_tests.rs"]
mod tests;
