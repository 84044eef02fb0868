//! Per-repository pipeline and the multi-repository run loop.
//!
//! ```text
//! load ledger → remote commits → learn identities → local commits
//!   → reconcile → clean → analyze → save
//! ```
//!
//! Each repository is processed start to finish by one worker. Workers pull
//! repositories from a shared cursor; a stop flag or deadline ends the run
//! between repositories, never in the middle of one.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::analyze::{self, DEFAULT_BATCH_SIZE};
use crate::cleanup;
use crate::identity::{Identity, IdentitySet};
use crate::ledger::{LedgerBackend, LedgerStore};
use crate::reconcile::{self, SourceState};
use crate::{CommitObservation, CommitSource, DetailSource, RepoTarget, StatsError, Totals};

// ─── Reports ────────────────────────────────────────────────────────

/// Outcome of one repository.
#[derive(Debug, Default, Serialize)]
pub struct RepoReport {
    pub repository: String,
    /// `None` when neither source was available and the repository was skipped.
    pub state: Option<SourceState>,
    pub local_commits: usize,
    pub remote_commits: usize,
    /// Stale records removed by cleanup.
    pub dropped: usize,
    pub hits: usize,
    pub misses: usize,
    /// Misses whose details could not be fetched.
    pub failed: usize,
    /// Ledger length after this run.
    pub records: usize,
    pub totals: Totals,
    pub persisted: bool,
    /// Why one commit source was unavailable when the other carried the run.
    pub degraded: Option<String>,
    pub errors: Vec<String>,
}

impl RepoReport {
    fn new(target: &RepoTarget) -> Self {
        Self {
            repository: target.key.to_string(),
            ..Self::default()
        }
    }

    /// Cache hit rate in percent.
    pub fn hit_rate(&self) -> f64 {
        let seen = self.hits + self.misses;
        if seen == 0 { 0.0 } else { self.hits as f64 * 100.0 / seen as f64 }
    }
}

/// Outcome of a whole run.
///
/// `totals` covers every target: processed repositories contribute their new
/// totals, skipped and not-started ones their stored ledgers.
#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub totals: Totals,
    pub repositories: Vec<RepoReport>,
    /// Repositories never started because the run was stopped.
    pub not_started: Vec<String>,
    pub elapsed_secs: f64,
}

impl RunSummary {
    pub fn interrupted(&self) -> bool {
        !self.not_started.is_empty()
    }

    /// Repositories that ended with at least one error.
    pub fn with_errors(&self) -> usize {
        self.repositories.iter().filter(|r| !r.errors.is_empty()).count()
    }
}

/// When to stop starting new repositories.
#[derive(Debug, Default)]
pub struct RunControl {
    stop: AtomicBool,
    deadline: Option<Instant>,
}

impl RunControl {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            stop: AtomicBool::new(false),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// Request a stop. Safe to call from a signal handler thread.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

// ─── Pipeline ───────────────────────────────────────────────────────

/// Wires the store and both commit sources together.
///
/// The local source is consulted after the remote one so that identities the
/// remote source reports are already in `identities` when local history is
/// attributed.
pub struct Pipeline<'a, B: LedgerBackend, L: CommitSource, R: CommitSource> {
    pub store: &'a LedgerStore<B>,
    pub local: &'a L,
    pub remote: &'a R,
    pub identities: &'a RwLock<IdentitySet>,
    pub batch_size: usize,
}

impl<'a, B: LedgerBackend, L: CommitSource, R: CommitSource> Pipeline<'a, B, L, R> {
    pub fn new(
        store: &'a LedgerStore<B>,
        local: &'a L,
        remote: &'a R,
        identities: &'a RwLock<IdentitySet>,
    ) -> Self {
        Self {
            store,
            local,
            remote,
            identities,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Add the authors of remote commits to the identity set.
    ///
    /// Remote history is already filtered to the tracked login, so every author
    /// it reports is one of the user's identities.
    fn learn_identities(&self, target: &RepoTarget, remote: &[CommitObservation]) {
        let seen = remote
            .iter()
            .filter_map(|obs| obs.author.as_ref())
            .map(|(name, email)| Identity::new(name.as_str(), email.as_str()));
        let added = self
            .identities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend(seen);
        if added > 0 {
            info!(repo = %target.key, added, "Learned identities from remote history");
        }
    }

    /// Run the full pipeline for one repository. Never fails: every error is
    /// scoped to this repository and recorded in the report.
    pub fn process_repository(&self, target: &RepoTarget) -> RepoReport {
        let start = Instant::now();
        let mut report = RepoReport::new(target);

        let (previous, load_err) = self.store.load(&target.key);
        if let Some(e) = load_err {
            report.errors.push(e.to_string());
        }

        let remote = self.remote.commits(target);
        if let Ok(commits) = &remote {
            self.learn_identities(target, commits);
        }
        let local = self.local.commits(target);

        let reconciled = match reconcile::reconcile(local, remote) {
            Ok(r) => r,
            Err(e) => {
                warn!(repo = %target.key, error = %e, "No commit source available, skipping repository");
                report.errors.push(e.to_string());
                report.records = previous.len();
                report.totals = Totals::of(&previous);
                return report;
            }
        };
        report.degraded = reconciled.degraded.as_ref().map(StatsError::to_string);
        report.state = Some(reconciled.state);
        report.local_commits = reconciled.local_count;
        report.remote_commits = reconciled.remote_count;

        let before = previous.len();
        let cleaned = cleanup::clean(&target.key, previous, &reconciled.commits);
        report.dropped = before - cleaned.len();

        let details: [&dyn DetailSource; 2] = [self.local, self.remote];
        let analysis = analyze::analyze(target, &reconciled.commits, cleaned, &details, self.batch_size);
        report.hits = analysis.hits;
        report.misses = analysis.misses;
        report.failed = analysis.failures.len();
        report.errors.extend(analysis.failures.iter().map(StatsError::to_string));
        report.totals = analysis.totals;
        report.records = analysis.ledger.len();

        match self.store.save(&target.key, analysis.ledger) {
            Ok(saved) => {
                report.persisted = true;
                report.records = saved.len();
            }
            Err(e) => {
                warn!(repo = %target.key, error = %e, "Ledger not saved, previous snapshot kept");
                report.errors.push(e.to_string());
            }
        }

        info!(
            repo = %target.key,
            state = ?reconciled.state,
            records = report.records,
            dropped = report.dropped,
            additions = report.totals.additions,
            deletions = report.totals.deletions,
            images = report.totals.images,
            elapsed_ms = format_args!("{:.1}", start.elapsed().as_secs_f64() * 1000.0),
            "Repository processed"
        );
        report
    }

    /// Process every target on `jobs` worker threads.
    ///
    /// Reports come back in target order. Targets not started before `control`
    /// asked to stop are listed in [`RunSummary::not_started`].
    pub fn run(&self, targets: &[RepoTarget], jobs: usize, control: &RunControl) -> RunSummary {
        let start = Instant::now();
        let cursor = AtomicUsize::new(0);
        let done: Mutex<Vec<(usize, RepoReport)>> = Mutex::new(Vec::with_capacity(targets.len()));
        let workers = jobs.clamp(1, targets.len().max(1));

        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| {
                    loop {
                        if control.should_stop() {
                            break;
                        }
                        let i = cursor.fetch_add(1, Ordering::SeqCst);
                        let Some(target) = targets.get(i) else { break };
                        let report = self.process_repository(target);
                        done.lock().unwrap_or_else(|e| e.into_inner()).push((i, report));
                    }
                });
            }
        });

        let mut done = done.into_inner().unwrap_or_else(|e| e.into_inner());
        done.sort_by_key(|(i, _)| *i);

        let mut started = vec![false; targets.len()];
        for (i, _) in &done {
            started[*i] = true;
        }
        let not_started: Vec<String> = targets
            .iter()
            .zip(&started)
            .filter(|(_, s)| !**s)
            .map(|(t, _)| t.key.to_string())
            .collect();
        if !not_started.is_empty() {
            warn!(remaining = not_started.len(), "Run stopped before every repository was processed");
        }

        let repositories: Vec<RepoReport> = done.into_iter().map(|(_, r)| r).collect();
        let mut totals = repositories.iter().map(|r| r.totals).fold(Totals::default(), |a, b| a + b);
        for (target, _) in targets.iter().zip(&started).filter(|(_, s)| !**s) {
            totals += Totals::of(&self.store.load(&target.key).0);
        }

        RunSummary {
            totals,
            repositories,
            not_started,
            elapsed_secs: start.elapsed().as_secs_f64(),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
