//! Incremental analysis: reuse cached records, compute the rest.
//!
//! Hits are looked up by canonical commit url. Misses are resolved in bounded
//! parallel batches; the caller must finish reconciliation and cleanup first,
//! because the cleaned ledger defines what counts as a hit.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::{
    CommitMap, CommitObservation, CommitRecord, DetailSource, FileChange, Ledger, RepoTarget,
    StatsError, Totals,
};

/// Default number of concurrent detail fetches per repository.
pub const DEFAULT_BATCH_SIZE: usize = 8;

/// Output of [`analyze`].
#[derive(Debug)]
pub struct Analysis {
    /// Cleaned records followed by newly appended ones; not yet sorted.
    pub ledger: Ledger,
    /// Sum over every record in `ledger`.
    pub totals: Totals,
    pub hits: usize,
    pub misses: usize,
    /// Misses whose details could not be resolved. They contribute zero and are
    /// not written to the ledger, so the next run retries them.
    pub failures: Vec<StatsError>,
}

impl Analysis {
    /// Percentage of reconciled commits served from the ledger.
    pub fn hit_rate(&self) -> f64 {
        let seen = self.hits + self.misses;
        if seen == 0 {
            0.0
        } else {
            self.hits as f64 * 100.0 / seen as f64
        }
    }
}

/// Resolve per-file changes for a miss.
///
/// Order: the observation's own file list, then each detail source in turn.
/// The last source error is returned when every source fails.
fn resolve_files(
    target: &RepoTarget,
    obs: &CommitObservation,
    sources: &[&dyn DetailSource],
) -> Result<Vec<FileChange>, StatsError> {
    if let Some(files) = &obs.files {
        return Ok(files.clone());
    }

    let mut last_error = None;
    for source in sources {
        match source.commit_files(target, &obs.sha) {
            Ok(files) => return Ok(files),
            Err(e) => {
                debug!(sha = %obs.sha, source = source.name(), error = %e, "Detail source failed, trying next");
                last_error = Some(e);
            }
        }
    }

    Err(StatsError::DetailFetchFailed {
        sha: obs.sha.clone(),
        message: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no detail source available".to_string()),
    })
}

/// Walk the reconciled view against the cleaned ledger.
///
/// `batch_size` bounds how many misses are resolved concurrently (0 is treated as 1).
pub fn analyze(
    target: &RepoTarget,
    reconciled: &CommitMap,
    cleaned: Ledger,
    sources: &[&dyn DetailSource],
    batch_size: usize,
) -> Analysis {
    let cached: HashSet<&str> = cleaned.iter().map(|r| r.url.as_str()).collect();

    let mut hits = 0usize;
    let mut missing: Vec<(String, &CommitObservation)> = Vec::new();

    for (sha, obs) in reconciled {
        let url = target.key.commit_url(sha);
        if cached.contains(url.as_str()) {
            hits += 1;
        } else {
            missing.push((url, obs));
        }
    }
    drop(cached);

    let misses = missing.len();
    let mut ledger = cleaned;
    let mut failures = Vec::new();

    // Resolve misses concurrently, batch by batch. Results are appended in
    // reconciled (sha) order; save re-sorts by timestamp anyway.
    let batch_size = batch_size.max(1);
    for batch in missing.chunks(batch_size) {
        let results: Vec<Result<CommitRecord, StatsError>> = std::thread::scope(|s| {
            let handles: Vec<_> = batch
                .iter()
                .map(|(url, obs)| {
                    s.spawn(move || -> Result<CommitRecord, StatsError> {
                        let files = resolve_files(target, obs, sources)?;
                        Ok(CommitRecord::from_files(url.clone(), obs.authored_at.clone(), &files))
                    })
                })
                .collect();

            handles
                .into_iter()
                .zip(batch.iter())
                .map(|(h, (_, obs))| {
                    h.join().unwrap_or_else(|_| {
                        Err(StatsError::DetailFetchFailed {
                            sha: obs.sha.clone(),
                            message: "detail worker panicked".to_string(),
                        })
                    })
                })
                .collect()
        });

        for result in results {
            match result {
                Ok(record) => ledger.push(record),
                Err(e) => {
                    warn!(repo = %target.key, error = %e, "Commit contributes zero this run");
                    failures.push(e);
                }
            }
        }
    }

    let totals = Totals::of(&ledger);
    let analysis = Analysis {
        ledger,
        totals,
        hits,
        misses,
        failures,
    };

    info!(
        repo = %target.key,
        hits = analysis.hits,
        misses = analysis.misses,
        failed = analysis.failures.len(),
        hit_rate = format_args!("{:.1}%", analysis.hit_rate()),
        "Cache statistics"
    );

    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RepoKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeDetails {
        calls: AtomicUsize,
        fail_sha: Option<&'static str>,
    }

    impl FakeDetails {
        fn new() -> Self {
            Self { calls: AtomicUsize::new(0), fail_sha: None }
        }
    }

    impl DetailSource for FakeDetails {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn commit_files(&self, _target: &RepoTarget, sha: &str) -> Result<Vec<FileChange>, StatsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_sha == Some(sha) {
                return Err(StatsError::Git("bad object".into()));
            }
            Ok(vec![
                FileChange { filename: format!("{}.rs", sha), additions: 3, deletions: 1, status: "modified".into() },
                FileChange { filename: format!("{}.png", sha), additions: 0, deletions: 0, status: "added".into() },
            ])
        }
    }

    fn target() -> RepoTarget {
        RepoTarget::remote_only(RepoKey::new("octo", "widgets"))
    }

    fn window(entries: &[(&str, &str)]) -> CommitMap {
        entries
            .iter()
            .map(|(sha, ts)| (sha.to_string(), CommitObservation::new(*sha, *ts)))
            .collect()
    }

    fn cached(sha: &str, ts: &str, a: u64, d: u64, i: u64) -> CommitRecord {
        CommitRecord { index: 0, url: target().key.commit_url(sha), additions: a, deletions: d, images: i, timestamp: ts.into() }
    }

    #[test]
    fn test_hit_reuses_cached_values_without_fetch() {
        let details = FakeDetails::new();
        let reconciled = window(&[("q", "2024-01-01T00:00:00Z")]);
        let cleaned = vec![cached("q", "2024-01-01T00:00:00Z", 5, 1, 1)];
        let a = analyze(&target(), &reconciled, cleaned, &[&details], 4);
        assert_eq!(details.calls.load(Ordering::SeqCst), 0);
        assert_eq!(a.hits, 1);
        assert_eq!(a.misses, 0);
        assert_eq!(a.totals, Totals { additions: 5, deletions: 1, images: 1 });
    }

    #[test]
    fn test_miss_appends_record_with_authored_timestamp() {
        let details = FakeDetails::new();
        let reconciled = window(&[("z", "2024-01-01T00:00:00Z")]);
        let a = analyze(&target(), &reconciled, Vec::new(), &[&details], 4);
        assert_eq!(a.misses, 1);
        assert_eq!(a.ledger.len(), 1);
        assert_eq!(a.ledger[0].timestamp, "2024-01-01T00:00:00Z");
        assert_eq!(a.ledger[0].url, target().key.commit_url("z"));
        assert_eq!(a.totals, Totals { additions: 3, deletions: 1, images: 1 });
    }

    #[test]
    fn test_observation_files_skip_detail_fetch() {
        let details = FakeDetails::new();
        let mut reconciled = window(&[("z", "2024-01-01T00:00:00Z")]);
        reconciled.get_mut("z").unwrap().files = Some(vec![FileChange {
            filename: "doc.md".into(),
            additions: 9,
            deletions: 0,
            status: "added".into(),
        }]);
        let a = analyze(&target(), &reconciled, Vec::new(), &[&details], 4);
        assert_eq!(details.calls.load(Ordering::SeqCst), 0);
        assert_eq!(a.totals, Totals { additions: 9, deletions: 0, images: 0 });
    }

    #[test]
    fn test_failed_detail_contributes_zero_and_continues() {
        let details = FakeDetails { calls: AtomicUsize::new(0), fail_sha: Some("bad") };
        let reconciled = window(&[("bad", "2024-01-01T00:00:00Z"), ("good", "2024-01-02T00:00:00Z")]);
        let a = analyze(&target(), &reconciled, Vec::new(), &[&details], 1);
        assert_eq!(a.misses, 2);
        assert_eq!(a.failures.len(), 1);
        assert!(matches!(a.failures[0], StatsError::DetailFetchFailed { ref sha, .. } if sha == "bad"));
        assert_eq!(a.ledger.len(), 1);
        assert_eq!(a.totals, Totals { additions: 3, deletions: 1, images: 1 });
    }

    #[test]
    fn test_falls_through_to_second_source() {
        let failing = FakeDetails { calls: AtomicUsize::new(0), fail_sha: Some("z") };
        let working = FakeDetails::new();
        let reconciled = window(&[("z", "2024-01-01T00:00:00Z")]);
        let a = analyze(&target(), &reconciled, Vec::new(), &[&failing, &working], 2);
        assert!(a.failures.is_empty());
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(working.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_sources_records_failure() {
        let reconciled = window(&[("z", "2024-01-01T00:00:00Z")]);
        let a = analyze(&target(), &reconciled, Vec::new(), &[], 2);
        assert_eq!(a.failures.len(), 1);
        assert!(a.ledger.is_empty());
    }

    #[test]
    fn test_totals_include_permanent_history() {
        let details = FakeDetails::new();
        let reconciled = window(&[("y", "2023-06-01T00:00:00Z"), ("z", "2024-01-01T00:00:00Z")]);
        let cleaned = vec![
            cached("x", "2021-01-01T00:00:00Z", 100, 10, 2),
            cached("y", "2023-06-01T00:00:00Z", 5, 1, 0),
        ];
        let a = analyze(&target(), &reconciled, cleaned, &[&details], 8);
        assert_eq!(a.hits, 1);
        assert_eq!(a.misses, 1);
        assert_eq!(a.ledger.len(), 3);
        assert_eq!(a.totals, Totals::of(&a.ledger));
        assert_eq!(a.totals, Totals { additions: 108, deletions: 12, images: 3 });
    }

    #[test]
    fn test_batch_size_does_not_change_result() {
        let reconciled = window(&[
            ("a", "2024-01-01T00:00:00Z"),
            ("b", "2024-01-02T00:00:00Z"),
            ("c", "2024-01-03T00:00:00Z"),
            ("d", "2024-01-04T00:00:00Z"),
            ("e", "2024-01-05T00:00:00Z"),
        ]);
        let one = analyze(&target(), &reconciled, Vec::new(), &[&FakeDetails::new()], 1);
        let many = analyze(&target(), &reconciled, Vec::new(), &[&FakeDetails::new()], 3);
        let zero = analyze(&target(), &reconciled, Vec::new(), &[&FakeDetails::new()], 0);
        assert_eq!(one.ledger, many.ledger);
        assert_eq!(one.ledger, zero.ledger);
        assert_eq!(one.totals, Totals { additions: 15, deletions: 5, images: 5 });
    }

    #[test]
    fn test_hit_rate() {
        let details = FakeDetails::new();
        let reconciled = window(&[("a", "2024-01-01T00:00:00Z"), ("b", "2024-01-02T00:00:00Z")]);
        let cleaned = vec![cached("a", "2024-01-01T00:00:00Z", 1, 1, 0)];
        let a = analyze(&target(), &reconciled, cleaned, &[&details], 2);
        assert!((a.hit_rate() - 50.0).abs() < f64::EPSILON);
    }
}
