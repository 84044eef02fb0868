//! End-to-end tests for the repository pipeline over fake commit sources and
//! an in-memory ledger backend.

use super::*;
use crate::ledger::MemoryBackend;
use crate::{CommitRecord, FileChange, RepoKey};
use std::collections::HashMap;

// ─── Fake commit source ─────────────────────────────────────────────

/// Serves per-repository commit lists. A repository with no entry is unavailable.
struct FakeSource {
    name: &'static str,
    commits: Mutex<HashMap<RepoKey, Vec<CommitObservation>>>,
    detail_calls: AtomicUsize,
}

impl FakeSource {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            commits: Mutex::new(HashMap::new()),
            detail_calls: AtomicUsize::new(0),
        }
    }

    fn set(&self, repo: &RepoKey, commits: Vec<CommitObservation>) {
        self.commits.lock().unwrap().insert(repo.clone(), commits);
    }

    fn unset(&self, repo: &RepoKey) {
        self.commits.lock().unwrap().remove(repo);
    }

    fn calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }
}

impl DetailSource for FakeSource {
    fn name(&self) -> &'static str {
        self.name
    }

    /// Every commit adds 10 lines and removes 2; shas starting with `img` also add an image.
    fn commit_files(&self, _target: &RepoTarget, sha: &str) -> Result<Vec<FileChange>, StatsError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        let mut files = vec![FileChange {
            filename: format!("src/{}.rs", sha),
            additions: 10,
            deletions: 2,
            status: "modified".into(),
        }];
        if sha.starts_with("img") {
            files.push(FileChange {
                filename: format!("assets/{}.png", sha),
                additions: 0,
                deletions: 0,
                status: "added".into(),
            });
        }
        Ok(files)
    }
}

impl CommitSource for FakeSource {
    fn commits(&self, target: &RepoTarget) -> Result<Vec<CommitObservation>, StatsError> {
        self.commits
            .lock()
            .unwrap()
            .get(&target.key)
            .cloned()
            .ok_or(StatsError::SourceUnavailable {
                source_name: self.name,
                message: "offline".into(),
            })
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

struct Fixture {
    store: LedgerStore<MemoryBackend>,
    local: FakeSource,
    remote: FakeSource,
    identities: RwLock<IdentitySet>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            store: LedgerStore::new(MemoryBackend::new()),
            local: FakeSource::new("local"),
            remote: FakeSource::new("remote"),
            identities: RwLock::new(IdentitySet::new()),
        }
    }

    fn pipeline(&self) -> Pipeline<'_, MemoryBackend, FakeSource, FakeSource> {
        Pipeline::new(&self.store, &self.local, &self.remote, &self.identities).with_batch_size(2)
    }
}

fn widgets() -> RepoKey {
    RepoKey::new("octo", "widgets")
}

fn target(key: &RepoKey) -> RepoTarget {
    RepoTarget::remote_only(key.clone())
}

fn obs(sha: &str, day: u32) -> CommitObservation {
    CommitObservation::new(sha, format!("2024-01-{:02}T00:00:00Z", day))
}

fn stored(key: &RepoKey, sha: &str, ts: &str, additions: u64) -> CommitRecord {
    CommitRecord {
        index: 0,
        url: key.commit_url(sha),
        additions,
        deletions: 0,
        images: 0,
        timestamp: ts.into(),
    }
}

// ─── Single repository ──────────────────────────────────────────────

#[test]
fn test_first_run_computes_everything_second_run_is_all_hits() {
    let fx = Fixture::new();
    let key = widgets();
    fx.local.set(&key, vec![obs("aaa", 1), obs("img1", 2)]);
    fx.remote.set(&key, vec![obs("aaa", 1), obs("ccc", 3)]);

    let first = fx.pipeline().process_repository(&target(&key));
    assert_eq!(first.state, Some(SourceState::BothAvailable));
    assert_eq!((first.hits, first.misses, first.failed), (0, 3, 0));
    assert_eq!(first.totals, Totals { additions: 30, deletions: 6, images: 1 });
    assert!(first.persisted);
    assert_eq!(first.records, 3);

    let calls_after_first = fx.local.calls() + fx.remote.calls();
    let second = fx.pipeline().process_repository(&target(&key));
    assert_eq!((second.hits, second.misses), (3, 0));
    assert_eq!(second.totals, first.totals);
    assert_eq!(fx.local.calls() + fx.remote.calls(), calls_after_first, "hits never fetch details");
}

#[test]
fn test_observation_files_skip_detail_fetch() {
    let fx = Fixture::new();
    let key = widgets();
    let with_files = obs("aaa", 1).with_files(vec![FileChange {
        filename: "a.rs".into(),
        additions: 4,
        deletions: 4,
        status: "modified".into(),
    }]);
    fx.local.set(&key, vec![with_files]);
    fx.remote.set(&key, vec![]);

    let report = fx.pipeline().process_repository(&target(&key));
    assert_eq!(report.totals, Totals { additions: 4, deletions: 4, images: 0 });
    assert_eq!(fx.local.calls() + fx.remote.calls(), 0);
}

#[test]
fn test_rewritten_commit_dropped_permanent_history_kept() {
    let fx = Fixture::new();
    let key = widgets();
    fx.store
        .save(
            &key,
            vec![
                stored(&key, "old", "2020-06-01T00:00:00Z", 100),
                stored(&key, "aaa", "2024-01-01T00:00:00Z", 10),
                stored(&key, "rebased", "2024-01-02T00:00:00Z", 50),
            ],
        )
        .unwrap();

    // "rebased" vanished from inside the window; "old" predates it.
    fx.local.set(&key, vec![obs("aaa", 1), obs("new", 3)]);
    fx.remote.set(&key, vec![obs("aaa", 1)]);

    let report = fx.pipeline().process_repository(&target(&key));
    assert_eq!(report.dropped, 1);
    assert_eq!((report.hits, report.misses), (1, 1));
    assert_eq!(report.totals.additions, 100 + 10 + 10);

    let (ledger, _) = fx.store.load(&key);
    let urls: Vec<&str> = ledger.iter().map(|r| r.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![key.commit_url("old"), key.commit_url("aaa"), key.commit_url("new")]
    );
    let indices: Vec<usize> = ledger.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![1, 2, 3]);
}

#[test]
fn test_remote_unavailable_degrades_to_local() {
    let fx = Fixture::new();
    let key = widgets();
    fx.local.set(&key, vec![obs("aaa", 1), obs("bbb", 2)]);

    let report = fx.pipeline().process_repository(&target(&key));
    assert_eq!(report.state, Some(SourceState::LocalOnly));
    assert_eq!(report.records, 2);
    assert!(report.persisted);
    assert!(report.degraded.as_deref().is_some_and(|d| d.contains("remote")));
    assert!(report.errors.is_empty(), "degradation is not an error");
}

#[test]
fn test_image_only_stored_entries_are_recomputed() {
    let fx = Fixture::new();
    let key = widgets();
    fx.store
        .backend()
        .put(
            "octo/widgets",
            br#"{
                "_metadata": { "last_updated": "2024-01-05T00:00:00", "total_commits": 1 },
                "data": { "octo/widgets": {
                    "aaa": { "images": [], "image_count": 0, "timestamp": "2024-01-01T00:00:00" }
                } }
            }"#,
        )
        .unwrap();
    fx.remote.set(&key, vec![obs("aaa", 1)]);

    let report = fx.pipeline().process_repository(&target(&key));
    assert_eq!((report.hits, report.misses), (0, 1));
    assert_eq!(report.totals, Totals { additions: 10, deletions: 2, images: 0 });
    assert_eq!(fx.store.load(&key).0[0].additions, 10);
}

#[test]
fn test_both_unavailable_skips_without_saving() {
    let fx = Fixture::new();
    let key = widgets();
    fx.store.save(&key, vec![stored(&key, "aaa", "2024-01-01T00:00:00Z", 7)]).unwrap();

    let report = fx.pipeline().process_repository(&target(&key));
    assert_eq!(report.state, None);
    assert!(!report.persisted);
    assert_eq!(report.totals.additions, 7, "previous ledger still counts");
    assert_eq!(fx.store.load(&key).0.len(), 1);
}

#[test]
fn test_corrupt_ledger_recomputes_from_scratch() {
    let fx = Fixture::new();
    let key = widgets();
    fx.store.backend().put("octo/widgets", b"garbage").unwrap();
    fx.remote.set(&key, vec![obs("aaa", 1)]);

    let report = fx.pipeline().process_repository(&target(&key));
    assert!(report.errors.iter().any(|e| e.contains("Corrupt ledger")));
    assert_eq!(report.misses, 1);
    assert!(report.persisted);
    assert!(fx.store.load(&key).1.is_none(), "rewritten in the current shape");
}

#[test]
fn test_remote_authors_are_learned() {
    let fx = Fixture::new();
    let key = widgets();
    let mut authored = obs("aaa", 1);
    authored.author = Some(("Jane Doe".into(), "jane@example.com".into()));
    fx.remote.set(&key, vec![authored, obs("bbb", 2)]);

    fx.pipeline().process_repository(&target(&key));
    let ids = fx.identities.read().unwrap();
    assert_eq!(ids.len(), 1);
    assert!(ids.matches("Jane Doe", "jane@example.com"));
}

// ─── Multi-repository run ───────────────────────────────────────────

#[test]
fn test_run_processes_every_repository_in_order() {
    let fx = Fixture::new();
    let keys: Vec<RepoKey> = (0..5).map(|i| RepoKey::new("octo", format!("repo{}", i))).collect();
    for (i, key) in keys.iter().enumerate() {
        fx.remote.set(key, (0..=i).map(|d| obs(&format!("c{}", d), d as u32 + 1)).collect());
    }
    let targets: Vec<RepoTarget> = keys.iter().map(target).collect();

    let summary = fx.pipeline().run(&targets, 3, &RunControl::default());
    assert!(!summary.interrupted());
    let names: Vec<&str> = summary.repositories.iter().map(|r| r.repository.as_str()).collect();
    assert_eq!(names, vec!["octo/repo0", "octo/repo1", "octo/repo2", "octo/repo3", "octo/repo4"]);
    // 1 + 2 + 3 + 4 + 5 commits, 10 additions each
    assert_eq!(summary.totals.additions, 150);
    assert_eq!(fx.store.metadata().unwrap().unwrap().total_commits, 15);
}

#[test]
fn test_run_isolates_failing_repository() {
    let fx = Fixture::new();
    let good = RepoKey::new("octo", "good");
    let bad = RepoKey::new("octo", "bad");
    fx.remote.set(&good, vec![obs("aaa", 1)]);
    fx.local.unset(&bad);

    let summary = fx.pipeline().run(&[target(&bad), target(&good)], 2, &RunControl::default());
    assert_eq!(summary.repositories.len(), 2);
    assert_eq!(summary.with_errors(), 1, "only the skipped repository counts");
    assert!(summary.repositories[1].degraded.is_some());
    assert!(!summary.repositories[0].persisted);
    assert!(summary.repositories[1].persisted);
    assert_eq!(summary.totals.additions, 10);
}

#[test]
fn test_stopped_run_lists_not_started() {
    let fx = Fixture::new();
    let targets = vec![target(&widgets()), target(&RepoKey::new("octo", "gadgets"))];
    let control = RunControl::new(None);
    control.stop();

    let summary = fx.pipeline().run(&targets, 2, &control);
    assert!(summary.interrupted());
    assert!(summary.repositories.is_empty());
    assert_eq!(summary.not_started, vec!["octo/widgets", "octo/gadgets"]);
}

#[test]
fn test_stopped_run_keeps_stored_totals() {
    let fx = Fixture::new();
    let a = RepoKey::new("octo", "a");
    let b = RepoKey::new("octo", "b");
    fx.remote.set(&a, vec![obs("aaa", 1)]);
    fx.remote.set(&b, vec![obs("bbb", 2)]);
    let targets = vec![target(&a), target(&b)];

    let full = fx.pipeline().run(&targets, 2, &RunControl::default());
    assert_eq!(full.totals, Totals { additions: 20, deletions: 4, images: 0 });

    let control = RunControl::new(None);
    control.stop();
    let stopped = fx.pipeline().run(&targets, 2, &control);
    assert!(stopped.interrupted());
    assert_eq!(stopped.totals, full.totals);
}

#[test]
fn test_expired_deadline_stops_run() {
    let control = RunControl::new(Some(Duration::ZERO));
    assert!(control.should_stop());
    assert!(!RunControl::new(Some(Duration::from_secs(3600))).should_stop());
}

#[test]
fn test_summary_serializes_to_json() {
    let fx = Fixture::new();
    fx.remote.set(&widgets(), vec![obs("img1", 1)]);
    let summary = fx.pipeline().run(&[target(&widgets())], 1, &RunControl::default());
    let value = serde_json::to_value(&summary).unwrap();
    assert_eq!(value["totals"]["images"], 1);
    assert_eq!(value["repositories"][0]["state"], "remote-only");
}
