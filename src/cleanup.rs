//! Stale cache cleanup: drop ledger records whose commits were rewritten upstream.
//!
//! A record missing from the reconciled view is either permanent history the
//! sources can no longer see (older than everything they report) or a commit
//! that disappeared from inside the observable window, i.e. was rebased away.
//!
//! The heuristic cannot tell a rewritten commit that kept its authored
//! timestamp and identity apart from one still present; it only ever compares
//! identity and timestamp.

use std::collections::HashSet;

use tracing::debug;

use crate::{CommitMap, Ledger, RepoKey};

/// Earliest authored timestamp in the reconciled view.
pub fn window_floor(reconciled: &CommitMap) -> Option<&str> {
    reconciled.values().map(|o| o.authored_at.as_str()).min()
}

/// Prune `previous` against the reconciled view.
///
/// - identity present in `reconciled` → keep
/// - absent and strictly older than the window floor → keep (permanent history)
/// - absent otherwise → drop (rewritten or removed upstream)
///
/// An empty reconciled view has no floor; every record is kept.
pub fn clean(repo: &RepoKey, previous: Ledger, reconciled: &CommitMap) -> Ledger {
    let Some(floor) = window_floor(reconciled) else {
        return previous;
    };

    let present: HashSet<String> = reconciled.keys().map(|sha| repo.commit_url(sha)).collect();

    let before = previous.len();
    let kept: Ledger = previous
        .into_iter()
        .filter(|record| present.contains(&record.url) || record.timestamp.as_str() < floor)
        .collect();

    let dropped = before - kept.len();
    if dropped > 0 {
        debug!(repo = %repo, dropped, floor, "Dropped stale ledger records");
    }
    kept
}
