//! Reconciliation of the local and remote commit views into one per-sha map.
//!
//! Rules:
//! - A sha seen by only one source passes through unchanged.
//! - For a sha seen by both, the remote observation wins only when its
//!   authored timestamp is strictly greater (as text); ties go to local.
//! - A failed source degrades the merge to the other source verbatim.

use serde::Serialize;
use tracing::{debug, warn};

use crate::{CommitMap, CommitObservation, StatsError};

/// Which sources contributed to a reconciliation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceState {
    BothAvailable,
    LocalOnly,
    RemoteOnly,
}

impl SourceState {
    /// `None` when neither source is usable.
    pub fn from_availability(local: bool, remote: bool) -> Option<Self> {
        match (local, remote) {
            (true, true) => Some(SourceState::BothAvailable),
            (true, false) => Some(SourceState::LocalOnly),
            (false, true) => Some(SourceState::RemoteOnly),
            (false, false) => None,
        }
    }
}

/// Result of [`reconcile`]: the merged view plus the failure that was absorbed, if any.
#[derive(Debug)]
pub struct Reconciliation {
    pub state: SourceState,
    pub commits: CommitMap,
    pub local_count: usize,
    pub remote_count: usize,
    pub degraded: Option<StatsError>,
}

/// Collapse one source's list into a map, keeping the later of any duplicate sha.
fn index_by_sha(observations: Vec<CommitObservation>) -> CommitMap {
    let mut map = CommitMap::new();
    for obs in observations {
        match map.get(&obs.sha) {
            Some(existing) if obs.authored_at <= existing.authored_at => {}
            _ => {
                map.insert(obs.sha.clone(), obs);
            }
        }
    }
    map
}

/// Union two views. For a common sha, remote wins only when strictly newer.
pub fn merge(local: Vec<CommitObservation>, remote: Vec<CommitObservation>) -> CommitMap {
    let mut merged = index_by_sha(local);
    for (sha, remote_obs) in index_by_sha(remote) {
        match merged.get(&sha) {
            Some(local_obs) if remote_obs.authored_at <= local_obs.authored_at => {}
            Some(local_obs) => {
                debug!(
                    sha = %sha,
                    local = %local_obs.authored_at,
                    remote = %remote_obs.authored_at,
                    "Remote observation is newer, replacing local"
                );
                merged.insert(sha, remote_obs);
            }
            None => {
                merged.insert(sha, remote_obs);
            }
        }
    }
    merged
}

/// Pure merge for a given source state.
pub fn merge_in_state(
    state: SourceState,
    local: Vec<CommitObservation>,
    remote: Vec<CommitObservation>,
) -> CommitMap {
    match state {
        SourceState::BothAvailable => merge(local, remote),
        SourceState::LocalOnly => index_by_sha(local),
        SourceState::RemoteOnly => index_by_sha(remote),
    }
}

/// Reconcile two source results for one repository.
///
/// A single failed source is logged and carried in [`Reconciliation::degraded`];
/// only when both fail does this return an error (scoped to the repository).
pub fn reconcile(
    local: Result<Vec<CommitObservation>, StatsError>,
    remote: Result<Vec<CommitObservation>, StatsError>,
) -> Result<Reconciliation, StatsError> {
    let state = SourceState::from_availability(local.is_ok(), remote.is_ok());

    let (local, local_err) = split(local);
    let (remote, remote_err) = split(remote);

    let Some(state) = state else {
        let local_msg = local_err.map(|e| e.to_string()).unwrap_or_default();
        let remote_msg = remote_err.map(|e| e.to_string()).unwrap_or_default();
        return Err(StatsError::SourceUnavailable {
            source_name: "local+remote",
            message: format!("{}; {}", local_msg, remote_msg),
        });
    };

    let degraded = local_err.or(remote_err);
    if let Some(ref e) = degraded {
        warn!(error = %e, state = ?state, "Commit source failed, continuing with the other source");
    }

    let local_count = local.len();
    let remote_count = remote.len();
    let commits = merge_in_state(state, local, remote);

    Ok(Reconciliation {
        state,
        commits,
        local_count,
        remote_count,
        degraded,
    })
}

fn split(
    result: Result<Vec<CommitObservation>, StatsError>,
) -> (Vec<CommitObservation>, Option<StatsError>) {
    match result {
        Ok(v) => (v, None),
        Err(e) => (Vec::new(), Some(e)),
    }
}
