//! Ledger store: load, normalize and save per-repository commit records.
//!
//! ## Stored shapes
//!
//! Four historical shapes are decoded at this boundary and nothing else ever
//! sees them:
//! - `VersionedList`: `{ "_metadata": {..}, "data": [CommitRecord, ..] }` (current)
//! - `WrappedMapping`: `{ "_metadata": {..}, "data": { "owner/repo": { sha: stats } } }`
//! - `RepoMapping`: `{ "owner/repo": { sha: stats } }`
//! - `LegacyMapping`: `{ sha-or-url: stats }`
//!
//! Mapping entries without line counts (image-only stats) are dropped, so the
//! next run treats those commits as misses and computes them in full.
//!
//! Saving always writes `VersionedList`.

pub mod storage;

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{CommitRecord, Ledger, RepoKey, StatsError, normalize_timestamp, now_timestamp};

pub use storage::{FsBackend, LedgerBackend, MemoryBackend, STORE_METADATA_KEY};

/// Ledger document format version. Bump when the record layout changes.
pub const FORMAT_VERSION: u32 = 2;

// ─── Persisted documents ────────────────────────────────────────────

/// Header of one repository's ledger document.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerMetadata {
    pub last_updated: String,
    pub total_commits: usize,
    #[serde(default)]
    pub format_version: u32,
}

/// Current on-disk document.
#[derive(Debug, Serialize, Deserialize)]
pub struct LedgerDocument {
    #[serde(rename = "_metadata")]
    pub metadata: LedgerMetadata,
    pub data: Vec<CommitRecord>,
}

/// Store-wide metadata, recomputed on every save.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreMetadata {
    pub last_updated: String,
    /// Sum of ledger lengths across every repository in the store.
    pub total_commits: usize,
    pub repositories: usize,
}

/// Per-commit stats in the mapping shapes.
#[derive(Debug, Deserialize)]
struct LegacyStats {
    #[serde(default)]
    additions: Option<u64>,
    #[serde(default)]
    deletions: Option<u64>,
    #[serde(default)]
    image_count: Option<u64>,
    #[serde(default)]
    images: LegacyImages,
    timestamp: String,
}

/// Older ledgers stored either an image count or the list of image paths.
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum LegacyImages {
    Count(u64),
    Paths(Vec<String>),
    #[default]
    Missing,
}

impl LegacyStats {
    fn image_count(&self) -> u64 {
        self.image_count.unwrap_or(match &self.images {
            LegacyImages::Count(n) => *n,
            LegacyImages::Paths(paths) => paths.len() as u64,
            LegacyImages::Missing => 0,
        })
    }
}

/// Every shape a ledger file has had. Variant order matters: untagged decoding
/// tries them top to bottom.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredShape {
    VersionedList {
        #[serde(rename = "_metadata")]
        #[allow(dead_code)]
        metadata: serde_json::Value,
        data: Vec<CommitRecord>,
    },
    WrappedMapping {
        #[serde(rename = "_metadata")]
        #[allow(dead_code)]
        metadata: serde_json::Value,
        data: BTreeMap<String, BTreeMap<String, LegacyStats>>,
    },
    RepoMapping(BTreeMap<String, BTreeMap<String, LegacyStats>>),
    LegacyMapping(BTreeMap<String, LegacyStats>),
}

// ─── Normalization ──────────────────────────────────────────────────

/// Canonical identity for a stored key: urls are kept (sha lowercased), bare
/// shas become this repository's commit url.
fn canonical_url(repo: &RepoKey, id: &str) -> String {
    let id = id.trim();
    match id.rsplit_once("/commit/") {
        Some((_, sha)) => repo.commit_url(sha),
        None => repo.commit_url(id),
    }
}

fn from_mapping(repo: &RepoKey, mapping: BTreeMap<String, LegacyStats>) -> Ledger {
    let total = mapping.len();
    let records: Ledger = mapping
        .into_iter()
        .filter_map(|(id, stats)| {
            if stats.additions.is_none() && stats.deletions.is_none() {
                return None;
            }
            Some(CommitRecord {
                index: 0,
                url: canonical_url(repo, &id),
                additions: stats.additions.unwrap_or(0),
                deletions: stats.deletions.unwrap_or(0),
                images: stats.image_count(),
                timestamp: stats.timestamp,
            })
        })
        .collect();
    if records.len() < total {
        info!(
            repo = %repo,
            dropped = total - records.len(),
            "Stored entries without line counts will be recomputed"
        );
    }
    records
}

/// Pick this repository's entry from a repository-keyed mapping, or the only one.
fn select_repo(
    repo: &RepoKey,
    mut data: BTreeMap<String, BTreeMap<String, LegacyStats>>,
) -> BTreeMap<String, LegacyStats> {
    let key = repo.to_string();
    match data.remove(&key) {
        Some(inner) => inner,
        None if data.len() == 1 => data.into_values().next().unwrap_or_default(),
        None => BTreeMap::new(),
    }
}

/// Decode raw bytes into a ledger for `repo`.
pub fn decode(repo: &RepoKey, bytes: &[u8]) -> Result<Ledger, StatsError> {
    let shape: StoredShape = serde_json::from_slice(bytes).map_err(|e| StatsError::CorruptLedger {
        key: repo.to_string(),
        message: e.to_string(),
    })?;

    let records = match shape {
        StoredShape::VersionedList { data, .. } => data,
        StoredShape::WrappedMapping { data, .. } => {
            debug!(repo = %repo, "Decoded wrapped-mapping ledger");
            from_mapping(repo, select_repo(repo, data))
        }
        StoredShape::RepoMapping(data) => {
            debug!(repo = %repo, "Decoded repository-mapping ledger");
            from_mapping(repo, select_repo(repo, data))
        }
        StoredShape::LegacyMapping(mapping) => {
            debug!(repo = %repo, "Decoded legacy-mapping ledger");
            from_mapping(repo, mapping)
        }
    };

    Ok(normalize(repo, records))
}

/// Canonicalize identities and timestamps, and drop duplicate identities
/// (first occurrence wins).
pub fn normalize(repo: &RepoKey, records: Ledger) -> Ledger {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter_map(|mut record| {
            record.url = canonical_url(repo, &record.url);
            record.timestamp = normalize_timestamp(&record.timestamp);
            seen.insert(record.url.clone()).then_some(record)
        })
        .collect()
}

/// Sort by authored timestamp (url breaks ties) and assign indices 1..N.
///
/// This is the only place indices are assigned.
pub fn canonicalize(repo: &RepoKey, records: Ledger) -> Ledger {
    let mut records = normalize(repo, records);
    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.url.cmp(&b.url)));
    for (i, record) in records.iter_mut().enumerate() {
        record.index = i + 1;
    }
    records
}

// ─── Store ──────────────────────────────────────────────────────────

/// Ledger persistence over an injected [`LedgerBackend`].
///
/// Safe to share between repository workers: each repository has its own key,
/// and the store-wide record counts are guarded by a mutex.
pub struct LedgerStore<B: LedgerBackend> {
    backend: B,
    /// repository key → ledger length, loaded lazily on first save.
    counts: Mutex<Option<BTreeMap<String, usize>>>,
}

impl<B: LedgerBackend> LedgerStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            counts: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Load a repository's ledger. Missing → empty. Corrupt → `Err(CorruptLedger)`.
    pub fn try_load(&self, repo: &RepoKey) -> Result<Ledger, StatsError> {
        match self.backend.get(&repo.to_string())? {
            Some(bytes) => decode(repo, &bytes),
            None => Ok(Vec::new()),
        }
    }

    /// Load a repository's ledger, treating unreadable storage as empty.
    ///
    /// Returns the ledger plus the error that was absorbed, if any.
    pub fn load(&self, repo: &RepoKey) -> (Ledger, Option<StatsError>) {
        match self.try_load(repo) {
            Ok(ledger) => {
                debug!(repo = %repo, records = ledger.len(), "Loaded ledger");
                (ledger, None)
            }
            Err(e) => {
                warn!(repo = %repo, error = %e, "Ledger unreadable, starting from empty");
                let err = match e {
                    e @ StatsError::CorruptLedger { .. } => e,
                    other => StatsError::CorruptLedger {
                        key: repo.to_string(),
                        message: other.to_string(),
                    },
                };
                (Vec::new(), Some(err))
            }
        }
    }

    /// Canonicalize and persist a repository's ledger, then refresh store metadata.
    ///
    /// Returns the canonical ledger that was written. On failure the previous
    /// snapshot is untouched and `PersistFailure` is returned.
    pub fn save(&self, repo: &RepoKey, ledger: Ledger) -> Result<Ledger, StatsError> {
        let key = repo.to_string();
        let persist_err = |message: String| StatsError::PersistFailure {
            key: key.clone(),
            message,
        };

        let records = canonicalize(repo, ledger);
        let now = now_timestamp();
        let doc = LedgerDocument {
            metadata: LedgerMetadata {
                last_updated: now.clone(),
                total_commits: records.len(),
                format_version: FORMAT_VERSION,
            },
            data: records,
        };

        let bytes = serde_json::to_vec_pretty(&doc).map_err(|e| persist_err(e.to_string()))?;
        self.backend.put(&key, &bytes).map_err(|e| persist_err(e.to_string()))?;

        info!(repo = %repo, records = doc.data.len(), "Ledger saved");

        if let Err(e) = self.refresh_metadata(&key, doc.data.len(), now) {
            warn!(repo = %repo, error = %e, "Failed to update store metadata");
        }

        Ok(doc.data)
    }

    fn refresh_metadata(&self, key: &str, len: usize, now: String) -> Result<(), StatsError> {
        let mut guard = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(self.scan_counts()?);
        }
        let counts = guard.get_or_insert_with(BTreeMap::new);
        counts.insert(key.to_string(), len);

        let meta = StoreMetadata {
            last_updated: now,
            total_commits: counts.values().sum(),
            repositories: counts.len(),
        };
        let bytes = serde_json::to_vec_pretty(&meta)?;
        self.backend.put(STORE_METADATA_KEY, &bytes)
    }

    /// Ledger length of every stored repository. Unreadable ledgers count as 0.
    fn scan_counts(&self) -> Result<BTreeMap<String, usize>, StatsError> {
        let mut counts = BTreeMap::new();
        for key in self.backend.list()? {
            let len = match RepoKey::parse(&key) {
                Ok(repo) => self.try_load(&repo).map(|l| l.len()).unwrap_or(0),
                Err(_) => 0,
            };
            counts.insert(key, len);
        }
        Ok(counts)
    }

    /// Last written store metadata, if any.
    pub fn metadata(&self) -> Result<Option<StoreMetadata>, StatsError> {
        match self.backend.get(STORE_METADATA_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every stored repository with its ledger (or the reason it could not be read).
    pub fn repositories(&self) -> Result<Vec<(String, Result<Ledger, StatsError>)>, StatsError> {
        Ok(self
            .backend
            .list()?
            .into_iter()
            .map(|key| {
                let ledger = RepoKey::parse(&key).and_then(|repo| self.try_load(&repo));
                (key, ledger)
            })
            .collect())
    }

    /// Remove every ledger and the store metadata.
    pub fn clear(&self) -> Result<usize, StatsError> {
        let removed = self.backend.clear()?;
        *self.counts.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(removed)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;
