//! Key-value backends for ledger persistence.
//!
//! Keys are repository keys (`owner/name`) plus reserved keys starting with `_`
//! (store metadata). [`LedgerBackend::list`] never returns reserved keys.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::StatsError;

/// Reserved key holding [`super::StoreMetadata`].
pub const STORE_METADATA_KEY: &str = "_store";

const LEDGER_EXT: &str = "json";

/// Storage surface for ledgers. Implementations must make `put` atomic: a
/// reader sees either the previous value or the new one, never a mix.
pub trait LedgerBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StatsError>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StatsError>;
    /// All non-reserved keys, sorted.
    fn list(&self) -> Result<Vec<String>, StatsError>;
    /// Remove everything. Returns the number of entries removed.
    fn clear(&self) -> Result<usize, StatsError>;
}

fn is_reserved(key: &str) -> bool {
    key.starts_with('_')
}

// ─── Filesystem backend ─────────────────────────────────────────────

/// One JSON file per key: `<root>/<owner>/<name>.json`, `<root>/_store.json`.
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to its file. Rejects keys that could escape the root.
    fn path_for(&self, key: &str) -> Result<PathBuf, StatsError> {
        let valid = !key.is_empty()
            && key.split('/').count() <= 2
            && key.split('/').all(|part| !part.is_empty() && part != "." && part != "..")
            && !key.contains('\\');
        if !valid {
            return Err(StatsError::InvalidArgs(format!("Invalid storage key '{}'", key)));
        }
        Ok(self.root.join(format!("{}.{}", key, LEDGER_EXT)))
    }
}

impl LedgerBackend for FsBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StatsError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomic write: write to temp file, flush, then rename over the target.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StatsError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));
        let write_result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            StatsError::Io(e)
        })
    }

    fn list(&self) -> Result<Vec<String>, StatsError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for owner_entry in fs::read_dir(&self.root)?.flatten() {
            let owner_path = owner_entry.path();
            if !owner_path.is_dir() {
                continue;
            }
            let Some(owner) = owner_path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            if is_reserved(&owner) {
                continue;
            }
            for entry in fs::read_dir(&owner_path)?.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == LEDGER_EXT) {
                    if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                        keys.push(format!("{}/{}", owner, name));
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> Result<usize, StatsError> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut removed = self.list()?.len();
        if self.path_for(STORE_METADATA_KEY)?.exists() {
            removed += 1;
        }
        fs::remove_dir_all(&self.root)?;
        Ok(removed)
    }
}

// ─── In-memory backend ──────────────────────────────────────────────

/// Map-backed store for tests and dry runs.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LedgerBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StatsError> {
        Ok(self.lock().get(key).cloned())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StatsError> {
        self.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StatsError> {
        Ok(self.lock().keys().filter(|k| !is_reserved(k)).cloned().collect())
    }

    fn clear(&self) -> Result<usize, StatsError> {
        let mut entries = self.lock();
        let n = entries.len();
        entries.clear();
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_backend_roundtrip_and_list() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(tmp.path());
        backend.put("octo/widgets", b"{}").unwrap();
        backend.put("octo/gadgets", b"[]").unwrap();
        backend.put(STORE_METADATA_KEY, b"{}").unwrap();

        assert_eq!(backend.get("octo/widgets").unwrap().as_deref(), Some(&b"{}"[..]));
        assert_eq!(backend.list().unwrap(), vec!["octo/gadgets", "octo/widgets"]);
        assert!(tmp.path().join("octo").join("widgets.json").exists());
        assert!(tmp.path().join("_store.json").exists());
    }

    #[test]
    fn test_fs_backend_missing_key_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(tmp.path().join("never-created"));
        assert!(backend.get("octo/widgets").unwrap().is_none());
        assert!(backend.list().unwrap().is_empty());
    }

    #[test]
    fn test_fs_backend_put_replaces_and_leaves_no_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(tmp.path());
        backend.put("octo/widgets", b"old").unwrap();
        backend.put("octo/widgets", b"new").unwrap();
        assert_eq!(backend.get("octo/widgets").unwrap().unwrap(), b"new");
        let leftovers: Vec<_> = fs::read_dir(tmp.path().join("octo"))
            .unwrap()
            .flatten()
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_fs_backend_rejects_escaping_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(tmp.path());
        assert!(backend.put("../evil", b"x").is_err());
        assert!(backend.put("a/b/c", b"x").is_err());
        assert!(backend.put("", b"x").is_err());
    }

    #[test]
    fn test_fs_backend_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("cache");
        let backend = FsBackend::new(&root);
        backend.put("octo/widgets", b"{}").unwrap();
        backend.put(STORE_METADATA_KEY, b"{}").unwrap();
        assert_eq!(backend.clear().unwrap(), 2);
        assert!(!root.exists());
        assert_eq!(backend.clear().unwrap(), 0);
    }

    #[test]
    fn test_memory_backend_hides_reserved_keys() {
        let backend = MemoryBackend::new();
        backend.put("octo/widgets", b"1").unwrap();
        backend.put(STORE_METADATA_KEY, b"2").unwrap();
        assert_eq!(backend.list().unwrap(), vec!["octo/widgets"]);
        assert_eq!(backend.clear().unwrap(), 2);
        assert!(backend.get("octo/widgets").unwrap().is_none());
    }
}
