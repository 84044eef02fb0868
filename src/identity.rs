//! Append-only set of author identities that belong to the tracked user.
//!
//! The local commit source attributes commits by matching the author against
//! this set. Entries are only ever added: saving merges with whatever is already
//! on disk, so concurrent or older runs can never shrink it.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::StatsError;

/// A `(display name, email)` pair.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            email: email.into().trim().to_string(),
        }
    }

    /// Parse `Name <email>`.
    pub fn parse(s: &str) -> Result<Self, StatsError> {
        let s = s.trim();
        let (name, rest) = s.split_once('<').ok_or_else(|| {
            StatsError::InvalidArgs(format!("Invalid identity '{}': expected 'Name <email>'", s))
        })?;
        let email = rest.strip_suffix('>').ok_or_else(|| {
            StatsError::InvalidArgs(format!("Invalid identity '{}': missing closing '>'", s))
        })?;
        if email.trim().is_empty() {
            return Err(StatsError::InvalidArgs(format!("Invalid identity '{}': empty email", s)));
        }
        Ok(Self::new(name, email))
    }
}

/// The tracked user's known identities.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySet {
    identities: BTreeSet<Identity>,
}

impl IdentitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.iter()
    }

    /// Add an identity. Returns true when it was not known yet.
    pub fn insert(&mut self, identity: Identity) -> bool {
        if identity.email.is_empty() && identity.name.is_empty() {
            return false;
        }
        self.identities.insert(identity)
    }

    /// Union with another set. Returns how many identities were new.
    pub fn extend(&mut self, other: impl IntoIterator<Item = Identity>) -> usize {
        other.into_iter().filter(|id| self.insert(id.clone())).count()
    }

    /// An author matches when its exact pair is known, or its email matches
    /// any known email (case-insensitive).
    pub fn matches(&self, name: &str, email: &str) -> bool {
        let email = email.trim();
        self.identities.iter().any(|id| {
            (!email.is_empty() && id.email.eq_ignore_ascii_case(email))
                || (id.name == name.trim() && id.email == email)
        })
    }

    /// Load from a JSON file. Missing file → empty set.
    pub fn load(path: &Path) -> Result<Self, StatsError> {
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Merge with the file's current contents and write the union back atomically.
    pub fn save(&self, path: &Path) -> Result<(), StatsError> {
        let mut merged = match Self::load(path) {
            Ok(on_disk) => on_disk,
            Err(e) => {
                debug!(error = %e, "Existing identity file unreadable, rewriting");
                Self::new()
            }
        };
        let added = merged.extend(self.identities.iter().cloned());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&serde_json::to_vec_pretty(&merged)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;

        if added > 0 {
            info!(added, total = merged.len(), "Identity set updated");
        }
        Ok(())
    }
}
