use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::fingerprint_cache::FingerprintCache;
use crate::key::{CacheKey, ManifestKey, MANIFEST_FORMAT_VERSION};
use crate::lock::LockManager;
use crate::path::PathNormalizer;
use crate::util;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Maximum number of entries kept per manifest, most recently used first.
pub const MANIFEST_ENTRY_CAP: usize = 10;

/// A header observed during a successful compilation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRecord {
    /// Normalized path (separators unified, base directory collapsed).
    pub path: String,
    pub fingerprint: Fingerprint,
}

/// Headers seen by one prior compilation and the key its result was stored under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub headers: Vec<HeaderRecord>,
    pub cache_key: CacheKey,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestFile {
    format_version: u32,
    entries: Vec<ManifestEntry>,
}

/// Outcome of validating a manifest against the current header contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Validation {
    /// No manifest, or an empty one: this source + command line was never compiled.
    Missing,
    /// Entries exist but every one of them references a changed header.
    Stale,
    Valid(CacheKey),
}

/// Direct-mode manifests, one JSON file per [`ManifestKey`] under `manifests/<shard>/`.
#[derive(Clone, Debug)]
pub struct ManifestStore {
    dir: PathBuf,
    locks: LockManager,
    normalizer: PathNormalizer,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>, locks: LockManager, normalizer: PathNormalizer) -> Self {
        Self {
            dir: dir.into(),
            locks,
            normalizer,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &ManifestKey) -> PathBuf {
        self.dir
            .join(key.shard())
            .join(format!("{}.json", key.as_str()))
    }

    /// Entries recorded under `key`, most recently used first.
    ///
    /// A missing, corrupt or foreign-version manifest reads as empty.
    pub fn lookup(&self, key: &ManifestKey) -> Vec<ManifestEntry> {
        let path = self.path_for(key);
        let Some(bytes) = util::read_file_limited(&path) else {
            return Vec::new();
        };
        match serde_json::from_slice::<ManifestFile>(&bytes) {
            Ok(file) if file.format_version == MANIFEST_FORMAT_VERSION => file.entries,
            Ok(file) => {
                tracing::warn!(
                    target = "compcache",
                    path = %path.display(),
                    found = file.format_version,
                    expected = MANIFEST_FORMAT_VERSION,
                    "ignoring manifest with foreign format version"
                );
                Vec::new()
            }
            Err(err) => {
                tracing::warn!(
                    target = "compcache",
                    path = %path.display(),
                    error = %CacheError::from(err),
                    "ignoring corrupt manifest"
                );
                Vec::new()
            }
        }
    }

    /// Returns the cache key of the most recently used entry whose headers are all unchanged.
    ///
    /// Headers are fingerprinted lazily; an entry is abandoned at its first changed or
    /// unreadable header.
    pub fn find_valid(&self, key: &ManifestKey, fingerprints: &dyn FingerprintCache) -> Validation {
        let entries = self.lookup(key);
        if entries.is_empty() {
            return Validation::Missing;
        }

        let matched = entries
            .iter()
            .position(|entry| self.headers_unchanged(entry, fingerprints));
        let Some(idx) = matched else {
            return Validation::Stale;
        };

        let cache_key = entries[idx].cache_key.clone();
        if idx > 0 {
            if let Err(err) = self.promote(key, &cache_key) {
                tracing::debug!(
                    target = "compcache",
                    manifest = %key,
                    error = %err,
                    "failed to promote manifest entry"
                );
            }
        }
        Validation::Valid(cache_key)
    }

    fn headers_unchanged(&self, entry: &ManifestEntry, fingerprints: &dyn FingerprintCache) -> bool {
        entry.headers.iter().all(|header| {
            let path = self.normalizer.expand(&header.path);
            match fingerprints.fingerprint(&path) {
                Ok(current) => current == header.fingerprint,
                Err(_) => false,
            }
        })
    }

    /// Records `entry` at the front of the manifest, replacing any entry with the same cache
    /// key and dropping the oldest entries past [`MANIFEST_ENTRY_CAP`].
    pub fn record(&self, key: &ManifestKey, entry: ManifestEntry) -> Result<(), CacheError> {
        self.merge(key, vec![entry])
    }

    /// Puts `incoming` in front of the stored entries, keeping the first entry per cache key
    /// and at most [`MANIFEST_ENTRY_CAP`] in total.
    pub fn merge(&self, key: &ManifestKey, incoming: Vec<ManifestEntry>) -> Result<(), CacheError> {
        let _lock = self.locks.manifest_shard(key.shard())?;
        let mut entries = incoming;
        entries.extend(self.lookup(key));
        let mut seen = std::collections::HashSet::new();
        entries.retain(|entry| seen.insert(entry.cache_key.clone()));
        entries.truncate(MANIFEST_ENTRY_CAP);
        self.write(key, entries)
    }

    fn promote(&self, key: &ManifestKey, cache_key: &CacheKey) -> Result<(), CacheError> {
        let _lock = self.locks.manifest_shard(key.shard())?;
        let mut entries = self.lookup(key);
        let Some(idx) = entries.iter().position(|e| &e.cache_key == cache_key) else {
            return Ok(());
        };
        if idx == 0 {
            return Ok(());
        }
        let entry = entries.remove(idx);
        entries.insert(0, entry);
        self.write(key, entries)
    }

    fn write(&self, key: &ManifestKey, entries: Vec<ManifestEntry>) -> Result<(), CacheError> {
        let file = ManifestFile {
            format_version: MANIFEST_FORMAT_VERSION,
            entries,
        };
        let bytes = serde_json::to_vec(&file)?;
        util::atomic_write(&self.path_for(key), &bytes)
    }

    /// Deletes every manifest. Each shard is removed under its own lock.
    pub fn remove_all(&self) -> Result<usize, CacheError> {
        let read_dir = match std::fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut removed = 0;
        for entry in read_dir {
            let entry = entry?;
            let name = entry.file_name();
            let Some(shard) = name.to_str().filter(|n| !util::is_leftover_name(n)) else {
                continue;
            };
            let _lock = self.locks.manifest_shard(shard)?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                removed += std::fs::read_dir(&path).map(|d| d.count()).unwrap_or(0);
                util::remove_dir_atomically(&path)?;
            } else {
                util::remove_file_best_effort(&path, "manifests.clear");
            }
        }
        Ok(removed)
    }
}
