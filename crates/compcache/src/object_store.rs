//! Content-addressed storage of compilation results.
//!
//! Each entry is a directory `objects/<shard>/<key>/` holding the object payload, the captured
//! output streams and a small `entry.json`. Entries are assembled in a private staging
//! directory next to their final location and published by a single directory rename, so a
//! reader sees either the complete entry or nothing.

use crate::error::CacheError;
use crate::key::{CacheKey, ManifestKey, CACHE_LAYOUT_VERSION};
use crate::lock::LockManager;
use crate::manifest::ManifestEntry;
use crate::util;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const OBJECT_FILE: &str = "object";
const STDOUT_FILE: &str = "stdout";
const STDERR_FILE: &str = "stderr";
const META_FILE: &str = "entry.json";

/// A stored compilation result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub object: Vec<u8>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes the entry occupies on disk, metadata included.
    pub size: u64,
    pub created_at_millis: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    format_version: u32,
    key: CacheKey,
    object_len: u64,
    stdout_len: u64,
    stderr_len: u64,
    created_at_millis: u64,
}

/// Result of a `put`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PutOutcome {
    pub size: u64,
    /// `false` when an entry with the same key was already published; the existing one wins.
    pub published: bool,
}

/// Summary of a published entry, used for eviction ordering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: CacheKey,
    pub size: u64,
    pub last_access_millis: u64,
}

/// The `has/fetch/put` contract of the remote tier, mirroring [`ObjectStore`].
///
/// Backends that also share direct-mode manifests override the `*_manifest` methods; the
/// defaults store nothing.
pub trait ObjectBackend: Send + Sync {
    fn has(&self, key: &CacheKey) -> Result<bool, CacheError>;
    fn fetch(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;
    fn put(
        &self,
        key: &CacheKey,
        object: &[u8],
        stdout: &[u8],
        stderr: &[u8],
    ) -> Result<PutOutcome, CacheError>;

    /// Manifest entries stored under `key`, most recently used first.
    fn fetch_manifest(&self, _key: &ManifestKey) -> Result<Option<Vec<ManifestEntry>>, CacheError> {
        Ok(None)
    }

    /// Replaces the entries stored under `key`.
    fn put_manifest(&self, _key: &ManifestKey, _entries: &[ManifestEntry]) -> Result<(), CacheError> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ObjectStore {
    dir: PathBuf,
    locks: LockManager,
}

impl ObjectStore {
    pub fn new(dir: impl Into<PathBuf>, locks: LockManager) -> Self {
        Self {
            dir: dir.into(),
            locks,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.shard()).join(key.as_str())
    }

    pub fn has(&self, key: &CacheKey) -> bool {
        self.entry_dir(key).join(META_FILE).is_file()
    }

    /// Reads a published entry.
    ///
    /// An entry whose files disagree with its metadata is deleted and reported as absent. The
    /// access marker is refreshed best-effort.
    pub fn fetch(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let dir = self.entry_dir(key);
        let Some(meta_bytes) = util::read_file_limited(&dir.join(META_FILE)) else {
            return Ok(None);
        };

        let entry = match read_entry(&dir, key, &meta_bytes) {
            Ok(entry) => entry,
            Err(reason) => {
                tracing::warn!(
                    target = "compcache",
                    key = %key,
                    reason,
                    "removing corrupt cache entry"
                );
                if let Err(err) = util::remove_dir_atomically(&dir) {
                    tracing::debug!(
                        target = "compcache",
                        path = %dir.display(),
                        error = %err,
                        "failed to remove corrupt cache entry"
                    );
                }
                return Ok(None);
            }
        };

        touch(&dir.join(OBJECT_FILE));
        Ok(Some(entry))
    }

    /// Writes the entry's files into a private staging directory. Nothing is visible to
    /// readers until [`StagedEntry::commit`].
    pub fn stage(
        &self,
        key: &CacheKey,
        object: &[u8],
        stdout: &[u8],
        stderr: &[u8],
    ) -> Result<StagedEntry, CacheError> {
        let shard = self.dir.join(key.shard());
        fs::create_dir_all(&shard)?;
        let staging = shard.join(util::unique_name(
            std::ffi::OsStr::new(key.as_str()),
            util::STAGING_MARKER,
        ));
        fs::create_dir(&staging)?;

        // From here on the guard removes the staging directory on every early return.
        let mut staged = StagedEntry {
            key: key.clone(),
            staging,
            target: self.entry_dir(key),
            size: 0,
            done: false,
        };

        let meta = EntryMeta {
            format_version: CACHE_LAYOUT_VERSION,
            key: key.clone(),
            object_len: object.len() as u64,
            stdout_len: stdout.len() as u64,
            stderr_len: stderr.len() as u64,
            created_at_millis: util::now_millis(),
        };
        let meta_bytes = serde_json::to_vec(&meta)?;

        for (name, bytes) in [
            (OBJECT_FILE, object),
            (STDOUT_FILE, stdout),
            (STDERR_FILE, stderr),
            (META_FILE, meta_bytes.as_slice()),
        ] {
            write_synced(&staged.staging.join(name), bytes)?;
            staged.size += bytes.len() as u64;
        }
        util::sync_dir_best_effort(&staged.staging);
        Ok(staged)
    }

    /// Stages and publishes an entry under the store lock.
    pub fn put(
        &self,
        key: &CacheKey,
        object: &[u8],
        stdout: &[u8],
        stderr: &[u8],
    ) -> Result<PutOutcome, CacheError> {
        let staged = self.stage(key, object, stdout, stderr)?;
        let _lock = self.locks.store()?;
        staged.commit()
    }

    /// Deletes an entry. Returns its size, or `None` if it was not present.
    pub fn remove(&self, key: &CacheKey) -> Result<Option<u64>, CacheError> {
        let dir = self.entry_dir(key);
        if !dir.exists() {
            return Ok(None);
        }
        let size = util::dir_size_bytes(&dir);
        util::remove_dir_atomically(&dir)?;
        Ok(Some(size))
    }

    /// When the entry was last read or written, or `None` if it is not published.
    pub fn last_access_millis(&self, key: &CacheKey) -> Option<u64> {
        access_millis(&self.entry_dir(key))
    }

    /// Every published entry with its on-disk size and last access time.
    pub fn list_entries(&self) -> Result<Vec<StoredEntry>, CacheError> {
        let mut out = Vec::new();
        let shards = match fs::read_dir(&self.dir) {
            Ok(shards) => shards,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err.into()),
        };

        for shard in shards {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let entries = match fs::read_dir(shard.path()) {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for entry in entries {
                let entry = entry?;
                let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                    continue;
                };
                // Staging, trash and foreign names never parse as keys.
                let Ok(key) = CacheKey::parse(&name) else {
                    continue;
                };
                let path = entry.path();
                out.push(StoredEntry {
                    size: util::dir_size_bytes(&path),
                    last_access_millis: access_millis(&path).unwrap_or(0),
                    key,
                });
            }
        }
        Ok(out)
    }

    /// Deletes every entry. Callers hold the store lock.
    pub fn remove_all(&self) -> Result<(), CacheError> {
        let shards = match fs::read_dir(&self.dir) {
            Ok(shards) => shards,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for shard in shards {
            let path = shard?.path();
            util::remove_dir_atomically(&path)?;
        }
        Ok(())
    }
}

/// An entry written to staging but not yet published.
///
/// Dropping it without committing removes the staging directory. A process killed before the
/// commit leaves only a staging directory behind, which `clean` sweeps later.
#[derive(Debug)]
pub struct StagedEntry {
    key: CacheKey,
    staging: PathBuf,
    target: PathBuf,
    size: u64,
    done: bool,
}

impl StagedEntry {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Publishes the entry. Must be called with the store lock held.
    ///
    /// If an entry with this key is already published the staged copy is discarded.
    pub fn commit(mut self) -> Result<PutOutcome, CacheError> {
        self.done = true;
        if self.target.exists() {
            discard(&self.staging);
            return Ok(PutOutcome {
                size: self.size,
                published: false,
            });
        }

        if let Err(err) = fs::rename(&self.staging, &self.target) {
            discard(&self.staging);
            return Err(err.into());
        }
        if let Some(shard) = self.target.parent() {
            util::sync_dir_best_effort(shard);
        }
        Ok(PutOutcome {
            size: self.size,
            published: true,
        })
    }
}

impl Drop for StagedEntry {
    fn drop(&mut self) {
        if !self.done {
            discard(&self.staging);
        }
    }
}

fn discard(staging: &Path) {
    if let Err(err) = util::remove_dir_all_nofollow(staging) {
        tracing::debug!(
            target = "compcache",
            path = %staging.display(),
            error = %err,
            "failed to remove staging directory"
        );
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn read_entry(dir: &Path, key: &CacheKey, meta_bytes: &[u8]) -> Result<CacheEntry, &'static str> {
    let meta: EntryMeta = serde_json::from_slice(meta_bytes).map_err(|_| "unreadable metadata")?;
    if meta.format_version != CACHE_LAYOUT_VERSION {
        return Err("foreign format version");
    }
    if &meta.key != key {
        return Err("metadata names a different key");
    }

    let read = |name: &str, expected: u64| -> Result<Vec<u8>, &'static str> {
        let bytes = fs::read(dir.join(name)).map_err(|_| "missing payload file")?;
        if bytes.len() as u64 != expected {
            return Err("payload length mismatch");
        }
        Ok(bytes)
    };
    let object = read(OBJECT_FILE, meta.object_len)?;
    let stdout = read(STDOUT_FILE, meta.stdout_len)?;
    let stderr = read(STDERR_FILE, meta.stderr_len)?;

    let size = (meta_bytes.len() + object.len() + stdout.len() + stderr.len()) as u64;
    Ok(CacheEntry {
        key: meta.key,
        object,
        stdout,
        stderr,
        size,
        created_at_millis: meta.created_at_millis,
    })
}

fn access_millis(entry_dir: &Path) -> Option<u64> {
    util::modified_millis(&entry_dir.join(OBJECT_FILE))
        .or_else(|| util::modified_millis(&entry_dir.join(META_FILE)))
}

fn touch(path: &Path) {
    let result = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()));
    if let Err(err) = result {
        tracing::debug!(
            target = "compcache",
            path = %path.display(),
            error = %err,
            "failed to update access time"
        );
    }
}
