use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::key::CACHE_LAYOUT_VERSION;
use crate::lock::LockManager;
use crate::manifest::ManifestStore;
use crate::object_store::{ObjectStore, PutOutcome, StagedEntry};
use crate::path::PathNormalizer;
use crate::stats::{Counter, Statistics, StatisticsLedger};
use crate::util;
use std::io;
use std::path::{Path, PathBuf};

pub const VERSION_FILE: &str = "VERSION";
pub const STATS_FILE: &str = "stats.json";
pub const OBJECTS_DIR: &str = "objects";
pub const MANIFESTS_DIR: &str = "manifests";
pub const LOCKS_DIR: &str = "locks";

/// An opened cache root and the stores living in it.
///
/// ```text
/// <root>/
///   VERSION            layout version tag
///   config.toml        optional settings
///   stats.json         counters
///   locks/             lockfiles
///   objects/<ab>/<key>/{object,stdout,stderr,entry.json}
///   manifests/<ab>/<key>.json
/// ```
#[derive(Clone, Debug)]
pub struct CacheDir {
    root: PathBuf,
    locks: LockManager,
    objects: ObjectStore,
    manifests: ManifestStore,
    stats: StatisticsLedger,
}

impl CacheDir {
    /// Creates the layout if needed and rebuilds it when the on-disk version differs.
    pub fn open(config: &CacheConfig) -> Result<Self, CacheError> {
        let root = config.root.clone();
        for dir in [OBJECTS_DIR, MANIFESTS_DIR, LOCKS_DIR] {
            std::fs::create_dir_all(root.join(dir)).map_err(|source| {
                CacheError::UnwritableRoot {
                    path: root.clone(),
                    source,
                }
            })?;
        }

        let locks = LockManager::new(root.join(LOCKS_DIR), config.lock_timeout);
        let normalizer = PathNormalizer::new(config.base_dir.as_deref());
        let cache = Self {
            objects: ObjectStore::new(root.join(OBJECTS_DIR), locks.clone()),
            manifests: ManifestStore::new(root.join(MANIFESTS_DIR), locks.clone(), normalizer),
            stats: StatisticsLedger::new(root.join(STATS_FILE), locks.clone()),
            locks,
            root,
        };
        cache.ensure_version()?;
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    pub fn stats(&self) -> &StatisticsLedger {
        &self.stats
    }

    /// Bytes held by published entries, as accounted by the ledger (no directory walk).
    pub fn size(&self) -> Result<u64, CacheError> {
        Ok(self.stats.snapshot()?.cache_size)
    }

    pub fn entry_count(&self) -> Result<u64, CacheError> {
        Ok(self.stats.snapshot()?.entry_count)
    }

    /// Publishes a staged entry under the store lock and accounts it in the ledger, together
    /// with the optional `miss` counter.
    ///
    /// Returns the ledger as it stands afterwards so the caller can decide whether to clean.
    pub fn publish(
        &self,
        staged: StagedEntry,
        miss: Option<Counter>,
    ) -> Result<(PutOutcome, Statistics), CacheError> {
        let _lock = self.locks.store()?;
        let outcome = staged.commit()?;
        let stats = self.stats.update(|stats| {
            if let Some(miss) = miss {
                stats.add(miss, 1);
            }
            if outcome.published {
                stats.add(Counter::CacheSize, outcome.size);
                stats.add(Counter::EntryCount, 1);
            }
            stats.clone()
        })?;
        Ok((outcome, stats))
    }

    fn version_path(&self) -> PathBuf {
        self.root.join(VERSION_FILE)
    }

    fn read_version(&self) -> Option<String> {
        util::read_file_limited(&self.version_path())
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
    }

    fn ensure_version(&self) -> Result<(), CacheError> {
        let expected = CACHE_LAYOUT_VERSION.to_string();
        if self.read_version().as_deref() == Some(expected.as_str()) {
            return Ok(());
        }

        let _lock = self.locks.store().map_err(|err| self.unwritable(err))?;
        match self.read_version() {
            Some(found) if found == expected => return Ok(()),
            Some(found) => {
                let err = CacheError::IncompatibleVersion {
                    expected: CACHE_LAYOUT_VERSION,
                    found,
                };
                tracing::warn!(
                    target = "compcache",
                    root = %self.root.display(),
                    error = %err,
                    "rebuilding cache layout"
                );
                self.objects.remove_all()?;
                self.manifests.remove_all()?;
                self.stats.update(|stats| {
                    stats.cache_size = 0;
                    stats.entry_count = 0;
                })?;
            }
            None => {}
        }

        util::atomic_write(&self.version_path(), format!("{expected}\n").as_bytes())
            .map_err(|err| self.unwritable(err))
    }

    fn unwritable(&self, err: CacheError) -> CacheError {
        match err {
            CacheError::Io(source)
                if matches!(
                    source.kind(),
                    io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem
                ) =>
            {
                CacheError::UnwritableRoot {
                    path: self.root.clone(),
                    source,
                }
            }
            other => other,
        }
    }
}
