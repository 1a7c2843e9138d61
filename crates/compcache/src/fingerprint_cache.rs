//! Header fingerprint providers consulted during manifest validation.
//!
//! [`DirectRead`] re-hashes on every call. [`WatchedFingerprints`] keeps digests in memory
//! and relies on change notifications to forget them; with the `watch-notify` feature it can
//! subscribe to OS notifications itself.
//!
//! Invalidation rules for the in-memory variant:
//! - an event for a path forgets that path and everything below it, so directory deletes and
//!   renames drop every header that lived there
//! - a digest computed while any invalidation happened is not remembered; the next lookup
//!   hashes again
//! - watcher errors and rescan requests forget everything
//! - paths are compared by their resolved identity, so `sub/../bar.h`, a symlinked checkout
//!   and the spelling a watcher reports all name the same entry

use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Source of current header fingerprints.
pub trait FingerprintCache: Send + Sync {
    fn fingerprint(&self, path: &Path) -> Result<Fingerprint, CacheError>;
}

/// Always reads and hashes the file.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectRead;

impl FingerprintCache for DirectRead {
    fn fingerprint(&self, path: &Path) -> Result<Fingerprint, CacheError> {
        Fingerprint::from_file(path)
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<PathBuf, Fingerprint>,
    generation: u64,
}

/// The spelling a path is remembered and invalidated under: symlinks and `..` resolved, and
/// on case-insensitive targets lowercased.
///
/// A path that no longer exists resolves through its parent, which keeps delete and rename
/// events comparable with what was cached before.
fn path_identity(path: &Path) -> PathBuf {
    let resolved = std::fs::canonicalize(path)
        .or_else(|err| match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => {
                std::fs::canonicalize(parent).map(|parent| parent.join(name))
            }
            _ => Err(err),
        })
        .unwrap_or_else(|_| path.to_path_buf());
    fold_case(resolved, cfg!(windows))
}

fn fold_case(path: PathBuf, case_insensitive: bool) -> PathBuf {
    if case_insensitive {
        PathBuf::from(path.to_string_lossy().to_lowercase())
    } else {
        path
    }
}

impl Shared {
    fn invalidate(&self, path: &Path) {
        let path = path_identity(path);
        let mut state = self.state.lock();
        state.generation += 1;
        state.entries.retain(|cached, _| !cached.starts_with(&path));
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.entries.clear();
    }
}

/// In-memory fingerprint cache kept fresh by change notifications.
///
/// Clones share the cached digests and the watcher.
#[derive(Clone)]
pub struct WatchedFingerprints {
    shared: Arc<Shared>,
    #[cfg(feature = "watch-notify")]
    watcher: Option<Arc<Mutex<notify_backend::DirWatcher>>>,
}

impl std::fmt::Debug for WatchedFingerprints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchedFingerprints")
            .field("cached", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for WatchedFingerprints {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchedFingerprints {
    /// A cache whose invalidations are delivered by the caller.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            #[cfg(feature = "watch-notify")]
            watcher: None,
        }
    }

    /// A cache that watches the directory of every header it remembers.
    #[cfg(feature = "watch-notify")]
    pub fn with_os_notifications() -> Result<Self, CacheError> {
        let shared = Arc::new(Shared::default());
        let watcher = notify_backend::DirWatcher::new(Arc::clone(&shared))?;
        Ok(Self {
            shared,
            watcher: Some(Arc::new(Mutex::new(watcher))),
        })
    }

    /// Forgets `path` and, if it is a directory, everything below it.
    pub fn invalidate(&self, path: &Path) {
        self.shared.invalidate(path);
    }

    pub fn clear(&self) {
        self.shared.clear();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(feature = "watch-notify")]
    fn watch_parent(&self, path: &Path) -> bool {
        let Some(watcher) = &self.watcher else {
            return true;
        };
        let Some(parent) = path.parent() else {
            return false;
        };
        match watcher.lock().watch(parent) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(
                    target = "compcache",
                    dir = %parent.display(),
                    error = %err,
                    "failed to watch header directory; not caching its fingerprints"
                );
                false
            }
        }
    }

    #[cfg(not(feature = "watch-notify"))]
    fn watch_parent(&self, _path: &Path) -> bool {
        true
    }
}

impl FingerprintCache for WatchedFingerprints {
    fn fingerprint(&self, path: &Path) -> Result<Fingerprint, CacheError> {
        let identity = path_identity(path);
        if let Some(cached) = self.shared.state.lock().entries.get(&identity) {
            return Ok(cached.clone());
        }

        // Subscribe before hashing so a change during hashing cannot be missed.
        let cacheable = self.watch_parent(&identity);
        let generation = self.shared.state.lock().generation;
        let fingerprint = Fingerprint::from_file(path)?;

        if cacheable {
            let mut state = self.shared.state.lock();
            if state.generation == generation {
                state.entries.insert(identity, fingerprint.clone());
            }
        }
        Ok(fingerprint)
    }
}

#[cfg(feature = "watch-notify")]
mod notify_backend {
    use super::Shared;
    use crate::error::CacheError;
    use notify::{RecursiveMode, Watcher};
    use std::collections::HashSet;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    pub(super) struct DirWatcher {
        watcher: notify::RecommendedWatcher,
        watched: HashSet<PathBuf>,
    }

    fn requests_rescan(event: &notify::Event) -> bool {
        matches!(event.attrs.flag(), Some(notify::event::Flag::Rescan))
    }

    impl DirWatcher {
        pub(super) fn new(shared: Arc<Shared>) -> Result<Self, CacheError> {
            let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                match res {
                    Ok(event) if requests_rescan(&event) => shared.clear(),
                    Ok(event) => {
                        for path in &event.paths {
                            shared.invalidate(path);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "compcache",
                            error = %err,
                            "file watcher error; dropping all cached fingerprints"
                        );
                        shared.clear();
                    }
                }
            })
            .map_err(|err| CacheError::Io(std::io::Error::other(err)))?;
            Ok(Self {
                watcher,
                watched: HashSet::new(),
            })
        }

        pub(super) fn watch(&mut self, dir: &Path) -> notify::Result<()> {
            if self.watched.contains(dir) {
                return Ok(());
            }
            self.watcher.watch(dir, RecursiveMode::NonRecursive)?;
            self.watched.insert(dir.to_path_buf());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_read_sees_every_change() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bar.h");
        std::fs::write(&path, b"v1").unwrap();
        let first = DirectRead.fingerprint(&path).unwrap();
        std::fs::write(&path, b"v2").unwrap();
        assert_ne!(first, DirectRead.fingerprint(&path).unwrap());
    }

    #[test]
    fn watched_cache_serves_until_invalidated() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bar.h");
        std::fs::write(&path, b"v1").unwrap();

        let cache = WatchedFingerprints::new();
        let v1 = cache.fingerprint(&path).unwrap();
        assert_eq!(cache.len(), 1);

        // Without a notification the remembered digest is served.
        std::fs::write(&path, b"v2").unwrap();
        assert_eq!(cache.fingerprint(&path).unwrap(), v1);

        cache.invalidate(&path);
        assert_eq!(
            cache.fingerprint(&path).unwrap(),
            Fingerprint::from_bytes(b"v2")
        );
    }

    #[test]
    fn directory_invalidation_drops_contained_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("include");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.h"), b"a").unwrap();
        std::fs::write(dir.join("b.h"), b"b").unwrap();
        std::fs::write(tmp.path().join("c.h"), b"c").unwrap();

        let cache = WatchedFingerprints::new();
        for name in ["include/a.h", "include/b.h", "c.h"] {
            cache.fingerprint(&tmp.path().join(name)).unwrap();
        }
        cache.invalidate(&dir);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidation_matches_other_spellings_of_the_same_header() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        let header = tmp.path().join("bar.h");
        std::fs::write(&header, b"v1").unwrap();

        let cache = WatchedFingerprints::new();
        let dotted = tmp.path().join("sub").join("..").join("bar.h");
        assert_eq!(cache.fingerprint(&dotted).unwrap(), Fingerprint::from_bytes(b"v1"));

        std::fs::write(&header, b"v2").unwrap();
        cache.invalidate(&header);
        assert_eq!(cache.fingerprint(&dotted).unwrap(), Fingerprint::from_bytes(b"v2"));
        assert_eq!(cache.fingerprint(&header).unwrap(), Fingerprint::from_bytes(b"v2"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn deleted_headers_are_invalidated_through_their_parent() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        let header = tmp.path().join("sub").join("..").join("bar.h");
        std::fs::write(&header, b"v1").unwrap();

        let cache = WatchedFingerprints::new();
        cache.fingerprint(&header).unwrap();
        std::fs::remove_file(tmp.path().join("bar.h")).unwrap();
        cache.invalidate(&tmp.path().join("bar.h"));
        assert!(cache.is_empty());
    }

    #[test]
    fn case_folding_applies_only_to_case_insensitive_targets() {
        let path = PathBuf::from("/Proj/Include/Bar.h");
        assert_eq!(fold_case(path.clone(), false), path);
        assert_eq!(
            fold_case(path, true),
            PathBuf::from("/proj/include/bar.h")
        );
    }

    #[test]
    fn unreadable_headers_are_errors_not_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = WatchedFingerprints::new();
        let err = cache.fingerprint(&tmp.path().join("gone.h")).unwrap_err();
        assert!(matches!(err, CacheError::UnreadableInput { .. }));
        assert!(cache.is_empty());
    }

    #[cfg(feature = "watch-notify")]
    #[test]
    fn os_notifications_invalidate_changed_headers() {
        use std::time::{Duration, Instant};

        let tmp = tempfile::tempdir().unwrap();
        // Watchers report canonical paths (e.g. /private/var on macOS).
        let path = tmp.path().canonicalize().unwrap().join("bar.h");
        std::fs::write(&path, b"v1").unwrap();

        let cache = WatchedFingerprints::with_os_notifications().unwrap();
        cache.fingerprint(&path).unwrap();
        std::fs::write(&path, b"v2").unwrap();

        let expected = Fingerprint::from_bytes(b"v2");
        let deadline = Instant::now() + Duration::from_secs(10);
        while cache.fingerprint(&path).unwrap() != expected {
            assert!(Instant::now() < deadline, "change notification never arrived");
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}
