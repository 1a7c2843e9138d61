use crate::error::CacheError;
use fs2::FileExt as _;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Per-path lock state shared by every thread of this process.
#[derive(Default)]
struct LockSlot {
    depth: Cell<usize>,
    file: RefCell<Option<File>>,
}

/// A named lock that excludes other processes (advisory file lock) and other threads
/// (in-process re-entrant mutex) at the same time.
///
/// The owning thread may acquire the same lock again while holding it; the file lock is
/// taken on the outermost acquisition and released when the outermost guard drops. The OS
/// drops advisory locks of a dead process, so a crashed owner never wedges the cache.
pub struct CacheLock {
    guard: ReentrantMutexGuard<'static, LockSlot>,
    path: PathBuf,
}

impl std::fmt::Debug for CacheLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLock")
            .field("path", &self.path)
            .field("depth", &self.guard.depth.get())
            .finish()
    }
}

impl CacheLock {
    /// Acquire the lock at `path`, creating the lockfile if needed.
    ///
    /// Contention is retried with exponential backoff until `timeout` has elapsed, after which
    /// [`CacheError::LockTimeout`] is returned.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, CacheError> {
        let started = Instant::now();
        let deadline = started + timeout;

        let slot = process_slot_for_path(path);
        let guard = slot
            .try_lock_until(deadline)
            .ok_or_else(|| CacheError::LockTimeout {
                path: path.to_path_buf(),
                waited: started.elapsed(),
            })?;

        if guard.depth.get() == 0 {
            let file = open_lockfile(path)?;
            lock_file_until(&file, path, started, deadline)?;
            *guard.file.borrow_mut() = Some(file);
        }
        guard.depth.set(guard.depth.get() + 1);

        Ok(Self {
            guard,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let depth = self.guard.depth.get().saturating_sub(1);
        self.guard.depth.set(depth);
        if depth == 0 {
            if let Some(file) = self.guard.file.borrow_mut().take() {
                if let Err(err) = file.unlock() {
                    tracing::debug!(
                        target = "compcache",
                        path = %self.path.display(),
                        error = %err,
                        "failed to unlock lockfile; closing it releases the lock"
                    );
                }
            }
        }
    }
}

fn open_lockfile(path: &Path) -> Result<File, CacheError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?)
}

fn lock_file_until(
    file: &File,
    path: &Path,
    started: Instant,
    deadline: Instant,
) -> Result<(), CacheError> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(()),
            Err(err) if is_contended(&err) => {}
            Err(err) => return Err(err.into()),
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(
                target = "compcache",
                path = %path.display(),
                waited_ms = started.elapsed().as_millis() as u64,
                "timed out waiting for cache lock"
            );
            return Err(CacheError::LockTimeout {
                path: path.to_path_buf(),
                waited: started.elapsed(),
            });
        }
        std::thread::sleep(backoff.min(deadline - now));
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind() || err.kind() == io::ErrorKind::WouldBlock
}

fn process_slot_for_path(path: &Path) -> &'static ReentrantMutex<LockSlot> {
    static SLOTS: OnceLock<Mutex<HashMap<PathBuf, &'static ReentrantMutex<LockSlot>>>> =
        OnceLock::new();
    let slots = SLOTS.get_or_init(|| Mutex::new(HashMap::new()));

    let mut map = slots.lock();
    if let Some(existing) = map.get(path) {
        return existing;
    }
    let slot: &'static ReentrantMutex<LockSlot> =
        Box::leak(Box::new(ReentrantMutex::new(LockSlot::default())));
    map.insert(path.to_path_buf(), slot);
    slot
}

/// Hands out the named locks of one cache root.
///
/// `store` guards statistics, object publication, eviction and clearing. Manifests are
/// guarded per key-prefix shard so unrelated sources do not serialize on each other.
#[derive(Clone, Debug)]
pub struct LockManager {
    dir: PathBuf,
    timeout: Duration,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn store(&self) -> Result<CacheLock, CacheError> {
        self.acquire("store")
    }

    pub fn manifest_shard(&self, shard: &str) -> Result<CacheLock, CacheError> {
        self.acquire(&format!("manifests-{shard}"))
    }

    pub fn acquire(&self, name: &str) -> Result<CacheLock, CacheError> {
        CacheLock::acquire(&self.dir.join(format!("{name}.lock")), self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn lock_is_reentrant_for_the_owning_thread() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = LockManager::new(tmp.path(), Duration::from_secs(5));

        let outer = locks.store().unwrap();
        let inner = locks.store().unwrap();
        assert_eq!(outer.guard.depth.get(), 2);
        drop(inner);
        assert_eq!(outer.guard.depth.get(), 1);
        assert!(outer.guard.file.borrow().is_some());
        drop(outer);

        // Fully released: another thread can take it right away.
        let path = tmp.path().to_path_buf();
        std::thread::spawn(move || {
            LockManager::new(path, Duration::from_millis(100))
                .store()
                .unwrap();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn contended_lock_times_out_with_descriptive_error() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = LockManager::new(tmp.path(), Duration::from_secs(5));
        let _held = locks.store().unwrap();

        let path = tmp.path().to_path_buf();
        let err = std::thread::spawn(move || {
            LockManager::new(path, Duration::from_millis(50))
                .store()
                .unwrap_err()
        })
        .join()
        .unwrap();

        match err {
            CacheError::LockTimeout { path, waited } => {
                assert!(path.ends_with("store.lock"));
                assert!(waited >= Duration::from_millis(40), "waited {waited:?}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn lock_excludes_concurrent_read_modify_write() {
        let tmp = tempfile::tempdir().unwrap();
        let counter_path = tmp.path().join("counter");
        std::fs::write(&counter_path, b"0").unwrap();

        let in_section = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let dir = tmp.path().to_path_buf();
            let counter_path = counter_path.clone();
            let in_section = in_section.clone();
            handles.push(std::thread::spawn(move || {
                let locks = LockManager::new(dir, Duration::from_secs(30));
                for _ in 0..25 {
                    let _lock = locks.store().unwrap();
                    assert_eq!(in_section.fetch_add(1, Ordering::SeqCst), 0);
                    let value: u64 = std::fs::read_to_string(&counter_path)
                        .unwrap()
                        .parse()
                        .unwrap();
                    std::fs::write(&counter_path, (value + 1).to_string()).unwrap();
                    in_section.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(std::fs::read_to_string(&counter_path).unwrap(), "200");
    }

    #[test]
    fn shard_locks_are_independent() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = LockManager::new(tmp.path(), Duration::from_secs(5));
        let _a = locks.manifest_shard("ab").unwrap();

        let path = tmp.path().to_path_buf();
        std::thread::spawn(move || {
            LockManager::new(path, Duration::from_millis(100))
                .manifest_shard("cd")
                .unwrap();
        })
        .join()
        .unwrap();
    }
}
