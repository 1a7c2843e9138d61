use crate::error::CacheError;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Upper bound for any cache file we read back into memory (manifests, statistics,
/// remote payload envelopes). A corrupted length must degrade to a miss, not an OOM.
pub const PAYLOAD_LIMIT_BYTES: usize = 512 * 1024 * 1024;

pub fn now_millis() -> u64 {
    millis_since_epoch(SystemTime::now())
}

pub(crate) fn millis_since_epoch(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(err) => {
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target = "compcache",
                    error = %err,
                    "timestamp is before unix epoch; using 0"
                );
            }
            0
        }
    }
}

fn bincode_options() -> impl bincode::Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(PAYLOAD_LIMIT_BYTES as u64)
}

pub(crate) fn bincode_serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
    Ok(bincode_options().serialize(value)?)
}

pub(crate) fn bincode_deserialize<T: for<'de> Deserialize<'de>>(
    bytes: &[u8],
) -> Result<T, CacheError> {
    Ok(bincode_options().deserialize(bytes)?)
}

/// Reads a small cache-owned file. Missing, oversized or non-regular files read as `None`.
pub(crate) fn read_file_limited(path: &Path) -> Option<Vec<u8>> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "compcache",
                    path = %path.display(),
                    error = %err,
                    "failed to stat cache file"
                );
            }
            return None;
        }
    };
    if !meta.is_file() || meta.len() > PAYLOAD_LIMIT_BYTES as u64 {
        tracing::debug!(
            target = "compcache",
            path = %path.display(),
            len = meta.len(),
            "ignoring cache file with unexpected type or size"
        );
        return None;
    }

    match fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "compcache",
                    path = %path.display(),
                    error = %err,
                    "failed to read cache file"
                );
            }
            None
        }
    }
}

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target = "compcache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache file"
            );
            false
        }
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Marker embedded in every private temporary name, used by sweeping to spot leftovers.
pub(crate) const TMP_MARKER: &str = ".tmp.";

/// Returns a process-unique sibling name for `file_name` with the given marker.
pub(crate) fn unique_name(file_name: &std::ffi::OsStr, marker: &str) -> std::ffi::OsString {
    let pid = std::process::id();
    let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = file_name.to_os_string();
    name.push(format!("{marker}{pid}.{counter}"));
    name
}

/// Writes `bytes` to `path` by way of a private temporary file and a single rename.
///
/// Readers observe either the previous contents or the new contents, never a prefix.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    atomic_write_with(path, |file| {
        file.write_all(bytes)?;
        Ok(())
    })
}

pub(crate) fn atomic_write_with(
    path: &Path,
    write: impl FnOnce(&mut fs::File) -> Result<(), CacheError>,
) -> Result<(), CacheError> {
    let parent = parent_dir(path)?;
    fs::create_dir_all(parent)?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, parent)?;
    let written = write(&mut file).and_then(|()| Ok(file.sync_all()?));
    drop(file);
    if let Err(err) = written {
        remove_file_best_effort(&tmp_path, "atomic_write.write_failed");
        return Err(err);
    }

    match replace(&tmp_path, path) {
        Ok(()) => {
            sync_dir_best_effort(parent);
            Ok(())
        }
        Err(err) => {
            remove_file_best_effort(&tmp_path, "atomic_write.rename_failed");
            Err(err.into())
        }
    }
}

fn parent_dir(path: &Path) -> Result<&Path, CacheError> {
    let Some(parent) = path.parent() else {
        return Err(io::Error::other("path has no parent").into());
    };
    Ok(if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    })
}

fn replace(from: &Path, to: &Path) -> io::Result<()> {
    const MAX_ATTEMPTS: usize = 1024;
    let mut attempts = 0usize;
    loop {
        match fs::rename(from, to) {
            Ok(()) => return Ok(()),
            Err(err) if cfg!(windows) && (err.kind() == io::ErrorKind::AlreadyExists || to.exists()) => {
                // Windows `rename` refuses to overwrite; concurrent writers race on remove+rename.
                match fs::remove_file(to) {
                    Ok(()) => {}
                    Err(remove_err) if remove_err.kind() == io::ErrorKind::NotFound => {}
                    Err(remove_err) => return Err(remove_err),
                }
                attempts += 1;
                if attempts >= MAX_ATTEMPTS {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

pub(crate) fn sync_dir_best_effort(dir: &Path) {
    #[cfg(unix)]
    {
        static LOGGED: OnceLock<()> = OnceLock::new();
        match fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                if LOGGED.set(()).is_ok() {
                    tracing::debug!(
                        target = "compcache",
                        dir = %dir.display(),
                        error = %err,
                        "failed to sync directory (best effort)"
                    );
                }
            }
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> io::Result<(PathBuf, fs::File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;

    loop {
        let tmp_path = parent.join(unique_name(file_name, TMP_MARKER));
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Removes a directory tree without following symlinks. Missing paths are not an error.
pub(crate) fn remove_dir_all_nofollow(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if !meta.is_dir() {
        return match fs::remove_file(path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        };
    }

    for entry in walkdir::WalkDir::new(path)
        .follow_links(false)
        .contents_first(true)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if err.io_error().map(|e| e.kind()) == Some(io::ErrorKind::NotFound) {
                    continue;
                }
                return Err(io::Error::other(err));
            }
        };
        let result = if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        match result {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Moves `path` aside to a unique sibling and deletes it there, so concurrent readers see
/// the directory either fully present or fully gone.
pub(crate) fn remove_dir_atomically(path: &Path) -> io::Result<()> {
    let Some(file_name) = path.file_name() else {
        return remove_dir_all_nofollow(path);
    };
    let Some(parent) = path.parent() else {
        return remove_dir_all_nofollow(path);
    };

    let trash = parent.join(unique_name(file_name, TRASH_MARKER));
    match fs::rename(path, &trash) {
        Ok(()) => remove_dir_all_nofollow(&trash),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        // Windows may refuse the rename while a reader holds a handle; remove in place.
        Err(_) => remove_dir_all_nofollow(path),
    }
}

/// Total size of regular files below `root`, not following symlinks.
pub(crate) fn dir_size_bytes(root: &Path) -> u64 {
    let mut total = 0_u64;
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if err.io_error().map(|e| e.kind()) != Some(io::ErrorKind::NotFound) {
                    tracing::debug!(
                        target = "compcache",
                        path = ?err.path(),
                        error = %err,
                        "failed to walk directory while computing size"
                    );
                }
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => total = total.saturating_add(meta.len()),
            Err(err) => {
                if err.io_error().map(|e| e.kind()) != Some(io::ErrorKind::NotFound) {
                    tracing::debug!(
                        target = "compcache",
                        path = %entry.path().display(),
                        error = %err,
                        "failed to stat file while computing size"
                    );
                }
            }
        }
    }
    total
}

pub(crate) fn modified_millis(path: &Path) -> Option<u64> {
    let meta = fs::symlink_metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    Some(millis_since_epoch(modified))
}

/// Marker of an object entry being assembled before publication.
pub(crate) const STAGING_MARKER: &str = ".staging.";
/// Marker of a directory moved aside for deletion.
pub(crate) const TRASH_MARKER: &str = ".trash.";

pub(crate) fn is_leftover_name(name: &str) -> bool {
    [TMP_MARKER, STAGING_MARKER, TRASH_MARKER]
        .iter()
        .any(|marker| name.contains(marker))
}

/// Removes private temporaries, staging and trash directories at most `max_depth` levels
/// below `root` whose mtime is at least `min_age` old. Returns how many were removed.
///
/// These are left behind only by processes killed mid-write; nothing ever reads them.
pub(crate) fn sweep_leftovers(root: &Path, max_depth: usize, min_age: std::time::Duration) -> usize {
    let now = now_millis();
    let min_age = min_age.as_millis() as u64;
    let mut removed = 0;

    let mut it = walkdir::WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false)
        .into_iter();
    while let Some(entry) = it.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let leftover = entry.file_name().to_str().is_some_and(is_leftover_name);
        if !leftover {
            continue;
        }
        let is_dir = entry.file_type().is_dir();
        if is_dir {
            it.skip_current_dir();
        }

        let age = modified_millis(entry.path()).map(|mtime| now.saturating_sub(mtime));
        if age.is_some_and(|age| age < min_age) {
            continue;
        }

        let result = if is_dir {
            remove_dir_all_nofollow(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        match result {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::debug!(
                target = "compcache",
                path = %entry.path().display(),
                error = %err,
                "failed to remove leftover"
            ),
        }
    }
    removed
}
