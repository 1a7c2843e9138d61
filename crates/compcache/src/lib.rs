//! A transparent compiler-invocation cache.
//!
//! Given a classified compiler call ([`CompileRequest`]) the [`CacheEngine`] decides whether
//! the object file can be served from disk or the compiler has to run, and stores fresh
//! results for next time. Keys are computed in one of two modes:
//! - **direct**: source and header fingerprints, validated through a per-source manifest,
//!   without running the preprocessor
//! - **preprocessor**: the hash of the preprocessed text
//!
//! Any number of processes may share one cache root. Shared state is only mutated under the
//! cross-process locks of [`LockManager`], and every persisted artifact is written to a
//! private temporary location and published by rename.
//!
//! ## On-disk layout
//!
//! - `VERSION`: layout version tag, see [`CACHE_LAYOUT_VERSION`]; a mismatch rebuilds the store
//! - `config.toml`: optional settings, see [`CacheConfig`]
//! - `stats.json`: [`Statistics`] counters
//! - `locks/`: `store.lock` and one `manifests-<shard>.lock` per manifest shard
//! - `objects/<shard>/<key>/`: `object`, `stdout`, `stderr`, `entry.json`
//! - `manifests/<shard>/<key>.json`: [`ManifestEntry`] lists, most recently used first
//!
//! `<shard>` is the first two hex characters of the key.

mod command;
mod config;
mod engine;
mod error;
mod eviction;
mod fingerprint;
mod fingerprint_cache;
mod key;
mod layout;
mod lock;
mod logging;
mod manifest;
mod object_store;
mod path;
mod remote;
mod stats;
mod strategy;
mod util;

pub use command::{
    compiler_identity, key_arguments, ArgumentScope, CompileOutput, CompileRequest,
    CompilerWrapper,
};
pub use config::{
    persist_max_cache_size, CacheConfig, CONFIG_FILE_NAME, DEFAULT_LOCK_TIMEOUT,
    DEFAULT_MAX_CACHE_SIZE, ENV_BASEDIR, ENV_DIR, ENV_LOCK_TIMEOUT_MS, ENV_MAX_SIZE,
    ENV_NODIRECT, ENV_REMOTE,
};
pub use engine::{CacheEngine, Invocation, Outcome};
pub use error::{CacheError, ErrorClass, Result};
pub use eviction::{
    CleanReport, EvictionController, EvictionPolicy, DEFAULT_EVICTION_BATCH,
    DEFAULT_LEFTOVER_AGE, TARGET_PERCENT,
};
pub use fingerprint::{Fingerprint, FingerprintBuilder, FINGERPRINT_HEX_LEN};
pub use fingerprint_cache::{DirectRead, FingerprintCache, WatchedFingerprints};
pub use key::{
    direct_cache_key, manifest_key, preprocessor_cache_key, CacheKey, ManifestKey,
    RequestIdentity, CACHE_LAYOUT_VERSION, MANIFEST_FORMAT_VERSION,
};
pub use layout::{CacheDir, VERSION_FILE};
pub use lock::{CacheLock, LockManager};
pub use logging::{env_filter, init_logging, LOG_ENV_VAR};
pub use manifest::{HeaderRecord, ManifestEntry, ManifestStore, Validation, MANIFEST_ENTRY_CAP};
pub use object_store::{
    CacheEntry, ObjectBackend, ObjectStore, PutOutcome, StagedEntry, StoredEntry,
};
pub use path::{PathNormalizer, BASE_DIR_PLACEHOLDER};
pub use remote::{
    backend_for_endpoint, sanitize_url, HttpBackend, SharedDirBackend, REMOTE_TIMEOUT,
};
pub use stats::{Counter, Statistics, StatisticsLedger};
pub use strategy::{
    DirectMode, KeyMode, KeyResolution, KeyStrategy, MissReason, PreprocessorMode,
};
pub use util::{atomic_write, now_millis, PAYLOAD_LIMIT_BYTES};
