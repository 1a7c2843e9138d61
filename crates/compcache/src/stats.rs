use crate::error::CacheError;
use crate::lock::LockManager;
use crate::util;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Persistent cache counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub direct_hits: u64,
    pub preprocessor_hits: u64,
    pub header_changed_misses: u64,
    pub source_changed_misses: u64,
    pub evicted_misses: u64,
    pub cache_failure_misses: u64,
    pub uncacheable_calls: u64,
    /// Uncacheable calls broken down by the reason the classifier gave.
    pub uncacheable_reasons: BTreeMap<String, u64>,
    pub evictions: u64,
    pub cache_size: u64,
    pub entry_count: u64,
}

/// A named counter of [`Statistics`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Counter {
    DirectHits,
    PreprocessorHits,
    HeaderChangedMisses,
    SourceChangedMisses,
    EvictedMisses,
    CacheFailureMisses,
    UncacheableCalls,
    Evictions,
    CacheSize,
    EntryCount,
}

impl Counter {
    pub const ALL: [Counter; 10] = [
        Counter::DirectHits,
        Counter::PreprocessorHits,
        Counter::HeaderChangedMisses,
        Counter::SourceChangedMisses,
        Counter::EvictedMisses,
        Counter::CacheFailureMisses,
        Counter::UncacheableCalls,
        Counter::Evictions,
        Counter::CacheSize,
        Counter::EntryCount,
    ];

    /// Field name in `stats.json`.
    pub fn name(self) -> &'static str {
        match self {
            Counter::DirectHits => "direct_hits",
            Counter::PreprocessorHits => "preprocessor_hits",
            Counter::HeaderChangedMisses => "header_changed_misses",
            Counter::SourceChangedMisses => "source_changed_misses",
            Counter::EvictedMisses => "evicted_misses",
            Counter::CacheFailureMisses => "cache_failure_misses",
            Counter::UncacheableCalls => "uncacheable_calls",
            Counter::Evictions => "evictions",
            Counter::CacheSize => "cache_size",
            Counter::EntryCount => "entry_count",
        }
    }
}

impl Statistics {
    pub fn get(&self, counter: Counter) -> u64 {
        *self.slot(counter)
    }

    pub fn add(&mut self, counter: Counter, amount: u64) {
        let slot = self.slot_mut(counter);
        *slot = slot.saturating_add(amount);
    }

    pub fn subtract(&mut self, counter: Counter, amount: u64) {
        let slot = self.slot_mut(counter);
        *slot = slot.saturating_sub(amount);
    }

    pub fn set(&mut self, counter: Counter, value: u64) {
        *self.slot_mut(counter) = value;
    }

    pub fn hits(&self) -> u64 {
        self.direct_hits + self.preprocessor_hits
    }

    pub fn misses(&self) -> u64 {
        self.header_changed_misses
            + self.source_changed_misses
            + self.evicted_misses
            + self.cache_failure_misses
    }

    fn slot(&self, counter: Counter) -> &u64 {
        match counter {
            Counter::DirectHits => &self.direct_hits,
            Counter::PreprocessorHits => &self.preprocessor_hits,
            Counter::HeaderChangedMisses => &self.header_changed_misses,
            Counter::SourceChangedMisses => &self.source_changed_misses,
            Counter::EvictedMisses => &self.evicted_misses,
            Counter::CacheFailureMisses => &self.cache_failure_misses,
            Counter::UncacheableCalls => &self.uncacheable_calls,
            Counter::Evictions => &self.evictions,
            Counter::CacheSize => &self.cache_size,
            Counter::EntryCount => &self.entry_count,
        }
    }

    fn slot_mut(&mut self, counter: Counter) -> &mut u64 {
        match counter {
            Counter::DirectHits => &mut self.direct_hits,
            Counter::PreprocessorHits => &mut self.preprocessor_hits,
            Counter::HeaderChangedMisses => &mut self.header_changed_misses,
            Counter::SourceChangedMisses => &mut self.source_changed_misses,
            Counter::EvictedMisses => &mut self.evicted_misses,
            Counter::CacheFailureMisses => &mut self.cache_failure_misses,
            Counter::UncacheableCalls => &mut self.uncacheable_calls,
            Counter::Evictions => &mut self.evictions,
            Counter::CacheSize => &mut self.cache_size,
            Counter::EntryCount => &mut self.entry_count,
        }
    }

    /// Decodes `stats.json` field by field.
    ///
    /// Unknown, missing or malformed fields read as zero so a damaged file never blocks a
    /// build; a file that is not JSON at all reads as all zeros.
    fn from_json_lenient(bytes: &[u8]) -> Self {
        let value: serde_json::Value = match serde_json::from_slice(bytes) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(
                    target = "compcache",
                    error = %CacheError::from(err),
                    "statistics file is corrupt; counters reset"
                );
                return Self::default();
            }
        };

        let mut stats = Self::default();
        for counter in Counter::ALL {
            let value = value.get(counter.name()).and_then(serde_json::Value::as_u64);
            stats.set(counter, value.unwrap_or(0));
        }
        if let Some(reasons) = value
            .get("uncacheable_reasons")
            .and_then(serde_json::Value::as_object)
        {
            for (reason, count) in reasons {
                if let Some(count) = count.as_u64() {
                    stats.uncacheable_reasons.insert(reason.clone(), count);
                }
            }
        }
        stats
    }
}

/// `stats.json` guarded by the store lock.
///
/// Every mutation is a locked read-modify-write followed by an atomic replace, so concurrent
/// processes never lose increments.
#[derive(Clone, Debug)]
pub struct StatisticsLedger {
    path: PathBuf,
    locks: LockManager,
}

impl StatisticsLedger {
    pub fn new(path: impl Into<PathBuf>, locks: LockManager) -> Self {
        Self {
            path: path.into(),
            locks,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn increment(&self, counter: Counter, amount: u64) -> Result<(), CacheError> {
        self.update(|stats| stats.add(counter, amount))
    }

    /// Applies `f` to the current counters under the store lock and persists the result.
    pub fn update<R>(&self, f: impl FnOnce(&mut Statistics) -> R) -> Result<R, CacheError> {
        let _lock = self.locks.store()?;
        let mut stats = self.load_unlocked();
        let out = f(&mut stats);
        self.store_unlocked(&stats)?;
        Ok(out)
    }

    pub fn snapshot(&self) -> Result<Statistics, CacheError> {
        let _lock = self.locks.store()?;
        Ok(self.load_unlocked())
    }

    /// Counts an uncacheable call under `reason`.
    pub fn record_uncacheable(&self, reason: &str) -> Result<(), CacheError> {
        self.update(|stats| {
            stats.uncacheable_calls = stats.uncacheable_calls.saturating_add(1);
            let count = stats
                .uncacheable_reasons
                .entry(reason.to_string())
                .or_default();
            *count = count.saturating_add(1);
        })
    }

    /// Zeroes every hit/miss counter; size and entry count describe the store and are kept.
    pub fn reset(&self) -> Result<(), CacheError> {
        self.update(|stats| {
            *stats = Statistics {
                cache_size: stats.cache_size,
                entry_count: stats.entry_count,
                ..Statistics::default()
            };
        })
    }

    /// Reads the counters. Callers hold the store lock.
    pub(crate) fn load_unlocked(&self) -> Statistics {
        match util::read_file_limited(&self.path) {
            Some(bytes) => Statistics::from_json_lenient(&bytes),
            None => Statistics::default(),
        }
    }

    /// Persists the counters. Callers hold the store lock.
    pub(crate) fn store_unlocked(&self, stats: &Statistics) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec_pretty(stats)?;
        util::atomic_write(&self.path, &bytes)
    }
}
