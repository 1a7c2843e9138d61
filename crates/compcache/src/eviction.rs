use crate::error::CacheError;
use crate::layout::CacheDir;
use crate::lock::CacheLock;
use crate::object_store::StoredEntry;
use crate::stats::{Counter, Statistics};
use crate::util;
use std::time::Duration;

/// `clean` shrinks the store to this share of the size bound, in percent.
pub const TARGET_PERCENT: u64 = 90;

/// Evictions performed before the store lock is briefly released.
pub const DEFAULT_EVICTION_BATCH: usize = 256;

/// Staging and temporary files younger than this may belong to a live writer.
pub const DEFAULT_LEFTOVER_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub max_cache_size: u64,
    pub batch_size: usize,
    pub leftover_age: Duration,
}

impl EvictionPolicy {
    pub fn new(max_cache_size: u64) -> Self {
        Self {
            max_cache_size,
            batch_size: DEFAULT_EVICTION_BATCH,
            leftover_age: DEFAULT_LEFTOVER_AGE,
        }
    }

    pub fn target_size(&self) -> u64 {
        (u128::from(self.max_cache_size) * u128::from(TARGET_PERCENT) / 100) as u64
    }

    pub fn needs_cleaning(&self, stats: &Statistics) -> bool {
        stats.cache_size > self.max_cache_size
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub evicted_entries: u64,
    pub freed_bytes: u64,
    pub swept_leftovers: usize,
    pub cache_size: u64,
    pub entry_count: u64,
}

/// Keeps the object store under its size bound by evicting least recently used entries.
#[derive(Clone, Debug)]
pub struct EvictionController {
    cache: CacheDir,
    policy: EvictionPolicy,
}

impl EvictionController {
    pub fn new(cache: CacheDir, policy: EvictionPolicy) -> Self {
        Self { cache, policy }
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// Evicts oldest-access-first until the store is at or below the target size.
    ///
    /// Leftover staging and temporary files are swept first. Sizes are recomputed from disk
    /// under the store lock, which also corrects any drift in the ledger.
    pub fn clean(&self) -> Result<CleanReport, CacheError> {
        let lock = self.cache.locks().store()?;
        let swept_leftovers =
            util::sweep_leftovers(self.cache.root(), 3, self.policy.leftover_age);
        let entries = self.cache.objects().list_entries()?;

        let mut report = self.evict(lock, entries)?;
        report.swept_leftovers = swept_leftovers;
        if report.evicted_entries > 0 || report.swept_leftovers > 0 {
            tracing::debug!(
                target = "compcache",
                evicted = report.evicted_entries,
                freed_bytes = report.freed_bytes,
                swept = report.swept_leftovers,
                size = report.cache_size,
                "cleaned cache"
            );
        }
        Ok(report)
    }

    /// Evicts from `entries`, a listing taken under `lock`, oldest access first.
    ///
    /// The lock is released for a moment after every `batch_size` evictions so waiting
    /// compilations can publish; afterwards the size is re-read from the ledger, which
    /// includes anything published meanwhile. An entry read since the listing was taken is now
    /// the most recently used one and is passed over.
    fn evict(
        &self,
        mut lock: CacheLock,
        mut entries: Vec<StoredEntry>,
    ) -> Result<CleanReport, CacheError> {
        let objects = self.cache.objects();
        let ledger = self.cache.stats();

        let mut size: u64 = entries.iter().map(|e| e.size).sum();
        let mut count = entries.len() as u64;
        ledger.update(|stats| {
            stats.set(Counter::CacheSize, size);
            stats.set(Counter::EntryCount, count);
        })?;

        entries.sort_by(|a, b| {
            a.last_access_millis
                .cmp(&b.last_access_millis)
                .then_with(|| a.key.cmp(&b.key))
        });

        let target = self.policy.target_size();
        let batch_size = self.policy.batch_size.max(1);
        let mut report = CleanReport::default();
        let mut in_batch = 0;

        for entry in entries {
            if size <= target {
                break;
            }
            if in_batch == batch_size {
                drop(lock);
                std::thread::yield_now();
                lock = self.cache.locks().store()?;
                in_batch = 0;
                let current = ledger.load_unlocked();
                size = current.cache_size;
                count = current.entry_count;
                if size <= target {
                    break;
                }
            }

            let read_since_listing = objects
                .last_access_millis(&entry.key)
                .is_some_and(|millis| millis > entry.last_access_millis);
            if read_since_listing {
                continue;
            }
            let Some(freed) = objects.remove(&entry.key)? else {
                continue;
            };
            in_batch += 1;
            size = size.saturating_sub(freed);
            count = count.saturating_sub(1);
            report.evicted_entries += 1;
            report.freed_bytes += freed;
            ledger.update(|stats| {
                stats.subtract(Counter::CacheSize, freed);
                stats.subtract(Counter::EntryCount, 1);
                stats.add(Counter::Evictions, 1);
            })?;
        }
        drop(lock);

        report.cache_size = size;
        report.entry_count = count;
        Ok(report)
    }

    /// Removes every entry and every manifest; hit and miss counters are kept.
    pub fn clear(&self) -> Result<(), CacheError> {
        let _lock = self.cache.locks().store()?;
        self.cache.objects().remove_all()?;
        self.cache.manifests().remove_all()?;
        self.cache.stats().update(|stats| {
            stats.set(Counter::CacheSize, 0);
            stats.set(Counter::EntryCount, 0);
        })
    }
}
