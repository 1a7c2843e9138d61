use crate::command::{CompileOutput, CompileRequest, CompilerWrapper};
use crate::config::{self, CacheConfig};
use crate::error::{CacheError, ErrorClass};
use crate::eviction::{CleanReport, EvictionController, EvictionPolicy};
use crate::fingerprint_cache::{DirectRead, FingerprintCache};
use crate::key::CacheKey;
use crate::layout::CacheDir;
use crate::object_store::{CacheEntry, ObjectBackend};
use crate::path::PathNormalizer;
use crate::remote;
use crate::stats::{Counter, Statistics};
use crate::strategy::{
    DirectMode, KeyMode, KeyResolution, KeyStrategy, MissReason, PreprocessorMode,
};
use crate::util;

/// How an invocation was served.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Hit(KeyMode),
    Miss(MissReason),
    /// The cache failed and the compiler ran without it.
    Bypassed,
}

/// What the caller reports back to the build: the compiler's (or the cached) result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub outcome: Outcome,
}

impl Invocation {
    fn from_output(output: CompileOutput, outcome: Outcome) -> Self {
        Self {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            outcome,
        }
    }
}

enum Lookup {
    Hit(Invocation),
    Miss {
        resolution: KeyResolution,
        reason: MissReason,
    },
}

/// The compiler cache: key resolution, lookup, storage and the operator commands.
///
/// Every internal failure degrades to running the compiler without the cache; the only
/// errors [`CacheEngine::compile`] returns come from the compiler wrapper itself.
pub struct CacheEngine {
    config: CacheConfig,
    cache: CacheDir,
    normalizer: PathNormalizer,
    fingerprints: Box<dyn FingerprintCache>,
    remote: Option<Box<dyn ObjectBackend>>,
    eviction: EvictionController,
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("root", &self.cache.root())
            .field("direct_mode", &self.config.direct_mode)
            .field("remote", &self.remote.is_some())
            .finish_non_exhaustive()
    }
}

impl CacheEngine {
    /// Opens (and if necessary creates or rebuilds) the cache described by `config`.
    ///
    /// Errors are configuration problems ([`ErrorClass::Fatal`]); callers should compile
    /// without caching. An unusable remote endpoint only disables the remote tier.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let cache = CacheDir::open(&config)?;
        let remote = config.remote_endpoint.as_deref().and_then(|endpoint| {
            match remote::backend_for_endpoint(endpoint, config.lock_timeout) {
                Ok(backend) => Some(backend),
                Err(err) => {
                    tracing::warn!(
                        target = "compcache",
                        endpoint = %remote::sanitize_url(endpoint),
                        error = %err,
                        "remote cache disabled"
                    );
                    None
                }
            }
        });

        Ok(Self {
            normalizer: PathNormalizer::new(config.base_dir.as_deref()),
            eviction: EvictionController::new(
                cache.clone(),
                EvictionPolicy::new(config.max_cache_size),
            ),
            fingerprints: Box::new(DirectRead),
            remote,
            cache,
            config,
        })
    }

    /// Replaces the header fingerprint source, e.g. with a warm in-memory cache.
    pub fn with_fingerprint_cache(mut self, fingerprints: Box<dyn FingerprintCache>) -> Self {
        self.fingerprints = fingerprints;
        self
    }

    pub fn with_remote(mut self, remote: Box<dyn ObjectBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction = EvictionController::new(self.cache.clone(), policy);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn cache_dir(&self) -> &CacheDir {
        &self.cache
    }

    fn strategy(&self) -> Box<dyn KeyStrategy + '_> {
        if self.config.direct_mode {
            Box::new(DirectMode {
                manifests: self.cache.manifests(),
                fingerprints: self.fingerprints.as_ref(),
                normalizer: &self.normalizer,
                remote: self.remote.as_deref(),
            })
        } else {
            Box::new(PreprocessorMode {
                normalizer: &self.normalizer,
            })
        }
    }

    /// Serves `request` from the cache, or compiles it and stores the result.
    pub fn compile(
        &self,
        request: &CompileRequest,
        wrapper: &dyn CompilerWrapper,
    ) -> Result<Invocation, CacheError> {
        let strategy = self.strategy();
        let (resolution, reason) = match self.lookup(strategy.as_ref(), request, wrapper) {
            Ok(Lookup::Hit(invocation)) => return Ok(invocation),
            Ok(Lookup::Miss { resolution, reason }) => (resolution, reason),
            Err(err) => return self.bypass(request, wrapper, err),
        };

        let output = wrapper.compile(request)?;
        let outcome = Outcome::Miss(reason);
        if !output.succeeded() {
            self.count(miss_counter(reason));
            return Ok(Invocation::from_output(output, outcome));
        }

        if let Err(err) = self.store(strategy.as_ref(), request, &resolution, reason, &output) {
            report_cache_error(&err, "failed to store compilation result");
        }
        Ok(Invocation::from_output(output, outcome))
    }

    fn lookup(
        &self,
        strategy: &dyn KeyStrategy,
        request: &CompileRequest,
        wrapper: &dyn CompilerWrapper,
    ) -> Result<Lookup, CacheError> {
        let resolution = strategy.resolve_cache_key(request, wrapper)?;
        let key = match &resolution {
            KeyResolution::Resolved { key, .. } => Some(key.clone()),
            KeyResolution::Deferred { .. } => None,
        };
        let entry = match key {
            Some(key) => self.fetch_tiered(&key)?,
            None => None,
        };

        let Some(entry) = entry else {
            let reason = resolution.absent_reason();
            return Ok(Lookup::Miss { resolution, reason });
        };

        util::atomic_write(&request.output_path(), &entry.object)?;
        let mode = strategy.mode();
        self.count(match mode {
            KeyMode::Direct => Counter::DirectHits,
            KeyMode::Preprocessor => Counter::PreprocessorHits,
        });
        Ok(Lookup::Hit(Invocation {
            exit_code: 0,
            stdout: entry.stdout,
            stderr: entry.stderr,
            outcome: Outcome::Hit(mode),
        }))
    }

    /// Local store first, then the remote tier. Remote hits are copied into the local store.
    fn fetch_tiered(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        if let Some(entry) = self.cache.objects().fetch(key)? {
            return Ok(Some(entry));
        }
        let Some(remote) = &self.remote else {
            return Ok(None);
        };

        let entry = match remote.fetch(key) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(err) => {
                tracing::warn!(
                    target = "compcache",
                    key = %key,
                    error = %err,
                    "remote cache unavailable; treating as miss"
                );
                return Ok(None);
            }
        };

        let copied = self.publish_local(key, &entry.object, &entry.stdout, &entry.stderr, None);
        if let Err(err) = copied {
            report_cache_error(&err, "failed to copy remote entry into local cache");
        }
        Ok(Some(entry))
    }

    /// Stages, publishes and accounts an entry in the local store, then cleans if the store
    /// grew past its bound. Once this returns `Ok` the optional miss counter is recorded.
    fn publish_local(
        &self,
        key: &CacheKey,
        object: &[u8],
        stdout: &[u8],
        stderr: &[u8],
        miss: Option<Counter>,
    ) -> Result<(), CacheError> {
        let staged = self.cache.objects().stage(key, object, stdout, stderr)?;
        let (_, stats) = self.cache.publish(staged, miss)?;

        if self.eviction.policy().needs_cleaning(&stats) {
            if let Err(err) = self.eviction.clean() {
                report_cache_error(&err, "opportunistic clean failed");
            }
        }
        Ok(())
    }

    fn store(
        &self,
        strategy: &dyn KeyStrategy,
        request: &CompileRequest,
        resolution: &KeyResolution,
        reason: MissReason,
        output: &CompileOutput,
    ) -> Result<(), CacheError> {
        let miss = miss_counter(reason);
        let prepared = strategy
            .key_after_compile(request, resolution, output)
            .and_then(|key| {
                let object = std::fs::read(request.working_dir.join(&output.object_path))?;
                Ok((key, object))
            });
        let (key, object) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                self.count(miss);
                return Err(err);
            }
        };

        let published =
            self.publish_local(&key, &object, &output.stdout, &output.stderr, Some(miss));
        if let Err(err) = published {
            self.count(miss);
            return Err(err);
        }

        // Upload the object before the manifest that points at it.
        if let Some(remote) = &self.remote {
            if let Err(err) = remote.put(&key, &object, &output.stdout, &output.stderr) {
                tracing::warn!(
                    target = "compcache",
                    key = %key,
                    error = %err,
                    "failed to upload entry to remote cache"
                );
            }
        }
        strategy.commit(request, resolution, output, &key)
    }

    fn bypass(
        &self,
        request: &CompileRequest,
        wrapper: &dyn CompilerWrapper,
        err: CacheError,
    ) -> Result<Invocation, CacheError> {
        report_cache_error(&err, "cache unavailable; compiling without it");
        self.count(Counter::CacheFailureMisses);
        let output = wrapper.compile(request)?;
        Ok(Invocation::from_output(output, Outcome::Bypassed))
    }

    /// Best-effort counter bump; a failure here must never affect the compilation.
    fn count(&self, counter: Counter) {
        if let Err(err) = self.cache.stats().increment(counter, 1) {
            report_cache_error(&err, "failed to update statistics");
        }
    }

    pub fn statistics(&self) -> Result<Statistics, CacheError> {
        self.cache.stats().snapshot()
    }

    pub fn clean(&self) -> Result<CleanReport, CacheError> {
        self.eviction.clean()
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.eviction.clear()
    }

    pub fn reset_statistics(&self) -> Result<(), CacheError> {
        self.cache.stats().reset()
    }

    /// Persists a new size bound and applies it to this engine.
    pub fn set_max_cache_size(&mut self, bytes: u64) -> Result<(), CacheError> {
        config::persist_max_cache_size(self.cache.root(), bytes)?;
        self.config.max_cache_size = bytes;
        let mut policy = self.eviction.policy().clone();
        policy.max_cache_size = bytes;
        self.eviction = EvictionController::new(self.cache.clone(), policy);
        Ok(())
    }

    /// Counts a call the classifier refused to cache, under `reason`.
    pub fn record_uncacheable(&self, reason: &str) -> Result<(), CacheError> {
        self.cache.stats().record_uncacheable(reason)
    }
}

fn miss_counter(reason: MissReason) -> Counter {
    match reason {
        MissReason::HeaderChanged => Counter::HeaderChangedMisses,
        MissReason::SourceChanged => Counter::SourceChangedMisses,
        MissReason::Evicted => Counter::EvictedMisses,
    }
}

fn report_cache_error(err: &CacheError, message: &'static str) {
    match err.class() {
        ErrorClass::Recoverable => {
            tracing::debug!(target = "compcache", error = %err, "{message}")
        }
        ErrorClass::ResourceExhausted | ErrorClass::Fatal => {
            tracing::warn!(target = "compcache", error = %err, class = ?err.class(), "{message}")
        }
    }
}
