//! The two ways of arriving at a cache key, behind one trait so the engine never branches on
//! the mode itself.

use crate::command::{CompileOutput, CompileRequest, CompilerWrapper};
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::fingerprint_cache::FingerprintCache;
use crate::key::{self, CacheKey, ManifestKey, RequestIdentity};
use crate::manifest::{HeaderRecord, ManifestEntry, ManifestStore, Validation};
use crate::object_store::ObjectBackend;
use crate::path::PathNormalizer;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyMode {
    Direct,
    Preprocessor,
}

/// Why no stored result could be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MissReason {
    /// A manifest exists for this source and command line but a header changed.
    HeaderChanged,
    /// The source, its command line or (in preprocessor mode) its preprocessed text is new.
    SourceChanged,
    /// The key was known but its entry is gone.
    Evicted,
}

/// What a strategy learned before compiling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyResolution {
    /// The key is known up front and can be looked up.
    Resolved {
        key: CacheKey,
        manifest: Option<ManifestKey>,
    },
    /// The key depends on what the compilation includes.
    Deferred {
        manifest: ManifestKey,
        reason: MissReason,
    },
}

impl KeyResolution {
    /// Miss reason to report when a resolved key has no entry.
    pub fn absent_reason(&self) -> MissReason {
        match self {
            KeyResolution::Resolved {
                manifest: Some(_), ..
            } => MissReason::Evicted,
            KeyResolution::Resolved { manifest: None, .. } => MissReason::SourceChanged,
            KeyResolution::Deferred { reason, .. } => *reason,
        }
    }
}

pub trait KeyStrategy {
    fn mode(&self) -> KeyMode;

    /// Computes the key, or as much of it as is possible without compiling.
    fn resolve_cache_key(
        &self,
        request: &CompileRequest,
        wrapper: &dyn CompilerWrapper,
    ) -> Result<KeyResolution, CacheError>;

    /// The key a fresh, successful compilation is stored under.
    fn key_after_compile(
        &self,
        request: &CompileRequest,
        resolution: &KeyResolution,
        output: &CompileOutput,
    ) -> Result<CacheKey, CacheError>;

    /// Bookkeeping once the result for `key` is in the object store.
    fn commit(
        &self,
        request: &CompileRequest,
        resolution: &KeyResolution,
        output: &CompileOutput,
        key: &CacheKey,
    ) -> Result<(), CacheError>;
}

/// Keys from source and header fingerprints validated through a manifest.
///
/// With a remote tier, a manifest missing locally is read from the remote and written
/// through, and every recorded manifest is uploaded.
pub struct DirectMode<'a> {
    pub manifests: &'a ManifestStore,
    pub fingerprints: &'a dyn FingerprintCache,
    pub normalizer: &'a PathNormalizer,
    pub remote: Option<&'a dyn ObjectBackend>,
}

impl DirectMode<'_> {
    /// Copies the remote entries for `manifest` into the local store. Returns whether any
    /// arrived.
    fn pull_remote_manifest(&self, manifest: &ManifestKey) -> bool {
        let Some(remote) = self.remote else {
            return false;
        };
        let entries = match remote.fetch_manifest(manifest) {
            Ok(Some(entries)) if !entries.is_empty() => entries,
            Ok(_) => return false,
            Err(err) => {
                tracing::warn!(
                    target = "compcache",
                    manifest = %manifest,
                    error = %err,
                    "remote manifest unavailable; treating as miss"
                );
                return false;
            }
        };
        match self.manifests.merge(manifest, entries) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(
                    target = "compcache",
                    manifest = %manifest,
                    error = %err,
                    "failed to copy remote manifest into local cache"
                );
                false
            }
        }
    }

    fn push_remote_manifest(&self, manifest: &ManifestKey) {
        let Some(remote) = self.remote else {
            return;
        };
        let entries = self.manifests.lookup(manifest);
        if let Err(err) = remote.put_manifest(manifest, &entries) {
            tracing::warn!(
                target = "compcache",
                manifest = %manifest,
                error = %err,
                "failed to upload manifest to remote cache"
            );
        }
    }

    fn manifest_key(resolution: &KeyResolution) -> Result<&ManifestKey, CacheError> {
        match resolution {
            KeyResolution::Resolved {
                manifest: Some(manifest),
                ..
            }
            | KeyResolution::Deferred { manifest, .. } => Ok(manifest),
            KeyResolution::Resolved { manifest: None, .. } => Err(CacheError::InvalidKey {
                key: "direct-mode resolution without manifest key".to_string(),
            }),
        }
    }

    fn header_records(
        &self,
        request: &CompileRequest,
        output: &CompileOutput,
    ) -> Result<Vec<HeaderRecord>, CacheError> {
        let source = request.source_path();
        let includes: Vec<_> = output
            .includes
            .iter()
            .map(|header| request.working_dir.join(header))
            .collect();
        key::dedup_includes(&includes, &source)
            .into_iter()
            .map(|header| -> Result<HeaderRecord, CacheError> {
                Ok(HeaderRecord {
                    path: self.normalizer.normalize(header),
                    fingerprint: Fingerprint::from_file(header)?,
                })
            })
            .collect()
    }

    fn direct_key(manifest: &ManifestKey, headers: &[HeaderRecord]) -> CacheKey {
        key::direct_cache_key(
            manifest,
            headers.iter().map(|h| (h.path.as_str(), &h.fingerprint)),
        )
    }
}

impl KeyStrategy for DirectMode<'_> {
    fn mode(&self) -> KeyMode {
        KeyMode::Direct
    }

    fn resolve_cache_key(
        &self,
        request: &CompileRequest,
        _wrapper: &dyn CompilerWrapper,
    ) -> Result<KeyResolution, CacheError> {
        let identity = RequestIdentity::compute(request, self.normalizer)?;
        let manifest = key::manifest_key(request, &identity, self.normalizer);
        let mut validation = self.manifests.find_valid(&manifest, self.fingerprints);
        if validation == Validation::Missing && self.pull_remote_manifest(&manifest) {
            validation = self.manifests.find_valid(&manifest, self.fingerprints);
        }
        Ok(match validation {
            Validation::Valid(key) => KeyResolution::Resolved {
                key,
                manifest: Some(manifest),
            },
            Validation::Stale => KeyResolution::Deferred {
                manifest,
                reason: MissReason::HeaderChanged,
            },
            Validation::Missing => KeyResolution::Deferred {
                manifest,
                reason: MissReason::SourceChanged,
            },
        })
    }

    fn key_after_compile(
        &self,
        request: &CompileRequest,
        resolution: &KeyResolution,
        output: &CompileOutput,
    ) -> Result<CacheKey, CacheError> {
        let manifest = Self::manifest_key(resolution)?;
        let headers = self.header_records(request, output)?;
        Ok(Self::direct_key(manifest, &headers))
    }

    fn commit(
        &self,
        request: &CompileRequest,
        resolution: &KeyResolution,
        output: &CompileOutput,
        key: &CacheKey,
    ) -> Result<(), CacheError> {
        let manifest = Self::manifest_key(resolution)?;
        let headers = self.header_records(request, output)?;
        // A header edited between hashing for the key and now would record a pairing that
        // never existed; skip the manifest and let the next build try again.
        if &Self::direct_key(manifest, &headers) != key {
            return Ok(());
        }
        self.manifests.record(
            manifest,
            ManifestEntry {
                headers,
                cache_key: key.clone(),
            },
        )?;
        self.push_remote_manifest(manifest);
        Ok(())
    }
}

/// Keys from the hash of the preprocessor output.
pub struct PreprocessorMode<'a> {
    pub normalizer: &'a PathNormalizer,
}

impl KeyStrategy for PreprocessorMode<'_> {
    fn mode(&self) -> KeyMode {
        KeyMode::Preprocessor
    }

    fn resolve_cache_key(
        &self,
        request: &CompileRequest,
        wrapper: &dyn CompilerWrapper,
    ) -> Result<KeyResolution, CacheError> {
        let compiler = crate::command::compiler_identity(request, self.normalizer)?;
        let preprocessed = wrapper.preprocess(request)?;
        Ok(KeyResolution::Resolved {
            key: key::preprocessor_cache_key(request, &compiler, &preprocessed, self.normalizer),
            manifest: None,
        })
    }

    fn key_after_compile(
        &self,
        _request: &CompileRequest,
        resolution: &KeyResolution,
        _output: &CompileOutput,
    ) -> Result<CacheKey, CacheError> {
        match resolution {
            KeyResolution::Resolved { key, .. } => Ok(key.clone()),
            KeyResolution::Deferred { .. } => Err(CacheError::InvalidKey {
                key: "preprocessor-mode resolution without key".to_string(),
            }),
        }
    }

    fn commit(
        &self,
        _request: &CompileRequest,
        _resolution: &KeyResolution,
        _output: &CompileOutput,
        _key: &CacheKey,
    ) -> Result<(), CacheError> {
        Ok(())
    }
}
