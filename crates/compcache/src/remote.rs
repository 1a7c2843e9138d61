//! Remote storage behind the same `has/fetch/put` contract as the local store, plus the
//! direct-mode manifests that make remote objects reachable without preprocessing.
//!
//! Callers treat every remote failure as a miss; nothing here is allowed to fail a build.

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::eviction::{EvictionController, EvictionPolicy};
use crate::key::{CacheKey, ManifestKey, CACHE_LAYOUT_VERSION, MANIFEST_FORMAT_VERSION};
use crate::layout::CacheDir;
use crate::manifest::ManifestEntry;
use crate::object_store::{CacheEntry, ObjectBackend, PutOutcome};
use crate::util;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

/// Per-request timeout of the HTTP backend.
pub const REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

const URL_REDACTION: &str = "<redacted>";

#[derive(Debug, Serialize, Deserialize)]
struct RemotePayload {
    format_version: u32,
    key: String,
    object: Vec<u8>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RemoteManifest {
    format_version: u32,
    key: String,
    entries: Vec<ManifestEntry>,
}

/// Key-value service speaking `HEAD/GET/PUT <endpoint>/objects/<key>` and
/// `GET/PUT <endpoint>/manifests/<key>`.
///
/// Object bodies are a bincode envelope and manifest bodies a JSON document; both carry the
/// key, so a misrouted response is detected.
pub struct HttpBackend {
    endpoint: String,
    agent: ureq::Agent,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("endpoint", &sanitize_url(&self.endpoint))
            .finish_non_exhaustive()
    }
}

impl HttpBackend {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    fn url(&self, key: &CacheKey) -> String {
        format!("{}/objects/{}", self.endpoint, key.as_str())
    }

    fn manifest_url(&self, key: &ManifestKey) -> String {
        format!("{}/manifests/{}", self.endpoint, key.as_str())
    }

    /// `GET url`, with a 404 read as absent and the body capped at the payload limit.
    fn get_limited(&self, url: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let response = match self.agent.get(url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(err) => return Err(self.remote_error(url, err)),
        };

        let mut body = Vec::new();
        response
            .into_reader()
            .take(util::PAYLOAD_LIMIT_BYTES as u64 + 1)
            .read_to_end(&mut body)?;
        if body.len() > util::PAYLOAD_LIMIT_BYTES {
            return Err(CacheError::Remote {
                message: format!("payload from {} exceeds size limit", sanitize_url(url)),
            });
        }
        Ok(Some(body))
    }

    fn remote_error(&self, url: &str, err: ureq::Error) -> CacheError {
        let safe_url = sanitize_url(url);
        let message = match err {
            ureq::Error::Status(code, _response) => {
                format!("server returned status {code} for {safe_url}")
            }
            ureq::Error::Transport(transport) => {
                format!("transport error for {safe_url}: {}", transport.kind())
            }
        };
        CacheError::Remote { message }
    }
}

impl ObjectBackend for HttpBackend {
    fn has(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let url = self.url(key);
        match self.agent.head(&url).call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(err) => Err(self.remote_error(&url, err)),
        }
    }

    fn fetch(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let url = self.url(key);
        let Some(body) = self.get_limited(&url)? else {
            return Ok(None);
        };

        let payload: RemotePayload = util::bincode_deserialize(&body)?;
        if payload.format_version != CACHE_LAYOUT_VERSION || payload.key != key.as_str() {
            return Err(CacheError::Remote {
                message: format!("payload from {} does not match the key", sanitize_url(&url)),
            });
        }

        let size = (payload.object.len() + payload.stdout.len() + payload.stderr.len()) as u64;
        Ok(Some(CacheEntry {
            key: key.clone(),
            object: payload.object,
            stdout: payload.stdout,
            stderr: payload.stderr,
            size,
            created_at_millis: util::now_millis(),
        }))
    }

    fn put(
        &self,
        key: &CacheKey,
        object: &[u8],
        stdout: &[u8],
        stderr: &[u8],
    ) -> Result<PutOutcome, CacheError> {
        let payload = RemotePayload {
            format_version: CACHE_LAYOUT_VERSION,
            key: key.as_str().to_string(),
            object: object.to_vec(),
            stdout: stdout.to_vec(),
            stderr: stderr.to_vec(),
        };
        let bytes = util::bincode_serialize(&payload)?;
        let url = self.url(key);
        self.agent
            .put(&url)
            .set("Content-Type", "application/octet-stream")
            .send_bytes(&bytes)
            .map_err(|err| self.remote_error(&url, err))?;
        Ok(PutOutcome {
            size: bytes.len() as u64,
            published: true,
        })
    }

    fn fetch_manifest(&self, key: &ManifestKey) -> Result<Option<Vec<ManifestEntry>>, CacheError> {
        let url = self.manifest_url(key);
        let Some(body) = self.get_limited(&url)? else {
            return Ok(None);
        };
        let manifest: RemoteManifest = serde_json::from_slice(&body)?;
        if manifest.format_version != MANIFEST_FORMAT_VERSION || manifest.key != key.as_str() {
            return Err(CacheError::Remote {
                message: format!("manifest from {} does not match the key", sanitize_url(&url)),
            });
        }
        Ok(Some(manifest.entries))
    }

    fn put_manifest(&self, key: &ManifestKey, entries: &[ManifestEntry]) -> Result<(), CacheError> {
        let body = serde_json::to_vec(&RemoteManifest {
            format_version: MANIFEST_FORMAT_VERSION,
            key: key.as_str().to_string(),
            entries: entries.to_vec(),
        })?;
        let url = self.manifest_url(key);
        self.agent
            .put(&url)
            .set("Content-Type", "application/json")
            .send_bytes(&body)
            .map_err(|err| self.remote_error(&url, err))?;
        Ok(())
    }
}

/// A second cache root used as the remote tier, for example on a shared drive.
///
/// Puts go through the root's own ledger and eviction, so it stays under the bound set in its
/// `config.toml` no matter how many caches write to it. Manifests are merged into its manifest
/// store.
#[derive(Clone, Debug)]
pub struct SharedDirBackend {
    cache: CacheDir,
    eviction: EvictionController,
}

impl SharedDirBackend {
    pub fn open(root: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self, CacheError> {
        let config = CacheConfig::for_shared_root(root, lock_timeout)?;
        let cache = CacheDir::open(&config)?;
        Ok(Self {
            eviction: EvictionController::new(
                cache.clone(),
                EvictionPolicy::new(config.max_cache_size),
            ),
            cache,
        })
    }

    pub fn cache_dir(&self) -> &CacheDir {
        &self.cache
    }
}

impl ObjectBackend for SharedDirBackend {
    fn has(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(self.cache.objects().has(key))
    }

    fn fetch(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        self.cache.objects().fetch(key)
    }

    fn put(
        &self,
        key: &CacheKey,
        object: &[u8],
        stdout: &[u8],
        stderr: &[u8],
    ) -> Result<PutOutcome, CacheError> {
        let staged = self.cache.objects().stage(key, object, stdout, stderr)?;
        let (outcome, stats) = self.cache.publish(staged, None)?;
        if self.eviction.policy().needs_cleaning(&stats) {
            if let Err(err) = self.eviction.clean() {
                tracing::warn!(
                    target = "compcache",
                    root = %self.cache.root().display(),
                    error = %err,
                    "failed to clean shared cache"
                );
            }
        }
        Ok(outcome)
    }

    fn fetch_manifest(&self, key: &ManifestKey) -> Result<Option<Vec<ManifestEntry>>, CacheError> {
        let entries = self.cache.manifests().lookup(key);
        Ok((!entries.is_empty()).then_some(entries))
    }

    fn put_manifest(&self, key: &ManifestKey, entries: &[ManifestEntry]) -> Result<(), CacheError> {
        self.cache.manifests().merge(key, entries.to_vec())
    }
}

/// Picks a backend for `endpoint`.
///
/// `http(s)://` selects [`HttpBackend`]; `file://` URLs and plain paths open a
/// [`SharedDirBackend`].
pub fn backend_for_endpoint(
    endpoint: &str,
    lock_timeout: Duration,
) -> Result<Box<dyn ObjectBackend>, CacheError> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return Ok(Box::new(HttpBackend::new(endpoint, REMOTE_TIMEOUT)));
    }

    let path = match endpoint.strip_prefix("file://") {
        Some(stripped) => PathBuf::from(stripped),
        None if endpoint.contains("://") => {
            return Err(CacheError::UnsupportedEndpoint {
                url: sanitize_url(endpoint),
            })
        }
        None => PathBuf::from(endpoint),
    };

    Ok(Box::new(SharedDirBackend::open(path, lock_timeout)?))
}

/// Strips credentials from a URL before it appears in logs or errors: userinfo, every query
/// value and the fragment.
pub fn sanitize_url(url: &str) -> String {
    let Some(scheme_idx) = url.find("://") else {
        return url.to_owned();
    };

    let (scheme, rest) = url.split_at(scheme_idx + 3);
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);
    let authority = match authority.rfind('@') {
        Some(at) => format!("{URL_REDACTION}@{}", &authority[at + 1..]),
        None => authority.to_owned(),
    };

    let (tail, fragment) = match tail.split_once('#') {
        Some((before, _)) => (before, Some(URL_REDACTION)),
        None => (tail, None),
    };
    let tail = match tail.split_once('?') {
        Some((path, query)) => {
            let query: Vec<String> = query
                .split('&')
                .filter(|part| !part.is_empty())
                .map(|part| {
                    let name = part.split_once('=').map_or(part, |(name, _)| name);
                    format!("{name}={URL_REDACTION}")
                })
                .collect();
            format!("{path}?{}", query.join("&"))
        }
        None => tail.to_owned(),
    };

    match fragment {
        Some(marker) => format!("{scheme}{authority}{tail}#{marker}"),
        None => format!("{scheme}{authority}{tail}"),
    }
}
