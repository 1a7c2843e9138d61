use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the cache engine and its on-disk stores.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {message}")]
    Json { message: String },

    #[error("toml error in {path}: {message}")]
    Toml { path: PathBuf, message: String },

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("timed out after {waited:?} waiting for lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("invalid cache configuration: {message}")]
    InvalidConfig { message: String },

    #[error("cache root {path} is not writable: {source}")]
    UnwritableRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("incompatible cache layout version: expected {expected}, found {found}")]
    IncompatibleVersion { expected: u32, found: String },

    #[error("malformed cache key {key:?}")]
    InvalidKey { key: String },

    #[error("remote backend error: {message}")]
    Remote { message: String },

    #[error("unsupported remote endpoint {url}")]
    UnsupportedEndpoint { url: String },

    #[error("compiler invocation failed: {message}")]
    Compiler { message: String },

    #[error("failed to read {path}: {source}")]
    UnreadableInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How a failure should influence the current compiler invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Broken or missing cache state. Treat the unit as absent and continue as a miss.
    Recoverable,
    /// Lock timeout, disk full and friends. Compile without caching and report it.
    ResourceExhausted,
    /// Configuration problems. The cache layer is disabled for this invocation.
    Fatal,
}

impl CacheError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CacheError::LockTimeout { .. } => ErrorClass::ResourceExhausted,
            CacheError::Io(err) if is_resource_exhaustion(err) => ErrorClass::ResourceExhausted,
            CacheError::MissingHomeDir
            | CacheError::InvalidConfig { .. }
            | CacheError::UnwritableRoot { .. }
            | CacheError::Toml { .. }
            | CacheError::UnsupportedEndpoint { .. } => ErrorClass::Fatal,
            CacheError::Io(_)
            | CacheError::Json { .. }
            | CacheError::Bincode(_)
            | CacheError::WalkDir(_)
            | CacheError::IncompatibleVersion { .. }
            | CacheError::InvalidKey { .. }
            | CacheError::Remote { .. }
            | CacheError::Compiler { .. }
            | CacheError::UnreadableInput { .. } => ErrorClass::Recoverable,
        }
    }
}

fn is_resource_exhaustion(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::StorageFull
            | std::io::ErrorKind::QuotaExceeded
            | std::io::ErrorKind::OutOfMemory
    )
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        // Manifests carry user paths. Keep line/column info, drop the quoted values.
        let message = redact_quoted(&err.to_string());
        Self::Json { message }
    }
}

fn redact_quoted(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];

        let bytes = rest.as_bytes();
        let mut end = None;
        for (idx, &b) in bytes.iter().enumerate() {
            if b != b'"' {
                continue;
            }
            let escapes = bytes[..idx].iter().rev().take_while(|&&c| c == b'\\').count();
            if escapes % 2 == 0 {
                end = Some(idx);
                break;
            }
        }

        match end {
            Some(end) => {
                out.push_str("<redacted>\"");
                rest = &rest[end + 1..];
            }
            None => {
                out.push_str("<redacted>");
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}
