//! Cache configuration: built-in defaults, then `config.toml` inside the cache root, then
//! `COMPCACHE_*` environment variables.

use crate::error::CacheError;
use crate::util;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_CACHE_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DIR_NAME: &str = ".compcache";
pub const CONFIG_FILE_NAME: &str = "config.toml";

pub const ENV_DIR: &str = "COMPCACHE_DIR";
pub const ENV_MAX_SIZE: &str = "COMPCACHE_MAX_SIZE";
pub const ENV_LOCK_TIMEOUT_MS: &str = "COMPCACHE_LOCK_TIMEOUT_MS";
pub const ENV_NODIRECT: &str = "COMPCACHE_NODIRECT";
pub const ENV_REMOTE: &str = "COMPCACHE_REMOTE";
pub const ENV_BASEDIR: &str = "COMPCACHE_BASEDIR";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub root: PathBuf,
    /// Upper bound on stored bytes; `clean` shrinks the store to 90% of it.
    pub max_cache_size: u64,
    pub lock_timeout: Duration,
    pub direct_mode: bool,
    /// `http(s)://` key-value service, `file://` URL or plain path of a shared store.
    pub remote_endpoint: Option<String>,
    /// Prefix collapsed out of every path that enters a key or manifest.
    pub base_dir: Option<PathBuf>,
}

/// The optional fields of `config.toml`. Unknown keys are ignored.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FileConfig {
    max_cache_size: Option<u64>,
    lock_timeout_ms: Option<u64>,
    direct_mode: Option<bool>,
    remote_endpoint: Option<String>,
    base_dir: Option<PathBuf>,
}

impl CacheConfig {
    /// Defaults rooted at `root`, ignoring `config.toml` and the environment.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            direct_mode: true,
            remote_endpoint: None,
            base_dir: None,
        }
    }

    /// Settings of a cache root serving as another cache's remote tier: defaults plus that
    /// root's own `config.toml`, with the caller's lock timeout. The environment is ignored.
    pub fn for_shared_root(
        root: impl Into<PathBuf>,
        lock_timeout: Duration,
    ) -> Result<Self, CacheError> {
        let mut config = Self::with_root(root);
        config.apply_file(&read_file_config(&config.root)?);
        config.lock_timeout = lock_timeout;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from the process environment.
    pub fn load() -> Result<Self, CacheError> {
        Self::from_env_vars(|name| std::env::var(name).ok())
    }

    /// Loads the configuration with `lookup` standing in for the environment.
    pub fn from_env_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CacheError> {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let root = match lookup(ENV_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => lookup("HOME")
                .or_else(|| lookup("USERPROFILE"))
                .map(|home| PathBuf::from(home).join(DEFAULT_DIR_NAME))
                .ok_or(CacheError::MissingHomeDir)?,
        };

        let mut config = Self::with_root(root);
        config.apply_file(&read_file_config(&config.root)?);

        if let Some(value) = lookup(ENV_MAX_SIZE) {
            config.max_cache_size = parse_u64(ENV_MAX_SIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_LOCK_TIMEOUT_MS) {
            config.lock_timeout = Duration::from_millis(parse_u64(ENV_LOCK_TIMEOUT_MS, &value)?);
        }
        if let Some(value) = lookup(ENV_NODIRECT) {
            config.direct_mode = value.trim() == "0";
        }
        if let Some(value) = lookup(ENV_REMOTE) {
            config.remote_endpoint = Some(value);
        }
        if let Some(value) = lookup(ENV_BASEDIR) {
            config.base_dir = Some(PathBuf::from(value));
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: &FileConfig) {
        if let Some(size) = file.max_cache_size {
            self.max_cache_size = size;
        }
        if let Some(ms) = file.lock_timeout_ms {
            self.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(direct) = file.direct_mode {
            self.direct_mode = direct;
        }
        if let Some(endpoint) = &file.remote_endpoint {
            self.remote_endpoint = Some(endpoint.clone()).filter(|e| !e.trim().is_empty());
        }
        if let Some(base_dir) = &file.base_dir {
            self.base_dir = Some(base_dir.clone());
        }
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        let invalid = |message: &str| {
            Err(CacheError::InvalidConfig {
                message: message.to_string(),
            })
        };
        if self.max_cache_size == 0 {
            return invalid("max_cache_size must be greater than zero");
        }
        if self.lock_timeout.is_zero() {
            return invalid("lock timeout must be greater than zero");
        }
        if self.base_dir.as_deref().is_some_and(|dir| !dir.is_absolute()) {
            return invalid("base_dir must be an absolute path");
        }
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }
}

fn parse_u64(name: &str, value: &str) -> Result<u64, CacheError> {
    value
        .trim()
        .parse()
        .map_err(|_| CacheError::InvalidConfig {
            message: format!("{name} must be a non-negative integer"),
        })
}

fn toml_error(path: &Path, message: &str) -> CacheError {
    CacheError::Toml {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

fn read_file_config(root: &Path) -> Result<FileConfig, CacheError> {
    let path = root.join(CONFIG_FILE_NAME);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(FileConfig::default()),
        Err(err) => return Err(err.into()),
    };
    // `message()` leaves out the source snippet, which could echo secrets such as remote URLs.
    toml::from_str(&text).map_err(|err| toml_error(&path, err.message()))
}

/// Stores a new size bound in `config.toml`, keeping every other key of the file.
pub fn persist_max_cache_size(root: &Path, bytes: u64) -> Result<(), CacheError> {
    let path = root.join(CONFIG_FILE_NAME);
    let value = i64::try_from(bytes).map_err(|_| CacheError::InvalidConfig {
        message: "max_cache_size is too large".to_string(),
    })?;
    if value == 0 {
        return Err(CacheError::InvalidConfig {
            message: "max_cache_size must be greater than zero".to_string(),
        });
    }

    let mut table = match std::fs::read_to_string(&path) {
        Ok(text) => text
            .parse::<toml::Table>()
            .map_err(|err| toml_error(&path, err.message()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => toml::Table::new(),
        Err(err) => return Err(err.into()),
    };
    table.insert("max_cache_size".to_string(), toml::Value::Integer(value));

    let text = toml::to_string(&table).map_err(|err| toml_error(&path, &err.to_string()))?;
    util::atomic_write(&path, text.as_bytes())
}
