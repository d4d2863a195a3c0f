//! Search service configuration
//!
//! Values are resolved with priority: environment variables > `config.toml`
//! in the app data directory > defaults.

use crate::utils::app_data::{default_index_root, get_app_data_dir};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of tokens shown on each side of a hit
pub const DEFAULT_CONTEXT_TOKENS: usize = 3;

/// Default character budget for each side of a hit's context
pub const DEFAULT_CONTEXT_CHARS: usize = 200;

/// Default number of cached query results per service
pub const DEFAULT_QUERY_CACHE_SIZE: usize = 128;

/// Default interval between index-progress polls
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

/// Default time a caller waits for indexing before giving up
pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 60;

/// Largest document accepted by the tokenizer (100MB)
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 100 * 1024 * 1024;

/// Index storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Directory holding one sub-directory per project
    pub base_dir: PathBuf,
    /// Documents larger than this fail tokenization
    pub max_document_bytes: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            base_dir: default_index_root().unwrap_or_else(|_| PathBuf::from(".annodex")),
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
        }
    }
}

/// Reindex scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Number of indexing workers (0 = CPU count)
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub poll_timeout_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: 0,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poll_timeout_secs: DEFAULT_POLL_TIMEOUT_SECS,
        }
    }
}

impl SchedulerSettings {
    /// Get the effective worker count (resolves 0 to CPU count)
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.workers
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

/// Query engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    /// Tokens of context on each side of a hit
    pub context_tokens: usize,
    /// Hard character budget for each context side
    pub context_chars: usize,
    /// Cached query results (0 disables the cache)
    pub cache_size: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            context_tokens: DEFAULT_CONTEXT_TOKENS,
            context_chars: DEFAULT_CONTEXT_CHARS,
            cache_size: DEFAULT_QUERY_CACHE_SIZE,
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchConfig {
    pub index: IndexSettings,
    pub scheduler: SchedulerSettings,
    pub query: QuerySettings,
}

/// Configuration file format (TOML). Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub index: IndexConfigFile,
    #[serde(default)]
    pub scheduler: SchedulerConfigFile,
    #[serde(default)]
    pub query: QueryConfigFile,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexConfigFile {
    pub base_dir: Option<PathBuf>,
    pub max_document_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulerConfigFile {
    pub workers: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub poll_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryConfigFile {
    pub context_tokens: Option<usize>,
    pub context_chars: Option<usize>,
    pub cache_size: Option<usize>,
}

impl SearchConfig {
    /// Configuration with indexes stored under `base_dir`
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.index.base_dir = base_dir.into();
        config
    }

    /// Load config from file in the app data directory
    /// Returns None if file doesn't exist or can't be parsed
    fn load_from_file() -> Option<ConfigFile> {
        let app_dir = get_app_data_dir().ok()?;
        Self::read_file(&app_dir.join("config.toml"))
    }

    fn read_file(path: &Path) -> Option<ConfigFile> {
        if !path.exists() {
            return None;
        }

        let content = fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unparsable config file");
                None
            }
        }
    }

    /// Load config with priority: environment variables > config file > defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(file) = Self::load_from_file() {
            config.apply_file(file);
        }

        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Overlay values present in a parsed config file
    pub fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.index.base_dir {
            self.index.base_dir = v;
        }
        if let Some(v) = file.index.max_document_bytes {
            self.index.max_document_bytes = v;
        }
        if let Some(v) = file.scheduler.workers {
            self.scheduler.workers = v;
        }
        if let Some(v) = file.scheduler.poll_interval_ms {
            self.scheduler.poll_interval_ms = v;
        }
        if let Some(v) = file.scheduler.poll_timeout_secs {
            self.scheduler.poll_timeout_secs = v;
        }
        if let Some(v) = file.query.context_tokens {
            self.query.context_tokens = v;
        }
        if let Some(v) = file.query.context_chars {
            self.query.context_chars = v;
        }
        if let Some(v) = file.query.cache_size {
            self.query.cache_size = v;
        }
    }

    /// Overlay environment overrides; unparsable values are ignored
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("ANNODEX_INDEX_DIR") {
            self.index.base_dir = PathBuf::from(dir);
        }
        if let Some(n) = lookup("ANNODEX_WORKERS").and_then(|v| v.parse().ok()) {
            self.scheduler.workers = n;
        }
        if let Some(ms) = lookup("ANNODEX_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.scheduler.poll_interval_ms = ms;
        }
        if let Some(secs) = lookup("ANNODEX_POLL_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.scheduler.poll_timeout_secs = secs;
        }
        if let Some(n) = lookup("ANNODEX_CONTEXT_TOKENS").and_then(|v| v.parse().ok()) {
            self.query.context_tokens = n;
        }
        if let Some(n) = lookup("ANNODEX_CONTEXT_CHARS").and_then(|v| v.parse().ok()) {
            self.query.context_chars = n;
        }
    }
}
