//! Configuration for Stratus components
//!
//! One `StratusConfig` is built at startup and handed to every component.
//! Values come from defaults, an optional config file, and `STRATUS__*`
//! environment variables, in increasing order of precedence.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StratusError};

/// Environment variable prefix (`STRATUS__LOCK__ACQUIRE_TIMEOUT_MS=5000`)
pub const ENV_PREFIX: &str = "STRATUS";

/// Separator between nested keys in environment variables
pub const ENV_SEPARATOR: &str = "__";

/// Exponential backoff settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay in milliseconds
    pub base_ms: u64,
    /// Upper bound of the exponential part in milliseconds
    pub max_ms: u64,
    /// Random jitter added to every delay, in milliseconds
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 50,
            max_ms: 2000,
            jitter_ms: 50,
        }
    }
}

impl BackoffConfig {
    pub fn new(base_ms: u64, max_ms: u64, jitter_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_ms,
        }
    }

    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.max_ms < self.base_ms {
            return Err(StratusError::Config(format!(
                "{}.backoff.max_ms ({}) is lower than base_ms ({})",
                section, self.max_ms, self.base_ms
            )));
        }
        Ok(())
    }
}

/// Distributed lock settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Default lease duration for a new lock
    pub lease_duration_ms: u64,
    /// Default time `acquire` waits for a contended lock
    pub acquire_timeout_ms: u64,
    /// Backoff between contended acquisition attempts
    pub backoff: BackoffConfig,
    /// Interval of the background renewal for long leases
    pub renew_interval_ms: u64,
    /// Longest lease the store grants in one call
    pub max_store_lease_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: 60_000,
            acquire_timeout_ms: 30_000,
            backoff: BackoffConfig::default(),
            renew_interval_ms: 20_000,
            max_store_lease_ms: 60_000,
        }
    }
}

impl LockConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    pub fn max_store_lease(&self) -> Duration {
        Duration::from_millis(self.max_store_lease_ms)
    }
}

/// Remote queue settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Default visibility window of a popped message
    pub visibility_timeout_secs: u64,
    /// First delay between empty polls while waiting
    pub poll_interval_ms: u64,
    /// Longest delay between empty polls
    pub max_poll_interval_ms: u64,
    /// How often auto-renewed messages get their visibility extended
    pub autorenew_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 30,
            poll_interval_ms: 100,
            max_poll_interval_ms: 1000,
            autorenew_interval_secs: 15,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn autorenew_interval(&self) -> Duration {
        Duration::from_secs(self.autorenew_interval_secs)
    }

    /// Backoff used between empty polls
    pub fn poll_backoff(&self) -> BackoffConfig {
        BackoffConfig::new(
            self.poll_interval_ms,
            self.max_poll_interval_ms,
            self.poll_interval_ms / 2,
        )
    }
}

/// Index manager settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Commit attempts before giving up with `IndexConflict`
    pub retry_budget: u32,
    /// How long a fetched index may serve reads (0 disables caching)
    pub cache_ttl_ms: u64,
    /// Serialize index commits behind a distributed lock
    pub lock_writes: bool,
    /// Lease duration of the index lock
    pub lock_lease_ms: u64,
    /// Backoff between conflicting commit attempts
    pub backoff: BackoffConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            retry_budget: 8,
            cache_ttl_ms: 0,
            lock_writes: true,
            lock_lease_ms: 60_000,
            backoff: BackoffConfig::new(10, 500, 20),
        }
    }
}

impl IndexConfig {
    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_ms > 0).then(|| Duration::from_millis(self.cache_ttl_ms))
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }
}

/// Transient storage failure handling
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Total attempts per store call, including the first one
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::new(20, 500, 20),
        }
    }
}

/// Remote dictionary settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DictionaryConfig {
    /// Path separator of the store; a key ending with it names a sub-dictionary
    pub separator: String,
    /// Longest store path an entry may map to
    pub max_key_path_len: usize,
}

impl Default for DictionaryConfig {
    fn default() -> Self {
        Self {
            separator: crate::DEFAULT_SEPARATOR.to_string(),
            max_key_path_len: 1024,
        }
    }
}

/// Top-level configuration passed to every component
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StratusConfig {
    pub lock: LockConfig,
    pub queue: QueueConfig,
    pub index: IndexConfig,
    pub storage: StorageConfig,
    pub dictionary: DictionaryConfig,
}

impl StratusConfig {
    /// Load configuration from an optional file layered under `STRATUS__*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;

        let config: StratusConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a component loop forever or never succeed.
    pub fn validate(&self) -> Result<()> {
        if self.lock.lease_duration_ms == 0 {
            return Err(StratusError::Config(
                "lock.lease_duration_ms must be positive".to_string(),
            ));
        }
        if self.lock.max_store_lease_ms == 0 {
            return Err(StratusError::Config(
                "lock.max_store_lease_ms must be positive".to_string(),
            ));
        }
        if self.lock.renew_interval_ms == 0
            || self.lock.renew_interval_ms >= self.lock.max_store_lease_ms
        {
            return Err(StratusError::Config(format!(
                "lock.renew_interval_ms must be in 1..{}",
                self.lock.max_store_lease_ms
            )));
        }
        self.lock.backoff.validate("lock")?;

        if self.queue.visibility_timeout_secs == 0 {
            return Err(StratusError::Config(
                "queue.visibility_timeout_secs must be positive".to_string(),
            ));
        }
        if self.queue.poll_interval_ms == 0
            || self.queue.max_poll_interval_ms < self.queue.poll_interval_ms
        {
            return Err(StratusError::Config(
                "queue.poll_interval_ms must be positive and not above max_poll_interval_ms"
                    .to_string(),
            ));
        }

        if self.index.retry_budget == 0 {
            return Err(StratusError::Config(
                "index.retry_budget must be positive".to_string(),
            ));
        }
        self.index.backoff.validate("index")?;

        if self.storage.max_attempts == 0 {
            return Err(StratusError::Config(
                "storage.max_attempts must be positive".to_string(),
            ));
        }
        self.storage.backoff.validate("storage")?;

        if self.dictionary.separator.is_empty() {
            return Err(StratusError::Config(
                "dictionary.separator must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StratusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lock.lease_duration(), Duration::from_secs(60));
        assert_eq!(config.queue.visibility_timeout(), Duration::from_secs(30));
        assert_eq!(config.index.cache_ttl(), None);
        assert_eq!(config.dictionary.separator, "/");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = StratusConfig::default();
        config.index.retry_budget = 0;
        assert!(matches!(config.validate(), Err(StratusError::Config(_))));

        let mut config = StratusConfig::default();
        config.lock.backoff = BackoffConfig::new(500, 100, 0);
        assert!(matches!(config.validate(), Err(StratusError::Config(_))));

        let mut config = StratusConfig::default();
        config.lock.renew_interval_ms = config.lock.max_store_lease_ms;
        assert!(config.validate().is_err());

        let mut config = StratusConfig::default();
        config.dictionary.separator.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file_keeps_unset_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[lock]\nacquire_timeout_ms = 1500\n\n[index]\nretry_budget = 3\ncache_ttl_ms = 250"
        )
        .unwrap();

        let config = StratusConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.lock.acquire_timeout(), Duration::from_millis(1500));
        assert_eq!(config.lock.lease_duration_ms, 60_000);
        assert_eq!(config.index.retry_budget, 3);
        assert_eq!(config.index.cache_ttl(), Some(Duration::from_millis(250)));
        assert_eq!(config.queue, QueueConfig::default());
    }

    #[test]
    fn test_load_rejects_invalid_file_values() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "[storage]\nmax_attempts = 0").unwrap();

        let result = StratusConfig::load(Some(file.path()));
        assert!(matches!(result, Err(StratusError::Config(_))));
    }

    #[test]
    fn test_poll_backoff_derives_from_intervals() {
        let queue = QueueConfig {
            poll_interval_ms: 200,
            max_poll_interval_ms: 800,
            ..Default::default()
        };
        assert_eq!(queue.poll_backoff(), BackoffConfig::new(200, 800, 100));
    }
}
