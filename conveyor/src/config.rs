//! Engine configuration.
//!
//! Configuration is loaded from a YAML file merged with environment variables
//! prefixed `CONVEYOR_` (double underscore for nesting, e.g.
//! `CONVEYOR_BUCKETS__OUTPUT=artifacts`). Every field has a default so an
//! empty config is valid.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

/// Names of the three logical object-store buckets.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BucketConfig {
    /// Raw intake files
    pub incoming: String,
    /// Rejected intake files
    pub failed: String,
    /// Aggregated per-batch artifacts
    pub output: String,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            incoming: "incoming".to_string(),
            failed: "failed".to_string(),
            output: "batch-output".to_string(),
        }
    }
}

/// Directory watcher settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatcherConfig {
    /// How often to scan the watched directories
    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,
    /// Files modified more recently than this are skipped, so a writer that
    /// is still appending is not raced
    #[serde(with = "humantime_serde")]
    pub min_age: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            min_age: Duration::from_secs(10),
        }
    }
}

/// Configuration for the batch engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum number of rows a worker claims per poll pass
    pub chunk_size: usize,

    /// Sleep between poll passes that claimed nothing
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Sleep between poll passes that claimed rows
    #[serde(with = "humantime_serde")]
    pub busy_poll_interval: Duration,

    /// How long a claimed row may sit without finalisation before another
    /// worker may reclaim it (crash recovery)
    #[serde(with = "humantime_serde")]
    pub reclaim_timeout: Duration,

    /// Number of workers started by `start_workers` when no explicit count is given
    pub workers: usize,

    /// TTL for cached non-terminal batch statuses
    #[serde(with = "humantime_serde")]
    pub status_ttl: Duration,

    /// Terminal statuses are cached for `status_ttl * terminal_ttl_factor`
    pub terminal_ttl_factor: u32,

    /// Bounded retries for transient store conflicts
    pub conflict_retries: u32,

    /// Interval for logging worker-pool activity (rows in flight);
    /// `None` disables the periodic status log
    #[serde(default, with = "humantime_serde")]
    pub status_log_interval: Option<Duration>,

    /// Sanitised object keys are truncated to this many characters
    pub max_object_key_len: usize,

    /// Object-store bucket names
    pub buckets: BucketConfig,

    /// Directory for output-fragment spool files; defaults to the system
    /// temp directory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spool_dir: Option<PathBuf>,

    /// Directory watcher settings
    pub watcher: WatcherConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            poll_interval: Duration::from_secs(1),
            busy_poll_interval: Duration::from_millis(50),
            reclaim_timeout: Duration::from_secs(60),
            workers: 4,
            status_ttl: Duration::from_secs(2),
            terminal_ttl_factor: 100,
            conflict_retries: 50,
            status_log_interval: Some(Duration::from_secs(2)),
            max_object_key_len: 500,
            buckets: BucketConfig::default(),
            spool_dir: None,
            watcher: WatcherConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional YAML file plus `CONVEYOR_` env vars.
    pub fn load(config_path: Option<&str>) -> Result<Self, figment::Error> {
        Self::figment(config_path).extract()
    }

    /// Build the figment without extracting, for callers that want to layer
    /// further providers on top.
    pub fn figment(config_path: Option<&str>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed("CONVEYOR_").split("__"))
    }

    /// TTL applied when caching a terminal batch status.
    pub fn terminal_ttl(&self) -> Duration {
        self.status_ttl * self.terminal_ttl_factor
    }

    /// Resolve the spool directory, falling back to the system temp dir.
    pub fn resolve_spool_dir(&self) -> PathBuf {
        self.spool_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("conveyor-spool"))
    }
}
