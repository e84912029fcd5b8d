//! # drift-config
//!
//! Configuration management for the drift race detector.
//!
//! Loads configuration from:
//! 1. `~/.drift/config.toml` (global)
//! 2. `.drift/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! The instrumentation layer may additionally forward detector flags through
//! [`Config::apply_args`], which is applied on top of whatever was loaded.

pub mod logging;

pub use logging::LogLevel;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

impl ConfigError {
    fn invalid(key: &str, value: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.into(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub detector: DetectorConfig,
    pub eviction: EvictionConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let mut config = Self::load_layered(global.as_deref(), Path::new(".drift/config.toml"))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load a global file and a project file on top of it, skipping missing ones.
    ///
    /// Tables are merged key by key, so a project file only has to name the
    /// values it changes.
    pub fn load_layered(global: Option<&Path>, project: &Path) -> Result<Self, ConfigError> {
        let mut table = toml::Table::new();

        if let Some(global_path) = global {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(global_path)?;
                merge_tables(&mut table, toml::from_str(&contents)?);
            }
        }

        if project.exists() {
            debug!("Loading project config from {:?}", project);
            let contents = std::fs::read_to_string(project)?;
            merge_tables(&mut table, toml::from_str(&contents)?);
        }

        Ok(toml::Value::Table(table).try_into()?)
    }

    /// Global config path: ~/.drift/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".drift/config.toml"))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(capacity) = std::env::var("DRIFT_CAPACITY") {
            self.detector.capacity = parse_value("DRIFT_CAPACITY", &capacity)?;
        }
        if let Ok(policy) = std::env::var("DRIFT_EVICTION") {
            self.eviction.policy = parse_value("DRIFT_EVICTION", &policy)?;
        }
        if let Ok(stats) = std::env::var("DRIFT_STATS") {
            self.detector.statistics = matches!(stats.as_str(), "1" | "true" | "yes" | "on");
        }
        if let Ok(level) = std::env::var("DRIFT_LOG") {
            self.logging.level = parse_value("DRIFT_LOG", &level)?;
        }
        Ok(())
    }

    /// Apply detector flags forwarded by the instrumentation layer.
    ///
    /// The first element is the program name, as in a C `argv`. Flags the
    /// detector does not know belong to other layers and are skipped.
    pub fn apply_args<S: AsRef<str>>(&mut self, args: &[S]) -> Result<(), ConfigError> {
        let mut iter = args.iter().skip(1).map(|arg| arg.as_ref());
        while let Some(arg) = iter.next() {
            match arg {
                "--stats" => self.detector.statistics = true,
                "--capacity" => {
                    let value = iter.next().ok_or_else(|| ConfigError::invalid("--capacity", ""))?;
                    self.detector.capacity = parse_value("--capacity", value)?;
                }
                "--eviction" => {
                    let value = iter.next().ok_or_else(|| ConfigError::invalid("--eviction", ""))?;
                    self.eviction.policy = parse_value("--eviction", value)?;
                }
                "--stack-depth" => {
                    let value =
                        iter.next().ok_or_else(|| ConfigError::invalid("--stack-depth", ""))?;
                    self.detector.max_stack_depth = parse_value("--stack-depth", value)?;
                }
                other => debug!(arg = other, "Ignoring unknown detector argument"),
            }
        }
        Ok(())
    }

    /// Build a config from defaults plus command-line flags only.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_args(args)?;
        Ok(config)
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::invalid(key, value))
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Core detector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Number of tracked locations that triggers eviction (0 = never evict)
    pub capacity: usize,
    /// Maximum number of frames reported per access
    pub max_stack_depth: usize,
    /// Size of the address-sharded lock pool (rounded up to a power of two)
    pub lock_shards: usize,
    /// Collect rule-hit counters and log a summary on finalize
    pub statistics: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            capacity: 1 << 20,
            max_stack_depth: 16,
            lock_shards: 1024,
            statistics: false,
        }
    }
}

/// Which entries are dropped once the location table reaches capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Drop only entries every live thread has already observed
    #[default]
    SafeSweep,
    /// Drop a bounded random subset
    RandomSample,
    /// Drop the lowest write clock of every fixed-size batch
    LowestClock,
    /// Drop entries touched only by a thread when it is joined or finishes
    ThreadPurge,
}

impl EvictionPolicy {
    /// Whether the policy may forget history a future access could still race with.
    pub fn is_lossy(self) -> bool {
        matches!(self, EvictionPolicy::RandomSample | EvictionPolicy::LowestClock)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EvictionPolicy::SafeSweep => "safe_sweep",
            EvictionPolicy::RandomSample => "random_sample",
            EvictionPolicy::LowestClock => "lowest_clock",
            EvictionPolicy::ThreadPurge => "thread_purge",
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().replace('-', "_").as_str() {
            "safe_sweep" | "safe" => Ok(EvictionPolicy::SafeSweep),
            "random_sample" | "random" => Ok(EvictionPolicy::RandomSample),
            "lowest_clock" | "lowest" => Ok(EvictionPolicy::LowestClock),
            "thread_purge" | "purge" => Ok(EvictionPolicy::ThreadPurge),
            _ => Err(ConfigError::invalid("eviction.policy", s)),
        }
    }
}

/// Eviction tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    pub policy: EvictionPolicy,
    /// Upper bound of entries removed by one random-sample run
    pub sample_size: usize,
    /// Batch width scanned per evicted entry by the lowest-clock policy
    pub batch_size: usize,
    /// Cap on the number of triggers a stalled safe sweep skips
    pub max_backoff: u32,
    /// Fixed RNG seed for random sampling (None = entropy)
    pub seed: Option<u64>,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            policy: EvictionPolicy::SafeSweep,
            sample_size: 4096,
            batch_size: 64,
            max_backoff: 1024,
            seed: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
}
