//! Environment variable and config file support for [`RuntimeBuilder`](super::builder::RuntimeBuilder).
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: values set via builder methods (`shards(4)`)
//! 2. **Environment variables**: values from `PERCORE_*` env vars
//! 3. **Config file**: values loaded from a TOML file (requires `config-file` feature)
//! 4. **Defaults**: built-in defaults from [`RuntimeConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `PERCORE_SHARDS` | `usize` | `shards` |
//! | `PERCORE_THREAD_STACK_SIZE` | `usize` | `thread_stack_size` |
//! | `PERCORE_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |
//! | `PERCORE_SMP_QUEUE_CAPACITY` | `usize` | `smp_queue_capacity` |
//! | `PERCORE_TASK_QUOTA_US` | `u64` | `reactor.task_quota` |
//! | `PERCORE_IDLE_POLL_TIMEOUT_MS` | `u64` | `reactor.idle_poll_timeout` |
//! | `PERCORE_STALL_DETECTION` | `bool` | `reactor.stall.enabled` |
//! | `PERCORE_STALL_THRESHOLD_MS` | `u64` | `reactor.stall.threshold` |

use crate::error::Error;
use crate::runtime::config::RuntimeConfig;
use std::time::Duration;

/// Environment variable name for the shard count.
pub const ENV_SHARDS: &str = "PERCORE_SHARDS";
/// Environment variable name for shard thread stack size.
pub const ENV_THREAD_STACK_SIZE: &str = "PERCORE_THREAD_STACK_SIZE";
/// Environment variable name for shard thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "PERCORE_THREAD_NAME_PREFIX";
/// Environment variable name for the cross-shard queue capacity.
pub const ENV_SMP_QUEUE_CAPACITY: &str = "PERCORE_SMP_QUEUE_CAPACITY";
/// Environment variable name for the task quota, in microseconds.
pub const ENV_TASK_QUOTA_US: &str = "PERCORE_TASK_QUOTA_US";
/// Environment variable name for the idle poll timeout, in milliseconds.
pub const ENV_IDLE_POLL_TIMEOUT_MS: &str = "PERCORE_IDLE_POLL_TIMEOUT_MS";
/// Environment variable name for the stall detector toggle.
pub const ENV_STALL_DETECTION: &str = "PERCORE_STALL_DETECTION";
/// Environment variable name for the stall threshold, in milliseconds.
pub const ENV_STALL_THRESHOLD_MS: &str = "PERCORE_STALL_THRESHOLD_MS";

/// Configuration that could not be read or parsed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held a value of the wrong type.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidValue {
        /// Variable name.
        var: String,
        /// What was expected.
        expected: &'static str,
        /// The offending value.
        value: String,
    },
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    #[error("failed to parse TOML config: {0}")]
    Parse(String),
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::config(err.to_string())
    }
}

/// Apply environment variable overrides to a [`RuntimeConfig`].
///
/// Only variables that are set in the environment are applied.
/// Returns an error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_SHARDS) {
        config.shards = parse_usize(ENV_SHARDS, &val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_STACK_SIZE) {
        config.thread_stack_size = parse_usize(ENV_THREAD_STACK_SIZE, &val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
        config.thread_name_prefix = val;
    }
    if let Some(val) = read_env(ENV_SMP_QUEUE_CAPACITY) {
        config.smp_queue_capacity = parse_usize(ENV_SMP_QUEUE_CAPACITY, &val)?;
    }
    if let Some(val) = read_env(ENV_TASK_QUOTA_US) {
        config.reactor.task_quota = Duration::from_micros(parse_u64(ENV_TASK_QUOTA_US, &val)?);
    }
    if let Some(val) = read_env(ENV_IDLE_POLL_TIMEOUT_MS) {
        config.reactor.idle_poll_timeout =
            Duration::from_millis(parse_u64(ENV_IDLE_POLL_TIMEOUT_MS, &val)?);
    }
    if let Some(val) = read_env(ENV_STALL_DETECTION) {
        config.reactor.stall.enabled = parse_bool(ENV_STALL_DETECTION, &val)?;
    }
    if let Some(val) = read_env(ENV_STALL_THRESHOLD_MS) {
        config.reactor.stall.threshold =
            Duration::from_millis(parse_u64(ENV_STALL_THRESHOLD_MS, &val)?);
    }
    Ok(())
}

/// Read an environment variable, returning `None` if unset.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn invalid(var_name: &str, expected: &'static str, val: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var: var_name.to_string(),
        expected,
        value: val.to_string(),
    }
}

fn parse_usize(var_name: &str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| invalid(var_name, "unsigned integer", val))
}

fn parse_u64(var_name: &str, val: &str) -> Result<u64, ConfigError> {
    val.trim()
        .parse::<u64>()
        .map_err(|_| invalid(var_name, "u64", val))
}

fn parse_bool(var_name: &str, val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(var_name, "bool (true/false/1/0/yes/no)", val)),
    }
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable runtime configuration.
///
/// Fields are grouped into TOML tables:
///
/// ```toml
/// [runtime]
/// shards = 4
/// smp_queue_capacity = 256
/// thread_name_prefix = "db-shard"
///
/// [reactor]
/// task_quota_us = 500
/// idle_poll_timeout_ms = 10
/// stall_threshold_ms = 25
///
/// [[scheduling_group]]
/// name = "compaction"
/// shares = 200
///
/// [[io_device]]
/// name = "nvme0"
/// bandwidth = 100000
/// max_in_flight = 64
/// path = "/var/lib/db/data"
/// classes = [{ name = "query", shares = 800 }, { name = "compaction", shares = 200 }]
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct RuntimeTomlConfig {
    /// Runtime-wide settings.
    #[serde(default)]
    pub runtime: RuntimeToml,
    /// Per-shard reactor settings.
    #[serde(default)]
    pub reactor: ReactorToml,
    /// Scheduling groups created on every shard.
    #[serde(default, rename = "scheduling_group")]
    pub scheduling_groups: Vec<GroupToml>,
    /// I/O devices shared by all shards.
    #[serde(default, rename = "io_device")]
    pub io_devices: Vec<IoDeviceToml>,
}

/// Runtime section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct RuntimeToml {
    /// Number of shards.
    pub shards: Option<usize>,
    /// Stack size per shard thread in bytes.
    pub thread_stack_size: Option<usize>,
    /// Name prefix for shard threads.
    pub thread_name_prefix: Option<String>,
    /// Cross-shard queue capacity.
    pub smp_queue_capacity: Option<usize>,
}

/// Reactor section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct ReactorToml {
    /// Task quota in microseconds.
    pub task_quota_us: Option<u64>,
    /// Idle poll timeout in milliseconds.
    pub idle_poll_timeout_ms: Option<u64>,
    /// Shares of the default group.
    pub default_group_shares: Option<u32>,
    /// Stall detector toggle.
    pub stall_detection: Option<bool>,
    /// Stall threshold in milliseconds.
    pub stall_threshold_ms: Option<u64>,
}

/// A `[[scheduling_group]]` entry.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Debug)]
pub struct GroupToml {
    /// Group name.
    pub name: String,
    /// CPU shares.
    pub shares: u32,
}

/// An I/O class inside an `[[io_device]]` entry.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Debug)]
pub struct IoClassToml {
    /// Class name.
    pub name: String,
    /// Relative weight.
    pub shares: u32,
}

/// An `[[io_device]]` entry. A device with a `path` uses the file backend,
/// otherwise an in-memory one.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Debug)]
pub struct IoDeviceToml {
    /// Device name.
    pub name: String,
    /// Cost units per second.
    pub bandwidth: Option<u64>,
    /// Burst in cost units.
    pub burst: Option<u64>,
    /// Requests in flight across all shards.
    pub max_in_flight: Option<usize>,
    /// Per-shard queue depth.
    pub max_queue_depth: Option<usize>,
    /// Catch-up credit of a returning class.
    pub bank_limit: Option<u64>,
    /// Backing file.
    pub path: Option<std::path::PathBuf>,
    /// Memory backend latency in microseconds.
    pub latency_us: Option<u64>,
    /// Priority classes.
    #[serde(default)]
    pub classes: Vec<IoClassToml>,
}

/// Apply a parsed TOML config to a [`RuntimeConfig`].
///
/// Only fields that are `Some` in the TOML struct override the config.
/// Groups and devices are appended.
#[cfg(feature = "config-file")]
pub fn apply_toml_config(config: &mut RuntimeConfig, toml: &RuntimeTomlConfig) {
    use crate::io::{BackendKind, IoClassConfig, IoDeviceConfig};
    use crate::runtime::config::GroupSpec;

    if let Some(v) = toml.runtime.shards {
        config.shards = v;
    }
    if let Some(v) = toml.runtime.thread_stack_size {
        config.thread_stack_size = v;
    }
    if let Some(ref v) = toml.runtime.thread_name_prefix {
        config.thread_name_prefix.clone_from(v);
    }
    if let Some(v) = toml.runtime.smp_queue_capacity {
        config.smp_queue_capacity = v;
    }
    if let Some(v) = toml.reactor.task_quota_us {
        config.reactor.task_quota = Duration::from_micros(v);
    }
    if let Some(v) = toml.reactor.idle_poll_timeout_ms {
        config.reactor.idle_poll_timeout = Duration::from_millis(v);
    }
    if let Some(v) = toml.reactor.default_group_shares {
        config.reactor.default_group_shares = v;
    }
    if let Some(v) = toml.reactor.stall_detection {
        config.reactor.stall.enabled = v;
    }
    if let Some(v) = toml.reactor.stall_threshold_ms {
        config.reactor.stall.threshold = Duration::from_millis(v);
    }
    for group in &toml.scheduling_groups {
        config.reactor.scheduling_groups.push(GroupSpec {
            name: group.name.clone(),
            shares: group.shares,
        });
    }
    for device in &toml.io_devices {
        let mut cfg = IoDeviceConfig::new(device.name.clone());
        if let Some(v) = device.bandwidth {
            cfg.bandwidth = v;
        }
        if let Some(v) = device.burst {
            cfg.burst = v;
        }
        if let Some(v) = device.max_in_flight {
            cfg.max_in_flight = v;
        }
        if let Some(v) = device.max_queue_depth {
            cfg.max_queue_depth = v;
        }
        if let Some(v) = device.bank_limit {
            cfg.bank_limit = v;
        }
        cfg.backend = match (&device.path, device.latency_us) {
            (Some(path), _) => BackendKind::File { path: path.clone() },
            (None, Some(us)) => BackendKind::Memory {
                latency: Duration::from_micros(us),
                per_kib: Duration::ZERO,
            },
            (None, None) => BackendKind::default(),
        };
        if !device.classes.is_empty() {
            cfg.classes = device
                .classes
                .iter()
                .map(|c| IoClassConfig::new(c.name.clone(), c.shares))
                .collect();
        }
        config.io_devices.push(cfg);
    }
}

/// Parse a TOML string into a [`RuntimeTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_str(toml_str: &str) -> Result<RuntimeTomlConfig, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Read and parse a TOML file into a [`RuntimeTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_file(path: &std::path::Path) -> Result<RuntimeTomlConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_toml_str(&content)
}

// =========================================================================
// Tests
// =========================================================================


#[cfg(all(test, feature = "config-file"))]
mod toml_tests {
    use super::*;
    use crate::io::BackendKind;
    use crate::runtime::config::RuntimeConfig;

    #[test]
    fn parse_toml_full_config() {
        let toml_str = r#"
[runtime]
shards = 2
smp_queue_capacity = 64
thread_name_prefix = "db"

[reactor]
task_quota_us = 200
stall_threshold_ms = 50

[[scheduling_group]]
name = "compaction"
shares = 200

[[io_device]]
name = "disk"
bandwidth = 1000
max_in_flight = 8
latency_us = 100
classes = [{ name = "query", shares = 800 }, { name = "compaction", shares = 200 }]
"#;
        let parsed = parse_toml_str(toml_str).unwrap();
        let mut config = RuntimeConfig::default();
        apply_toml_config(&mut config, &parsed);
        assert_eq!(config.shards, 2);
        assert_eq!(config.smp_queue_capacity, 64);
        assert_eq!(config.thread_name_prefix, "db");
        assert_eq!(config.reactor.task_quota, Duration::from_micros(200));
        assert_eq!(config.reactor.scheduling_groups.len(), 1);
        let device = &config.io_devices[0];
        assert_eq!(device.name, "disk");
        assert_eq!(device.bandwidth, 1000);
        assert_eq!(device.max_in_flight, 8);
        assert_eq!(device.classes.len(), 2);
        assert!(matches!(device.backend, BackendKind::Memory { .. }));
    }

    #[test]
    fn parse_toml_empty_config() {
        let parsed = parse_toml_str("").unwrap();
        assert_eq!(parsed.runtime.shards, None);
        assert!(parsed.io_devices.is_empty());
    }

    #[test]
    fn parse_toml_invalid_syntax() {
        let msg = parse_toml_str("not valid toml {{{{").unwrap_err().to_string();
        assert!(msg.contains("TOML"));
    }

    #[test]
    fn toml_file_not_found() {
        let result = parse_toml_file(std::path::Path::new("/nonexistent/config.toml"));
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("failed to read"));
    }

    #[test]
    fn toml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.toml");
        std::fs::write(&path, "[runtime]\nshards = 2\n").unwrap();
        let parsed = parse_toml_file(&path).unwrap();
        let mut config = RuntimeConfig::default();
        apply_toml_config(&mut config, &parsed);
        assert_eq!(config.shards, 2);
    }
}
