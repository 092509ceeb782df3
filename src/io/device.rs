//! Device description and the capacity shared by every shard.

use crate::error::{Error, Result};
use crate::io::backend::{IoBackend, IoOp, LatencyModel, MemoryBackend, SharedStorage};
use crate::io::fair_queue::FairGroup;
use crate::io::token_bucket::SharedTokenBucket;
use crate::types::Time;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Which backend executes a device's requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// In-memory storage with a latency model.
    Memory {
        /// Fixed latency per request.
        latency: Duration,
        /// Extra latency per KiB.
        per_kib: Duration,
    },
    /// A regular file accessed with positional I/O.
    File {
        /// File path; created if missing.
        path: PathBuf,
    },
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Memory {
            latency: Duration::ZERO,
            per_kib: Duration::ZERO,
        }
    }
}

/// A priority class created on every shard's queue for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoClassConfig {
    /// Class name.
    pub name: String,
    /// Relative weight.
    pub shares: u32,
}

impl IoClassConfig {
    /// Creates a class description.
    #[must_use]
    pub fn new(name: impl Into<String>, shares: u32) -> Self {
        Self {
            name: name.into(),
            shares,
        }
    }
}

/// Configuration of one I/O device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoDeviceConfig {
    /// Device name used to look its queue up.
    pub name: String,
    /// Cost units per second; zero means unlimited.
    pub bandwidth: u64,
    /// Largest burst in cost units.
    pub burst: u64,
    /// Smallest replenish step in cost units.
    pub replenish_threshold: u64,
    /// Requests in flight across all shards; zero means unlimited.
    pub max_in_flight: usize,
    /// Requests waiting in one shard's queue before submissions fail.
    pub max_queue_depth: usize,
    /// Catch-up credit, in cost units, of a class returning from idle.
    pub bank_limit: u64,
    /// Cost of a request regardless of size.
    pub request_cost: u64,
    /// Bytes per additional cost unit.
    pub bytes_per_cost_unit: u64,
    /// Backend selection.
    pub backend: BackendKind,
    /// Classes registered on every shard.
    pub classes: Vec<IoClassConfig>,
}

impl IoDeviceConfig {
    /// An unlimited in-memory device with a single `default` class.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Fixes up inconsistent values.
    pub fn normalize(&mut self) {
        if self.bandwidth > 0 && self.burst == 0 {
            self.burst = (self.bandwidth / 10).max(1);
        }
        if self.replenish_threshold == 0 {
            self.replenish_threshold = 1;
        }
        if self.burst > 0 && self.replenish_threshold > self.burst {
            self.replenish_threshold = self.burst;
        }
        if self.max_queue_depth == 0 {
            self.max_queue_depth = 1;
        }
        if self.bytes_per_cost_unit == 0 {
            self.bytes_per_cost_unit = 1;
        }
        if self.classes.is_empty() {
            self.classes.push(IoClassConfig::new("default", 100));
        }
        for class in &mut self.classes {
            if class.shares == 0 {
                class.shares = 1;
            }
        }
    }

    /// Cost of `op` under this device's cost model.
    #[must_use]
    pub fn cost_of(&self, op: &IoOp) -> u64 {
        let bytes = u64::try_from(op.len()).unwrap_or(u64::MAX);
        self.request_cost
            .saturating_add(bytes / self.bytes_per_cost_unit.max(1))
            .max(1)
    }
}

impl Default for IoDeviceConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            bandwidth: 0,
            burst: 0,
            replenish_threshold: 1,
            max_in_flight: 0,
            max_queue_depth: 1024,
            bank_limit: 0,
            request_cost: 1,
            bytes_per_cost_unit: 4096,
            backend: BackendKind::default(),
            classes: vec![IoClassConfig::new("default", 100)],
        }
    }
}

/// A device shared by all shards: its configuration, capacity and storage.
#[derive(Debug)]
pub struct IoDevice {
    config: IoDeviceConfig,
    group: Arc<FairGroup>,
    storage: SharedStorage,
}

impl IoDevice {
    /// Builds a device whose bandwidth bucket starts full at `now`.
    pub fn new(mut config: IoDeviceConfig, now: Time) -> Result<Arc<Self>> {
        config.normalize();
        if config.name.is_empty() {
            return Err(Error::config("I/O device name must not be empty"));
        }
        let bucket = (config.bandwidth > 0).then(|| {
            SharedTokenBucket::new(
                config.bandwidth,
                config.burst,
                config.replenish_threshold,
                now,
            )
        });
        let group = Arc::new(FairGroup::new(
            config.name.clone(),
            bucket,
            config.max_in_flight,
        ));
        tracing::debug!(
            device = %config.name,
            bandwidth = config.bandwidth,
            max_in_flight = config.max_in_flight,
            "I/O device created"
        );
        Ok(Arc::new(Self {
            config,
            group,
            storage: SharedStorage::default(),
        }))
    }

    /// Device name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Normalized configuration.
    #[must_use]
    pub fn config(&self) -> &IoDeviceConfig {
        &self.config
    }

    /// Capacity shared by every shard.
    #[must_use]
    pub fn group(&self) -> &Arc<FairGroup> {
        &self.group
    }

    /// Storage of the in-memory backend.
    #[must_use]
    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    /// Opens a backend instance for one shard.
    pub fn open_backend(&self) -> Result<Box<dyn IoBackend>> {
        match &self.config.backend {
            BackendKind::Memory { latency, per_kib } => Ok(Box::new(MemoryBackend::new(
                Arc::clone(&self.storage),
                LatencyModel {
                    base: *latency,
                    per_kib: *per_kib,
                },
            ))),
            #[cfg(unix)]
            BackendKind::File { path } => {
                let backend = crate::io::backend::FileBackend::open(path).map_err(|err| {
                    Error::io(err).with_message(format!("open {}", path.display()))
                })?;
                Ok(Box::new(backend))
            }
            #[cfg(not(unix))]
            BackendKind::File { .. } => Err(Error::config(
                "file backend is only available on unix",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_fills_gaps() {
        let mut config = IoDeviceConfig {
            bandwidth: 1000,
            burst: 0,
            replenish_threshold: 500,
            max_queue_depth: 0,
            bytes_per_cost_unit: 0,
            classes: Vec::new(),
            ..IoDeviceConfig::default()
        };
        config.normalize();
        assert_eq!(config.burst, 100);
        assert_eq!(config.replenish_threshold, 100);
        assert_eq!(config.max_queue_depth, 1);
        assert_eq!(config.bytes_per_cost_unit, 1);
        assert_eq!(config.classes, vec![IoClassConfig::new("default", 100)]);
    }

    #[test]
    fn cost_model() {
        let config = IoDeviceConfig {
            request_cost: 2,
            bytes_per_cost_unit: 512,
            ..IoDeviceConfig::default()
        };
        assert_eq!(config.cost_of(&IoOp::Flush), 2);
        assert_eq!(config.cost_of(&IoOp::Read { pos: 0, len: 4096 }), 10);
    }

    #[test]
    fn unlimited_device_has_no_bucket() {
        let device = IoDevice::new(IoDeviceConfig::new("nvme0"), Time::ZERO).expect("device");
        assert!(device.group().bucket().is_none());
        assert_eq!(device.name(), "nvme0");
    }
}
