//! Runtime configuration types.
//!
//! These types hold the concrete values that drive runtime behavior. In most
//! cases you should use [`RuntimeBuilder`](super::builder::RuntimeBuilder) to
//! construct a runtime rather than creating a [`RuntimeConfig`] directly.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `shards` | available CPU parallelism |
//! | `thread_stack_size` | 2 MiB |
//! | `thread_name_prefix` | `"percore-shard"` |
//! | `smp_queue_capacity` | 128 |
//! | `reactor.task_quota` | 500 µs |
//! | `reactor.max_tasks_per_batch` | 512 |
//! | `reactor.idle_poll_timeout` | 10 ms |
//! | `reactor.default_group_shares` | 1000 |
//! | `reactor.max_scheduling_groups` | 64 |
//! | `reactor.stall.threshold` | 25 ms |

use crate::io::IoDeviceConfig;
use crate::runtime::stall::{StallConfig, StallHandler};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A scheduling group created on every shard at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    /// Group name; look it up with [`scheduling_group`](crate::runtime::scheduling_group).
    pub name: String,
    /// CPU shares.
    pub shares: u32,
}

/// Per-shard reactor configuration.
#[derive(Clone)]
pub struct ReactorConfig {
    /// CPU time a group may run before the reactor polls and re-picks.
    pub task_quota: Duration,
    /// Upper bound on tasks per batch, for clocks that do not advance
    /// while tasks run.
    pub max_tasks_per_batch: usize,
    /// Longest idle sleep before the reactor re-checks its sources.
    pub idle_poll_timeout: Duration,
    /// Shares of the default group.
    pub default_group_shares: u32,
    /// Maximum number of live scheduling groups, default included.
    pub max_scheduling_groups: usize,
    /// Groups created at startup, in order.
    pub scheduling_groups: Vec<GroupSpec>,
    /// Stall detection settings.
    pub stall: StallConfig,
    /// Called for every reported stall.
    pub stall_handler: Option<StallHandler>,
}

impl ReactorConfig {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.task_quota.is_zero() {
            self.task_quota = Duration::from_micros(500);
        }
        if self.max_tasks_per_batch == 0 {
            self.max_tasks_per_batch = 1;
        }
        if self.idle_poll_timeout.is_zero() {
            self.idle_poll_timeout = Duration::from_millis(1);
        }
        if self.default_group_shares == 0 {
            self.default_group_shares = 1000;
        }
        let needed = self.scheduling_groups.len() + 1;
        if self.max_scheduling_groups < needed {
            self.max_scheduling_groups = needed;
        }
        for group in &mut self.scheduling_groups {
            if group.shares == 0 {
                group.shares = 1;
            }
        }
    }
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            task_quota: Duration::from_micros(500),
            max_tasks_per_batch: 512,
            idle_poll_timeout: Duration::from_millis(10),
            default_group_shares: 1000,
            max_scheduling_groups: 64,
            scheduling_groups: Vec::new(),
            stall: StallConfig::default(),
            stall_handler: None,
        }
    }
}

impl fmt::Debug for ReactorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorConfig")
            .field("task_quota", &self.task_quota)
            .field("max_tasks_per_batch", &self.max_tasks_per_batch)
            .field("idle_poll_timeout", &self.idle_poll_timeout)
            .field("default_group_shares", &self.default_group_shares)
            .field("max_scheduling_groups", &self.max_scheduling_groups)
            .field("scheduling_groups", &self.scheduling_groups)
            .field("stall", &self.stall)
            .field("stall_handler", &self.stall_handler.is_some())
            .finish()
    }
}

/// Runtime configuration.
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Number of shards (default: available parallelism).
    pub shards: usize,
    /// Stack size per shard thread (default: 2MB).
    pub thread_stack_size: usize,
    /// Name prefix for shard threads.
    pub thread_name_prefix: String,
    /// Capacity of each cross-shard queue before messages spill locally.
    pub smp_queue_capacity: usize,
    /// Per-shard reactor settings.
    pub reactor: ReactorConfig,
    /// I/O devices shared by all shards.
    pub io_devices: Vec<IoDeviceConfig>,
    /// Callback executed when a shard thread starts.
    pub on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Callback executed when a shard thread stops.
    pub on_thread_stop: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl RuntimeConfig {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.shards == 0 {
            self.shards = 1;
        }
        if self.thread_stack_size == 0 {
            self.thread_stack_size = 2 * 1024 * 1024;
        }
        if self.smp_queue_capacity == 0 {
            self.smp_queue_capacity = 1;
        }
        if self.thread_name_prefix.is_empty() {
            self.thread_name_prefix = "percore-shard".to_string();
        }
        self.reactor.normalize();
        for device in &mut self.io_devices {
            device.normalize();
        }
    }

    pub(crate) fn default_shards() -> usize {
        std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .max(1)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shards: Self::default_shards(),
            thread_stack_size: 2 * 1024 * 1024,
            thread_name_prefix: "percore-shard".to_string(),
            smp_queue_capacity: 128,
            reactor: ReactorConfig::default(),
            io_devices: Vec::new(),
            on_thread_start: None,
            on_thread_stop: None,
        }
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("shards", &self.shards)
            .field("thread_stack_size", &self.thread_stack_size)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("smp_queue_capacity", &self.smp_queue_capacity)
            .field("reactor", &self.reactor)
            .field("io_devices", &self.io_devices)
            .finish_non_exhaustive()
    }
}
