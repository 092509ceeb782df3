//! Runtime builder and the multi-shard runtime.
//!
//! A [`Runtime`] runs one reactor per shard, each on its own thread.
//! Shard 0 runs on the thread that calls [`Runtime::block_on`]; the others
//! run on threads named `{thread_name_prefix}-{index}`. Shards share
//! nothing but the cross-shard queues and the I/O devices.

use crate::error::{Error, Result};
use crate::future::Future;
use crate::io::{IoDevice, IoDeviceConfig, IoQueue};
use crate::runtime::config::{GroupSpec, RuntimeConfig};
use crate::runtime::poller::ReadinessPoller;
use crate::runtime::reactor::{Reactor, ReactorStats};
use crate::smp::queue::{shard_at, SmpEndpoint, SmpShared};
use crate::time::{ClockSource, WallClock};
use parking_lot::{Condvar, Mutex};
use polling::Poller;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Builder for constructing a runtime with custom configuration.
#[derive(Clone, Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    /// Create a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder from an existing configuration.
    #[must_use]
    pub fn from_config(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Set the number of shards.
    #[must_use]
    pub fn shards(mut self, n: usize) -> Self {
        self.config.shards = n;
        self
    }

    /// Set the shard thread stack size.
    #[must_use]
    pub fn thread_stack_size(mut self, size: usize) -> Self {
        self.config.thread_stack_size = size;
        self
    }

    /// Set the shard thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    /// Set the capacity of each cross-shard queue.
    #[must_use]
    pub fn smp_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.smp_queue_capacity = capacity;
        self
    }

    /// Set the CPU time a group may run before the reactor re-picks.
    #[must_use]
    pub fn task_quota(mut self, quota: Duration) -> Self {
        self.config.reactor.task_quota = quota;
        self
    }

    /// Set the longest idle sleep.
    #[must_use]
    pub fn idle_poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.reactor.idle_poll_timeout = timeout;
        self
    }

    /// Set the stall threshold.
    #[must_use]
    pub fn stall_threshold(mut self, threshold: Duration) -> Self {
        self.config.reactor.stall.threshold = threshold;
        self
    }

    /// Enable or disable stall detection.
    #[must_use]
    pub fn stall_detection(mut self, enabled: bool) -> Self {
        self.config.reactor.stall.enabled = enabled;
        self
    }

    /// Set the shares of the default scheduling group.
    #[must_use]
    pub fn default_group_shares(mut self, shares: u32) -> Self {
        self.config.reactor.default_group_shares = shares;
        self
    }

    /// Create a scheduling group on every shard at startup.
    #[must_use]
    pub fn scheduling_group(mut self, name: impl Into<String>, shares: u32) -> Self {
        self.config.reactor.scheduling_groups.push(GroupSpec {
            name: name.into(),
            shares,
        });
        self
    }

    /// Add an I/O device shared by all shards.
    #[must_use]
    pub fn io_device(mut self, device: IoDeviceConfig) -> Self {
        self.config.io_devices.push(device);
        self
    }

    /// Register a callback to run when a shard thread starts.
    #[must_use]
    pub fn on_thread_start<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.config.on_thread_start = Some(Arc::new(f));
        self
    }

    /// Register a callback to run when a shard thread stops.
    #[must_use]
    pub fn on_thread_stop<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.config.on_thread_stop = Some(Arc::new(f));
        self
    }

    /// Apply `PERCORE_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        super::env_config::apply_env_overrides(&mut self.config)?;
        Ok(self)
    }

    /// Start from a TOML config file.
    #[cfg(feature = "config-file")]
    pub fn from_toml(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let parsed = super::env_config::parse_toml_file(path.as_ref())?;
        let mut config = RuntimeConfig::default();
        super::env_config::apply_toml_config(&mut config, &parsed);
        Ok(Self { config })
    }

    /// Start from a TOML string.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let parsed = super::env_config::parse_toml_str(toml)?;
        let mut config = RuntimeConfig::default();
        super::env_config::apply_toml_config(&mut config, &parsed);
        Ok(Self { config })
    }

    /// Build a runtime from this configuration.
    pub fn build(self) -> Result<Runtime> {
        Runtime::with_config(self.config)
    }

    /// Single-shard runtime.
    #[must_use]
    pub fn single_shard() -> Self {
        Self::new().shards(1)
    }

    /// Low-latency preset: a shorter quota and idle sleep.
    #[must_use]
    pub fn low_latency() -> Self {
        Self::new()
            .task_quota(Duration::from_micros(100))
            .idle_poll_timeout(Duration::from_millis(1))
    }
}

/// A multi-shard runtime.
///
/// Devices live as long as the runtime, so data written by one
/// [`block_on`](Self::block_on) is visible to the next.
pub struct Runtime {
    config: RuntimeConfig,
    clock: Arc<WallClock>,
    devices: Vec<Arc<IoDevice>>,
    last_stats: Mutex<Vec<ReactorStats>>,
}

#[derive(Default)]
struct Startup {
    ready: usize,
    failure: Option<Error>,
}

struct Latch {
    state: Mutex<Startup>,
    changed: Condvar,
}

impl Latch {
    fn report(&self, outcome: Result<()>) {
        let mut state = self.state.lock();
        match outcome {
            Ok(()) => state.ready += 1,
            Err(err) => {
                state.failure.get_or_insert(err);
            }
        }
        self.changed.notify_all();
    }

    fn wait(&self, expected: usize) -> Result<()> {
        let mut state = self.state.lock();
        while state.ready < expected && state.failure.is_none() {
            self.changed.wait(&mut state);
        }
        match state.failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct ShardPlan {
    config: RuntimeConfig,
    clock: ClockSource,
    shared: Arc<SmpShared>,
    devices: Vec<Arc<IoDevice>>,
}

impl ShardPlan {
    fn build(&self, index: usize) -> Result<Reactor> {
        let shard = shard_at(index);
        let reactor = Reactor::for_shard(
            shard,
            self.config.shards,
            self.config.reactor.clone(),
            self.clock.clone(),
            ReadinessPoller::with_poller(self.shared.waker(index)),
        )?;
        let core = reactor.core();
        core.attach_smp(Rc::new(SmpEndpoint::new(shard, Arc::clone(&self.shared))));
        for device in &self.devices {
            core.add_io_queue(device.name(), IoQueue::new(Arc::clone(device))?);
        }
        tracing::debug!(shard = %shard, devices = self.devices.len(), "shard built");
        Ok(reactor)
    }
}

impl Runtime {
    /// Construct a runtime from the given configuration.
    pub fn with_config(mut config: RuntimeConfig) -> Result<Self> {
        config.normalize();
        let clock = Arc::new(WallClock::new());
        let source = ClockSource::from_wall(Arc::clone(&clock));
        let devices = config
            .io_devices
            .iter()
            .map(|device| IoDevice::new(device.clone(), source.now()))
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(shards = config.shards, devices = devices.len(), "runtime configured");
        Ok(Self {
            config,
            clock,
            devices,
            last_stats: Mutex::new(Vec::new()),
        })
    }

    /// Returns a reference to the runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Number of shards.
    #[must_use]
    pub fn shards(&self) -> usize {
        self.config.shards
    }

    /// The device named `name`.
    #[must_use]
    pub fn device(&self, name: &str) -> Option<&Arc<IoDevice>> {
        self.devices.iter().find(|d| d.name() == name)
    }

    /// Per-shard counters from the last [`block_on`](Self::block_on), in
    /// shard order.
    #[must_use]
    pub fn last_stats(&self) -> Vec<ReactorStats> {
        self.last_stats.lock().clone()
    }

    /// Starts every shard, runs the future built by `make` on shard 0, then
    /// shuts all shards down and returns its outcome.
    ///
    /// Shutdown runs each shard's exit hooks. The call returns once every
    /// shard thread has finished.
    pub fn block_on<T: 'static>(&self, make: impl FnOnce() -> Future<T>) -> Result<T> {
        let shards = self.config.shards;
        let wakers = (0..shards)
            .map(|_| Poller::new().map(Arc::new).map_err(Error::io))
            .collect::<Result<Vec<_>>>()?;
        let plan = Arc::new(ShardPlan {
            config: self.config.clone(),
            clock: ClockSource::from_wall(Arc::clone(&self.clock)),
            shared: Arc::new(SmpShared::new(self.config.smp_queue_capacity, wakers)),
            devices: self.devices.clone(),
        });
        let latch = Arc::new(Latch {
            state: Mutex::new(Startup::default()),
            changed: Condvar::new(),
        });
        let stats = Arc::new(Mutex::new(vec![ReactorStats::default(); shards]));

        let mut threads: Vec<JoinHandle<Result<()>>> = Vec::with_capacity(shards.saturating_sub(1));
        let mut started = Ok(());
        for index in 1..shards {
            match self.spawn_shard(index, &plan, &latch, &stats) {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    started = Err(err);
                    break;
                }
            }
        }
        let started = started.and_then(|()| latch.wait(shards - 1));

        let outcome = started.and_then(|()| {
            if let Some(callback) = self.config.on_thread_start.as_ref() {
                callback();
            }
            let outcome = plan.build(0).and_then(|reactor| {
                let value = reactor.block_on(make);
                plan.shared.request_stop_all();
                let stopped = reactor.run();
                stats.lock()[0] = reactor.stats();
                stopped.and(value)
            });
            if let Some(callback) = self.config.on_thread_stop.as_ref() {
                callback();
            }
            outcome
        });
        // Reach shards that are still starting or were never told to stop.
        plan.shared.request_stop_all();

        let mut joined = Ok(());
        for (offset, handle) in threads.into_iter().enumerate() {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(Error::internal(format!("shard {} panicked", offset + 1))));
            if let Err(err) = result {
                tracing::error!(shard = offset + 1, error = %err, "shard failed");
                joined = joined.and(Err(err));
            }
        }
        *self.last_stats.lock() = stats.lock().clone();
        let value = outcome?;
        joined?;
        Ok(value)
    }

    fn spawn_shard(
        &self,
        index: usize,
        plan: &Arc<ShardPlan>,
        latch: &Arc<Latch>,
        stats: &Arc<Mutex<Vec<ReactorStats>>>,
    ) -> Result<JoinHandle<Result<()>>> {
        let plan = Arc::clone(plan);
        let latch = Arc::clone(latch);
        let stats = Arc::clone(stats);
        let on_start = self.config.on_thread_start.clone();
        let on_stop = self.config.on_thread_stop.clone();
        let mut builder = std::thread::Builder::new()
            .name(format!("{}-{index}", self.config.thread_name_prefix));
        if self.config.thread_stack_size > 0 {
            builder = builder.stack_size(self.config.thread_stack_size);
        }
        builder
            .spawn(move || {
                if let Some(callback) = on_start.as_ref() {
                    callback();
                }
                let reactor = match plan.build(index) {
                    Ok(reactor) => {
                        latch.report(Ok(()));
                        reactor
                    }
                    Err(err) => {
                        latch.report(Err(err.clone()));
                        return Err(err);
                    }
                };
                let outcome = reactor.run();
                stats.lock()[index] = reactor.stats();
                if let Some(callback) = on_stop.as_ref() {
                    callback();
                }
                outcome
            })
            .map_err(Error::io)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}
