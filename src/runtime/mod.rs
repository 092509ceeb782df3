//! Reactors, scheduling groups and the multi-shard runtime.
//!
//! This module contains the core runtime machinery:
//!
//! - [`config`]: Runtime and reactor configuration types
//! - [`builder`]: Runtime builder and the multi-shard [`Runtime`]
//! - [`env_config`]: `PERCORE_*` environment and TOML overrides
//! - [`reactor`]: The per-shard event loop
//! - [`sched_group`]: Weighted scheduling groups
//! - [`timer`]: Timer heap for deadline management
//! - [`stall`]: Stall detection for tasks that hog the shard
//! - [`poller`]: Readiness polling and pluggable poll sources
//!
//! The free functions below operate on the reactor running on the calling
//! thread, the same way continuations do.
//!
//! # Runtime Builder
//!
//! ```ignore
//! use percore::runtime::RuntimeBuilder;
//! use percore::Future;
//!
//! let runtime = RuntimeBuilder::new()
//!     .shards(4)
//!     .scheduling_group("compaction", 200)
//!     .build()?;
//! let total = runtime.block_on(|| Future::ready(42))?;
//! ```
//!
//! ## Config File + Environment Overrides
//!
//! ```ignore
//! use percore::runtime::RuntimeBuilder;
//!
//! // Requires the `config-file` feature.
//! let runtime = RuntimeBuilder::from_toml("config/runtime.toml")?
//!     .with_env_overrides()?
//!     .build()?;
//! ```
//!
//! # Configuration Reference (Defaults + Notes)
//!
//! - `shards`: default = available parallelism (min 1). One thread per shard.
//! - `task_quota`: default = 500 µs. Lower values cut latency between groups.
//! - `idle_poll_timeout`: default = 10 ms. Upper bound on one idle sleep.
//! - `smp_queue_capacity`: default = 128. Messages beyond it wait in a
//!   local overflow buffer of the sender.
//! - `stall_threshold`: default = 25 ms. Tasks running longer are reported.

pub mod builder;
pub mod config;
pub mod env_config;
pub(crate) mod local;
pub mod poller;
pub mod reactor;
pub mod sched_group;
pub mod stall;
pub(crate) mod task;
pub mod timer;

pub use builder::{Runtime, RuntimeBuilder};
pub use config::{GroupSpec, ReactorConfig, RuntimeConfig};
pub use poller::{Interest, PollSource, Readiness, ReadinessToken};
pub use reactor::{Reactor, ReactorState, ReactorStats};
pub use sched_group::{GroupStats, SHARE_SCALE};
pub use stall::{StallConfig, StallHandler, StallReport};
pub use timer::TimerId;

use crate::error::Result;
use crate::future::{Future, Promise};
use crate::types::{GroupId, Time};
use std::rc::Rc;

/// Schedules `func` as a task in the current scheduling group.
///
/// # Panics
///
/// Panics if no reactor is running on this thread.
pub fn schedule(func: impl FnOnce() + 'static) {
    let core = local::expect_current();
    core.schedule(core.current_group(), Box::new(func));
}

/// Schedules `func` as a task in `group`.
///
/// # Panics
///
/// Panics if no reactor is running on this thread.
pub fn schedule_in(group: GroupId, func: impl FnOnce() + 'static) {
    local::expect_current().schedule(group, Box::new(func));
}

/// The scheduling group of the running task.
#[must_use]
pub fn current_group() -> GroupId {
    local::current_group_or_default()
}

/// The shard clock.
///
/// # Panics
///
/// Panics if no reactor is running on this thread.
#[must_use]
pub fn now() -> Time {
    local::now()
}

/// True once the running batch has used up its task quota. Long loops
/// should yield when this returns true.
#[must_use]
pub fn need_preempt() -> bool {
    local::current().is_some_and(|core| core.need_preempt())
}

/// Creates a scheduling group on the current shard.
pub fn create_scheduling_group(name: &str, shares: u32) -> Result<GroupId> {
    local::require()?.create_group(name, shares)
}

/// Destroys a scheduling group on the current shard.
///
/// Fails with [`GroupBusy`](crate::ErrorKind::GroupBusy) while tasks are
/// queued on it, and with [`InvalidGroup`](crate::ErrorKind::InvalidGroup)
/// for the default group or an unknown id.
pub fn destroy_scheduling_group(group: GroupId) -> Result<()> {
    local::require()?.destroy_group(group)
}

/// Changes the shares of a scheduling group.
pub fn set_shares(group: GroupId, shares: u32) -> Result<()> {
    local::require()?.set_shares(group, shares)
}

/// Looks a scheduling group up by name.
#[must_use]
pub fn scheduling_group(name: &str) -> Option<GroupId> {
    local::current().and_then(|core| core.find_group(name))
}

/// Counters of a scheduling group on the current shard.
pub fn group_stats(group: GroupId) -> Result<GroupStats> {
    local::require()?.group_stats(group)
}

/// Counters of the current reactor.
pub fn stats() -> Result<ReactorStats> {
    Ok(local::require()?.stats())
}

/// Runs `func` synchronously with `group` current.
///
/// Work scheduled or attached inside `func` lands in `group`, and the CPU
/// time `func` takes is charged to `group` rather than to the caller.
pub fn run_in_group<R>(group: GroupId, func: impl FnOnce() -> R) -> Result<R> {
    local::require()?.run_in_group(group, func)
}

/// Runs `func` as a new task in `group` and returns its future.
///
/// Always goes through the scheduler, even when `group` is current.
pub fn with_scheduling_group<T: 'static>(
    group: GroupId,
    func: impl FnOnce() -> Future<T> + 'static,
) -> Future<T> {
    let core = match local::require() {
        Ok(core) => core,
        Err(err) => return Future::failed(err),
    };
    if !core.has_group(group) {
        return Future::failed(
            crate::Error::new(crate::ErrorKind::InvalidGroup)
                .with_message(format!("no scheduling group {group}")),
        );
    }
    let mut promise = Promise::new();
    let fut = promise.future();
    core.schedule(
        group,
        Box::new(move || {
            crate::future::guarded(func)
                .unwrap_or_else(Future::failed)
                .forward_to(promise);
        }),
    );
    fut
}

/// Registers a hook that runs when the current reactor shuts down.
///
/// Hooks run in reverse registration order, each after the previous one's
/// future resolved.
///
/// # Panics
///
/// Panics if no reactor is running on this thread.
pub fn at_exit(hook: impl FnOnce() -> Future<()> + 'static) {
    local::expect_current().at_exit(Box::new(hook));
}

/// Asks the current reactor to shut down.
pub fn request_stop() -> Result<()> {
    local::require()?.request_stop();
    Ok(())
}

/// Registers a poll source with the current reactor.
pub fn add_poll_source(source: Rc<dyn PollSource>) -> Result<()> {
    local::require()?.add_source(source);
    Ok(())
}

/// Calls `callback` in the current group whenever `fd` becomes ready for
/// `interest`.
#[cfg(unix)]
pub fn register_readiness(
    fd: std::os::unix::io::RawFd,
    interest: Interest,
    callback: impl FnMut(Readiness) + 'static,
) -> Result<ReadinessToken> {
    let core = local::require()?;
    let group = core.current_group();
    core.poller()
        .register(fd, interest, group, Box::new(callback))
}

/// Removes a readiness registration.
#[cfg(unix)]
pub fn deregister_readiness(token: ReadinessToken) -> Result<()> {
    local::require()?.poller().deregister(token)
}
