//! I/O admission control.
//!
//! Application I/O goes through an [`IoQueue`], one per device per shard.
//! The queue orders requests by priority class with a [`FairQueue`] and
//! releases them to the [`IoBackend`] only while the device, described by
//! an [`IoDevice`] shared by all shards, has bandwidth and concurrency to
//! spare.
//!
//! - [`token_bucket`]: lock-free bandwidth accounting shared across shards
//! - [`fair_queue`]: share-proportional ordering of priority classes
//! - [`device`]: device configuration and shared capacity
//! - [`backend`]: the backend interface plus memory and file backends
//! - [`io_queue`]: the per-shard queue and reactor poll source
//!
//! # Example
//!
//! ```ignore
//! use percore::io::{self, IoRequest};
//!
//! let queue = io::queue("nvme0")?;
//! let class = queue.find_class("compaction").expect("configured class");
//! queue
//!     .submit(class, IoRequest::write(0, block))
//!     .map(|done| done.bytes)
//! ```

pub mod backend;
pub mod device;
pub mod fair_queue;
pub mod io_queue;
pub mod token_bucket;

pub use backend::{
    BackendCompletion, BackendRequest, IoBackend, IoCompletion, IoOp, LatencyModel, MemoryBackend,
    SharedStorage,
};
#[cfg(unix)]
pub use backend::FileBackend;
pub use device::{BackendKind, IoClassConfig, IoDevice, IoDeviceConfig};
pub use fair_queue::{ClassStats, FairGroup, FairQueue, FAIR_SCALE};
pub use io_queue::{IoQueue, IoQueueStats, IoRequest};
pub use token_bucket::SharedTokenBucket;

use crate::error::{Error, ErrorKind, Result};
use crate::runtime::local;

/// The queue of device `name` on the current shard.
pub fn queue(name: &str) -> Result<IoQueue> {
    local::require()?.io_queue(name).ok_or_else(|| {
        Error::new(ErrorKind::InvalidState).with_message(format!("no I/O device named {name}"))
    })
}

/// Registers `queue` with the current reactor, under its device name, and
/// starts polling it.
pub fn attach(queue: IoQueue) -> Result<()> {
    let core = local::require()?;
    let name = queue.device().name().to_string();
    if core.io_queue(&name).is_some() {
        return Err(Error::invalid_state(format!(
            "I/O device {name} already attached"
        )));
    }
    core.add_io_queue(&name, queue);
    Ok(())
}
