//! Percore: a share-nothing, thread-per-core runtime.
//!
//! # Overview
//!
//! Each shard is one OS thread running one [`Reactor`](runtime::Reactor).
//! Work on a shard is a graph of [`Promise`]/[`Future`] continuations,
//! each scheduled as a task, and tasks run cooperatively: nothing on a
//! shard needs a lock. Shards talk to each other only through bounded
//! message queues.
//!
//! # Core Guarantees
//!
//! - **No inline continuations**: every continuation passes through the task queue
//! - **Weighted CPU**: scheduling groups get CPU time in proportion to their shares
//! - **Fair I/O**: priority classes get device capacity in proportion to their shares
//! - **Orderly shutdown**: gates and exit hooks drain in-flight work before a shard stops
//! - **Contained failures**: a panicking task is reported, never fatal to its shard
//!
//! # Module Structure
//!
//! - [`types`]: Identifiers and the [`Time`] instant
//! - [`error`]: Error types
//! - [`future`]: Promises, futures and combinators
//! - [`runtime`]: Reactors, scheduling groups and the multi-shard runtime
//! - [`smp`]: Cross-shard calls and sharded services
//! - [`io`]: Fair queueing and I/O admission control
//! - [`sync`]: Gate, semaphore, condition variable and cancellation
//! - [`execution_stage`]: Batched function-call stages
//! - [`time`]: Clocks, sleep and timeouts

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod error;
pub mod execution_stage;
pub mod future;
pub mod io;
pub mod runtime;
pub mod smp;
pub mod sync;
pub mod time;
pub mod types;

#[cfg(test)]
pub mod test_utils;

// Re-exports for convenient access to core types
pub use error::{Error, ErrorCategory, ErrorKind, Recoverability, Result, ResultExt};
pub use execution_stage::{ExecutionStage, ExecutionStageStats};
pub use future::{Future, Promise};
pub use runtime::{Reactor, ReactorConfig, Runtime, RuntimeBuilder, RuntimeConfig};
pub use smp::{Distributed, Service, Sharded};
pub use sync::{AbortSource, ConditionVariable, Gate, Semaphore};
pub use types::{ClassId, GroupId, RequestId, ShardId, TaskId, Time};
