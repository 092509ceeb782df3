//! Core types for the runtime.
//!
//! - [`id`]: Identifier types (`ShardId`, `GroupId`, `ClassId`, `RequestId`,
//!   `TaskId`) and the [`Time`] instant

pub mod id;

pub use id::{ClassId, GroupId, RequestId, ShardId, TaskId, Time};
