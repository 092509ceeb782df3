//! Promise/future continuation graph.
//!
//! A [`Promise`] and its [`Future`] form one edge of a continuation graph.
//! Attaching a function with [`Future::then`] creates the next node; when
//! the promise is resolved the attached function is scheduled as a task on
//! the owning shard, in the scheduling group that was current when it was
//! attached.
//!
//! This is deliberately not `std::future::Future`: there is no polling and
//! no waker. Readiness is pushed, and each continuation runs exactly once.
//!
//! # Invariants
//!
//! - An outcome is delivered at most once.
//! - A continuation never runs inline, even on an available future.
//! - Dropping an unresolved promise yields a broken-promise error.
//! - Dropping an available future that holds an error logs a warning.
//! - A panic inside a continuation becomes an
//!   [`ErrorKind::Panicked`](crate::error::ErrorKind::Panicked) error on the
//!   downstream future.

pub mod combinator;
mod future;
mod promise;
mod state;

pub use combinator::{
    do_for_each, do_until, map_reduce, parallel_for_each, repeat, when_all, when_all_succeed,
    yield_now, StopIteration,
};
pub use future::Future;
pub(crate) use future::guarded;
pub use promise::Promise;
