//! Cross-shard calls.
//!
//! Shards share nothing; the only way to touch another shard's state is to
//! send it a closure with [`submit_to`]. The closure runs as a task on the
//! destination shard and its result travels back as a reply message that
//! resolves the caller's future on the calling shard.
//!
//! A standalone [`Reactor`](crate::runtime::Reactor) is shard 0 of 1.
//!
//! ```ignore
//! use percore::smp::{self, submit_to};
//! use percore::types::ShardId;
//!
//! let doubled = submit_to(ShardId::new(1), || Future::ready(21 * 2));
//! ```

pub(crate) mod queue;
pub mod sharded;

pub use sharded::{Distributed, Service, Sharded};

use crate::error::{Error, ErrorKind, Result};
use crate::future::{guarded, when_all_succeed, Future, Promise};
use crate::runtime::{self, local};
use crate::types::ShardId;
use queue::{shard_at, Admission, SmpMessage};
use std::sync::Arc;

/// Number of shards in the running runtime.
///
/// Outside any reactor this is 1.
#[must_use]
pub fn shard_count() -> usize {
    local::current().map_or(1, |core| core.shard_count())
}

/// The shard of the calling thread.
#[must_use]
pub fn this_shard_id() -> ShardId {
    local::current().map_or(ShardId::new(0), |core| core.shard())
}

/// Iterates over every shard id.
pub fn all_shards() -> impl Iterator<Item = ShardId> {
    (0..shard_count()).map(shard_at)
}

/// Runs `func` on shard `dst` and resolves with its result on this shard.
///
/// Submitting to the calling shard still goes through the scheduler. A
/// destination that is shutting down refuses the call with
/// [`ErrorKind::ShardShutdown`]. Messages between one pair of shards are
/// delivered in submission order.
pub fn submit_to<T, F>(dst: ShardId, func: F) -> Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> Future<T> + Send + 'static,
{
    let core = match local::require() {
        Ok(core) => core,
        Err(err) => return Future::failed(err),
    };
    if dst.index() >= core.shard_count() {
        return Future::failed(Error::invalid_state(format!(
            "shard {dst} out of range 0..{}",
            core.shard_count()
        )));
    }
    if dst == core.shard() {
        return runtime::with_scheduling_group(core.current_group(), func);
    }
    let Some(endpoint) = core.smp() else {
        return Future::failed(Error::invalid_state("reactor is not part of a runtime"));
    };
    let mut promise = Promise::new();
    let fut = promise.future();
    let id = endpoint.expect_reply(promise);
    let src = core.shard();
    tracing::trace!(src = %src, dst = %dst, reply = id, "cross-shard call");
    endpoint.send(
        dst,
        SmpMessage::request(move |admission| match admission {
            Admission::Accepted => guarded(func)
                .unwrap_or_else(Future::failed)
                .set_continuation(move |outcome| reply::<T>(src, id, outcome)),
            Admission::Rejected => reply::<T>(src, id, Err(shard_shutdown(dst))),
        }),
    );
    fut
}

/// Runs `func` on every shard, including this one, and resolves once all
/// copies finished. The first failing shard, by index, decides the error.
pub fn invoke_on_all<F>(func: F) -> Future<()>
where
    F: Fn() -> Future<()> + Send + Sync + 'static,
{
    let func = Arc::new(func);
    let calls = all_shards()
        .map(|shard| {
            let func = Arc::clone(&func);
            submit_to(shard, move || func())
        })
        .collect();
    when_all_succeed(calls).discard_result()
}

/// Like [`invoke_on_all`], but skips the calling shard.
pub fn invoke_on_others<F>(func: F) -> Future<()>
where
    F: Fn() -> Future<()> + Send + Sync + 'static,
{
    let me = this_shard_id();
    let func = Arc::new(func);
    let calls = all_shards()
        .filter(|shard| *shard != me)
        .map(|shard| {
            let func = Arc::clone(&func);
            submit_to(shard, move || func())
        })
        .collect();
    when_all_succeed(calls).discard_result()
}

fn shard_shutdown(shard: ShardId) -> Error {
    Error::new(ErrorKind::ShardShutdown).with_message(format!("shard {shard} is shutting down"))
}

fn reply<T: Send + 'static>(src: ShardId, id: u64, outcome: Result<T>) {
    let Some(endpoint) = local::current().and_then(|core| core.smp()) else {
        tracing::error!(src = %src, reply = id, "cross-shard reply outside a runtime shard");
        return;
    };
    endpoint.send(
        src,
        SmpMessage::reply(move |_| complete::<T>(id, outcome)),
    );
}

fn complete<T: 'static>(id: u64, outcome: Result<T>) {
    let promise = local::current()
        .and_then(|core| core.smp())
        .and_then(|endpoint| endpoint.take_reply::<T>(id));
    match promise {
        Some(promise) => promise.set_result(outcome),
        None => tracing::warn!(reply = id, "reply for an unknown cross-shard call"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, test_reactor};

    #[test]
    fn standalone_reactor_is_single_shard() {
        init_test_logging();
        crate::test_phase!("standalone_reactor_is_single_shard");
        let (reactor, _clock) = test_reactor();
        let out = reactor
            .block_on(|| {
                let seen = (shard_count(), this_shard_id());
                submit_to(ShardId::new(0), move || Future::ready(seen))
            })
            .expect("local submit");
        assert_eq!(out, (1, ShardId::new(0)));
        crate::test_complete!("standalone_reactor_is_single_shard");
    }

    #[test]
    fn out_of_range_shard_is_rejected() {
        init_test_logging();
        let (reactor, _clock) = test_reactor();
        let err = reactor
            .block_on(|| submit_to(ShardId::new(3), || Future::ready(())))
            .expect_err("no such shard");
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn invoke_on_all_runs_locally_when_alone() {
        init_test_logging();
        let (reactor, _clock) = test_reactor();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        reactor
            .block_on(move || {
                invoke_on_all(move || {
                    hits2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Future::ready(())
                })
            })
            .expect("invoke");
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
