//! Combinators over continuation-graph futures.
//!
//! Loops (`repeat`, `do_until`, `do_for_each`) hop through the scheduler on
//! every iteration, so long loops never grow the stack and never starve
//! other work on the shard.

use std::cell::RefCell;
use std::rc::Rc;

use super::future::guarded;
use super::{Future, Promise};
use crate::error::Result;
use crate::runtime;

/// Loop control returned by a [`repeat`] body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopIteration {
    /// Run the body again.
    No,
    /// Stop the loop.
    Yes,
}

struct WhenAll<T: 'static> {
    results: Vec<Option<Result<T>>>,
    remaining: usize,
    promise: Option<Promise<Vec<Result<T>>>>,
}

/// Waits for every input and yields every outcome, in input order.
///
/// Never fails itself: errors are reported per slot.
pub fn when_all<T: 'static>(futures: Vec<Future<T>>) -> Future<Vec<Result<T>>> {
    if futures.is_empty() {
        return Future::ready(Vec::new());
    }
    let mut promise = Promise::new();
    let out = promise.future();
    let total = futures.len();
    let shared = Rc::new(RefCell::new(WhenAll {
        results: (0..total).map(|_| None).collect(),
        remaining: total,
        promise: Some(promise),
    }));
    for (index, fut) in futures.into_iter().enumerate() {
        let shared = Rc::clone(&shared);
        fut.set_continuation(move |outcome| {
            let mut all = shared.borrow_mut();
            all.results[index] = Some(outcome);
            all.remaining -= 1;
            if all.remaining == 0 {
                let results: Vec<Result<T>> = all.results.drain(..).flatten().collect();
                let promise = all.promise.take();
                drop(all);
                if let Some(promise) = promise {
                    promise.set_value(results);
                }
            }
        });
    }
    out
}

/// Waits for every input and yields all values, or the error of the
/// lowest-indexed failed input.
///
/// The result is decided only after every input has resolved; later errors
/// are consumed silently.
pub fn when_all_succeed<T: 'static>(futures: Vec<Future<T>>) -> Future<Vec<T>> {
    when_all(futures).then(|results| Future::from_result(results.into_iter().collect()))
}

/// Runs `body` until it yields [`StopIteration::Yes`] or fails.
pub fn repeat<F>(body: F) -> Future<()>
where
    F: FnMut() -> Future<StopIteration> + 'static,
{
    let mut promise = Promise::new();
    let out = promise.future();
    repeat_step(body, promise);
    out
}

fn repeat_step<F>(mut body: F, promise: Promise<()>)
where
    F: FnMut() -> Future<StopIteration> + 'static,
{
    let next = match guarded(|| body()) {
        Ok(next) => next,
        Err(err) => return promise.set_error(err),
    };
    next.set_continuation(move |outcome| match outcome {
        Ok(StopIteration::Yes) => promise.set_value(()),
        Ok(StopIteration::No) => repeat_step(body, promise),
        Err(err) => promise.set_error(err),
    });
}

/// Runs `action` until `stop` returns true. `stop` is checked first.
pub fn do_until<C, A>(mut stop: C, mut action: A) -> Future<()>
where
    C: FnMut() -> bool + 'static,
    A: FnMut() -> Future<()> + 'static,
{
    repeat(move || {
        if stop() {
            return Future::ready(StopIteration::Yes);
        }
        action().map(|()| StopIteration::No)
    })
}

/// Runs `func` on each item sequentially; the first error stops the loop.
pub fn do_for_each<I, F>(items: I, mut func: F) -> Future<()>
where
    I: IntoIterator,
    I::IntoIter: 'static,
    F: FnMut(I::Item) -> Future<()> + 'static,
{
    let mut iter = items.into_iter();
    repeat(move || match iter.next() {
        Some(item) => func(item).map(|()| StopIteration::No),
        None => Future::ready(StopIteration::Yes),
    })
}

/// Starts `func` on every item at once and waits for all of them.
///
/// Fails with the lowest-indexed error once every invocation finished.
pub fn parallel_for_each<I, F>(items: I, mut func: F) -> Future<()>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Future<()>,
{
    let futures = items
        .into_iter()
        .map(|item| guarded(|| func(item)).unwrap_or_else(Future::failed))
        .collect();
    when_all_succeed(futures).discard_result()
}

/// Maps every item in parallel, then folds the values in input order.
pub fn map_reduce<I, M, R, A, F>(items: I, mut mapper: M, initial: A, reducer: F) -> Future<A>
where
    I: IntoIterator,
    M: FnMut(I::Item) -> Future<R>,
    R: 'static,
    A: 'static,
    F: FnMut(A, R) -> A + 'static,
{
    let futures = items
        .into_iter()
        .map(|item| guarded(|| mapper(item)).unwrap_or_else(Future::failed))
        .collect();
    when_all_succeed(futures).map(move |values| values.into_iter().fold(initial, reducer))
}

/// Yields to the scheduler: resolves after the tasks already queued in the
/// current group had a chance to run.
pub fn yield_now() -> Future<()> {
    let mut promise = Promise::new();
    let out = promise.future();
    runtime::schedule(move || promise.set_value(()));
    out
}
