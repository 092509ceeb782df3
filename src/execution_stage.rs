//! Batched function-call stages.
//!
//! An [`ExecutionStage`] wraps a function that many continuations call.
//! Instead of each call becoming its own task, calls are queued and a single
//! flush task in the stage's scheduling group runs them back to back. The
//! function's code and data stay hot for the whole batch, and the CPU time
//! is charged to the stage's group rather than to the callers.
//!
//! A flush gives up the shard once the reactor's task quota is used up and
//! reschedules itself for the rest of the queue.
//!
//! # Example
//!
//! ```ignore
//! use percore::execution_stage::ExecutionStage;
//! use percore::runtime;
//!
//! let group = runtime::create_scheduling_group("apply", 200)?;
//! let stage = ExecutionStage::new("apply_mutation", group, |m: Mutation| apply(m));
//! stage.call(mutation).then(|applied| ...)
//! ```

use crate::error::{Error, ErrorKind, Result};
use crate::future::{guarded, Future, Promise};
use crate::runtime::{self, local};
use crate::types::GroupId;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// Counters of one [`ExecutionStage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStageStats {
    /// Calls queued with [`ExecutionStage::call`].
    pub function_calls_enqueued: u64,
    /// Calls the stage function ran for.
    pub function_calls_executed: u64,
    /// Flush tasks scheduled.
    pub tasks_scheduled: u64,
    /// Flush tasks that stopped early because the task quota ran out.
    pub tasks_preempted: u64,
}

type StageFn<A, R> = Box<dyn FnMut(A) -> Future<R>>;

struct StageInner<A: 'static, R: 'static> {
    name: String,
    group: GroupId,
    func: RefCell<StageFn<A, R>>,
    queue: RefCell<VecDeque<(A, Promise<R>)>>,
    flush_pending: Cell<bool>,
    stats: Cell<ExecutionStageStats>,
}

/// A function whose calls run in batches in a fixed scheduling group.
///
/// Clones share the queue.
pub struct ExecutionStage<A: 'static, R: 'static> {
    inner: Rc<StageInner<A, R>>,
}

impl<A: 'static, R: 'static> Clone for ExecutionStage<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<A: 'static, R: 'static> ExecutionStage<A, R> {
    /// Creates a stage running `func` in `group`.
    pub fn new(
        name: impl Into<String>,
        group: GroupId,
        func: impl FnMut(A) -> Future<R> + 'static,
    ) -> Self {
        Self {
            inner: Rc::new(StageInner {
                name: name.into(),
                group,
                func: RefCell::new(Box::new(func)),
                queue: RefCell::new(VecDeque::new()),
                flush_pending: Cell::new(false),
                stats: Cell::new(ExecutionStageStats::default()),
            }),
        }
    }

    /// Creates a stage running in the current scheduling group.
    pub fn in_current_group(
        name: impl Into<String>,
        func: impl FnMut(A) -> Future<R> + 'static,
    ) -> Self {
        Self::new(name, runtime::current_group(), func)
    }

    /// Stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Scheduling group the stage runs in.
    #[must_use]
    pub fn group(&self) -> GroupId {
        self.inner.group
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> ExecutionStageStats {
        self.inner.stats.get()
    }

    /// Calls waiting for the next flush.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    fn update_stats(&self, f: impl FnOnce(&mut ExecutionStageStats)) {
        let mut stats = self.inner.stats.get();
        f(&mut stats);
        self.inner.stats.set(stats);
    }

    /// Queues a call of the stage function with `args`.
    ///
    /// The call runs later, in the stage's group, never inline.
    pub fn call(&self, args: A) -> Future<R> {
        if let Err(err) = self.ensure_flush() {
            return Future::failed(err);
        }
        let mut promise = Promise::new();
        let fut = promise.future();
        self.inner.queue.borrow_mut().push_back((args, promise));
        self.update_stats(|s| s.function_calls_enqueued += 1);
        fut
    }

    fn ensure_flush(&self) -> Result<()> {
        if self.inner.flush_pending.get() {
            return Ok(());
        }
        let core = local::require()?;
        if !core.has_group(self.inner.group) {
            return Err(Error::new(ErrorKind::InvalidGroup).with_message(format!(
                "execution stage {} bound to missing group {}",
                self.inner.name, self.inner.group
            )));
        }
        let stage = self.clone();
        core.schedule(self.inner.group, Box::new(move || stage.flush()));
        self.inner.flush_pending.set(true);
        self.update_stats(|s| s.tasks_scheduled += 1);
        Ok(())
    }

    fn flush(&self) {
        self.inner.flush_pending.set(false);
        let mut ran = 0_u64;
        loop {
            let next = self.inner.queue.borrow_mut().pop_front();
            let Some((args, promise)) = next else {
                break;
            };
            let outcome = {
                let mut func = self.inner.func.borrow_mut();
                guarded(|| (&mut **func)(args)).unwrap_or_else(Future::failed)
            };
            outcome.forward_to(promise);
            ran += 1;
            if runtime::need_preempt() && !self.inner.queue.borrow().is_empty() {
                self.update_stats(|s| s.tasks_preempted += 1);
                if let Err(err) = self.ensure_flush() {
                    tracing::error!(stage = %self.inner.name, error = %err, "cannot reschedule flush");
                    self.fail_queued(&err);
                }
                break;
            }
        }
        self.update_stats(|s| s.function_calls_executed += ran);
        tracing::trace!(stage = %self.inner.name, group = %self.inner.group, ran, "stage flushed");
    }

    fn fail_queued(&self, err: &Error) {
        let drained: Vec<_> = self.inner.queue.borrow_mut().drain(..).collect();
        for (_, promise) in drained {
            promise.set_error(err.clone());
        }
    }
}

impl<A: 'static, R: 'static> fmt::Debug for ExecutionStage<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionStage")
            .field("name", &self.inner.name)
            .field("group", &self.inner.group)
            .field("queued", &self.queued())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::when_all_succeed;
    use crate::test_utils::{init_test_logging, test_reactor};

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn calls_batch_into_one_task() {
        init_test("calls_batch_into_one_task");
        let (reactor, _clock) = test_reactor();
        let out = reactor.block_on(|| {
            let stage = ExecutionStage::in_current_group("double", |x: u32| Future::ready(x * 2));
            let calls = (1..=4).map(|x| stage.call(x)).collect();
            let keep = stage.clone();
            when_all_succeed(calls).map(move |values| (values, keep.stats()))
        });
        let (values, stats) = out.expect("stage ran");
        assert_eq!(values, vec![2, 4, 6, 8]);
        assert_eq!(stats.function_calls_enqueued, 4);
        assert_eq!(stats.function_calls_executed, 4);
        assert_eq!(stats.tasks_scheduled, 1);
        crate::test_complete!("calls_batch_into_one_task");
    }

    #[test]
    fn call_outside_reactor_fails() {
        init_test_logging();
        let stage = ExecutionStage::new("idle", GroupId::DEFAULT, |()| Future::ready(()));
        let mut out = stage.call(());
        assert!(matches!(out.try_take(), Some(Err(_))));
        assert_eq!(stage.queued(), 0);
    }
}
