//! Condition variable for shard-local continuations.

use crate::error::{Error, ErrorKind, Result};
use crate::future::{repeat, Future, Promise, StopIteration};
use crate::sync::expiring_fifo::{ExpiringFifo, Expiry};
use crate::types::Time;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

struct Inner {
    broken: RefCell<Option<Error>>,
    waiters: ExpiringFifo<Promise<()>>,
}

/// Wakes waiting continuations when some shard-local condition may have
/// changed.
///
/// There are no spurious wakeups, but a waiter must still re-check its
/// condition: another continuation may run between the signal and the
/// waiter. [`wait_for_predicate`](Self::wait_for_predicate) does that loop.
#[derive(Clone)]
pub struct ConditionVariable {
    inner: Rc<Inner>,
}

impl ConditionVariable {
    /// Creates a condition variable with no waiters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                broken: RefCell::new(None),
                waiters: ExpiringFifo::new(|promise: Promise<()>, reason| {
                    promise.set_error(match reason {
                        Expiry::Timeout => Error::timeout("condition variable wait timed out"),
                        Expiry::Aborted => Error::aborted("condition variable wait aborted"),
                    });
                }),
            }),
        }
    }

    fn check_broken(&self) -> Result<()> {
        match &*self.inner.broken.borrow() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Waits for the next [`signal`](Self::signal) or
    /// [`broadcast`](Self::broadcast).
    pub fn wait(&self) -> Future<()> {
        self.wait_until(Time::MAX)
    }

    /// Like [`wait`](Self::wait), but fails with a timeout error at
    /// `deadline`.
    pub fn wait_until(&self, deadline: Time) -> Future<()> {
        if let Err(err) = self.check_broken() {
            return Future::failed(err);
        }
        let mut promise = Promise::new();
        let fut = promise.future();
        match self.inner.waiters.push_back_until(promise, deadline) {
            Ok(_) => fut,
            Err(err) => Future::failed(err),
        }
    }

    /// Waits until `pred` returns true. Checks it first, then after every
    /// wakeup.
    pub fn wait_for_predicate(&self, pred: impl FnMut() -> bool + 'static) -> Future<()> {
        self.wait_for_predicate_until(Time::MAX, pred)
    }

    /// Like [`wait_for_predicate`](Self::wait_for_predicate) with a
    /// deadline on the whole wait.
    pub fn wait_for_predicate_until(
        &self,
        deadline: Time,
        mut pred: impl FnMut() -> bool + 'static,
    ) -> Future<()> {
        let cv = self.clone();
        repeat(move || {
            if pred() {
                return Future::ready(StopIteration::Yes);
            }
            cv.wait_until(deadline).map(|()| StopIteration::No)
        })
    }

    /// Wakes the oldest waiter.
    pub fn signal(&self) {
        if let Some(promise) = self.inner.waiters.pop_front() {
            promise.set_value(());
        }
    }

    /// Wakes every waiter.
    pub fn broadcast(&self) {
        for promise in self.inner.waiters.drain() {
            promise.set_value(());
        }
    }

    /// Fails every current and future waiter with `err`.
    pub fn broken(&self, err: Error) {
        *self.inner.broken.borrow_mut() = Some(err.clone());
        for promise in self.inner.waiters.drain() {
            promise.set_error(err.clone());
        }
    }

    /// Fails every waiter with a [`Broken`](ErrorKind::Broken) error.
    pub fn break_waiters(&self) {
        self.broken(Error::new(ErrorKind::Broken).with_message("condition variable broken"));
    }

    /// Number of waiters.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.inner.waiters.len()
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("waiters", &self.waiters())
            .field("broken", &self.inner.broken.borrow().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;
    use crate::test_utils::{init_test_logging, test_reactor};
    use crate::time::sleep;
    use std::cell::Cell;
    use std::time::Duration;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn signal_wakes_in_order() {
        init_test("signal_wakes_in_order");
        let (reactor, _clock) = test_reactor();
        let order = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&order);
        let out = reactor.block_on(move || {
            let cv = ConditionVariable::new();
            let first = {
                let seen = Rc::clone(&seen);
                cv.wait().map(move |()| seen.borrow_mut().push(1))
            };
            let second = {
                let seen = Rc::clone(&seen);
                cv.wait().map(move |()| seen.borrow_mut().push(2))
            };
            cv.signal();
            cv.signal();
            first.then(move |()| second)
        });
        assert!(out.is_ok());
        assert_eq!(*order.borrow(), vec![1, 2]);
        crate::test_complete!("signal_wakes_in_order");
    }

    #[test]
    fn predicate_wait_rechecks() {
        init_test("predicate_wait_rechecks");
        let (reactor, _clock) = test_reactor();
        let out = reactor.block_on(|| {
            let cv = ConditionVariable::new();
            let value = Rc::new(Cell::new(0_u32));
            let probe = Rc::clone(&value);
            let waiting = cv.wait_for_predicate(move || probe.get() >= 3);
            let producer_cv = cv.clone();
            let producer_value = Rc::clone(&value);
            runtime::schedule(move || {
                crate::future::do_for_each(0..3, move |_| {
                    producer_value.set(producer_value.get() + 1);
                    producer_cv.broadcast();
                    sleep(Duration::from_millis(1))
                })
                .ignore();
            });
            waiting.map(move |()| value.get())
        });
        assert_eq!(out.ok(), Some(3));
        crate::test_complete!("predicate_wait_rechecks");
    }

    #[test]
    fn wait_until_times_out() {
        init_test("wait_until_times_out");
        let (reactor, _clock) = test_reactor();
        let out = reactor.block_on(|| {
            let cv = ConditionVariable::new();
            cv.wait_until(Time::from_millis(5)).finally(move || {
                drop(cv);
                Future::ready(())
            })
        });
        crate::assert_err_kind!(out, ErrorKind::Timeout);
        crate::test_complete!("wait_until_times_out");
    }

    #[test]
    fn dropping_condvar_breaks_its_waiters() {
        init_test("dropping_condvar_breaks_its_waiters");
        let (reactor, _clock) = test_reactor();
        let kinds = reactor
            .block_on(|| {
                let cv = ConditionVariable::new();
                let first = cv.wait().then_wrapped(|r| Future::ready(r.err().map(|e| e.kind())));
                let timed = cv
                    .wait_until(Time::from_millis(50))
                    .then_wrapped(|r| Future::ready(r.err().map(|e| e.kind())));
                assert_eq!(cv.waiters(), 2);
                drop(cv);
                first.then(move |a| timed.map(move |b| (a, b)))
            })
            .expect("block_on");
        assert_eq!(
            kinds,
            (Some(ErrorKind::BrokenPromise), Some(ErrorKind::BrokenPromise))
        );
        crate::test_complete!("dropping_condvar_breaks_its_waiters");
    }
}
