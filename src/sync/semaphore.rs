//! Counting semaphore with strictly FIFO waiters.
//!
//! A waiter is served only once every waiter ahead of it was served, even
//! when its own request would fit right away. Waiters may carry a deadline
//! or an [`AbortSource`]; one that leaves early is removed without
//! disturbing the others, and whoever queued behind it is re-examined.
//!
//! # Example
//!
//! ```ignore
//! use percore::sync::{with_semaphore, Semaphore};
//!
//! let limit = Semaphore::new(4);
//! with_semaphore(&limit, 1, || expensive_call());
//! ```

use crate::error::{Error, ErrorKind, Result};
use crate::future::{guarded, Future, Promise};
use crate::sync::abort::AbortSource;
use crate::sync::expiring_fifo::{ExpiringFifo, Expiry};
use crate::types::Time;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

struct Waiter {
    units: usize,
    promise: Promise<()>,
}

struct Inner {
    count: Cell<isize>,
    broken: RefCell<Option<Error>>,
    waiters: ExpiringFifo<Waiter>,
}

/// An asynchronous counting semaphore. Clones share the count.
#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<Inner>,
}

fn to_isize(units: usize) -> isize {
    isize::try_from(units).unwrap_or(isize::MAX)
}

impl Semaphore {
    /// Creates a semaphore holding `units`.
    #[must_use]
    pub fn new(units: usize) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            Inner {
                count: Cell::new(to_isize(units)),
                broken: RefCell::new(None),
                waiters: ExpiringFifo::new(move |waiter: Waiter, reason| {
                    let err = match reason {
                        Expiry::Timeout => Error::timeout("semaphore wait timed out"),
                        Expiry::Aborted => Error::aborted("semaphore wait aborted"),
                    };
                    waiter.promise.set_error(err);
                    if let Some(inner) = weak.upgrade() {
                        Semaphore { inner }.wake();
                    }
                }),
            }
        });
        Self { inner }
    }

    /// Units available right now. Negative after [`consume`](Self::consume)
    /// took more than there was.
    #[must_use]
    pub fn available_units(&self) -> isize {
        self.inner.count.get()
    }

    /// Number of queued waiters.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.inner.waiters.len()
    }

    fn check_broken(&self) -> Result<()> {
        match &*self.inner.broken.borrow() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn may_proceed(&self, units: usize) -> bool {
        self.inner.waiters.is_empty() && self.inner.count.get() >= to_isize(units)
    }

    /// Takes `units` without waiting if nobody queues ahead and they are
    /// available.
    pub fn try_wait(&self, units: usize) -> bool {
        if self.check_broken().is_err() || !self.may_proceed(units) {
            return false;
        }
        self.inner.count.set(self.inner.count.get() - to_isize(units));
        true
    }

    /// Waits for `units`.
    pub fn wait(&self, units: usize) -> Future<()> {
        self.wait_until(units, Time::MAX)
    }

    /// Waits for `units`, failing with a timeout error at `deadline`.
    pub fn wait_until(&self, units: usize, deadline: Time) -> Future<()> {
        if let Err(err) = self.check_broken() {
            return Future::failed(err);
        }
        if self.try_wait(units) {
            return Future::ready(());
        }
        let mut promise = Promise::new();
        let fut = promise.future();
        if let Err(err) = self.inner.waiters.push_back_until(Waiter { units, promise }, deadline) {
            return Future::failed(err);
        }
        fut
    }

    /// Waits for `units`, failing with an aborted error once `abort` fires.
    pub fn wait_abortable(&self, units: usize, abort: &AbortSource) -> Future<()> {
        if let Err(err) = self.check_broken() {
            return Future::failed(err);
        }
        if let Err(err) = abort.check() {
            return Future::failed(err);
        }
        if self.try_wait(units) {
            return Future::ready(());
        }
        let mut promise = Promise::new();
        let fut = promise.future();
        if let Err(waiter) = self.inner.waiters.push_back_abortable(Waiter { units, promise }, abort) {
            waiter
                .promise
                .set_error(Error::aborted("semaphore wait aborted"));
        }
        fut
    }

    /// Returns `units` and wakes waiters in arrival order.
    pub fn signal(&self, units: usize) {
        if self.check_broken().is_err() {
            return;
        }
        self.inner.count.set(self.inner.count.get().saturating_add(to_isize(units)));
        self.wake();
    }

    /// Takes `units` without waiting; the count may go negative.
    pub fn consume(&self, units: usize) {
        if self.check_broken().is_err() {
            return;
        }
        self.inner.count.set(self.inner.count.get() - to_isize(units));
    }

    /// Fails every current and future waiter with `err`.
    pub fn broken(&self, err: Error) {
        tracing::debug!(waiters = self.waiters(), error = %err, "semaphore broken");
        *self.inner.broken.borrow_mut() = Some(err.clone());
        for waiter in self.inner.waiters.drain() {
            waiter.promise.set_error(err.clone());
        }
    }

    /// Fails every waiter with a [`Broken`](ErrorKind::Broken) error.
    pub fn break_semaphore(&self) {
        self.broken(Error::new(ErrorKind::Broken).with_message("semaphore broken"));
    }

    fn wake(&self) {
        loop {
            let count = self.inner.count.get();
            let ready = self
                .inner
                .waiters
                .with_front(|w| to_isize(w.units) <= count);
            if ready != Some(true) {
                break;
            }
            let Some(waiter) = self.inner.waiters.pop_front() else {
                break;
            };
            self.inner.count.set(count - to_isize(waiter.units));
            waiter.promise.set_value(());
        }
    }

    /// Waits for `units` and wraps them in a guard that returns them when
    /// dropped.
    pub fn get_units(&self, units: usize) -> Future<SemaphoreUnits> {
        let sem = self.clone();
        self.wait(units)
            .map(move |()| SemaphoreUnits { sem, units })
    }

    /// Takes `units` as a guard without waiting, if possible.
    #[must_use]
    pub fn try_get_units(&self, units: usize) -> Option<SemaphoreUnits> {
        self.try_wait(units).then(|| SemaphoreUnits {
            sem: self.clone(),
            units,
        })
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("available", &self.available_units())
            .field("waiters", &self.waiters())
            .field("broken", &self.inner.broken.borrow().is_some())
            .finish()
    }
}

/// Units held from a [`Semaphore`]; returned on drop.
pub struct SemaphoreUnits {
    sem: Semaphore,
    units: usize,
}

impl SemaphoreUnits {
    /// Units still held.
    #[must_use]
    pub fn count(&self) -> usize {
        self.units
    }

    /// Returns `units` of the held units early.
    pub fn return_units(&mut self, units: usize) {
        let units = units.min(self.units);
        self.units -= units;
        self.sem.signal(units);
    }

    /// Moves `units` of the held units into a new guard.
    pub fn split(&mut self, units: usize) -> Self {
        let units = units.min(self.units);
        self.units -= units;
        Self {
            sem: self.sem.clone(),
            units,
        }
    }

    /// Keeps the units taken for good. Returns how many were held.
    pub fn release(mut self) -> usize {
        std::mem::take(&mut self.units)
    }
}

impl Drop for SemaphoreUnits {
    fn drop(&mut self) {
        if self.units > 0 {
            self.sem.signal(self.units);
        }
    }
}

impl fmt::Debug for SemaphoreUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreUnits")
            .field("units", &self.units)
            .finish()
    }
}

/// Runs `func` while holding `units` of `sem`; the units are returned once
/// the future `func` produced resolves.
pub fn with_semaphore<R: 'static>(
    sem: &Semaphore,
    units: usize,
    func: impl FnOnce() -> Future<R> + 'static,
) -> Future<R> {
    sem.get_units(units).then(move |held| {
        guarded(func)
            .unwrap_or_else(Future::failed)
            .finally(move || {
                drop(held);
                Future::ready(())
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, test_reactor};

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn large_request_blocks_smaller_ones_behind_it() {
        init_test("large_request_blocks_smaller_ones_behind_it");
        let sem = Semaphore::new(1);
        let mut big = sem.wait(2);
        let mut small = sem.wait(1);
        assert!(!big.available());
        assert!(!small.available());
        assert_eq!(sem.waiters(), 2);
        sem.signal(1);
        assert!(big.try_take().is_some());
        assert_eq!(sem.waiters(), 1);
        assert!(small.try_take().is_none());
        crate::test_complete!("large_request_blocks_smaller_ones_behind_it");
    }

    #[test]
    fn consume_can_go_negative() {
        let sem = Semaphore::new(1);
        sem.consume(3);
        assert_eq!(sem.available_units(), -2);
        assert!(!sem.try_wait(1));
        sem.signal(3);
        assert!(sem.try_wait(1));
    }

    #[test]
    fn broken_fails_waiters() {
        init_test("broken_fails_waiters");
        let (reactor, _clock) = test_reactor();
        let kinds = reactor
            .block_on(|| {
                let sem = Semaphore::new(0);
                let waiting = sem.wait(1).then_wrapped(|r| Future::ready(r.err().map(|e| e.kind())));
                sem.break_semaphore();
                let later = sem.wait(1).then_wrapped(|r| Future::ready(r.err().map(|e| e.kind())));
                waiting.then(move |a| later.map(move |b| (a, b)))
            })
            .expect("block_on");
        assert_eq!(kinds, (Some(ErrorKind::Broken), Some(ErrorKind::Broken)));
    }

    #[test]
    fn dropping_semaphore_breaks_its_waiters() {
        init_test("dropping_semaphore_breaks_its_waiters");
        let (reactor, _clock) = test_reactor();
        let kinds = reactor
            .block_on(|| {
                let sem = Semaphore::new(0);
                let first = sem.wait(1).then_wrapped(|r| Future::ready(r.err().map(|e| e.kind())));
                let timed = sem
                    .wait_until(2, Time::from_millis(50))
                    .then_wrapped(|r| Future::ready(r.err().map(|e| e.kind())));
                assert_eq!(sem.waiters(), 2);
                drop(sem);
                first.then(move |a| timed.map(move |b| (a, b)))
            })
            .expect("block_on");
        assert_eq!(
            kinds,
            (Some(ErrorKind::BrokenPromise), Some(ErrorKind::BrokenPromise))
        );
        crate::test_complete!("dropping_semaphore_breaks_its_waiters");
    }

    #[test]
    fn units_guard_returns_on_drop() {
        let sem = Semaphore::new(3);
        let mut held = sem.try_get_units(3).expect("units");
        let part = held.split(1);
        assert_eq!(held.count(), 2);
        drop(part);
        assert_eq!(sem.available_units(), 1);
        held.return_units(1);
        assert_eq!(sem.available_units(), 2);
        assert_eq!(held.release(), 1);
        assert_eq!(sem.available_units(), 2);
    }
}
