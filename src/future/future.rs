//! The consumer side of a continuation graph edge.

use std::panic::{catch_unwind, AssertUnwindSafe};

use super::state::{self, Continuation, SharedState, State};
use super::Promise;
use crate::error::{Error, Result};

/// Read end of a single-outcome channel.
///
/// A future is either already available (holding a value or an error) or
/// pending on a [`Promise`]. Work is chained with [`then`](Self::then) and
/// friends; each chained function runs as its own task in the scheduling
/// group that was current when it was attached, never inline.
///
/// Futures are shard-local: they are neither `Send` nor `Sync`.
#[must_use = "futures do nothing unless a continuation is attached or they are awaited"]
pub struct Future<T: 'static> {
    inner: Inner<T>,
}

enum Inner<T> {
    Ready(Result<T>),
    Shared(SharedState<T>),
    Consumed,
}

/// Runs `f`, turning a panic into an [`ErrorKind::Panicked`](crate::error::ErrorKind::Panicked) error.
pub(crate) fn guarded<R>(f: impl FnOnce() -> R) -> Result<R> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| Error::panicked(&*payload))
}

impl<T: 'static> Future<T> {
    /// Creates an available future holding `value`.
    pub fn ready(value: T) -> Self {
        Self {
            inner: Inner::Ready(Ok(value)),
        }
    }

    /// Creates an available future holding `error`.
    pub fn failed(error: Error) -> Self {
        Self {
            inner: Inner::Ready(Err(error)),
        }
    }

    /// Creates an available future holding `outcome`.
    pub fn from_result(outcome: Result<T>) -> Self {
        Self {
            inner: Inner::Ready(outcome),
        }
    }

    pub(crate) fn from_shared(shared: SharedState<T>) -> Self {
        Self {
            inner: Inner::Shared(shared),
        }
    }

    /// Returns true if the outcome is available.
    #[must_use]
    pub fn available(&self) -> bool {
        match &self.inner {
            Inner::Ready(_) => true,
            Inner::Shared(shared) => matches!(&*shared.borrow(), State::Ready(_)),
            Inner::Consumed => false,
        }
    }

    /// Returns true if the outcome is available and is an error.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        match &self.inner {
            Inner::Ready(outcome) => outcome.is_err(),
            Inner::Shared(shared) => matches!(&*shared.borrow(), State::Ready(Err(_))),
            Inner::Consumed => false,
        }
    }

    /// Extracts the outcome if it is available.
    ///
    /// Extraction is one-time: afterwards the future is consumed and every
    /// later call returns `None`.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match std::mem::replace(&mut self.inner, Inner::Consumed) {
            Inner::Ready(outcome) => Some(outcome),
            Inner::Shared(shared) => {
                let mut guard = shared.borrow_mut();
                match std::mem::replace(&mut *guard, State::Consumed) {
                    State::Ready(outcome) => Some(outcome),
                    other => {
                        *guard = other;
                        drop(guard);
                        self.inner = Inner::Shared(shared);
                        None
                    }
                }
            }
            Inner::Consumed => None,
        }
    }

    /// Attaches a raw continuation that receives the outcome.
    pub(crate) fn set_continuation(mut self, func: impl FnOnce(Result<T>) + 'static) {
        let cont = Continuation::new(func);
        match std::mem::replace(&mut self.inner, Inner::Consumed) {
            Inner::Ready(outcome) => cont.schedule(outcome),
            Inner::Shared(shared) => state::attach(&shared, cont),
            Inner::Consumed => cont.schedule(Err(Error::invalid_state(
                "future was already consumed",
            ))),
        }
    }

    /// Chains `func` on success; errors skip it and propagate.
    pub fn then<U: 'static, F>(self, func: F) -> Future<U>
    where
        F: FnOnce(T) -> Future<U> + 'static,
    {
        self.then_wrapped(move |outcome| match outcome {
            Ok(value) => func(value),
            Err(err) => Future::failed(err),
        })
    }

    /// Chains a synchronous transformation of the value.
    pub fn map<U: 'static, F>(self, func: F) -> Future<U>
    where
        F: FnOnce(T) -> U + 'static,
    {
        let mut promise = Promise::new();
        let fut = promise.future();
        self.set_continuation(move |outcome| {
            promise.set_result(outcome.and_then(|value| guarded(move || func(value))));
        });
        fut
    }

    /// Chains `func` on the whole outcome, success or error.
    pub fn then_wrapped<U: 'static, F>(self, func: F) -> Future<U>
    where
        F: FnOnce(Result<T>) -> Future<U> + 'static,
    {
        let mut promise = Promise::new();
        let fut = promise.future();
        self.set_continuation(move |outcome| match guarded(move || func(outcome)) {
            Ok(next) => next.forward_to(promise),
            Err(err) => promise.set_error(err),
        });
        fut
    }

    /// Recovers from an error synchronously. Values pass through untouched.
    pub fn handle_error<F>(self, func: F) -> Self
    where
        F: FnOnce(Error) -> Result<T> + 'static,
    {
        let mut promise = Promise::new();
        let fut = promise.future();
        self.set_continuation(move |outcome| {
            promise.set_result(
                outcome.or_else(|err| guarded(move || func(err)).and_then(std::convert::identity)),
            );
        });
        fut
    }

    /// Recovers from an error with another future.
    pub fn or_else<F>(self, func: F) -> Self
    where
        F: FnOnce(Error) -> Self + 'static,
    {
        self.then_wrapped(move |outcome| match outcome {
            Ok(value) => Self::ready(value),
            Err(err) => func(err),
        })
    }

    /// Runs `func` after the outcome is known, then yields the original
    /// outcome.
    ///
    /// If the cleanup future fails its error replaces the original outcome.
    pub fn finally<F>(self, func: F) -> Self
    where
        F: FnOnce() -> Future<()> + 'static,
    {
        self.then_wrapped(move |outcome| {
            let cleanup = guarded(func).unwrap_or_else(Future::failed);
            cleanup.then_wrapped(move |done| match done {
                Ok(()) => Self::from_result(outcome),
                Err(err) => {
                    if let Err(original) = &outcome {
                        tracing::debug!(
                            original = %original,
                            cleanup = %err,
                            "cleanup failure replaced original error"
                        );
                    }
                    Self::failed(err)
                }
            })
        })
    }

    /// Drops the value, keeping only success or failure.
    pub fn discard_result(self) -> Future<()> {
        self.map(|_| ())
    }

    /// Resolves `promise` with this future's outcome once it is known.
    pub fn forward_to(mut self, promise: Promise<T>) {
        match self.try_take() {
            Some(outcome) => promise.set_result(outcome),
            None => self.set_continuation(move |outcome| promise.set_result(outcome)),
        }
    }

    /// Discards the future without the "exceptional future ignored" warning.
    pub fn ignore(mut self) {
        if self.try_take().is_none() && !matches!(self.inner, Inner::Consumed) {
            self.set_continuation(|_| {});
        }
    }
}

impl<T: 'static> Drop for Future<T> {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.inner, Inner::Consumed) {
            Inner::Ready(Err(err)) => state::report_ignored(&err),
            Inner::Shared(shared) => {
                let Ok(mut guard) = shared.try_borrow_mut() else {
                    return;
                };
                let abandoned = match &*guard {
                    State::Pending(attached) => attached.is_empty(),
                    State::Ready(Err(err)) => {
                        state::report_ignored(err);
                        false
                    }
                    _ => false,
                };
                if abandoned {
                    *guard = State::Abandoned;
                }
            }
            _ => {}
        }
    }
}

impl<T: 'static> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match &self.inner {
            Inner::Consumed => "consumed",
            _ if self.is_failed() => "failed",
            _ if self.available() => "ready",
            _ => "pending",
        };
        f.debug_struct("Future").field("status", &status).finish()
    }
}

impl<T: 'static> From<Result<T>> for Future<T> {
    fn from(outcome: Result<T>) -> Self {
        Self::from_result(outcome)
    }
}
