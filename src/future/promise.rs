//! The producer side of a continuation graph edge.

use super::state::{self, SharedState};
use super::Future;
use crate::error::{Error, Result};

/// Write end of a single-outcome channel.
///
/// A promise is resolved exactly once: the resolving methods consume it.
/// Dropping an unresolved promise resolves its future with
/// [`ErrorKind::BrokenPromise`](crate::error::ErrorKind::BrokenPromise).
///
/// # Example
///
/// ```ignore
/// let mut promise = Promise::new();
/// let fut = promise.future();
/// promise.set_value(42);
/// ```
pub struct Promise<T: 'static> {
    state: Option<SharedState<T>>,
    future_taken: bool,
}

impl<T: 'static> Promise<T> {
    /// Creates an unresolved promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Some(state::new_shared()),
            future_taken: false,
        }
    }

    /// Returns the future paired with this promise.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub fn future(&mut self) -> Future<T> {
        assert!(!self.future_taken, "Promise::future called twice");
        self.future_taken = true;
        match &self.state {
            Some(shared) => Future::from_shared(shared.clone()),
            None => Future::failed(Error::invalid_state("promise already resolved")),
        }
    }

    /// Resolves the promise with a value.
    pub fn set_value(self, value: T) {
        self.set_result(Ok(value));
    }

    /// Resolves the promise with an error.
    pub fn set_error(self, error: Error) {
        self.set_result(Err(error));
    }

    /// Resolves the promise with an outcome.
    pub fn set_result(mut self, outcome: Result<T>) {
        if let Some(shared) = self.state.take() {
            state::resolve(&shared, outcome);
        }
    }

    /// Returns true if the paired future has been dropped without being
    /// consumed, so nobody will observe the outcome.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| matches!(&*s.borrow(), state::State::Abandoned))
    }
}

impl<T: 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.state.take() {
            state::resolve(&shared, Err(Error::broken_promise()));
        }
    }
}

impl<T: 'static> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("resolved", &self.state.is_none())
            .field("future_taken", &self.future_taken)
            .finish()
    }
}
