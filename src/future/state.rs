//! Shared state between a [`Promise`](super::Promise) and its
//! [`Future`](super::Future).
//!
//! The state is a small machine:
//!
//! ```text
//! Pending(empty) ──attach──▶ Pending(cont) ──resolve──▶ Consumed (cont scheduled)
//!      │                                                        ▲
//!      └──resolve──▶ Ready(outcome) ──attach / take──────────────┘
//!      └──future dropped──▶ Abandoned ──resolve──▶ (outcome discarded)
//! ```
//!
//! Only the owning shard ever touches the state, so it lives in an
//! `Rc<RefCell<_>>` and is never shared across threads.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::runtime::local;
use crate::types::GroupId;

/// A continuation waiting for an outcome.
pub(crate) struct Continuation<T> {
    /// Group that was current when the continuation was attached.
    pub(crate) group: GroupId,
    pub(crate) func: Box<dyn FnOnce(Result<T>)>,
}

impl<T: 'static> Continuation<T> {
    /// Captures the current scheduling group.
    pub(crate) fn new(func: impl FnOnce(Result<T>) + 'static) -> Self {
        Self {
            group: local::current_group_or_default(),
            func: Box::new(func),
        }
    }

    /// Schedules the continuation with its outcome as a task.
    ///
    /// The continuation is never called inline.
    pub(crate) fn schedule(self, outcome: Result<T>) {
        let Self { group, func } = self;
        if let Err(dropped) = local::try_schedule_in(group, Box::new(move || func(outcome))) {
            tracing::warn!(
                group = %group,
                "continuation dropped: no reactor is running on this thread"
            );
            drop(dropped);
        }
    }
}

/// The continuation slot of a pending future.
///
/// Destroying the slot while it still holds a continuation is reported:
/// that continuation will never run.
pub(crate) struct Attached<T>(Option<Continuation<T>>);

impl<T> Attached<T> {
    pub(crate) const fn empty() -> Self {
        Self(None)
    }

    pub(crate) const fn holding(cont: Continuation<T>) -> Self {
        Self(Some(cont))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub(crate) fn take(&mut self) -> Option<Continuation<T>> {
        self.0.take()
    }
}

impl<T> Drop for Attached<T> {
    fn drop(&mut self) {
        if let Some(cont) = self.0.take() {
            tracing::error!(
                group = %cont.group,
                "future state destroyed while a continuation was still attached"
            );
        }
    }
}

pub(crate) enum State<T> {
    Pending(Attached<T>),
    Ready(Result<T>),
    Consumed,
    Abandoned,
}

pub(crate) type SharedState<T> = Rc<RefCell<State<T>>>;

pub(crate) fn new_shared<T>() -> SharedState<T> {
    Rc::new(RefCell::new(State::Pending(Attached::empty())))
}

/// Stores an outcome, or hands it to the attached continuation.
pub(crate) fn resolve<T: 'static>(state: &SharedState<T>, outcome: Result<T>) {
    let mut guard = state.borrow_mut();
    let previous = std::mem::replace(&mut *guard, State::Consumed);
    match previous {
        State::Pending(mut attached) => match attached.take() {
            Some(cont) => {
                drop(guard);
                cont.schedule(outcome);
            }
            None => *guard = State::Ready(outcome),
        },
        State::Abandoned => {
            *guard = State::Abandoned;
            drop(guard);
            if let Err(err) = outcome {
                report_ignored(&err);
            }
        }
        previous @ (State::Ready(_) | State::Consumed) => {
            *guard = previous;
            drop(guard);
            tracing::error!("promise resolved twice; second outcome discarded");
        }
    }
}

/// Attaches a continuation, scheduling it immediately if the outcome exists.
pub(crate) fn attach<T: 'static>(state: &SharedState<T>, cont: Continuation<T>) {
    let mut guard = state.borrow_mut();
    let previous = std::mem::replace(&mut *guard, State::Consumed);
    match previous {
        State::Pending(attached) if attached.is_empty() => {
            *guard = State::Pending(Attached::holding(cont));
        }
        State::Ready(outcome) => {
            drop(guard);
            cont.schedule(outcome);
        }
        previous => {
            *guard = previous;
            drop(guard);
            tracing::error!("continuation attached to a consumed future");
            cont.schedule(Err(Error::invalid_state(
                "future was already consumed or awaited",
            )));
        }
    }
}

pub(crate) fn report_ignored(err: &Error) {
    tracing::warn!(error = %err, "exceptional future ignored");
}
