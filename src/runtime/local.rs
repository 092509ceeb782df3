//! Thread-local access to the reactor running on the current shard.
//!
//! Continuations, timers and synchronization primitives reach their shard's
//! reactor through this module instead of carrying a handle around. The
//! reactor installs itself with [`enter`] for as long as it drives work.

use crate::error::{Error, Result};
use crate::runtime::reactor::Core;
use crate::runtime::task::TaskFn;
use crate::runtime::timer::TimerId;
use crate::types::{GroupId, Time};
use std::cell::RefCell;
use std::rc::Rc;

thread_local! {
    /// The reactor driving the current thread.
    static CURRENT: RefCell<Option<Rc<Core>>> = const { RefCell::new(None) };
}

/// Restores the previously current reactor on drop.
pub(crate) struct EnterGuard {
    prev: Option<Rc<Core>>,
}

/// Makes `core` the current reactor of this thread.
pub(crate) fn enter(core: Rc<Core>) -> EnterGuard {
    let prev = CURRENT.with(|c| c.borrow_mut().replace(core));
    EnterGuard { prev }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        let _ = CURRENT.try_with(|c| *c.borrow_mut() = prev);
    }
}

/// Returns the current reactor, if any.
pub(crate) fn current() -> Option<Rc<Core>> {
    CURRENT.try_with(|c| c.borrow().clone()).ok().flatten()
}

/// Returns the current reactor or an invalid-state error.
pub(crate) fn require() -> Result<Rc<Core>> {
    current().ok_or_else(|| Error::invalid_state("no reactor is running on this thread"))
}

/// Returns the current reactor.
///
/// # Panics
///
/// Panics if no reactor is running on this thread.
pub(crate) fn expect_current() -> Rc<Core> {
    current().unwrap_or_else(|| panic!("no reactor is running on this thread"))
}

/// Schedules `func` in `group`, handing it back if no reactor is running.
pub(crate) fn try_schedule_in(group: GroupId, func: TaskFn) -> std::result::Result<(), TaskFn> {
    match current() {
        Some(core) => {
            core.schedule(group, func);
            Ok(())
        }
        None => Err(func),
    }
}

/// The current scheduling group, or the default group outside a reactor.
pub(crate) fn current_group_or_default() -> GroupId {
    current().map_or(GroupId::DEFAULT, |core| core.current_group())
}

/// The shard clock.
///
/// # Panics
///
/// Panics if no reactor is running on this thread.
pub(crate) fn now() -> Time {
    expect_current().now()
}

/// Arms a timer whose callback runs as a task in the current group.
pub(crate) fn add_timer(deadline: Time, callback: Box<dyn FnOnce()>) -> Result<TimerId> {
    Ok(require()?.add_timer(deadline, callback))
}

/// Cancels a timer. Returns true if it was still armed.
pub(crate) fn cancel_timer(id: TimerId) -> bool {
    current().is_some_and(|core| core.cancel_timer(id))
}

/// Cancels a timer if a reactor is still around; used from `Drop`.
pub(crate) fn try_cancel_timer(id: TimerId) {
    if let Some(core) = current() {
        core.cancel_timer(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outside_a_reactor() {
        assert!(current().is_none());
        assert!(require().is_err());
        assert_eq!(current_group_or_default(), GroupId::DEFAULT);
        let rejected = try_schedule_in(GroupId::DEFAULT, Box::new(|| {}));
        assert!(rejected.is_err());
        assert!(add_timer(Time::ZERO, Box::new(|| {})).is_err());
        assert!(!cancel_timer(TimerId::for_test(1)));
    }
}
