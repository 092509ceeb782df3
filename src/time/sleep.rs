//! Sleeping, deadlines and rearmable timers on the current shard.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::error::Error;
use crate::future::{Future, Promise};
use crate::runtime::local;
use crate::runtime::TimerId;
use crate::types::Time;

/// Resolves once `duration` has elapsed on the shard clock.
pub fn sleep(duration: Duration) -> Future<()> {
    sleep_until(local::now() + duration)
}

/// Resolves once the shard clock reaches `deadline`.
pub fn sleep_until(deadline: Time) -> Future<()> {
    let mut promise = Promise::new();
    let fut = promise.future();
    if let Err(err) = local::add_timer(deadline, Box::new(move || promise.set_value(()))) {
        return Future::failed(err);
    }
    fut
}

/// Fails `fut` with a timeout error if it has not resolved by `deadline`.
///
/// The underlying work is not cancelled: its late outcome is discarded.
pub fn with_timeout<T: 'static>(deadline: Time, fut: Future<T>) -> Future<T> {
    let mut promise = Promise::new();
    let out = promise.future();
    let slot = Rc::new(RefCell::new(Some(promise)));

    let on_timer = Rc::clone(&slot);
    let timer = match local::add_timer(
        deadline,
        Box::new(move || {
            if let Some(promise) = on_timer.borrow_mut().take() {
                promise.set_error(Error::timeout(format!("deadline {deadline} reached")));
            }
        }),
    ) {
        Ok(id) => Some(id),
        Err(err) => {
            tracing::warn!(error = %err, "timeout not armed");
            None
        }
    };

    fut.set_continuation(move |outcome| {
        let promise = slot.borrow_mut().take();
        match promise {
            Some(promise) => {
                if let Some(id) = timer {
                    local::cancel_timer(id);
                }
                promise.set_result(outcome);
            }
            None => {
                if let Err(err) = outcome {
                    tracing::debug!(error = %err, "outcome after timeout discarded");
                }
            }
        }
    });
    out
}

/// A rearmable callback timer bound to the current shard.
///
/// Dropping the timer cancels it.
pub struct Timer {
    callback: Rc<RefCell<Box<dyn FnMut()>>>,
    armed: Rc<RefCell<Option<TimerId>>>,
}

impl Timer {
    /// Creates an unarmed timer.
    pub fn new(callback: impl FnMut() + 'static) -> Self {
        Self {
            callback: Rc::new(RefCell::new(Box::new(callback))),
            armed: Rc::new(RefCell::new(None)),
        }
    }

    /// Arms the timer to fire once at `deadline`, replacing any earlier arm.
    pub fn arm(&self, deadline: Time) -> crate::Result<()> {
        self.arm_inner(deadline, None)
    }

    /// Arms the timer to fire every `period`, starting one period from now.
    pub fn arm_periodic(&self, period: Duration) -> crate::Result<()> {
        self.arm_inner(local::now() + period, Some(period))
    }

    /// Cancels the timer. Returns true if it was armed.
    pub fn cancel(&self) -> bool {
        match self.armed.borrow_mut().take() {
            Some(id) => local::cancel_timer(id),
            None => false,
        }
    }

    /// Returns true if the timer will fire.
    #[must_use]
    pub fn armed(&self) -> bool {
        self.armed.borrow().is_some()
    }

    fn arm_inner(&self, deadline: Time, period: Option<Duration>) -> crate::Result<()> {
        self.cancel();
        let id = schedule_fire(
            Rc::clone(&self.callback),
            Rc::clone(&self.armed),
            deadline,
            period,
        )?;
        *self.armed.borrow_mut() = Some(id);
        Ok(())
    }
}

fn schedule_fire(
    callback: Rc<RefCell<Box<dyn FnMut()>>>,
    armed: Rc<RefCell<Option<TimerId>>>,
    deadline: Time,
    period: Option<Duration>,
) -> crate::Result<TimerId> {
    let armed_for_fire = Rc::clone(&armed);
    local::add_timer(
        deadline,
        Box::new(move || {
            armed_for_fire.borrow_mut().take();
            if let Some(period) = period {
                match schedule_fire(
                    Rc::clone(&callback),
                    Rc::clone(&armed_for_fire),
                    deadline + period,
                    Some(period),
                ) {
                    Ok(next) => *armed_for_fire.borrow_mut() = Some(next),
                    Err(err) => tracing::warn!(error = %err, "periodic timer not rearmed"),
                }
            }
            (callback.borrow_mut())();
        }),
    )
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(id) = self.armed.borrow_mut().take() {
            local::try_cancel_timer(id);
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").field("armed", &self.armed()).finish()
    }
}
