//! In-flight operation tracker for orderly shutdown.
//!
//! Every operation that touches a resource enters the resource's gate and
//! leaves it when done. Closing the gate refuses new entries and resolves
//! once the last entered operation has left, after which the resource can be
//! torn down.
//!
//! # Example
//!
//! ```ignore
//! use percore::sync::{with_gate, Gate};
//!
//! let gate = Gate::new();
//! with_gate(&gate, || flush_memtable());
//! gate.close().then(|()| drop_memtable())
//! ```

use crate::error::{Error, ErrorKind, Result};
use crate::future::{guarded, Future, Promise};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

#[derive(Default)]
struct Inner {
    count: usize,
    closed: bool,
    on_close: Option<Promise<()>>,
}

/// Counts operations in flight and refuses new ones once closed.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Rc<RefCell<Inner>>,
}

fn gate_closed() -> Error {
    Error::new(ErrorKind::GateClosed).with_message("gate closed")
}

impl Gate {
    /// Creates an open gate with nothing in flight.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one operation. Fails with
    /// [`GateClosed`](ErrorKind::GateClosed) once the gate was closed.
    pub fn enter(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(gate_closed());
        }
        inner.count += 1;
        Ok(())
    }

    /// Like [`enter`](Self::enter), returning false instead of an error.
    #[must_use]
    pub fn try_enter(&self) -> bool {
        self.enter().is_ok()
    }

    /// Unregisters one operation; the last one out completes a pending
    /// [`close`](Self::close).
    pub fn leave(&self) {
        let done = {
            let mut inner = self.inner.borrow_mut();
            if inner.count == 0 {
                tracing::error!("gate left more times than entered");
                return;
            }
            inner.count -= 1;
            if inner.count == 0 && inner.closed {
                inner.on_close.take()
            } else {
                None
            }
        };
        if let Some(promise) = done {
            promise.set_value(());
        }
    }

    /// Closes the gate. The returned future resolves once every operation
    /// in flight has left.
    ///
    /// Closing twice is a usage error: it is logged and the second future
    /// fails with [`InvalidState`](ErrorKind::InvalidState).
    pub fn close(&self) -> Future<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            tracing::error!("gate closed twice");
            return Future::failed(Error::invalid_state("gate already closed"));
        }
        inner.closed = true;
        tracing::trace!(in_flight = inner.count, "closing gate");
        if inner.count == 0 {
            return Future::ready(());
        }
        let mut promise = Promise::new();
        let fut = promise.future();
        inner.on_close = Some(promise);
        fut
    }

    /// Enters the gate and returns a guard that leaves it on drop.
    pub fn hold(&self) -> Result<GateHolder> {
        self.enter()?;
        Ok(GateHolder { gate: self.clone() })
    }

    /// Fails with [`GateClosed`](ErrorKind::GateClosed) if closed.
    ///
    /// Long operations call this between steps to notice a shutdown.
    pub fn check(&self) -> Result<()> {
        if self.is_closed() {
            Err(gate_closed())
        } else {
            Ok(())
        }
    }

    /// True once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Operations in flight.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.borrow().count
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Gate")
            .field("count", &inner.count)
            .field("closed", &inner.closed)
            .finish()
    }
}

/// Keeps one operation registered with a [`Gate`] until dropped.
pub struct GateHolder {
    gate: Gate,
}

impl GateHolder {
    /// The gate held.
    #[must_use]
    pub fn gate(&self) -> &Gate {
        &self.gate
    }
}

impl Drop for GateHolder {
    fn drop(&mut self) {
        self.gate.leave();
    }
}

impl fmt::Debug for GateHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateHolder").finish_non_exhaustive()
    }
}

/// Runs `func` inside `gate`, leaving once its future resolves.
///
/// Fails without calling `func` if the gate is closed.
pub fn with_gate<T: 'static>(gate: &Gate, func: impl FnOnce() -> Future<T>) -> Future<T> {
    let holder = match gate.hold() {
        Ok(holder) => holder,
        Err(err) => return Future::failed(err),
    };
    guarded(func)
        .unwrap_or_else(Future::failed)
        .finally(move || {
            drop(holder);
            Future::ready(())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    #[test]
    fn close_waits_for_holders() {
        init_test_logging();
        crate::test_phase!("close_waits_for_holders");
        let gate = Gate::new();
        let holder = gate.hold().expect("open gate");
        let mut closing = gate.close();
        assert!(!closing.available());
        crate::assert_err_kind!(gate.enter(), ErrorKind::GateClosed);
        drop(holder);
        assert!(matches!(closing.try_take(), Some(Ok(()))));
        crate::test_complete!("close_waits_for_holders");
    }

    #[test]
    fn leave_without_enter_is_ignored() {
        init_test_logging();
        let gate = Gate::new();
        gate.leave();
        assert_eq!(gate.count(), 0);
        assert!(gate.try_enter());
        assert_eq!(gate.count(), 1);
    }

    #[test]
    fn second_close_fails() {
        init_test_logging();
        let gate = Gate::new();
        let mut first = gate.close();
        let mut second = gate.close();
        assert!(matches!(first.try_take(), Some(Ok(()))));
        assert!(matches!(second.try_take(), Some(Err(_))));
    }
}
