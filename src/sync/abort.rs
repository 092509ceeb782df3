//! Cooperative cancellation.
//!
//! An [`AbortSource`] is a shard-local flag plus a list of subscribers.
//! Requesting an abort calls every subscriber once, synchronously, in
//! subscription order. A subscription unsubscribes itself when dropped.

use crate::error::Error;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

type Callback = Box<dyn FnOnce()>;

#[derive(Default)]
struct Inner {
    aborted: bool,
    next: u64,
    subscribers: BTreeMap<u64, Callback>,
}

/// Source of abort requests.
#[derive(Clone, Default)]
pub struct AbortSource {
    inner: Rc<RefCell<Inner>>,
}

impl AbortSource {
    /// Creates a source that has not been aborted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls `callback` once an abort is requested.
    ///
    /// Returns `None`, without calling anything, if the abort already
    /// happened.
    #[must_use]
    pub fn subscribe(&self, callback: impl FnOnce() + 'static) -> Option<AbortSubscription> {
        let mut inner = self.inner.borrow_mut();
        if inner.aborted {
            return None;
        }
        let id = inner.next;
        inner.next += 1;
        inner.subscribers.insert(id, Box::new(callback));
        Some(AbortSubscription {
            source: Rc::downgrade(&self.inner),
            id,
        })
    }

    /// Aborts and notifies every subscriber. Later calls do nothing.
    pub fn request_abort(&self) {
        let subscribers = {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted {
                return;
            }
            inner.aborted = true;
            std::mem::take(&mut inner.subscribers)
        };
        tracing::debug!(subscribers = subscribers.len(), "abort requested");
        for (_, callback) in subscribers {
            callback();
        }
    }

    /// True once an abort was requested.
    #[must_use]
    pub fn abort_requested(&self) -> bool {
        self.inner.borrow().aborted
    }

    /// Fails with an aborted error once an abort was requested.
    pub fn check(&self) -> crate::error::Result<()> {
        if self.abort_requested() {
            Err(Error::aborted("abort requested"))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for AbortSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("AbortSource")
            .field("aborted", &inner.aborted)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

/// Keeps a subscriber registered; dropping it unsubscribes.
pub struct AbortSubscription {
    source: Weak<RefCell<Inner>>,
    id: u64,
}

impl Drop for AbortSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.source.upgrade() {
            if let Ok(mut inner) = inner.try_borrow_mut() {
                inner.subscribers.remove(&self.id);
            }
        }
    }
}

impl fmt::Debug for AbortSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSubscription")
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn subscribers_run_once_in_order() {
        let source = AbortSource::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let subs: Vec<_> = (0..3)
            .map(|n| {
                let log = Rc::clone(&log);
                source.subscribe(move || log.borrow_mut().push(n))
            })
            .collect();
        source.request_abort();
        source.request_abort();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert!(source.check().is_err());
        drop(subs);
    }

    #[test]
    fn dropped_subscription_is_not_called() {
        let source = AbortSource::new();
        let hit = Rc::new(Cell::new(false));
        let hit2 = Rc::clone(&hit);
        let sub = source.subscribe(move || hit2.set(true));
        drop(sub);
        source.request_abort();
        assert!(!hit.get());
    }

    #[test]
    fn late_subscribe_is_refused() {
        let source = AbortSource::new();
        source.request_abort();
        assert!(source.subscribe(|| {}).is_none());
    }
}
