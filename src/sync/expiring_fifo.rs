//! FIFO of waiters that can leave early.
//!
//! Entries are served strictly in insertion order. An entry pushed with a
//! deadline or an [`AbortSource`] is taken out when the deadline passes or
//! the abort fires, and handed to the queue's expiry callback together with
//! the reason. Removing an entry never disturbs the order of the others.

use crate::error::Result;
use crate::sync::abort::AbortSource;
use crate::time::Timer;
use crate::types::Time;
use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Handle of a queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

/// Why an entry left the queue early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Its deadline passed.
    Timeout,
    /// Its abort source fired.
    Aborted,
}

/// Whatever fires the expiry: a [`Timer`] or an
/// [`AbortSubscription`](crate::sync::AbortSubscription).
/// Dropping it disarms the entry.
type Guard = Option<Box<dyn Any>>;

struct Slot<T> {
    item: T,
    guard: Guard,
}

type OnExpiry<T> = Box<dyn FnMut(T, Expiry)>;

struct Inner<T> {
    entries: BTreeMap<u64, Slot<T>>,
    next: u64,
    on_expiry: Option<OnExpiry<T>>,
}

/// A FIFO whose entries may expire.
pub struct ExpiringFifo<T: 'static> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T: 'static> ExpiringFifo<T> {
    /// Creates an empty queue; `on_expiry` receives every entry that leaves
    /// early.
    pub fn new(on_expiry: impl FnMut(T, Expiry) + 'static) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                entries: BTreeMap::new(),
                next: 0,
                on_expiry: Some(Box::new(on_expiry)),
            })),
        }
    }

    fn reserve_id(&self) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next;
        inner.next += 1;
        id
    }

    fn insert(&self, id: u64, item: T, guard: Guard) -> EntryId {
        self.inner.borrow_mut().entries.insert(
            id,
            Slot { item, guard },
        );
        EntryId(id)
    }

    /// Appends an entry that never expires.
    pub fn push_back(&self, item: T) -> EntryId {
        let id = self.reserve_id();
        self.insert(id, item, None)
    }

    /// Appends an entry that expires at `deadline`. [`Time::MAX`] never
    /// expires.
    ///
    /// Fails without queueing if no reactor runs on this thread.
    pub fn push_back_until(&self, item: T, deadline: Time) -> Result<EntryId> {
        if deadline == Time::MAX {
            return Ok(self.push_back(item));
        }
        let id = self.reserve_id();
        let weak = Rc::downgrade(&self.inner);
        let timer = Timer::new(move || expire(&weak, id, Expiry::Timeout));
        timer.arm(deadline)?;
        Ok(self.insert(id, item, Some(Box::new(timer))))
    }

    /// Appends an entry that is removed once `abort` fires.
    ///
    /// Hands the item back if the abort already happened.
    pub fn push_back_abortable(&self, item: T, abort: &AbortSource) -> std::result::Result<EntryId, T> {
        let id = self.reserve_id();
        let weak = Rc::downgrade(&self.inner);
        match abort.subscribe(move || expire(&weak, id, Expiry::Aborted)) {
            Some(subscription) => Ok(self.insert(id, item, Some(Box::new(subscription)))),
            None => Err(item),
        }
    }

    /// Removes and returns the oldest entry.
    pub fn pop_front(&self) -> Option<T> {
        let slot = self.inner.borrow_mut().entries.pop_first();
        slot.map(|(_, slot)| slot.item)
    }

    /// Calls `func` on the oldest entry.
    pub fn with_front<R>(&self, func: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut inner = self.inner.borrow_mut();
        inner
            .entries
            .first_entry()
            .map(|mut entry| func(&mut entry.get_mut().item))
    }

    /// Removes an entry wherever it is.
    pub fn remove(&self, id: EntryId) -> Option<T> {
        let slot = self.inner.borrow_mut().entries.remove(&id.0);
        slot.map(|slot| slot.item)
    }

    /// Removes every entry, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let entries = std::mem::take(&mut self.inner.borrow_mut().entries);
        entries.into_values().map(|slot| slot.item).collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    /// True if no entries are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }
}

fn expire<T: 'static>(weak: &Weak<RefCell<Inner<T>>>, id: u64, reason: Expiry) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let (slot, callback) = {
        let mut guard = inner.borrow_mut();
        let Some(slot) = guard.entries.remove(&id) else {
            return;
        };
        (slot, guard.on_expiry.take())
    };
    let Slot { item, guard: keep } = slot;
    // The guard may be the very timer or subscription running us; keep it
    // alive until the callback returns.
    let Some(mut callback) = callback else {
        tracing::error!(entry = id, "expiry callback re-entered; entry dropped");
        return;
    };
    callback(item, reason);
    drop(keep);
    let mut guard = inner.borrow_mut();
    if guard.on_expiry.is_none() {
        guard.on_expiry = Some(callback);
    }
}

impl<T> fmt::Debug for ExpiringFifo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiringFifo")
            .field("len", &self.inner.borrow().entries.len())
            .finish()
    }
}
