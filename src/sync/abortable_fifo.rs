//! FIFO whose entries leave when their abort source fires.

use crate::sync::abort::AbortSource;
use crate::sync::expiring_fifo::{EntryId, ExpiringFifo};
use std::fmt;

/// A FIFO of entries that each may carry an [`AbortSource`].
///
/// An aborted entry is removed without disturbing the others and handed to
/// the `on_abort` callback.
pub struct AbortableFifo<T: 'static> {
    fifo: ExpiringFifo<T>,
}

impl<T: 'static> AbortableFifo<T> {
    /// Creates an empty queue.
    pub fn new(mut on_abort: impl FnMut(T) + 'static) -> Self {
        Self {
            fifo: ExpiringFifo::new(move |item, _| on_abort(item)),
        }
    }

    /// Appends an entry that cannot be aborted.
    pub fn push_back(&self, item: T) -> EntryId {
        self.fifo.push_back(item)
    }

    /// Appends an entry tied to `abort`. Hands the item back if the abort
    /// already happened.
    pub fn push_back_abortable(&self, item: T, abort: &AbortSource) -> Result<EntryId, T> {
        self.fifo.push_back_abortable(item, abort)
    }

    /// Removes and returns the oldest entry.
    pub fn pop_front(&self) -> Option<T> {
        self.fifo.pop_front()
    }

    /// Calls `func` on the oldest entry.
    pub fn with_front<R>(&self, func: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.fifo.with_front(func)
    }

    /// Removes an entry wherever it is.
    pub fn remove(&self, id: EntryId) -> Option<T> {
        self.fifo.remove(id)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    /// True if no entries are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }
}

impl<T> fmt::Debug for AbortableFifo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortableFifo")
            .field("len", &self.fifo.len())
            .finish()
    }
}
