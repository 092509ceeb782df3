//! Timer heap for deadline management.
//!
//! A min-heap of deadlines plus a side table of callbacks. Cancelling a
//! timer only removes its callback; the stale heap entry is skipped lazily
//! when it reaches the top.

use crate::types::{GroupId, Time};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

/// Handle of an armed timer on the current shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    #[cfg(test)]
    pub(crate) const fn for_test(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct TimerEntry {
    deadline: Time,
    id: TimerId,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct Expired {
    pub(crate) group: GroupId,
    pub(crate) callback: Box<dyn FnOnce()>,
}

/// A min-heap of timers ordered by deadline, then arming order.
#[derive(Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    callbacks: HashMap<TimerId, Expired>,
    next_id: u64,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of live (not cancelled) timers.
    pub(crate) fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub(crate) fn insert(
        &mut self,
        deadline: Time,
        group: GroupId,
        callback: Box<dyn FnOnce()>,
    ) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(TimerEntry { deadline, id });
        self.callbacks.insert(id, Expired { group, callback });
        id
    }

    /// Returns true if the timer was still armed.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        self.callbacks.remove(&id).is_some()
    }

    /// Returns the earliest live deadline, if any.
    pub(crate) fn peek_deadline(&mut self) -> Option<Time> {
        while let Some(entry) = self.heap.peek() {
            if self.callbacks.contains_key(&entry.id) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops all timers that have expired (deadline <= now), earliest first.
    pub(crate) fn pop_expired(&mut self, now: Time) -> Vec<Expired> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let id = entry.id;
            self.heap.pop();
            if let Some(cb) = self.callbacks.remove(&id) {
                expired.push(cb);
            }
        }
        expired
    }
}

impl fmt::Debug for TimerHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHeap")
            .field("armed", &self.callbacks.len())
            .field("heap_entries", &self.heap.len())
            .finish()
    }
}
